//! Latest value of every parameter, for dashboards.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rtugate_common::StatusCode;
use serde::Serialize;

use crate::config::{GatewayConfig, ParamKey, RegisterType};

/// Latest published state of one parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentValue {
    pub object: String,
    pub topic: String,
    pub register_type: RegisterType,
    pub address: u16,
    pub value: Option<String>,
    pub status: StatusCode,
    pub message: String,
    pub silent_for_s: u64,
    pub alarm: Option<String>,
    /// Unix epoch milliseconds; `None` until the parameter first reports.
    pub timestamp: Option<i64>,
}

impl CurrentValue {
    /// Entry for a configured parameter that has not reported yet.
    pub fn pending(
        object: impl Into<String>,
        topic: impl Into<String>,
        register_type: RegisterType,
        address: u16,
    ) -> Self {
        Self {
            object: object.into(),
            topic: topic.into(),
            register_type,
            address,
            value: None,
            status: StatusCode::Ok,
            message: String::new(),
            silent_for_s: 0,
            alarm: None,
            timestamp: None,
        }
    }
}

/// Shared latest-value map.
///
/// Cloning the cache clones the handle, not the data.
#[derive(Debug, Clone, Default)]
pub struct CurrentStateCache {
    inner: Arc<RwLock<HashMap<ParamKey, CurrentValue>>>,
}

impl CurrentStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, key: ParamKey, value: CurrentValue) {
        self.inner.write().insert(key, value);
    }

    pub fn get(&self, key: &ParamKey) -> Option<CurrentValue> {
        self.inner.read().get(key).cloned()
    }

    /// Copy of all entries, sorted by line, unit and parameter.
    pub fn snapshot(&self) -> Vec<(ParamKey, CurrentValue)> {
        let mut entries: Vec<_> = self
            .inner
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Make the cache list exactly the parameters of `config`.
    ///
    /// Known parameters keep their last reported state with object, topic and
    /// address refreshed; new ones get a [`CurrentValue::pending`] entry.
    /// `resolve` turns a configured topic into an absolute one. Returns the
    /// number of entries dropped.
    pub fn reset_from(&self, config: &GatewayConfig, resolve: impl Fn(&str) -> String) -> usize {
        let normalize = config.addressing.normalize;
        let mut map = self.inner.write();
        let mut next = HashMap::with_capacity(map.len());

        for line in &config.lines {
            for node in &line.nodes {
                for param in &node.params {
                    let key = ParamKey::new(&line.name, node.unit_id, &param.name);
                    let topic = resolve(&param.topic_for(&node.object));
                    let address = u16::try_from(param.effective_address(normalize)).unwrap_or_default();

                    let entry = match map.remove(&key) {
                        Some(mut known) => {
                            known.object = node.object.clone();
                            known.topic = topic;
                            known.register_type = param.register_type;
                            known.address = address;
                            known
                        }
                        None => CurrentValue::pending(&node.object, topic, param.register_type, address),
                    };
                    next.insert(key, entry);
                }
            }
        }

        let dropped = map.len();
        *map = next;
        dropped
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtugate_bridge_framework::BridgeConfig;
    use rtugate_common::TopicResolver;

    fn value(v: &str) -> CurrentValue {
        CurrentValue {
            object: "boiler".to_string(),
            topic: "/devices/boiler/temp".to_string(),
            register_type: RegisterType::Holding,
            address: 10,
            value: Some(v.to_string()),
            status: StatusCode::Ok,
            message: "OK".to_string(),
            silent_for_s: 0,
            alarm: None,
            timestamp: Some(0),
        }
    }

    #[test]
    fn test_latest_write_wins() {
        let cache = CurrentStateCache::new();
        let key = ParamKey::new("line1", 1, "temp");

        cache.update(key.clone(), value("1"));
        cache.update(key.clone(), value("2"));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&key).unwrap().value.as_deref(), Some("2"));
    }

    #[test]
    fn test_snapshot_sorted_and_detached() {
        let cache = CurrentStateCache::new();
        cache.update(ParamKey::new("line2", 1, "a"), value("1"));
        cache.update(ParamKey::new("line1", 2, "b"), value("2"));
        cache.update(ParamKey::new("line1", 1, "c"), value("3"));

        let snapshot = cache.snapshot();
        cache.update(ParamKey::new("line1", 1, "c"), value("9"));

        let keys: Vec<_> = snapshot.iter().map(|(k, _)| k.param.as_str()).collect();
        assert_eq!(keys, vec!["c", "b", "a"]);
        assert_eq!(snapshot[0].1.value.as_deref(), Some("3"));
    }

    fn config(params: &str) -> GatewayConfig {
        GatewayConfig::from_json5(&format!(
            r#"{{
                db: {{ url: "sqlite::memory:" }},
                lines: [{{
                    name: "line1",
                    device: "/dev/ttyUSB0",
                    nodes: [{{ unit_id: 1, object: "boiler", params: [{params}] }}],
                }}],
            }}"#
        ))
        .unwrap()
    }

    fn resolve(topic: &str) -> String {
        TopicResolver::default().resolve(topic)
    }

    #[test]
    fn test_reset_lists_every_configured_param() {
        let cache = CurrentStateCache::new();
        let config = config(
            r#"{ name: "temp", register_type: "holding", address: 40011 },
               { name: "run", register_type: "coil", address: 1 }"#,
        );

        assert_eq!(cache.reset_from(&config, resolve), 0);

        let snapshot = cache.snapshot();
        assert_eq!(snapshot.len(), 2);
        let (key, run) = &snapshot[0];
        assert_eq!(key.param, "run");
        assert_eq!(run.value, None);
        assert_eq!(run.timestamp, None);
        assert_eq!(run.address, 0);
        assert_eq!(run.topic, "/devices/boiler/controls/run");
        assert_eq!(snapshot[1].1.address, 10);
    }

    #[test]
    fn test_reset_keeps_known_state_and_drops_removed() {
        let cache = CurrentStateCache::new();
        let temp = ParamKey::new("line1", 1, "temp");
        cache.update(temp.clone(), value("21.5"));
        cache.update(ParamKey::new("line9", 1, "gone"), value("1"));

        let config = config(r#"{ name: "temp", register_type: "input", address: 5, topic: "/plant/temp" }"#);
        let dropped = cache.reset_from(&config, resolve);

        assert_eq!(dropped, 1);
        assert_eq!(cache.len(), 1);
        let kept = cache.get(&temp).unwrap();
        assert_eq!(kept.value.as_deref(), Some("21.5"));
        assert_eq!(kept.timestamp, Some(0));
        assert_eq!(kept.register_type, RegisterType::Input);
        assert_eq!(kept.address, 5);
        assert_eq!(kept.topic, "/plant/temp");
    }
}

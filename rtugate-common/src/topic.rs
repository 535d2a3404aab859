use crate::error::{Error, Result};

/// Default base topic for relative parameter topics.
pub const DEFAULT_BASE_TOPIC: &str = "/devices";

/// Resolves configured parameter topics against the broker base topic.
///
/// Topics starting with `/` are absolute and used verbatim; anything else is
/// published below the base topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicResolver {
    base: String,
}

impl TopicResolver {
    /// Create a resolver for a base topic (normalized, see [`normalize_base_topic`]).
    pub fn new(base_topic: &str) -> Self {
        Self {
            base: normalize_base_topic(base_topic),
        }
    }

    /// The normalized base topic.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Resolve a relative or absolute topic.
    ///
    /// # Example
    /// ```
    /// use rtugate_common::topic::TopicResolver;
    ///
    /// let resolver = TopicResolver::new("/devices");
    /// assert_eq!(resolver.resolve("temp"), "/devices/temp");
    /// assert_eq!(resolver.resolve("/abs/topic"), "/abs/topic");
    /// ```
    pub fn resolve(&self, topic: &str) -> String {
        if topic.starts_with('/') {
            topic.to_string()
        } else {
            format!("{}/{}", self.base, topic)
        }
    }

    /// Topic for bridge status messages.
    ///
    /// # Example
    /// ```
    /// use rtugate_common::topic::TopicResolver;
    ///
    /// assert_eq!(TopicResolver::new("/devices").status_topic(), "/devices/@/status");
    /// ```
    pub fn status_topic(&self) -> String {
        format!("{}/@/status", self.base)
    }
}

impl Default for TopicResolver {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_TOPIC)
    }
}

/// Give a base topic a leading `/` and strip trailing ones.
///
/// An empty base normalizes to [`DEFAULT_BASE_TOPIC`].
pub fn normalize_base_topic(base: &str) -> String {
    let trimmed = base.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        DEFAULT_BASE_TOPIC.to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Topic used for a parameter without an explicit one: `<object>/controls/<param>`.
pub fn default_param_topic(object: &str, param: &str) -> String {
    format!("{}/controls/{}", object, param)
}

/// Check that a topic can be published to.
pub fn validate_publish_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(Error::Topic("topic must not be empty".to_string()));
    }
    if topic.contains(['+', '#']) {
        return Err(Error::Topic(format!(
            "'{}' contains MQTT wildcards",
            topic
        )));
    }
    if topic.contains('\0') {
        return Err(Error::Topic(format!("'{}' contains a NUL character", topic)));
    }
    Ok(())
}

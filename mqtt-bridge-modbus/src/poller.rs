//! Batched reads of one node.

use rtugate_common::StatusCode;

use crate::batch::{ReadRequest, plan_reads};
use crate::config::{BatchConfig, NodeConfig, RegisterType};
use crate::transport::{RegisterReader, TransactionError};

/// Outcome of reading one parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadResult {
    pub raw: Option<u16>,
    /// `raw / scale`, or the bit value for coils and discrete inputs.
    pub value: Option<f64>,
    pub status: StatusCode,
    pub message: String,
}

impl ReadResult {
    fn ok(raw: u16, scale: f64, register_type: RegisterType) -> Self {
        let value = if register_type.is_bit() {
            f64::from(u16::from(raw != 0))
        } else {
            f64::from(raw) / scale
        };
        Self {
            raw: Some(raw),
            value: Some(value),
            status: StatusCode::Ok,
            message: StatusCode::Ok.as_str().to_string(),
        }
    }

    fn failed(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            raw: None,
            value: None,
            status,
            message: message.into(),
        }
    }

    fn from_error(err: &TransactionError) -> Self {
        Self::failed(err.status(), err.to_string())
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }
}

/// Results of one poll of a node.
#[derive(Debug, Clone)]
pub struct NodeOutcome {
    /// One result per configured parameter, in parameter order.
    pub results: Vec<ReadResult>,
    /// At least one request succeeded.
    pub any_success: bool,
    /// The port broke during the poll; the rest of the cycle was not attempted.
    pub port_error: Option<TransactionError>,
}

/// Read plan of one node.
#[derive(Debug, Clone)]
pub struct NodePoller {
    unit_id: u8,
    register_types: Vec<RegisterType>,
    addresses: Vec<Option<u16>>,
    scales: Vec<f64>,
    requests: Vec<ReadRequest>,
}

impl NodePoller {
    pub fn new(node: &NodeConfig, batch: &BatchConfig, normalize: bool) -> Self {
        let addresses: Vec<Option<u16>> = node
            .params
            .iter()
            .map(|p| u16::try_from(p.effective_address(normalize)).ok())
            .collect();

        // Parameters with an unusable address stay out of the plan.
        let mut index_map = Vec::new();
        let mut items = Vec::new();
        for (i, p) in node.params.iter().enumerate() {
            if let Some(address) = addresses[i] {
                index_map.push(i);
                items.push((p.register_type, address));
            }
        }

        let mut requests = plan_reads(&items, batch);
        for req in &mut requests {
            for idx in &mut req.params {
                *idx = index_map[*idx];
            }
        }

        Self {
            unit_id: node.unit_id,
            register_types: node.params.iter().map(|p| p.register_type).collect(),
            addresses,
            scales: node.params.iter().map(|p| p.scale).collect(),
            requests,
        }
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    pub fn requests(&self) -> &[ReadRequest] {
        &self.requests
    }

    /// Wire address of a parameter, if it has one.
    pub fn address(&self, param: usize) -> Option<u16> {
        self.addresses.get(param).copied().flatten()
    }

    /// Execute the plan over `reader`.
    pub async fn poll(&self, reader: &mut dyn RegisterReader) -> NodeOutcome {
        let mut results: Vec<Option<ReadResult>> = vec![None; self.scales.len()];
        let mut any_success = false;
        let mut port_error: Option<TransactionError> = None;

        for (i, address) in self.addresses.iter().enumerate() {
            if address.is_none() {
                results[i] = Some(ReadResult::failed(
                    StatusCode::ConfigError,
                    "address out of range",
                ));
            }
        }

        for req in &self.requests {
            if let Some(ref err) = port_error {
                for &i in &req.params {
                    results[i] = Some(ReadResult::from_error(err));
                }
                continue;
            }

            match reader
                .read(self.unit_id, req.register_type, req.start, req.count)
                .await
            {
                Ok(words) => {
                    any_success = true;
                    for &i in &req.params {
                        let raw = self.addresses[i]
                            .map(|a| usize::from(a - req.start))
                            .and_then(|offset| words.get(offset).copied());
                        results[i] = Some(match raw {
                            Some(raw) => ReadResult::ok(raw, self.scales[i], self.register_types[i]),
                            None => ReadResult::failed(
                                StatusCode::CrcError,
                                format!(
                                    "short response: {} of {} values",
                                    words.len(),
                                    req.count
                                ),
                            ),
                        });
                    }
                }
                Err(err) => {
                    for &i in &req.params {
                        results[i] = Some(ReadResult::from_error(&err));
                    }
                    if err.is_port_failure() {
                        port_error = Some(err);
                    }
                }
            }
        }

        NodeOutcome {
            results: results
                .into_iter()
                .map(|r| r.unwrap_or_else(|| ReadResult::failed(StatusCode::UnknownError, "not read")))
                .collect(),
            any_success,
            port_error,
        }
    }
}

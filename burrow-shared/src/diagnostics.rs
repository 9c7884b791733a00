use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// How the primary action failed.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// The action returned an error.
    Error,
    /// The action panicked and the panic was caught at the supervision boundary.
    Panic,
}

/// Payload forwarded to the remote diagnostics collector.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FaultReport {
    pub release: String,
    pub kind: FaultKind,
    pub message: String,
    /// Source chain of the error, outermost first, excluding `message`.
    #[serde(default)]
    pub causes: Vec<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub timestamp: u64,
}

impl FaultReport {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

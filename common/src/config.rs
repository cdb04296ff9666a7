use serde::{Deserialize, Serialize};

/// Per-build endpoints, fixed the same way the TLS trust anchor is. The host
/// shell overrides these from the environment; the device shell bakes them in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeConfig {
    pub collector_host: String,
    pub ntp_server: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            collector_host: "collector.example.net".to_string(),
            ntp_server: "pool.ntp.org".to_string(),
        }
    }
}

//! Bulk aggregator configuration

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BulkConfig {
    /// Max status messages kept per bulk operation
    #[serde(default = "default_message_log_limit")]
    pub message_log_limit: usize,

    /// Write aggregates to the store's blob table
    #[serde(default = "default_persist")]
    pub persist: bool,
}

fn default_message_log_limit() -> usize {
    100
}

fn default_persist() -> bool {
    true
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            message_log_limit: default_message_log_limit(),
            persist: default_persist(),
        }
    }
}

//! Bulk operation snapshots in the store's blob table

use std::sync::Arc;

use eyre::Context;
use queuestore::BlobStore;
use tracing::{debug, warn};

use super::types::BulkOperation;

/// Blob namespace holding one JSON document per bulk operation
pub const BULK_NAMESPACE: &str = "bulk_operations";

/// Reads and writes bulk operations as JSON blobs
#[derive(Clone)]
pub struct BulkPersistence {
    blobs: Arc<dyn BlobStore>,
}

impl BulkPersistence {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    pub fn save(&self, bulk: &BulkOperation) -> eyre::Result<()> {
        let data = serde_json::to_vec(bulk).context("Failed to serialize bulk operation")?;
        self.blobs
            .put_blob(BULK_NAMESPACE, &bulk.id, &data)
            .context(format!("Failed to persist bulk operation {}", bulk.id))?;
        Ok(())
    }

    pub fn delete(&self, bulk_id: &str) -> eyre::Result<bool> {
        Ok(self.blobs.delete_blob(BULK_NAMESPACE, bulk_id)?)
    }

    /// Every stored bulk operation; undecodable documents are skipped
    pub fn load_all(&self) -> eyre::Result<Vec<BulkOperation>> {
        let rows = self
            .blobs
            .list_blobs(BULK_NAMESPACE)
            .context("Failed to list persisted bulk operations")?;

        let mut bulks = Vec::with_capacity(rows.len());
        for (key, data) in rows {
            match serde_json::from_slice::<BulkOperation>(&data) {
                Ok(bulk) => bulks.push(bulk),
                Err(e) => warn!(bulk_id = %key, error = %e, "Skipping unreadable bulk operation"),
            }
        }
        debug!(count = bulks.len(), "BulkPersistence::load_all: loaded");
        Ok(bulks)
    }
}

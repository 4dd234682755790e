/// Checkpoint Module
///
/// Per-source extraction cursors. Dimension sources track the latest
/// modification timestamp they have loaded; the sales source tracks the
/// highest sales line id below which every line is settled.
use crate::error::Result;
use crate::models::{Checkpoint, CheckpointUpdate};
use crate::store::WarehouseStore;
use chrono::{DateTime, Utc};

/// Checkpoint key of the fact source
pub const SALES_SOURCE: &str = "sales";

/// Timestamp reported for a source that has never been checkpointed
pub const BEGINNING_OF_TIME: DateTime<Utc> = DateTime::UNIX_EPOCH;

/// Build a checkpoint advance to hand to the store alongside a stage's writes
pub fn prepare(source_name: &str, last_id: Option<i64>, last_timestamp: DateTime<Utc>) -> CheckpointUpdate {
    CheckpointUpdate { source_name: source_name.to_string(), last_id, last_timestamp }
}

pub struct CheckpointStore<'a, S> {
    store: &'a S,
}

impl<'a, S: WarehouseStore> CheckpointStore<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Last extracted timestamp for `source_name`.
    ///
    /// Falls back to `BEGINNING_OF_TIME` when the source has no checkpoint or
    /// it cannot be read; a full rescan is always safe because loads are idempotent.
    pub async fn get(&self, source_name: &str) -> DateTime<Utc> {
        self.fetch(source_name).await.map(|c| c.last_extracted_timestamp).unwrap_or(BEGINNING_OF_TIME)
    }

    /// Last extracted id for `source_name`, 0 when unknown
    pub async fn last_id(&self, source_name: &str) -> i64 {
        self.recorded_id(source_name).await.unwrap_or(0)
    }

    /// Last extracted id for `source_name`, `None` if no run has recorded one
    pub async fn recorded_id(&self, source_name: &str) -> Option<i64> {
        self.fetch(source_name).await.and_then(|c| c.last_extracted_id)
    }

    /// Upsert the checkpoint on its own.
    ///
    /// Only call this after the load it describes has committed. Pipeline stages
    /// pass the update from `prepare` to the store together with their writes instead.
    #[allow(dead_code)]
    pub async fn update(&self, source_name: &str, last_id: Option<i64>, last_timestamp: DateTime<Utc>) -> Result<()> {
        self.store.upsert_checkpoint(&prepare(source_name, last_id, last_timestamp)).await?;
        tracing::debug!("Checkpoint for {} advanced to {}", source_name, last_timestamp);
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<Checkpoint>> {
        self.store.list_checkpoints().await
    }

    async fn fetch(&self, source_name: &str) -> Option<Checkpoint> {
        match self.store.checkpoint(source_name).await {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                tracing::warn!("Could not read checkpoint for {}, rescanning from the beginning: {}", source_name, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use chrono::Duration;

    #[tokio::test]
    async fn test_missing_checkpoint_returns_sentinel() {
        let store = MemoryStore::new();
        let checkpoints = CheckpointStore::new(&store);

        assert_eq!(checkpoints.get("customers").await, BEGINNING_OF_TIME);
        assert_eq!(checkpoints.last_id(SALES_SOURCE).await, 0);
        assert_eq!(checkpoints.recorded_id(SALES_SOURCE).await, None);
    }

    #[tokio::test]
    async fn test_update_then_get() {
        let store = MemoryStore::new();
        let checkpoints = CheckpointStore::new(&store);
        let ts = Utc::now();

        checkpoints.update(SALES_SOURCE, Some(42), ts).await.unwrap();

        assert_eq!(checkpoints.get(SALES_SOURCE).await, ts);
        assert_eq!(checkpoints.last_id(SALES_SOURCE).await, 42);
        assert_eq!(checkpoints.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_checkpoint_never_moves_backwards() {
        let store = MemoryStore::new();
        let checkpoints = CheckpointStore::new(&store);
        let ts = Utc::now();

        checkpoints.update(SALES_SOURCE, Some(42), ts).await.unwrap();
        checkpoints.update(SALES_SOURCE, Some(10), ts - Duration::hours(1)).await.unwrap();

        assert_eq!(checkpoints.get(SALES_SOURCE).await, ts);
        assert_eq!(checkpoints.last_id(SALES_SOURCE).await, 42);
    }

    #[tokio::test]
    async fn test_read_failure_falls_back_to_sentinel() {
        let store = MemoryStore::new();
        let checkpoints = CheckpointStore::new(&store);
        checkpoints.update("customers", None, Utc::now()).await.unwrap();

        store.set_unavailable(true);
        assert_eq!(checkpoints.get("customers").await, BEGINNING_OF_TIME);
    }
}

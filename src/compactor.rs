use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::store::{MemoryStore, StorageError};

/// Compact the log if at least `threshold` appends happened since the last
/// compaction. Returns whether it compacted.
pub async fn compact_if_needed(store: &MemoryStore, threshold: u64) -> Result<bool, StorageError> {
    let appends = store.appends_since_compact().await;
    if threshold == 0 || appends < threshold {
        return Ok(false);
    }
    store.compact().await?;
    info!(appends, "write-ahead log compacted");
    Ok(true)
}

/// Background task: check the log every `every` and compact when due.
/// A threshold of zero disables compaction.
pub async fn run_compactor(store: Arc<MemoryStore>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&store, threshold).await {
            warn!("compaction failed: {e}");
        }
    }
}

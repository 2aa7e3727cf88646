//! Sync engine: checkpointed full and incremental ingest.

pub mod checkpoint;
pub mod engine;
pub mod handlers;

pub use checkpoint::{CheckpointRow, CheckpointStatus, CheckpointStore};
pub use engine::{SyncEngine, SyncError, FULL_SYNC, INCREMENTAL_SYNC};
pub use handlers::{FullSyncHandler, IncrementalSyncHandler};

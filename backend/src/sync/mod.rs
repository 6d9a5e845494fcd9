//! Offline sync: durable queue, conflict resolution and incremental change
//! feed

pub mod conflict;
pub mod engine;
pub mod handlers;
pub mod incremental;
pub mod model;
pub mod payload;
pub mod queue;
pub mod worker;

pub use conflict::{Conflict, ConflictResolver, RecordVersion, Resolution, ResolutionStrategy, Winner};
pub use engine::{FullSyncResult, SyncEngine, SyncResult, SyncStatus};
pub use handlers::{ConflictPolicy, EntityHandlers, ItemOutcome};
pub use incremental::IncrementalSyncManager;
pub use model::{
    ChangeRecord, ChangedEntity, NewQueueItem, NewResolutionRecord, QueueItemState,
    ResolutionRecord, SyncEntityType, SyncOperation, SyncQueueItem,
};
pub use payload::QueuedMutation;
pub use queue::{SyncQueueManager, DEFAULT_MAX_RETRIES};
pub use worker::{QueueSweeper, SweepReport};

//! Sync engine services.
//!
//! This module contains the services that keep the local mirror consistent
//! with the remote mailbox, coordinating between the remote provider,
//! storage, and domain types.
//!
//! # Architecture
//!
//! ```text
//!            SyncCoordinator (single flight, events, cancel)
//!               |                         |
//!          InitialSync            IncrementalSync ---> recovery
//!               |                         |
//!               +------ PassPipeline -----+---- HistoryProcessor
//!               |     (fetch, upsert,     |---- Reconciler
//!               |      finalize)          |
//!               v                         v
//!   BoundedFetcher  MessageUpserter  ConversationResolver  FailureTracker
//!          |                 \             /
//!          v                  v           v
//!   RemoteMailClient        Storage (one UnitOfWork per pass)
//! ```
//!
//! # Services Overview
//!
//! - [`SyncCoordinator`]: Entry point; runs at most one pass at a time
//! - [`InitialSync`]: Full backfill bounded by install time
//! - [`IncrementalSync`]: Delta feed processing and cursor-expired recovery
//! - [`BoundedFetcher`]: Concurrency-limited fetching with retry and backoff
//! - [`ConversationResolver`]: Participant-set identity, merge and rollups
//! - [`FailureTracker`]: Withholds the cursor until failures are abandoned

mod cleanup_service;
mod conflict;
mod conversation_service;
mod error;
mod failure_tracker;
mod fetcher;
mod history_processor;
mod incremental_sync;
mod initial_sync;
mod message_upserter;
mod modification_tracker;
mod pipeline;
mod progress;
mod reconciler;
mod sync_service;

pub use cleanup_service::{CleanupReport, CleanupService};
pub use conflict::{ConflictDecision, ConflictPolicy};
pub use conversation_service::{participant_hash, ConversationResolver, RollupSummary};
pub use error::{Result, SyncError};
pub use failure_tracker::{CursorDecision, FailureTracker};
pub use fetcher::{retry_with_backoff, BoundedFetcher, FailedFetch, FetchReport, RetryPolicy};
pub use history_processor::{HistoryOutcome, HistoryProcessor};
pub use incremental_sync::{HistoryDelta, IncrementalSync};
pub use initial_sync::InitialSync;
pub use message_upserter::{MessageUpserter, UpsertBatchOutcome, UpsertOutcome};
pub use modification_tracker::ModificationTracker;
pub use pipeline::{
    after_query, commit_with_retry, AttachmentQueue, CursorMode, Finalized, IngestOutcome,
    LoggingAttachmentQueue, PassContext, PassPipeline,
};
pub use progress::{PassKind, PassReport, ProgressReporter, SyncEvent};
pub use reconciler::{ReconcileOutcome, Reconciler};
pub use sync_service::{SyncCoordinator, SyncOutcome, SyncStatus};

//! mailmirror - Keeps a local mailbox mirror consistent with a remote mail service
//!
//! This crate provides the sync engine: remote fetching with bounded
//! concurrency, delta feed processing, conversation grouping by participant
//! set, conflict handling for local edits, and transactional storage.

pub mod config;
pub mod domain;
pub mod providers;
pub mod services;
pub mod storage;

pub use services::{SyncCoordinator, SyncEvent, SyncOutcome};

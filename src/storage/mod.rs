//! Local store of the mailbox mirror.
//!
//! This module provides the storage layer, including:
//!
//! - SQLite database for messages, conversations, people, labels and sync state
//! - A pass-long [`UnitOfWork`] so each sync pass commits atomically
//! - Async-safe database operations via `tokio::task::spawn_blocking`

mod database;
pub mod queries;
mod schema;

pub use database::{Database, DatabaseError, Result, UnitOfWork};

//! Remote provider implementations.
//!
//! This module contains the remote mail boundary consumed by the sync engine:
//!
//! - [`mail`] - The [`RemoteMailClient`](mail::RemoteMailClient) trait and its Gmail API implementation

pub mod mail;

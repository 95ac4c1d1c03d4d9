//! Remote mail service providers.
//!
//! The sync engine talks to the remote mailbox only through
//! [`RemoteMailClient`]. [`GmailClient`] is the production binding.

mod gmail;
mod traits;

pub use gmail::{save_credentials, GmailClient, GmailCredentials};
pub use traits::{
    HistoryPage, HistoryRecord, MessageFormat, MessageListPage, RemoteError, RemoteMailClient,
    RemoteMessage, Result,
};

#[cfg(test)]
pub use traits::MockRemoteMailClient;

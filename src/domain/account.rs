//! Account domain types.
//!
//! The account is a singleton per signed-in mailbox and carries the delta
//! cursor, the most important piece of mutable sync state.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{normalize_email, HistoryCursor};

/// The signed-in mailbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Primary email address.
    pub email: String,
    /// Send-as aliases, normalized.
    pub aliases: Vec<String>,
    /// Delta cursor ("historyId"). `None` until the first completed pass.
    pub history_cursor: Option<HistoryCursor>,
    /// When a pass last advanced the cursor.
    pub last_successful_sync: Option<DateTime<Utc>>,
    /// Install time bounding the initial backfill.
    pub installed_at: Option<DateTime<Utc>>,
}

impl Account {
    /// Creates an account with no sync history.
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            aliases: Vec::new(),
            history_cursor: None,
            last_successful_sync: None,
            installed_at: None,
        }
    }

    /// Returns the normalized identity of this account.
    pub fn identity(&self) -> AccountIdentity {
        AccountIdentity::new(&self.email, &self.aliases)
    }
}

/// Every address that belongs to the account owner.
///
/// These addresses never participate in a conversation identity.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AccountIdentity {
    addresses: BTreeSet<String>,
}

impl AccountIdentity {
    /// Builds the identity from the primary email and aliases.
    pub fn new(email: &str, aliases: &[String]) -> Self {
        let addresses = std::iter::once(email)
            .chain(aliases.iter().map(String::as_str))
            .map(normalize_email)
            .filter(|a| !a.is_empty())
            .collect();
        Self { addresses }
    }

    /// Returns true if the address belongs to the account.
    pub fn owns(&self, email: &str) -> bool {
        self.addresses.contains(&normalize_email(email))
    }

    /// Stable signature of the address set, used to detect alias changes.
    pub fn signature(&self) -> String {
        self.addresses.iter().cloned().collect::<Vec<_>>().join(",")
    }
}

/// A send-as alias reported by the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alias {
    /// Alias address.
    pub email: String,
    /// Display name configured for the alias.
    pub display_name: Option<String>,
    /// Whether this is the primary address.
    pub is_primary: bool,
}

/// Remote profile snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    /// Account email.
    pub email: String,
    /// Current history position of the mailbox.
    pub cursor: HistoryCursor,
}

/// A message id sync permanently gave up on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbandonedSyncMessage {
    /// Remote message id.
    pub message_id: super::MessageId,
    /// Last failure description.
    pub reason: String,
    /// When the message was abandoned.
    pub abandoned_at: DateTime<Utc>,
    /// Number of attempts made so far.
    pub retry_count: u32,
}

//! Domain layer types for the mailbox mirror.
//!
//! This module contains the entities the sync engine reconciles: messages,
//! conversations, people, labels and the account singleton.

mod account;
mod conversation;
mod label;
mod message;
mod person;
mod types;

pub use account::{AbandonedSyncMessage, Account, AccountIdentity, Alias, Profile};
pub use conversation::{Conversation, ConversationRollup, MergeCandidate};
pub use label::{system_labels, Label};
pub use message::{
    clean_snippet, Address, Attachment, Message, MessageLabelState, ParticipantRole,
    SNIPPET_MAX_CHARS,
};
pub use person::{normalize_email, Person};
pub use types::{ConversationId, HistoryCursor, LabelId, MessageId, ThreadLinkId};

//! In-memory remote mailbox shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use mailmirror::config::Settings;
use mailmirror::domain::{
    Address, Alias, HistoryCursor, Label, LabelId, MessageId, Profile, ThreadLinkId,
};
use mailmirror::providers::mail::{
    HistoryPage, HistoryRecord, MessageFormat, MessageListPage, RemoteError, RemoteMailClient,
    RemoteMessage, Result,
};
use mailmirror::storage::Database;
use mailmirror::SyncCoordinator;

pub const ME: &str = "me@example.com";

const LIST_PAGE_SIZE: usize = 2;
const HISTORY_PAGE_SIZE: usize = 2;

#[derive(Default)]
struct Mailbox {
    aliases: Vec<String>,
    messages: BTreeMap<MessageId, RemoteMessage>,
    history: Vec<(u64, HistoryRecord)>,
    cursor: u64,
    oldest_history: u64,
    failing: HashSet<MessageId>,
    latency: Option<Duration>,
}

/// A remote mailbox whose state the test drives directly.
#[derive(Clone, Default)]
pub struct FakeRemote {
    mailbox: Arc<Mutex<Mailbox>>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Mailbox> {
        self.mailbox.lock().unwrap()
    }

    /// Puts a message in the mailbox without a history record, as if it
    /// predates the stored cursor.
    pub fn seed(&self, message: RemoteMessage) {
        let mut mailbox = self.lock();
        mailbox.cursor += 1;
        mailbox.messages.insert(message.id.clone(), message);
    }

    /// Delivers a message and records the addition.
    pub fn deliver(&self, message: RemoteMessage) {
        let record = HistoryRecord::MessageAdded {
            message_id: message.id.clone(),
            label_ids: message.label_ids.clone(),
        };
        let mut mailbox = self.lock();
        mailbox.messages.insert(message.id.clone(), message);
        push(&mut mailbox, record);
    }

    /// Appends a raw history record without touching message state.
    pub fn push_history(&self, record: HistoryRecord) {
        push(&mut self.lock(), record);
    }

    /// Removes a label remotely and records the change.
    pub fn remove_label(&self, id: &str, label: &str) {
        let mut mailbox = self.lock();
        if let Some(message) = mailbox.messages.get_mut(&MessageId::from(id)) {
            message.label_ids.retain(|l| l.0 != label);
        }
        push(
            &mut mailbox,
            HistoryRecord::LabelsRemoved {
                message_id: MessageId::from(id),
                label_ids: vec![LabelId::from(label)],
            },
        );
    }

    /// Deletes a message remotely and records the deletion.
    pub fn delete(&self, id: &str) {
        let mut mailbox = self.lock();
        mailbox.messages.remove(&MessageId::from(id));
        push(
            &mut mailbox,
            HistoryRecord::MessageDeleted {
                message_id: MessageId::from(id),
            },
        );
    }

    pub fn add_alias(&self, email: &str) {
        self.lock().aliases.push(email.to_string());
    }

    /// Makes every fetch of `id` fail with a server error.
    pub fn fail(&self, id: &str) {
        self.lock().failing.insert(MessageId::from(id));
    }

    pub fn heal(&self, id: &str) {
        self.lock().failing.remove(&MessageId::from(id));
    }

    /// Drops the history retained so far; older cursors become expired.
    pub fn expire_history(&self) {
        let cursor = self.lock().cursor;
        self.expire_before(cursor);
    }

    /// Expires every cursor below `oldest`.
    pub fn expire_before(&self, oldest: u64) {
        let mut mailbox = self.lock();
        mailbox.oldest_history = oldest;
        mailbox.history.retain(|(seq, _)| *seq > oldest);
    }

    /// Forces the reported mailbox cursor.
    pub fn set_cursor(&self, cursor: u64) {
        self.lock().cursor = cursor;
    }

    pub fn cursor(&self) -> HistoryCursor {
        HistoryCursor(self.lock().cursor)
    }

    /// Delay added to every call.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = Some(latency);
    }

    async fn wait(&self) {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

fn push(mailbox: &mut Mailbox, record: HistoryRecord) {
    mailbox.cursor += 1;
    let seq = mailbox.cursor;
    mailbox.history.push((seq, record));
}

fn page_offset(token: Option<String>) -> usize {
    token.and_then(|t| t.parse().ok()).unwrap_or(0)
}

#[async_trait]
impl RemoteMailClient for FakeRemote {
    async fn list_messages(
        &self,
        _query: &str,
        page_token: Option<String>,
    ) -> Result<MessageListPage> {
        self.wait().await;
        let mailbox = self.lock();
        let mut all: Vec<&RemoteMessage> = mailbox.messages.values().collect();
        all.sort_by(|a, b| b.internal_date.cmp(&a.internal_date));

        let offset = page_offset(page_token);
        let ids: Vec<MessageId> = all
            .iter()
            .skip(offset)
            .take(LIST_PAGE_SIZE)
            .map(|m| m.id.clone())
            .collect();
        let next = offset + ids.len();
        Ok(MessageListPage {
            ids,
            next_page_token: (next < all.len()).then(|| next.to_string()),
        })
    }

    async fn get_message(&self, id: &MessageId, _format: MessageFormat) -> Result<RemoteMessage> {
        self.wait().await;
        let mailbox = self.lock();
        if mailbox.failing.contains(id) {
            return Err(RemoteError::ServerError(503));
        }
        mailbox
            .messages
            .get(id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))
    }

    async fn list_history(
        &self,
        start: HistoryCursor,
        page_token: Option<String>,
    ) -> Result<HistoryPage> {
        self.wait().await;
        let mailbox = self.lock();
        if start.0 < mailbox.oldest_history {
            return Err(RemoteError::CursorExpired);
        }
        let pending: Vec<&HistoryRecord> = mailbox
            .history
            .iter()
            .filter(|(seq, _)| *seq > start.0)
            .map(|(_, record)| record)
            .collect();

        let offset = page_offset(page_token);
        let records: Vec<HistoryRecord> = pending
            .iter()
            .skip(offset)
            .take(HISTORY_PAGE_SIZE)
            .map(|r| (*r).clone())
            .collect();
        let next = offset + records.len();
        Ok(HistoryPage {
            records,
            cursor: HistoryCursor(mailbox.cursor),
            next_page_token: (next < pending.len()).then(|| next.to_string()),
        })
    }

    async fn get_profile(&self) -> Result<Profile> {
        self.wait().await;
        Ok(Profile {
            email: ME.to_string(),
            cursor: HistoryCursor(self.lock().cursor),
        })
    }

    async fn list_labels(&self) -> Result<Vec<Label>> {
        Ok(["INBOX", "UNREAD", "SPAM", "SENT"]
            .into_iter()
            .map(|id| Label {
                id: LabelId::from(id),
                name: id.to_string(),
                is_system: true,
            })
            .collect())
    }

    async fn list_aliases(&self) -> Result<Vec<Alias>> {
        let mut aliases = vec![Alias {
            email: ME.to_string(),
            display_name: None,
            is_primary: true,
        }];
        aliases.extend(self.lock().aliases.iter().map(|email| Alias {
            email: email.clone(),
            display_name: None,
            is_primary: false,
        }));
        Ok(aliases)
    }
}

/// A received message from `from` to the account.
pub fn incoming(id: &str, from: &str, thread: &str, labels: &[&str]) -> RemoteMessage {
    addressed(id, from, &[ME], thread, labels)
}

/// A message from `from` to `to`.
pub fn addressed(id: &str, from: &str, to: &[&str], thread: &str, labels: &[&str]) -> RemoteMessage {
    let minute: u32 = id
        .chars()
        .filter(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .unwrap_or(0);
    RemoteMessage {
        id: MessageId::from(id),
        thread_id: ThreadLinkId::from(thread),
        label_ids: labels.iter().map(|l| LabelId::from(*l)).collect(),
        snippet: format!("snippet of {}", id),
        internal_date: at(minute % 60),
        from: Some(Address::new(from)),
        to: to.iter().map(|a| Address::new(*a)).collect(),
        cc: vec![],
        bcc: vec![],
        subject: Some(format!("subject {}", id)),
        list_unsubscribe: false,
        attachments: vec![],
    }
}

fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 9, minute, 0).unwrap()
}

/// Settings with near-zero backoff so failing fetches resolve quickly.
pub fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.fetch.max_attempts = 2;
    settings.fetch.base_delay_ms = 1;
    settings.fetch.max_delay_ms = 5;
    settings.fetch.item_timeout_secs = 5;
    settings.sync.commit_base_delay_ms = 1;
    settings
}

pub async fn coordinator(remote: &FakeRemote) -> (SyncCoordinator, Database) {
    let db = Database::open_in_memory().await.unwrap();
    let coordinator = SyncCoordinator::new(db.clone(), Arc::new(remote.clone()), &fast_settings());
    (coordinator, db)
}

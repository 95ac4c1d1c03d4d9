//! Gmail API binding of [`RemoteMailClient`].
//!
//! # Authentication
//!
//! Gmail uses OAuth 2.0. The refresh token and client credentials are stored
//! in the system keychain, referenced by account email. Access tokens are
//! refreshed on demand and kept in memory only.
//!
//! # API Usage
//!
//! - `users.messages.list` for the search endpoint
//! - `users.messages.get` for per-message fetch
//! - `users.history.list` for the delta feed
//! - `users.getProfile`, `users.labels.list`, `users.settings.sendAs.list`
//!   for metadata

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, RETRY_AFTER};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use super::{
    HistoryPage, HistoryRecord, MessageFormat, MessageListPage, RemoteError, RemoteMailClient,
    RemoteMessage, Result,
};
use crate::config::GmailSettings;
use crate::domain::{
    system_labels, Address, Alias, Attachment, HistoryCursor, Label, LabelId, MessageId, Profile,
    ThreadLinkId,
};

const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Headers requested for metadata-only fetches.
const METADATA_HEADERS: &[&str] = &["From", "To", "Cc", "Bcc", "Subject", "List-Unsubscribe"];

/// Gmail API message list response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageListResponse {
    messages: Option<Vec<GmailMessageRef>>,
    next_page_token: Option<String>,
}

/// Gmail message reference.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessageRef {
    id: String,
}

/// Gmail API message.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    thread_id: String,
    label_ids: Option<Vec<String>>,
    snippet: Option<String>,
    payload: Option<GmailMessagePayload>,
    internal_date: Option<String>,
}

/// Gmail message payload (headers and body parts).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessagePayload {
    headers: Option<Vec<GmailHeader>>,
    parts: Option<Vec<GmailPart>>,
}

/// Gmail message header.
#[derive(Debug, Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}

/// Gmail message part (for multipart messages).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailPart {
    part_id: Option<String>,
    mime_type: Option<String>,
    filename: Option<String>,
    body: Option<GmailBody>,
    parts: Option<Vec<GmailPart>>,
}

/// Gmail message body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailBody {
    size: Option<u64>,
    attachment_id: Option<String>,
}

/// Gmail API label.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailLabel {
    id: String,
    name: String,
    #[serde(rename = "type")]
    label_type: Option<String>,
}

/// Gmail labels list response.
#[derive(Debug, Deserialize)]
struct LabelsListResponse {
    labels: Option<Vec<GmailLabel>>,
}

/// Gmail history list response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryListResponse {
    history: Option<Vec<GmailHistory>>,
    next_page_token: Option<String>,
    history_id: Option<String>,
}

/// Gmail history record.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailHistory {
    messages_added: Option<Vec<GmailHistoryMessage>>,
    messages_deleted: Option<Vec<GmailHistoryMessage>>,
    labels_added: Option<Vec<GmailHistoryLabelChange>>,
    labels_removed: Option<Vec<GmailHistoryLabelChange>>,
}

/// Gmail history message reference.
#[derive(Debug, Deserialize)]
struct GmailHistoryMessage {
    message: GmailHistoryMessageRef,
}

/// Gmail history message ref.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailHistoryMessageRef {
    id: String,
    label_ids: Option<Vec<String>>,
}

/// Gmail history label change.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailHistoryLabelChange {
    message: GmailHistoryMessageRef,
    label_ids: Vec<String>,
}

/// Gmail profile response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileResponse {
    email_address: String,
    history_id: String,
}

/// Gmail send-as list response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendAsListResponse {
    send_as: Option<Vec<GmailSendAs>>,
}

/// Gmail send-as alias.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailSendAs {
    send_as_email: String,
    display_name: Option<String>,
    is_primary: Option<bool>,
}

/// OAuth token response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// OAuth credentials stored in keychain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GmailCredentials {
    /// OAuth refresh token.
    pub refresh_token: String,
    /// OAuth client ID.
    pub client_id: String,
    /// OAuth client secret.
    pub client_secret: String,
}

/// Gmail API client.
///
/// # Example
///
/// ```ignore
/// use mailmirror::providers::mail::{GmailClient, RemoteMailClient};
///
/// let client = GmailClient::from_keychain(&settings.gmail, "me@example.com")?;
/// client.authenticate().await?;
/// let profile = client.get_profile().await?;
/// ```
pub struct GmailClient {
    /// HTTP client for API requests.
    client: reqwest::Client,
    /// Base URL of the `users/me` resource.
    api_base: String,
    /// OAuth credentials.
    credentials: GmailCredentials,
    /// Current OAuth access token (refreshed as needed).
    access_token: RwLock<Option<String>>,
}

impl GmailClient {
    /// Creates a client with explicit credentials.
    pub fn with_credentials(settings: &GmailSettings, credentials: GmailCredentials) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: settings.api_base.trim_end_matches('/').to_string(),
            credentials,
            access_token: RwLock::new(None),
        }
    }

    /// Creates a client with credentials loaded from the system keychain.
    pub fn from_keychain(settings: &GmailSettings, account_email: &str) -> Result<Self> {
        let credentials = load_credentials(&settings.keyring_service, account_email)?;
        Ok(Self::with_credentials(settings, credentials))
    }

    /// Refreshes the OAuth access token using the refresh token.
    pub async fn authenticate(&self) -> Result<()> {
        let params = [
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("refresh_token", self.credentials.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ];

        let response = self
            .client
            .post(GOOGLE_TOKEN_URL)
            .form(&params)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Authentication(format!(
                "token refresh failed ({}): {}",
                status, body
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::InvalidResponse(format!("token response: {}", e)))?;

        *self.access_token.write().await = Some(token.access_token);
        debug!("Gmail access token refreshed");
        Ok(())
    }

    /// Builds authorization headers for API requests.
    async fn auth_headers(&self) -> Result<HeaderMap> {
        let token = self.access_token.read().await.clone();
        let token =
            token.ok_or_else(|| RemoteError::Authentication("not authenticated".to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| RemoteError::Authentication(format!("invalid token: {}", e)))?,
        );
        Ok(headers)
    }

    /// Makes an authenticated GET request to the Gmail API.
    async fn get<T: for<'de> Deserialize<'de>>(
        &self,
        endpoint: &str,
        kind: EndpointKind,
    ) -> Result<T> {
        let url = format!("{}{}", self.api_base, endpoint);
        let headers = self.auth_headers().await?;

        let response = self
            .client
            .get(&url)
            .headers(headers)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, retry_after, &body, kind));
        }

        response
            .json()
            .await
            .map_err(|e| RemoteError::InvalidResponse(format!("{}: {}", endpoint, e)))
    }
}

#[async_trait]
impl RemoteMailClient for GmailClient {
    async fn list_messages(
        &self,
        query: &str,
        page_token: Option<String>,
    ) -> Result<MessageListPage> {
        let mut endpoint = format!("/messages?maxResults=500&q={}", encode(query));
        if let Some(token) = page_token {
            endpoint.push_str(&format!("&pageToken={}", encode(&token)));
        }

        let response: MessageListResponse = self.get(&endpoint, EndpointKind::Messages).await?;
        Ok(MessageListPage {
            ids: response
                .messages
                .unwrap_or_default()
                .into_iter()
                .map(|m| MessageId::from(m.id))
                .collect(),
            next_page_token: response.next_page_token,
        })
    }

    async fn get_message(&self, id: &MessageId, format: MessageFormat) -> Result<RemoteMessage> {
        let mut endpoint = format!("/messages/{}?format={}", encode(&id.0), format.as_str());
        if format == MessageFormat::Metadata {
            for header in METADATA_HEADERS {
                endpoint.push_str(&format!("&metadataHeaders={}", header));
            }
        }

        let message: GmailMessage = self.get(&endpoint, EndpointKind::Messages).await?;
        convert_message(message)
    }

    async fn list_history(
        &self,
        start: HistoryCursor,
        page_token: Option<String>,
    ) -> Result<HistoryPage> {
        let mut endpoint = format!(
            "/history?startHistoryId={}&historyTypes=messageAdded&historyTypes=messageDeleted&historyTypes=labelAdded&historyTypes=labelRemoved",
            start
        );
        if let Some(token) = page_token {
            endpoint.push_str(&format!("&pageToken={}", encode(&token)));
        }

        let response: HistoryListResponse = self.get(&endpoint, EndpointKind::History).await?;
        convert_history(response, start)
    }

    async fn get_profile(&self) -> Result<Profile> {
        let response: ProfileResponse = self.get("/profile", EndpointKind::Metadata).await?;
        let cursor = response
            .history_id
            .parse::<HistoryCursor>()
            .map_err(|e| RemoteError::InvalidResponse(format!("historyId: {}", e)))?;
        Ok(Profile {
            email: response.email_address,
            cursor,
        })
    }

    async fn list_labels(&self) -> Result<Vec<Label>> {
        let response: LabelsListResponse = self.get("/labels", EndpointKind::Metadata).await?;
        Ok(response
            .labels
            .unwrap_or_default()
            .into_iter()
            .map(|l| Label {
                is_system: l.label_type.as_deref() == Some("system")
                    || system_labels::is_system(&l.id),
                id: LabelId::from(l.id),
                name: l.name,
            })
            .collect())
    }

    async fn list_aliases(&self) -> Result<Vec<Alias>> {
        let response: SendAsListResponse = self
            .get("/settings/sendAs", EndpointKind::Metadata)
            .await?;
        Ok(response
            .send_as
            .unwrap_or_default()
            .into_iter()
            .map(|s| Alias {
                email: s.send_as_email,
                display_name: s.display_name.filter(|n| !n.is_empty()),
                is_primary: s.is_primary.unwrap_or(false),
            })
            .collect())
    }
}

/// Which family of endpoint produced an error; 404 means different things.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndpointKind {
    Messages,
    History,
    Metadata,
}

/// Loads OAuth credentials from the system keychain.
fn load_credentials(service: &str, account_email: &str) -> Result<GmailCredentials> {
    let entry = keyring::Entry::new(service, &format!("gmail-{}", account_email))
        .map_err(|e| RemoteError::Authentication(format!("keyring error: {}", e)))?;

    let creds_json = entry
        .get_password()
        .map_err(|e| RemoteError::Authentication(format!("no credentials found: {}", e)))?;

    serde_json::from_str(&creds_json)
        .map_err(|e| RemoteError::Authentication(format!("invalid credentials: {}", e)))
}

/// Saves OAuth credentials to the system keychain.
pub fn save_credentials(
    service: &str,
    account_email: &str,
    credentials: &GmailCredentials,
) -> Result<()> {
    let entry = keyring::Entry::new(service, &format!("gmail-{}", account_email))
        .map_err(|e| RemoteError::Authentication(format!("keyring error: {}", e)))?;

    let creds_json = serde_json::to_string(credentials)
        .map_err(|e| RemoteError::Authentication(format!("serialize error: {}", e)))?;

    entry
        .set_password(&creds_json)
        .map_err(|e| RemoteError::Authentication(format!("keyring error: {}", e)))
}

fn encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

fn transport_error(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::Timeout
    } else {
        RemoteError::Network(e.to_string())
    }
}

/// Maps a non-success HTTP status to the remote error taxonomy.
fn map_status(
    status: StatusCode,
    retry_after: Option<u64>,
    body: &str,
    kind: EndpointKind,
) -> RemoteError {
    match status.as_u16() {
        401 => RemoteError::Authentication(format!("unauthorized: {}", body)),
        403 if body.contains("rateLimitExceeded") || body.contains("userRateLimitExceeded") => {
            RemoteError::RateLimited {
                retry_after_secs: retry_after,
            }
        }
        403 => RemoteError::Authentication(format!("forbidden: {}", body)),
        404 if kind == EndpointKind::History => RemoteError::CursorExpired,
        404 => RemoteError::NotFound(body.to_string()),
        408 => RemoteError::Timeout,
        429 => RemoteError::RateLimited {
            retry_after_secs: retry_after,
        },
        code if code >= 500 => RemoteError::ServerError(code),
        code => RemoteError::InvalidResponse(format!("API error ({}): {}", code, body)),
    }
}

/// Parses an address list header, tolerating malformed input.
fn parse_addresses(value: &str) -> Vec<Address> {
    match mailparse::addrparse(value) {
        Ok(list) => list
            .iter()
            .flat_map(|addr| match addr {
                mailparse::MailAddr::Single(info) => vec![single_to_address(info)],
                mailparse::MailAddr::Group(group) => {
                    group.addrs.iter().map(single_to_address).collect()
                }
            })
            .filter(|a| !a.email.is_empty())
            .collect(),
        Err(_) => value
            .split(',')
            .map(str::trim)
            .filter(|s| s.contains('@'))
            .map(Address::new)
            .collect(),
    }
}

fn single_to_address(info: &mailparse::SingleInfo) -> Address {
    Address {
        email: info.addr.trim().to_string(),
        name: info
            .display_name
            .as_ref()
            .map(|n| n.trim().trim_matches('"').to_string())
            .filter(|n| !n.is_empty()),
    }
}

/// Recursively collects attachment parts.
fn collect_attachments(parts: &[GmailPart], out: &mut Vec<Attachment>) {
    for part in parts {
        let filename = part.filename.as_deref().unwrap_or("");
        if !filename.is_empty() {
            out.push(Attachment {
                part_id: part.part_id.clone().unwrap_or_default(),
                filename: filename.to_string(),
                mime_type: part
                    .mime_type
                    .clone()
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                size_bytes: part.body.as_ref().and_then(|b| b.size).unwrap_or(0),
                remote_attachment_id: part.body.as_ref().and_then(|b| b.attachment_id.clone()),
            });
        }
        if let Some(nested) = &part.parts {
            collect_attachments(nested, out);
        }
    }
}

/// Converts a Gmail message to the remote boundary type.
fn convert_message(msg: GmailMessage) -> Result<RemoteMessage> {
    let internal_date = msg
        .internal_date
        .as_deref()
        .and_then(|d| d.parse::<i64>().ok())
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .ok_or_else(|| {
            RemoteError::InvalidResponse(format!("message {} has no internalDate", msg.id))
        })?;

    let headers = msg
        .payload
        .as_ref()
        .and_then(|p| p.headers.as_ref())
        .map(Vec::as_slice)
        .unwrap_or_default();

    let get_header = |name: &str| -> Option<&str> {
        headers
            .iter()
            .find(|hdr| hdr.name.eq_ignore_ascii_case(name))
            .map(|hdr| hdr.value.as_str())
    };

    let mut attachments = Vec::new();
    if let Some(parts) = msg.payload.as_ref().and_then(|p| p.parts.as_ref()) {
        collect_attachments(parts, &mut attachments);
    }

    Ok(RemoteMessage {
        from: get_header("From").and_then(|v| parse_addresses(v).into_iter().next()),
        to: get_header("To").map(parse_addresses).unwrap_or_default(),
        cc: get_header("Cc").map(parse_addresses).unwrap_or_default(),
        bcc: get_header("Bcc").map(parse_addresses).unwrap_or_default(),
        subject: get_header("Subject").map(str::to_string),
        list_unsubscribe: get_header("List-Unsubscribe").is_some(),
        id: MessageId::from(msg.id),
        thread_id: ThreadLinkId::from(msg.thread_id),
        label_ids: msg
            .label_ids
            .unwrap_or_default()
            .into_iter()
            .map(LabelId::from)
            .collect(),
        snippet: msg.snippet.unwrap_or_default(),
        internal_date,
        attachments,
    })
}

/// Flattens Gmail history entries into ordered records.
fn convert_history(response: HistoryListResponse, start: HistoryCursor) -> Result<HistoryPage> {
    let cursor = match response.history_id.as_deref() {
        Some(id) => id
            .parse::<HistoryCursor>()
            .map_err(|e| RemoteError::InvalidResponse(format!("historyId: {}", e)))?,
        None => start,
    };

    let labels = |ids: Vec<String>| ids.into_iter().map(LabelId::from).collect::<Vec<_>>();

    let mut records = Vec::new();
    for entry in response.history.unwrap_or_default() {
        for item in entry.messages_added.unwrap_or_default() {
            records.push(HistoryRecord::MessageAdded {
                message_id: MessageId::from(item.message.id),
                label_ids: labels(item.message.label_ids.unwrap_or_default()),
            });
        }
        for item in entry.messages_deleted.unwrap_or_default() {
            records.push(HistoryRecord::MessageDeleted {
                message_id: MessageId::from(item.message.id),
            });
        }
        for item in entry.labels_added.unwrap_or_default() {
            records.push(HistoryRecord::LabelsAdded {
                message_id: MessageId::from(item.message.id),
                label_ids: labels(item.label_ids),
            });
        }
        for item in entry.labels_removed.unwrap_or_default() {
            records.push(HistoryRecord::LabelsRemoved {
                message_id: MessageId::from(item.message.id),
                label_ids: labels(item.label_ids),
            });
        }
    }

    Ok(HistoryPage {
        records,
        cursor,
        next_page_token: response.next_page_token,
    })
}

//! Gmail REST API client: credential refresh, rate-limit-aware requests,
//! message listing, change history and push-watch management.

use std::time::Duration as StdDuration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::store::models::MailAccount;
use crate::store::Database;

pub mod api;

use api::{
    GmailHistoryList, GmailLabel, GmailLabelList, GmailMessage, GmailMessageList,
    GmailMessageStub, GmailProfile, GmailWatchResponse,
};

const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const TOKEN_SKEW_SECONDS: i64 = 60;
const LIST_PAGE_SIZE: usize = 50;
const HISTORY_PAGE_SIZE: usize = 100;
const MAX_RATE_LIMIT_RETRIES: usize = 5;
const REDACTED_BODY_MAX_LEN: usize = 200;

#[derive(Debug, Error)]
pub enum MailboxError {
    /// The stored history cursor is too old for the mailbox to diff against.
    #[error("history cursor is stale")]
    StaleCursor,

    #[error("gmail api request failed: status={status} body={body}")]
    Http { status: StatusCode, body: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The mailbox surface the orchestrator consumes. Object-safe so tests can
/// substitute fakes.
#[async_trait(?Send)]
pub trait MailboxApi {
    async fn list_labels(&self) -> Result<Vec<GmailLabel>, MailboxError>;

    /// Single bounded page; full polls never chase page tokens.
    async fn list_message_ids(
        &self,
        query: &str,
        label_id: Option<&str>,
    ) -> Result<Vec<GmailMessageStub>, MailboxError>;

    async fn get_message_full(&self, id: &str) -> Result<GmailMessage, MailboxError>;

    /// Metadata format: label ids and headers without body data.
    async fn get_message_metadata(&self, id: &str) -> Result<GmailMessage, MailboxError>;

    async fn list_history(
        &self,
        start_history_id: &str,
        page_token: Option<&str>,
    ) -> Result<GmailHistoryList, MailboxError>;

    /// The mailbox's current history position, used to seed or reset the
    /// cursor.
    async fn get_profile_history_id(&self) -> Result<String, MailboxError>;

    async fn start_watch(&self, topic: &str) -> Result<GmailWatchResponse, MailboxError>;

    async fn stop_watch(&self) -> Result<(), MailboxError>;
}

#[derive(Debug, Clone)]
pub struct GoogleCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl GoogleCredentials {
    pub fn from_env() -> Result<Self> {
        let client_id = non_empty_env("MAILSINK_GOOGLE_CLIENT_ID")
            .ok_or_else(|| anyhow!("missing google client id (MAILSINK_GOOGLE_CLIENT_ID)"))?;
        let client_secret = non_empty_env("MAILSINK_GOOGLE_CLIENT_SECRET")
            .ok_or_else(|| anyhow!("missing google client secret (MAILSINK_GOOGLE_CLIENT_SECRET)"))?;
        Ok(Self {
            client_id,
            client_secret,
        })
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[derive(Debug, Clone)]
pub struct GmailClient {
    http: Client,
    access_token: String,
}

impl GmailClient {
    /// Acquire a client for one mail account, refreshing and persisting the
    /// access token when it is expired or about to expire. Refresh failure is
    /// non-fatal here; downstream calls surface the auth error instead.
    pub async fn connect(
        db: &Database,
        account: &MailAccount,
        credentials: &GoogleCredentials,
    ) -> Result<Self> {
        let http = Client::new();
        let mut access_token = account.access_token.clone();

        if token_needs_refresh(account.token_expires_at.as_deref()) {
            if let Some(refresh_token) = account.refresh_token.as_deref() {
                match fetch_refreshed_token(&http, credentials, refresh_token).await {
                    Ok(fresh) => {
                        db.update_mail_account_tokens(
                            &account.id,
                            &fresh.access_token,
                            fresh.refresh_token.as_deref(),
                            fresh.scope.as_deref(),
                            Some(&fresh.expires_at.to_rfc3339()),
                        )
                        .context("persist refreshed google credential")?;
                        access_token = fresh.access_token;
                    }
                    Err(error) => {
                        warn!(
                            account = %account.id,
                            "google token refresh failed, keeping stored token: {error}"
                        );
                    }
                }
            }
        }

        Ok(Self { http, access_token })
    }

    pub async fn get_profile(&self) -> Result<GmailProfile, MailboxError> {
        let url = format!("{GMAIL_API_BASE}/users/me/profile");
        let body = self.fetch_with_retry(&url).await?;
        decode_json(&body, "gmail profile")
    }

    async fn fetch_with_retry(&self, url: &str) -> Result<String, MailboxError> {
        let mut backoff_seconds = 1u64;

        for attempt in 0..=MAX_RATE_LIMIT_RETRIES {
            let response = self
                .http
                .get(url)
                .bearer_auth(&self.access_token)
                .header("accept", "application/json")
                .send()
                .await
                .with_context(|| format!("gmail api request: {url}"))?;

            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                if attempt == MAX_RATE_LIMIT_RETRIES {
                    let body = response
                        .text()
                        .await
                        .context("read gmail 429 response body")?;
                    return Err(MailboxError::Http {
                        status: StatusCode::TOO_MANY_REQUESTS,
                        body: redact_response_body(&body),
                    });
                }

                let retry_after_seconds = response
                    .headers()
                    .get("retry-after")
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse::<u64>().ok())
                    .unwrap_or(backoff_seconds);

                sleep(StdDuration::from_secs(retry_after_seconds)).await;
                backoff_seconds = (backoff_seconds * 2).min(32);
                continue;
            }

            let status = response.status();
            let body = response
                .text()
                .await
                .context("read gmail api response body")?;
            if !status.is_success() {
                return Err(MailboxError::Http {
                    status,
                    body: redact_response_body(&body),
                });
            }

            return Ok(body);
        }

        Err(MailboxError::Other(anyhow!(
            "gmail api request failed without response"
        )))
    }

    async fn post_json(&self, url: &str, payload: serde_json::Value) -> Result<String, MailboxError> {
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.access_token)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("gmail api request: {url}"))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("read gmail api response body")?;
        if !status.is_success() {
            return Err(MailboxError::Http {
                status,
                body: redact_response_body(&body),
            });
        }
        Ok(body)
    }
}

#[async_trait(?Send)]
impl MailboxApi for GmailClient {
    async fn list_labels(&self) -> Result<Vec<GmailLabel>, MailboxError> {
        let url = format!("{GMAIL_API_BASE}/users/me/labels");
        let body = self.fetch_with_retry(&url).await?;
        let list: GmailLabelList = decode_json(&body, "gmail label list")?;
        Ok(list.labels)
    }

    async fn list_message_ids(
        &self,
        query: &str,
        label_id: Option<&str>,
    ) -> Result<Vec<GmailMessageStub>, MailboxError> {
        let mut url = format!(
            "{GMAIL_API_BASE}/users/me/messages?maxResults={LIST_PAGE_SIZE}&q={}",
            urlencode(query)
        );
        if let Some(label_id) = label_id {
            url.push_str(&format!("&labelIds={}", urlencode(label_id)));
        }
        let body = self.fetch_with_retry(&url).await?;
        let list: GmailMessageList = decode_json(&body, "gmail message list")?;
        Ok(list.messages.unwrap_or_default())
    }

    async fn get_message_full(&self, id: &str) -> Result<GmailMessage, MailboxError> {
        let url = format!("{GMAIL_API_BASE}/users/me/messages/{id}?format=full");
        let body = self.fetch_with_retry(&url).await?;
        decode_json(&body, "gmail message")
    }

    async fn get_message_metadata(&self, id: &str) -> Result<GmailMessage, MailboxError> {
        let url = format!("{GMAIL_API_BASE}/users/me/messages/{id}?format=metadata");
        let body = self.fetch_with_retry(&url).await?;
        decode_json(&body, "gmail message metadata")
    }

    async fn list_history(
        &self,
        start_history_id: &str,
        page_token: Option<&str>,
    ) -> Result<GmailHistoryList, MailboxError> {
        let mut url = format!(
            "{GMAIL_API_BASE}/users/me/history?startHistoryId={start_history_id}\
             &historyTypes=messageAdded&maxResults={HISTORY_PAGE_SIZE}"
        );
        if let Some(token) = page_token {
            url.push_str(&format!("&pageToken={}", urlencode(token)));
        }

        match self.fetch_with_retry(&url).await {
            Ok(body) => decode_json(&body, "gmail history list"),
            Err(error) => Err(classify_history_error(error)),
        }
    }

    async fn get_profile_history_id(&self) -> Result<String, MailboxError> {
        Ok(self.get_profile().await?.history_id)
    }

    async fn start_watch(&self, topic: &str) -> Result<GmailWatchResponse, MailboxError> {
        let url = format!("{GMAIL_API_BASE}/users/me/watch");
        let body = self
            .post_json(&url, serde_json::json!({ "topicName": topic }))
            .await?;
        decode_json(&body, "gmail watch response")
    }

    async fn stop_watch(&self) -> Result<(), MailboxError> {
        let url = format!("{GMAIL_API_BASE}/users/me/stop");
        self.post_json(&url, serde_json::json!({})).await?;
        Ok(())
    }
}

/// A too-old cursor surfaces as 404, or as 400 complaining about the
/// startHistoryId parameter.
fn classify_history_error(error: MailboxError) -> MailboxError {
    match &error {
        MailboxError::Http { status, body } => {
            if *status == StatusCode::NOT_FOUND
                || (*status == StatusCode::BAD_REQUEST && body.contains("historyId"))
            {
                MailboxError::StaleCursor
            } else {
                error
            }
        }
        _ => error,
    }
}

fn token_needs_refresh(expires_at: Option<&str>) -> bool {
    match expires_at.and_then(|raw| DateTime::parse_from_rfc3339(raw).ok()) {
        Some(expiry) => expiry.with_timezone(&Utc) <= Utc::now() + Duration::seconds(TOKEN_SKEW_SECONDS),
        // No recorded expiry: assume the stored token is still good.
        None => false,
    }
}

#[derive(Debug, Clone)]
struct RefreshedToken {
    access_token: String,
    refresh_token: Option<String>,
    scope: Option<String>,
    expires_at: DateTime<Utc>,
}

async fn fetch_refreshed_token(
    http: &Client,
    credentials: &GoogleCredentials,
    refresh_token: &str,
) -> Result<RefreshedToken> {
    let token_url =
        non_empty_env("MAILSINK_GOOGLE_TOKEN_URL").unwrap_or_else(|| GOOGLE_TOKEN_URL.to_string());

    let response = http
        .post(&token_url)
        .form(&[
            ("client_id", credentials.client_id.as_str()),
            ("client_secret", credentials.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ])
        .send()
        .await
        .with_context(|| format!("request google oauth token from {token_url}"))?;

    let status = response.status();
    let body = response.text().await.context("read google token response")?;
    if !status.is_success() {
        return Err(anyhow!(
            "google oauth token request failed: status={} body={}",
            status,
            redact_response_body(&body)
        ));
    }

    let payload: OAuthTokenResponse =
        serde_json::from_str(&body).context("decode google token JSON response")?;
    let expires_at = Utc::now()
        + Duration::seconds((payload.expires_in as i64).saturating_sub(TOKEN_SKEW_SECONDS));

    debug!("refreshed google access token, expires {expires_at}");
    Ok(RefreshedToken {
        access_token: payload.access_token,
        refresh_token: payload.refresh_token,
        scope: payload.scope,
        expires_at,
    })
}

fn decode_json<T: serde::de::DeserializeOwned>(body: &str, what: &str) -> Result<T, MailboxError> {
    serde_json::from_str(body)
        .with_context(|| format!("decode {what}"))
        .map_err(MailboxError::Other)
}

fn redact_response_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= REDACTED_BODY_MAX_LEN {
        trimmed.to_string()
    } else {
        let cut = trimmed
            .char_indices()
            .take_while(|(i, _)| *i < REDACTED_BODY_MAX_LEN)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        format!("{}…[truncated {} bytes]", &trimmed[..cut], trimmed.len())
    }
}

fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    token_type: Option<String>,
    expires_in: u64,
    scope: Option<String>,
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use reqwest::StatusCode;

    use super::{
        classify_history_error, redact_response_body, token_needs_refresh, urlencode, MailboxError,
    };

    #[test]
    fn history_404_and_bad_cursor_400_classify_as_stale() {
        let stale = classify_history_error(MailboxError::Http {
            status: StatusCode::NOT_FOUND,
            body: "not found".to_string(),
        });
        assert!(matches!(stale, MailboxError::StaleCursor));

        let stale = classify_history_error(MailboxError::Http {
            status: StatusCode::BAD_REQUEST,
            body: "Invalid startHistoryId value".to_string(),
        });
        assert!(matches!(stale, MailboxError::StaleCursor));

        let other = classify_history_error(MailboxError::Http {
            status: StatusCode::BAD_REQUEST,
            body: "bad maxResults".to_string(),
        });
        assert!(matches!(other, MailboxError::Http { .. }));
    }

    #[test]
    fn token_refresh_honors_expiry_and_skew() {
        let past = (Utc::now() - Duration::hours(1)).to_rfc3339();
        assert!(token_needs_refresh(Some(&past)));

        let soon = (Utc::now() + Duration::seconds(30)).to_rfc3339();
        assert!(token_needs_refresh(Some(&soon)));

        let later = (Utc::now() + Duration::hours(1)).to_rfc3339();
        assert!(!token_needs_refresh(Some(&later)));

        assert!(!token_needs_refresh(None));
        assert!(!token_needs_refresh(Some("not a date")));
    }

    #[test]
    fn query_strings_are_percent_encoded() {
        assert_eq!(urlencode("newer_than:7d"), "newer_than%3A7d");
        assert_eq!(urlencode("label one"), "label%20one");
    }

    #[test]
    fn long_error_bodies_are_truncated() {
        let long = "x".repeat(500);
        let redacted = redact_response_body(&long);
        assert!(redacted.len() < 300);
        assert!(redacted.contains("truncated 500 bytes"));
    }
}

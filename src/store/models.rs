use rusqlite::{Result as SqlResult, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: String,
    pub email: String,
}

/// One connected Gmail mailbox, including its OAuth credential and the
/// watch/cursor state mutated by every sync.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MailAccount {
    pub id: String,
    pub user_id: String,
    pub email_address: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
    /// RFC 3339 expiry of the access token.
    pub token_expires_at: Option<String>,
    pub history_id: Option<String>,
    pub watch_active: bool,
    /// Epoch milliseconds, as reported by the watch call.
    pub watch_expires_at: Option<i64>,
}

/// One connected Notion workspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotionAccount {
    pub id: String,
    pub user_id: String,
    pub workspace_name: Option<String>,
    pub access_token: String,
}

/// A sync rule: which messages (account + label filter) land in which Notion
/// database. An empty label and empty label-id set means match-all.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Mapping {
    pub id: String,
    pub user_id: String,
    /// None binds the mapping to any mail account of the user.
    pub mail_account_id: Option<String>,
    pub notion_account_id: Option<String>,
    pub notion_database_id: String,
    /// Label names used by full polls, one poll per name. Empty means
    /// match-all.
    pub labels: Vec<String>,
    /// Resolved Gmail label ids used by incremental catch-up matching.
    /// Empty means match-all.
    pub label_ids: Vec<String>,
    pub enabled: bool,
}

/// The idempotence record: one mailbox message maps to exactly one Notion
/// page, globally. Created on first successful write, never rewritten.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Link {
    pub gmail_message_id: String,
    pub gmail_thread_id: String,
    pub notion_page_id: String,
    pub checksum: String,
    pub user_id: String,
    pub mail_account_id: String,
    pub mapping_id: Option<String>,
}

/// Typed cursor/watch state for one mail account.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WatchState {
    pub history_id: Option<String>,
    pub watch_active: bool,
    pub watch_expires_at: Option<i64>,
}

/// Field-level patch: only `Some` fields are written, the rest are kept.
#[derive(Debug, Clone, Default)]
pub struct WatchStatePatch {
    pub history_id: Option<String>,
    pub watch_active: Option<bool>,
    pub watch_expires_at: Option<i64>,
}

fn parse_json_array(raw: Option<String>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str::<Vec<String>>(&s).ok())
        .unwrap_or_default()
}

impl User {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            email: row.get("email")?,
        })
    }
}

impl MailAccount {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            email_address: row.get("email_address")?,
            access_token: row.get("access_token")?,
            refresh_token: row.get("refresh_token")?,
            scope: row.get("scope")?,
            token_expires_at: row.get("token_expires_at")?,
            history_id: row.get("history_id")?,
            watch_active: row.get("watch_active")?,
            watch_expires_at: row.get("watch_expires_at")?,
        })
    }

    pub fn watch_state(&self) -> WatchState {
        WatchState {
            history_id: self.history_id.clone(),
            watch_active: self.watch_active,
            watch_expires_at: self.watch_expires_at,
        }
    }
}

impl NotionAccount {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            workspace_name: row.get("workspace_name")?,
            access_token: row.get("access_token")?,
        })
    }
}

impl Mapping {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            mail_account_id: row.get("mail_account_id")?,
            notion_account_id: row.get("notion_account_id")?,
            notion_database_id: row.get("notion_database_id")?,
            labels: parse_json_array(row.get("labels")?),
            label_ids: parse_json_array(row.get("label_ids")?),
            enabled: row.get("enabled")?,
        })
    }
}

impl Link {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            gmail_message_id: row.get("gmail_message_id")?,
            gmail_thread_id: row.get("gmail_thread_id")?,
            notion_page_id: row.get("notion_page_id")?,
            checksum: row.get("checksum")?,
            user_id: row.get("user_id")?,
            mail_account_id: row.get("mail_account_id")?,
            mapping_id: row.get("mapping_id")?,
        })
    }
}

//! Sync orchestration: full polls per mapping, incremental history catch-up,
//! and push-watch lifecycle.

use std::collections::HashSet;
use std::rc::Rc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::extract;
use crate::gmail::api::{GmailLabel, LabelCatalog};
use crate::gmail::{MailboxApi, MailboxError};
use crate::mapping::{self, LabelNotFound};
use crate::normalize::{self, NormalizedMessage};
use crate::notion::DestinationApi;
use crate::store::models::{Link, MailAccount, Mapping, WatchStatePatch};
use crate::store::Database;

pub mod push;

const DEFAULT_POLL_DAYS: i64 = 7;
const MIN_POLL_DAYS: i64 = 1;
const MAX_POLL_DAYS: i64 = 365;

#[derive(Debug, Clone, Default)]
pub struct PollOptions {
    /// Lookback window in days; clamped to [1, 365], default 7.
    pub days: Option<i64>,
    /// Full Gmail query override; when set, the window query is not built.
    pub query: Option<String>,
}

/// One per-message failure inside an otherwise continuing poll.
#[derive(Debug, Clone, Serialize)]
pub struct PollError {
    pub message_id: String,
    pub step: &'static str,
    pub detail: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PollReport {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub suggestions: Vec<String>,
    pub q: String,
    pub days: i64,
    pub total: usize,
    pub processed: usize,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub errors: Vec<PollError>,
}

impl PollReport {
    fn terminal(mut self, code: &'static str, message: String) -> Self {
        self.ok = false;
        self.error = Some(code);
        self.message = Some(message);
        self
    }
}

/// Outcome of one incremental catch-up run for a mail account.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CatchUpOutcome {
    /// No cursor existed yet; one was recorded without backfilling.
    Baseline { history_id: String },
    /// The stored cursor was too old; watch re-registered, cursor reset.
    Reset { history_id: String },
    /// History was diffed and matching messages materialized.
    Applied { added: usize, materialized: usize },
}

/// Full poll of one mapping: list recent messages (optionally per configured
/// label), materialize each one, collect per-message failures without
/// aborting the batch. `labels` is the mailbox's label listing, fetched once
/// per account and shared across all of its mappings.
pub async fn poll_and_ingest(
    db: &Database,
    mailbox: &dyn MailboxApi,
    destination: &dyn DestinationApi,
    account: &MailAccount,
    mapping: &Mapping,
    labels: &[GmailLabel],
    options: &PollOptions,
) -> PollReport {
    let days = options
        .days
        .unwrap_or(DEFAULT_POLL_DAYS)
        .clamp(MIN_POLL_DAYS, MAX_POLL_DAYS);
    let q = options
        .query
        .clone()
        .unwrap_or_else(|| format!("newer_than:{days}d"));

    let mut report = PollReport {
        ok: true,
        q: q.clone(),
        days,
        ..PollReport::default()
    };

    if mapping.notion_database_id.trim().is_empty() {
        return report.terminal(
            "NO_NOTION_DB",
            "mapping has no notion database configured".to_string(),
        );
    }

    if let Err(error) = destination.ensure_schema(&mapping.notion_database_id).await {
        return report.terminal(
            "NOTION_SCHEMA_FAILED",
            format!("could not prepare notion database schema: {error}"),
        );
    }

    let catalog = LabelCatalog::new(labels);

    // One listing pass per configured label name; an unconfigured mapping
    // gets a single unfiltered pass.
    let passes: Vec<Option<String>> = if mapping.labels.is_empty() {
        vec![None]
    } else {
        mapping.labels.iter().cloned().map(Some).collect()
    };

    let mut seen: HashSet<String> = HashSet::new();
    for label_name in passes {
        let label_id = match &label_name {
            Some(wanted) => match mapping::resolve_label_id(labels, wanted) {
                Ok(id) => Some(id),
                Err(LabelNotFound { label, suggestions }) => {
                    report.label = Some(label.clone());
                    report.suggestions = suggestions;
                    return report.terminal(
                        "LABEL_NOT_FOUND",
                        format!("gmail label not found: {label}"),
                    );
                }
            },
            None => None,
        };

        let stubs = match mailbox.list_message_ids(&q, label_id.as_deref()).await {
            Ok(stubs) => stubs,
            Err(error) => {
                return report.terminal(
                    "GMAIL_LIST_FAILED",
                    format!("could not list messages: {error}"),
                )
            }
        };

        for stub in stubs {
            if !seen.insert(stub.id.clone()) {
                continue;
            }
            report.total += 1;

            match ingest_message(
                db,
                mailbox,
                destination,
                account,
                mapping,
                &catalog,
                &stub.id,
                label_name.as_deref(),
            )
            .await
            {
                Ok(_) => report.processed += 1,
                Err(ingest_error) => {
                    warn!(
                        message = %stub.id,
                        step = ingest_error.step,
                        "message skipped: {}",
                        ingest_error.detail
                    );
                    report.errors.push(PollError {
                        message_id: stub.id,
                        step: ingest_error.step,
                        detail: ingest_error.detail,
                    });
                }
            }
        }
    }

    info!(
        mapping = %mapping.id,
        total = report.total,
        processed = report.processed,
        failed = report.errors.len(),
        "poll finished"
    );
    report
}

struct IngestError {
    step: &'static str,
    detail: String,
}

impl IngestError {
    fn new(step: &'static str, detail: impl std::fmt::Display) -> Self {
        Self {
            step,
            detail: detail.to_string(),
        }
    }
}

/// Materialize a single message: fetch, normalize, extract, write the Notion
/// page, and record the link on first success. An existing link routes the
/// write to the already-created page.
#[allow(clippy::too_many_arguments)]
async fn ingest_message(
    db: &Database,
    mailbox: &dyn MailboxApi,
    destination: &dyn DestinationApi,
    account: &MailAccount,
    mapping: &Mapping,
    catalog: &LabelCatalog,
    message_id: &str,
    forced_label: Option<&str>,
) -> Result<String, IngestError> {
    let existing = db
        .find_link_by_message_id(message_id)
        .map_err(|e| IngestError::new("link", e))?;

    let message = mailbox
        .get_message_full(message_id)
        .await
        .map_err(|e| IngestError::new("fetch", e))?;

    let normalized = normalize::normalize(&message, catalog, forced_label);
    let enriched = extract::extract(&normalized.subject, &normalized.body_text, &normalized.from);

    let page_id = destination
        .upsert_record(
            &mapping.notion_database_id,
            existing.as_ref().map(|link| link.notion_page_id.as_str()),
            &normalized,
            &enriched,
        )
        .await
        .map_err(|e| IngestError::new("notion", e))?;

    if existing.is_none() {
        let link = Link {
            gmail_message_id: message_id.to_string(),
            gmail_thread_id: message.thread_id.clone().unwrap_or_default(),
            notion_page_id: page_id.clone(),
            checksum: content_checksum(&normalized),
            user_id: account.user_id.clone(),
            mail_account_id: account.id.clone(),
            mapping_id: Some(mapping.id.clone()),
        };
        db.create_link(&link)
            .map_err(|e| IngestError::new("link", e))?;
    }

    Ok(page_id)
}

/// Hex SHA-256 over the normalized content, recorded with the link for later
/// change detection.
fn content_checksum(normalized: &NormalizedMessage) -> String {
    let seed = format!("{}::{}", normalized.subject, normalized.body_text);
    let digest = ring::digest::digest(&ring::digest::SHA256, seed.as_bytes());
    hex_encode(digest.as_ref())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Resolves the Notion client for one mapping. Catch-up fans out across
/// mappings that may pin different workspaces, so each mapping gets its own
/// credentials.
pub trait DestinationResolver {
    fn resolve(&self, mapping: &Mapping) -> Result<Rc<dyn DestinationApi>>;
}

/// Incremental catch-up from the stored history cursor. Every enabled
/// mapping of the account is checked against each added message's labels;
/// a message can materialize into several databases. Per-message failures
/// are logged and skipped; the cursor always advances. `pushed_cursor` is
/// the history id carried by a push notification, used to seed the baseline
/// and as the fallback cursor when the mailbox reports no fresher one.
pub async fn process_history_for_account(
    db: &Database,
    mailbox: &dyn MailboxApi,
    destinations: &dyn DestinationResolver,
    account: &MailAccount,
    push_topic: Option<&str>,
    pushed_cursor: Option<&str>,
) -> Result<CatchUpOutcome> {
    let state = db
        .watch_state(&account.id)?
        .context("mail account disappeared during catch-up")?;

    let Some(cursor) = state.history_id else {
        // First contact: record the pushed position (or the mailbox's
        // current one), no backfill.
        let seed = match pushed_cursor {
            Some(pushed) => pushed.to_string(),
            None => mailbox
                .get_profile_history_id()
                .await
                .context("read mailbox profile for baseline cursor")?,
        };
        db.patch_watch_state(
            &account.id,
            WatchStatePatch {
                history_id: Some(seed.clone()),
                ..WatchStatePatch::default()
            },
        )?;
        info!(account = %account.id, cursor = %seed, "recorded baseline history cursor");
        return Ok(CatchUpOutcome::Baseline { history_id: seed });
    };

    let mut added_ids: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut latest_cursor: Option<String> = None;
    let mut page_token: Option<String> = None;

    loop {
        let page = match mailbox.list_history(&cursor, page_token.as_deref()).await {
            Ok(page) => page,
            Err(MailboxError::StaleCursor) => {
                return reset_stale_cursor(db, mailbox, account, push_topic, pushed_cursor).await;
            }
            Err(error) => return Err(error.into()),
        };

        if let Some(history_id) = page.history_id {
            latest_cursor = Some(history_id);
        }
        for record in page.history.unwrap_or_default() {
            for added in record.messages_added.unwrap_or_default() {
                if seen.insert(added.message.id.clone()) {
                    added_ids.push(added.message.id);
                }
            }
        }

        page_token = page.next_page_token;
        if page_token.is_none() {
            break;
        }
    }

    let mappings = db.enabled_mappings_for_account(&account.user_id, &account.id)?;
    let mut materialized = 0usize;

    if !added_ids.is_empty() && !mappings.is_empty() {
        let labels = mailbox
            .list_labels()
            .await
            .context("list labels for catch-up")?;
        let catalog = LabelCatalog::new(&labels);

        // Each mapping writes through its own workspace credentials; a
        // mapping whose credentials cannot be resolved is skipped, not
        // fatal for the run.
        let mut targets: Vec<(&Mapping, Rc<dyn DestinationApi>)> = Vec::new();
        for mapping in &mappings {
            match destinations.resolve(mapping) {
                Ok(destination) => targets.push((mapping, destination)),
                Err(error) => {
                    warn!(
                        mapping = %mapping.id,
                        "skipping mapping, destination unavailable: {error}"
                    );
                }
            }
        }

        let mut schema_ready: HashSet<String> = HashSet::new();
        for message_id in &added_ids {
            let metadata = match mailbox.get_message_metadata(message_id).await {
                Ok(metadata) => metadata,
                Err(error) => {
                    warn!(message = %message_id, "skipping added message, metadata fetch failed: {error}");
                    continue;
                }
            };
            let message_labels = metadata.label_ids.unwrap_or_default();

            for (mapping, destination) in &targets {
                if !mapping::mapping_matches(&mapping.label_ids, &message_labels) {
                    continue;
                }
                if schema_ready.insert(mapping.id.clone()) {
                    if let Err(error) =
                        destination.ensure_schema(&mapping.notion_database_id).await
                    {
                        warn!(
                            mapping = %mapping.id,
                            "skipping mapping, schema preparation failed: {error}"
                        );
                        schema_ready.remove(&mapping.id);
                        continue;
                    }
                }

                match ingest_message(
                    db,
                    mailbox,
                    destination.as_ref(),
                    account,
                    mapping,
                    &catalog,
                    message_id,
                    None,
                )
                .await
                {
                    Ok(_) => materialized += 1,
                    Err(ingest_error) => {
                        warn!(
                            message = %message_id,
                            mapping = %mapping.id,
                            step = ingest_error.step,
                            "message skipped during catch-up: {}",
                            ingest_error.detail
                        );
                    }
                }
            }
        }
    }

    if let Some(new_cursor) = latest_cursor.or_else(|| pushed_cursor.map(str::to_string)) {
        db.patch_watch_state(
            &account.id,
            WatchStatePatch {
                history_id: Some(new_cursor),
                ..WatchStatePatch::default()
            },
        )?;
    }

    debug!(
        account = %account.id,
        added = added_ids.len(),
        materialized,
        "history catch-up finished"
    );
    Ok(CatchUpOutcome::Applied {
        added: added_ids.len(),
        materialized,
    })
}

/// A stale cursor cannot be diffed against; re-register the watch (when a
/// topic is configured) and jump the cursor forward. Messages in the gap are
/// not backfilled. The new cursor is the watch response's history id when it
/// carries one, else the pushed one, else the mailbox profile's — a value is
/// always stored, so the next run never re-enters the reset path for the
/// same staleness.
async fn reset_stale_cursor(
    db: &Database,
    mailbox: &dyn MailboxApi,
    account: &MailAccount,
    push_topic: Option<&str>,
    pushed_cursor: Option<&str>,
) -> Result<CatchUpOutcome> {
    warn!(account = %account.id, "history cursor is stale, resetting without backfill");

    let watch_cursor = match push_topic {
        Some(topic) => {
            let watch = mailbox
                .start_watch(topic)
                .await
                .context("re-register watch after stale cursor")?;
            db.patch_watch_state(
                &account.id,
                WatchStatePatch {
                    watch_active: Some(true),
                    watch_expires_at: watch
                        .expiration
                        .as_deref()
                        .and_then(|raw| raw.parse::<i64>().ok()),
                    ..WatchStatePatch::default()
                },
            )?;
            watch.history_id
        }
        None => None,
    };

    let new_cursor = match watch_cursor.or_else(|| pushed_cursor.map(str::to_string)) {
        Some(cursor) => cursor,
        None => mailbox
            .get_profile_history_id()
            .await
            .context("read mailbox profile after stale cursor")?,
    };
    db.patch_watch_state(
        &account.id,
        WatchStatePatch {
            history_id: Some(new_cursor.clone()),
            ..WatchStatePatch::default()
        },
    )?;

    Ok(CatchUpOutcome::Reset {
        history_id: new_cursor,
    })
}

/// Register a push watch and persist its cursor and expiry.
pub async fn start_watch(
    db: &Database,
    mailbox: &dyn MailboxApi,
    account: &MailAccount,
    topic: &str,
) -> Result<()> {
    let watch = mailbox
        .start_watch(topic)
        .await
        .context("register gmail push watch")?;
    db.patch_watch_state(
        &account.id,
        WatchStatePatch {
            history_id: watch.history_id.clone(),
            watch_active: Some(true),
            watch_expires_at: watch
                .expiration
                .as_deref()
                .and_then(|raw| raw.parse::<i64>().ok()),
        },
    )?;
    info!(account = %account.id, cursor = ?watch.history_id, "push watch registered");
    Ok(())
}

/// Deactivate a push watch. The local flag is cleared even when the remote
/// stop call fails, so a half-dead watch cannot wedge the account.
pub async fn stop_watch(
    db: &Database,
    mailbox: &dyn MailboxApi,
    account: &MailAccount,
) -> Result<()> {
    let stop_result = mailbox.stop_watch().await;
    db.patch_watch_state(
        &account.id,
        WatchStatePatch {
            watch_active: Some(false),
            ..WatchStatePatch::default()
        },
    )?;
    if let Err(error) = stop_result {
        warn!(account = %account.id, "remote watch stop failed, local state cleared: {error}");
    } else {
        info!(account = %account.id, "push watch stopped");
    }
    Ok(())
}

/// Build a new mapping row, resolving configured label names to ids for the
/// catch-up matcher. Unresolvable names are a hard error with suggestions.
pub async fn build_mapping(
    mailbox: &dyn MailboxApi,
    user_id: &str,
    mail_account_id: Option<&str>,
    notion_account_id: Option<&str>,
    notion_database_id: &str,
    label_names: &[String],
) -> Result<Mapping> {
    let mut label_ids = Vec::with_capacity(label_names.len());
    if !label_names.is_empty() {
        let labels: Vec<GmailLabel> = mailbox
            .list_labels()
            .await
            .context("list labels to resolve mapping filter")?;
        for name in label_names {
            let id = mapping::resolve_label_id(&labels, name)
                .map_err(|e| anyhow::anyhow!("{e}; close matches: {}", e.suggestions.join(", ")))?;
            label_ids.push(id);
        }
    }

    Ok(Mapping {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        mail_account_id: mail_account_id.map(str::to_string),
        notion_account_id: notion_account_id.map(str::to_string),
        notion_database_id: notion_database_id.to_string(),
        labels: label_names.to_vec(),
        label_ids,
        enabled: true,
    })
}

#[cfg(test)]
mod tests {
    use super::{hex_encode, DEFAULT_POLL_DAYS, MAX_POLL_DAYS, MIN_POLL_DAYS};

    #[test]
    fn checksum_hex_is_lowercase_and_stable() {
        assert_eq!(hex_encode(&[0x00, 0xff, 0x1a]), "00ff1a");
    }

    #[test]
    fn poll_window_bounds() {
        assert_eq!(DEFAULT_POLL_DAYS.clamp(MIN_POLL_DAYS, MAX_POLL_DAYS), 7);
        assert_eq!(0i64.clamp(MIN_POLL_DAYS, MAX_POLL_DAYS), 1);
        assert_eq!(10_000i64.clamp(MIN_POLL_DAYS, MAX_POLL_DAYS), 365);
    }
}

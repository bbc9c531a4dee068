//! Notion REST client: database schema reconciliation and page upserts for
//! materialized messages.

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::extract::Enriched;
use crate::normalize::NormalizedMessage;

const NOTION_API_BASE: &str = "https://api.notion.com/v1";
const NOTION_VERSION: &str = "2022-06-28";
const TEXT_PROPERTY_MAX_LEN: usize = 200;

#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("notion api request failed: status={status} body={body}")]
    Http { status: StatusCode, body: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Destination surface the orchestrator writes through. Tests substitute an
/// in-memory fake.
#[async_trait(?Send)]
pub trait DestinationApi {
    /// Add any missing required properties to the target database. The title
    /// property is never created or modified here.
    async fn ensure_schema(&self, database_id: &str) -> Result<(), DestinationError>;

    /// Create a page, or update `page_id` when one is already linked.
    /// Returns the page id.
    async fn upsert_record(
        &self,
        database_id: &str,
        page_id: Option<&str>,
        normalized: &NormalizedMessage,
        enriched: &Enriched,
    ) -> Result<String, DestinationError>;
}

#[derive(Debug, Clone)]
pub struct NotionClient {
    http: Client,
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct NotionDatabase {
    properties: HashMap<String, NotionProperty>,
}

#[derive(Debug, Deserialize)]
struct NotionProperty {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct NotionPage {
    id: String,
}

impl NotionClient {
    pub fn new(access_token: &str) -> Self {
        Self {
            http: Client::new(),
            access_token: access_token.to_string(),
        }
    }

    async fn get_database(&self, database_id: &str) -> Result<NotionDatabase, DestinationError> {
        let url = format!("{NOTION_API_BASE}/databases/{database_id}");
        let body = self.request(self.http.get(&url)).await?;
        serde_json::from_str(&body)
            .context("decode notion database")
            .map_err(DestinationError::Other)
    }

    async fn request(&self, builder: reqwest::RequestBuilder) -> Result<String, DestinationError> {
        let response = builder
            .bearer_auth(&self.access_token)
            .header("Notion-Version", NOTION_VERSION)
            .send()
            .await
            .context("notion api request")?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("read notion api response body")?;
        if !status.is_success() {
            return Err(DestinationError::Http { status, body });
        }
        Ok(body)
    }
}

#[async_trait(?Send)]
impl DestinationApi for NotionClient {
    async fn ensure_schema(&self, database_id: &str) -> Result<(), DestinationError> {
        let database = self.get_database(database_id).await?;
        let missing = missing_properties(&database.properties);
        if missing.is_empty() {
            return Ok(());
        }

        debug!(
            database = database_id,
            count = missing.len(),
            "adding missing notion database properties"
        );
        let url = format!("{NOTION_API_BASE}/databases/{database_id}");
        let payload = json!({ "properties": Value::Object(missing) });
        self.request(self.http.patch(&url).json(&payload)).await?;
        Ok(())
    }

    async fn upsert_record(
        &self,
        database_id: &str,
        page_id: Option<&str>,
        normalized: &NormalizedMessage,
        enriched: &Enriched,
    ) -> Result<String, DestinationError> {
        let database = self.get_database(database_id).await?;
        let title_key = title_property_key(&database.properties);
        let properties = build_properties(&title_key, normalized, enriched);

        let body = match page_id {
            Some(page_id) => {
                let url = format!("{NOTION_API_BASE}/pages/{page_id}");
                self.request(
                    self.http
                        .patch(&url)
                        .json(&json!({ "properties": properties })),
                )
                .await?
            }
            None => {
                let url = format!("{NOTION_API_BASE}/pages");
                self.request(self.http.post(&url).json(&json!({
                    "parent": { "database_id": database_id },
                    "properties": properties,
                })))
                .await?
            }
        };

        let page: NotionPage = serde_json::from_str(&body)
            .context("decode notion page")
            .map_err(DestinationError::Other)?;
        Ok(page.id)
    }
}

/// Required non-title properties and their Notion types.
const REQUIRED_PROPERTIES: &[(&str, &str)] = &[
    ("From", "rich_text"),
    ("Date", "date"),
    ("Labels", "multi_select"),
    ("Amount", "number"),
    ("Currency", "rich_text"),
    ("Invoice", "rich_text"),
    ("PO", "rich_text"),
    ("Due", "date"),
    ("Vendor", "rich_text"),
    ("Confidence", "number"),
];

fn missing_properties(existing: &HashMap<String, NotionProperty>) -> Map<String, Value> {
    let mut out = Map::new();
    for (name, kind) in REQUIRED_PROPERTIES {
        if existing.contains_key(*name) {
            continue;
        }
        let definition = match *kind {
            "multi_select" => json!({ "multi_select": { "options": [] } }),
            other => json!({ other: {} }),
        };
        out.insert((*name).to_string(), definition);
    }
    out
}

/// The database's own title property name, whatever the user called it.
fn title_property_key(properties: &HashMap<String, NotionProperty>) -> String {
    properties
        .iter()
        .find(|(_, prop)| prop.kind == "title")
        .map(|(name, _)| name.clone())
        .unwrap_or_else(|| "Name".to_string())
}

pub fn build_properties(
    title_key: &str,
    normalized: &NormalizedMessage,
    enriched: &Enriched,
) -> Map<String, Value> {
    let mut properties = Map::new();

    properties.insert(
        title_key.to_string(),
        json!({ "title": [{ "text": { "content": truncate(&normalized.subject) } }] }),
    );
    properties.insert(
        "From".to_string(),
        rich_text_value(&truncate(&normalized.from)),
    );
    if let Some(date_iso) = epoch_ms_to_iso(normalized.date_epoch_ms) {
        properties.insert("Date".to_string(), json!({ "date": { "start": date_iso } }));
    }
    if !normalized.labels.is_empty() {
        let options: Vec<Value> = normalized
            .labels
            .iter()
            .map(|label| json!({ "name": label }))
            .collect();
        properties.insert("Labels".to_string(), json!({ "multi_select": options }));
    }

    if let Some(amount) = enriched.amount {
        properties.insert("Amount".to_string(), json!({ "number": amount }));
    }
    if let Some(currency) = &enriched.currency {
        properties.insert("Currency".to_string(), rich_text_value(currency));
    }
    if let Some(invoice) = &enriched.invoice {
        properties.insert("Invoice".to_string(), rich_text_value(&truncate(invoice)));
    }
    if let Some(po) = &enriched.po {
        properties.insert("PO".to_string(), rich_text_value(&truncate(po)));
    }
    if let Some(due_iso) = &enriched.due_iso {
        properties.insert("Due".to_string(), json!({ "date": { "start": due_iso } }));
    }
    if let Some(vendor) = &enriched.vendor {
        properties.insert("Vendor".to_string(), rich_text_value(&truncate(vendor)));
    }
    properties.insert(
        "Confidence".to_string(),
        json!({ "number": enriched.confidence }),
    );

    properties
}

fn rich_text_value(text: &str) -> Value {
    json!({ "rich_text": [{ "text": { "content": text } }] })
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= TEXT_PROPERTY_MAX_LEN {
        text.to_string()
    } else {
        text.chars().take(TEXT_PROPERTY_MAX_LEN).collect()
    }
}

fn epoch_ms_to_iso(epoch_ms: i64) -> Option<String> {
    if epoch_ms == 0 {
        return None;
    }
    Utc.timestamp_millis_opt(epoch_ms)
        .single()
        .map(|datetime| datetime.to_rfc3339())
}

/// Resolve the Notion integration token for direct CLI use when no stored
/// workspace connection exists yet.
pub fn token_from_env() -> Result<String> {
    std::env::var("MAILSINK_NOTION_TOKEN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| anyhow!("missing notion token (MAILSINK_NOTION_TOKEN)"))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::extract::extract;
    use crate::normalize::NormalizedMessage;

    use super::{
        build_properties, missing_properties, title_property_key, truncate, NotionProperty,
    };

    fn props(entries: &[(&str, &str)]) -> HashMap<String, NotionProperty> {
        entries
            .iter()
            .map(|(name, kind)| {
                (
                    name.to_string(),
                    NotionProperty {
                        kind: kind.to_string(),
                    },
                )
            })
            .collect()
    }

    fn sample_message() -> NormalizedMessage {
        NormalizedMessage {
            subject: "Invoice #INV-2024-001 from Acme".to_string(),
            from: "billing@acme.com".to_string(),
            date_epoch_ms: 1_700_000_000_000,
            labels: vec!["Invoices".to_string()],
            body_text: "Amount due: $1,234.56. Due 2024-12-01.".to_string(),
        }
    }

    #[test]
    fn schema_reconciliation_skips_existing_and_title() {
        let existing = props(&[("Task name", "title"), ("From", "rich_text"), ("Due", "date")]);
        let missing = missing_properties(&existing);

        assert!(!missing.contains_key("From"));
        assert!(!missing.contains_key("Due"));
        assert!(!missing.contains_key("Task name"));
        assert!(missing.contains_key("Amount"));
        assert_eq!(missing["Labels"]["multi_select"]["options"], serde_json::json!([]));
    }

    #[test]
    fn title_key_follows_database_schema() {
        let custom = props(&[("Task name", "title"), ("From", "rich_text")]);
        assert_eq!(title_property_key(&custom), "Task name");

        let none = props(&[("From", "rich_text")]);
        assert_eq!(title_property_key(&none), "Name");
    }

    #[test]
    fn properties_include_extraction_when_present() {
        let message = sample_message();
        let enriched = extract(&message.subject, &message.body_text, &message.from);
        let properties = build_properties("Name", &message, &enriched);

        assert_eq!(
            properties["Name"]["title"][0]["text"]["content"],
            "Invoice #INV-2024-001 from Acme"
        );
        assert_eq!(properties["Amount"]["number"], 1234.56);
        assert_eq!(properties["Currency"]["rich_text"][0]["text"]["content"], "USD");
        assert_eq!(properties["Due"]["date"]["start"], "2024-12-01");
        assert_eq!(properties["Labels"]["multi_select"][0]["name"], "Invoices");
        assert!(properties.contains_key("Confidence"));
    }

    #[test]
    fn empty_extraction_omits_optional_fields_but_keeps_confidence() {
        let message = NormalizedMessage {
            subject: "hello".to_string(),
            from: "".to_string(),
            date_epoch_ms: 0,
            labels: vec![],
            body_text: "just words".to_string(),
        };
        let enriched = extract(&message.subject, &message.body_text, &message.from);
        let properties = build_properties("Name", &message, &enriched);

        assert!(!properties.contains_key("Amount"));
        assert!(!properties.contains_key("Due"));
        assert!(!properties.contains_key("Date"));
        assert!(!properties.contains_key("Labels"));
        assert!(properties.contains_key("Confidence"));
    }

    #[test]
    fn long_text_is_cut_at_character_boundaries() {
        let long = "é".repeat(300);
        let cut = truncate(&long);
        assert_eq!(cut.chars().count(), 200);
    }
}

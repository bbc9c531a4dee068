//! Gmail REST API payload types.
//!
//! `#[allow(dead_code)]` on some structs: fields are deserialized from the
//! API but not all are read directly — they exist to match the API contract.

use std::collections::HashMap;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct GmailLabel {
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub label_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GmailLabelList {
    #[serde(default)]
    pub labels: Vec<GmailLabel>,
}

/// Label id → (name, type) lookup built from one labels.list call and reused
/// across an entire poll invocation.
#[derive(Debug, Clone, Default)]
pub struct LabelCatalog {
    by_id: HashMap<String, (String, String)>,
}

impl LabelCatalog {
    pub fn new(labels: &[GmailLabel]) -> Self {
        let by_id = labels
            .iter()
            .map(|l| {
                (
                    l.id.clone(),
                    (l.name.clone(), l.label_type.clone().unwrap_or_default()),
                )
            })
            .collect();
        Self { by_id }
    }

    pub fn name(&self, id: &str) -> Option<&str> {
        self.by_id.get(id).map(|(name, _)| name.as_str())
    }

    pub fn is_user_label(&self, id: &str) -> bool {
        self.by_id
            .get(id)
            .is_some_and(|(_, label_type)| label_type == "user")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[allow(dead_code)]
pub struct GmailMessageList {
    pub messages: Option<Vec<GmailMessageStub>>,
    #[serde(rename = "nextPageToken")]
    pub next_page_token: Option<String>,
    #[serde(rename = "resultSizeEstimate")]
    pub result_size_estimate: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GmailMessageStub {
    pub id: String,
    #[serde(rename = "threadId", default)]
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[allow(dead_code)]
pub struct GmailMessage {
    pub id: String,
    #[serde(rename = "threadId", default)]
    pub thread_id: Option<String>,
    #[serde(rename = "labelIds")]
    pub label_ids: Option<Vec<String>>,
    pub snippet: Option<String>,
    pub payload: Option<GmailPayload>,
    #[serde(rename = "internalDate")]
    pub internal_date: Option<String>,
    #[serde(rename = "historyId")]
    pub history_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GmailPayload {
    #[serde(rename = "mimeType")]
    pub mime_type: Option<String>,
    pub headers: Option<Vec<GmailHeader>>,
    pub body: Option<GmailBody>,
    pub parts: Option<Vec<GmailPayload>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GmailHeader {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[allow(dead_code)]
pub struct GmailBody {
    pub size: Option<u64>,
    pub data: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GmailHistoryList {
    pub history: Option<Vec<GmailHistoryRecord>>,
    #[serde(rename = "nextPageToken")]
    pub next_page_token: Option<String>,
    #[serde(rename = "historyId", default)]
    pub history_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[allow(dead_code)]
pub struct GmailHistoryRecord {
    pub id: Option<String>,
    #[serde(rename = "messagesAdded")]
    pub messages_added: Option<Vec<GmailHistoryMessageAdded>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GmailHistoryMessageAdded {
    pub message: GmailMessageStub,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GmailWatchResponse {
    #[serde(rename = "historyId", default)]
    pub history_id: Option<String>,
    #[serde(default)]
    pub expiration: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GmailProfile {
    #[serde(rename = "emailAddress")]
    pub email_address: String,
    #[serde(rename = "historyId")]
    pub history_id: String,
}

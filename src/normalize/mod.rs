//! Converts a raw Gmail message into the canonical record the rest of the
//! pipeline consumes.

use std::sync::LazyLock;

use base64::alphabet;
use base64::engine::general_purpose::GeneralPurpose;
use base64::engine::{DecodePaddingMode, GeneralPurposeConfig};
use base64::Engine;
use chrono::Utc;
use regex::Regex;

use crate::gmail::api::{GmailMessage, GmailPayload, LabelCatalog};

/// Gmail pads body data inconsistently across parts; accept both.
static FORGIVING_STANDARD: LazyLock<GeneralPurpose> = LazyLock::new(|| {
    GeneralPurpose::new(
        &alphabet::STANDARD,
        GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
    )
});

static SOFT_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"=\r?\n").expect("compile soft break regex"));
static STYLE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<style.*?</style>").expect("compile style regex"));
static SCRIPT_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script.*?</script>").expect("compile script regex"));
static LINE_BREAK_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>").expect("compile br regex"));
static BLOCK_CLOSE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</(?:p|div|li|h\d)>").expect("compile block close regex"));
static ANY_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]+>").expect("compile tag regex"));
static NBSP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"&nbsp;?").expect("compile nbsp regex"));
static TRAILING_SPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+\n").expect("compile trailing space regex"));

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedMessage {
    pub subject: String,
    pub from: String,
    pub date_epoch_ms: i64,
    pub labels: Vec<String>,
    pub body_text: String,
}

/// Normalize one full-format Gmail message. When `forced_label` is set (full
/// poll filtered on one label) the reported labels are exactly that name;
/// otherwise the message's user-type labels are resolved through the catalog.
pub fn normalize(
    message: &GmailMessage,
    catalog: &LabelCatalog,
    forced_label: Option<&str>,
) -> NormalizedMessage {
    let payload = message.payload.as_ref();

    let subject = payload
        .and_then(|p| header_value(p, "Subject"))
        .unwrap_or_default();
    let from = payload
        .and_then(|p| header_value(p, "From"))
        .unwrap_or_default();

    let date_epoch_ms = message
        .internal_date
        .as_deref()
        .and_then(|ms| ms.parse::<i64>().ok())
        .unwrap_or_else(|| Utc::now().timestamp_millis());

    let body_text = payload
        .and_then(pick_best_part)
        .map(|(data, mime)| decode_body(data, mime))
        .unwrap_or_default();

    let labels = match forced_label {
        Some(name) if !name.is_empty() => vec![name.to_string()],
        _ => message
            .label_ids
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter(|id| catalog.is_user_label(id))
            .filter_map(|id| catalog.name(id))
            .map(str::to_string)
            .collect(),
    };

    NormalizedMessage {
        subject,
        from,
        date_epoch_ms,
        labels,
        body_text,
    }
}

fn header_value(payload: &GmailPayload, name: &str) -> Option<String> {
    payload
        .headers
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.clone())
}

/// Body selection policy: first text/plain part with data, else first
/// text/html part with data, else the first part with any data, else the
/// top-level body. Top-level parts only.
fn pick_best_part(payload: &GmailPayload) -> Option<(&str, &str)> {
    if let Some(parts) = payload.parts.as_deref() {
        for wanted in ["text/plain", "text/html"] {
            if let Some(found) = parts.iter().find_map(|part| {
                (part.mime_type.as_deref() == Some(wanted))
                    .then(|| part_data(part))
                    .flatten()
            }) {
                return Some((found, wanted));
            }
        }
        if let Some(part) = parts.iter().find(|part| part_data(part).is_some()) {
            if let Some(data) = part_data(part) {
                return Some((data, part.mime_type.as_deref().unwrap_or("")));
            }
        }
    }

    payload
        .body
        .as_ref()
        .and_then(|body| body.data.as_deref())
        .filter(|data| !data.is_empty())
        .map(|data| (data, payload.mime_type.as_deref().unwrap_or("")))
}

fn part_data(part: &GmailPayload) -> Option<&str> {
    part.body
        .as_ref()
        .and_then(|body| body.data.as_deref())
        .filter(|data| !data.is_empty())
}

/// Base64url decode (`-`/`_` substituted first so both alphabets work) plus
/// quoted-printable soft-break cleanup. Failures yield an empty body.
pub fn decode_body(data: &str, mime_type: &str) -> String {
    let substituted = data.replace('-', "+").replace('_', "/");
    let Ok(bytes) = FORGIVING_STANDARD.decode(substituted.as_bytes()) else {
        return String::new();
    };
    let text = String::from_utf8_lossy(&bytes);
    let text = SOFT_BREAK.replace_all(&text, "").into_owned();

    if mime_type == "text/html" {
        html_to_text(&text)
    } else {
        text
    }
}

fn html_to_text(html: &str) -> String {
    let text = STYLE_BLOCK.replace_all(html, "");
    let text = SCRIPT_BLOCK.replace_all(&text, "");
    let text = LINE_BREAK_TAG.replace_all(&text, "\n");
    let text = BLOCK_CLOSE_TAG.replace_all(&text, "\n");
    let text = ANY_TAG.replace_all(&text, "");
    let text = NBSP.replace_all(&text, " ");
    TRAILING_SPACE.replace_all(&text, "\n").into_owned()
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    use super::{decode_body, normalize, NormalizedMessage};
    use crate::gmail::api::{
        GmailBody, GmailHeader, GmailLabel, GmailMessage, GmailPayload, LabelCatalog,
    };

    fn b64(text: &str) -> String {
        URL_SAFE_NO_PAD.encode(text.as_bytes())
    }

    fn part(mime: &str, data: Option<String>) -> GmailPayload {
        GmailPayload {
            mime_type: Some(mime.to_string()),
            headers: None,
            body: data.map(|data| GmailBody {
                size: None,
                data: Some(data),
            }),
            parts: None,
        }
    }

    fn message(payload: GmailPayload) -> GmailMessage {
        GmailMessage {
            id: "m1".to_string(),
            thread_id: Some("t1".to_string()),
            label_ids: Some(vec!["Label_7".to_string(), "INBOX".to_string()]),
            snippet: None,
            payload: Some(payload),
            internal_date: Some("1700000000000".to_string()),
            history_id: None,
        }
    }

    fn catalog() -> LabelCatalog {
        LabelCatalog::new(&[
            GmailLabel {
                id: "Label_7".to_string(),
                name: "Receipts".to_string(),
                label_type: Some("user".to_string()),
            },
            GmailLabel {
                id: "INBOX".to_string(),
                name: "INBOX".to_string(),
                label_type: Some("system".to_string()),
            },
        ])
    }

    #[test]
    fn prefers_text_plain_over_html_part() {
        let payload = GmailPayload {
            parts: Some(vec![
                part("text/html", Some(b64("<p>html body</p>"))),
                part("text/plain", Some(b64("plain body"))),
            ]),
            ..part("multipart/alternative", None)
        };
        let normalized = normalize(&message(payload), &catalog(), None);
        assert_eq!(normalized.body_text, "plain body");
    }

    #[test]
    fn falls_back_to_html_then_any_part_then_top_level() {
        let html_only = GmailPayload {
            parts: Some(vec![
                part("text/plain", None),
                part("text/html", Some(b64("<div>converted</div>"))),
            ]),
            ..part("multipart/alternative", None)
        };
        let normalized = normalize(&message(html_only), &catalog(), None);
        assert_eq!(normalized.body_text.trim(), "converted");

        let odd_part = GmailPayload {
            parts: Some(vec![part("application/json", Some(b64("{}")))]),
            ..part("multipart/mixed", None)
        };
        let normalized = normalize(&message(odd_part), &catalog(), None);
        assert_eq!(normalized.body_text, "{}");

        let top_level = part("text/plain", Some(b64("top level")));
        let normalized = normalize(&message(top_level), &catalog(), None);
        assert_eq!(normalized.body_text, "top level");
    }

    #[test]
    fn decodes_base64url_and_strips_soft_breaks() {
        let encoded = URL_SAFE_NO_PAD.encode(b"line one=\r\ncontinued");
        assert_eq!(decode_body(&encoded, "text/plain"), "line onecontinued");
        // '-' and '_' are the url-safe substitutions for '+' and '/'.
        assert!(encoded
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn html_body_is_stripped_to_text() {
        let html = "<style>p{color:red}</style><script>x()</script>\
                    <p>Hello&nbsp;there<br/>Line two</p><div>Line three</div>";
        let text = decode_body(&b64(html), "text/html");
        assert!(text.contains("Hello there"));
        assert!(text.contains("Line two"));
        assert!(text.contains("Line three"));
        assert!(!text.contains('<'));
        assert!(!text.contains("color:red"));
        assert!(!text.contains("x()"));
    }

    #[test]
    fn invalid_base64_yields_empty_body() {
        assert_eq!(decode_body("!!not base64!!", "text/plain"), "");
    }

    #[test]
    fn headers_and_labels_resolve() {
        let payload = GmailPayload {
            headers: Some(vec![
                GmailHeader {
                    name: "SUBJECT".to_string(),
                    value: "Invoice INV-1".to_string(),
                },
                GmailHeader {
                    name: "From".to_string(),
                    value: "billing@acme.com".to_string(),
                },
            ]),
            ..part("text/plain", Some(b64("body")))
        };
        let normalized = normalize(&message(payload), &catalog(), None);
        assert_eq!(normalized.subject, "Invoice INV-1");
        assert_eq!(normalized.from, "billing@acme.com");
        assert_eq!(normalized.date_epoch_ms, 1_700_000_000_000);
        // System labels are excluded; only user labels survive.
        assert_eq!(normalized.labels, vec!["Receipts".to_string()]);
    }

    #[test]
    fn forced_label_overrides_message_labels() {
        let normalized = normalize(
            &message(part("text/plain", Some(b64("x")))),
            &catalog(),
            Some("Invoices"),
        );
        assert_eq!(normalized.labels, vec!["Invoices".to_string()]);
    }

    #[test]
    fn missing_payload_normalizes_to_empty_record() {
        let mut msg = message(part("text/plain", None));
        msg.payload = None;
        msg.label_ids = None;
        let normalized = normalize(&msg, &catalog(), None);
        assert_eq!(
            NormalizedMessage {
                date_epoch_ms: normalized.date_epoch_ms,
                ..NormalizedMessage::default()
            },
            normalized
        );
    }
}

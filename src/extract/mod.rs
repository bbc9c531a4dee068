//! Rule-based field extraction from email text.
//!
//! A fixed, ordered set of pattern rules runs over `subject + "\n" + body`.
//! Every rule is independent; a hit fills one field and nudges the confidence
//! score up by a fixed increment. Missing fields stay `None`, never a
//! placeholder.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

pub mod rules;

const BASE_CONFIDENCE: f64 = 0.3;
const MAX_CONFIDENCE: f64 = 0.99;

static CURRENCY_AMOUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(USD|INR|EUR|GBP|\$|₹|€|£)\s*([0-9]{1,3}(?:,[0-9]{3})*(?:\.[0-9]{2})?)")
        .expect("compile currency regex")
});

static INVOICE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:Invoice\s*(?:No\.|#|:)?|INV[-\s#:]?)\s*([A-Za-z0-9-]{3,})")
        .expect("compile invoice regex")
});

static PURCHASE_ORDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:PO\s*(?:No\.|#|:)?|Purchase\s*Order)\s*([A-Za-z0-9-]{3,})")
        .expect("compile purchase order regex")
});

static DUE_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Due\s*(?:on\s*)?(\d{4}-\d{2}-\d{2})").expect("compile due date regex")
});

static VENDOR_DOMAIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@([A-Za-z0-9-]+)\.").expect("compile vendor regex"));

/// Structured fields pulled out of one message. Ephemeral; produced per
/// message and written straight to the destination.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Enriched {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub po: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_iso: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    pub confidence: f64,
}

/// Extract structured fields from a message. Pure; no I/O.
pub fn extract(subject: &str, body: &str, from_header: &str) -> Enriched {
    let text = format!("{subject}\n{body}");
    let mut out = Enriched {
        confidence: BASE_CONFIDENCE,
        ..Enriched::default()
    };
    let mut confidence = BASE_CONFIDENCE;

    if let Some(caps) = CURRENCY_AMOUNT.captures(&text) {
        let raw_amount = caps[2].replace(',', "");
        if let Ok(amount) = raw_amount.parse::<f64>() {
            out.amount = Some(amount);
            out.currency = Some(normalize_currency(&caps[1]));
            confidence += 0.25;
        }
    }

    if let Some(caps) = INVOICE.captures(&text) {
        out.invoice = Some(caps[1].to_string());
        confidence += 0.2;
    }

    if let Some(caps) = PURCHASE_ORDER.captures(&text) {
        out.po = Some(caps[1].to_string());
        confidence += 0.1;
    }

    if let Some(caps) = DUE_DATE.captures(&text) {
        out.due_iso = Some(caps[1].to_string());
        confidence += 0.15;
    }

    if let Some(caps) = VENDOR_DOMAIN.captures(from_header) {
        out.vendor = Some(caps[1].to_string());
        confidence += 0.1;
    }

    out.confidence = confidence.min(MAX_CONFIDENCE);
    out
}

fn normalize_currency(matched: &str) -> String {
    match matched {
        "$" => "USD".to_string(),
        "₹" => "INR".to_string(),
        "€" => "EUR".to_string(),
        "£" => "GBP".to_string(),
        code => code.to_ascii_uppercase(),
    }
}

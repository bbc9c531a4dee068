//! User-defined extraction rules for the mapping designer preview.
//!
//! Three rule kinds, each applied independently per target field against a
//! sample text. This path never touches the ingestion pipeline.

use std::collections::BTreeMap;

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};

use super::{BASE_CONFIDENCE, MAX_CONFIDENCE};

const DEFAULT_ANCHOR_WINDOW: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Regex,
    Anchor,
    Kv,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    #[serde(rename = "type")]
    pub kind: RuleKind,
    #[serde(default)]
    pub field: String,
    /// Pattern for `regex` rules; the first capture group is the value.
    #[serde(default)]
    pub pattern: Option<String>,
    /// Literal anchor string for `anchor` rules.
    #[serde(default)]
    pub anchor: Option<String>,
    /// Window length after the anchor, defaults to 100 chars.
    #[serde(default)]
    pub window: Option<usize>,
    /// Candidate key labels for `kv` rules; first hit wins.
    #[serde(default)]
    pub keys: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Preview {
    pub data: BTreeMap<String, String>,
    pub confidence: f64,
}

/// Apply user rules against a sample text. Malformed rules (no field, missing
/// payload, bad regex) are skipped rather than failing the preview.
pub fn apply_rules(sample: &str, rules: &[Rule]) -> Preview {
    let mut confidence = BASE_CONFIDENCE;
    let mut data = BTreeMap::new();

    for rule in rules {
        if rule.field.is_empty() {
            continue;
        }
        match rule.kind {
            RuleKind::Regex => {
                let Some(pattern) = rule.pattern.as_deref() else {
                    continue;
                };
                let Ok(re) = RegexBuilder::new(pattern).case_insensitive(true).build() else {
                    continue;
                };
                if let Some(value) = re.captures(sample).and_then(|c| c.get(1)) {
                    data.insert(rule.field.clone(), value.as_str().to_string());
                    confidence += 0.1;
                }
            }
            RuleKind::Anchor => {
                let Some(anchor) = rule.anchor.as_deref().filter(|a| !a.is_empty()) else {
                    continue;
                };
                let Ok(re) = RegexBuilder::new(&regex::escape(anchor))
                    .case_insensitive(true)
                    .build()
                else {
                    continue;
                };
                if let Some(found) = re.find(sample) {
                    let window = rule.window.unwrap_or(DEFAULT_ANCHOR_WINDOW);
                    let value: String = sample[found.start()..].chars().take(window).collect();
                    data.insert(rule.field.clone(), value);
                    confidence += 0.05;
                }
            }
            RuleKind::Kv => {
                let Some(keys) = rule.keys.as_deref().filter(|k| !k.is_empty()) else {
                    continue;
                };
                for key in keys {
                    let escaped = regex::escape(key);
                    let Ok(re) = RegexBuilder::new(&format!(r"{escaped}\s*[:#-]?\s*(.+)"))
                        .case_insensitive(true)
                        .build()
                    else {
                        continue;
                    };
                    if let Some(value) = re.captures(sample).and_then(|c| c.get(1)) {
                        data.insert(rule.field.clone(), value.as_str().trim().to_string());
                        confidence += 0.05;
                        break;
                    }
                }
            }
        }
    }

    Preview {
        data,
        confidence: confidence.min(MAX_CONFIDENCE),
    }
}

#[cfg(test)]
mod tests {
    use super::{apply_rules, Rule, RuleKind};

    fn rule(kind: RuleKind, field: &str) -> Rule {
        Rule {
            kind,
            field: field.to_string(),
            pattern: None,
            anchor: None,
            window: None,
            keys: None,
        }
    }

    #[test]
    fn regex_rule_captures_first_group() {
        let mut r = rule(RuleKind::Regex, "ticket");
        r.pattern = Some(r"Ticket\s+([A-Z]+-\d+)".to_string());
        let preview = apply_rules("re: ticket OPS-42 escalation", &[r]);
        assert_eq!(preview.data.get("ticket").map(String::as_str), Some("OPS-42"));
        assert!((preview.confidence - 0.4).abs() < 1e-9);
    }

    #[test]
    fn anchor_rule_takes_window_after_match() {
        let mut r = rule(RuleKind::Anchor, "total");
        r.anchor = Some("Grand Total".to_string());
        r.window = Some(18);
        let preview = apply_rules("...\ngrand total: EUR 42.00\n...", &[r]);
        assert_eq!(
            preview.data.get("total").map(String::as_str),
            Some("grand total: EUR 4")
        );
    }

    #[test]
    fn kv_rule_tries_keys_in_order_and_stops_at_first_hit() {
        let mut r = rule(RuleKind::Kv, "ref");
        r.keys = Some(vec!["Reference".to_string(), "Ref".to_string()]);
        let preview = apply_rules("Ref: ABC-9\nReference: XYZ-1", &[r]);
        // "Reference" is tried first and matches, so "Ref" is never consulted.
        assert_eq!(preview.data.get("ref").map(String::as_str), Some("XYZ-1"));
        assert!((preview.confidence - 0.35).abs() < 1e-9);
    }

    #[test]
    fn malformed_rules_are_skipped() {
        let mut bad_regex = rule(RuleKind::Regex, "x");
        bad_regex.pattern = Some("([".to_string());
        let no_field = Rule {
            field: String::new(),
            ..rule(RuleKind::Anchor, "")
        };
        let preview = apply_rules("anything", &[bad_regex, no_field]);
        assert!(preview.data.is_empty());
        assert_eq!(preview.confidence, 0.3);
    }
}

//! Decides which mappings a message qualifies for, and resolves configured
//! label names against the mailbox's actual labels.

use thiserror::Error;

use crate::gmail::api::GmailLabel;

const MAX_SUGGESTIONS: usize = 25;

/// Terminal for one mapping's poll, not for the whole batch. Carries up to 25
/// user-label names so the user can fix the configuration.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("label not found: {label}")]
pub struct LabelNotFound {
    pub label: String,
    pub suggestions: Vec<String>,
}

/// A mapping matches a message iff its label-id filter is empty (match-all)
/// or intersects the message's label ids.
pub fn mapping_matches(filter_label_ids: &[String], message_label_ids: &[String]) -> bool {
    filter_label_ids.is_empty()
        || filter_label_ids
            .iter()
            .any(|id| message_label_ids.contains(id))
}

/// Resolve a configured label name to a label id, tolerating near-matches.
/// Precedence: exact name, case-insensitive, singular/plural `s` toggle,
/// then the leaf segment after the last `/` under the same toggles.
pub fn resolve_label_id(labels: &[GmailLabel], wanted: &str) -> Result<String, LabelNotFound> {
    let find = |pred: &dyn Fn(&str) -> bool| {
        labels
            .iter()
            .find(|l| pred(&l.name))
            .map(|l| l.id.clone())
    };

    let wanted_lower = wanted.to_lowercase();
    let toggled_lower = toggle_plural(wanted).to_lowercase();

    if let Some(id) = find(&|name| name == wanted) {
        return Ok(id);
    }
    if let Some(id) = find(&|name| name.to_lowercase() == wanted_lower) {
        return Ok(id);
    }
    if let Some(id) = find(&|name| name.to_lowercase() == toggled_lower) {
        return Ok(id);
    }

    let leaf = wanted.rsplit('/').next().unwrap_or(wanted);
    let leaf_lower = leaf.to_lowercase();
    let leaf_toggled_lower = toggle_plural(leaf).to_lowercase();
    if let Some(id) = find(&|name| {
        let name_leaf = name.rsplit('/').next().unwrap_or(name).to_lowercase();
        name_leaf == leaf_lower || name_leaf == leaf_toggled_lower
    }) {
        return Ok(id);
    }

    Err(LabelNotFound {
        label: wanted.to_string(),
        suggestions: user_label_names(labels),
    })
}

fn toggle_plural(name: &str) -> String {
    match name.strip_suffix('s') {
        Some(stripped) => stripped.to_string(),
        None => format!("{name}s"),
    }
}

fn user_label_names(labels: &[GmailLabel]) -> Vec<String> {
    labels
        .iter()
        .filter(|l| l.label_type.as_deref() == Some("user"))
        .map(|l| l.name.clone())
        .take(MAX_SUGGESTIONS)
        .collect()
}

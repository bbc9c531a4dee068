//! mailsink: incremental Gmail-to-Notion sync.
//!
//! Messages are pulled from Gmail (full polls or push-driven history
//! catch-up), normalized to plain text, enriched with extracted billing
//! fields, and materialized as Notion database pages exactly once per
//! message.

pub mod extract;
pub mod gmail;
pub mod mapping;
pub mod normalize;
pub mod notion;
pub mod store;
pub mod sync;

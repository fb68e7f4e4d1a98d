//! 📡 Elasticsearch Bulk Transform, formatting documents for the bulk API's peculiar tastes 🚀🔄
//!
//! The bulk API has rules.
//!
//! Rule 1: Two lines per document. Action metadata, then document source. Always.
//! Rule 2: Newline-delimited. Not comma-separated. Not XML. NEWLINES.
//! Rule 3: The trailing newline on the whole body matters. It MATTERS.
//!
//! ## Knowledge Graph 🧠
//! - [`ElasticsearchBulk::transform_document`]: one [`PendingDocument`] → `action\nsource`
//!   (no trailing newline, that's the composer's job)
//! - [`ElasticsearchBulk::compose`]: rendered entries → a full `_bulk` body with the
//!   sacred trailing `\n`
//! - Action line fields: `_index`, `_type`, `_id` (if any), `_ttl` (if non-empty).
//!   Absent fields are omitted, not null. ES reads absent as "figure it out yourself".
//! - The timestamp rides in the source as `@timestamp`, where every dashboard looks for it.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::common::{KEY_TIMESTAMP, PendingDocument};

/// 📄 The source line: the event time up front, the payload flattened in after it.
#[derive(Serialize)]
struct BulkSource<'a> {
    #[serde(rename = "@timestamp")]
    timestamp: String,
    #[serde(flatten)]
    payload: &'a Map<String, Value>,
}

/// 📡 ElasticsearchBulk, the format whisperer for ES bulk indexing.
///
/// ```text
/// {"index":{"_index":"app-logs","_type":"log","_ttl":"7d"}}
/// {"@timestamp":"...","level":"INFO","message":"..."}
/// ```
pub(crate) struct ElasticsearchBulk;

impl ElasticsearchBulk {
    /// 🔄 Render one document into its two bulk lines.
    pub(crate) fn transform_document(doc: &PendingDocument) -> Result<String> {
        let mut the_action_metadata = Map::new();
        the_action_metadata.insert("_index".to_string(), Value::String(doc.index.clone()));
        the_action_metadata.insert("_type".to_string(), Value::String(doc.doc_type.clone()));

        // 📎 _id, ES auto-generates if absent. Technically fine, spiritually unsettling.
        if let Some(ref the_precious_identifier) = doc.id {
            the_action_metadata.insert(
                "_id".to_string(),
                Value::String(the_precious_identifier.clone()),
            );
        }

        // 🗑️ _ttl, only when someone asked documents to expire. Empty means immortal.
        if !doc.ttl.is_empty() {
            the_action_metadata.insert("_ttl".to_string(), Value::String(doc.ttl.clone()));
        }

        let the_action_serialized = serde_json::to_string(&json!({ "index": the_action_metadata }))
            .context(
                "💀 Failed to serialize bulk action metadata. \
                 The JSON that describes JSON has failed to become JSON.",
            )?;
        let the_source = BulkSource {
            timestamp: doc.timestamp.to_rfc3339(),
            payload: &doc.payload,
        };
        let the_source_serialized = serde_json::to_string(&the_source).context(
            "💀 The document source would not serialize. This one stays home, the batch goes on.",
        )?;

        Ok(format!("{}\n{}", the_action_serialized, the_source_serialized))
    }

    /// 🎼 Join rendered entries into a complete `_bulk` body.
    ///
    /// Pre-allocates from the entry sizes, appends `\n` after every entry.
    /// Empty in, empty out.
    pub(crate) fn compose(entries: &[String]) -> String {
        let estimated_size: usize = entries.iter().map(|e| e.len() + 1).sum();
        let mut payload = String::with_capacity(estimated_size);
        for entry in entries {
            payload.push_str(entry);
            payload.push('\n');
        }
        payload
    }
}

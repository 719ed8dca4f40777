//! Tiddler data model
//!
//! A tiddler is stored as two parts: its metadata, a JSON object holding
//! every field except the body, and its text. The wire form is either
//! *skinny* (metadata only) or *fat* (metadata with a `text` field).

use serde_json::{Map, Value};

use crate::storage::error::{StoreError, StoreResult};

/// Tag that forces a tiddler to be returned fat from bulk listings
pub const MACRO_TAG: &str = "$:/tags/Macro";

/// Bag name injected into every saved tiddler
pub const BAG: &str = "bag";

/// A single titled content unit
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Tiddler {
    /// The title of the tiddler
    pub key: String,
    /// Every field except the text, serialized as a JSON object
    pub meta: Vec<u8>,
    /// The body text
    pub text: String,
    /// Whether the JSON projection carries the text
    pub with_text: bool,
}

impl Tiddler {
    /// A metadata-only tiddler
    pub fn skinny(key: impl Into<String>, meta: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            meta: meta.into(),
            text: String::new(),
            with_text: false,
        }
    }

    /// A tiddler whose projection includes its text
    pub fn fat(key: impl Into<String>, meta: impl Into<Vec<u8>>, text: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            meta: meta.into(),
            text: text.into(),
            with_text: true,
        }
    }

    /// Build a tiddler from a client-supplied JSON object.
    ///
    /// The `text` field becomes the body and is removed from the metadata;
    /// the `bag` field is always set to [`BAG`].
    pub fn from_json_body(key: impl Into<String>, body: &[u8]) -> StoreResult<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(StoreError::InvalidKey);
        }

        let mut object = parse_object(body)?;
        object.insert("bag".to_string(), Value::String(BAG.to_string()));
        let text = match object.remove("text") {
            Some(Value::String(text)) => text,
            _ => String::new(),
        };
        let meta = serde_json::to_vec(&object)?;

        Ok(Self {
            key,
            meta,
            text,
            with_text: false,
        })
    }

    /// Project the tiddler to its wire form.
    ///
    /// Skinny tiddlers return the metadata verbatim. Fat tiddlers get the
    /// text merged into the metadata object.
    pub fn to_json(&self) -> StoreResult<Vec<u8>> {
        if !self.with_text {
            return Ok(self.meta.clone());
        }
        merge_snapshot(&self.meta, &self.text)
    }

    /// The revision the store embedded in the metadata, if any
    pub fn revision(&self) -> Option<u64> {
        embedded_revision(&self.meta)
    }

    /// Whether the metadata carries the macro tag
    pub fn is_macro(&self) -> bool {
        is_macro(&self.meta)
    }
}

/// One entry of a tiddler's revision history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub key: String,
    pub revision: u64,
    /// Metadata and text merged into one JSON object; `None` marks a delete
    pub snapshot: Option<Vec<u8>>,
}

impl HistoryEntry {
    pub fn is_tombstone(&self) -> bool {
        self.snapshot.is_none()
    }
}

/// Parse metadata bytes as a JSON object
pub(crate) fn parse_object(meta: &[u8]) -> StoreResult<Map<String, Value>> {
    serde_json::from_slice::<Map<String, Value>>(meta).map_err(StoreError::malformed)
}

/// Read the `revision` field embedded in stored metadata
pub(crate) fn embedded_revision(meta: &[u8]) -> Option<u64> {
    let object = parse_object(meta).ok()?;
    object.get("revision").and_then(Value::as_u64)
}

/// Embed `revision` into the metadata object
pub(crate) fn stamp_revision(meta: &[u8], revision: u64) -> StoreResult<Vec<u8>> {
    let mut object = parse_object(meta)?;
    object.insert("revision".to_string(), Value::from(revision));
    Ok(serde_json::to_vec(&object)?)
}

/// Merge metadata and text into the single object used for fat projections
/// and history snapshots
pub(crate) fn merge_snapshot(meta: &[u8], text: &str) -> StoreResult<Vec<u8>> {
    let mut object = parse_object(meta)?;
    object.insert("text".to_string(), Value::String(text.to_string()));
    Ok(serde_json::to_vec(&object)?)
}

/// Split a history snapshot back into metadata and text
pub(crate) fn split_snapshot(snapshot: &[u8]) -> StoreResult<(Vec<u8>, String)> {
    let mut object = parse_object(snapshot)?;
    let text = match object.remove("text") {
        Some(Value::String(text)) => text,
        _ => String::new(),
    };
    Ok((serde_json::to_vec(&object)?, text))
}

/// Whether the metadata mentions [`MACRO_TAG`] as a quoted JSON string.
///
/// A byte search over the stored metadata; `tags` is not parsed, so the
/// literal counts wherever it appears.
pub fn is_macro(meta: &[u8]) -> bool {
    let needle = format!("\"{MACRO_TAG}\"");
    meta.windows(needle.len()).any(|window| window == needle.as_bytes())
}

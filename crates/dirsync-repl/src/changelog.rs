//! Changelog records and their wire form.
//!
//! A remote directory exposes its changelog as ordinary entries carrying
//! `targetdn`, `changetype`, `changenumber`, `changes` and (for modify)
//! `entry`. Payloads are JSON: the full entry for add, a list of
//! `{operation, modification: {type, vals}}` objects for modify, and the
//! post-image object in `entry`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::dn::Dn;
use crate::entry::{Entry, ModOp, Modification};
use crate::error::{ReplError, Result};
use crate::query::Query;
use crate::remote::SourceId;

/// Kind of change a changelog record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    /// Entry created.
    Add,
    /// Entry attributes changed.
    Modify,
    /// Entry removed.
    Delete,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeType::Add => f.write_str("add"),
            ChangeType::Modify => f.write_str("modify"),
            ChangeType::Delete => f.write_str("delete"),
        }
    }
}

impl FromStr for ChangeType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "add" => Ok(ChangeType::Add),
            "modify" => Ok(ChangeType::Modify),
            "delete" => Ok(ChangeType::Delete),
            other => Err(format!("unrecognized change type '{}'", other)),
        }
    }
}

/// One parsed changelog record, immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    /// Remote source the record was read from.
    pub source: SourceId,
    /// Target DN as written by the remote.
    pub target_dn: String,
    /// Parsed target DN.
    pub target: Dn,
    /// Kind of change.
    pub change_type: ChangeType,
    /// Per-source monotonic sequence number.
    pub change_number: u64,
    /// Attribute changes (modify only).
    pub changes: Vec<Modification>,
    /// Full entry after the change (add, and modify when supplied).
    pub post_image: Option<Entry>,
    /// Queries whose fast pre-check accepted this record.
    pub matched_queries: Vec<Query>,
}

impl ChangeRecord {
    /// Parse a raw changelog entry.
    pub fn from_changelog_entry(source: SourceId, raw: &Entry) -> Result<Self> {
        let change_number = change_number_of(raw).ok_or_else(|| ReplError::Protocol {
            change_number: None,
            reason: format!("missing or non-numeric changenumber in {}", raw.dn),
        })?;
        let protocol = |reason: String| ReplError::Protocol {
            change_number: Some(change_number),
            reason,
        };

        let target_dn = raw
            .first("targetdn")
            .ok_or_else(|| protocol("missing targetdn".to_string()))?
            .to_string();
        let target = Dn::parse(&target_dn).map_err(|e| protocol(e.to_string()))?;
        let change_type: ChangeType = raw
            .first("changetype")
            .ok_or_else(|| protocol("missing changetype".to_string()))?
            .parse()
            .map_err(protocol)?;

        let mut changes = Vec::new();
        let mut post_image = None;
        match change_type {
            ChangeType::Add => {
                let payload = raw
                    .first("changes")
                    .ok_or_else(|| protocol("add without changes".to_string()))?;
                post_image = Some(decode_entry(&target_dn, payload).map_err(protocol)?);
            }
            ChangeType::Modify => {
                let payload = raw
                    .first("changes")
                    .ok_or_else(|| protocol("modify without changes".to_string()))?;
                changes = decode_changes(payload).map_err(protocol)?;
                if let Some(entry) = raw.first("entry") {
                    post_image = Some(decode_entry(&target_dn, entry).map_err(protocol)?);
                }
            }
            ChangeType::Delete => {}
        }

        Ok(Self {
            source,
            target_dn,
            target,
            change_type,
            change_number,
            changes,
            post_image,
            matched_queries: Vec::new(),
        })
    }
}

/// Read the `changenumber` of a raw changelog entry.
pub fn change_number_of(raw: &Entry) -> Option<u64> {
    raw.first("changenumber")?.trim().parse().ok()
}

/// Filter selecting changelog entries in `[start, end]`.
pub fn range_filter(start: u64, end: u64) -> String {
    format!("(&(changenumber>={})(changenumber<={}))", start, end)
}

/// Build a raw changelog entry; the inverse of
/// [`ChangeRecord::from_changelog_entry`].
pub fn changelog_entry(
    changelog_base: &Dn,
    change_number: u64,
    change_type: ChangeType,
    target_dn: &str,
    changes: &str,
    post_image: Option<&str>,
) -> Entry {
    let dn = changelog_base.child("changenumber", &change_number.to_string());
    let mut entry = Entry::new(dn.to_string())
        .with_attr("objectclass", ["changelogentry"])
        .with_attr("changenumber", [change_number.to_string()])
        .with_attr("changetype", [change_type.to_string()])
        .with_attr("targetdn", [target_dn])
        .with_attr("changes", [changes]);
    if let Some(post) = post_image {
        entry.set("entry", vec![post.to_string()]);
    }
    entry
}

/// Encode an entry's attributes as the JSON object used in payloads.
pub fn encode_entry(entry: &Entry) -> String {
    let map: Map<String, Value> = entry
        .attrs
        .iter()
        .map(|(k, v)| {
            (
                k.clone(),
                Value::Array(v.iter().cloned().map(Value::String).collect()),
            )
        })
        .collect();
    Value::Object(map).to_string()
}

/// Encode a modification list as the JSON array used in payloads.
pub fn encode_changes(changes: &[Modification]) -> String {
    let wire: Vec<WireChange> = changes
        .iter()
        .map(|m| WireChange {
            operation: m.op,
            modification: WireModification {
                attr: m.attr.clone(),
                vals: Some(Value::Array(
                    m.values.iter().cloned().map(Value::String).collect(),
                )),
            },
        })
        .collect();
    serde_json::to_string(&wire).unwrap_or_else(|_| "[]".to_string())
}

#[derive(Debug, Serialize, Deserialize)]
struct WireChange {
    operation: ModOp,
    modification: WireModification,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireModification {
    #[serde(rename = "type")]
    attr: String,
    #[serde(default)]
    vals: Option<Value>,
}

fn decode_entry(dn: &str, payload: &str) -> std::result::Result<Entry, String> {
    let value: Value =
        serde_json::from_str(payload).map_err(|e| format!("bad entry payload: {}", e))?;
    let object = value
        .as_object()
        .ok_or_else(|| "entry payload is not an object".to_string())?;
    let mut entry = Entry::new(dn);
    for (name, raw) in object {
        if name.eq_ignore_ascii_case("dn") {
            continue;
        }
        entry.set(name, json_values(raw)?);
    }
    Ok(entry)
}

fn decode_changes(payload: &str) -> std::result::Result<Vec<Modification>, String> {
    let value: Value =
        serde_json::from_str(payload).map_err(|e| format!("bad changes payload: {}", e))?;
    let items = match value {
        Value::Array(items) => items,
        single @ Value::Object(_) => vec![single],
        _ => return Err("changes payload is not a list".to_string()),
    };
    items
        .into_iter()
        .map(|item| -> std::result::Result<Modification, String> {
            let change: WireChange =
                serde_json::from_value(item).map_err(|e| format!("bad change: {}", e))?;
            let values = match change.modification.vals {
                Some(v) => json_values(&v)?,
                None => Vec::new(),
            };
            Ok(Modification::new(
                change.operation,
                &change.modification.attr,
                values,
            ))
        })
        .collect()
}

fn json_values(raw: &Value) -> std::result::Result<Vec<String>, String> {
    match raw {
        Value::Array(items) => items.iter().map(json_scalar).collect(),
        Value::Null => Ok(Vec::new()),
        other => Ok(vec![json_scalar(other)?]),
    }
}

fn json_scalar(raw: &Value) -> std::result::Result<String, String> {
    match raw {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(format!("unsupported attribute value {}", other)),
    }
}

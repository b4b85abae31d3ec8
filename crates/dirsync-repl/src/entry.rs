//! Directory entries and attribute modifications.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A directory entry: a DN plus multi-valued attributes. Attribute names are
/// stored lowercased.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Distinguished name as received.
    pub dn: String,
    /// Attribute name → values.
    pub attrs: BTreeMap<String, Vec<String>>,
}

impl Entry {
    /// Create an entry with no attributes.
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attrs: BTreeMap::new(),
        }
    }

    /// Builder-style attribute setter.
    pub fn with_attr<I, S>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.set(name, values.into_iter().map(Into::into).collect());
        self
    }

    /// Replace all values of an attribute. An empty list removes it.
    pub fn set(&mut self, name: &str, values: Vec<String>) {
        let key = name.to_ascii_lowercase();
        if values.is_empty() {
            self.attrs.remove(&key);
        } else {
            self.attrs.insert(key, values);
        }
    }

    /// Values of an attribute, empty if absent.
    pub fn get(&self, name: &str) -> &[String] {
        self.attrs
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// First value of an attribute.
    pub fn first(&self, name: &str) -> Option<&str> {
        self.get(name).first().map(String::as_str)
    }

    /// True if the attribute has at least one value.
    pub fn has(&self, name: &str) -> bool {
        !self.get(name).is_empty()
    }

    /// The entry's object classes.
    pub fn object_classes(&self) -> &[String] {
        self.get("objectclass")
    }

    /// Apply a list of modifications in order, returning the post-image.
    pub fn apply_changes(&self, changes: &[Modification]) -> Entry {
        let mut post = self.clone();
        for change in changes {
            change.apply_to(&mut post);
        }
        post
    }
}

/// The kind of a single attribute modification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModOp {
    /// Add values to the attribute.
    Add,
    /// Remove values, or the whole attribute when no values are given.
    Delete,
    /// Replace all values; no values removes the attribute.
    Replace,
}

/// One attribute modification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modification {
    /// Operation kind.
    pub op: ModOp,
    /// Attribute name, lowercased.
    pub attr: String,
    /// Values the operation carries.
    pub values: Vec<String>,
}

impl Modification {
    /// Create a modification.
    pub fn new<I, S>(op: ModOp, attr: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            op,
            attr: attr.to_ascii_lowercase(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Shorthand for a replace.
    pub fn replace<I, S>(attr: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(ModOp::Replace, attr, values)
    }

    /// Apply this modification to an entry in place. Values are compared
    /// case-insensitively.
    pub fn apply_to(&self, entry: &mut Entry) {
        let key = self.attr.to_ascii_lowercase();
        match self.op {
            ModOp::Replace => entry.set(&key, self.values.clone()),
            ModOp::Add => {
                let current = entry.attrs.entry(key.clone()).or_default();
                for value in &self.values {
                    if !current.iter().any(|v| v.eq_ignore_ascii_case(value)) {
                        current.push(value.clone());
                    }
                }
                if current.is_empty() {
                    entry.attrs.remove(&key);
                }
            }
            ModOp::Delete => {
                if self.values.is_empty() {
                    entry.attrs.remove(&key);
                    return;
                }
                if let Some(current) = entry.attrs.get_mut(&key) {
                    current.retain(|v| !self.values.iter().any(|d| d.eq_ignore_ascii_case(v)));
                    if current.is_empty() {
                        entry.attrs.remove(&key);
                    }
                }
            }
        }
    }
}

//! Distinguished names.
//!
//! DNs are compared in a normalized form: attribute types and values are
//! lowercased and whitespace around the `,` and `=` separators is dropped.
//! Escaped separators (`\,`, `\=`, `\+`) stay part of the value.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A DN string that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid DN '{dn}': {reason}")]
pub struct InvalidDn {
    /// The offending input.
    pub dn: String,
    /// Why it was rejected.
    pub reason: String,
}

/// One `type=value` component of a DN.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Rdn {
    /// Attribute type, lowercased.
    pub attr: String,
    /// Attribute value, lowercased, escapes preserved.
    pub value: String,
}

impl fmt::Display for Rdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.attr, self.value)
    }
}

/// A parsed, normalized distinguished name. The first RDN is the most
/// specific one; the empty DN is the root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Dn {
    rdns: Vec<Rdn>,
}

impl Dn {
    /// The root DN (no components).
    pub fn root() -> Self {
        Self { rdns: Vec::new() }
    }

    /// Parse a DN string.
    pub fn parse(input: &str) -> Result<Self, InvalidDn> {
        let invalid = |reason: &str| InvalidDn {
            dn: input.to_string(),
            reason: reason.to_string(),
        };

        if input.trim().is_empty() {
            return Ok(Self::root());
        }

        let mut rdns = Vec::new();
        for part in split_unescaped(input, ',') {
            let part = part.trim();
            if part.is_empty() {
                return Err(invalid("empty RDN"));
            }
            let mut pieces = split_unescaped(part, '=').into_iter();
            let attr = pieces.next().unwrap_or_default();
            let rest: Vec<String> = pieces.collect();
            if rest.is_empty() {
                return Err(invalid("RDN without '='"));
            }
            let attr = attr.trim();
            if attr.is_empty()
                || !attr
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == ';')
            {
                return Err(invalid("bad attribute type"));
            }
            let value = rest.join("=");
            let value = value.trim();
            if value.is_empty() {
                return Err(invalid("empty attribute value"));
            }
            rdns.push(Rdn {
                attr: attr.to_ascii_lowercase(),
                value: value.to_lowercase(),
            });
        }
        Ok(Self { rdns })
    }

    /// The components, most specific first.
    pub fn rdns(&self) -> &[Rdn] {
        &self.rdns
    }

    /// Number of components.
    pub fn len(&self) -> usize {
        self.rdns.len()
    }

    /// True for the root DN.
    pub fn is_root(&self) -> bool {
        self.rdns.is_empty()
    }

    /// The DN of the immediate parent, or `None` for the root.
    pub fn parent(&self) -> Option<Dn> {
        if self.rdns.is_empty() {
            None
        } else {
            Some(Self {
                rdns: self.rdns[1..].to_vec(),
            })
        }
    }

    /// True when `self` equals `base` or lies anywhere beneath it.
    pub fn is_within(&self, base: &Dn) -> bool {
        if self.rdns.len() < base.rdns.len() {
            return false;
        }
        let offset = self.rdns.len() - base.rdns.len();
        self.rdns[offset..] == base.rdns[..]
    }

    /// True when `self` is an immediate child of `base`.
    pub fn is_child_of(&self, base: &Dn) -> bool {
        self.rdns.len() == base.rdns.len() + 1 && self.is_within(base)
    }

    /// Prepend a component, producing a child DN.
    pub fn child(&self, attr: &str, value: &str) -> Dn {
        let mut rdns = Vec::with_capacity(self.rdns.len() + 1);
        rdns.push(Rdn {
            attr: attr.trim().to_ascii_lowercase(),
            value: value.trim().to_lowercase(),
        });
        rdns.extend(self.rdns.iter().cloned());
        Self { rdns }
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, rdn) in self.rdns.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", rdn)?;
        }
        Ok(())
    }
}

impl FromStr for Dn {
    type Err = InvalidDn;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Dn::parse(s)
    }
}

/// Normalize a DN string, falling back to a trimmed lowercase copy when it
/// does not parse.
pub fn normalize(dn: &str) -> String {
    match Dn::parse(dn) {
        Ok(parsed) => parsed.to_string(),
        Err(_) => dn.trim().to_lowercase(),
    }
}

fn split_unescaped(input: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for c in input.chars() {
        if escaped {
            current.push(c);
            escaped = false;
        } else if c == '\\' {
            current.push(c);
            escaped = true;
        } else if c == sep {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    parts.push(current);
    parts
}

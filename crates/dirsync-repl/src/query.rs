//! Replication query compiler.
//!
//! A remote source is configured with one or more LDAP-URL style path
//! fragments, `/<base-dn>??<scope>?<filter>`. Each compiles to a [`Query`]
//! describing which remote entries should be replicated.

use crate::client::Scope;
use crate::dn::Dn;
use crate::entry::Entry;
use crate::error::{ReplError, Result};
use crate::filter::Filter;

/// A compiled replication query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    /// Base DN as written in the descriptor (decoded).
    pub base_dn: String,
    /// Parsed base DN.
    pub base: Dn,
    /// Search scope; always subtree.
    pub scope: Scope,
    /// Entry filter.
    pub filter: Filter,
    /// The descriptor this query was compiled from.
    pub descriptor: String,
}

impl Query {
    /// Compile a path fragment. `base_url` is only used for error context.
    pub fn compile(base_url: &str, fragment: &str) -> Result<Self> {
        let config_err = |msg: String| ReplError::Config {
            msg: format!("query '{}' for {}: {}", fragment, base_url, msg),
        };

        let path = fragment.trim();
        let path = path.strip_prefix('/').unwrap_or(path);
        let mut parts = path.splitn(4, '?');
        let raw_dn = parts.next().unwrap_or_default();
        let _attributes = parts.next();
        let raw_scope = parts.next().unwrap_or_default();
        let raw_filter = parts.next().unwrap_or_default();

        let base_dn = decode(raw_dn).map_err(&config_err)?;
        if base_dn.trim().is_empty() {
            return Err(config_err("missing base DN".to_string()));
        }
        let base = Dn::parse(&base_dn).map_err(|e| config_err(e.to_string()))?;

        let scope = match decode(raw_scope).map_err(&config_err)?.to_ascii_lowercase().as_str() {
            "" | "sub" | "subtree" => Scope::Subtree,
            "base" | "one" | "onelevel" => {
                return Err(config_err(format!(
                    "scope '{}' is not supported, only subtree",
                    raw_scope
                )))
            }
            other => return Err(config_err(format!("unknown scope '{}'", other))),
        };

        let filter_text = decode(raw_filter).map_err(&config_err)?;
        let filter = if filter_text.trim().is_empty() {
            Filter::match_all()
        } else {
            Filter::parse(&filter_text).map_err(|e| config_err(e.to_string()))?
        };

        Ok(Self {
            base_dn: base_dn.trim().to_string(),
            base,
            scope,
            filter,
            descriptor: fragment.trim().to_string(),
        })
    }

    /// Compile a full LDAP URL such as
    /// `ldap://host:389/o=smartdc??sub?(objectclass=sdcperson)`.
    pub fn from_url(url: &str) -> Result<Self> {
        let rest = url
            .split_once("://")
            .map(|(_, rest)| rest)
            .ok_or_else(|| ReplError::Config {
                msg: format!("'{}' is not an LDAP URL", url),
            })?;
        let fragment = match rest.find('/') {
            Some(idx) => &rest[idx..],
            None => "",
        };
        Self::compile(url, fragment)
    }

    /// True when the DN is inside the query's subtree.
    pub fn contains_dn(&self, dn: &Dn) -> bool {
        dn.is_within(&self.base)
    }

    /// Authoritative check: the entry is inside the subtree and matches the
    /// filter.
    pub fn matches(&self, entry: &Entry) -> bool {
        match Dn::parse(&entry.dn) {
            Ok(dn) => self.contains_dn(&dn) && self.filter.matches(entry),
            Err(_) => false,
        }
    }
}

fn decode(raw: &str) -> std::result::Result<String, String> {
    urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .map_err(|e| format!("bad percent-encoding: {}", e))
}

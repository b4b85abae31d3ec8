//! The directory capability consumed by the replication engine.
//!
//! Both the local directory and every remote source are reached through a
//! [`DirectoryClient`]. The engine never validates directory semantics
//! itself; constraint checks belong to the implementation behind the trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::entry::{Entry, Modification};
use crate::error::DirectoryError;

/// Search scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Only the base entry.
    Base,
    /// Immediate children of the base.
    One,
    /// The base and everything beneath it.
    Subtree,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Base => f.write_str("base"),
            Scope::One => f.write_str("one"),
            Scope::Subtree => f.write_str("sub"),
        }
    }
}

/// Result alias for directory operations.
pub type DirectoryResult<T> = std::result::Result<T, DirectoryError>;

/// Search/add/modify/delete by distinguished name.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Search beneath `base`. A missing base yields an empty result.
    async fn search(&self, base: &str, scope: Scope, filter: &str) -> DirectoryResult<Vec<Entry>>;

    /// Create an entry.
    async fn add(&self, entry: &Entry) -> DirectoryResult<()>;

    /// Apply modifications to an existing entry.
    async fn modify(&self, dn: &str, changes: &[Modification]) -> DirectoryResult<()>;

    /// Remove a leaf entry.
    async fn delete(&self, dn: &str) -> DirectoryResult<()>;

    /// Fetch a single entry by DN.
    async fn get(&self, dn: &str) -> DirectoryResult<Option<Entry>> {
        let mut entries = self.search(dn, Scope::Base, "(objectclass=*)").await?;
        Ok(if entries.is_empty() {
            None
        } else {
            Some(entries.swap_remove(0))
        })
    }

    /// Release the underlying connection.
    async fn close(&self) {}
}

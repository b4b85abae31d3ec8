//! Durable replication cursors.
//!
//! Each remote source has one checkpoint entry in the local directory under a
//! configurable base DN. The entry's RDN is a SHA-256 of the source URL (and,
//! for the legacy key form, its query descriptors), so restarts find the same
//! entry without any other bookkeeping.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::client::DirectoryClient;
use crate::dn::Dn;
use crate::entry::{Entry, Modification};
use crate::error::{DirectoryError, ReplError, Result};

const OBJECT_CLASS: &str = "replcheckpoint";

/// What the checkpoint DN is derived from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKey {
    /// The source URL only.
    #[default]
    Url,
    /// The source URL followed by every query descriptor.
    UrlAndQueries,
}

/// A stored checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    /// DN of the checkpoint entry.
    pub dn: Dn,
    /// Last committed change number.
    pub change_number: u64,
    /// Source URL.
    pub url: String,
    /// Query descriptors registered with the source.
    pub queries: Vec<String>,
}

impl Checkpoint {
    fn to_entry(&self) -> Entry {
        let cn = self
            .dn
            .rdns()
            .first()
            .map(|rdn| rdn.value.clone())
            .unwrap_or_default();
        Entry::new(self.dn.to_string())
            .with_attr("objectclass", [OBJECT_CLASS])
            .with_attr("cn", [cn])
            .with_attr("changenumber", [self.change_number.to_string()])
            .with_attr("url", [self.url.clone()])
            .with_attr("query", self.queries.clone())
    }

    fn from_entry(dn: Dn, entry: &Entry) -> std::result::Result<Self, String> {
        let change_number = entry
            .first("changenumber")
            .ok_or_else(|| "checkpoint has no changenumber".to_string())?
            .trim()
            .parse()
            .map_err(|e| format!("bad changenumber: {}", e))?;
        Ok(Self {
            dn,
            change_number,
            url: entry.first("url").unwrap_or_default().to_string(),
            queries: entry.get("query").to_vec(),
        })
    }
}

/// Reads and writes checkpoints in the local directory.
pub struct CheckpointStore {
    client: Arc<dyn DirectoryClient>,
    base: Dn,
    key: CheckpointKey,
}

impl std::fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore")
            .field("base", &self.base.to_string())
            .field("key", &self.key)
            .finish()
    }
}

impl CheckpointStore {
    /// Store checkpoints beneath `base` through `client`.
    pub fn new(client: Arc<dyn DirectoryClient>, base: Dn, key: CheckpointKey) -> Self {
        Self { client, base, key }
    }

    /// Container DN.
    pub fn base(&self) -> &Dn {
        &self.base
    }

    /// Deterministic checkpoint DN for a source.
    pub fn dn_for(&self, url: &str, queries: &[String]) -> Dn {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        if self.key == CheckpointKey::UrlAndQueries {
            for query in queries {
                hasher.update(query.as_bytes());
            }
        }
        self.base.child("cn", &hex::encode(hasher.finalize()))
    }

    /// Look up the checkpoint for a source.
    pub async fn get(&self, url: &str, queries: &[String]) -> Result<Option<Checkpoint>> {
        let dn = self.dn_for(url, queries);
        let entry = self
            .client
            .get(&dn.to_string())
            .await
            .map_err(|e| Self::local_error(url, e))?;
        match entry {
            Some(entry) => Checkpoint::from_entry(dn, &entry)
                .map(Some)
                .map_err(|reason| ReplError::Checkpoint {
                    url: url.to_string(),
                    reason,
                }),
            None => Ok(None),
        }
    }

    /// Return the stored change number, creating the checkpoint at 0 if it
    /// does not exist yet. A concurrent create is resolved by re-reading.
    pub async fn ensure(&self, url: &str, queries: &[String]) -> Result<u64> {
        if let Some(checkpoint) = self.get(url, queries).await? {
            debug!(source = %url, change_number = checkpoint.change_number, "Checkpoint found");
            return Ok(checkpoint.change_number);
        }

        let checkpoint = Checkpoint {
            dn: self.dn_for(url, queries),
            change_number: 0,
            url: url.to_string(),
            queries: queries.to_vec(),
        };
        let entry = checkpoint.to_entry();
        let mut result = self.client.add(&entry).await;
        if let Err(DirectoryError::NoSuchObject { .. }) = result {
            self.ensure_base(url).await?;
            result = self.client.add(&entry).await;
        }

        match result {
            Ok(()) => {
                info!(source = %url, dn = %checkpoint.dn, "Created checkpoint");
                Ok(0)
            }
            Err(DirectoryError::AlreadyExists { .. })
            | Err(DirectoryError::ConstraintViolation { .. }) => {
                debug!(source = %url, "Checkpoint created concurrently, re-reading");
                self.get(url, queries)
                    .await?
                    .map(|c| c.change_number)
                    .ok_or_else(|| ReplError::Checkpoint {
                        url: url.to_string(),
                        reason: "checkpoint vanished after a concurrent create".to_string(),
                    })
            }
            Err(e) => Err(Self::local_error(url, e)),
        }
    }

    /// Persist a new change number. A missing checkpoint entry is fatal for
    /// the source.
    pub async fn set(&self, url: &str, queries: &[String], change_number: u64) -> Result<()> {
        let dn = self.dn_for(url, queries).to_string();
        let change = Modification::replace("changenumber", [change_number.to_string()]);
        match self.client.modify(&dn, &[change]).await {
            Ok(()) => {
                debug!(source = %url, change_number, "Checkpoint advanced");
                Ok(())
            }
            Err(DirectoryError::NoSuchObject { .. }) => Err(ReplError::Checkpoint {
                url: url.to_string(),
                reason: format!("checkpoint entry {} no longer exists", dn),
            }),
            Err(e) if e.is_connection() => Err(ReplError::connection("local", e)),
            Err(e) => Err(ReplError::Apply {
                source_url: url.to_string(),
                dn,
                change_number,
                reason: format!("checkpoint write failed: {}", e),
            }),
        }
    }

    async fn ensure_base(&self, url: &str) -> Result<()> {
        let Some(rdn) = self.base.rdns().first() else {
            return Ok(());
        };
        let object_class = match rdn.attr.as_str() {
            "o" => "organization",
            "ou" => "organizationalunit",
            _ => "extensibleobject",
        };
        let container = Entry::new(self.base.to_string())
            .with_attr("objectclass", [object_class])
            .with_attr(&rdn.attr, [rdn.value.clone()]);
        match self.client.add(&container).await {
            Ok(()) => {
                info!(dn = %self.base, "Created checkpoint container");
                Ok(())
            }
            Err(DirectoryError::AlreadyExists { .. }) => Ok(()),
            Err(e) => {
                warn!(dn = %self.base, error = %e, "Failed to create checkpoint container");
                Err(Self::local_error(url, e))
            }
        }
    }

    fn local_error(url: &str, err: DirectoryError) -> ReplError {
        if err.is_connection() {
            ReplError::connection("local", err)
        } else {
            ReplError::Checkpoint {
                url: url.to_string(),
                reason: err.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryDirectory, WriteKind};

    const URL: &str = "ldap://remote:389";

    fn store(dir: Arc<MemoryDirectory>, key: CheckpointKey) -> CheckpointStore {
        CheckpointStore::new(dir, Dn::parse("o=replcheckpoints").unwrap(), key)
    }

    fn queries() -> Vec<String> {
        vec!["/o=smartdc??sub?(objectclass=sdcperson)".to_string()]
    }

    mod keys {
        use super::*;

        #[test]
        fn test_dn_is_deterministic() {
            let s = store(Arc::new(MemoryDirectory::new("local")), CheckpointKey::Url);
            assert_eq!(s.dn_for(URL, &queries()), s.dn_for(URL, &[]));
            assert_ne!(s.dn_for(URL, &[]), s.dn_for("ldap://other:389", &[]));
            let dn = s.dn_for(URL, &[]);
            assert!(dn.is_child_of(s.base()));
            assert_eq!(dn.rdns()[0].value.len(), 64);
        }

        #[test]
        fn test_legacy_key_includes_queries() {
            let s = store(Arc::new(MemoryDirectory::new("local")), CheckpointKey::UrlAndQueries);
            assert_ne!(s.dn_for(URL, &queries()), s.dn_for(URL, &[]));
        }
    }

    mod lifecycle {
        use super::*;

        #[tokio::test]
        async fn test_ensure_creates_container_and_entry() {
            let dir = Arc::new(MemoryDirectory::new("local"));
            let s = store(dir.clone(), CheckpointKey::Url);
            assert_eq!(s.get(URL, &queries()).await.unwrap(), None);
            assert_eq!(s.ensure(URL, &queries()).await.unwrap(), 0);
            assert!(dir.contains("o=replcheckpoints"));

            let checkpoint = s.get(URL, &queries()).await.unwrap().unwrap();
            assert_eq!(checkpoint.change_number, 0);
            assert_eq!(checkpoint.url, URL);
            assert_eq!(checkpoint.queries, queries());
        }

        #[tokio::test]
        async fn test_set_then_get() {
            let dir = Arc::new(MemoryDirectory::new("local"));
            let s = store(dir, CheckpointKey::Url);
            s.ensure(URL, &queries()).await.unwrap();
            s.set(URL, &queries(), 42).await.unwrap();
            assert_eq!(s.ensure(URL, &queries()).await.unwrap(), 42);
        }

        /// Lets a competing writer create the checkpoint between our read
        /// and our add.
        struct Racing {
            inner: Arc<MemoryDirectory>,
            winner: Entry,
        }

        #[async_trait::async_trait]
        impl DirectoryClient for Racing {
            async fn search(
                &self,
                base: &str,
                scope: crate::client::Scope,
                filter: &str,
            ) -> crate::client::DirectoryResult<Vec<Entry>> {
                self.inner.search(base, scope, filter).await
            }

            async fn add(&self, entry: &Entry) -> crate::client::DirectoryResult<()> {
                if entry.dn == self.winner.dn {
                    self.inner.seed([self.winner.clone()]);
                    return Err(DirectoryError::ConstraintViolation {
                        dn: entry.dn.clone(),
                        msg: "duplicate".to_string(),
                    });
                }
                self.inner.add(entry).await
            }

            async fn modify(
                &self,
                dn: &str,
                changes: &[Modification],
            ) -> crate::client::DirectoryResult<()> {
                self.inner.modify(dn, changes).await
            }

            async fn delete(&self, dn: &str) -> crate::client::DirectoryResult<()> {
                self.inner.delete(dn).await
            }
        }

        #[tokio::test]
        async fn test_concurrent_create_rereads() {
            let dir = Arc::new(MemoryDirectory::new("local"));
            dir.seed([Entry::new("o=replcheckpoints").with_attr("objectclass", ["organization"])]);
            let dn = store(dir.clone(), CheckpointKey::Url).dn_for(URL, &[]);
            let winner = Checkpoint {
                dn: dn.clone(),
                change_number: 7,
                url: URL.to_string(),
                queries: vec![],
            }
            .to_entry();
            let racing = Arc::new(Racing { inner: dir, winner });
            let s = CheckpointStore::new(racing, Dn::parse("o=replcheckpoints").unwrap(), CheckpointKey::Url);
            assert_eq!(s.ensure(URL, &[]).await.unwrap(), 7);
        }

        #[tokio::test]
        async fn test_failed_create_is_reported() {
            let dir = Arc::new(MemoryDirectory::new("local"));
            let s = store(dir.clone(), CheckpointKey::Url);
            dir.fail_next(
                Some(WriteKind::Add),
                DirectoryError::Other {
                    code: 50,
                    msg: "insufficient access".to_string(),
                },
            );
            assert!(matches!(
                s.ensure(URL, &[]).await.unwrap_err(),
                ReplError::Checkpoint { .. }
            ));
        }
    }

    mod failures {
        use super::*;

        #[tokio::test]
        async fn test_set_on_deleted_checkpoint_is_fatal() {
            let dir = Arc::new(MemoryDirectory::new("local"));
            let s = store(dir.clone(), CheckpointKey::Url);
            s.ensure(URL, &[]).await.unwrap();
            dir.delete(&s.dn_for(URL, &[]).to_string()).await.unwrap();
            let err = s.set(URL, &[], 3).await.unwrap_err();
            assert!(matches!(err, ReplError::Checkpoint { .. }));
        }

        #[tokio::test]
        async fn test_disconnected_local_is_connection_error() {
            let dir = Arc::new(MemoryDirectory::new("local"));
            let s = store(dir.clone(), CheckpointKey::Url);
            dir.disconnect();
            assert!(s.ensure(URL, &[]).await.unwrap_err().is_connection());
            assert!(s.set(URL, &[], 1).await.unwrap_err().is_connection());
        }

        #[tokio::test]
        async fn test_corrupt_checkpoint() {
            let dir = Arc::new(MemoryDirectory::new("local"));
            let s = store(dir.clone(), CheckpointKey::Url);
            dir.seed([Entry::new(s.dn_for(URL, &[]).to_string())
                .with_attr("objectclass", [OBJECT_CLASS])
                .with_attr("changenumber", ["many"])]);
            assert!(matches!(
                s.get(URL, &[]).await.unwrap_err(),
                ReplError::Checkpoint { .. }
            ));
        }
    }
}

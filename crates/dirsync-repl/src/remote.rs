//! Remote sources: bounded changelog polls against one remote directory.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};

use crate::changelog::{change_number_of, range_filter, ChangeRecord, ChangeType};
use crate::client::{DirectoryClient, Scope};
use crate::dn::Dn;
use crate::error::{ReplError, Result};
use crate::query::Query;

/// Identifier of a registered remote source, assigned in registration order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SourceId(pub usize);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source-{}", self.0)
    }
}

/// Outcome of one poll.
#[derive(Debug, Clone, Default)]
pub struct PollResult {
    /// Records that passed the fast pre-check, in change-number order.
    pub records: Vec<ChangeRecord>,
    /// Greatest change number seen in the page, matched or not.
    pub highest_seen: Option<u64>,
    /// Number of changelog entries returned.
    pub entries_seen: usize,
    /// Entries dropped as malformed.
    pub malformed: usize,
}

/// One remote directory and the queries replicated from it.
pub struct RemoteSource {
    id: SourceId,
    url: String,
    queries: Vec<Query>,
    client: Arc<dyn DirectoryClient>,
    changelog_base: Dn,
}

impl fmt::Debug for RemoteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSource")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("queries", &self.queries.len())
            .finish()
    }
}

impl RemoteSource {
    /// Create a source. `queries` must be non-empty.
    pub fn new(
        id: SourceId,
        url: impl Into<String>,
        queries: Vec<Query>,
        client: Arc<dyn DirectoryClient>,
        changelog_base: Dn,
    ) -> Result<Self> {
        let url = url.into();
        if queries.is_empty() {
            return Err(ReplError::Config {
                msg: format!("remote {} has no queries", url),
            });
        }
        Ok(Self {
            id,
            url,
            queries,
            client,
            changelog_base,
        })
    }

    /// Source id.
    pub fn id(&self) -> SourceId {
        self.id
    }

    /// Remote URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Compiled queries.
    pub fn queries(&self) -> &[Query] {
        &self.queries
    }

    /// Descriptors of the compiled queries, as configured.
    pub fn descriptors(&self) -> Vec<String> {
        self.queries.iter().map(|q| q.descriptor.clone()).collect()
    }

    /// Drop the remote connection.
    pub async fn close(&self) {
        self.client.close().await;
    }

    /// Fetch changelog entries numbered `[start, end]` and keep those that
    /// pass the fast pre-check of at least one query.
    pub async fn poll(&self, start: u64, end: u64) -> Result<PollResult> {
        let base = self.changelog_base.to_string();
        let mut raw = self
            .client
            .search(&base, Scope::One, &range_filter(start, end))
            .await
            .map_err(|e| ReplError::connection(&self.url, e))?;
        raw.sort_by_key(|entry| change_number_of(entry).unwrap_or(0));

        let mut result = PollResult {
            entries_seen: raw.len(),
            ..PollResult::default()
        };
        for entry in &raw {
            let Some(number) = change_number_of(entry) else {
                error!(source = %self.url, dn = %entry.dn, "Skipping changelog entry without a change number");
                result.malformed += 1;
                continue;
            };
            result.highest_seen = Some(result.highest_seen.map_or(number, |h| h.max(number)));

            let mut record = match ChangeRecord::from_changelog_entry(self.id, entry) {
                Ok(record) => record,
                Err(e) => {
                    error!(source = %self.url, change_number = number, error = %e, "Dropping malformed changelog entry");
                    result.malformed += 1;
                    continue;
                }
            };

            record.matched_queries = self
                .queries
                .iter()
                .filter(|q| Self::pre_check(q, &record))
                .cloned()
                .collect();
            if record.matched_queries.is_empty() {
                continue;
            }
            debug!(
                source = %self.url,
                change_number = number,
                dn = %record.target_dn,
                change_type = %record.change_type,
                "Matched changelog record"
            );
            result.records.push(record);
        }
        Ok(result)
    }

    /// Cheap match test on the remote's view of the record. Modify and delete
    /// are re-checked against the local pre-image when applied, so a modify
    /// that rewrites `objectclass` always passes: its post-image may have left
    /// the filter while the pre-image still matches.
    fn pre_check(query: &Query, record: &ChangeRecord) -> bool {
        if !query.contains_dn(&record.target) {
            return false;
        }
        match record.change_type {
            ChangeType::Add => record
                .post_image
                .as_ref()
                .is_some_and(|post| query.filter.matches(post)),
            ChangeType::Modify => {
                Self::touches_object_class(record)
                    || record
                        .post_image
                        .as_ref()
                        .map_or(true, |post| query.filter.object_classes_permit(post))
            }
            ChangeType::Delete => true,
        }
    }

    fn touches_object_class(record: &ChangeRecord) -> bool {
        record
            .changes
            .iter()
            .any(|m| m.attr.eq_ignore_ascii_case("objectclass"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::{changelog_entry, encode_changes};
    use crate::entry::{Entry, Modification};
    use crate::memory::MemoryDirectory;

    const URL: &str = "ldap://remote:389";

    fn remote() -> Arc<MemoryDirectory> {
        let dir = MemoryDirectory::new("remote").with_changelog("cn=changelog");
        dir.seed([
            Entry::new("o=smartdc").with_attr("objectclass", ["organization"]),
            Entry::new("ou=users,o=smartdc").with_attr("objectclass", ["organizationalunit"]),
            Entry::new("o=other").with_attr("objectclass", ["organization"]),
        ]);
        Arc::new(dir)
    }

    fn source(dir: Arc<MemoryDirectory>, fragments: &[&str]) -> RemoteSource {
        let queries = fragments
            .iter()
            .map(|f| Query::compile(URL, f).unwrap())
            .collect();
        RemoteSource::new(
            SourceId(0),
            URL,
            queries,
            dir,
            Dn::parse("cn=changelog").unwrap(),
        )
        .unwrap()
    }

    fn person(uid: &str) -> Entry {
        Entry::new(format!("uid={},ou=users,o=smartdc", uid))
            .with_attr("objectclass", ["sdcperson"])
            .with_attr("uid", [uid])
    }

    mod filtering {
        use super::*;

        #[tokio::test]
        async fn test_add_matched_on_post_image() {
            let dir = remote();
            dir.add(&person("alice")).await.unwrap();
            dir.add(&Entry::new("cn=grp,ou=users,o=smartdc").with_attr("objectclass", ["groupofuniquenames"]))
                .await
                .unwrap();
            let src = source(dir, &["/o=smartdc??sub?(objectclass=sdcperson)"]);
            let result = src.poll(1, 100).await.unwrap();
            assert_eq!(result.entries_seen, 2);
            assert_eq!(result.highest_seen, Some(2));
            assert_eq!(result.records.len(), 1);
            assert_eq!(result.records[0].change_number, 1);
            assert_eq!(result.records[0].matched_queries.len(), 1);
        }

        #[tokio::test]
        async fn test_out_of_subtree_is_skipped_but_counted() {
            let dir = remote();
            dir.add(&Entry::new("cn=x,o=other").with_attr("objectclass", ["sdcperson"]))
                .await
                .unwrap();
            let src = source(dir, &["/o=smartdc"]);
            let result = src.poll(1, 100).await.unwrap();
            assert!(result.records.is_empty());
            assert_eq!(result.highest_seen, Some(1));
        }

        #[tokio::test]
        async fn test_modify_uses_object_class_pre_check() {
            let dir = remote();
            dir.add(&person("alice")).await.unwrap();
            dir.modify(
                "uid=alice,ou=users,o=smartdc",
                &[Modification::replace("mail", ["a@example.com"])],
            )
            .await
            .unwrap();
            // uid does not match, but only objectclass is checked remotely.
            let src = source(dir, &["/o=smartdc??sub?(&(objectclass=sdcperson)(uid=bob))"]);
            let result = src.poll(1, 100).await.unwrap();
            assert_eq!(result.records.len(), 1);
            assert_eq!(result.records[0].change_type, ChangeType::Modify);
        }

        #[tokio::test]
        async fn test_modify_with_wrong_object_class_is_skipped() {
            let dir = remote();
            dir.add(&Entry::new("cn=grp,ou=users,o=smartdc").with_attr("objectclass", ["groupofuniquenames"]))
                .await
                .unwrap();
            dir.modify("cn=grp,ou=users,o=smartdc", &[Modification::replace("description", ["x"])])
                .await
                .unwrap();
            let src = source(dir, &["/o=smartdc??sub?(objectclass=sdcperson)"]);
            let result = src.poll(2, 2).await.unwrap();
            assert!(result.records.is_empty());
            assert_eq!(result.highest_seen, Some(2));
        }

        #[tokio::test]
        async fn test_object_class_change_passes_pre_check() {
            let dir = remote();
            dir.add(&person("alice")).await.unwrap();
            dir.modify(
                "uid=alice,ou=users,o=smartdc",
                &[Modification::replace("objectclass", ["retired"])],
            )
            .await
            .unwrap();
            // The post-image fails the filter; the local pre-image decides.
            let src = source(dir, &["/o=smartdc??sub?(objectclass=sdcperson)"]);
            let result = src.poll(2, 2).await.unwrap();
            assert_eq!(result.records.len(), 1);
            assert_eq!(result.records[0].change_type, ChangeType::Modify);
        }

        #[tokio::test]
        async fn test_object_class_change_outside_subtree_is_skipped() {
            let dir = remote();
            dir.add(&Entry::new("cn=x,o=other").with_attr("objectclass", ["sdcperson"]))
                .await
                .unwrap();
            dir.modify("cn=x,o=other", &[Modification::replace("objectclass", ["retired"])])
                .await
                .unwrap();
            let src = source(dir, &["/o=smartdc??sub?(objectclass=sdcperson)"]);
            let result = src.poll(2, 2).await.unwrap();
            assert!(result.records.is_empty());
        }

        #[tokio::test]
        async fn test_delete_matches_on_dn_alone() {
            let dir = remote();
            dir.add(&person("alice")).await.unwrap();
            dir.delete("uid=alice,ou=users,o=smartdc").await.unwrap();
            let src = source(dir, &["/o=smartdc??sub?(objectclass=sdcperson)"]);
            let result = src.poll(2, 2).await.unwrap();
            assert_eq!(result.records.len(), 1);
            assert_eq!(result.records[0].change_type, ChangeType::Delete);
        }

        #[tokio::test]
        async fn test_records_flag_every_matching_query() {
            let dir = remote();
            dir.add(&person("alice")).await.unwrap();
            let src = source(dir, &["/o=smartdc", "/ou=users,o=smartdc??sub?(uid=alice)", "/o=other"]);
            let result = src.poll(1, 1).await.unwrap();
            assert_eq!(result.records[0].matched_queries.len(), 2);
        }
    }

    mod ranges {
        use super::*;

        #[tokio::test]
        async fn test_range_bounds_are_inclusive() {
            let dir = remote();
            for uid in ["a", "b", "c", "d"] {
                dir.add(&person(uid)).await.unwrap();
            }
            let src = source(dir, &["/o=smartdc"]);
            let result = src.poll(2, 3).await.unwrap();
            let numbers: Vec<u64> = result.records.iter().map(|r| r.change_number).collect();
            assert_eq!(numbers, vec![2, 3]);
            assert_eq!(result.highest_seen, Some(3));
        }

        #[tokio::test]
        async fn test_empty_range() {
            let dir = remote();
            let src = source(dir, &["/o=smartdc"]);
            let result = src.poll(1, 10).await.unwrap();
            assert_eq!(result.entries_seen, 0);
            assert_eq!(result.highest_seen, None);
        }

        #[tokio::test]
        async fn test_results_are_sorted() {
            let dir = remote();
            let base = Dn::parse("cn=changelog").unwrap();
            let changes = encode_changes(&[Modification::replace("mail", ["x"])]);
            for n in [12u64, 10, 11] {
                dir.append_changelog(changelog_entry(
                    &base,
                    n,
                    ChangeType::Modify,
                    "uid=a,ou=users,o=smartdc",
                    &changes,
                    None,
                ));
            }
            let src = source(dir, &["/o=smartdc"]);
            let result = src.poll(10, 20).await.unwrap();
            let numbers: Vec<u64> = result.records.iter().map(|r| r.change_number).collect();
            assert_eq!(numbers, vec![10, 11, 12]);
        }
    }

    mod failures {
        use super::*;

        #[tokio::test]
        async fn test_malformed_entry_advances_highest_seen() {
            let dir = remote();
            let base = Dn::parse("cn=changelog").unwrap();
            dir.append_changelog(changelog_entry(
                &base,
                5,
                ChangeType::Add,
                "uid=a,ou=users,o=smartdc",
                "{broken",
                None,
            ));
            let src = source(dir, &["/o=smartdc"]);
            let result = src.poll(1, 10).await.unwrap();
            assert!(result.records.is_empty());
            assert_eq!(result.malformed, 1);
            assert_eq!(result.highest_seen, Some(5));
        }

        #[tokio::test]
        async fn test_disconnected_remote_is_connection_error() {
            let dir = remote();
            dir.disconnect();
            let src = source(dir, &["/o=smartdc"]);
            let err = src.poll(1, 10).await.unwrap_err();
            assert!(err.is_connection());
        }

        #[test]
        fn test_no_queries_rejected() {
            let err = RemoteSource::new(
                SourceId(0),
                URL,
                vec![],
                remote(),
                Dn::parse("cn=changelog").unwrap(),
            )
            .unwrap_err();
            assert!(matches!(err, ReplError::Config { .. }));
        }
    }
}

//! Applying changelog records to the local directory.
//!
//! Adds are written as-is. Deletes and modifies are re-evaluated against the
//! entry currently held locally, read fresh for every record, because the
//! local directory can change independently of replication.

use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::changelog::{ChangeRecord, ChangeType};
use crate::client::DirectoryClient;
use crate::entry::{Entry, Modification};
use crate::error::{DirectoryError, ReplError, Result};

/// Why a record caused no local write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoOpReason {
    /// The target does not exist locally.
    Absent,
    /// The local entry is not matched by any query of the source.
    NotOwned,
    /// Neither the pre-image nor the post-image matches.
    Unmatched,
    /// The delete hit an entry that still has children; the pending child
    /// deletes finish the subtree.
    HasChildren,
    /// The local entry already reflects the record; it was delivered before.
    AlreadyApplied,
}

impl fmt::Display for NoOpReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            NoOpReason::Absent => "absent locally",
            NoOpReason::NotOwned => "not matched by any query",
            NoOpReason::Unmatched => "neither pre- nor post-image matches",
            NoOpReason::HasChildren => "entry still has children",
            NoOpReason::AlreadyApplied => "change already present locally",
        };
        f.write_str(text)
    }
}

/// What applying a record did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Local entry created.
    Added,
    /// Local entry modified.
    Modified,
    /// Local entry removed.
    Deleted,
    /// Nothing written.
    NoOp(NoOpReason),
}

impl ApplyOutcome {
    /// True when the local directory was written.
    pub fn is_write(&self) -> bool {
        !matches!(self, ApplyOutcome::NoOp(_))
    }
}

/// Action chosen for a modify record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyAction {
    /// Apply the change list to the local entry.
    Modify,
    /// Remove the local entry; it left the replicated set.
    Delete,
    /// Create the entry from the post-image; it entered the replicated set.
    Add,
    /// Leave the local directory alone.
    NoOp,
}

/// The modify conflict matrix. `pre_matches` is ignored when the entry is
/// absent locally.
pub fn resolve_modify(local_present: bool, pre_matches: bool, post_matches: bool) -> ModifyAction {
    match (local_present, pre_matches, post_matches) {
        (true, true, true) => ModifyAction::Modify,
        (true, true, false) => ModifyAction::Delete,
        (true, false, true) => ModifyAction::Modify,
        (true, false, false) => ModifyAction::NoOp,
        (false, _, true) => ModifyAction::Add,
        (false, _, false) => ModifyAction::NoOp,
    }
}

/// Applies records to the local directory.
pub struct Resolver {
    local: Arc<dyn DirectoryClient>,
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver").finish_non_exhaustive()
    }
}

impl Resolver {
    /// Write through `local`.
    pub fn new(local: Arc<dyn DirectoryClient>) -> Self {
        Self { local }
    }

    /// Apply one record. `source_url` is used for error context.
    pub async fn apply(&self, record: &ChangeRecord, source_url: &str) -> Result<ApplyOutcome> {
        let outcome = match record.change_type {
            ChangeType::Add => self.apply_add(record, source_url).await,
            ChangeType::Delete => self.apply_delete(record, source_url).await,
            ChangeType::Modify => self.apply_modify(record, source_url).await,
        }?;
        debug!(
            source = %source_url,
            dn = %record.target_dn,
            change_number = record.change_number,
            change_type = %record.change_type,
            outcome = ?outcome,
            "Applied record"
        );
        Ok(outcome)
    }

    async fn apply_add(&self, record: &ChangeRecord, source_url: &str) -> Result<ApplyOutcome> {
        let Some(post) = record.post_image.as_ref() else {
            return Err(ReplError::Protocol {
                change_number: Some(record.change_number),
                reason: "add record without an entry".to_string(),
            });
        };
        self.add_entry(record, post, source_url).await
    }

    async fn apply_delete(&self, record: &ChangeRecord, source_url: &str) -> Result<ApplyOutcome> {
        let Some(local) = self.fetch(record, source_url).await? else {
            return Ok(ApplyOutcome::NoOp(NoOpReason::Absent));
        };
        if !Self::any_match(record, &local) {
            return Ok(ApplyOutcome::NoOp(NoOpReason::NotOwned));
        }
        self.delete_entry(record, source_url).await
    }

    async fn apply_modify(&self, record: &ChangeRecord, source_url: &str) -> Result<ApplyOutcome> {
        let local = self.fetch(record, source_url).await?;
        let (pre_matches, post) = match local.as_ref() {
            Some(pre) => (Self::any_match(record, pre), Some(pre.apply_changes(&record.changes))),
            None => (false, record.post_image.clone()),
        };
        let post_matches = post.as_ref().is_some_and(|p| Self::any_match(record, p));

        match resolve_modify(local.is_some(), pre_matches, post_matches) {
            ModifyAction::Modify => match (local.as_ref(), post.as_ref()) {
                (Some(pre), Some(post)) if pre.attrs == post.attrs => {
                    Ok(ApplyOutcome::NoOp(NoOpReason::AlreadyApplied))
                }
                _ => self.modify_entry(record, source_url).await,
            },
            ModifyAction::Delete => self.delete_entry(record, source_url).await,
            ModifyAction::Add => match post {
                Some(post) => self.add_entry(record, &post, source_url).await,
                None => Ok(ApplyOutcome::NoOp(NoOpReason::Absent)),
            },
            ModifyAction::NoOp if local.is_none() => Ok(ApplyOutcome::NoOp(NoOpReason::Absent)),
            ModifyAction::NoOp => Ok(ApplyOutcome::NoOp(NoOpReason::Unmatched)),
        }
    }

    async fn add_entry(&self, record: &ChangeRecord, post: &Entry, source_url: &str) -> Result<ApplyOutcome> {
        let mut entry = post.clone();
        entry.dn = record.target_dn.clone();
        match self.local.add(&entry).await {
            Ok(()) => Ok(ApplyOutcome::Added),
            Err(DirectoryError::AlreadyExists { .. }) => {
                let existing = self.fetch(record, source_url).await?;
                if existing.is_some_and(|e| e.attrs == entry.attrs) {
                    debug!(
                        source = %source_url,
                        dn = %record.target_dn,
                        change_number = record.change_number,
                        "Entry already present with identical attributes"
                    );
                    Ok(ApplyOutcome::NoOp(NoOpReason::AlreadyApplied))
                } else {
                    Err(Self::local_error(
                        record,
                        source_url,
                        DirectoryError::AlreadyExists { dn: entry.dn },
                    ))
                }
            }
            Err(e) => Err(Self::local_error(record, source_url, e)),
        }
    }

    /// Write the record's change list. A value-level rejection means the
    /// local entry drifted between our read and the write; the touched
    /// attributes are then rewritten from a fresh read.
    async fn modify_entry(&self, record: &ChangeRecord, source_url: &str) -> Result<ApplyOutcome> {
        match self.local.modify(&record.target_dn, &record.changes).await {
            Ok(()) => Ok(ApplyOutcome::Modified),
            Err(
                err @ (DirectoryError::AttributeOrValueExists { .. }
                | DirectoryError::NoSuchAttribute { .. }),
            ) => {
                let Some(current) = self.fetch(record, source_url).await? else {
                    return Ok(ApplyOutcome::NoOp(NoOpReason::Absent));
                };
                let post = current.apply_changes(&record.changes);
                if post.attrs == current.attrs {
                    return Ok(ApplyOutcome::NoOp(NoOpReason::AlreadyApplied));
                }
                warn!(
                    source = %source_url,
                    dn = %record.target_dn,
                    change_number = record.change_number,
                    error = %err,
                    "Change list rejected, replacing the touched attributes"
                );
                let mut replaced: Vec<&str> = Vec::new();
                let mut changes = Vec::new();
                for change in &record.changes {
                    if replaced.contains(&change.attr.as_str()) {
                        continue;
                    }
                    replaced.push(&change.attr);
                    changes.push(Modification::replace(&change.attr, post.get(&change.attr).to_vec()));
                }
                self.local
                    .modify(&record.target_dn, &changes)
                    .await
                    .map_err(|e| Self::local_error(record, source_url, e))?;
                Ok(ApplyOutcome::Modified)
            }
            Err(e) => Err(Self::local_error(record, source_url, e)),
        }
    }

    async fn delete_entry(&self, record: &ChangeRecord, source_url: &str) -> Result<ApplyOutcome> {
        match self.local.delete(&record.target_dn).await {
            Ok(()) => Ok(ApplyOutcome::Deleted),
            Err(DirectoryError::NoSuchObject { .. }) => Ok(ApplyOutcome::NoOp(NoOpReason::Absent)),
            Err(DirectoryError::NotAllowedOnNonLeaf { .. }) => {
                warn!(
                    source = %source_url,
                    dn = %record.target_dn,
                    change_number = record.change_number,
                    "Entry still has children, leaving it for the pending child deletes"
                );
                Ok(ApplyOutcome::NoOp(NoOpReason::HasChildren))
            }
            Err(e) => Err(Self::local_error(record, source_url, e)),
        }
    }

    async fn fetch(&self, record: &ChangeRecord, source_url: &str) -> Result<Option<Entry>> {
        self.local
            .get(&record.target_dn)
            .await
            .map_err(|e| Self::local_error(record, source_url, e))
    }

    fn any_match(record: &ChangeRecord, entry: &Entry) -> bool {
        record.matched_queries.iter().any(|q| q.matches(entry))
    }

    fn local_error(record: &ChangeRecord, source_url: &str, err: DirectoryError) -> ReplError {
        match err {
            e if e.is_connection() => ReplError::connection("local", e),
            DirectoryError::AlreadyExists { .. } | DirectoryError::ConstraintViolation { .. } => {
                ReplError::Conflict {
                    source_url: source_url.to_string(),
                    dn: record.target_dn.clone(),
                    change_number: record.change_number,
                    reason: err.to_string(),
                }
            }
            e => ReplError::Apply {
                source_url: source_url.to_string(),
                dn: record.target_dn.clone(),
                change_number: record.change_number,
                reason: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dn::Dn;
    use crate::entry::ModOp;
    use crate::memory::{MemoryDirectory, WriteKind};
    use crate::query::Query;
    use crate::remote::SourceId;

    const URL: &str = "ldap://remote:389";
    const ALICE: &str = "uid=alice,o=smartdc";

    fn query() -> Query {
        Query::compile(URL, "/o=smartdc??sub?(objectclass=sdcperson)").unwrap()
    }

    fn person() -> Entry {
        Entry::new(ALICE)
            .with_attr("objectclass", ["sdcperson"])
            .with_attr("uid", ["alice"])
    }

    fn local() -> Arc<MemoryDirectory> {
        let dir = MemoryDirectory::new("local");
        dir.seed([Entry::new("o=smartdc").with_attr("objectclass", ["organization"])]);
        Arc::new(dir)
    }

    fn record(change_type: ChangeType, changes: Vec<Modification>, post: Option<Entry>) -> ChangeRecord {
        ChangeRecord {
            source: SourceId(0),
            target_dn: ALICE.to_string(),
            target: Dn::parse(ALICE).unwrap(),
            change_type,
            change_number: 10,
            changes,
            post_image: post,
            matched_queries: vec![query()],
        }
    }

    mod matrix {
        use super::*;

        #[test]
        fn test_table_is_total() {
            use ModifyAction::*;
            let expected = [
                ((true, true, true), Modify),
                ((true, true, false), Delete),
                ((true, false, true), Modify),
                ((true, false, false), NoOp),
                ((false, true, true), Add),
                ((false, false, true), Add),
                ((false, true, false), NoOp),
                ((false, false, false), NoOp),
            ];
            for ((present, pre, post), action) in expected {
                assert_eq!(resolve_modify(present, pre, post), action, "{:?}", (present, pre, post));
            }
        }
    }

    mod add {
        use super::*;

        #[tokio::test]
        async fn test_add_writes_post_image() {
            let dir = local();
            let resolver = Resolver::new(dir.clone());
            let outcome = resolver
                .apply(&record(ChangeType::Add, vec![], Some(person())), URL)
                .await
                .unwrap();
            assert_eq!(outcome, ApplyOutcome::Added);
            assert_eq!(dir.entry(ALICE).unwrap().first("uid"), Some("alice"));
        }

        #[tokio::test]
        async fn test_redelivered_add_is_noop() {
            let dir = local();
            dir.seed([person()]);
            let resolver = Resolver::new(dir);
            let outcome = resolver
                .apply(&record(ChangeType::Add, vec![], Some(person())), URL)
                .await
                .unwrap();
            assert_eq!(outcome, ApplyOutcome::NoOp(NoOpReason::AlreadyApplied));
        }

        #[tokio::test]
        async fn test_add_over_existing_is_conflict() {
            let dir = local();
            dir.seed([person().with_attr("uid", ["someone-else"])]);
            let resolver = Resolver::new(dir);
            let err = resolver
                .apply(&record(ChangeType::Add, vec![], Some(person())), URL)
                .await
                .unwrap_err();
            match err {
                ReplError::Conflict {
                    dn, change_number, ..
                } => {
                    assert_eq!(dn, ALICE);
                    assert_eq!(change_number, 10);
                }
                other => panic!("unexpected {:?}", other),
            }
        }

        #[tokio::test]
        async fn test_add_with_local_disconnected() {
            let dir = local();
            dir.disconnect();
            let resolver = Resolver::new(dir);
            let err = resolver
                .apply(&record(ChangeType::Add, vec![], Some(person())), URL)
                .await
                .unwrap_err();
            assert!(err.is_connection());
        }

        #[tokio::test]
        async fn test_add_missing_parent_is_apply_error() {
            let dir = Arc::new(MemoryDirectory::new("local"));
            let resolver = Resolver::new(dir);
            let err = resolver
                .apply(&record(ChangeType::Add, vec![], Some(person())), URL)
                .await
                .unwrap_err();
            assert!(matches!(err, ReplError::Apply { .. }));
        }
    }

    mod delete {
        use super::*;

        #[tokio::test]
        async fn test_delete_absent_is_noop() {
            let resolver = Resolver::new(local());
            let outcome = resolver.apply(&record(ChangeType::Delete, vec![], None), URL).await.unwrap();
            assert_eq!(outcome, ApplyOutcome::NoOp(NoOpReason::Absent));
        }

        #[tokio::test]
        async fn test_delete_unowned_is_noop() {
            let dir = local();
            dir.seed([Entry::new(ALICE).with_attr("objectclass", ["localonly"])]);
            let resolver = Resolver::new(dir.clone());
            let outcome = resolver.apply(&record(ChangeType::Delete, vec![], None), URL).await.unwrap();
            assert_eq!(outcome, ApplyOutcome::NoOp(NoOpReason::NotOwned));
            assert!(dir.contains(ALICE));
        }

        #[tokio::test]
        async fn test_delete_owned() {
            let dir = local();
            dir.seed([person()]);
            let resolver = Resolver::new(dir.clone());
            let outcome = resolver.apply(&record(ChangeType::Delete, vec![], None), URL).await.unwrap();
            assert_eq!(outcome, ApplyOutcome::Deleted);
            assert!(!dir.contains(ALICE));
        }

        #[tokio::test]
        async fn test_delete_non_leaf_tolerated() {
            let dir = local();
            dir.seed([
                person(),
                Entry::new(format!("cn=key,{}", ALICE)).with_attr("objectclass", ["sdckey"]),
            ]);
            let resolver = Resolver::new(dir.clone());
            let outcome = resolver.apply(&record(ChangeType::Delete, vec![], None), URL).await.unwrap();
            assert_eq!(outcome, ApplyOutcome::NoOp(NoOpReason::HasChildren));
            assert!(dir.contains(ALICE));
        }
    }

    mod modify {
        use super::*;

        #[tokio::test]
        async fn test_both_match_modifies() {
            let dir = local();
            dir.seed([person()]);
            let resolver = Resolver::new(dir.clone());
            let changes = vec![Modification::replace("mail", ["a@example.com"])];
            let outcome = resolver.apply(&record(ChangeType::Modify, changes, None), URL).await.unwrap();
            assert_eq!(outcome, ApplyOutcome::Modified);
            assert_eq!(dir.entry(ALICE).unwrap().first("mail"), Some("a@example.com"));
        }

        #[tokio::test]
        async fn test_redelivered_value_add_is_noop() {
            let dir = local();
            dir.seed([person().with_attr("mail", ["a@example.com"])]);
            let resolver = Resolver::new(dir.clone());
            let changes = vec![Modification::new(ModOp::Add, "mail", ["a@example.com"])];
            let outcome = resolver.apply(&record(ChangeType::Modify, changes, None), URL).await.unwrap();
            assert_eq!(outcome, ApplyOutcome::NoOp(NoOpReason::AlreadyApplied));
            assert_eq!(dir.write_count(WriteKind::Modify, ALICE), 0);
        }

        #[tokio::test]
        async fn test_redelivered_value_delete_is_noop() {
            let dir = local();
            dir.seed([person()]);
            let resolver = Resolver::new(dir.clone());
            let changes = vec![Modification::new(ModOp::Delete, "mail", ["a@example.com"])];
            let outcome = resolver.apply(&record(ChangeType::Modify, changes, None), URL).await.unwrap();
            assert_eq!(outcome, ApplyOutcome::NoOp(NoOpReason::AlreadyApplied));
        }

        #[tokio::test]
        async fn test_rejected_value_change_rewrites_touched_attributes() {
            let dir = local();
            dir.seed([person().with_attr("mail", ["old@example.com"])]);
            dir.fail_next(
                Some(WriteKind::Modify),
                DirectoryError::AttributeOrValueExists {
                    dn: ALICE.to_string(),
                    msg: "mail".to_string(),
                },
            );
            let resolver = Resolver::new(dir.clone());
            let changes = vec![
                Modification::new(ModOp::Add, "mail", ["new@example.com"]),
                Modification::new(ModOp::Delete, "mail", ["old@example.com"]),
            ];
            let outcome = resolver.apply(&record(ChangeType::Modify, changes, None), URL).await.unwrap();
            assert_eq!(outcome, ApplyOutcome::Modified);
            let entry = dir.entry(ALICE).unwrap();
            assert_eq!(entry.get("mail"), ["new@example.com".to_string()]);
            assert_eq!(entry.first("uid"), Some("alice"));
            assert_eq!(dir.write_count(WriteKind::Modify, ALICE), 1);
        }

        #[tokio::test]
        async fn test_leaving_the_filter_deletes() {
            let dir = local();
            dir.seed([person()]);
            let resolver = Resolver::new(dir.clone());
            let changes = vec![Modification::replace("objectclass", ["retired"])];
            let outcome = resolver.apply(&record(ChangeType::Modify, changes, None), URL).await.unwrap();
            assert_eq!(outcome, ApplyOutcome::Deleted);
            assert!(!dir.contains(ALICE));
        }

        #[tokio::test]
        async fn test_entering_the_filter_is_corrective_modify() {
            let dir = local();
            dir.seed([Entry::new(ALICE).with_attr("objectclass", ["pending"])]);
            let resolver = Resolver::new(dir.clone());
            let changes = vec![Modification::replace("objectclass", ["sdcperson"])];
            let outcome = resolver.apply(&record(ChangeType::Modify, changes, None), URL).await.unwrap();
            assert_eq!(outcome, ApplyOutcome::Modified);
            assert!(query().matches(&dir.entry(ALICE).unwrap()));
        }

        #[tokio::test]
        async fn test_neither_match_is_noop() {
            let dir = local();
            dir.seed([Entry::new(ALICE).with_attr("objectclass", ["localonly"])]);
            let resolver = Resolver::new(dir.clone());
            let changes = vec![Modification::replace("mail", ["x"])];
            let outcome = resolver.apply(&record(ChangeType::Modify, changes, None), URL).await.unwrap();
            assert_eq!(outcome, ApplyOutcome::NoOp(NoOpReason::Unmatched));
            assert_eq!(dir.write_count(WriteKind::Modify, ALICE), 0);
        }

        #[tokio::test]
        async fn test_absent_with_matching_post_image_adds() {
            let dir = local();
            let resolver = Resolver::new(dir.clone());
            let post = person().with_attr("mail", ["a@example.com"]);
            let changes = vec![Modification::replace("mail", ["a@example.com"])];
            let outcome = resolver
                .apply(&record(ChangeType::Modify, changes, Some(post)), URL)
                .await
                .unwrap();
            assert_eq!(outcome, ApplyOutcome::Added);
            assert_eq!(dir.entry(ALICE).unwrap().first("mail"), Some("a@example.com"));
        }

        #[tokio::test]
        async fn test_absent_with_unmatched_post_image_is_noop() {
            let dir = local();
            let resolver = Resolver::new(dir.clone());
            let post = Entry::new(ALICE).with_attr("objectclass", ["retired"]);
            let outcome = resolver
                .apply(&record(ChangeType::Modify, vec![], Some(post)), URL)
                .await
                .unwrap();
            assert_eq!(outcome, ApplyOutcome::NoOp(NoOpReason::Absent));
            assert!(!dir.contains(ALICE));
        }

        #[tokio::test]
        async fn test_pre_image_is_read_fresh() {
            let dir = local();
            dir.seed([person()]);
            let resolver = Resolver::new(dir.clone());
            // Local edit outside replication drops the entry out of the query.
            dir.seed([Entry::new(ALICE).with_attr("objectclass", ["localonly"])]);
            let changes = vec![Modification::replace("mail", ["x"])];
            let outcome = resolver.apply(&record(ChangeType::Modify, changes, None), URL).await.unwrap();
            assert_eq!(outcome, ApplyOutcome::NoOp(NoOpReason::Unmatched));
        }
    }
}

//! In-memory directory.
//!
//! Implements [`DirectoryClient`] over a DN-keyed map with the constraint
//! checks a real server applies (existing DN, missing parent, non-leaf
//! delete, duplicate or missing attribute values). It can record its own changelog, which makes it usable as a
//! replication source, and supports fault injection and simulated
//! disconnects for exercising the engine's recovery paths.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};

use crate::changelog::{changelog_entry, encode_changes, encode_entry, ChangeType};
use crate::client::{DirectoryClient, DirectoryResult, Scope};
use crate::dn::Dn;
use crate::entry::{Entry, ModOp, Modification};
use crate::error::DirectoryError;
use crate::filter::Filter;

/// Kind of write operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteKind {
    /// add
    Add,
    /// modify
    Modify,
    /// delete
    Delete,
}

/// A write that was committed to the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    /// Operation kind.
    pub kind: WriteKind,
    /// Normalized target DN.
    pub dn: String,
}

#[derive(Debug, Clone)]
struct Fault {
    kind: Option<WriteKind>,
    error: DirectoryError,
    commit_first: bool,
}

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<Dn, Entry>,
    connected: bool,
    faults: VecDeque<Fault>,
    writes: Vec<WriteRecord>,
    changelog: Option<Dn>,
    last_change_number: u64,
}

/// A directory held entirely in memory.
#[derive(Debug)]
pub struct MemoryDirectory {
    name: String,
    state: Mutex<State>,
}

impl MemoryDirectory {
    /// Create an empty, connected directory.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State {
                connected: true,
                ..State::default()
            }),
        }
    }

    /// Record a changelog under `base` for every write from now on.
    pub fn with_changelog(self, base: &str) -> Self {
        if let Ok(dn) = Dn::parse(base) {
            let mut state = self.state.lock();
            let container = Entry::new(base).with_attr("objectclass", ["changelog"]);
            state.entries.insert(dn.clone(), container);
            state.changelog = Some(dn);
        }
        self
    }

    /// Name used in error messages.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert entries without constraint checks, changelog or write log.
    pub fn seed<I: IntoIterator<Item = Entry>>(&self, entries: I) {
        let mut state = self.state.lock();
        for entry in entries {
            if let Ok(dn) = Dn::parse(&entry.dn) {
                state.entries.insert(dn, entry);
            }
        }
    }

    /// Snapshot of an entry, bypassing connection state.
    pub fn entry(&self, dn: &str) -> Option<Entry> {
        let dn = Dn::parse(dn).ok()?;
        self.state.lock().entries.get(&dn).cloned()
    }

    /// True if an entry exists at `dn`.
    pub fn contains(&self, dn: &str) -> bool {
        self.entry(dn).is_some()
    }

    /// Number of entries held (changelog included).
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// True when the directory holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries beneath `base` that are not changelog records.
    pub fn snapshot(&self, base: &str) -> BTreeMap<String, Entry> {
        let Ok(base) = Dn::parse(base) else {
            return BTreeMap::new();
        };
        let state = self.state.lock();
        state
            .entries
            .iter()
            .filter(|(dn, _)| dn.is_within(&base))
            .filter(|(dn, _)| state.changelog.as_ref().map_or(true, |cl| !dn.is_within(cl)))
            .map(|(dn, entry)| (dn.to_string(), entry.clone()))
            .collect()
    }

    /// Committed writes, oldest first.
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state.lock().writes.clone()
    }

    /// Number of committed writes of `kind` against `dn`.
    pub fn write_count(&self, kind: WriteKind, dn: &str) -> usize {
        let dn = crate::dn::normalize(dn);
        self.state
            .lock()
            .writes
            .iter()
            .filter(|w| w.kind == kind && w.dn == dn)
            .count()
    }

    /// Highest change number written to the changelog.
    pub fn last_change_number(&self) -> u64 {
        self.state.lock().last_change_number
    }

    /// Make every operation fail with a connection error.
    pub fn disconnect(&self) {
        self.state.lock().connected = false;
    }

    /// Restore connectivity.
    pub fn reconnect(&self) {
        self.state.lock().connected = true;
    }

    /// True unless [`disconnect`](Self::disconnect) is in effect.
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Fail the next write of `kind` (any write when `None`) with `error`.
    pub fn fail_next(&self, kind: Option<WriteKind>, error: DirectoryError) {
        self.state.lock().faults.push_back(Fault {
            kind,
            error,
            commit_first: false,
        });
    }

    /// Commit the next write of `kind`, then report `error` and disconnect,
    /// as when a connection drops before the reply arrives.
    pub fn drop_after_next(&self, kind: Option<WriteKind>) {
        self.state.lock().faults.push_back(Fault {
            kind,
            error: DirectoryError::Connection {
                msg: "connection reset before reply".to_string(),
            },
            commit_first: true,
        });
    }

    /// Write a raw changelog record directly.
    pub fn append_changelog(&self, entry: Entry) {
        let mut state = self.state.lock();
        if let Some(number) = crate::changelog::change_number_of(&entry) {
            state.last_change_number = state.last_change_number.max(number);
        }
        if let Ok(dn) = Dn::parse(&entry.dn) {
            state.entries.insert(dn, entry);
        }
    }

    fn take_fault(state: &mut State, kind: WriteKind) -> Option<Fault> {
        let idx = state
            .faults
            .iter()
            .position(|f| f.kind.map_or(true, |k| k == kind))?;
        state.faults.remove(idx)
    }

    fn check_connected(&self, state: &State) -> DirectoryResult<()> {
        if state.connected {
            Ok(())
        } else {
            Err(DirectoryError::Connection {
                msg: format!("{} is disconnected", self.name),
            })
        }
    }

    fn parse_dn(dn: &str) -> DirectoryResult<Dn> {
        Dn::parse(dn).map_err(|e| DirectoryError::Other {
            code: 34,
            msg: e.to_string(),
        })
    }

    /// Apply `changes` the way a server does: adding a value the attribute
    /// already holds, or removing one it lacks, fails the whole modify.
    fn checked_post_image(current: &Entry, dn: &str, changes: &[Modification]) -> DirectoryResult<Entry> {
        let mut post = current.clone();
        for change in changes {
            let held = post.get(&change.attr);
            let holds = |value: &String| held.iter().any(|h| h.eq_ignore_ascii_case(value));
            match change.op {
                ModOp::Add => {
                    if let Some(value) = change.values.iter().find(|v| holds(v)) {
                        return Err(DirectoryError::AttributeOrValueExists {
                            dn: dn.to_string(),
                            msg: format!("{} already holds {}", change.attr, value),
                        });
                    }
                }
                ModOp::Delete if change.values.is_empty() => {
                    if held.is_empty() {
                        return Err(DirectoryError::NoSuchAttribute {
                            dn: dn.to_string(),
                            msg: format!("no {} to delete", change.attr),
                        });
                    }
                }
                ModOp::Delete => {
                    if let Some(value) = change.values.iter().find(|v| !holds(v)) {
                        return Err(DirectoryError::NoSuchAttribute {
                            dn: dn.to_string(),
                            msg: format!("{} does not hold {}", change.attr, value),
                        });
                    }
                }
                ModOp::Replace => {}
            }
            change.apply_to(&mut post);
        }
        Ok(post)
    }

    fn record_change(
        state: &mut State,
        change_type: ChangeType,
        target: &str,
        changes: String,
        post: Option<String>,
    ) {
        let Some(base) = state.changelog.clone() else {
            return;
        };
        state.last_change_number += 1;
        let raw = changelog_entry(
            &base,
            state.last_change_number,
            change_type,
            target,
            &changes,
            post.as_deref(),
        );
        if let Ok(dn) = Dn::parse(&raw.dn) {
            state.entries.insert(dn, raw);
        }
    }

    /// Run a write under the fault-injection rules.
    fn write<F>(&self, kind: WriteKind, dn: &Dn, op: F) -> DirectoryResult<()>
    where
        F: FnOnce(&mut State) -> DirectoryResult<()>,
    {
        let mut state = self.state.lock();
        self.check_connected(&state)?;
        if let Some(fault) = Self::take_fault(&mut *state, kind) {
            if !fault.commit_first {
                return Err(fault.error);
            }
            op(&mut *state)?;
            state.writes.push(WriteRecord {
                kind,
                dn: dn.to_string(),
            });
            state.connected = false;
            return Err(fault.error);
        }
        op(&mut *state)?;
        state.writes.push(WriteRecord {
            kind,
            dn: dn.to_string(),
        });
        Ok(())
    }
}

#[async_trait]
impl DirectoryClient for MemoryDirectory {
    async fn search(&self, base: &str, scope: Scope, filter: &str) -> DirectoryResult<Vec<Entry>> {
        let state = self.state.lock();
        self.check_connected(&state)?;
        let base = Self::parse_dn(base)?;
        let filter = Filter::parse(filter).map_err(|e| DirectoryError::Other {
            code: 87,
            msg: e.to_string(),
        })?;
        if !base.is_root() && !state.entries.contains_key(&base) {
            return Ok(Vec::new());
        }
        Ok(state
            .entries
            .iter()
            .filter(|(dn, _)| match scope {
                Scope::Base => **dn == base,
                Scope::One => dn.is_child_of(&base),
                Scope::Subtree => dn.is_within(&base),
            })
            .filter(|(_, entry)| filter.matches(entry))
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    async fn add(&self, entry: &Entry) -> DirectoryResult<()> {
        let dn = Self::parse_dn(&entry.dn)?;
        self.write(WriteKind::Add, &dn, |state| {
            if state.entries.contains_key(&dn) {
                return Err(DirectoryError::AlreadyExists {
                    dn: entry.dn.clone(),
                });
            }
            if let Some(parent) = dn.parent() {
                if !parent.is_root() && !state.entries.contains_key(&parent) {
                    return Err(DirectoryError::NoSuchObject {
                        dn: parent.to_string(),
                    });
                }
            }
            state.entries.insert(dn.clone(), entry.clone());
            Self::record_change(state, ChangeType::Add, &entry.dn, encode_entry(entry), None);
            Ok(())
        })
    }

    async fn modify(&self, dn: &str, changes: &[Modification]) -> DirectoryResult<()> {
        let key = Self::parse_dn(dn)?;
        self.write(WriteKind::Modify, &key, |state| {
            let current = state
                .entries
                .get(&key)
                .ok_or_else(|| DirectoryError::NoSuchObject { dn: dn.to_string() })?;
            let post = Self::checked_post_image(current, dn, changes)?;
            if post.object_classes().is_empty() {
                return Err(DirectoryError::ConstraintViolation {
                    dn: dn.to_string(),
                    msg: "entry must keep an objectclass".to_string(),
                });
            }
            let post_json = encode_entry(&post);
            let target = post.dn.clone();
            state.entries.insert(key.clone(), post);
            Self::record_change(
                state,
                ChangeType::Modify,
                &target,
                encode_changes(changes),
                Some(post_json),
            );
            Ok(())
        })
    }

    async fn delete(&self, dn: &str) -> DirectoryResult<()> {
        let key = Self::parse_dn(dn)?;
        self.write(WriteKind::Delete, &key, |state| {
            let removed = state
                .entries
                .get(&key)
                .cloned()
                .ok_or_else(|| DirectoryError::NoSuchObject { dn: dn.to_string() })?;
            if state.entries.keys().any(|child| child.is_child_of(&key)) {
                return Err(DirectoryError::NotAllowedOnNonLeaf { dn: dn.to_string() });
            }
            state.entries.remove(&key);
            Self::record_change(state, ChangeType::Delete, &removed.dn, encode_entry(&removed), None);
            Ok(())
        })
    }
}

//! Common fixtures for the replication integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use dirsync_repl::{
    BackoffConfig, CheckpointKey, CheckpointStore, DirectoryClient, DirectoryResult, Dn,
    EngineConfig, Entry, MemoryDirectory, Modification, ReplEvent, ReplicationEngine, Scope,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};

pub const REMOTE_A: &str = "ldap://10.99.99.14:389";
pub const REMOTE_B: &str = "ldap://10.99.99.15:389";
pub const PEOPLE: &str = "/o=smartdc??sub?(objectclass=sdcperson)";
pub const APPROVED_PEOPLE: &str = "/o=smartdc??sub?(&(objectclass=sdcperson)(approved=true))";

/// Engine settings tuned for tests: small pages, short delays, no jitter.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        poll_interval: Duration::from_millis(100),
        page_size: 10,
        retry_delay: Duration::from_millis(50),
        backoff: BackoffConfig {
            initial_delay_ms: 10,
            max_delay_ms: 200,
            multiplier: 2.0,
            jitter: false,
        },
        ..EngineConfig::default()
    }
}

pub fn org() -> Entry {
    Entry::new("o=smartdc").with_attr("objectclass", ["organization"])
}

pub fn person(uid: &str) -> Entry {
    Entry::new(format!("uid={},o=smartdc", uid))
        .with_attr("objectclass", ["sdcperson"])
        .with_attr("uid", [uid])
}

pub fn person_dn(uid: &str) -> String {
    format!("uid={},o=smartdc", uid)
}

/// A remote directory that records its own changelog.
pub fn remote_dir(name: &str) -> Arc<MemoryDirectory> {
    let dir = MemoryDirectory::new(name).with_changelog("cn=changelog");
    dir.seed([org()]);
    Arc::new(dir)
}

/// A local directory holding only the replicated suffix.
pub fn local_dir() -> Arc<MemoryDirectory> {
    let dir = MemoryDirectory::new("local");
    dir.seed([org()]);
    Arc::new(dir)
}

pub fn queries(fragments: &[&str]) -> Vec<String> {
    fragments.iter().map(|f| f.to_string()).collect()
}

/// Checkpoint store over `local` with the default layout.
pub fn checkpoint_store(local: Arc<MemoryDirectory>) -> CheckpointStore {
    let config = EngineConfig::default();
    CheckpointStore::new(local, config.checkpoint_base_dn, CheckpointKey::Url)
}

/// Stored change number for `url`, if a checkpoint exists.
pub async fn stored_checkpoint(local: Arc<MemoryDirectory>, url: &str, fragments: &[&str]) -> Option<u64> {
    checkpoint_store(local)
        .get(url, &queries(fragments))
        .await
        .unwrap()
        .map(|c| c.change_number)
}

/// DN of the checkpoint entry for `url`.
pub fn checkpoint_dn(local: Arc<MemoryDirectory>, url: &str, fragments: &[&str]) -> Dn {
    checkpoint_store(local).dn_for(url, &queries(fragments))
}

/// Poll and apply until the engine has nothing left to do.
pub async fn drain(engine: &mut ReplicationEngine) {
    for _ in 0..10_000 {
        engine.poll_sources().await;
        if engine.state() != dirsync_repl::EngineState::Process {
            return;
        }
        while engine.process_next().await {}
    }
    panic!("engine did not settle");
}

/// Wait for the first event matching `pred`.
pub async fn wait_for<F>(rx: &mut broadcast::Receiver<ReplEvent>, mut pred: F) -> ReplEvent
where
    F: FnMut(&ReplEvent) -> bool,
{
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(60), wait)
        .await
        .expect("timed out waiting for event")
}

/// Wait until `source` reports caught up at `change_number`.
pub async fn wait_caught_up(rx: &mut broadcast::Receiver<ReplEvent>, change_number: u64) {
    wait_for(rx, |e| {
        matches!(e, ReplEvent::CaughtUp { change_number: n, .. } if *n == change_number)
    })
    .await;
}

/// Forwards to a [`MemoryDirectory`] and records every search filter.
pub struct RecordingClient {
    pub inner: Arc<MemoryDirectory>,
    pub filters: Mutex<Vec<String>>,
}

impl RecordingClient {
    pub fn new(inner: Arc<MemoryDirectory>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            filters: Mutex::new(Vec::new()),
        })
    }

    pub fn filters(&self) -> Vec<String> {
        self.filters.lock().clone()
    }
}

#[async_trait]
impl DirectoryClient for RecordingClient {
    async fn search(&self, base: &str, scope: Scope, filter: &str) -> DirectoryResult<Vec<Entry>> {
        self.filters.lock().push(filter.to_string());
        self.inner.search(base, scope, filter).await
    }

    async fn add(&self, entry: &Entry) -> DirectoryResult<()> {
        self.inner.add(entry).await
    }

    async fn modify(&self, dn: &str, changes: &[Modification]) -> DirectoryResult<()> {
        self.inner.modify(dn, changes).await
    }

    async fn delete(&self, dn: &str) -> DirectoryResult<()> {
        self.inner.delete(dn).await
    }
}

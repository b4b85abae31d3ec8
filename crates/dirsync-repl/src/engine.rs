//! The replication orchestrator.
//!
//! [`ReplicationEngine`] owns the cursor state of every remote source, the
//! shared processing queue and the engine state machine:
//!
//! ```text
//! init -> poll <-> process
//!          |          |
//!          +-> wait <-+        (manual pause or local directory loss)
//! any state -> destroyed
//! ```
//!
//! It runs as one task. Writes to the local directory happen one at a time
//! from that task, so no locking is needed around the apply path. External
//! code drives it through an [`EngineHandle`] and observes it through
//! [`ReplEvent`]s. The step methods ([`poll_sources`](ReplicationEngine::poll_sources),
//! [`process_next`](ReplicationEngine::process_next)) can also be called
//! directly when the caller owns the engine.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::backoff::{Backoff, BackoffConfig};
use crate::checkpoint::{CheckpointKey, CheckpointStore};
use crate::client::{DirectoryClient, Scope};
use crate::dn::Dn;
use crate::error::{ReplError, Result};
use crate::query::Query;
use crate::queue::ProcessingQueue;
use crate::remote::{RemoteSource, SourceId};
use crate::resolver::{ApplyOutcome, Resolver};

const EVENT_CAPACITY: usize = 1024;
const COMMAND_CAPACITY: usize = 64;

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Poll timer period.
    pub poll_interval: Duration,
    /// Change numbers requested per poll.
    pub page_size: u64,
    /// Delay before retrying a record that failed to apply.
    pub retry_delay: Duration,
    /// Dead-letter a record after this many failures; unbounded when `None`.
    pub max_apply_retries: Option<u32>,
    /// Reconnect backoff for remotes and the local directory.
    pub backoff: BackoffConfig,
    /// Container for checkpoint entries.
    pub checkpoint_base_dn: Dn,
    /// What checkpoint DNs are derived from.
    pub checkpoint_key: CheckpointKey,
    /// Changelog container on the remotes.
    pub changelog_base_dn: Dn,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            page_size: 500,
            retry_delay: Duration::from_secs(1),
            max_apply_retries: None,
            backoff: BackoffConfig::default(),
            checkpoint_base_dn: Dn::root().child("o", "replcheckpoints"),
            checkpoint_key: CheckpointKey::Url,
            changelog_base_dn: Dn::root().child("cn", "changelog"),
        }
    }
}

/// Why the engine is waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PauseReason {
    /// Paused by an operator.
    Manual,
    /// The local directory is unreachable.
    Error,
}

/// Engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    /// Created, not started.
    Init,
    /// Waiting for the timer or polling remotes.
    Poll,
    /// Applying queued records.
    Process,
    /// Paused; the queue is kept.
    Wait(PauseReason),
    /// Shut down. Terminal.
    Destroyed,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Init => f.write_str("init"),
            EngineState::Poll => f.write_str("poll"),
            EngineState::Process => f.write_str("process"),
            EngineState::Wait(PauseReason::Manual) => f.write_str("wait(manual)"),
            EngineState::Wait(PauseReason::Error) => f.write_str("wait(error)"),
            EngineState::Destroyed => f.write_str("destroyed"),
        }
    }
}

/// Lifecycle events published by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplEvent {
    /// A connection to `target` ("local" or a remote URL) is usable.
    ConnectionEstablished {
        /// "local" or the remote URL.
        target: String,
    },
    /// A source has no more changes to read and everything read is applied.
    CaughtUp {
        /// The source.
        source: SourceId,
        /// Its committed change number.
        change_number: u64,
    },
    /// The engine moved between states.
    StateChanged {
        /// Previous state.
        from: EngineState,
        /// New state.
        to: EngineState,
    },
    /// An add collided with an existing entry and was skipped.
    Conflict {
        /// The source.
        source: SourceId,
        /// Target DN.
        dn: String,
        /// Change number of the skipped record.
        change_number: u64,
        /// What collided.
        reason: String,
    },
    /// A record exceeded its retry budget and was set aside.
    DeadLetter {
        /// The source.
        source: SourceId,
        /// Target DN.
        dn: String,
        /// Change number of the record.
        change_number: u64,
        /// Last failure.
        reason: String,
    },
    /// Replication from a source stopped; operator intervention is needed.
    FatalError {
        /// The affected source.
        source: Option<SourceId>,
        /// What happened.
        error: String,
    },
    /// The engine shut down.
    Destroyed,
}

/// Per-source counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceStats {
    /// Records that wrote to the local directory.
    pub records_applied: u64,
    /// Records resolved to a no-op.
    pub noops: u64,
    /// Add conflicts skipped.
    pub conflicts: u64,
    /// Failed apply attempts that were retried.
    pub retries: u64,
    /// Records set aside after exhausting retries.
    pub dead_letters: u64,
    /// Changelog polls issued.
    pub polls: u64,
    /// Changelog entries dropped as malformed.
    pub malformed: u64,
}

/// Point-in-time view of one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceSnapshot {
    /// Source id.
    pub id: SourceId,
    /// Remote URL.
    pub url: String,
    /// Committed checkpoint.
    pub applied_change_number: u64,
    /// Highest change number seen in the changelog.
    pub search_change_number: u64,
    /// Whether the last poll reached the end of the changelog.
    pub caught_up: bool,
    /// Whether replication from this source has stopped.
    pub failed: bool,
    /// Records waiting in the queue.
    pub queued: usize,
    /// Counters.
    pub stats: SourceStats,
}

/// A record that was given up on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLetter {
    /// The source.
    pub source: SourceId,
    /// Remote URL.
    pub url: String,
    /// Target DN.
    pub dn: String,
    /// Change number.
    pub change_number: u64,
    /// Failed attempts.
    pub attempts: u32,
    /// Last failure.
    pub reason: String,
}

#[derive(Debug)]
struct RemoteSourceState {
    source: RemoteSource,
    descriptors: Vec<String>,
    applied_change_number: u64,
    search_change_number: u64,
    polling: bool,
    caught_up: bool,
    announced: bool,
    connected: bool,
    checkpoint_ready: bool,
    failed: bool,
    backoff: Backoff,
    retry_at: Option<Instant>,
    stats: SourceStats,
}

impl RemoteSourceState {
    fn new(source: RemoteSource, descriptors: Vec<String>, backoff: BackoffConfig) -> Self {
        Self {
            source,
            descriptors,
            applied_change_number: 0,
            search_change_number: 0,
            polling: false,
            caught_up: false,
            announced: false,
            connected: false,
            checkpoint_ready: false,
            failed: false,
            backoff: Backoff::new(backoff),
            retry_at: None,
            stats: SourceStats::default(),
        }
    }

    fn url(&self) -> &str {
        self.source.url()
    }
}

/// The replication orchestrator.
pub struct ReplicationEngine {
    config: EngineConfig,
    local: Arc<dyn DirectoryClient>,
    checkpoints: CheckpointStore,
    resolver: Resolver,
    sources: Vec<RemoteSourceState>,
    queue: ProcessingQueue,
    state: EngineState,
    local_connected: bool,
    needs_reconcile: bool,
    local_backoff: Backoff,
    next_local_probe: Option<Instant>,
    retry_at: Option<Instant>,
    poll_requested: bool,
    pending_commit: Option<(SourceId, u64)>,
    dead_letters: Vec<DeadLetter>,
    events: broadcast::Sender<ReplEvent>,
    state_tx: watch::Sender<EngineState>,
}

impl fmt::Debug for ReplicationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationEngine")
            .field("state", &self.state)
            .field("sources", &self.sources.len())
            .field("queued", &self.queue.len())
            .finish()
    }
}

impl ReplicationEngine {
    /// Create an engine that replicates into `local`.
    pub fn new(config: EngineConfig, local: Arc<dyn DirectoryClient>) -> Self {
        let checkpoints = CheckpointStore::new(
            local.clone(),
            config.checkpoint_base_dn.clone(),
            config.checkpoint_key,
        );
        let resolver = Resolver::new(local.clone());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state_tx, _) = watch::channel(EngineState::Init);
        let local_backoff = Backoff::new(config.backoff.clone());
        Self {
            config,
            local,
            checkpoints,
            resolver,
            sources: Vec::new(),
            queue: ProcessingQueue::new(),
            state: EngineState::Init,
            local_connected: true,
            needs_reconcile: false,
            local_backoff,
            next_local_probe: None,
            retry_at: None,
            poll_requested: false,
            pending_commit: None,
            dead_letters: Vec::new(),
            events,
            state_tx,
        }
    }

    /// Current state.
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ReplEvent> {
        self.events.subscribe()
    }

    /// Number of records in the processing queue.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Snapshot of every registered source.
    pub fn sources(&self) -> Vec<SourceSnapshot> {
        self.sources
            .iter()
            .map(|s| SourceSnapshot {
                id: s.source.id(),
                url: s.url().to_string(),
                applied_change_number: s.applied_change_number,
                search_change_number: s.search_change_number,
                caught_up: s.caught_up,
                failed: s.failed,
                queued: self.queue.pending_for(s.source.id()),
                stats: s.stats.clone(),
            })
            .collect()
    }

    /// Records that were given up on.
    pub fn dead_letters(&self) -> &[DeadLetter] {
        &self.dead_letters
    }

    /// Register a remote source. Its checkpoint is created right away when
    /// the local directory is reachable, otherwise on reconnect.
    pub async fn add_remote(
        &mut self,
        url: &str,
        queries: &[String],
        client: Arc<dyn DirectoryClient>,
    ) -> Result<SourceId> {
        if self.state == EngineState::Destroyed {
            return Err(ReplError::Shutdown);
        }
        let compiled = queries
            .iter()
            .map(|fragment| Query::compile(url, fragment))
            .collect::<Result<Vec<_>>>()?;
        let id = SourceId(self.sources.len());
        let source = RemoteSource::new(
            id,
            url,
            compiled,
            client,
            self.config.changelog_base_dn.clone(),
        )?;
        info!(source = %url, id = %id, queries = queries.len(), "Registered remote source");
        let descriptors = source.descriptors();
        self.sources.push(RemoteSourceState::new(
            source,
            descriptors,
            self.config.backoff.clone(),
        ));

        if self.local_connected {
            // A connection failure here defers the checkpoint to reconnect.
            let _ = self.ensure_checkpoint(id.0).await;
        } else {
            self.needs_reconcile = true;
        }
        Ok(id)
    }

    /// `init -> poll`.
    pub fn start(&mut self) {
        if self.state != EngineState::Init {
            warn!(state = %self.state, "Ignoring start outside of init");
            return;
        }
        if self.local_connected {
            self.transition(EngineState::Poll);
            self.poll_requested = true;
        } else {
            self.transition(EngineState::Wait(PauseReason::Error));
        }
    }

    /// Pause polling and processing. The queue is kept.
    pub fn pause(&mut self) {
        match self.state {
            EngineState::Poll | EngineState::Process => {
                self.transition(EngineState::Wait(PauseReason::Manual))
            }
            state => debug!(state = %state, "Ignoring pause"),
        }
    }

    /// Leave a manual pause.
    pub async fn resume(&mut self) {
        if self.state != EngineState::Wait(PauseReason::Manual) {
            debug!(state = %self.state, "Ignoring resume");
            return;
        }
        if !self.local_connected {
            self.transition(EngineState::Wait(PauseReason::Error));
            return;
        }
        if self.needs_reconcile && self.reconcile().await.is_err() {
            self.schedule_probe();
            self.transition(EngineState::Wait(PauseReason::Error));
            return;
        }
        let target = self.resume_target();
        self.transition(target);
        self.poll_requested = true;
    }

    /// The local directory connection was lost.
    pub fn local_disconnected(&mut self) {
        if self.state == EngineState::Destroyed {
            return;
        }
        self.on_local_error(&ReplError::Connection {
            target: "local".to_string(),
            msg: "connection closed".to_string(),
        });
    }

    /// The local directory is reachable again. After an error every
    /// checkpoint is re-read before work resumes, since an apply in flight at
    /// the time of the disconnect has an unknown outcome.
    pub async fn local_connected(&mut self) {
        if self.state == EngineState::Destroyed {
            return;
        }
        if self.needs_reconcile {
            if let Err(e) = self.reconcile().await {
                debug!(error = %e, "Local directory still unavailable");
                self.schedule_probe();
                return;
            }
        }
        let was_connected = self.local_connected;
        self.local_connected = true;
        self.next_local_probe = None;
        self.local_backoff.reset();
        if !was_connected {
            info!("Local directory connection established");
            self.emit(ReplEvent::ConnectionEstablished {
                target: "local".to_string(),
            });
        }
        if self.state == EngineState::Wait(PauseReason::Error) {
            let target = self.resume_target();
            self.transition(target);
            self.poll_requested = true;
        }
    }

    /// Stop the timer, close every connection and enter the terminal state.
    /// An apply already in flight has completed by the time this runs.
    pub async fn destroy(&mut self) {
        if self.state == EngineState::Destroyed {
            return;
        }
        for source in &self.sources {
            source.source.close().await;
        }
        self.local.close().await;
        info!(queued = self.queue.len(), "Replication engine destroyed");
        self.transition(EngineState::Destroyed);
        self.emit(ReplEvent::Destroyed);
    }

    /// Poll every source that is ready: not failed, not already polling, not
    /// backing off, and with nothing left in the queue.
    pub async fn poll_sources(&mut self) {
        for idx in 0..self.sources.len() {
            if !matches!(self.state, EngineState::Poll | EngineState::Process) {
                return;
            }
            if self.pollable(idx) {
                self.poll_source(idx).await;
            }
        }
    }

    /// Apply the record at the head of the queue. Returns false when nothing
    /// was done: not processing, waiting out a retry delay, or the queue
    /// drained (which moves the engine back to poll).
    pub async fn process_next(&mut self) -> bool {
        if self.state != EngineState::Process {
            return false;
        }
        if self.retry_at.is_some_and(|at| at > Instant::now()) {
            return false;
        }
        self.retry_at = None;

        if let Some((id, target)) = self.pending_commit {
            return self.flush_pending_commit(id, target).await;
        }

        let Some(mut item) = self.queue.pop_front() else {
            self.finish_if_drained();
            return false;
        };
        let idx = item.source().0;
        if self.sources[idx].failed {
            return true;
        }
        let url = self.sources[idx].url().to_string();
        let change_number = item.change_number();

        match self.resolver.apply(&item.record, &url).await {
            Ok(outcome) => {
                let stats = &mut self.sources[idx].stats;
                match outcome {
                    ApplyOutcome::NoOp(reason) => {
                        stats.noops += 1;
                        debug!(source = %url, change_number, reason = %reason, "Record resolved to no-op");
                    }
                    _ => stats.records_applied += 1,
                }
            }
            Err(e) if e.is_connection() => {
                self.queue.push_front(item);
                self.on_local_error(&e);
                return false;
            }
            Err(ReplError::Conflict { dn, reason, .. }) => {
                error!(
                    source = %url,
                    dn = %dn,
                    change_number,
                    reason = %reason,
                    "Conflict applying record, skipping it"
                );
                self.sources[idx].stats.conflicts += 1;
                self.emit(ReplEvent::Conflict {
                    source: item.source(),
                    dn,
                    change_number,
                    reason,
                });
            }
            Err(e @ ReplError::Protocol { .. }) => {
                error!(source = %url, change_number, error = %e, "Dropping invalid record");
                self.sources[idx].stats.malformed += 1;
            }
            Err(e) => {
                item.attempts += 1;
                self.sources[idx].stats.retries += 1;
                let exhausted = self
                    .config
                    .max_apply_retries
                    .is_some_and(|max| item.attempts > max);
                if !exhausted {
                    warn!(
                        source = %url,
                        dn = %item.record.target_dn,
                        change_number,
                        attempt = item.attempts,
                        error = %e,
                        "Apply failed, retrying"
                    );
                    self.queue.push_front(item);
                    self.retry_at = Some(Instant::now() + self.config.retry_delay);
                    return false;
                }
                let letter = DeadLetter {
                    source: item.source(),
                    url: url.clone(),
                    dn: item.record.target_dn.clone(),
                    change_number,
                    attempts: item.attempts,
                    reason: e.to_string(),
                };
                error!(
                    source = %url,
                    dn = %letter.dn,
                    change_number,
                    attempts = letter.attempts,
                    error = %e,
                    "Giving up on record"
                );
                self.sources[idx].stats.dead_letters += 1;
                self.emit(ReplEvent::DeadLetter {
                    source: letter.source,
                    dn: letter.dn.clone(),
                    change_number,
                    reason: letter.reason.clone(),
                });
                self.dead_letters.push(letter);
            }
        }

        self.commit_record(idx, change_number).await;
        self.finish_if_drained();
        true
    }

    /// Spawn the engine onto the runtime.
    pub fn spawn(self) -> (EngineHandle, JoinHandle<()>) {
        let (commands, rx) = mpsc::channel(COMMAND_CAPACITY);
        let handle = EngineHandle {
            commands,
            state: self.state_tx.subscribe(),
            events: self.events.clone(),
        };
        let task = tokio::spawn(self.run(rx));
        (handle, task)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while self.state != EngineState::Destroyed {
            let wake = self.next_wakeup();
            let ready = self.has_ready_work();
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => self.destroy().await,
                },
                _ = ticker.tick() => self.poll_sources().await,
                _ = tokio::time::sleep_until(wake.unwrap_or_else(Instant::now)), if wake.is_some() => {
                    self.on_wakeup().await
                }
                _ = std::future::ready(()), if ready => self.do_ready_work().await,
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::AddRemote {
                url,
                queries,
                client,
                reply,
            } => {
                let result = self.add_remote(&url, &queries, client).await;
                let _ = reply.send(result);
            }
            Command::Start => self.start(),
            Command::Pause => self.pause(),
            Command::Resume => self.resume().await,
            Command::LocalDisconnected => self.local_disconnected(),
            Command::LocalConnected => self.local_connected().await,
            Command::Sources { reply } => {
                let _ = reply.send(self.sources());
            }
            Command::DeadLetters { reply } => {
                let _ = reply.send(self.dead_letters.clone());
            }
            Command::Destroy { reply } => {
                self.destroy().await;
                let _ = reply.send(());
            }
        }
    }

    fn has_ready_work(&self) -> bool {
        match self.state {
            EngineState::Poll => self.poll_requested,
            EngineState::Process => self.poll_requested || self.retry_at.is_none(),
            _ => false,
        }
    }

    async fn do_ready_work(&mut self) {
        if self.poll_requested {
            self.poll_requested = false;
            self.poll_sources().await;
        } else {
            self.process_next().await;
        }
    }

    fn next_wakeup(&self) -> Option<Instant> {
        let retry = match self.state {
            EngineState::Process => self.retry_at,
            _ => None,
        };
        let probe = match self.state {
            EngineState::Destroyed => None,
            _ if !self.local_connected => self.next_local_probe,
            _ => None,
        };
        match (retry, probe) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    async fn on_wakeup(&mut self) {
        let now = Instant::now();
        if self.retry_at.is_some_and(|at| at <= now) {
            self.retry_at = None;
        }
        if !self.local_connected && self.next_local_probe.is_some_and(|at| at <= now) {
            self.probe_local().await;
        }
    }

    async fn probe_local(&mut self) {
        let base = self.config.checkpoint_base_dn.to_string();
        match self.local.search(&base, Scope::Base, "(objectclass=*)").await {
            Err(e) if e.is_connection() => {
                debug!(error = %e, "Local directory probe failed");
                self.schedule_probe();
            }
            _ => self.local_connected().await,
        }
    }

    fn schedule_probe(&mut self) {
        let delay = self.local_backoff.next_delay();
        debug!(retry_in_ms = delay.as_millis() as u64, "Scheduling local directory probe");
        self.next_local_probe = Some(Instant::now() + delay);
    }

    fn on_local_error(&mut self, err: &ReplError) {
        if self.local_connected {
            warn!(error = %err, "Lost connection to the local directory");
            self.local_backoff.reset();
            self.schedule_probe();
        }
        self.local_connected = false;
        self.needs_reconcile = true;
        if matches!(self.state, EngineState::Poll | EngineState::Process) {
            self.transition(EngineState::Wait(PauseReason::Error));
        }
    }

    /// Re-read every checkpoint and drop queued records at or below it.
    async fn reconcile(&mut self) -> Result<()> {
        for idx in 0..self.sources.len() {
            if !self.sources[idx].failed {
                self.ensure_checkpoint(idx).await?;
            }
        }
        if let Some((id, target)) = self.pending_commit {
            let source = &self.sources[id.0];
            if source.failed || target <= source.applied_change_number {
                self.pending_commit = None;
            }
        }
        self.needs_reconcile = false;
        info!(
            sources = self.sources.len(),
            queued = self.queue.len(),
            "Checkpoints re-read"
        );
        Ok(())
    }

    /// Returns an error only for connection failures; anything else halts
    /// the source.
    async fn ensure_checkpoint(&mut self, idx: usize) -> Result<()> {
        let (id, url, descriptors) = {
            let s = &self.sources[idx];
            (s.source.id(), s.url().to_string(), s.descriptors.clone())
        };
        match self.checkpoints.ensure(&url, &descriptors).await {
            Ok(change_number) => {
                let s = &mut self.sources[idx];
                s.applied_change_number = change_number;
                s.search_change_number = s.search_change_number.max(change_number);
                s.checkpoint_ready = true;
                let dropped = self.queue.drop_committed(id, change_number);
                if dropped > 0 {
                    info!(source = %url, change_number, dropped, "Dropped records already committed");
                }
                debug!(source = %url, change_number, "Checkpoint loaded");
                Ok(())
            }
            Err(e) if e.is_connection() => {
                self.sources[idx].checkpoint_ready = false;
                self.on_local_error(&e);
                Err(e)
            }
            Err(e) => {
                self.fail_source(idx, &e);
                Ok(())
            }
        }
    }

    fn pollable(&self, idx: usize) -> bool {
        let s = &self.sources[idx];
        let id = s.source.id();
        !s.failed
            && s.checkpoint_ready
            && !s.polling
            && s.retry_at.map_or(true, |at| at <= Instant::now())
            && self.queue.pending_for(id) == 0
            && !matches!(self.pending_commit, Some((pending, _)) if pending == id)
    }

    async fn poll_source(&mut self, idx: usize) {
        loop {
            let start = self.sources[idx].applied_change_number + 1;
            let end = start.saturating_add(self.config.page_size);
            self.sources[idx].polling = true;
            self.sources[idx].stats.polls += 1;
            let result = self.sources[idx].source.poll(start, end).await;
            self.sources[idx].polling = false;

            let result = match result {
                Ok(result) => result,
                Err(e) => {
                    self.on_remote_error(idx, &e);
                    return;
                }
            };
            self.on_remote_ok(idx);

            let id = self.sources[idx].source.id();
            let caught_up = {
                let s = &mut self.sources[idx];
                s.stats.malformed += result.malformed as u64;
                if let Some(highest) = result.highest_seen {
                    s.search_change_number = s.search_change_number.max(highest);
                }
                let caught_up =
                    result.entries_seen == 0 || result.highest_seen.map_or(true, |h| h < end);
                s.caught_up = caught_up;
                if !caught_up || !result.records.is_empty() {
                    s.announced = false;
                }
                debug!(
                    source = %s.url(),
                    start,
                    end,
                    entries = result.entries_seen,
                    matched = result.records.len(),
                    search_change_number = s.search_change_number,
                    "Polled changelog"
                );
                caught_up
            };

            if result.records.is_empty() {
                let (applied, search) = {
                    let s = &self.sources[idx];
                    (s.applied_change_number, s.search_change_number)
                };
                if search > applied && self.write_checkpoint(idx, search).await.is_err() {
                    return;
                }
                self.maybe_announce(idx);
                if caught_up {
                    return;
                }
                continue;
            }

            let was_empty = self.queue.is_empty();
            debug!(source = %self.sources[idx].url(), id = %id, records = result.records.len(), "Queueing records");
            self.queue.push_batch(result.records);
            if was_empty && self.state == EngineState::Poll {
                self.transition(EngineState::Process);
            }
            return;
        }
    }

    fn on_remote_error(&mut self, idx: usize, err: &ReplError) {
        let s = &mut self.sources[idx];
        let delay = s.backoff.next_delay();
        s.retry_at = Some(Instant::now() + delay);
        s.connected = false;
        warn!(
            source = %s.url(),
            error = %err,
            attempt = s.backoff.attempts(),
            retry_in_ms = delay.as_millis() as u64,
            "Poll failed, backing off"
        );
    }

    fn on_remote_ok(&mut self, idx: usize) {
        let s = &mut self.sources[idx];
        s.backoff.reset();
        s.retry_at = None;
        if !s.connected {
            s.connected = true;
            info!(source = %s.url(), "Remote connection established");
            let target = s.url().to_string();
            self.emit(ReplEvent::ConnectionEstablished { target });
        }
    }

    /// Checkpoint value after committing `change_number`: when it was the
    /// source's last queued record, skip ahead over any non-matching tail.
    fn checkpoint_target(&self, idx: usize, change_number: u64) -> u64 {
        let s = &self.sources[idx];
        let mut target = change_number.max(s.applied_change_number);
        if self.queue.pending_for(s.source.id()) == 0 && s.search_change_number > target {
            target = s.search_change_number;
        }
        target
    }

    async fn commit_record(&mut self, idx: usize, change_number: u64) {
        let target = self.checkpoint_target(idx, change_number);
        if target <= self.sources[idx].applied_change_number {
            self.maybe_announce(idx);
            return;
        }
        match self.write_checkpoint(idx, target).await {
            Ok(()) => self.maybe_announce(idx),
            Err(ReplError::Checkpoint { .. }) => {}
            Err(e) => {
                self.pending_commit = Some((self.sources[idx].source.id(), target));
                if !e.is_connection() {
                    self.retry_at = Some(Instant::now() + self.config.retry_delay);
                }
            }
        }
    }

    async fn flush_pending_commit(&mut self, id: SourceId, target: u64) -> bool {
        let idx = id.0;
        match self.write_checkpoint(idx, target).await {
            Ok(()) => {
                self.pending_commit = None;
                self.maybe_announce(idx);
                self.finish_if_drained();
                true
            }
            Err(ReplError::Checkpoint { .. }) => true,
            Err(e) if e.is_connection() => false,
            Err(_) => {
                self.retry_at = Some(Instant::now() + self.config.retry_delay);
                false
            }
        }
    }

    async fn write_checkpoint(&mut self, idx: usize, target: u64) -> Result<()> {
        let (url, descriptors) = {
            let s = &self.sources[idx];
            (s.url().to_string(), s.descriptors.clone())
        };
        match self.checkpoints.set(&url, &descriptors, target).await {
            Ok(()) => {
                self.sources[idx].applied_change_number = target;
                Ok(())
            }
            Err(e) => {
                match &e {
                    ReplError::Checkpoint { .. } => self.fail_source(idx, &e),
                    e if e.is_connection() => self.on_local_error(e),
                    e => warn!(source = %url, change_number = target, error = %e, "Checkpoint write failed"),
                }
                Err(e)
            }
        }
    }

    fn maybe_announce(&mut self, idx: usize) {
        let id = self.sources[idx].source.id();
        if self.queue.pending_for(id) > 0
            || matches!(self.pending_commit, Some((pending, _)) if pending == id)
        {
            return;
        }
        let s = &mut self.sources[idx];
        if s.caught_up && !s.announced && !s.failed {
            s.announced = true;
            let change_number = s.applied_change_number;
            info!(source = %s.url(), change_number, "Source caught up");
            self.emit(ReplEvent::CaughtUp {
                source: id,
                change_number,
            });
        }
    }

    fn fail_source(&mut self, idx: usize, err: &ReplError) {
        let s = &mut self.sources[idx];
        if s.failed {
            return;
        }
        s.failed = true;
        s.checkpoint_ready = false;
        let id = s.source.id();
        let url = s.url().to_string();
        let dropped = self.queue.remove_source(id);
        if matches!(self.pending_commit, Some((pending, _)) if pending == id) {
            self.pending_commit = None;
        }
        error!(
            source = %url,
            error = %err,
            dropped,
            "Replication from source halted, operator intervention required"
        );
        self.emit(ReplEvent::FatalError {
            source: Some(id),
            error: err.to_string(),
        });
        self.finish_if_drained();
    }

    fn finish_if_drained(&mut self) {
        if self.state == EngineState::Process
            && self.queue.is_empty()
            && self.pending_commit.is_none()
        {
            self.transition(EngineState::Poll);
            self.poll_requested = true;
        }
    }

    fn resume_target(&self) -> EngineState {
        if self.queue.is_empty() && self.pending_commit.is_none() {
            EngineState::Poll
        } else {
            EngineState::Process
        }
    }

    fn transition(&mut self, to: EngineState) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        info!(from = %from, to = %to, queued = self.queue.len(), "Replication state changed");
        self.state_tx.send_replace(to);
        self.emit(ReplEvent::StateChanged { from, to });
    }

    fn emit(&self, event: ReplEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

enum Command {
    AddRemote {
        url: String,
        queries: Vec<String>,
        client: Arc<dyn DirectoryClient>,
        reply: oneshot::Sender<Result<SourceId>>,
    },
    Start,
    Pause,
    Resume,
    LocalDisconnected,
    LocalConnected,
    Sources {
        reply: oneshot::Sender<Vec<SourceSnapshot>>,
    },
    DeadLetters {
        reply: oneshot::Sender<Vec<DeadLetter>>,
    },
    Destroy {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable control handle for a spawned engine.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<EngineState>,
    events: broadcast::Sender<ReplEvent>,
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle")
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl EngineHandle {
    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ReplError::Shutdown)
    }

    /// Register a remote source.
    pub async fn add_remote(
        &self,
        url: impl Into<String>,
        queries: Vec<String>,
        client: Arc<dyn DirectoryClient>,
    ) -> Result<SourceId> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::AddRemote {
            url: url.into(),
            queries,
            client,
            reply,
        })
        .await?;
        rx.await.map_err(|_| ReplError::Shutdown)?
    }

    /// `init -> poll`.
    pub async fn start(&self) -> Result<()> {
        self.send(Command::Start).await
    }

    /// Manual pause.
    pub async fn pause(&self) -> Result<()> {
        self.send(Command::Pause).await
    }

    /// Leave a manual pause.
    pub async fn resume(&self) -> Result<()> {
        self.send(Command::Resume).await
    }

    /// Report loss of the local directory connection.
    pub async fn local_disconnected(&self) -> Result<()> {
        self.send(Command::LocalDisconnected).await
    }

    /// Report that the local directory is reachable again.
    pub async fn local_connected(&self) -> Result<()> {
        self.send(Command::LocalConnected).await
    }

    /// Shut the engine down and wait until it has. A no-op when it is
    /// already gone.
    pub async fn destroy(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Destroy { reply }).await.is_err() {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    /// Per-source snapshot.
    pub async fn sources(&self) -> Result<Vec<SourceSnapshot>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Sources { reply }).await?;
        rx.await.map_err(|_| ReplError::Shutdown)
    }

    /// Records given up on.
    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::DeadLetters { reply }).await?;
        rx.await.map_err(|_| ReplError::Shutdown)
    }

    /// Current state.
    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Wait until the engine reaches `target`.
    pub async fn wait_for_state(&self, target: EngineState) -> Result<()> {
        let mut rx = self.state.clone();
        loop {
            if *rx.borrow_and_update() == target {
                return Ok(());
            }
            rx.changed().await.map_err(|_| ReplError::Shutdown)?;
        }
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ReplEvent> {
        self.events.subscribe()
    }
}

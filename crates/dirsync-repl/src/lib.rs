#![warn(missing_docs)]

//! dirsync replication subsystem: changelog-tailing, filter-scoped replication
//! from remote LDAP directories into a local one, with durable checkpoints

pub mod backoff;
pub mod changelog;
pub mod checkpoint;
pub mod client;
pub mod config;
pub mod dn;
pub mod engine;
pub mod entry;
pub mod error;
pub mod filter;
pub mod ldap;
pub mod memory;
pub mod query;
pub mod queue;
pub mod remote;
pub mod resolver;

pub use backoff::{Backoff, BackoffConfig};
pub use changelog::{ChangeRecord, ChangeType};
pub use checkpoint::{Checkpoint, CheckpointKey, CheckpointStore};
pub use client::{DirectoryClient, DirectoryResult, Scope};
pub use config::{DirectoryConfig, RemoteConfig, ReplConfig};
pub use dn::Dn;
pub use engine::{
    DeadLetter, EngineConfig, EngineHandle, EngineState, PauseReason, ReplEvent,
    ReplicationEngine, SourceSnapshot, SourceStats,
};
pub use entry::{Entry, ModOp, Modification};
pub use error::{DirectoryError, ReplError, Result};
pub use filter::Filter;
pub use ldap::{LdapDirectory, LdapSettings};
pub use memory::{MemoryDirectory, WriteKind};
pub use query::Query;
pub use remote::{RemoteSource, SourceId};
pub use resolver::{ApplyOutcome, NoOpReason};

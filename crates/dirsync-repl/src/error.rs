//! Error types for the replication subsystem.

use thiserror::Error;

/// Errors returned by a [`DirectoryClient`](crate::client::DirectoryClient).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    /// The directory could not be reached or the connection dropped.
    #[error("directory connection error: {msg}")]
    Connection {
        /// Error message describing the transport failure.
        msg: String,
    },

    /// The addressed entry does not exist.
    #[error("no such object: {dn}")]
    NoSuchObject {
        /// The DN that was not found.
        dn: String,
    },

    /// An entry already exists at the target DN.
    #[error("entry already exists: {dn}")]
    AlreadyExists {
        /// The DN that is already taken.
        dn: String,
    },

    /// The directory rejected the operation on a constraint check.
    #[error("constraint violation on {dn}: {msg}")]
    ConstraintViolation {
        /// The DN the operation targeted.
        dn: String,
        /// Directory-supplied diagnostic.
        msg: String,
    },

    /// Deleting an entry that still has children.
    #[error("operation not allowed on non-leaf: {dn}")]
    NotAllowedOnNonLeaf {
        /// The DN that still has children.
        dn: String,
    },

    /// A modify added a value the attribute already holds.
    #[error("attribute or value exists on {dn}: {msg}")]
    AttributeOrValueExists {
        /// The DN the modify targeted.
        dn: String,
        /// Directory-supplied diagnostic.
        msg: String,
    },

    /// A modify removed a value or attribute the entry does not hold.
    #[error("no such attribute on {dn}: {msg}")]
    NoSuchAttribute {
        /// The DN the modify targeted.
        dn: String,
        /// Directory-supplied diagnostic.
        msg: String,
    },

    /// Any other result code.
    #[error("directory error {code}: {msg}")]
    Other {
        /// Protocol result code.
        code: u32,
        /// Directory-supplied diagnostic.
        msg: String,
    },
}

impl DirectoryError {
    /// Returns true if the error means the connection itself is unusable.
    pub fn is_connection(&self) -> bool {
        matches!(self, DirectoryError::Connection { .. })
    }

    /// Map an LDAP result code to an error for the given DN.
    pub fn from_result_code(code: u32, dn: &str, msg: &str) -> Self {
        match code {
            16 => DirectoryError::NoSuchAttribute {
                dn: dn.to_string(),
                msg: msg.to_string(),
            },
            20 => DirectoryError::AttributeOrValueExists {
                dn: dn.to_string(),
                msg: msg.to_string(),
            },
            19 => DirectoryError::ConstraintViolation {
                dn: dn.to_string(),
                msg: msg.to_string(),
            },
            32 => DirectoryError::NoSuchObject { dn: dn.to_string() },
            66 => DirectoryError::NotAllowedOnNonLeaf { dn: dn.to_string() },
            68 => DirectoryError::AlreadyExists { dn: dn.to_string() },
            // busy, unavailable
            51 | 52 => DirectoryError::Connection {
                msg: format!("{} (code {})", msg, code),
            },
            _ => DirectoryError::Other {
                code,
                msg: msg.to_string(),
            },
        }
    }
}

/// Errors that can occur in the replication subsystem.
#[derive(Debug, Clone, Error)]
pub enum ReplError {
    /// Invalid configuration or replication descriptor.
    #[error("configuration error: {msg}")]
    Config {
        /// Error message describing the issue.
        msg: String,
    },

    /// A remote or the local directory is unreachable.
    #[error("connection error ({target}): {msg}")]
    Connection {
        /// URL or role of the unreachable directory.
        target: String,
        /// Error message describing the network issue.
        msg: String,
    },

    /// An add hit an existing DN, or the local directory rejected a constraint.
    #[error("conflict applying change {change_number} from {source_url} to {dn}: {reason}")]
    Conflict {
        /// URL of the remote source the record came from.
        source_url: String,
        /// Target DN of the record.
        dn: String,
        /// Change number of the record.
        change_number: u64,
        /// What collided.
        reason: String,
    },

    /// Any other failure applying a record.
    #[error("failed to apply change {change_number} from {source_url} to {dn}: {reason}")]
    Apply {
        /// URL of the remote source the record came from.
        source_url: String,
        /// Target DN of the record.
        dn: String,
        /// Change number of the record.
        change_number: u64,
        /// Underlying failure.
        reason: String,
    },

    /// A changelog entry is structurally invalid.
    #[error("malformed changelog entry {change_number:?}: {reason}")]
    Protocol {
        /// Change number, when it could be read.
        change_number: Option<u64>,
        /// What was wrong with the entry.
        reason: String,
    },

    /// The checkpoint entry for a source is missing or unreadable.
    #[error("checkpoint error for {url}: {reason}")]
    Checkpoint {
        /// Source URL the checkpoint belongs to.
        url: String,
        /// What went wrong.
        reason: String,
    },

    /// Replication engine was shut down.
    #[error("replication engine shut down")]
    Shutdown,
}

impl ReplError {
    /// Returns true for transport-level failures that warrant backoff rather
    /// than a record-level retry.
    pub fn is_connection(&self) -> bool {
        matches!(self, ReplError::Connection { .. })
    }

    /// Wrap a directory error raised while talking to `target`.
    pub fn connection(target: impl Into<String>, err: DirectoryError) -> Self {
        ReplError::Connection {
            target: target.into(),
            msg: err.to_string(),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ReplError>;

use std::fmt;
use std::io;

use asg_mem::HostMemoryError;
use asg_snapshot::SnapshotError;
use thiserror::Error;

use crate::config::ConfigError;

pub type Result<T> = std::result::Result<T, AsgError>;

/// Why an ASG invariant check gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortReason {
    /// The guest or the embedding device layer asked for something that can never be valid
    /// (oversized allocation, dedicated/virtio flag mix-ups, missing collaborators).
    ProtocolMisuse,
    /// The host could not provide physical window space or backing memory.
    ResourceExhausted,
    /// Allocator or pool bookkeeping no longer matches reality (bad block index, double free,
    /// snapshot references to memory that cannot be reconstructed).
    InternalConsistency,
}

impl AbortReason {
    pub fn as_str(self) -> &'static str {
        match self {
            AbortReason::ProtocolMisuse => "protocol-misuse",
            AbortReason::ResourceExhausted => "resource-exhausted",
            AbortReason::InternalConsistency => "internal-consistency",
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An unrecoverable invariant violation.
///
/// Shared guest-visible memory may already be inconsistent when one of these is raised, so the
/// embedding application must stop the VM instead of retrying.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}: {message}")]
pub struct FatalError {
    pub reason: AbortReason,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum AsgError {
    #[error("fatal ASG error: {0}")]
    Fatal(#[from] FatalError),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("host memory error: {0}")]
    HostMemory(#[from] HostMemoryError),
}

impl AsgError {
    /// `true` for errors that must terminate the VM.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AsgError::Fatal(_))
    }

    pub fn fatal_reason(&self) -> Option<AbortReason> {
        match self {
            AsgError::Fatal(err) => Some(err.reason),
            _ => None,
        }
    }
}

impl From<io::Error> for AsgError {
    fn from(err: io::Error) -> Self {
        AsgError::Snapshot(SnapshotError::Io(err))
    }
}

/// Build (and log) a fatal error.
pub(crate) fn fatal(reason: AbortReason, message: impl Into<String>) -> AsgError {
    let message = message.into();
    tracing::error!(reason = reason.as_str(), "{message}");
    AsgError::Fatal(FatalError { reason, message })
}

/// Hard stop for paths that have no error return channel (context teardown).
pub fn die(err: AsgError) -> ! {
    tracing::error!(error = %err, "unrecoverable ASG state");
    panic!("unrecoverable ASG state: {err}");
}

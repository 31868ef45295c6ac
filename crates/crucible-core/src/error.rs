//! Error taxonomy for task execution.
//!
//! The split matters to callers: `Setup` and `Timeout` mean "nothing was
//! published, a retry is possible"; a terminal `TaskResult` (including
//! Failed and Cancelled) means "it ran, this is the shared outcome".
//! Dispatchers never publish `Setup` or `Timeout` into the dedup cache.

use uuid::Uuid;

/// Per-phase timeout phases, named for error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Write,
    Read,
    Wait,
    Claim,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Phase::Write => "writing to input pipe",
            Phase::Read => "reading from output pipe",
            Phase::Wait => "waiting for process exit",
            Phase::Claim => "waiting on in-flight execution",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// Pipe allocation or process launch failed. Retryable: the claim is
    /// released, never published.
    #[error("failed to set up task {id}: {source}")]
    Setup {
        id: Uuid,
        #[source]
        source: std::io::Error,
    },

    /// A bounded phase exceeded its timeout. The process is left running;
    /// the caller decides whether to cancel.
    #[error("{phase} took too long for task {id}")]
    Timeout { id: Uuid, phase: Phase },

    /// The process exited with a non-zero code while we were waiting on it.
    #[error("process for task {id} exited with non-zero code {code}")]
    Process { id: Uuid, code: i32 },

    /// The process exited before a pipe operation completed, without
    /// cancellation having been requested.
    #[error("process for task {id} exited early with code {code}")]
    EarlyExit { id: Uuid, code: i32 },

    /// Cancellation was requested and won the race.
    #[error("task {id} has been cancelled")]
    Cancelled { id: Uuid },

    /// `start()` called twice. Local API misuse, never distributed.
    #[error("task {id} has already been started")]
    AlreadyStarted { id: Uuid },

    /// `start()` called after a pre-start cancellation.
    #[error("task {id} was cancelled before it was started")]
    AlreadyCancelled { id: Uuid },

    /// The dedup cache collaborator failed.
    #[error("dedup cache error for task {id}: {message}")]
    Cache { id: Uuid, message: String },
}

impl TaskError {
    /// True when no result was published and the same request may be
    /// retried against a fresh claim.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Setup { .. } | Self::Timeout { .. } | Self::Cache { .. })
    }
}

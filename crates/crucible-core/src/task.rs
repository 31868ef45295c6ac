//! Task types — request, result, and lifecycle status.
//!
//! `TaskRequest` is what arrives from the transport (an external
//! collaborator); `TaskResult` is what the engine publishes back. Both are
//! plain serde types so any transport can carry them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One request to execute a named script against an input payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Caller-assigned task identity. Never part of the dedup key.
    pub id: Uuid,
    /// Which executable to run. Opaque key, resolved against the script dir.
    pub script: String,
    /// Raw input bytes, written as a single frame to the input pipe.
    /// Must not contain the `\n` frame delimiter.
    pub input: Vec<u8>,
    /// Per-phase timeout. Falls back to the configured default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_minutes: Option<u64>,
    /// Echoed back unmodified on the result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_properties: Option<serde_json::Value>,
}

impl TaskRequest {
    /// New request with a generated id.
    pub fn new(script: impl Into<String>, input: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            script: script.into(),
            input: input.into(),
            timeout_minutes: None,
            additional_properties: None,
        }
    }
}

/// Terminal outcome of one execution. Written at most once per fingerprint;
/// immutable after publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Id of the request that actually executed. Deduplicated waiters
    /// observe the executing request's id, not their own.
    pub id: Uuid,
    pub script: String,
    pub status: TaskStatus,
    /// Response frame read from the output pipe. Present only on Success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Vec<u8>>,
    /// Everything the subprocess wrote to its stdout, drained line by line.
    pub stdout: String,
    /// Same for stderr.
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_properties: Option<serde_json::Value>,
}

/// Lifecycle status of a task.
///
/// Legal transitions form the state table enforced by the process handle:
/// Queued → Running → Success | Failed, with the cancellation path
/// Queued → Cancelled and Running → Cancelling → Cancelled.
/// Success, Failed, and Cancelled are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Cancelling,
    Success,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// True for Success, Failed, and Cancelled. Terminal statuses never
    /// change once reached.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }
}

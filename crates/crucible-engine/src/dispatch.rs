//! Dispatch coordinator — deduplicated, cancellable, timeout-bounded
//! task execution.
//!
//! `run_task` fingerprints the request, then CAS-claims the fingerprint in
//! the shared cache. The winner creates a `TaskProcess`, drives it through
//! write → read → wait, and publishes the terminal result under the
//! fingerprint; every loser blocks on that key and returns the shared
//! result without starting a process of its own.
//!
//! Publication rules: terminal outcomes (Success, Failed, Cancelled) are
//! published once with a TTL so duplicate callers fail fast; setup errors
//! and timeouts release the claim without publishing so a later caller can
//! retry fresh.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use uuid::Uuid;

use crucible_core::config::CrucibleConfig;
use crucible_core::error::Phase;
use crucible_core::{Fingerprint, TaskError, TaskRequest, TaskResult, TaskStatus};

use crate::cache::{CacheEntry, ResultCache};
use crate::listener::ListenerRegistry;
use crate::process::TaskProcess;

pub struct TaskDispatcher {
    config: CrucibleConfig,
    cache: Arc<dyn ResultCache>,
    listeners: Arc<ListenerRegistry>,
    /// task id → handle, for the executions this instance owns. Cancellation
    /// is addressed by task id, not fingerprint: cancelling a waiter's id
    /// is a no-op, only the owning execution's id reaches a process.
    running: DashMap<Uuid, Arc<TaskProcess>>,
    /// Distinguishes this dispatcher's claims from other instances'.
    instance: Uuid,
    executions_started: AtomicU64,
}

impl TaskDispatcher {
    pub fn new(config: CrucibleConfig, cache: Arc<dyn ResultCache>) -> Self {
        Self {
            config,
            cache,
            listeners: Arc::new(ListenerRegistry::new()),
            running: DashMap::new(),
            instance: Uuid::new_v4(),
            executions_started: AtomicU64::new(0),
        }
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    /// Number of processes this instance has actually launched. Dedup hits
    /// don't count.
    pub fn executions_started(&self) -> u64 {
        self.executions_started.load(Ordering::SeqCst)
    }

    /// Execute a task, or wait on the identical execution already in
    /// flight. Returns a terminal `TaskResult` (Success, Failed, or
    /// Cancelled), or a `Setup`/`Timeout` error meaning nothing was
    /// published and a retry is possible.
    pub async fn run_task(&self, request: TaskRequest) -> Result<TaskResult, TaskError> {
        let key = Fingerprint::of(&request.script, &request.input).to_hex();
        let timeout = self.phase_timeout(&request);
        let deadline = Instant::now() + timeout;
        let owner = format!("{}:{}", self.instance, request.id);
        // A claim must outlive the whole execution it guards (three bounded
        // phases), not just the result-sharing window, or a slow task loses
        // its claim mid-flight and a duplicate caller starts a second
        // process. The configured TTL applies to published results.
        let claim_ttl = self
            .config
            .engine
            .cache_ttl()
            .max(timeout.saturating_mul(3));

        loop {
            let claim = CacheEntry::InFlight {
                owner: owner.clone(),
            };
            let claimed = self
                .cache
                .put_if_absent(&key, claim, claim_ttl)
                .await
                .map_err(|e| TaskError::Cache {
                    id: request.id,
                    message: e.to_string(),
                })?;

            if claimed {
                return self.execute(&key, &owner, &request, timeout).await;
            }

            tracing::debug!(task_id = %request.id, fingerprint = %key, "joining in-flight execution");
            match self.await_published(&key, &request, deadline).await? {
                Some(result) => return Ok(result),
                // Entry vanished: the owner released without publishing.
                // Race for the claim ourselves.
                None => continue,
            }
        }
    }

    /// Cancel an in-flight task by id. Fire-and-forget and idempotent:
    /// unknown, already-finished, and waiter-only ids are ignored.
    pub async fn cancel_task(&self, id: Uuid) {
        let process = self.running.get(&id).map(|p| Arc::clone(p.value()));
        match process {
            Some(process) => {
                tracing::info!(task_id = %id, "cancel requested");
                process.cancel().await;
            }
            None => {
                tracing::debug!(task_id = %id, "cancel for unknown or finished task, ignoring");
            }
        }
    }

    // ── Owning path ───────────────────────────────────────────────────────────

    async fn execute(
        &self,
        key: &str,
        owner: &str,
        request: &TaskRequest,
        timeout: Duration,
    ) -> Result<TaskResult, TaskError> {
        tracing::info!(
            task_id = %request.id,
            script = %request.script,
            fingerprint = %key,
            "claimed execution"
        );

        let process = match TaskProcess::create(request, &self.config) {
            Ok(process) => Arc::new(process),
            Err(e) => {
                self.release(key, owner, request.id).await;
                return Err(e);
            }
        };
        self.executions_started.fetch_add(1, Ordering::SeqCst);
        self.running.insert(request.id, Arc::clone(&process));

        let outcome = drive(&process, request, timeout).await;

        self.running.remove(&request.id);

        let (status, output) = match outcome {
            Ok(output) => (TaskStatus::Success, Some(output)),
            Err(TaskError::Cancelled { .. }) => (TaskStatus::Cancelled, None),
            Err(TaskError::Process { .. }) | Err(TaskError::EarlyExit { .. }) => {
                (TaskStatus::Failed, None)
            }
            // Setup failures and timeouts publish nothing: kill whatever is
            // left, release the claim, surface the error to this caller only.
            Err(e) => {
                process.cancel().await;
                process.cleanup();
                self.release(key, owner, request.id).await;
                return Err(e);
            }
        };
        process.cleanup();

        // The process has exited; give the stdio drains a moment to reach
        // end-of-stream so the captured text is complete.
        let _ = tokio::time::timeout(Duration::from_secs(5), process.drain_streams()).await;

        let result = TaskResult {
            id: request.id,
            script: request.script.clone(),
            status,
            output,
            stdout: process.stdout(),
            stderr: process.stderr(),
            additional_properties: request.additional_properties.clone(),
        };

        let ttl = self.config.engine.cache_ttl();
        let entry = CacheEntry::Done {
            result: result.clone(),
        };
        if let Err(e) = self.cache.put(key, entry, ttl).await {
            // Waiters would starve on a claim nobody resolves; release it
            // so they retry, and still hand the result to the direct caller.
            tracing::warn!(task_id = %request.id, error = %e, "failed to publish result");
            self.release(key, owner, request.id).await;
        }

        // Listeners fire exactly once, after publication, so they and the
        // direct caller observe the same view.
        self.listeners.notify(&result);

        tracing::info!(task_id = %request.id, status = ?status, "task finished");
        Ok(result)
    }

    async fn release(&self, key: &str, owner: &str, id: Uuid) {
        if let Err(e) = self.cache.remove_if_owner(key, owner).await {
            tracing::warn!(task_id = %id, error = %e, "failed to release claim");
        }
    }

    // ── Waiting path ──────────────────────────────────────────────────────────

    /// Poll the cache until the owner publishes, the entry vanishes
    /// (`Ok(None)` — caller should re-claim), or this caller's deadline
    /// expires.
    async fn await_published(
        &self,
        key: &str,
        request: &TaskRequest,
        deadline: Instant,
    ) -> Result<Option<TaskResult>, TaskError> {
        let poll = self.config.engine.claim_poll();
        loop {
            match self.cache.get(key).await {
                Ok(Some(CacheEntry::Done { result })) => {
                    tracing::debug!(task_id = %request.id, "shared result available");
                    return Ok(Some(result));
                }
                Ok(Some(CacheEntry::InFlight { .. })) => {}
                Ok(None) => return Ok(None),
                Err(e) => {
                    return Err(TaskError::Cache {
                        id: request.id,
                        message: e.to_string(),
                    })
                }
            }
            if Instant::now() + poll > deadline {
                // A waiter timing out does not cancel the shared execution;
                // other waiters may still be blocked on it.
                return Err(TaskError::Timeout {
                    id: request.id,
                    phase: Phase::Claim,
                });
            }
            tokio::time::sleep(poll).await;
        }
    }

    fn phase_timeout(&self, request: &TaskRequest) -> Duration {
        let minutes = request
            .timeout_minutes
            .unwrap_or(self.config.engine.default_timeout_minutes);
        Duration::from_secs(minutes.saturating_mul(60))
    }
}

/// Drive one handle through its lifecycle. A pre-start cancellation
/// surfaces as `Cancelled`, not as API misuse.
async fn drive(
    process: &TaskProcess,
    request: &TaskRequest,
    timeout: Duration,
) -> Result<Vec<u8>, TaskError> {
    match process.start() {
        Ok(()) => {}
        Err(TaskError::AlreadyCancelled { id }) => return Err(TaskError::Cancelled { id }),
        Err(e) => return Err(e),
    }
    process.write_input(&request.input, timeout).await?;
    let output = process.read_output(timeout).await?;
    process.wait(timeout).await?;
    Ok(output)
}

//! Process handle — owns one subprocess, its two named pipes, and the
//! task lifecycle state machine.
//!
//! Legal transitions, enforced under a single status lock:
//!
//! | From       | Event            | To         |
//! |------------|------------------|------------|
//! | Queued     | start()          | Running    |
//! | Queued     | request_cancel() | Cancelled  |
//! | Running    | exit code 0      | Success    |
//! | Running    | exit code ≠ 0    | Failed     |
//! | Running    | request_cancel() | Cancelling |
//! | Cancelling | exit (any code)  | Cancelled  |
//!
//! A background watcher owns the `Child`, observes exit independently of
//! any read/write call, applies the exit transition, and broadcasts the
//! exit code on a watch channel. `write_input`, `read_output`, and `wait`
//! race their pipe operation against that channel and a timeout —
//! first-completed-wins, so a hung subprocess can never block a caller
//! past its deadline.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use uuid::Uuid;

use crucible_core::config::CrucibleConfig;
use crucible_core::error::Phase;
use crucible_core::{TaskError, TaskRequest, TaskStatus};

use crate::pipe;

/// How long a clean exit waits for an already-racing frame operation to
/// settle. A process that writes its response and exits in the same
/// instant can have its exit observed before the frame is read.
const EXIT_FRAME_GRACE: Duration = Duration::from_secs(1);

/// Owning handle for one external process and its IPC channels.
#[derive(Debug)]
pub struct TaskProcess {
    id: Uuid,
    script: String,
    input_pipe: PathBuf,
    output_pipe: PathBuf,
    /// Launch command, built by `create`, consumed by `start`.
    command: Mutex<Option<Command>>,
    status: Arc<Mutex<TaskStatus>>,
    /// OS pid once started; 0 before.
    pid: AtomicI32,
    /// Exit code broadcast. None until the watcher observes exit.
    exit_tx: Arc<watch::Sender<Option<i32>>>,
    exit_rx: watch::Receiver<Option<i32>>,
    stdout_buf: Arc<Mutex<String>>,
    stderr_buf: Arc<Mutex<String>>,
    drains: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    kill_grace: Duration,
    cleaned: AtomicBool,
}

impl TaskProcess {
    /// Allocate the two per-task pipes and build the launch command.
    ///
    /// Pipe names are derived from the task id, so concurrent tasks never
    /// collide. On any failure, endpoints created so far are removed
    /// before the error propagates.
    pub fn create(request: &TaskRequest, config: &CrucibleConfig) -> Result<Self, TaskError> {
        let id = request.id;
        let setup = |source: io::Error| TaskError::Setup { id, source };

        let script_path = config.scripts.script_dir.join(&request.script);
        if !script_path.is_file() {
            return Err(setup(io::Error::new(
                io::ErrorKind::NotFound,
                format!("script not found: {}", script_path.display()),
            )));
        }

        std::fs::create_dir_all(&config.engine.pipe_dir).map_err(setup)?;
        let input_pipe = config.engine.pipe_dir.join(format!("input-{id}"));
        let output_pipe = config.engine.pipe_dir.join(format!("output-{id}"));

        tracing::debug!(
            task_id = %id,
            input = %input_pipe.display(),
            output = %output_pipe.display(),
            "creating task pipes"
        );
        pipe::create(&input_pipe).map_err(setup)?;
        if let Err(e) = pipe::create(&output_pipe) {
            pipe::remove(&input_pipe);
            return Err(setup(e));
        }

        let mut command = Command::new(&config.scripts.interpreter);
        command
            .arg(&script_path)
            .arg("--id")
            .arg(id.to_string())
            .arg("--input-pipe")
            .arg(&input_pipe)
            .arg("--output-pipe")
            .arg(&output_pipe)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let (exit_tx, exit_rx) = watch::channel(None);

        Ok(Self {
            id,
            script: request.script.clone(),
            input_pipe,
            output_pipe,
            command: Mutex::new(Some(command)),
            status: Arc::new(Mutex::new(TaskStatus::Queued)),
            pid: AtomicI32::new(0),
            exit_tx: Arc::new(exit_tx),
            exit_rx,
            stdout_buf: Arc::new(Mutex::new(String::new())),
            stderr_buf: Arc::new(Mutex::new(String::new())),
            drains: Mutex::new(Vec::new()),
            kill_grace: config.engine.kill_grace(),
            cleaned: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn input_pipe(&self) -> &Path {
        &self.input_pipe
    }

    pub fn output_pipe(&self) -> &Path {
        &self.output_pipe
    }

    pub fn status(&self) -> TaskStatus {
        *lock(&self.status)
    }

    /// Wait for the stdio drain tasks to hit end-of-stream, so `stdout()`
    /// and `stderr()` are complete. Only meaningful once the process has
    /// exited; the streams stay open while it runs.
    pub async fn drain_streams(&self) {
        let handles: Vec<_> = lock(&self.drains).drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Drained stdout text so far.
    pub fn stdout(&self) -> String {
        lock(&self.stdout_buf).clone()
    }

    /// Drained stderr text so far.
    pub fn stderr(&self) -> String {
        lock(&self.stderr_buf).clone()
    }

    /// Launch the process: Queued → Running.
    ///
    /// Spawns the exit watcher and one drain task per stdio stream. Fails
    /// with `AlreadyCancelled` if a cancellation arrived first, and with
    /// `AlreadyStarted` on any other non-Queued status.
    pub fn start(&self) -> Result<(), TaskError> {
        {
            let mut status = lock(&self.status);
            match *status {
                TaskStatus::Cancelled => {
                    return Err(TaskError::AlreadyCancelled { id: self.id });
                }
                TaskStatus::Queued => {}
                _ => return Err(TaskError::AlreadyStarted { id: self.id }),
            }
            *status = TaskStatus::Running;
        }

        let command = lock(&self.command).take();
        let Some(mut command) = command else {
            return Err(TaskError::AlreadyStarted { id: self.id });
        };

        tracing::info!(task_id = %self.id, script = %self.script, "starting task process");
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                *lock(&self.status) = TaskStatus::Failed;
                return Err(TaskError::Setup { id: self.id, source: e });
            }
        };
        self.pid
            .store(child.id().map(|p| p as i32).unwrap_or(0), Ordering::SeqCst);

        // Drain stdout/stderr as lines arrive. Draining continuously keeps
        // the child from stalling on a full pipe.
        {
            let mut drains = lock(&self.drains);
            if let Some(stdout) = child.stdout.take() {
                drains.push(spawn_drain(self.id, stdout, Arc::clone(&self.stdout_buf), false));
            }
            if let Some(stderr) = child.stderr.take() {
                drains.push(spawn_drain(self.id, stderr, Arc::clone(&self.stderr_buf), true));
            }
        }

        // Exit watcher: owns the child, applies the exit transition, and
        // broadcasts the code to everyone racing against it.
        let id = self.id;
        let status = Arc::clone(&self.status);
        let exit_tx = Arc::clone(&self.exit_tx);
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(exit) => exit.code().unwrap_or(-1),
                Err(e) => {
                    tracing::warn!(task_id = %id, error = %e, "failed to reap task process");
                    -1
                }
            };
            {
                let mut status = lock(&status);
                *status = match (*status, code) {
                    (TaskStatus::Cancelling, _) => TaskStatus::Cancelled,
                    (TaskStatus::Running, 0) => TaskStatus::Success,
                    (TaskStatus::Running, _) => TaskStatus::Failed,
                    (other, _) => other,
                };
                tracing::info!(task_id = %id, code, status = ?*status, "task process exited");
            }
            let _ = exit_tx.send(Some(code));
        });

        Ok(())
    }

    /// Write the input payload as one frame, racing against process exit
    /// and the timeout. On timeout the pending pipe worker is abandoned
    /// and the process is left running.
    pub async fn write_input(&self, payload: &[u8], timeout: Duration) -> Result<(), TaskError> {
        tracing::debug!(task_id = %self.id, pipe = %self.input_pipe.display(), "writing input frame");
        let mut exit_rx = self.exit_rx.clone();
        let race = async {
            let write = pipe::write_frame(&self.input_pipe, payload);
            tokio::pin!(write);
            tokio::select! {
                res = &mut write => match res {
                    Ok(()) => Ok(()),
                    Err(e) => Err(self.classify_io(e)),
                },
                code = wait_exit(&mut exit_rx) => {
                    // A fast consumer can exit before the write reports
                    // completion; let it settle before classifying.
                    let settled = if code == 0 {
                        tokio::time::timeout(EXIT_FRAME_GRACE, &mut write).await.ok()
                    } else {
                        None
                    };
                    match settled {
                        Some(Ok(())) => Ok(()),
                        _ => Err(self.classify_exit(code)),
                    }
                }
            }
        };
        match tokio::time::timeout(timeout, race).await {
            Ok(res) => res,
            Err(_) => Err(TaskError::Timeout {
                id: self.id,
                phase: Phase::Write,
            }),
        }
    }

    /// Read exactly one response frame, with the same racing rules as
    /// `write_input`.
    pub async fn read_output(&self, timeout: Duration) -> Result<Vec<u8>, TaskError> {
        tracing::debug!(task_id = %self.id, pipe = %self.output_pipe.display(), "reading output frame");
        let mut exit_rx = self.exit_rx.clone();
        let race = async {
            let read = pipe::read_frame(&self.output_pipe);
            tokio::pin!(read);
            tokio::select! {
                res = &mut read => match res {
                    Ok(frame) => Ok(frame),
                    Err(e) => Err(self.classify_io(e)),
                },
                code = wait_exit(&mut exit_rx) => {
                    // The response frame is still in the pipe when the
                    // writer exits right after sending it. Never drop the
                    // in-flight read on a clean exit; finish it.
                    let settled = if code == 0 {
                        tokio::time::timeout(EXIT_FRAME_GRACE, &mut read).await.ok()
                    } else {
                        None
                    };
                    match settled {
                        Some(Ok(frame)) => Ok(frame),
                        _ => Err(self.classify_exit(code)),
                    }
                }
            }
        };
        match tokio::time::timeout(timeout, race).await {
            Ok(res) => res,
            Err(_) => Err(TaskError::Timeout {
                id: self.id,
                phase: Phase::Read,
            }),
        }
    }

    /// Block until the process exits or the timeout elapses. Non-zero exit
    /// is `Process` unless cancellation was requested first, in which case
    /// it surfaces as `Cancelled`.
    pub async fn wait(&self, timeout: Duration) -> Result<(), TaskError> {
        let mut exit_rx = self.exit_rx.clone();
        let code = match tokio::time::timeout(timeout, wait_exit(&mut exit_rx)).await {
            Ok(code) => code,
            Err(_) => {
                return Err(TaskError::Timeout {
                    id: self.id,
                    phase: Phase::Wait,
                })
            }
        };
        if code == 0 {
            return Ok(());
        }
        match self.status() {
            TaskStatus::Cancelled | TaskStatus::Cancelling => {
                Err(TaskError::Cancelled { id: self.id })
            }
            _ => Err(TaskError::Process { id: self.id, code }),
        }
    }

    /// Flag the task for cancellation. Idempotent, non-blocking, never
    /// errors. Returns true only for the single Running → Cancelling
    /// transition — the signal that a process actually needs stopping.
    pub fn request_cancel(&self) -> bool {
        let mut status = lock(&self.status);
        match *status {
            TaskStatus::Queued => {
                tracing::debug!(task_id = %self.id, "cancelled before start");
                *status = TaskStatus::Cancelled;
                false
            }
            TaskStatus::Running => {
                *status = TaskStatus::Cancelling;
                true
            }
            _ => false,
        }
    }

    /// Cancel the task. If a process is running, send SIGTERM, wait up to
    /// the kill grace period for the watcher to observe exit, then SIGKILL.
    /// Safe to call any number of times, in any state.
    pub async fn cancel(&self) -> bool {
        if !self.request_cancel() {
            return false;
        }
        // request_cancel only returns true from Running, so a pid exists.
        let pid = self.pid.load(Ordering::SeqCst);
        if pid <= 0 {
            return true;
        }
        tracing::info!(task_id = %self.id, pid, "cancelling task process");
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
        let mut exit_rx = self.exit_rx.clone();
        match tokio::time::timeout(self.kill_grace, wait_exit(&mut exit_rx)).await {
            Ok(code) => {
                tracing::info!(task_id = %self.id, code, "task process cancelled");
            }
            Err(_) => {
                tracing::warn!(task_id = %self.id, pid, "process ignored SIGTERM, sending SIGKILL");
                unsafe {
                    libc::kill(pid, libc::SIGKILL);
                }
            }
        }
        true
    }

    /// Remove both pipe endpoints and force-kill any residual process.
    /// Runs at most once; also invoked from `Drop` so every exit path —
    /// completion, error, cancellation — releases the OS resources.
    pub fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(task_id = %self.id, "cleaning up task pipes");
        // Wake any frame worker still parked in a FIFO open before the
        // paths disappear.
        pipe::release(&self.input_pipe);
        pipe::release(&self.output_pipe);
        pipe::remove(&self.input_pipe);
        pipe::remove(&self.output_pipe);

        self.request_cancel();
        let pid = self.pid.load(Ordering::SeqCst);
        if pid > 0 && self.exit_rx.borrow().is_none() {
            unsafe {
                libc::kill(pid, libc::SIGKILL);
            }
        }
    }

    fn classify_exit(&self, code: i32) -> TaskError {
        match self.status() {
            TaskStatus::Cancelled | TaskStatus::Cancelling => {
                TaskError::Cancelled { id: self.id }
            }
            _ => TaskError::EarlyExit { id: self.id, code },
        }
    }

    /// An I/O error on a pipe usually means the other end died; prefer the
    /// exit classification when the exit code is already known.
    fn classify_io(&self, e: io::Error) -> TaskError {
        match *self.exit_rx.borrow() {
            Some(code) => self.classify_exit(code),
            None => TaskError::Setup {
                id: self.id,
                source: e,
            },
        }
    }
}

impl Drop for TaskProcess {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Await the exit code broadcast. The sender lives in the handle, so the
/// channel cannot close before it resolves.
async fn wait_exit(rx: &mut watch::Receiver<Option<i32>>) -> i32 {
    match rx.wait_for(|v| v.is_some()).await {
        Ok(code) => code.unwrap_or(-1),
        Err(_) => -1,
    }
}

fn spawn_drain(
    id: Uuid,
    stream: impl AsyncRead + Unpin + Send + 'static,
    buffer: Arc<Mutex<String>>,
    is_stderr: bool,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if is_stderr {
                tracing::warn!(task_id = %id, "stderr: {line}");
            } else {
                tracing::info!(task_id = %id, "stdout: {line}");
            }
            let mut buffer = lock(&buffer);
            buffer.push_str(&line);
            buffer.push('\n');
        }
    })
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

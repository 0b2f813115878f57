//! Process management layer
//!
//! Handles the agent process lifecycle and stderr capture, completely
//! separate from transport concerns. The manager hands out the child's
//! stdio exactly once; what flows over it is someone else's business.

use crate::io::transport::StreamTransport;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, trace, warn};

// ============================================================================
// Constants
// ============================================================================

/// Upper bound on retained stderr text; oldest lines are evicted first
pub const STDERR_BUFFER_LIMIT: usize = 64 * 1024;

/// How long a SIGTERM gets before the process is killed outright
const TERMINATE_GRACE: Duration = Duration::from_secs(1);

// ============================================================================
// Process State Management
// ============================================================================

/// How to stop a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Close stdin and wait, then SIGTERM, then kill
    Graceful,
    /// Kill immediately
    Force,
}

/// Process lifecycle states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    /// Process has not been started yet
    NotStarted,
    /// Process is currently running
    Running { pid: u32 },
    /// Process has exited; `code` is `None` when killed by a signal
    Exited { code: Option<i32> },
}

impl ProcessState {
    /// Get the process ID if the process is running
    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessState::Running { pid } => Some(*pid),
            _ => None,
        }
    }

    /// Check if the process is currently running
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running { .. })
    }

    pub fn has_exited(&self) -> bool {
        matches!(self, ProcessState::Exited { .. })
    }
}

// ============================================================================
// Stderr Capture
// ============================================================================

/// Append-only ring of stderr lines, bounded by total byte size
#[derive(Debug, Default)]
pub struct StderrBuffer {
    lines: VecDeque<String>,
    bytes: usize,
}

impl StderrBuffer {
    pub fn push(&mut self, line: String) {
        self.bytes += line.len() + 1;
        self.lines.push_back(line);
        while self.bytes > STDERR_BUFFER_LIMIT && self.lines.len() > 1 {
            if let Some(evicted) = self.lines.pop_front() {
                self.bytes -= evicted.len() + 1;
            }
        }
    }

    /// All retained lines joined with newlines
    pub fn contents(&self) -> String {
        self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

// ============================================================================
// Process Management
// ============================================================================

/// Error types for process management
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Process not started")]
    NotStarted,

    #[error("Process already started")]
    AlreadyStarted,

    #[error("Stdin not available")]
    StdinNotAvailable,

    #[error("Stdout not available")]
    StdoutNotAvailable,

    #[error("Stderr not available")]
    StderrNotAvailable,
}

/// Trait for managing external process lifecycle
#[async_trait]
pub trait ProcessManager: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Start the external process
    async fn start(&self) -> Result<(), Self::Error>;

    /// Stop the external process, waiting at most `grace` per escalation step
    async fn stop(&self, mode: StopMode, grace: Duration) -> Result<(), Self::Error>;

    /// Check if the process is currently running
    fn is_running(&self) -> bool;

    /// Create a transport over the process stdin/stdout.
    /// This consumes both streams.
    fn create_stdio_transport(&self) -> Result<StreamTransport, Self::Error>;

    /// Request an immediate kill without waiting for the exit to be observed
    fn kill(&self);
}

/// Streams taken from the child at spawn time, handed out once
#[derive(Default)]
struct ChildPipes {
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
}

/// Manages the child process spawned via Command
pub struct ChildProcessManager {
    /// Command to execute
    command: String,

    /// Command arguments
    args: Vec<String>,

    /// Working directory for the process (optional)
    working_directory: Option<PathBuf>,

    /// Extra environment for the process
    env: HashMap<String, String>,

    /// Published process state; the wait task is the only writer after start
    state_tx: watch::Sender<ProcessState>,

    pipes: Mutex<ChildPipes>,

    /// Retained stderr lines
    stderr: Arc<Mutex<StderrBuffer>>,

    /// Flips to true once stderr hits EOF
    stderr_closed: watch::Sender<bool>,

    /// Kill request channel into the wait task
    kill_sender: Mutex<Option<oneshot::Sender<()>>>,
}

impl ChildProcessManager {
    /// Create a new child process manager
    ///
    /// # Arguments
    /// * `command` - The command to execute
    /// * `args` - Command line arguments
    /// * `working_dir` - Optional working directory for the process
    pub fn new(command: String, args: Vec<String>, working_dir: Option<PathBuf>) -> Self {
        let (state_tx, _) = watch::channel(ProcessState::NotStarted);
        let (stderr_closed, _) = watch::channel(false);
        Self {
            command,
            args,
            working_directory: working_dir,
            env: HashMap::new(),
            state_tx,
            pipes: Mutex::new(ChildPipes::default()),
            stderr: Arc::new(Mutex::new(StderrBuffer::default())),
            stderr_closed,
            kill_sender: Mutex::new(None),
        }
    }

    /// Add environment variables for the spawned process
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    /// Get current process state
    pub fn get_state(&self) -> ProcessState {
        self.state_tx.borrow().clone()
    }

    /// Watch process state changes
    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state_tx.subscribe()
    }

    /// Snapshot of captured stderr
    pub fn stderr_output(&self) -> String {
        self.stderr
            .lock()
            .map(|buffer| buffer.contents())
            .unwrap_or_default()
    }

    /// Take stdout alone, for modes where it is not the RPC channel
    pub fn take_stdout(&self) -> Result<ChildStdout, ProcessError> {
        let mut pipes = self.pipes.lock().map_err(|_| ProcessError::NotStarted)?;
        pipes.stdout.take().ok_or(ProcessError::StdoutNotAvailable)
    }

    /// Close the child's stdin if we still hold it
    pub fn close_stdin(&self) {
        if let Ok(mut pipes) = self.pipes.lock() {
            if pipes.stdin.take().is_some() {
                trace!("ChildProcessManager: closed stdin of {}", self.command);
            }
        }
    }

    /// Wait until the process has exited, up to `timeout`.
    /// Returns the final state, or `None` on timeout.
    pub async fn wait_for_exit(&self, timeout: Duration) -> Option<ProcessState> {
        let mut receiver = self.state_tx.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            receiver
                .wait_for(|state| state.has_exited())
                .await
                .map(|state| (*state).clone())
        })
        .await;
        match waited {
            Ok(Ok(state)) => Some(state),
            Ok(Err(_)) => Some(self.get_state()),
            Err(_) => None,
        }
    }

    /// Wait until stderr is fully drained, up to `timeout`
    pub async fn wait_for_stderr(&self, timeout: Duration) -> bool {
        let mut receiver = self.stderr_closed.subscribe();
        tokio::time::timeout(timeout, async {
            receiver.wait_for(|closed| *closed).await.is_ok()
        })
        .await
        .unwrap_or(false)
    }

    /// Spawn the stderr monitoring task with a provided stderr pipe
    ///
    /// Always drains stderr to prevent the child from blocking on a full pipe.
    /// Every line lands in the bounded buffer.
    fn spawn_stderr_monitor(&self, stderr: ChildStderr) {
        let buffer = Arc::clone(&self.stderr);
        let closed = self.stderr_closed.clone();
        let command = self.command.clone();

        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        trace!("ChildProcessManager: stderr EOF reached");
                        break;
                    }
                    Ok(_) => {
                        let line_content = line.trim_end().to_string();
                        if line_content.is_empty() {
                            continue;
                        }
                        debug!(target: "agent_stderr", "[{}] {}", command, line_content);
                        if let Ok(mut buffer) = buffer.lock() {
                            buffer.push(line_content);
                        }
                    }
                    Err(e) => {
                        error!("Failed to read from stderr: {}", e);
                        break;
                    }
                }
            }

            closed.send_replace(true);
        });
    }

    /// Spawn the wait task that owns the child and publishes its exit
    fn spawn_wait_task(&self, mut child: Child, pid: u32, kill_receiver: oneshot::Receiver<()>) {
        let state_tx = self.state_tx.clone();

        tokio::spawn(async move {
            trace!("ChildProcessManager: Starting wait task for PID {}", pid);

            let status = tokio::select! {
                status = child.wait() => status,
                // A dropped sender means the manager is gone; kill in both cases
                _ = kill_receiver => {
                    debug!("ChildProcessManager: killing PID {}", pid);
                    if let Err(e) = child.start_kill() {
                        warn!("Failed to kill PID {}: {}", pid, e);
                    }
                    child.wait().await
                }
            };

            let code = match status {
                Ok(exit_status) => {
                    info!("Process PID {} exited with status: {}", pid, exit_status);
                    exit_status.code()
                }
                Err(e) => {
                    error!("Error waiting for child process: {}", e);
                    None
                }
            };
            state_tx.send_replace(ProcessState::Exited { code });

            trace!("ChildProcessManager: Wait task finished for PID {}", pid);
        });
    }

    #[cfg(unix)]
    fn terminate(&self, pid: u32) {
        // SAFETY: plain kill(2) on a pid we spawned and have not yet reaped
        unsafe {
            if libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 {
                info!("Sent SIGTERM to process {}", pid);
            }
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self, _pid: u32) {
        warn!("SIGTERM unavailable on this platform, killing instead");
        self.kill();
    }
}

#[async_trait]
impl ProcessManager for ChildProcessManager {
    type Error = ProcessError;

    async fn start(&self) -> Result<(), Self::Error> {
        if !matches!(self.get_state(), ProcessState::NotStarted) {
            return Err(ProcessError::AlreadyStarted);
        }

        info!("Starting process: {} {:?}", self.command, self.args);

        let mut command_builder = Command::new(&self.command);
        command_builder
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(working_dir) = &self.working_directory {
            command_builder.current_dir(working_dir);
        }

        let mut child = command_builder.spawn()?;

        let pid = child
            .id()
            .ok_or_else(|| ProcessError::Io(io::Error::other("Failed to get process ID")))?;
        info!("Process started with PID: {}", pid);

        let stdin = child.stdin.take().ok_or(ProcessError::StdinNotAvailable)?;
        let stdout = child
            .stdout
            .take()
            .ok_or(ProcessError::StdoutNotAvailable)?;
        let stderr = child
            .stderr
            .take()
            .ok_or(ProcessError::StderrNotAvailable)?;

        if let Ok(mut pipes) = self.pipes.lock() {
            pipes.stdin = Some(stdin);
            pipes.stdout = Some(stdout);
        }

        self.state_tx.send_replace(ProcessState::Running { pid });

        self.spawn_stderr_monitor(stderr);

        let (kill_sender, kill_receiver) = oneshot::channel();
        if let Ok(mut slot) = self.kill_sender.lock() {
            *slot = Some(kill_sender);
        }
        self.spawn_wait_task(child, pid, kill_receiver);

        Ok(())
    }

    async fn stop(&self, mode: StopMode, grace: Duration) -> Result<(), Self::Error> {
        let pid = match self.get_state() {
            ProcessState::Running { pid } => pid,
            ProcessState::Exited { .. } => return Ok(()),
            ProcessState::NotStarted => return Err(ProcessError::NotStarted),
        };

        match mode {
            StopMode::Graceful => {
                info!("Gracefully stopping process with PID: {}", pid);
                self.close_stdin();
                if self.wait_for_exit(grace).await.is_some() {
                    return Ok(());
                }

                self.terminate(pid);
                if self.wait_for_exit(TERMINATE_GRACE).await.is_some() {
                    return Ok(());
                }

                warn!("Process {} ignored SIGTERM, killing", pid);
                self.kill();
            }
            StopMode::Force => {
                info!("Force killing process with PID: {}", pid);
                self.kill();
            }
        }

        if self.wait_for_exit(grace).await.is_none() {
            warn!("Process {} did not report exit after kill", pid);
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.get_state().is_running()
    }

    fn create_stdio_transport(&self) -> Result<StreamTransport, Self::Error> {
        let mut pipes = self.pipes.lock().map_err(|_| ProcessError::NotStarted)?;
        if pipes.stdin.is_none() && pipes.stdout.is_none() {
            return Err(ProcessError::NotStarted);
        }
        let stdin = pipes.stdin.take().ok_or(ProcessError::StdinNotAvailable)?;
        let stdout = pipes.stdout.take().ok_or(ProcessError::StdoutNotAvailable)?;
        Ok(StreamTransport::from_child(stdin, stdout))
    }

    fn kill(&self) {
        let sender = self.kill_sender.lock().ok().and_then(|mut slot| slot.take());
        if let Some(sender) = sender {
            // Wait task may already be gone; nothing to do then
            let _ = sender.send(());
        }
        self.close_stdin();
    }
}

//! Process supervision on a pseudo-terminal
//!
//! The child runs as a session leader with the PTY as its controlling
//! terminal. Three blocking threads service it: an output pump feeding a
//! bounded channel, an input sink fed by the session, and an exit watcher
//! that publishes the exit status exactly once.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use msh_protocol::{RemoteStatus, SignalKind, TerminalSize};
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, ExitStatus, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const READ_BUFFER_SIZE: usize = 4096;

/// Time a hung-up child gets to exit before it is killed outright
const TERMINATE_GRACE: Duration = Duration::from_secs(1);

/// Errors from the process supervisor
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// The program could not be found or started
    #[error("failed to start {program}: {reason}")]
    SpawnFailed { program: String, reason: String },

    /// No pseudo-terminal could be allocated
    #[error("failed to allocate a pseudo-terminal: {0}")]
    PtyAllocationFailed(String),

    /// The process has already exited
    #[error("process is not running")]
    NotRunning,

    /// Signals cannot be delivered on this platform
    #[error("signal delivery is not supported on this platform")]
    Unsupported,

    #[error("failed to deliver {signal}: {reason}")]
    Signal { signal: &'static str, reason: String },

    #[error("failed to resize terminal: {0}")]
    Resize(String),
}

impl SupervisorError {
    /// Exit status reported to the peer when starting the process failed
    pub fn remote_status(&self) -> Option<RemoteStatus> {
        match self {
            SupervisorError::SpawnFailed { program, reason } => {
                Some(RemoteStatus::SpawnFailed(format!("{}: {}", program, reason)))
            }
            SupervisorError::PtyAllocationFailed(reason) => {
                Some(RemoteStatus::PtyAllocationFailed(reason.clone()))
            }
            _ => None,
        }
    }
}

/// How the supervised process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
    Exited(i32),
    Signaled(String),
}

impl ProcessExit {
    fn from_status(status: &ExitStatus) -> Self {
        match status.signal() {
            Some(name) => ProcessExit::Signaled(name.to_string()),
            None => ProcessExit::Exited(status.exit_code() as i32),
        }
    }
}

impl From<ProcessExit> for RemoteStatus {
    fn from(exit: ProcessExit) -> Self {
        match exit {
            ProcessExit::Exited(code) => RemoteStatus::Exited(code),
            ProcessExit::Signaled(name) => RemoteStatus::Signaled(name),
        }
    }
}

impl std::fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessExit::Exited(code) => write!(f, "exited with code {}", code),
            ProcessExit::Signaled(name) => write!(f, "killed by signal {}", name),
        }
    }
}

/// What to run
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Added to the listener's own environment
    pub env: Vec<(String, String)>,
    pub size: TerminalSize,
    /// Output chunks buffered before PTY reads pause
    pub output_window: usize,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: Vec::new(),
            size: TerminalSize::default_size(),
            output_window: 32,
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn size(mut self, size: TerminalSize) -> Self {
        self.size = size;
        self
    }

    pub fn output_window(mut self, chunks: usize) -> Self {
        self.output_window = chunks.max(1);
        self
    }
}

/// Channels to a running process's terminal
pub struct ProcessIo {
    /// Terminal output; closes once the PTY reaches end of file
    pub output_rx: mpsc::Receiver<Bytes>,
    /// Terminal input
    pub input_tx: mpsc::Sender<Bytes>,
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// A process running on a pseudo-terminal
pub struct ProcessHandle {
    pid: u32,
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    terminated: AtomicBool,
}

impl ProcessHandle {
    /// Start a program on a new pseudo-terminal
    pub fn start(spec: ProcessSpec) -> Result<(Arc<Self>, ProcessIo), SupervisorError> {
        let spawn_failed = |reason: String| SupervisorError::SpawnFailed {
            program: spec.program.clone(),
            reason,
        };

        let executable = which::which(&spec.program).map_err(|e| spawn_failed(e.to_string()))?;

        let pair = native_pty_system()
            .openpty(pty_size(spec.size))
            .map_err(|e| SupervisorError::PtyAllocationFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&executable);
        cmd.args(&spec.args);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| spawn_failed(e.to_string()))?;
        // Only the child may hold the slave, so its exit ends the output
        drop(pair.slave);

        let master = pair.master;
        let mut killer = child.clone_killer();
        let terminal = master
            .try_clone_reader()
            .and_then(|reader| Ok((reader, master.take_writer()?)));
        let (reader, writer) = match terminal {
            Ok(terminal) => terminal,
            Err(e) => {
                let _ = killer.kill();
                let _ = child.wait();
                return Err(SupervisorError::PtyAllocationFailed(e.to_string()));
            }
        };

        let pid = child.process_id().unwrap_or(0);
        info!(
            "Started {} (pid {}) on a {} terminal",
            executable.display(),
            pid,
            spec.size
        );

        let (output_tx, output_rx) = mpsc::channel(spec.output_window.max(1));
        let (input_tx, input_rx) = mpsc::channel(spec.output_window.max(1));
        let (exit_tx, exit_rx) = watch::channel(None);

        spawn_output_pump(pid, reader, output_tx);
        spawn_input_sink(pid, writer, input_rx);

        tokio::task::spawn_blocking(move || {
            let exit = match child.wait() {
                Ok(status) => ProcessExit::from_status(&status),
                Err(e) => {
                    warn!("Failed to wait for pid {}: {}", pid, e);
                    ProcessExit::Exited(255)
                }
            };
            info!("Process {} {}", pid, exit);
            let _ = exit_tx.send(Some(exit));
        });

        let handle = Arc::new(Self {
            pid,
            master: Mutex::new(master),
            killer: Mutex::new(killer),
            exit_rx,
            terminated: AtomicBool::new(false),
        });
        Ok((handle, ProcessIo { output_rx, input_tx }))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Exit status, once the process has ended
    pub fn exit_status(&self) -> Option<ProcessExit> {
        self.exit_rx.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    /// Wait for the process to end
    pub async fn wait(&self) -> ProcessExit {
        let mut exit_rx = self.exit_rx.clone();
        loop {
            if let Some(exit) = exit_rx.borrow_and_update().clone() {
                return exit;
            }
            if exit_rx.changed().await.is_err() {
                // The watcher always publishes before it goes away
                return exit_rx.borrow().clone().unwrap_or(ProcessExit::Exited(255));
            }
        }
    }

    /// Change the terminal size; ignored once the process has exited
    pub fn resize(&self, size: TerminalSize) -> Result<(), SupervisorError> {
        if !self.is_running() {
            return Ok(());
        }
        debug!("Resizing pid {} terminal to {}", self.pid, size);
        let master = self
            .master
            .lock()
            .map_err(|_| SupervisorError::Resize("terminal lock poisoned".into()))?;
        master
            .resize(pty_size(size))
            .map_err(|e| SupervisorError::Resize(e.to_string()))
    }

    /// Deliver a signal to the terminal's foreground process group
    #[cfg(unix)]
    pub fn deliver_signal(&self, kind: SignalKind) -> Result<(), SupervisorError> {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if !self.is_running() {
            return Err(SupervisorError::NotRunning);
        }

        let signal = match kind {
            SignalKind::Interrupt => Signal::SIGINT,
            SignalKind::Terminate => Signal::SIGTERM,
            SignalKind::Hangup => Signal::SIGHUP,
            SignalKind::Kill => Signal::SIGKILL,
            SignalKind::Quit => Signal::SIGQUIT,
            SignalKind::Suspend => Signal::SIGTSTP,
            SignalKind::Continue => Signal::SIGCONT,
        };

        let group = self
            .master
            .lock()
            .ok()
            .and_then(|master| master.process_group_leader())
            .filter(|leader| *leader > 0)
            .or(self.own_group())
            .ok_or(SupervisorError::NotRunning)?;

        debug!("Sending {} to process group {}", kind.name(), group);
        killpg(Pid::from_raw(group), signal).map_err(|e| SupervisorError::Signal {
            signal: kind.name(),
            reason: e.to_string(),
        })
    }

    #[cfg(not(unix))]
    pub fn deliver_signal(&self, _kind: SignalKind) -> Result<(), SupervisorError> {
        if !self.is_running() {
            return Err(SupervisorError::NotRunning);
        }
        Err(SupervisorError::Unsupported)
    }

    /// Hang up on the process, killing it if it lingers; idempotent
    pub async fn terminate(&self) -> ProcessExit {
        if self.terminated.swap(true, Ordering::SeqCst) || !self.is_running() {
            return self.wait().await;
        }

        debug!("Terminating pid {}", self.pid);
        self.hang_up();
        match tokio::time::timeout(TERMINATE_GRACE, self.wait()).await {
            Ok(exit) => exit,
            Err(_) => {
                warn!("Pid {} ignored hangup, killing", self.pid);
                self.force_kill();
                self.wait().await
            }
        }
    }

    fn kill(&self) {
        if let Ok(mut killer) = self.killer.lock() {
            if let Err(e) = killer.kill() {
                debug!("Failed to hang up pid {}: {}", self.pid, e);
            }
        }
    }

    /// The child leads its own process group; pid 0 would address ours
    #[cfg(unix)]
    fn own_group(&self) -> Option<i32> {
        i32::try_from(self.pid).ok().filter(|pid| *pid > 0)
    }

    /// Hang up on the child's whole process group
    #[cfg(unix)]
    fn hang_up(&self) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let hung_up = self
            .own_group()
            .map(|group| killpg(Pid::from_raw(group), Signal::SIGHUP).is_ok())
            .unwrap_or(false);
        if !hung_up {
            self.kill();
        }
    }

    #[cfg(not(unix))]
    fn hang_up(&self) {
        self.kill();
    }

    #[cfg(unix)]
    fn force_kill(&self) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        match self.own_group() {
            Some(group) => {
                if let Err(e) = killpg(Pid::from_raw(group), Signal::SIGKILL) {
                    debug!("Failed to kill pid {}: {}", self.pid, e);
                }
            }
            None => self.kill(),
        }
    }

    #[cfg(not(unix))]
    fn force_kill(&self) {
        self.kill();
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if !self.terminated.load(Ordering::SeqCst) && self.is_running() {
            self.kill();
        }
    }
}

fn spawn_output_pump(pid: u32, mut reader: Box<dyn Read + Send>, output_tx: mpsc::Sender<Bytes>) {
    let pump = std::thread::Builder::new()
        .name(format!("pty-out-{}", pid))
        .spawn(move || {
            let mut buf = [0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        // Blocks while the session is behind, pausing PTY reads
                        if output_tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    // Linux reports EIO once the slave side is gone
                    Err(e) => {
                        debug!("PTY read for pid {} ended: {}", pid, e);
                        break;
                    }
                }
            }
            debug!("PTY output for pid {} reached end of file", pid);
        });
    if let Err(e) = pump {
        warn!("Failed to start output pump for pid {}: {}", pid, e);
    }
}

fn spawn_input_sink(pid: u32, mut writer: Box<dyn Write + Send>, mut input_rx: mpsc::Receiver<Bytes>) {
    let sink = std::thread::Builder::new()
        .name(format!("pty-in-{}", pid))
        .spawn(move || {
            while let Some(chunk) = input_rx.blocking_recv() {
                if let Err(e) = writer.write_all(&chunk).and_then(|_| writer.flush()) {
                    debug!("PTY write for pid {} failed: {}", pid, e);
                    break;
                }
            }
        });
    if let Err(e) = sink {
        warn!("Failed to start input sink for pid {}: {}", pid, e);
    }
}

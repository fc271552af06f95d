//! Local terminal adapter
//!
//! Puts the invoking terminal in raw mode once the remote program is
//! running, so the remote side owns echo and line editing. Input is read on
//! a blocking thread, window changes and signals arrive through
//! `tokio::signal`, and output is written and flushed in arrival order.
//! The original terminal mode is restored on every way out of the session.

use std::io::{self, Read};

use bytes::Bytes;
use crossterm::terminal;
use crossterm::tty::IsTty;
use msh_core::types::ClientState;
use msh_protocol::{SignalKind, StreamKind, TerminalSize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::session::{ClientSession, LocalEnds, LocalIo, LocalSignal, SessionEnd};

/// Input chunks and output writes allowed to queue
const IO_WINDOW: usize = 32;
/// Largest single read from local input
const INPUT_CHUNK: usize = 4096;

/// Raw mode for as long as the guard lives
pub struct RawModeGuard {
    enabled: bool,
}

impl RawModeGuard {
    /// Switch the terminal to raw mode, remembering the current mode
    pub fn enable() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        debug!("Terminal in raw mode");
        Ok(Self { enabled: true })
    }

    /// Restore the remembered mode; idempotent
    pub fn restore(&mut self) {
        if !self.enabled {
            return;
        }
        self.enabled = false;
        match terminal::disable_raw_mode() {
            Ok(()) => debug!("Terminal mode restored"),
            Err(e) => warn!("Could not restore terminal mode: {}", e),
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        self.restore();
    }
}

/// The terminal this process was started from
#[derive(Debug, Clone, Copy)]
pub struct LocalTerminal {
    interactive: bool,
}

impl LocalTerminal {
    /// Inspect standard input
    pub fn detect() -> Self {
        Self {
            interactive: io::stdin().is_tty(),
        }
    }

    /// Whether input comes from a terminal
    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    /// Current window size; 80x24 when there is no terminal to ask
    pub fn size(&self) -> TerminalSize {
        if self.interactive {
            if let Ok((cols, rows)) = terminal::size() {
                if cols > 0 && rows > 0 {
                    return TerminalSize::new(rows, cols);
                }
            }
        }
        TerminalSize::default_size()
    }

    /// Run a session attached to this terminal
    pub async fn attach(self, session: ClientSession) -> Result<SessionEnd, ClientError> {
        let term = std::env::var("TERM").ok().filter(|term| !term.is_empty());
        let (local, ends) = LocalIo::pair(term, self.size(), IO_WINDOW);
        let LocalEnds {
            size_tx,
            input_tx,
            signal_tx,
            output_rx,
        } = ends;

        let mut states = session.subscribe_state();
        spawn_input_reader(input_tx)?;
        let signals = tokio::spawn(watch_signals(self, size_tx, signal_tx));
        let writer = tokio::spawn(write_output(output_rx));

        let mut raw: Option<RawModeGuard> = None;
        let mut watching = self.interactive;
        let running = session.run(local);
        tokio::pin!(running);

        let result = loop {
            tokio::select! {
                result = &mut running => break result,
                changed = states.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                        continue;
                    }
                    if *states.borrow_and_update() == ClientState::Active {
                        watching = false;
                        match RawModeGuard::enable() {
                            Ok(guard) => raw = Some(guard),
                            Err(e) => break Err(ClientError::Terminal(e)),
                        }
                    }
                }
            }
        };

        signals.abort();
        // The session dropped its output sender; wait for the last write
        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Output writer stopped: {}", e),
            Err(e) => debug!("Output writer failed: {}", e),
        }
        drop(raw);
        result
    }
}

/// Read raw input on a dedicated thread; a blocked read never holds up the runtime
fn spawn_input_reader(input_tx: mpsc::Sender<Bytes>) -> io::Result<()> {
    std::thread::Builder::new()
        .name("meshsh-stdin".to_string())
        .spawn(move || {
            let mut stdin = io::stdin().lock();
            let mut buf = [0u8; INPUT_CHUNK];
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        // Blocks while the data window is full
                        if input_tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!("Local input error: {}", e);
                        break;
                    }
                }
            }
        })?;
    Ok(())
}

async fn write_output(mut output_rx: mpsc::Receiver<(StreamKind, Bytes)>) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    while let Some((stream, bytes)) = output_rx.recv().await {
        match stream {
            StreamKind::Stderr => {
                stderr.write_all(&bytes).await?;
                stderr.flush().await?;
            }
            _ => {
                stdout.write_all(&bytes).await?;
                stdout.flush().await?;
            }
        }
    }
    Ok(())
}

/// Window changes become resizes; SIGINT is forwarded, SIGTERM and SIGHUP leave
#[cfg(unix)]
async fn watch_signals(
    local: LocalTerminal,
    size_tx: watch::Sender<TerminalSize>,
    signal_tx: mpsc::Sender<LocalSignal>,
) -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind as UnixSignal};

    let mut window = signal(UnixSignal::window_change())?;
    let mut interrupt = signal(UnixSignal::interrupt())?;
    let mut terminate = signal(UnixSignal::terminate())?;
    let mut hangup = signal(UnixSignal::hangup())?;

    loop {
        let received = tokio::select! {
            _ = window.recv() => {
                size_tx.send_replace(local.size());
                continue;
            }
            _ = interrupt.recv() => LocalSignal::Forward(SignalKind::Interrupt),
            _ = terminate.recv() => LocalSignal::Detach,
            _ = hangup.recv() => LocalSignal::Detach,
        };
        debug!("Local signal: {:?}", received);
        if signal_tx.send(received).await.is_err() || received == LocalSignal::Detach {
            return Ok(());
        }
    }
}

#[cfg(not(unix))]
async fn watch_signals(
    _local: LocalTerminal,
    _size_tx: watch::Sender<TerminalSize>,
    signal_tx: mpsc::Sender<LocalSignal>,
) -> io::Result<()> {
    loop {
        tokio::signal::ctrl_c().await?;
        if signal_tx
            .send(LocalSignal::Forward(SignalKind::Interrupt))
            .await
            .is_err()
        {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_interactive_size_defaults() {
        let local = LocalTerminal { interactive: false };
        assert!(!local.is_interactive());
        assert_eq!(local.size(), TerminalSize::new(24, 80));
    }

    #[test]
    fn test_restored_guard_stays_restored() {
        let mut guard = RawModeGuard { enabled: false };
        guard.restore();
        assert!(!guard.enabled);
    }

    #[tokio::test]
    async fn test_output_writer_finishes_when_session_drops_sender() {
        let (tx, rx) = mpsc::channel(4);
        let writer = tokio::spawn(write_output(rx));
        tx.send((StreamKind::Stdout, Bytes::new())).await.unwrap();
        drop(tx);
        writer.await.unwrap().unwrap();
    }
}

//! Agent process transport.
//!
//! A [`ProcessTransport`] owns one agent process for the duration of one
//! exchange: it launches the process, writes user turns to its stdin, and
//! yields the raw JSON objects the process prints on stdout.
//!
//! Submodules:
//! - `codec`: [`LinesCodec`](tokio_util::codec::LinesCodec)-based NDJSON framing.
//! - `spawner`: argument/environment construction and process launch.
//! - `reader`: read task that parses stdout lines and forwards raw objects.
//! - `writer`: outbound user-turn encoding.

pub mod codec;
pub mod reader;
pub mod spawner;
pub mod writer;

use std::process::ExitStatus;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::Stream;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::session::ExchangeConfig;
use crate::{AppError, Result};

use self::reader::{run_reader, ReaderLimits};
pub use self::spawner::TransportConfig;

/// Bytes of stderr retained for [`AppError::ProcessExit`].
pub const STDERR_TAIL_BYTES: usize = 64 * 1024;

/// Capacity of the reader → consumer channel.
const READ_BUFFER: usize = 64;

/// How the agent receives its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    /// User turns are written to stdin, one per line.
    Streaming,
    /// The prompt was passed on the command line; stdin is closed.
    SingleShot,
}

/// One agent process with its stdio pipes.
///
/// Lifecycle: [`connect`](Self::connect) → [`write`](Self::write)* /
/// [`next_message`](Self::next_message)* → [`close`](Self::close) or
/// [`dispose`](Self::dispose). Dropping the transport kills the process.
pub struct ProcessTransport {
    config: Arc<TransportConfig>,
    exchange: ExchangeConfig,
    session_id: String,
    mode: Option<InputMode>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    rx: Option<mpsc::Receiver<Result<Value>>>,
    reader: Option<JoinHandle<()>>,
    stderr_task: Option<JoinHandle<()>>,
    stderr_tail: Arc<Mutex<String>>,
    cancel: CancellationToken,
    exit_status: Option<ExitStatus>,
}

impl ProcessTransport {
    /// Prepare a transport; nothing is spawned until [`connect`](Self::connect).
    #[must_use]
    pub fn new(
        config: Arc<TransportConfig>,
        exchange: ExchangeConfig,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            config,
            exchange,
            session_id: session_id.into(),
            mode: None,
            child: None,
            stdin: None,
            rx: None,
            reader: None,
            stderr_task: None,
            stderr_tail: Arc::new(Mutex::new(String::new())),
            cancel: CancellationToken::new(),
            exit_status: None,
        }
    }

    /// Launch the agent process.
    ///
    /// Without `initial_prompt` the transport is in [`InputMode::Streaming`]
    /// and turns are sent with [`write`](Self::write); with it the agent runs
    /// single-shot and stdin is closed immediately.
    ///
    /// # Errors
    ///
    /// - [`AppError::InvalidState`] if already connected.
    /// - [`AppError::CliNotFound`] if the executable is missing; nothing has
    ///   been written at that point.
    /// - Any error from [`spawner::spawn_agent`].
    pub async fn connect(&mut self, initial_prompt: Option<&str>) -> Result<()> {
        if self.mode.is_some() {
            return Err(AppError::InvalidState(format!(
                "transport for session {} is already connected",
                self.session_id
            )));
        }

        let mut child =
            spawner::spawn_agent(&self.config, &self.exchange, &self.session_id, initial_prompt)?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Io("failed to capture agent stdout".into()))?;
        let stderr = child.stderr.take();

        let (tx, rx) = mpsc::channel(READ_BUFFER);
        let limits = ReaderLimits {
            max_line_bytes: self.config.max_line_bytes,
            max_consecutive_failures: self.config.max_consecutive_decode_failures,
        };
        self.reader = Some(tokio::spawn(run_reader(
            self.session_id.clone(),
            stdout,
            tx,
            limits,
            self.cancel.clone(),
        )));

        if let Some(stderr) = stderr {
            self.stderr_task = Some(tokio::spawn(drain_stderr(
                self.session_id.clone(),
                stderr,
                Arc::clone(&self.stderr_tail),
            )));
        }

        let mode = if initial_prompt.is_some() {
            // Single-shot: the agent must see EOF on stdin.
            drop(stdin);
            InputMode::SingleShot
        } else {
            self.stdin = stdin;
            InputMode::Streaming
        };

        self.child = Some(child);
        self.rx = Some(rx);
        self.mode = Some(mode);
        debug!(session_id = %self.session_id, ?mode, "transport connected");
        Ok(())
    }

    /// Write one outbound line to the agent's stdin.
    ///
    /// # Errors
    ///
    /// - [`AppError::InvalidState`] if not connected in streaming mode or
    ///   stdin was already closed.
    /// - [`AppError::ConnectionLost`] if the pipe is broken.
    pub async fn write(&mut self, line: &str) -> Result<()> {
        if self.mode != Some(InputMode::Streaming) {
            return Err(AppError::InvalidState(
                "write requires a transport connected in streaming mode".into(),
            ));
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| AppError::InvalidState("agent stdin already closed".into()))?;
        writer::write_line(stdin, line).await
    }

    /// Encode and write one user turn carrying `session_id` as the
    /// conversation identifier field.
    ///
    /// # Errors
    ///
    /// Same as [`write`](Self::write).
    pub async fn send_user_turn(&mut self, text: &str, session_id: &str) -> Result<()> {
        let line = writer::to_line(&writer::encode_user_turn(text, session_id))?;
        self.write(&line).await
    }

    /// Close stdin, signalling end of input to the agent.
    pub fn close_input(&mut self) {
        if self.stdin.take().is_some() {
            debug!(session_id = %self.session_id, "transport: stdin closed");
        }
    }

    /// Next raw object from the agent, in emission order.
    ///
    /// Yields `Err(ProtocolDecode)` for a bad line (the sequence continues),
    /// `Err(ConnectionLost)` when the reader gave up, and
    /// `Err(ProcessExit)` once if the process ended with a non-zero status.
    /// Returns `None` after a clean end of output, or when not connected.
    pub async fn next_message(&mut self) -> Option<Result<Value>> {
        let rx = self.rx.as_mut()?;
        if let Some(item) = rx.recv().await {
            return Some(item);
        }

        self.rx = None;
        let status = self.wait_for_exit().await?;
        if status.success() {
            return None;
        }
        Some(Err(AppError::ProcessExit {
            code: status.code(),
            stderr: self.stderr_tail(),
        }))
    }

    /// Lazy sequence over [`next_message`](Self::next_message).
    pub fn read_messages(&mut self) -> impl Stream<Item = Result<Value>> + '_ {
        futures_util::stream::unfold(self, |transport| async move {
            let item = transport.next_message().await?;
            Some((item, transport))
        })
    }

    /// Graceful teardown: close stdin, wait up to the configured grace
    /// period for the process to exit, then kill it. Idempotent.
    pub async fn close(&mut self) {
        self.close_input();
        if self.child.is_some() && self.exit_status.is_none() {
            let grace = self.config.shutdown_grace;
            if let Some(child) = self.child.as_mut() {
                match tokio::time::timeout(grace, child.wait()).await {
                    Ok(Ok(status)) => self.exit_status = Some(status),
                    Ok(Err(err)) => warn!(session_id = %self.session_id, %err, "error waiting for agent"),
                    Err(_) => debug!(session_id = %self.session_id, "agent did not exit within grace period"),
                }
            }
        }
        self.dispose().await;
    }

    /// Immediate teardown: kill the process if still running, close both
    /// pipes, and stop the background tasks. Idempotent.
    pub async fn dispose(&mut self) {
        self.cancel.cancel();
        self.stdin = None;
        self.rx = None;

        if let Some(mut child) = self.child.take() {
            if self.exit_status.is_none() {
                match child.try_wait() {
                    Ok(Some(status)) => self.exit_status = Some(status),
                    Ok(None) => {
                        if let Err(err) = child.kill().await {
                            warn!(session_id = %self.session_id, %err, "failed to kill agent process");
                        } else {
                            info!(session_id = %self.session_id, "agent process killed");
                        }
                    }
                    Err(err) => warn!(session_id = %self.session_id, %err, "failed to poll agent process"),
                }
            }
        }

        if let Some(handle) = self.reader.take() {
            handle.abort();
        }
        if let Some(handle) = self.stderr_task.take() {
            handle.abort();
        }
    }

    /// Whether [`connect`](Self::connect) succeeded and the process has not
    /// been disposed.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.child.is_some()
    }

    /// Input mode, once connected.
    #[must_use]
    pub fn mode(&self) -> Option<InputMode> {
        self.mode
    }

    /// OS process id while the process runs.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Exit status, once observed.
    #[must_use]
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Retained tail of the agent's stderr.
    #[must_use]
    pub fn stderr_tail(&self) -> String {
        self.stderr_tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait for the process after stdout closed, bounded by the grace period.
    async fn wait_for_exit(&mut self) -> Option<ExitStatus> {
        if let Some(status) = self.exit_status {
            return Some(status);
        }
        let grace = self.config.shutdown_grace;
        let child = self.child.as_mut()?;
        let status = match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => {
                warn!(session_id = %self.session_id, %err, "error waiting for agent process");
                return None;
            }
            Err(_) => {
                debug!(session_id = %self.session_id, "stdout closed but agent still running");
                return None;
            }
        };
        self.exit_status = Some(status);

        // Let the stderr drain finish so the tail is complete.
        if let Some(handle) = self.stderr_task.take() {
            if tokio::time::timeout(grace, handle).await.is_err() {
                debug!(session_id = %self.session_id, "stderr drain did not finish in time");
            }
        }

        info!(session_id = %self.session_id, code = status.code(), "agent process exited");
        Some(status)
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        // `kill_on_drop(true)` reaps the child; stop the readers too.
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for ProcessTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessTransport")
            .field("session_id", &self.session_id)
            .field("mode", &self.mode)
            .field("pid", &self.pid())
            .field("exit_status", &self.exit_status)
            .finish_non_exhaustive()
    }
}

/// Copy stderr lines into a bounded tail buffer.
async fn drain_stderr(session_id: String, stderr: ChildStderr, tail: Arc<Mutex<String>>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!(session_id, line = %line, "agent stderr");
                let mut buf = tail.lock().unwrap_or_else(PoisonError::into_inner);
                buf.push_str(&line);
                buf.push('\n');
                if buf.len() > STDERR_TAIL_BYTES {
                    let mut cut = buf.len() - STDERR_TAIL_BYTES;
                    while !buf.is_char_boundary(cut) {
                        cut += 1;
                    }
                    buf.drain(..cut);
                }
            }
            Ok(None) => break,
            Err(err) => {
                debug!(session_id, %err, "stderr read failed");
                break;
            }
        }
    }
}

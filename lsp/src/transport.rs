//! Byte transport to a language server.
//!
//! A child process (or any pair of streams) with a single writer task. All
//! outbound frames go through one bounded channel so concurrent senders never
//! interleave bytes. The read side is handed back to the owner, who drives it
//! with [`read_loop`].

use std::future::Future;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

use crate::codec::{self, FrameReader, FrameWriter};
use crate::error::{RpcError, RpcResult};
use crate::protocol::Message;
use crate::types::ServerConfig;

const WRITER_CHANNEL_CAPACITY: usize = 64;

/// How long `terminate` waits for queued frames to drain before closing stdin.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

enum WriterCommand {
    Send(Vec<u8>),
    Shutdown,
}

/// Why [`read_loop`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadLoopExit {
    /// The server closed its output at a frame boundary.
    Eof,
    /// The owner asked the loop to stop.
    Stopped,
    /// Unrecoverable stream error.
    Failed(String),
}

impl ReadLoopExit {
    #[must_use]
    pub fn reason(&self) -> String {
        match self {
            Self::Eof => "server closed its output".to_string(),
            Self::Stopped => "connection stopped".to_string(),
            Self::Failed(reason) => format!("stream failed: {reason}"),
        }
    }
}

pub struct Transport {
    writer_tx: mpsc::Sender<WriterCommand>,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
    child: Mutex<Option<Child>>,
    label: String,
}

impl Transport {
    /// Spawn the configured server. Must be called inside a tokio runtime.
    pub fn spawn(config: &ServerConfig) -> RpcResult<(Self, BoxedReader)> {
        let spawn_err = |message: String| RpcError::Spawn {
            command: config.command.clone(),
            message,
        };
        let resolved = which::which(&config.command)
            .map_err(|e| spawn_err(format!("not found in PATH: {e}")))?;

        let mut child = Command::new(&resolved)
            .args(&config.args)
            .current_dir(config.working_dir())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_err(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_err("no stdout from child".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_err("no stdin from child".to_string()))?;

        tracing::info!(
            command = %resolved.display(),
            pid = child.id(),
            "spawned language server"
        );

        let mut transport = Self::with_writer(stdin, config.command.clone());
        transport.child = Mutex::new(Some(child));
        Ok((transport, Box::new(stdout)))
    }

    /// Wrap an existing pair of streams. Must be called inside a tokio runtime.
    pub fn from_streams<R, W>(reader: R, writer: W) -> (Self, BoxedReader)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        (Self::with_writer(writer, "stream".to_string()), Box::new(reader))
    }

    fn with_writer<W>(writer: W, label: String) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);
        let task_label = label.clone();
        let writer_handle = tokio::spawn(async move {
            let mut writer = FrameWriter::new(writer);
            while let Some(cmd) = writer_rx.recv().await {
                match cmd {
                    WriterCommand::Send(frame) => {
                        if let Err(e) = writer.write_frame(&frame).await {
                            tracing::warn!("write to '{task_label}' failed: {e}");
                            break;
                        }
                    }
                    WriterCommand::Shutdown => {
                        let _ = writer.shutdown().await;
                        break;
                    }
                }
            }
            tracing::debug!("writer for '{task_label}' finished");
        });

        Self {
            writer_tx,
            writer_handle: Mutex::new(Some(writer_handle)),
            child: Mutex::new(None),
            label,
        }
    }

    /// Queue an encoded frame for the writer task.
    pub async fn write_frame(&self, frame: Vec<u8>) -> RpcResult<()> {
        self.writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .map_err(|_| RpcError::TransportClosed)
    }

    pub async fn write_message(&self, message: &Message) -> RpcResult<()> {
        if let Some(method) = message.method() {
            tracing::debug!(method, "sending");
        }
        self.write_frame(codec::encode(message)).await
    }

    /// Whether the writer task is still accepting frames.
    pub fn is_writable(&self) -> bool {
        !self.writer_tx.is_closed()
    }

    /// Close stdin, give the process `grace` to exit, then kill it.
    pub async fn terminate(&self, grace: Duration) {
        let _ = self.writer_tx.send(WriterCommand::Shutdown).await;
        if let Some(handle) = self.writer_handle.lock().await.take()
            && tokio::time::timeout(WRITER_DRAIN_TIMEOUT, handle).await.is_err()
        {
            tracing::debug!("writer for '{}' did not drain in time", self.label);
        }

        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => tracing::info!("'{}' exited with {status}", self.label),
            Ok(Err(e)) => tracing::warn!("waiting for '{}' failed: {e}", self.label),
            Err(_) => {
                tracing::warn!("'{}' didn't exit in {grace:?}, killing", self.label);
                if let Err(e) = child.kill().await {
                    tracing::warn!("killing '{}' failed: {e}", self.label);
                }
            }
        }
    }
}

/// Decode frames until EOF, a fatal error, or `stop` is written.
///
/// Any write to `stop` ends the loop, whatever the value, so a frame that is
/// half read when the signal arrives is never resumed.
///
/// Recoverable codec errors are logged and the frame is skipped.
pub async fn read_loop<R, F, Fut>(
    reader: R,
    mut stop: watch::Receiver<bool>,
    mut on_message: F,
) -> ReadLoopExit
where
    R: AsyncRead + Unpin,
    F: FnMut(Message) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut reader = FrameReader::new(reader);
    loop {
        if *stop.borrow_and_update() {
            return ReadLoopExit::Stopped;
        }
        let next = tokio::select! {
            biased;
            _ = stop.changed() => return ReadLoopExit::Stopped,
            next = reader.read_message() => next,
        };
        match next {
            Ok(Some(message)) => on_message(message).await,
            Ok(None) => return ReadLoopExit::Eof,
            Err(e) if e.is_recoverable() => {
                tracing::warn!("dropping bad frame: {e}");
            }
            Err(e) => return ReadLoopExit::Failed(e.to_string()),
        }
    }
}

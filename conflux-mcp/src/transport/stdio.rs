//! Stdio transport: a child process speaking NDJSON over its pipes

use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;

use super::{ProtocolErrorWindow, Transport, TransportState};
use crate::error::{McpError, McpResult};
use crate::protocol::JsonRpcMessage;

/// Transport over a spawned child process. Frames are one JSON object per
/// newline-terminated line on stdin/stdout; stderr is drained to the log
/// and never parsed. Child death is a hard disconnect; the adapter does
/// not restart the child.
///
/// Stdout is owned by a reader task so `receive` is a plain channel read
/// and stays safe to drop mid-poll.
pub struct StdioTransport {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,

    child: Option<Child>,
    stdin: Option<BufWriter<ChildStdin>>,
    inbound_rx: Option<mpsc::Receiver<McpResult<JsonRpcMessage>>>,
    reader: Option<tokio::task::JoinHandle<()>>,

    state: TransportState,
}

impl StdioTransport {
    pub fn new(
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    ) -> McpResult<Self> {
        if command.trim().is_empty() {
            return Err(McpError::configuration("stdio command cannot be empty"));
        }

        Ok(Self {
            command,
            args,
            env,
            child: None,
            stdin: None,
            inbound_rx: None,
            reader: None,
            state: TransportState::Disconnected,
        })
    }

    async fn spawn_process(&mut self) -> McpResult<()> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .envs(&self.env)
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            McpError::connection_failed(format!("failed to spawn '{}': {}", self.command, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::internal("child stdin handle missing"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::internal("child stdout handle missing"))?;

        if let Some(stderr) = child.stderr.take() {
            let command = self.command.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(command = %command, "stderr: {}", line);
                }
            });
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(100);
        self.reader = Some(tokio::spawn(read_frames(
            self.command.clone(),
            stdout,
            inbound_tx,
        )));
        self.inbound_rx = Some(inbound_rx);
        self.stdin = Some(BufWriter::new(stdin));
        self.child = Some(child);

        Ok(())
    }

    async fn write_line(&mut self, line: &str) -> McpResult<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| McpError::channel_closed("transport not connected"))?;

        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;

        Ok(())
    }

    fn is_process_running(&mut self) -> bool {
        match &mut self.child {
            Some(child) => child.try_wait().map_or(true, |status| status.is_none()),
            None => false,
        }
    }
}

/// Reader task: one complete JSON-RPC frame per stdout line. A single
/// malformed line is logged and skipped; repeated ones inside the window
/// end the channel.
async fn read_frames(
    command: String,
    stdout: ChildStdout,
    inbound: mpsc::Sender<McpResult<JsonRpcMessage>>,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut parse_errors = ProtocolErrorWindow::default();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match JsonRpcMessage::from_frame(&line) {
                    Ok(message) => {
                        if inbound.send(Ok(message)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(command = %command, error = %e, "discarding malformed frame");
                        if parse_errors.record() {
                            let _ = inbound
                                .send(Err(McpError::channel_closed(
                                    "repeated malformed frames from child",
                                )))
                                .await;
                            return;
                        }
                    }
                }
            }
            Ok(None) => {
                let _ = inbound
                    .send(Err(McpError::channel_closed("child closed stdout")))
                    .await;
                return;
            }
            Err(e) => {
                let _ = inbound.send(Err(McpError::from(e))).await;
                return;
            }
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn connect(&mut self) -> McpResult<()> {
        if self.state == TransportState::Connected {
            return Ok(());
        }

        self.state = TransportState::Connecting;
        if let Err(e) = self.spawn_process().await {
            self.state = TransportState::Error;
            return Err(e);
        }
        self.state = TransportState::Connected;

        Ok(())
    }

    async fn send(&mut self, message: JsonRpcMessage) -> McpResult<()> {
        if self.state != TransportState::Connected {
            return Err(McpError::channel_closed("transport not connected"));
        }
        if !self.is_process_running() {
            self.state = TransportState::Error;
            return Err(McpError::channel_closed("child process has terminated"));
        }

        let frame = message.to_frame()?;
        if let Err(e) = self.write_line(&frame).await {
            self.state = TransportState::Error;
            return Err(e);
        }

        Ok(())
    }

    async fn receive(&mut self) -> McpResult<JsonRpcMessage> {
        if self.state != TransportState::Connected {
            return Err(McpError::channel_closed("transport not connected"));
        }
        let rx = self
            .inbound_rx
            .as_mut()
            .ok_or_else(|| McpError::channel_closed("transport not connected"))?;

        match rx.recv().await {
            Some(Ok(message)) => Ok(message),
            Some(Err(e)) => {
                self.state = TransportState::Error;
                Err(e)
            }
            None => {
                self.state = TransportState::Error;
                Err(McpError::channel_closed("reader task ended"))
            }
        }
    }

    fn state(&self) -> TransportState {
        self.state
    }

    async fn close(&mut self) -> McpResult<()> {
        if self.state == TransportState::Disconnected {
            return Ok(());
        }
        self.state = TransportState::Disconnected;

        // Closing stdin signals the child to exit on its own.
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.shutdown().await;
        }

        if let Some(mut child) = self.child.take() {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            match child.try_wait() {
                Ok(Some(_)) => {}
                Ok(None) => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(command = %self.command, "failed to kill child: {}", e);
                    }
                    let _ = child.wait().await;
                }
                Err(e) => {
                    tracing::warn!(command = %self.command, "error checking child status: {}", e);
                }
            }
        }

        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.inbound_rx = None;
        Ok(())
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
        }
    }
}

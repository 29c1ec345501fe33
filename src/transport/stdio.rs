//! Stdio transports.
//!
//! [`StdioClientTransport`] spawns an MCP server as a child process and
//! frames newline-delimited JSON over its stdin/stdout, with the child's
//! stderr drained into a channel the caller can consume.
//! [`StdioServerTransport`] is the mirror image for a server launched as
//! somebody else's child: it reads its own stdin and writes its own
//! stdout.
//!
//! Reading, writing, and stderr draining each run on their own task so
//! none of them can head-of-line block the others.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::transport::{InboundHandler, Message, Transport, TransportEvent};

/// Capacity of the outbound queue between `send` callers and the writer
/// worker.
const OUTBOUND_QUEUE_SIZE: usize = 64;

/// How long `close_gracefully` waits for the child to exit after its
/// stdin is closed before killing it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Client transport that communicates with an MCP server over the
/// standard streams of a child process it spawns.
///
/// # Example
///
/// ```no_run
/// use mcp_session::transport::StdioClientTransport;
///
/// let transport = StdioClientTransport::new("my-mcp-server", &["--flag"])
///     .with_env([("API_KEY".to_string(), "secret".to_string())])
///     .with_working_dir("/tmp");
/// ```
pub struct StdioClientTransport {
    program: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    working_dir: Option<PathBuf>,
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    child: Arc<Mutex<Option<Child>>>,
    stderr_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl StdioClientTransport {
    /// Creates a new transport that will spawn `program` with `args`
    /// when started.
    pub fn new(program: &str, args: &[&str]) -> Self {
        StdioClientTransport {
            program: program.to_string(),
            args: args.iter().map(|&s| s.to_string()).collect(),
            env: HashMap::new(),
            working_dir: None,
            outbound: Mutex::new(None),
            child: Arc::new(Mutex::new(None)),
            stderr_rx: Mutex::new(None),
        }
    }

    /// Adds environment variables for the child process.
    pub fn with_env(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(env);
        self
    }

    /// Sets the working directory for the child process.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Takes the receiver for the child's stderr lines.
    ///
    /// Returns `None` after the first call. Lines arrive after the
    /// transport is started.
    pub async fn take_stderr(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.stderr_rx.lock().await.take()
    }

    /// Kills the child process without draining anything.
    pub async fn close_forcibly(&self) -> Result<()> {
        *self.outbound.lock().await = None;
        if let Some(child) = self.child.lock().await.as_mut() {
            child.kill().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for StdioClientTransport {
    /// Spawns the child process and starts the three workers: stdout
    /// reader, stdin writer, and stderr drain.
    async fn start(&self, handler: InboundHandler) -> Result<()> {
        debug!("StdioClientTransport: spawning {}", self.program);
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        let mut child = command.spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("child process stdin not available"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("child process stdout not available"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow::anyhow!("child process stderr not available"))?;

        *self.child.lock().await = Some(child);

        // Stderr drain. MCP servers commonly log there; an undrained pipe
        // buffer eventually blocks the whole child.
        let (stderr_tx, stderr_out) = mpsc::unbounded_channel();
        *self.stderr_rx.lock().await = Some(stderr_out);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("child stderr: {}", line);
                if stderr_tx.send(line).is_err() {
                    // Receiver gone; keep draining to keep the child alive.
                    continue;
                }
            }
        });

        // Outbound writer: one JSON object per line, flushed per message.
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE_SIZE);
        *self.outbound.lock().await = Some(outbound_tx);
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(message) = outbound_rx.recv().await {
                let serialized = match serde_json::to_string(&message) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("dropping unserializable outbound message: {}", e);
                        continue;
                    }
                };
                debug!("StdioClientTransport: sending {}", serialized);
                if let Err(e) = write_line(&mut stdin, &serialized).await {
                    warn!("write to child stdin failed: {}", e);
                    break;
                }
            }
            // Queue closed: drop stdin so the child sees EOF.
            drop(stdin);
        });

        // Inbound reader: parse each stdout line, hand it to the session,
        // and wait for the session to take it before reading on.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        let message: Message = match serde_json::from_str(line) {
                            Ok(message) => message,
                            Err(e) => {
                                warn!("dropping malformed line from child: {}", e);
                                continue;
                            }
                        };
                        if handler(TransportEvent::Message(message)).await.is_err() {
                            debug!("session gone, stopping stdout reader");
                            return;
                        }
                    }
                    Ok(None) => {
                        debug!("child stdout closed (EOF)");
                        let _ = handler(TransportEvent::Closed(None)).await;
                        return;
                    }
                    Err(e) => {
                        let _ = handler(TransportEvent::Closed(Some(e.into()))).await;
                        return;
                    }
                }
            }
        });

        Ok(())
    }

    async fn send(&self, message: Message) -> Result<()> {
        let tx = self
            .outbound
            .lock()
            .await
            .clone()
            .ok_or_else(|| anyhow::anyhow!("transport not started"))?;
        tx.send(message)
            .await
            .map_err(|_| anyhow::anyhow!("transport closed"))
    }

    /// Drains the outbound queue, closes the child's stdin, and waits a
    /// grace period for the child to exit before killing it.
    async fn close_gracefully(&self) -> Result<()> {
        // Dropping the sender lets the writer drain the queue and then
        // close stdin; the inbound worker exits on the resulting EOF.
        *self.outbound.lock().await = None;

        let mut child_guard = self.child.lock().await;
        if let Some(child) = child_guard.as_mut() {
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(status) => {
                    debug!("child exited: {:?}", status?);
                }
                Err(_) => {
                    warn!("child did not exit in time, killing it");
                    child.kill().await?;
                }
            }
        }
        *child_guard = None;
        Ok(())
    }
}

async fn write_line(writer: &mut (impl AsyncWriteExt + Unpin), line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Server transport that communicates with an MCP client over this
/// process's own standard streams.
///
/// Used when the server is the child end of a [`StdioClientTransport`]
/// pair: the client owns the process, this transport owns the streams.
pub struct StdioServerTransport {
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
}

impl StdioServerTransport {
    /// Creates a new server-side stdio transport.
    pub fn new() -> Self {
        Self {
            outbound: Mutex::new(None),
        }
    }
}

impl Default for StdioServerTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for StdioServerTransport {
    async fn start(&self, handler: InboundHandler) -> Result<()> {
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE_SIZE);
        *self.outbound.lock().await = Some(outbound_tx);

        tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(message) = outbound_rx.recv().await {
                let serialized = match serde_json::to_string(&message) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("dropping unserializable outbound message: {}", e);
                        continue;
                    }
                };
                debug!("StdioServerTransport: sending {}", serialized);
                if let Err(e) = write_line(&mut stdout, &serialized).await {
                    warn!("write to stdout failed: {}", e);
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        let message: Message = match serde_json::from_str(line) {
                            Ok(message) => message,
                            Err(e) => {
                                warn!("dropping malformed line from stdin: {}", e);
                                continue;
                            }
                        };
                        if handler(TransportEvent::Message(message)).await.is_err() {
                            debug!("session gone, stopping stdin reader");
                            return;
                        }
                    }
                    Ok(None) => {
                        debug!("stdin closed (EOF)");
                        let _ = handler(TransportEvent::Closed(None)).await;
                        return;
                    }
                    Err(e) => {
                        let _ = handler(TransportEvent::Closed(Some(e.into()))).await;
                        return;
                    }
                }
            }
        });

        Ok(())
    }

    async fn send(&self, message: Message) -> Result<()> {
        let tx = self
            .outbound
            .lock()
            .await
            .clone()
            .ok_or_else(|| anyhow::anyhow!("transport not started"))?;
        tx.send(message)
            .await
            .map_err(|_| anyhow::anyhow!("transport closed"))
    }

    async fn close_gracefully(&self) -> Result<()> {
        *self.outbound.lock().await = None;
        Ok(())
    }
}

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{
    await_response, route_incoming, EventSender, PendingRequests, Routed, Transport,
    TransportError, TransportEvent,
};
use crate::config::{StdioFraming, StdioServerConfig};
use crate::protocol::{JsonRpcNotification, JsonRpcRequest};

type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// JSON-RPC over a child process's stdin/stdout.
pub struct StdioTransport {
    writer: SharedWriter,
    framing: StdioFraming,
    pending: Arc<PendingRequests>,
    next_id: AtomicU64,
    timeout: Duration,
    alive: Arc<AtomicBool>,
    child: Mutex<Option<Child>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl StdioTransport {
    pub fn spawn(
        config: &StdioServerConfig,
        timeout: Duration,
        events: EventSender,
    ) -> Result<Self, TransportError> {
        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|err| TransportError::Spawn(format!("{}: {err}", config.command)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Spawn("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Spawn("failed to capture stdout".into()))?;
        let stderr = child.stderr.take();

        debug!(
            target: "mcp_client",
            command = %config.command,
            pid = ?child.id(),
            "spawned MCP stdio server"
        );
        let transport =
            Self::with_streams(stdout, stdin, config.framing, timeout, events, Some(child));
        if let Some(stderr) = stderr {
            let command = config.command.clone();
            transport.track(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "mcp_client", command = %command, line = %line, "server stderr");
                }
            }));
        }
        Ok(transport)
    }

    /// Runs the protocol over arbitrary byte streams.
    pub fn from_streams<R, W>(
        reader: R,
        writer: W,
        framing: StdioFraming,
        timeout: Duration,
        events: EventSender,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_streams(reader, writer, framing, timeout, events, None)
    }

    fn with_streams<R, W>(
        reader: R,
        writer: W,
        framing: StdioFraming,
        timeout: Duration,
        events: EventSender,
        child: Option<Child>,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: SharedWriter = Arc::new(Mutex::new(Box::new(writer)));
        let pending = Arc::new(PendingRequests::default());
        let alive = Arc::new(AtomicBool::new(true));

        let reader_task = tokio::spawn(read_loop(
            BufReader::new(reader),
            writer.clone(),
            framing,
            pending.clone(),
            events,
            alive.clone(),
        ));

        Self {
            writer,
            framing,
            pending,
            next_id: AtomicU64::new(1),
            timeout,
            alive,
            child: Mutex::new(child),
            tasks: std::sync::Mutex::new(vec![reader_task]),
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    async fn send<T: Serialize>(&self, message: &T) -> Result<(), TransportError> {
        if !self.is_alive() {
            return Err(TransportError::Closed("transport is closed".into()));
        }
        if let Err(err) = write_frame(&self.writer, self.framing, message).await {
            self.alive.store(false, Ordering::SeqCst);
            return Err(TransportError::Closed(format!("write failed: {err}")));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let rx = self.pending.register(id);
        if let Err(err) = self.send(&JsonRpcRequest::new(id, method, params)).await {
            self.pending.forget(id);
            return Err(err);
        }
        await_response(&self.pending, id, rx, self.timeout).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        self.send(&JsonRpcNotification::new(method, params)).await
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let _ = self.writer.lock().await.shutdown().await;
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
            if tokio::time::timeout(Duration::from_secs(2), child.wait())
                .await
                .is_err()
            {
                warn!(target: "mcp_client", pid = ?child.id(), "server did not exit after kill");
            }
        }
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
        self.pending.fail_all();
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        for task in self
            .tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }
}

async fn read_loop<R>(
    mut reader: R,
    writer: SharedWriter,
    framing: StdioFraming,
    pending: Arc<PendingRequests>,
    events: EventSender,
    alive: Arc<AtomicBool>,
) where
    R: AsyncBufRead + Unpin,
{
    let reason = loop {
        match read_frame(&mut reader).await {
            Ok(Some(frame)) => {
                let value = match serde_json::from_slice::<Value>(&frame) {
                    Ok(value) => value,
                    Err(err) => {
                        warn!(target: "mcp_client", error = %err, "discarding malformed message");
                        continue;
                    }
                };
                let messages = match value {
                    Value::Array(batch) => batch,
                    single => vec![single],
                };
                for message in messages {
                    if let Routed::ReplyNeeded(reply) = route_incoming(message, &pending, &events) {
                        if let Err(err) = write_frame(&writer, framing, &reply).await {
                            warn!(target: "mcp_client", error = %err, "failed to answer server request");
                        }
                    }
                }
            }
            Ok(None) => break "server closed stdout".to_string(),
            Err(err) => break format!("read failed: {err}"),
        }
    };

    debug!(target: "mcp_client", reason = %reason, "stdio reader finished");
    alive.store(false, Ordering::SeqCst);
    pending.fail_all();
    let _ = events.send(TransportEvent::Closed { reason });
}

/// Reads one message. Accepts bare JSON lines and `Content-Length` framed
/// bodies interchangeably. `None` means end of stream.
pub(crate) async fn read_frame<R>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            return Ok(Some(trimmed.as_bytes().to_vec()));
        }

        let mut length = content_length(trimmed);
        loop {
            let mut header = String::new();
            if reader.read_line(&mut header).await? == 0 {
                return Ok(None);
            }
            let header = header.trim();
            if header.is_empty() {
                break;
            }
            length = length.or_else(|| content_length(header));
        }

        match length {
            Some(length) => {
                let mut body = vec![0u8; length];
                reader.read_exact(&mut body).await?;
                return Ok(Some(body));
            }
            None => {
                warn!(target: "mcp_client", "header block without Content-Length; skipping");
            }
        }
    }
}

fn content_length(header: &str) -> Option<usize> {
    let (name, value) = header.split_once(':')?;
    if !name.trim().eq_ignore_ascii_case("content-length") {
        return None;
    }
    value.trim().parse().ok()
}

async fn write_frame<T: Serialize>(
    writer: &SharedWriter,
    framing: StdioFraming,
    message: &T,
) -> std::io::Result<()> {
    let payload = serde_json::to_vec(message)?;
    let mut writer = writer.lock().await;
    match framing {
        StdioFraming::Newline => {
            writer.write_all(&payload).await?;
            writer.write_all(b"\n").await?;
        }
        StdioFraming::ContentLength => {
            let header = format!("Content-Length: {}\r\n\r\n", payload.len());
            writer.write_all(header.as_bytes()).await?;
            writer.write_all(&payload).await?;
        }
    }
    writer.flush().await
}

//! Newline-delimited JSON link to the chat platform.
//!
//! Every outbound request carries a `request_id`; the bridge answers with a
//! `reply` frame holding the same id. User intents arrive unsolicited as
//! `event` frames.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, ensure, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::controller::Intent;
use crate::error::EventError;
use crate::event::{EventPlatform, EventSnapshot};
use crate::notice::{Notice, Notifier};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutboundFrame {
    Notice {
        notice: Notice,
    },
    FindEvent {
        request_id: u64,
        venue: String,
    },
    CreateEvent {
        request_id: u64,
        venue: String,
        name: String,
    },
    RenameEvent {
        request_id: u64,
        event_id: String,
        name: String,
    },
    RefreshEvent {
        request_id: u64,
        event_id: String,
    },
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ReplyErrorKind {
    Gone,
    Other,
}

#[derive(Debug, Clone, Deserialize)]
struct ReplyError {
    kind: ReplyErrorKind,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InboundFrame {
    Reply {
        request_id: u64,
        #[serde(default)]
        event: Option<EventSnapshot>,
        #[serde(default)]
        error: Option<ReplyError>,
    },
    Event {
        intent: Intent,
    },
}

type ReplyResult = Result<Option<EventSnapshot>, EventError>;
type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<ReplyResult>>>>;

fn lock_pending(
    pending: &Mutex<HashMap<u64, oneshot::Sender<ReplyResult>>>,
) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<ReplyResult>>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Sending side of the bridge. Cheap to clone.
#[derive(Clone)]
pub struct BridgeHandle {
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    pending: Pending,
    next_id: Arc<AtomicU64>,
    request_timeout: Duration,
}

/// Tasks pumping the two directions of one bridge connection.
pub struct BridgeTasks {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl BridgeTasks {
    /// Waits until `deadline` for the writer to flush its last frame, then
    /// stops both tasks.
    pub async fn finish(self, deadline: Instant) {
        let writer_abort = self.writer.abort_handle();
        if timeout_at(deadline, self.writer).await.is_err() {
            writer_abort.abort();
            warn!("bridge writer did not finish in time");
        }
        self.reader.abort();
    }
}

/// Wires a bridge over any byte stream pair. Returns the handle, the stream
/// of user intents and the I/O tasks.
pub fn connect<R, W>(
    reader: R,
    writer: W,
    request_timeout: Duration,
) -> (BridgeHandle, mpsc::UnboundedReceiver<Intent>, BridgeTasks)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (intent_tx, intent_rx) = mpsc::unbounded_channel();
    let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

    let writer = tokio::spawn(write_frames(writer, outbound_rx));
    let reader = tokio::spawn(read_frames(reader, Arc::clone(&pending), intent_tx));

    let handle = BridgeHandle {
        outbound: outbound_tx,
        pending,
        next_id: Arc::new(AtomicU64::new(1)),
        request_timeout,
    };
    (handle, intent_rx, BridgeTasks { reader, writer })
}

async fn write_frames<W>(mut writer: W, mut frames: mpsc::UnboundedReceiver<OutboundFrame>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        let quitting = matches!(frame, OutboundFrame::Quit);
        let json = match serde_json::to_string(&frame) {
            Ok(json) => json,
            Err(err) => {
                warn!("failed to encode bridge frame: {err}");
                continue;
            }
        };
        debug!(frame = %json, "bridge send");
        let written = async {
            writer.write_all(json.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;
        if let Err(err) = written {
            warn!("bridge write failed: {err}");
            break;
        }
        if quitting {
            break;
        }
    }
    let _ = writer.shutdown().await;
    debug!("bridge writer stopped");
}

async fn read_frames<R>(reader: R, pending: Pending, intents: mpsc::UnboundedSender<Intent>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!("bridge read failed: {err}");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        debug!(frame = %line, "bridge receive");

        match serde_json::from_str::<InboundFrame>(line) {
            Ok(InboundFrame::Reply {
                request_id,
                event,
                error,
            }) => {
                let result = match error {
                    Some(ReplyError {
                        kind: ReplyErrorKind::Gone,
                        ..
                    }) => Err(EventError::Gone),
                    Some(ReplyError { message, .. }) => Err(EventError::Platform(message)),
                    None => Ok(event),
                };
                match lock_pending(&pending).remove(&request_id) {
                    Some(waiter) => {
                        let _ = waiter.send(result);
                    }
                    None => debug!(request_id, "reply for unknown or expired request"),
                }
            }
            Ok(InboundFrame::Event { intent }) => {
                if intents.send(intent).is_err() {
                    break;
                }
            }
            Err(err) => warn!("ignoring malformed bridge frame: {err}"),
        }
    }

    // Dropping the waiters fails their requests with `Closed`.
    lock_pending(&pending).clear();
    info!("bridge connection closed");
}

impl BridgeHandle {
    async fn request(&self, build: impl FnOnce(u64) -> OutboundFrame) -> ReplyResult {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(request_id, tx);

        if self.outbound.send(build(request_id)).is_err() {
            lock_pending(&self.pending).remove(&request_id);
            return Err(EventError::Closed);
        }

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(EventError::Closed),
            Err(_) => {
                lock_pending(&self.pending).remove(&request_id);
                Err(EventError::Timeout(self.request_timeout))
            }
        }
    }

    /// Asks the bridge to shut down. Later frames are dropped.
    pub fn quit(&self) {
        let _ = self.outbound.send(OutboundFrame::Quit);
    }
}

#[async_trait]
impl EventPlatform for BridgeHandle {
    async fn find_owned_active_event(&self, venue: &str) -> Result<Option<EventSnapshot>, EventError> {
        let venue = venue.to_string();
        self.request(|request_id| OutboundFrame::FindEvent { request_id, venue })
            .await
    }

    async fn create_event(&self, venue: &str, name: &str) -> Result<EventSnapshot, EventError> {
        let (venue, name) = (venue.to_string(), name.to_string());
        self.request(|request_id| OutboundFrame::CreateEvent {
            request_id,
            venue,
            name,
        })
        .await?
        .ok_or_else(|| EventError::Platform("create_event returned no event".to_string()))
    }

    async fn rename(&self, event_id: &str, name: &str) -> Result<EventSnapshot, EventError> {
        let (event_id, name) = (event_id.to_string(), name.to_string());
        self.request(|request_id| OutboundFrame::RenameEvent {
            request_id,
            event_id,
            name,
        })
        .await?
        .ok_or(EventError::Gone)
    }

    async fn refresh(&self, event_id: &str) -> Result<EventSnapshot, EventError> {
        let event_id = event_id.to_string();
        self.request(|request_id| OutboundFrame::RefreshEvent {
            request_id,
            event_id,
        })
        .await?
        .ok_or(EventError::Gone)
    }
}

#[async_trait]
impl Notifier for BridgeHandle {
    async fn notify(&self, notice: Notice) -> Result<()> {
        self.outbound
            .send(OutboundFrame::Notice { notice })
            .map_err(|_| anyhow!("bridge is closed"))
    }
}

/// A bridge executable running as a child process.
pub struct BridgeProcess {
    child: Child,
}

impl BridgeProcess {
    pub fn spawn(
        bin: &Path,
        args: &[String],
        request_timeout: Duration,
    ) -> Result<(Self, BridgeHandle, mpsc::UnboundedReceiver<Intent>, BridgeTasks)> {
        ensure!(
            bin.is_file(),
            "bridge binary {:?} does not exist or is not a file",
            bin
        );

        info!(bin = %bin.display(), "spawning bridge");
        let mut child = Command::new(bin)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn bridge binary at {:?}", bin))?;
        debug!(pid = ?child.id(), "bridge spawned");

        let stdin = child.stdin.take().context("bridge stdin was not captured")?;
        let stdout = child.stdout.take().context("bridge stdout was not captured")?;
        let (handle, intents, tasks) = connect(stdout, stdin, request_timeout);
        Ok((Self { child }, handle, intents, tasks))
    }

    /// Waits for the bridge to exit after `quit`, killing it past `deadline`.
    pub async fn close(mut self, deadline: Instant) {
        match timeout_at(deadline, self.child.wait()).await {
            Ok(Ok(status)) => debug!(?status, "bridge exited"),
            Ok(Err(err)) => warn!("failed to wait for bridge: {err}"),
            Err(_) => {
                warn!("bridge did not exit in time, killing it");
                let _ = self.child.kill().await;
            }
        }
    }
}

/// Sends `Quit` and tears the link down, giving up on whatever is still
/// running at `deadline`.
pub async fn shut_down(
    handle: &BridgeHandle,
    tasks: BridgeTasks,
    process: Option<BridgeProcess>,
    deadline: Instant,
) {
    handle.quit();
    tasks.finish(deadline).await;
    if let Some(process) = process {
        process.close(deadline).await;
    }
}

/// Bridge over this process's own stdin/stdout.
pub fn connect_stdio(
    request_timeout: Duration,
) -> (BridgeHandle, mpsc::UnboundedReceiver<Intent>, BridgeTasks) {
    connect(tokio::io::stdin(), tokio::io::stdout(), request_timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventStatus;
    use tokio::io::{duplex, DuplexStream};

    struct Peer {
        lines: tokio::io::Lines<BufReader<tokio::io::ReadHalf<DuplexStream>>>,
        write: tokio::io::WriteHalf<DuplexStream>,
    }

    impl Peer {
        async fn next_frame(&mut self) -> serde_json::Value {
            let line = self.lines.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn send(&mut self, value: serde_json::Value) {
            let mut line = value.to_string();
            line.push('\n');
            self.write.write_all(line.as_bytes()).await.unwrap();
        }
    }

    fn wire(request_timeout: Duration) -> (BridgeHandle, mpsc::UnboundedReceiver<Intent>, Peer) {
        let (ours, theirs) = duplex(64 * 1024);
        let (our_read, our_write) = tokio::io::split(ours);
        let (their_read, their_write) = tokio::io::split(theirs);
        let (handle, intents, _tasks) = connect(our_read, our_write, request_timeout);
        let peer = Peer {
            lines: BufReader::new(their_read).lines(),
            write: their_write,
        };
        (handle, intents, peer)
    }

    #[tokio::test]
    async fn rename_round_trip() {
        let (handle, _intents, mut peer) = wire(Duration::from_secs(5));
        let request = tokio::spawn({
            let handle = handle.clone();
            async move { handle.rename("ev-1", "Movie Night").await }
        });

        let frame = peer.next_frame().await;
        assert_eq!(frame["type"], "rename_event");
        assert_eq!(frame["event_id"], "ev-1");
        assert_eq!(frame["name"], "Movie Night");
        let id = frame["request_id"].as_u64().unwrap();

        peer.send(serde_json::json!({
            "type": "reply",
            "request_id": id,
            "event": {"id": "ev-1", "name": "Movie Night", "status": "active"}
        }))
        .await;

        let snapshot = request.await.unwrap().unwrap();
        assert_eq!(snapshot.name, "Movie Night");
        assert_eq!(snapshot.status, EventStatus::Active);
    }

    #[tokio::test]
    async fn gone_reply_maps_to_gone() {
        let (handle, _intents, mut peer) = wire(Duration::from_secs(5));
        let request = tokio::spawn({
            let handle = handle.clone();
            async move { handle.refresh("ev-9").await }
        });
        let frame = peer.next_frame().await;
        peer.send(serde_json::json!({
            "type": "reply",
            "request_id": frame["request_id"],
            "error": {"kind": "gone"}
        }))
        .await;
        assert!(matches!(request.await.unwrap(), Err(EventError::Gone)));
    }

    #[tokio::test]
    async fn find_returns_none_on_null_event() {
        let (handle, _intents, mut peer) = wire(Duration::from_secs(5));
        let request = tokio::spawn({
            let handle = handle.clone();
            async move { handle.find_owned_active_event("stage").await }
        });
        let frame = peer.next_frame().await;
        assert_eq!(frame["type"], "find_event");
        peer.send(serde_json::json!({
            "type": "reply",
            "request_id": frame["request_id"],
            "event": null
        }))
        .await;
        assert_eq!(request.await.unwrap().unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out() {
        let (handle, _intents, mut peer) = wire(Duration::from_secs(2));
        let request = tokio::spawn({
            let handle = handle.clone();
            async move { handle.create_event("stage", "News").await }
        });
        let _ = peer.next_frame().await;
        assert!(matches!(request.await.unwrap(), Err(EventError::Timeout(_))));
    }

    #[tokio::test]
    async fn intents_and_notices_flow() {
        let (handle, mut intents, mut peer) = wire(Duration::from_secs(5));
        peer.send(serde_json::json!({
            "type": "event",
            "intent": {"type": "admin_force", "requester": "mod"}
        }))
        .await;
        peer.send(serde_json::json!({"type": "bogus"})).await;
        peer.send(serde_json::json!({
            "type": "event",
            "intent": {"type": "status", "requester": "u1", "context": "lounge"}
        }))
        .await;

        assert!(matches!(intents.recv().await, Some(Intent::AdminForce { .. })));
        assert!(matches!(intents.recv().await, Some(Intent::Status { .. })));

        handle.notify(Notice::ShuttingDown).await.unwrap();
        let frame = peer.next_frame().await;
        assert_eq!(frame["type"], "notice");
        assert_eq!(frame["notice"]["kind"], "shutting_down");
    }

    #[tokio::test]
    async fn closed_bridge_fails_pending_requests() {
        let (handle, mut intents, peer) = wire(Duration::from_secs(5));
        let request = tokio::spawn({
            let handle = handle.clone();
            async move { handle.rename("ev-1", "x").await }
        });
        tokio::task::yield_now().await;
        drop(peer);
        assert!(matches!(request.await.unwrap(), Err(EventError::Closed)));
        assert!(intents.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn shut_down_gives_up_at_the_deadline() {
        // Nobody reads the far end, so the writer stalls on its first frame.
        let (ours, _theirs) = duplex(16);
        let (our_read, our_write) = tokio::io::split(ours);
        let (handle, _intents, tasks) = connect(our_read, our_write, Duration::from_secs(5));
        handle.notify(Notice::ShuttingDown).await.unwrap();

        let start = Instant::now();
        shut_down(&handle, tasks, None, start + Duration::from_secs(2)).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_secs(3));
    }
}

//! Session hub: the WebSocket surface
//!
//! Accepts authenticated upgrades on `/ws`, keeps at most one live session
//! per user (a newer session replaces and closes its predecessor), fans
//! bus events out to sessions, and drives agent lifecycle: `ensure` on
//! open, `stop_all` when a user's last session is gone.
//!
//! Each session owns a bounded outbound queue drained by a single writer
//! task, so frame order equals publish order. On overflow, stale
//! `sync_status` frames are coalesced down to the latest per mailbox;
//! `new_email` frames are never dropped; a queue saturated with them marks
//! the session unhealthy and closes it with 1011.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use chrono::{DateTime, Utc};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::Notify;
use tokio::time::{MissedTickBehavior, timeout};
use tokio_util::sync::CancellationToken;

use crate::account::TokenVerifier;
use crate::config::SyncConfig;
use crate::events::EventBus;
use crate::models::{
    ConnectionData, Frame, InboundFrame, NewEmailData, PongData, SyncStatusData, now_iso,
};
use crate::supervisor::Supervisor;

/// Close codes used by the hub
const CLOSE_NORMAL: u16 = 1000;
const CLOSE_POLICY_VIOLATION: u16 = 1008;
const CLOSE_OVERLOADED: u16 = 1011;

/// Poll interval while waiting for queues and sessions to drain
const DRAIN_POLL: std::time::Duration = std::time::Duration::from_millis(20);

/// Pending close instruction for a session's writer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CloseCommand {
    code: u16,
    reason: &'static str,
}

struct QueueState {
    frames: VecDeque<Frame>,
    close: Option<CloseCommand>,
    coalesced: u64,
}

/// Bounded outbound queue owned by one session
struct SessionQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    /// Set by the reader on PONG, cleared by the heartbeat tick
    pong_seen: AtomicBool,
}

impl SessionQueue {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                frames: VecDeque::new(),
                close: None,
                coalesced: 0,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
            pong_seen: AtomicBool::new(true),
        })
    }

    /// Enqueue a frame, coalescing or closing on overflow
    fn push(&self, frame: Frame) {
        let mut state = self.state.lock().expect("session queue lock poisoned");
        if state.close.is_some() {
            return;
        }

        if state.frames.len() >= self.capacity {
            state.coalesced += coalesce_statuses(&mut state.frames);

            if state.frames.len() >= self.capacity {
                if frame.is_new_email() {
                    // Nothing left to shed: the session cannot keep up.
                    state.close = Some(CloseCommand {
                        code: CLOSE_OVERLOADED,
                        reason: "backpressure",
                    });
                    drop(state);
                    self.notify.notify_one();
                    return;
                }
                // Incoming status frame with a queue full of new_email:
                // shed the status, never the mail.
                state.coalesced += 1;
                return;
            }
        }

        state.frames.push_back(frame);
        drop(state);
        self.notify.notify_one();
    }

    /// Request the writer to send a close frame and terminate
    fn close_with(&self, code: u16, reason: &'static str) {
        let mut state = self.state.lock().expect("session queue lock poisoned");
        if state.close.is_none() {
            state.close = Some(CloseCommand { code, reason });
        }
        drop(state);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Frame> {
        self.state
            .lock()
            .expect("session queue lock poisoned")
            .frames
            .pop_front()
    }

    fn pending_close(&self) -> Option<CloseCommand> {
        self.state
            .lock()
            .expect("session queue lock poisoned")
            .close
    }

    fn is_empty(&self) -> bool {
        self.state
            .lock()
            .expect("session queue lock poisoned")
            .frames
            .is_empty()
    }

    #[cfg(test)]
    fn depth(&self) -> usize {
        self.state
            .lock()
            .expect("session queue lock poisoned")
            .frames
            .len()
    }

    #[cfg(test)]
    fn coalesced(&self) -> u64 {
        self.state
            .lock()
            .expect("session queue lock poisoned")
            .coalesced
    }
}

/// Remove superseded `sync_status` frames, keeping the latest per mailbox
fn coalesce_statuses(frames: &mut VecDeque<Frame>) -> u64 {
    let mut seen: HashSet<String> = HashSet::new();
    let mut removed = 0;
    let mut index = frames.len();
    while index > 0 {
        index -= 1;
        if let Some(email) = frames[index].sync_status_email() {
            if !seen.insert(email.to_owned()) {
                frames.remove(index);
                removed += 1;
            }
        }
    }
    removed
}

struct SessionEntry {
    /// Distinguishes this session from a replacement under the same user
    serial: u64,
    queue: Arc<SessionQueue>,
    cancel: CancellationToken,
    opened_at: DateTime<Utc>,
}

struct HubInner {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    supervisor: Supervisor,
    verifier: Arc<dyn TokenVerifier>,
    bus: Arc<EventBus>,
    config: Arc<SyncConfig>,
    serial: AtomicU64,
}

/// WebSocket session registry and event fan-out
#[derive(Clone)]
pub struct SessionHub {
    inner: Arc<HubInner>,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

impl SessionHub {
    pub fn new(
        supervisor: Supervisor,
        verifier: Arc<dyn TokenVerifier>,
        bus: Arc<EventBus>,
        config: Arc<SyncConfig>,
    ) -> Self {
        Self {
            inner: Arc::new(HubInner {
                sessions: Mutex::new(HashMap::new()),
                supervisor,
                verifier,
                bus,
                config,
                serial: AtomicU64::new(0),
            }),
        }
    }

    /// Router exposing the `/ws` upgrade endpoint
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_upgrade))
            .with_state(self.clone())
    }

    /// Spawn the bus fan-out tasks
    ///
    /// One subscription per topic; events route to the owning user's
    /// session, if any.
    pub fn spawn_fanout(&self) {
        let inner = self.inner.clone();
        let mut messages = inner.bus.subscribe_messages(inner.config.session_queue);
        tokio::spawn({
            let inner = inner.clone();
            async move {
                while let Some(event) = messages.recv().await {
                    let user_id = event.user_id.clone();
                    inner.deliver(
                        &user_id,
                        Frame::NewEmail(NewEmailData {
                            email: event.message,
                            user_id: event.user_id,
                            at: event.at,
                        }),
                    );
                }
            }
        });

        let mut statuses = inner.bus.subscribe_statuses(inner.config.session_queue);
        tokio::spawn(async move {
            while let Some(event) = statuses.recv().await {
                inner.deliver(
                    &event.user_id,
                    Frame::SyncStatus(SyncStatusData {
                        user_id: event.user_id.clone(),
                        email: event.email.clone(),
                        state: event.state.label().to_owned(),
                        error: event.state.error_message().map(str::to_owned),
                        at: event.at.clone(),
                    }),
                );
            }
        });
    }

    /// Queue a frame for one user's session, if connected
    pub fn send_to_user(&self, user_id: &str, frame: Frame) {
        self.inner.deliver(user_id, frame);
    }

    /// Queue a frame for every live session, swallowing per-session errors
    pub fn broadcast_all(&self, frame: Frame) {
        let sessions = self.inner.sessions.lock().expect("hub lock poisoned");
        for entry in sessions.values() {
            entry.queue.push(frame.clone());
        }
    }

    /// Live session count
    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().expect("hub lock poisoned").len()
    }

    /// Flush queued frames to every session, then close and reap them
    ///
    /// Runs after the supervisor has stopped all agents, so the final
    /// `sync_status` frames are still in flight on the bus or in session
    /// queues. Waits for the bus and every outbound queue to drain, asks
    /// each writer to close normally, and waits for the session tasks to
    /// finish. Sessions still alive at the deadline are cancelled outright.
    pub async fn shutdown(&self) {
        let deadline = self.inner.config.shutdown_deadline;
        if timeout(deadline, self.drain_and_close()).await.is_err() {
            tracing::warn!("session drain deadline exceeded, cancelling remaining sessions");
            let sessions = self.inner.sessions.lock().expect("hub lock poisoned");
            for entry in sessions.values() {
                entry.cancel.cancel();
            }
        }
    }

    async fn drain_and_close(&self) {
        // An event can sit between the bus and a queue for a moment, so a
        // single empty observation is not enough: require two in a row.
        let mut settled = 0;
        while settled < 2 {
            if self.inner.bus.is_drained() && self.inner.queues_idle() {
                settled += 1;
            } else {
                settled = 0;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }

        {
            let sessions = self.inner.sessions.lock().expect("hub lock poisoned");
            for entry in sessions.values() {
                entry.queue.close_with(CLOSE_NORMAL, "shutting down");
            }
        }

        while self.session_count() > 0 {
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }

    /// Drive one accepted socket to completion
    async fn handle_socket(self, socket: WebSocket, token: Option<String>) {
        let user_id = match token {
            Some(token) => self.inner.verifier.verify(&token).await,
            None => None,
        };
        let Some(user_id) = user_id else {
            close_unauthenticated(socket).await;
            return;
        };
        tracing::info!(%user_id, "session opened");

        let (serial, queue, cancel) = self.inner.register(&user_id);
        queue.push(Frame::Connection(ConnectionData {
            user_id: user_id.clone(),
            at: now_iso(),
        }));

        // Agent startup happens in the background; the handshake never
        // waits on IMAP.
        {
            let supervisor = self.inner.supervisor.clone();
            let user_id = user_id.clone();
            tokio::spawn(async move {
                if let Err(error) = supervisor.ensure_for_user(&user_id).await {
                    tracing::warn!(%user_id, %error, "ensure_for_user failed");
                }
            });
        }

        let (sink, stream) = socket.split();
        let reader = tokio::spawn(reader_task(
            self.inner.clone(),
            user_id.clone(),
            serial,
            queue.clone(),
            cancel.clone(),
            stream,
        ));
        writer_task(self.inner.clone(), &user_id, serial, queue, cancel, sink).await;
        let _ = reader.await;
        tracing::info!(%user_id, "session closed");
    }
}

impl HubInner {
    /// Insert a session, replacing (and closing) any predecessor
    fn register(&self, user_id: &str) -> (u64, Arc<SessionQueue>, CancellationToken) {
        let serial = self.serial.fetch_add(1, Ordering::Relaxed) + 1;
        let queue = SessionQueue::new(self.config.session_queue);
        let cancel = CancellationToken::new();

        let previous = {
            let mut sessions = self.sessions.lock().expect("hub lock poisoned");
            sessions.insert(
                user_id.to_owned(),
                SessionEntry {
                    serial,
                    queue: queue.clone(),
                    cancel: cancel.clone(),
                    opened_at: Utc::now(),
                },
            )
        };
        if let Some(previous) = previous {
            tracing::debug!(user_id, "session replaced");
            previous.queue.close_with(CLOSE_NORMAL, "replaced");
        }

        (serial, queue, cancel)
    }

    /// Remove a session exactly once and stop agents if it was the last
    ///
    /// Duplicate callbacks (reader and writer both finishing) are harmless:
    /// the serial guard makes removal idempotent, and a replaced session
    /// never touches its successor.
    async fn finish_session(&self, user_id: &str, serial: u64) {
        let removed = {
            let mut sessions = self.sessions.lock().expect("hub lock poisoned");
            if sessions
                .get(user_id)
                .is_some_and(|entry| entry.serial == serial)
            {
                let entry = sessions.remove(user_id).expect("entry just observed");
                entry.cancel.cancel();
                let lifetime = Utc::now() - entry.opened_at;
                tracing::debug!(
                    %user_id,
                    seconds = lifetime.num_seconds(),
                    "session removed"
                );
                true
            } else {
                false
            }
        };

        if removed {
            // One session per user: removal means no live session remains.
            self.supervisor.stop_all(user_id).await;
        }
    }

    fn deliver(&self, user_id: &str, frame: Frame) {
        let sessions = self.sessions.lock().expect("hub lock poisoned");
        if let Some(entry) = sessions.get(user_id) {
            entry.queue.push(frame);
        }
    }

    fn queues_idle(&self) -> bool {
        let sessions = self.sessions.lock().expect("hub lock poisoned");
        sessions.values().all(|entry| entry.queue.is_empty())
    }
}

/// Reject an upgrade whose token did not verify
async fn close_unauthenticated(mut socket: WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_POLICY_VIOLATION,
            reason: "invalid or missing token".into(),
        })))
        .await;
}

/// Single writer: drains the queue, heartbeats, enforces write timeouts
async fn writer_task(
    inner: Arc<HubInner>,
    user_id: &str,
    serial: u64,
    queue: Arc<SessionQueue>,
    cancel: CancellationToken,
    mut sink: SplitSink<WebSocket, Message>,
) {
    let write_timeout = inner.config.ws_write_timeout;
    let mut heartbeat = tokio::time::interval(inner.config.ws_heartbeat);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;

    let close = 'session: loop {
        tokio::select! {
            _ = cancel.cancelled() => break 'session None,
            _ = heartbeat.tick() => {
                if !queue.pong_seen.swap(false, Ordering::Relaxed) {
                    tracing::debug!(user_id, "heartbeat pong missed, terminating session");
                    break 'session None;
                }
                let ping = Message::Ping(axum::body::Bytes::new());
                if timeout(write_timeout, sink.send(ping)).await.map_or(true, |r| r.is_err()) {
                    break 'session None;
                }
            }
            _ = queue.notify.notified() => {
                loop {
                    if let Some(close) = queue.pending_close() {
                        break 'session Some(close);
                    }
                    let Some(frame) = queue.pop() else { break };
                    let text = match serde_json::to_string(&frame) {
                        Ok(text) => text,
                        Err(error) => {
                            tracing::error!(user_id, %error, "frame serialization failed");
                            continue;
                        }
                    };
                    if timeout(write_timeout, sink.send(Message::Text(text.into())))
                        .await
                        .map_or(true, |r| r.is_err())
                    {
                        tracing::debug!(user_id, "frame write failed or timed out");
                        break 'session None;
                    }
                }
            }
        }
    };

    if let Some(close) = close {
        let frame = Message::Close(Some(CloseFrame {
            code: close.code,
            reason: close.reason.into(),
        }));
        let _ = timeout(write_timeout, sink.send(frame)).await;
    }

    inner.finish_session(user_id, serial).await;
}

/// Reader: inbound frames, pong bookkeeping, close detection
async fn reader_task(
    inner: Arc<HubInner>,
    user_id: String,
    serial: u64,
    queue: Arc<SessionQueue>,
    cancel: CancellationToken,
    mut stream: SplitStream<WebSocket>,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => handle_inbound(&queue, text.as_str()),
                Some(Ok(Message::Pong(_))) => queue.pong_seen.store(true, Ordering::Relaxed),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    tracing::debug!(%user_id, %error, "session read error");
                    break;
                }
            }
        }
    }
    inner.finish_session(&user_id, serial).await;
}

/// Dispatch one inbound text frame
fn handle_inbound(queue: &SessionQueue, text: &str) {
    match serde_json::from_str::<InboundFrame>(text) {
        Ok(InboundFrame::Ping) => queue.push(Frame::Pong(PongData { at: now_iso() })),
        Ok(InboundFrame::Subscribe { topics }) => {
            // Advisory in this revision: acknowledged silently, everything
            // is delivered regardless.
            tracing::debug!(?topics, "subscribe acknowledged");
        }
        Ok(InboundFrame::Unknown) | Err(_) => {}
    }
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(hub): State<SessionHub>,
) -> Response {
    ws.on_upgrade(move |socket| hub.handle_socket(socket, query.token))
}

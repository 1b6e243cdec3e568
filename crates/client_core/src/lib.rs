use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::Client;
use shared::{
    domain::{ClientId, Position},
    protocol::{Envelope, PrivateRecord},
};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::{
        frame::{coding::CloseCode, CloseFrame},
        Message,
    },
};
use tracing::{debug, info, warn};
use url::Url;

pub mod drag;
pub mod roster;

use drag::DragState;
use roster::{Coloring, MarkerView, Roster};

const CLOSE_REASON: &str = "Work complete";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected,
    Disconnected { clean: bool },
    RosterChanged { markers: Vec<MarkerView> },
    PrivateReceived { from: ClientId, msg: String },
    HistoryLoaded { with: ClientId, records: Vec<PrivateRecord> },
    Error(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a connection is already active")]
    AlreadyConnected,
    #[error("own marker is not registered yet")]
    OwnMarkerMissing,
    #[error("no conversation is open")]
    NoConversationOpen,
    #[error("invalid server url: {0}")]
    InvalidServerUrl(String),
    #[error("failed to reach the server: {0}")]
    Transport(String),
}

/// Outbound half of a connection. The session talks to the transport
/// through this seam; tests substitute a recording sink.
#[async_trait]
pub trait EnvelopeSink: Send + Sync {
    async fn send(&self, envelope: Envelope) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

enum SinkCommand {
    Frame(Envelope),
    Close,
}

struct ChannelSink {
    commands: mpsc::UnboundedSender<SinkCommand>,
}

#[async_trait]
impl EnvelopeSink for ChannelSink {
    async fn send(&self, envelope: Envelope) -> Result<()> {
        self.commands
            .send(SinkCommand::Frame(envelope))
            .map_err(|_| anyhow!("writer task is gone"))
    }

    async fn close(&self) -> Result<()> {
        self.commands
            .send(SinkCommand::Close)
            .map_err(|_| anyhow!("writer task is gone"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptLine {
    pub from: ClientId,
    pub msg: String,
}

struct Conversation {
    peer: ClientId,
    transcript: Vec<TranscriptLine>,
}

struct SessionState {
    connection: ConnectionState,
    own_id: Option<ClientId>,
    roster: Roster,
    drag: Option<DragState>,
    conversation: Option<Conversation>,
    sink: Option<Arc<dyn EnvelopeSink>>,
}

/// One client session: owns the single WebSocket connection, the roster of
/// markers, the drag state of the own marker and the currently open
/// conversation. All observable changes fan out on a broadcast channel.
pub struct PresenceSession {
    http: Client,
    server_url: String,
    inner: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl PresenceSession {
    pub fn new(server_url: impl Into<String>) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            http: Client::new(),
            server_url: server_url.into(),
            inner: Mutex::new(SessionState {
                connection: ConnectionState::Idle,
                own_id: None,
                roster: Roster::new(),
                drag: None,
                conversation: None,
                sink: None,
            }),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.inner.lock().await.connection
    }

    pub async fn own_id(&self) -> Option<ClientId> {
        self.inner.lock().await.own_id.clone()
    }

    /// Rendered view of the marker map, ordered by identifier.
    pub async fn roster_snapshot(&self) -> Vec<MarkerView> {
        self.inner.lock().await.roster.snapshot()
    }

    pub async fn transcript(&self) -> Vec<TranscriptLine> {
        let guard = self.inner.lock().await;
        guard
            .conversation
            .as_ref()
            .map(|conversation| conversation.transcript.clone())
            .unwrap_or_default()
    }

    /// Open the WebSocket connection to `<server_url>/chat`. At most one
    /// connection is active per session; there is no reconnection and no
    /// backoff.
    pub async fn connect(self: &Arc<Self>) -> Result<(), SessionError> {
        let ws_url = websocket_url(&self.server_url)?;
        {
            let mut guard = self.inner.lock().await;
            if matches!(
                guard.connection,
                ConnectionState::Connecting | ConnectionState::Connected
            ) {
                return Err(SessionError::AlreadyConnected);
            }
            guard.connection = ConnectionState::Connecting;
        }

        let (stream, _) = match connect_async(&ws_url).await {
            Ok(ok) => ok,
            Err(err) => {
                self.inner.lock().await.connection = ConnectionState::Disconnected;
                return Err(SessionError::Transport(err.to_string()));
            }
        };
        info!(%ws_url, "connected");

        let (mut ws_writer, mut ws_reader) = stream.split();
        let (commands, mut command_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                match command {
                    SinkCommand::Frame(envelope) => {
                        let text = match serde_json::to_string(&envelope) {
                            Ok(text) => text,
                            Err(_) => continue,
                        };
                        if ws_writer.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    SinkCommand::Close => {
                        let _ = ws_writer
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::Normal,
                                reason: CLOSE_REASON.into(),
                            })))
                            .await;
                        break;
                    }
                }
            }
        });

        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut clean = false;
            while let Some(message) = ws_reader.next().await {
                match message {
                    Ok(Message::Text(text)) => client.handle_frame(&text).await,
                    Ok(Message::Close(frame)) => {
                        clean = frame
                            .map(|frame| frame.code == CloseCode::Normal)
                            .unwrap_or(false);
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        let _ = client.events.send(SessionEvent::Error(format!(
                            "websocket receive failed: {err}"
                        )));
                        break;
                    }
                }
            }
            client.finish_disconnect(clean).await;
        });

        self.attach_sink(Arc::new(ChannelSink { commands })).await
    }

    /// Attach an already-open transport instead of dialing. This is the
    /// dependency seam tests drive frames through.
    pub async fn connect_with_sink(
        self: &Arc<Self>,
        sink: Arc<dyn EnvelopeSink>,
    ) -> Result<(), SessionError> {
        {
            let guard = self.inner.lock().await;
            if matches!(
                guard.connection,
                ConnectionState::Connecting | ConnectionState::Connected
            ) {
                return Err(SessionError::AlreadyConnected);
            }
        }
        self.attach_sink(sink).await
    }

    async fn attach_sink(&self, sink: Arc<dyn EnvelopeSink>) -> Result<(), SessionError> {
        {
            let mut guard = self.inner.lock().await;
            if matches!(guard.connection, ConnectionState::Connected) {
                return Err(SessionError::AlreadyConnected);
            }
            guard.sink = Some(sink);
            guard.connection = ConnectionState::Connected;
        }
        let _ = self.events.send(SessionEvent::Connected);
        Ok(())
    }

    /// Explicit close: code 1000, reason "Work complete". Clears the local
    /// roster.
    pub async fn disconnect(&self) {
        let sink = {
            let mut guard = self.inner.lock().await;
            if !matches!(guard.connection, ConnectionState::Connected) {
                return;
            }
            guard.connection = ConnectionState::Disconnected;
            guard.own_id = None;
            guard.drag = None;
            guard.roster.clear();
            guard.sink.take()
        };
        if let Some(sink) = sink {
            if let Err(err) = sink.close().await {
                debug!(%err, "close handshake not delivered");
            }
        }
        let _ = self.events.send(SessionEvent::Disconnected { clean: true });
        self.emit_roster().await;
    }

    /// Transport-driven teardown. Markers are left in place; only the
    /// connection indicator changes.
    async fn finish_disconnect(&self, clean: bool) {
        {
            let mut guard = self.inner.lock().await;
            if !matches!(
                guard.connection,
                ConnectionState::Connecting | ConnectionState::Connected
            ) {
                return;
            }
            guard.connection = ConnectionState::Disconnected;
            guard.sink = None;
        }
        let _ = self.events.send(SessionEvent::Disconnected { clean });
    }

    /// Parse and dispatch one inbound text frame. A malformed frame is
    /// reported and dropped; dispatch continues for later frames.
    async fn handle_frame(&self, text: &str) {
        match serde_json::from_str::<Envelope>(text) {
            Ok(envelope) => self.apply(envelope).await,
            Err(err) => {
                warn!(%err, "dropping malformed frame");
                let _ = self
                    .events
                    .send(SessionEvent::Error(format!("invalid envelope: {err}")));
            }
        }
    }

    async fn apply(&self, envelope: Envelope) {
        match envelope {
            Envelope::NewClient { to, position } => {
                {
                    let mut guard = self.inner.lock().await;
                    guard.own_id = Some(to.clone());
                    guard.roster.insert(to, Coloring::Own, position);
                }
                self.emit_roster().await;
            }
            Envelope::Move { to, position } => {
                {
                    let mut guard = self.inner.lock().await;
                    let coloring_if_new = if guard.own_id.as_ref() == Some(&to) {
                        Coloring::Own
                    } else {
                        Coloring::Remote
                    };
                    guard.roster.apply_move(&to, position, coloring_if_new);
                }
                self.emit_roster().await;
            }
            Envelope::Leaved { to } => {
                let removed = {
                    let mut guard = self.inner.lock().await;
                    guard.roster.remove(&to)
                };
                if removed {
                    self.emit_roster().await;
                }
            }
            Envelope::Private { from, msg, .. } => {
                {
                    let mut guard = self.inner.lock().await;
                    if let Some(conversation) = guard.conversation.as_mut() {
                        if conversation.peer == from {
                            conversation.transcript.push(TranscriptLine {
                                from: from.clone(),
                                msg: msg.clone(),
                            });
                        }
                    }
                }
                let _ = self.events.send(SessionEvent::PrivateReceived { from, msg });
            }
            Envelope::Error { msg, .. } => {
                let _ = self.events.send(SessionEvent::Error(msg));
            }
            Envelope::MsgHistory { .. } => {
                debug!("ignoring msgHistory frame on the socket");
            }
        }
    }

    /// Start dragging the own marker. The pointer position fixes the grab
    /// offset every later move stays anchored to.
    pub async fn begin_drag(&self, pointer_x: f64, pointer_y: f64) -> Result<(), SessionError> {
        let mut guard = self.inner.lock().await;
        let own_id = guard.own_id.clone().ok_or(SessionError::OwnMarkerMissing)?;
        let origin = guard
            .roster
            .position_of(&own_id)
            .ok_or(SessionError::OwnMarkerMissing)?;
        guard.drag = Some(DragState::begin(pointer_x, pointer_y, origin));
        Ok(())
    }

    /// One pointer-move: reposition the own marker and broadcast it.
    /// Unthrottled; every call produces one outbound `move`. A no-op when
    /// no drag is active.
    pub async fn drag_to(&self, page_x: f64, page_y: f64) {
        let update = {
            let mut guard = self.inner.lock().await;
            let drag = guard.drag;
            match (drag, guard.own_id.clone()) {
                (Some(drag), Some(own_id)) => {
                    let position = drag.position_for(page_x, page_y);
                    guard.roster.apply_move(&own_id, position, Coloring::Own);
                    Some((own_id, position))
                }
                _ => None,
            }
        };
        let Some((own_id, position)) = update else {
            return;
        };
        self.emit_roster().await;
        self.send_envelope(Envelope::Move {
            to: own_id,
            position,
        })
        .await;
    }

    pub async fn end_drag(&self) {
        self.inner.lock().await.drag = None;
    }

    /// At most one conversation is open at a time, with one remote peer.
    pub async fn open_conversation(&self, peer: ClientId) {
        let mut guard = self.inner.lock().await;
        guard.conversation = Some(Conversation {
            peer,
            transcript: Vec::new(),
        });
    }

    pub async fn close_conversation(&self) {
        self.inner.lock().await.conversation = None;
    }

    pub async fn conversation_peer(&self) -> Option<ClientId> {
        let guard = self.inner.lock().await;
        guard
            .conversation
            .as_ref()
            .map(|conversation| conversation.peer.clone())
    }

    /// Send a private line to the open conversation's peer. Delivery is
    /// fire-and-forget; no acknowledgment is modeled.
    pub async fn send_private(&self, text: &str) -> Result<(), SessionError> {
        let (peer, own_id) = {
            let mut guard = self.inner.lock().await;
            let own_id = guard.own_id.clone().ok_or(SessionError::OwnMarkerMissing)?;
            let conversation = guard
                .conversation
                .as_mut()
                .ok_or(SessionError::NoConversationOpen)?;
            conversation.transcript.push(TranscriptLine {
                from: own_id.clone(),
                msg: text.to_string(),
            });
            (conversation.peer.clone(), own_id)
        };
        self.send_envelope(Envelope::Private {
            to: peer,
            from: own_id,
            msg: text.to_string(),
        })
        .await;
        Ok(())
    }

    /// Preload the stored conversation with `peer` from the history
    /// endpoint. Runs detached: nothing awaits it, the request is not
    /// cancelled if the conversation closes first, and the outcome arrives
    /// as a [`SessionEvent::HistoryLoaded`] or [`SessionEvent::Error`].
    /// Records are folded into the transcript only if the conversation is
    /// still open on the same peer.
    pub fn load_history(self: &Arc<Self>, peer: ClientId) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            match client.fetch_history(&peer).await {
                Ok(records) => {
                    {
                        let mut guard = client.inner.lock().await;
                        if let Some(conversation) = guard.conversation.as_mut() {
                            if conversation.peer == peer {
                                let mut lines: Vec<TranscriptLine> = records
                                    .iter()
                                    .map(|record| TranscriptLine {
                                        from: record.from.clone(),
                                        msg: record.msg.clone(),
                                    })
                                    .collect();
                                lines.append(&mut conversation.transcript);
                                conversation.transcript = lines;
                            }
                        }
                    }
                    let _ = client
                        .events
                        .send(SessionEvent::HistoryLoaded { with: peer, records });
                }
                Err(err) => {
                    let _ = client
                        .events
                        .send(SessionEvent::Error(format!("history fetch failed: {err}")));
                }
            }
        });
    }

    async fn fetch_history(&self, peer: &ClientId) -> Result<Vec<PrivateRecord>> {
        let own_id = self
            .own_id()
            .await
            .ok_or_else(|| anyhow!("own identifier is not registered yet"))?;
        let records = self
            .http
            .post(format!("{}/messages", self.server_url))
            .json(&Envelope::MsgHistory {
                to: peer.clone(),
                from: own_id,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("invalid history response")?;
        Ok(records)
    }

    /// Outbound guard: envelopes are handed to the transport only while
    /// connected; otherwise they are dropped, fire-and-forget.
    async fn send_envelope(&self, envelope: Envelope) {
        let sink = {
            let guard = self.inner.lock().await;
            if !matches!(guard.connection, ConnectionState::Connected) {
                debug!("dropping outbound envelope while not connected");
                return;
            }
            guard.sink.clone()
        };
        let Some(sink) = sink else {
            return;
        };
        if let Err(err) = sink.send(envelope).await {
            warn!(%err, "outbound send failed");
        }
    }

    async fn emit_roster(&self) {
        let markers = self.roster_snapshot().await;
        let _ = self.events.send(SessionEvent::RosterChanged { markers });
    }
}

fn websocket_url(server_url: &str) -> Result<String, SessionError> {
    let mut url =
        Url::parse(server_url).map_err(|err| SessionError::InvalidServerUrl(err.to_string()))?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(SessionError::InvalidServerUrl(format!(
                "expected http or https, got {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SessionError::InvalidServerUrl("scheme rewrite failed".to_string()))?;
    url.set_path("/chat");
    Ok(url.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

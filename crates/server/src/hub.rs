use std::{collections::HashMap, sync::Arc};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use rand::Rng;
use shared::{
    domain::{ClientId, Position},
    protocol::Envelope,
};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::AppState;

/// Registry of connected clients: identifier to outbound queue plus the
/// last position that client reported.
pub struct Hub {
    clients: Mutex<HashMap<ClientId, ClientEntry>>,
}

struct ClientEntry {
    outbound: mpsc::UnboundedSender<Envelope>,
    position: Position,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Admit a new client: deliver its `newclient` envelope first, exchange
    /// `move` announcements with everyone already present (both directions),
    /// then register it.
    pub async fn join(
        &self,
        id: ClientId,
        position: Position,
        outbound: mpsc::UnboundedSender<Envelope>,
    ) {
        let mut clients = self.clients.lock().await;
        let _ = outbound.send(Envelope::NewClient {
            to: id.clone(),
            position,
        });
        for (other_id, other) in clients.iter() {
            let _ = other.outbound.send(Envelope::Move {
                to: id.clone(),
                position,
            });
            let _ = outbound.send(Envelope::Move {
                to: other_id.clone(),
                position: other.position,
            });
        }
        clients.insert(id, ClientEntry { outbound, position });
    }

    /// Unregister and tell everyone left behind.
    pub async fn leave(&self, id: &ClientId) {
        let mut clients = self.clients.lock().await;
        if clients.remove(id).is_some() {
            for entry in clients.values() {
                let _ = entry.outbound.send(Envelope::Leaved { to: id.clone() });
            }
        }
    }

    /// Record the mover's position and broadcast it to every client, the
    /// mover included. The broadcast carries the connection's identifier,
    /// not whatever the frame claimed.
    pub async fn broadcast_move(&self, id: &ClientId, position: Position) {
        let mut clients = self.clients.lock().await;
        if let Some(entry) = clients.get_mut(id) {
            entry.position = position;
        }
        for entry in clients.values() {
            let _ = entry.outbound.send(Envelope::Move {
                to: id.clone(),
                position,
            });
        }
    }

    /// Deliver to the addressed client only. Returns false when the target
    /// is not connected.
    pub async fn send_to(&self, target: &ClientId, envelope: Envelope) -> bool {
        let clients = self.clients.lock().await;
        match clients.get(target) {
            Some(entry) => entry.outbound.send(envelope).is_ok(),
            None => false,
        }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }
}

fn random_initial_position() -> Position {
    let mut rng = rand::thread_rng();
    Position::new(
        rng.gen_range(0..1000) as f64,
        rng.gen_range(0..1000) as f64,
    )
}

/// Drive one WebSocket connection from upgrade to teardown.
pub async fn run_client(state: Arc<AppState>, socket: WebSocket) {
    let id = ClientId::new(Uuid::new_v4().to_string());
    let position = random_initial_position();
    info!(client_id = %id, "client connected");

    let (outbound, mut outbound_rx) = mpsc::unbounded_channel();
    let (mut ws_writer, mut ws_reader) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(envelope) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&envelope) {
                Ok(text) => text,
                Err(_) => continue,
            };
            if ws_writer.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    state.hub.join(id.clone(), position, outbound.clone()).await;

    let reader_id = id.clone();
    let reader_state = Arc::clone(&state);
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = ws_reader.next().await {
            let Message::Text(text) = message else {
                continue;
            };
            let envelope = match serde_json::from_str::<Envelope>(&text) {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!(client_id = %reader_id, %err, "skipping unparseable frame");
                    continue;
                }
            };
            dispatch_inbound(&reader_state, &reader_id, &outbound, envelope).await;
        }
    });

    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    };

    state.hub.leave(&id).await;
    info!(client_id = %id, "client disconnected");
}

async fn dispatch_inbound(
    state: &Arc<AppState>,
    client_id: &ClientId,
    echo: &mpsc::UnboundedSender<Envelope>,
    envelope: Envelope,
) {
    match envelope {
        Envelope::Move { position, .. } => {
            state.hub.broadcast_move(client_id, position).await;
        }
        Envelope::Private { to, from, msg } => {
            match state.storage.store_private_message(&to, &from, &msg).await {
                Ok(_) => {
                    let delivered = state
                        .hub
                        .send_to(
                            &to,
                            Envelope::Private {
                                to: to.clone(),
                                from,
                                msg,
                            },
                        )
                        .await;
                    if !delivered {
                        debug!(client_id = %client_id, target = %to, "private target not connected");
                    }
                }
                Err(err) => {
                    warn!(client_id = %client_id, %err, "failed to persist private message");
                    let _ = echo.send(Envelope::Error {
                        to,
                        msg: "failed to send your message".to_string(),
                    });
                }
            }
        }
        other => {
            debug!(client_id = %client_id, "ignoring unexpected inbound frame: {other:?}");
        }
    }
}

use super::*;
use axum::{routing::post, Json, Router};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Default)]
struct RecordingSink {
    sent: Mutex<Vec<Envelope>>,
    closed: AtomicBool,
}

impl RecordingSink {
    async fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl EnvelopeSink for RecordingSink {
    async fn send(&self, envelope: Envelope) -> Result<()> {
        self.sent.lock().await.push(envelope);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

async fn connected_session() -> (Arc<PresenceSession>, Arc<RecordingSink>) {
    let session = PresenceSession::new("http://127.0.0.1:9");
    let sink = Arc::new(RecordingSink::default());
    session
        .connect_with_sink(Arc::clone(&sink) as Arc<dyn EnvelopeSink>)
        .await
        .expect("connect");
    (session, sink)
}

fn newclient_frame(id: &str, x: f64, y: f64) -> String {
    format!(r#"{{"type":"newclient","to":"{id}","position":{{"pagex":{x},"pagey":{y}}}}}"#)
}

#[tokio::test]
async fn presence_then_departure_leaves_no_marker() {
    let (session, _sink) = connected_session().await;

    session
        .handle_frame(&newclient_frame("abc123", 10.0, 20.0))
        .await;
    assert_eq!(session.roster_snapshot().await.len(), 1);

    session
        .handle_frame(r#"{"type":"leaved","to":"abc123"}"#)
        .await;
    assert!(session.roster_snapshot().await.is_empty());
}

#[tokio::test]
async fn move_for_unknown_identifier_creates_one_remote_marker() {
    let (session, _sink) = connected_session().await;

    session
        .handle_frame(r#"{"type":"move","to":"abc123","position":{"pagex":50,"pagey":80}}"#)
        .await;

    let markers = session.roster_snapshot().await;
    assert_eq!(markers.len(), 1);
    assert_eq!(markers[0].client_id, ClientId::from("abc123"));
    assert_eq!(markers[0].coloring, Coloring::Remote);
    assert_eq!(markers[0].position, Position::new(50.0, 80.0));
}

#[tokio::test]
async fn repeated_moves_keep_one_marker_at_the_latest_position() {
    let (session, _sink) = connected_session().await;

    session
        .handle_frame(r#"{"type":"move","to":"abc123","position":{"pagex":50,"pagey":80}}"#)
        .await;
    session
        .handle_frame(r#"{"type":"move","to":"abc123","position":{"pagex":70,"pagey":90}}"#)
        .await;

    let markers = session.roster_snapshot().await;
    assert_eq!(markers.len(), 1);
    assert_eq!(markers[0].position, Position::new(70.0, 90.0));
}

#[tokio::test]
async fn departure_of_an_unknown_identifier_is_a_noop() {
    let (session, _sink) = connected_session().await;

    session
        .handle_frame(r#"{"type":"leaved","to":"ghost"}"#)
        .await;
    assert!(session.roster_snapshot().await.is_empty());
}

#[tokio::test]
async fn own_marker_is_never_remote_colored() {
    let (session, _sink) = connected_session().await;

    session.handle_frame(&newclient_frame("me", 1.0, 2.0)).await;
    session
        .handle_frame(r#"{"type":"move","to":"me","position":{"pagex":5,"pagey":6}}"#)
        .await;

    let markers = session.roster_snapshot().await;
    assert_eq!(markers.len(), 1);
    assert_eq!(markers[0].coloring, Coloring::Own);
    assert_eq!(markers[0].position, Position::new(5.0, 6.0));
}

#[tokio::test]
async fn malformed_frames_do_not_stop_dispatch() {
    let (session, _sink) = connected_session().await;
    let mut events = session.subscribe_events();

    session.handle_frame("not json at all").await;
    session
        .handle_frame(r#"{"type":"move","to":"abc123","position":{"pagex":1,"pagey":2}}"#)
        .await;

    assert_eq!(session.roster_snapshot().await.len(), 1);
    let first = events.recv().await.expect("event");
    assert!(matches!(first, SessionEvent::Error(_)));
}

#[tokio::test]
async fn every_drag_move_sends_one_anchored_envelope() {
    let (session, sink) = connected_session().await;
    session.handle_frame(&newclient_frame("me", 10.0, 20.0)).await;

    session.begin_drag(14.0, 25.0).await.expect("begin drag");
    session.drag_to(50.0, 80.0).await;
    session.drag_to(60.0, 90.0).await;

    let sent = sink.sent().await;
    assert_eq!(
        sent,
        vec![
            Envelope::Move {
                to: ClientId::from("me"),
                position: Position::new(46.0, 75.0),
            },
            Envelope::Move {
                to: ClientId::from("me"),
                position: Position::new(56.0, 85.0),
            },
        ]
    );
    assert_eq!(
        session.roster_snapshot().await[0].position,
        Position::new(56.0, 85.0)
    );
}

#[tokio::test]
async fn drag_without_own_marker_errors() {
    let (session, _sink) = connected_session().await;
    let result = session.begin_drag(0.0, 0.0).await;
    assert!(matches!(result, Err(SessionError::OwnMarkerMissing)));
}

#[tokio::test]
async fn drag_after_release_is_inert() {
    let (session, sink) = connected_session().await;
    session.handle_frame(&newclient_frame("me", 10.0, 20.0)).await;

    session.begin_drag(10.0, 20.0).await.expect("begin drag");
    session.drag_to(30.0, 40.0).await;
    session.end_drag().await;
    session.drag_to(99.0, 99.0).await;

    assert_eq!(sink.sent().await.len(), 1);
    assert_eq!(
        session.roster_snapshot().await[0].position,
        Position::new(30.0, 40.0)
    );
}

#[tokio::test]
async fn sends_while_disconnected_are_dropped() {
    let (session, sink) = connected_session().await;
    let mut events = session.subscribe_events();
    session.handle_frame(&newclient_frame("me", 0.0, 0.0)).await;
    session.open_conversation(ClientId::from("peer")).await;

    session.finish_disconnect(false).await;
    assert_eq!(
        session.connection_state().await,
        ConnectionState::Disconnected
    );

    session.send_private("hello?").await.expect("send");
    assert!(sink.sent().await.is_empty());
    assert_eq!(session.transcript().await.len(), 1);

    loop {
        match events.recv().await.expect("event") {
            SessionEvent::Disconnected { clean } => {
                assert!(!clean);
                break;
            }
            _ => continue,
        }
    }
}

#[tokio::test]
async fn private_appends_only_to_the_matching_conversation() {
    let (session, _sink) = connected_session().await;
    session.open_conversation(ClientId::from("peer-1")).await;

    session
        .handle_frame(r#"{"type":"private","to":"me","from":"peer-1","msg":"hi"}"#)
        .await;
    session
        .handle_frame(r#"{"type":"private","to":"me","from":"peer-2","msg":"wrong window"}"#)
        .await;

    let transcript = session.transcript().await;
    assert_eq!(transcript.len(), 1);
    assert_eq!(transcript[0].from, ClientId::from("peer-1"));
    assert_eq!(transcript[0].msg, "hi");
}

#[tokio::test]
async fn send_private_addresses_the_open_peer() {
    let (session, sink) = connected_session().await;
    session.handle_frame(&newclient_frame("me", 0.0, 0.0)).await;
    session.open_conversation(ClientId::from("peer")).await;

    session.send_private("hello").await.expect("send");

    assert_eq!(
        sink.sent().await,
        vec![Envelope::Private {
            to: ClientId::from("peer"),
            from: ClientId::from("me"),
            msg: "hello".to_string(),
        }]
    );
    let transcript = session.transcript().await;
    assert_eq!(transcript.len(), 1);
    assert_eq!(transcript[0].from, ClientId::from("me"));
}

#[tokio::test]
async fn send_private_without_a_conversation_errors() {
    let (session, _sink) = connected_session().await;
    session.handle_frame(&newclient_frame("me", 0.0, 0.0)).await;

    let result = session.send_private("into the void").await;
    assert!(matches!(result, Err(SessionError::NoConversationOpen)));
}

#[tokio::test]
async fn explicit_disconnect_clears_the_roster_and_closes_the_transport() {
    let (session, sink) = connected_session().await;
    let mut events = session.subscribe_events();
    session.handle_frame(&newclient_frame("me", 0.0, 0.0)).await;
    session
        .handle_frame(r#"{"type":"move","to":"other","position":{"pagex":1,"pagey":2}}"#)
        .await;

    session.disconnect().await;

    assert!(session.roster_snapshot().await.is_empty());
    assert!(sink.closed.load(Ordering::SeqCst));
    assert_eq!(session.own_id().await, None);

    loop {
        match events.recv().await.expect("event") {
            SessionEvent::Disconnected { clean } => {
                assert!(clean);
                break;
            }
            _ => continue,
        }
    }
}

#[tokio::test]
async fn connecting_twice_is_rejected() {
    let (session, _sink) = connected_session().await;
    let second = Arc::new(RecordingSink::default());
    let result = session
        .connect_with_sink(second as Arc<dyn EnvelopeSink>)
        .await;
    assert!(matches!(result, Err(SessionError::AlreadyConnected)));
}

async fn history_test_server() -> String {
    async fn messages_route(Json(body): Json<Envelope>) -> Json<Vec<PrivateRecord>> {
        match body {
            Envelope::MsgHistory { to, .. } => Json(vec![PrivateRecord {
                from: to,
                msg: "old line".to_string(),
            }]),
            _ => Json(Vec::new()),
        }
    }

    let app = Router::new().route("/messages", post(messages_route));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn history_preload_prepends_stored_records() {
    let server_url = history_test_server().await;
    let session = PresenceSession::new(server_url);
    let sink = Arc::new(RecordingSink::default());
    session
        .connect_with_sink(sink as Arc<dyn EnvelopeSink>)
        .await
        .expect("connect");
    session.handle_frame(&newclient_frame("me", 0.0, 0.0)).await;

    let peer = ClientId::from("peer");
    session.open_conversation(peer.clone()).await;
    session.send_private("fresh line").await.expect("send");

    let mut events = session.subscribe_events();
    session.load_history(peer.clone());

    let loaded = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await.expect("event") {
                SessionEvent::HistoryLoaded { with, records } => break (with, records),
                SessionEvent::Error(message) => panic!("history failed: {message}"),
                _ => continue,
            }
        }
    })
    .await
    .expect("history within deadline");

    assert_eq!(loaded.0, peer);
    assert_eq!(loaded.1.len(), 1);

    let transcript = session.transcript().await;
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[0].msg, "old line");
    assert_eq!(transcript[1].msg, "fresh line");
}

#[tokio::test]
async fn history_outcome_is_reported_even_after_the_conversation_closes() {
    let server_url = history_test_server().await;
    let session = PresenceSession::new(server_url);
    let sink = Arc::new(RecordingSink::default());
    session
        .connect_with_sink(sink as Arc<dyn EnvelopeSink>)
        .await
        .expect("connect");
    session.handle_frame(&newclient_frame("me", 0.0, 0.0)).await;

    let peer = ClientId::from("peer");
    session.open_conversation(peer.clone()).await;
    session.close_conversation().await;

    let mut events = session.subscribe_events();
    session.load_history(peer.clone());

    let loaded = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await.expect("event") {
                SessionEvent::HistoryLoaded { with, records } => break (with, records),
                SessionEvent::Error(message) => panic!("history failed: {message}"),
                _ => continue,
            }
        }
    })
    .await
    .expect("history within deadline");

    assert_eq!(loaded.0, peer);
    assert!(session.transcript().await.is_empty());
}

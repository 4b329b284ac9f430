//! End-to-end signaling scenarios against a relay bound to a loopback port.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use eventcast_relay::{
    app,
    auth::{AnonymousAuthenticator, Authenticator, JwtAuthenticator},
    protocol::ConnectionId,
    serve, RelaySettings, SignalingState,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message},
    MaybeTlsStream, WebSocketStream,
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_DEADLINE: Duration = Duration::from_secs(5);
const QUIET_PERIOD: Duration = Duration::from_millis(250);

struct Peer {
    id: String,
    ws: Socket,
}

impl Peer {
    async fn send(&mut self, frame: Value) {
        self.ws
            .send(Message::Text(frame.to_string().into()))
            .await
            .expect("send frame");
    }

    async fn recv(&mut self) -> Value {
        loop {
            let message = timeout(RECV_DEADLINE, self.ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("socket closed")
                .expect("socket error");
            if let Message::Text(text) = message {
                return serde_json::from_str(text.as_str()).expect("json frame");
            }
        }
    }

    /// Asserts nothing arrives for a short while.
    async fn expect_silence(&mut self) {
        if let Ok(Some(Ok(Message::Text(text)))) = timeout(QUIET_PERIOD, self.ws.next()).await {
            panic!("unexpected frame: {text}");
        }
    }

    fn connection_id(&self) -> ConnectionId {
        self.id.parse().expect("connection id")
    }
}

async fn start_relay(
    settings: RelaySettings,
    auth: Arc<dyn Authenticator>,
) -> (SocketAddr, SignalingState) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let state = SignalingState::new(settings, auth);
    let router = app(state.clone(), None);
    tokio::spawn(serve(listener, router, std::future::pending()));
    (addr, state)
}

async fn open_relay() -> (SocketAddr, SignalingState) {
    start_relay(RelaySettings::default(), Arc::new(AnonymousAuthenticator)).await
}

async fn join(addr: SocketAddr, query: &str) -> Peer {
    let (ws, _) = connect_async(format!("ws://{addr}/ws{query}"))
        .await
        .expect("connect");
    let mut peer = Peer {
        id: String::new(),
        ws,
    };
    let welcome = peer.recv().await;
    assert_eq!(welcome["type"], "welcome");
    peer.id = welcome["id"].as_str().expect("welcome id").to_string();
    peer
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    let deadline = tokio::time::Instant::now() + RECV_DEADLINE;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        sleep(Duration::from_millis(10)).await;
    }
}

#[test_timeout::tokio_timeout_test(30)]
async fn offer_answer_and_candidates_reach_the_addressed_peer() {
    let (addr, _state) = open_relay().await;
    let mut a = join(addr, "").await;
    let mut b = join(addr, "").await;

    a.send(json!({"type": "offer", "socketId": b.id, "offer": "X"}))
        .await;
    assert_eq!(
        b.recv().await,
        json!({"type": "offer", "fromId": a.id, "offer": "X"})
    );

    b.send(json!({"type": "answer", "socketId": a.id, "answer": "Y"}))
        .await;
    assert_eq!(
        a.recv().await,
        json!({"type": "answer", "fromId": b.id, "answer": "Y"})
    );

    for candidate in ["c1", "c2", "c3"] {
        a.send(json!({"type": "ice-candidate", "socketId": b.id, "candidate": candidate}))
            .await;
    }
    for candidate in ["c1", "c2", "c3"] {
        let frame = b.recv().await;
        assert_eq!(frame["type"], "ice-candidate");
        assert_eq!(frame["fromId"], a.id.as_str());
        assert_eq!(frame["candidate"], candidate);
    }
}

#[test_timeout::tokio_timeout_test(30)]
async fn many_envelopes_keep_sender_order() {
    let (addr, _state) = open_relay().await;
    let mut a = join(addr, "").await;
    let mut b = join(addr, "").await;

    for n in 0..40 {
        a.send(json!({"type": "ice-candidate", "socketId": b.id, "candidate": {"seq": n}}))
            .await;
    }
    for n in 0..40 {
        assert_eq!(b.recv().await["candidate"]["seq"], n);
    }
}

#[test_timeout::tokio_timeout_test(30)]
async fn payload_is_forwarded_verbatim() {
    let (addr, _state) = open_relay().await;
    let mut a = join(addr, "").await;
    let (mut raw_b, _) = connect_async(format!("ws://{addr}/ws")).await.expect("connect");
    let welcome = match raw_b.next().await {
        Some(Ok(Message::Text(text))) => serde_json::from_str::<Value>(text.as_str()).unwrap(),
        other => panic!("unexpected {other:?}"),
    };
    let b_id = welcome["id"].as_str().unwrap().to_string();

    let payload = r#"{"sdp":"v=0\r\n","big":12345678901234567890,"f":1.50}"#;
    a.ws.send(Message::Text(
        format!(r#"{{"type":"offer","socketId":"{b_id}","offer":{payload}}}"#).into(),
    ))
    .await
    .unwrap();

    let forwarded = match timeout(RECV_DEADLINE, raw_b.next()).await.unwrap() {
        Some(Ok(Message::Text(text))) => text.as_str().to_string(),
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(
        forwarded,
        format!(r#"{{"type":"offer","fromId":"{}","offer":{payload}}}"#, a.id)
    );
}

#[test_timeout::tokio_timeout_test(30)]
async fn unknown_and_self_targets_are_silently_dropped() {
    let (addr, _state) = open_relay().await;
    let mut a = join(addr, "").await;
    let mut b = join(addr, "").await;

    let stranger = ConnectionId::generate().to_string();
    a.send(json!({"type": "offer", "socketId": stranger, "offer": "X"}))
        .await;
    a.send(json!({"type": "offer", "socketId": a.id, "offer": "X"}))
        .await;
    a.send(json!({"type": "offer", "offer": "X"})).await;
    a.send(json!({"type": "renegotiate", "socketId": b.id})).await;

    a.expect_silence().await;
    b.expect_silence().await;
}

#[test_timeout::tokio_timeout_test(30)]
async fn departed_peer_is_notified_and_unreachable() {
    let (addr, state) = open_relay().await;
    let mut a = join(addr, "").await;
    let mut b = join(addr, "").await;
    let a_id = a.connection_id();

    a.send(json!({"type": "offer", "socketId": b.id, "offer": "X"}))
        .await;
    assert_eq!(b.recv().await["type"], "offer");

    a.ws.close(None).await.expect("close");
    assert_eq!(
        b.recv().await,
        json!({"type": "peer-disconnected", "fromId": a.id})
    );
    wait_until(|| !state.registry().contains(&a_id)).await;

    b.send(json!({"type": "answer", "socketId": a.id, "answer": "Y"}))
        .await;
    b.expect_silence().await;
    assert_eq!(state.registry().len(), 1);
}

#[test_timeout::tokio_timeout_test(30)]
async fn rooms_scope_who_can_be_addressed() {
    let (addr, _state) = open_relay().await;
    let mut a = join(addr, "?room=event-1").await;
    let mut b = join(addr, "?room=event-2").await;
    let mut c = join(addr, "?room=event-1").await;

    a.send(json!({"type": "offer", "socketId": b.id, "offer": "X"}))
        .await;
    b.expect_silence().await;

    a.send(json!({"type": "offer", "socketId": c.id, "offer": "X"}))
        .await;
    assert_eq!(c.recv().await["fromId"], a.id.as_str());
}

#[test_timeout::tokio_timeout_test(30)]
async fn malformed_frames_get_an_error_and_keep_the_connection() {
    let (addr, _state) = open_relay().await;
    let mut a = join(addr, "").await;

    a.ws.send(Message::Text("{not json".into())).await.unwrap();
    assert_eq!(a.recv().await["type"], "error");

    a.send(json!({"type": "ping"})).await;
    assert_eq!(a.recv().await, json!({"type": "pong"}));
}

#[test_timeout::tokio_timeout_test(30)]
async fn idle_connections_are_closed_and_unregistered() {
    let settings = RelaySettings {
        idle_timeout: Duration::from_millis(200),
        ..RelaySettings::default()
    };
    let (addr, state) = start_relay(settings, Arc::new(AnonymousAuthenticator)).await;
    let mut a = join(addr, "").await;
    let a_id = a.connection_id();

    wait_until(|| !state.registry().contains(&a_id)).await;
    let closed = loop {
        match timeout(RECV_DEADLINE, a.ws.next()).await.expect("close in time") {
            None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break true,
            Some(Ok(_)) => continue,
        }
    };
    assert!(closed);
}

#[test_timeout::tokio_timeout_test(30)]
async fn server_pings_keep_a_quiet_viewer_connected() {
    let settings = RelaySettings {
        idle_timeout: Duration::from_millis(400),
        heartbeat_interval: Duration::from_millis(100),
        ..RelaySettings::default()
    };
    let (addr, state) = start_relay(settings, Arc::new(AnonymousAuthenticator)).await;
    let mut a = join(addr, "").await;
    let a_id = a.connection_id();

    // Only read, so the automatic pong replies are the sole client traffic.
    let until = tokio::time::Instant::now() + Duration::from_millis(1200);
    let mut pings = 0;
    while let Ok(next) = tokio::time::timeout_at(until, a.ws.next()).await {
        match next {
            Some(Ok(Message::Ping(_))) => pings += 1,
            Some(Ok(_)) => {}
            other => panic!("connection ended early: {other:?}"),
        }
    }

    assert!(pings >= 3, "only {pings} pings");
    assert!(state.registry().contains(&a_id));
}

#[test_timeout::tokio_timeout_test(30)]
async fn shutdown_drains_every_connection() {
    let (addr, state) = open_relay().await;
    let a = join(addr, "").await;
    let b = join(addr, "").await;
    assert_eq!(state.registry().len(), 2);

    state.close_all();
    assert!(state.registry().is_empty());
    drop((a, b));
}

#[test_timeout::tokio_timeout_test(30)]
async fn upgrade_requires_valid_token_when_auth_is_enabled() {
    let secret = b"event-api-secret";
    let (addr, state) = start_relay(
        RelaySettings::default(),
        Arc::new(JwtAuthenticator::new(secret)),
    )
    .await;

    let status_of = |result: Result<_, tungstenite::Error>| match result {
        Err(tungstenite::Error::Http(response)) => response.status().as_u16(),
        Err(other) => panic!("unexpected error {other:?}"),
        Ok(_) => panic!("upgrade should have been rejected"),
    };

    let missing = connect_async(format!("ws://{addr}/ws")).await.map(|_| ());
    assert_eq!(status_of(missing), 401);

    let forged = connect_async(format!("ws://{addr}/ws?token=not-a-jwt"))
        .await
        .map(|_| ());
    assert_eq!(status_of(forged), 403);
    assert!(state.registry().is_empty());

    let exp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
        + 600;
    let token = jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &json!({"id": "viewer-1", "exp": exp}),
        &jsonwebtoken::EncodingKey::from_secret(secret),
    )
    .unwrap();
    let peer = join(addr, &format!("?token={token}")).await;
    assert!(state.registry().contains(&peer.connection_id()));
}

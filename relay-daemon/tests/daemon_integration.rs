//! End-to-end daemon tests over a real unix socket.

use relay_daemon::config::DaemonConfig;
use relay_daemon::launcher::NullLauncher;
use relay_daemon::Daemon;
use relay_proto::client::{ClientConfig, ClientEvent, RelayClient};
use relay_proto::envelope::{Body, Capabilities, Envelope, Hello, SessionRef};
use relay_proto::error::{ClientError, ErrorCode, FailureCause};
use relay_proto::frame::{encode, FrameDecoder, Framing};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

async fn wait_for_socket(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        if path.exists() {
            return;
        }
        if Instant::now() >= deadline {
            panic!("Socket did not appear: {}", path.display());
        }
        sleep(Duration::from_millis(20)).await;
    }
}

async fn start_daemon(dir: &Path) -> Daemon {
    let config = DaemonConfig {
        socket: Some(dir.join("relay.sock")),
        heartbeat_ms: 60_000,
        ..DaemonConfig::default()
    };
    let daemon = Daemon::start(config, Arc::new(NullLauncher));
    wait_for_socket(&daemon.socket_path).await;
    daemon
}

async fn connect(path: &Path, name: &str) -> (RelayClient, mpsc::Receiver<ClientEvent>) {
    connect_with(path, name, Capabilities::default(), true).await
}

async fn connect_with(
    path: &Path,
    name: &str,
    capabilities: Capabilities,
    auto_ack: bool,
) -> (RelayClient, mpsc::Receiver<ClientEvent>) {
    let mut config = ClientConfig::new(path, name);
    config.capabilities = capabilities;
    config.auto_ack = auto_ack;
    let (client, mut events) = RelayClient::connect(config);
    // Drain state changes until the session is up.
    loop {
        match timeout(Duration::from_secs(3), events.recv())
            .await
            .expect("timed out waiting for Connected")
            .expect("client closed during connect")
        {
            ClientEvent::Connected(_) => break,
            _ => continue,
        }
    }
    (client, events)
}

async fn next_delivery(events: &mut mpsc::Receiver<ClientEvent>) -> Envelope {
    loop {
        match timeout(Duration::from_secs(3), events.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("client closed")
        {
            ClientEvent::Delivery(env) => return env,
            _ => continue,
        }
    }
}

async fn expect_no_delivery(events: &mut mpsc::Receiver<ClientEvent>, window: Duration) {
    let deadline = Instant::now() + window;
    while Instant::now() < deadline {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, events.recv()).await {
            Ok(Some(ClientEvent::Delivery(env))) => {
                panic!("unexpected delivery: {:?}", env)
            }
            Ok(Some(_)) => continue,
            _ => return,
        }
    }
}

#[tokio::test]
async fn test_broadcast_fan_out() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(dir.path()).await;
    let sock = daemon.socket_path.clone();

    let (alice, mut alice_events) = connect(&sock, "Alice").await;
    let (_bob, mut bob_events) = connect(&sock, "Bob").await;
    let (_carol, mut carol_events) = connect(&sock, "Carol").await;

    alice.send("*", "hi").await.unwrap();

    for events in [&mut bob_events, &mut carol_events] {
        let env = next_delivery(events).await;
        assert_eq!(env.from.as_deref(), Some("Alice"));
        let delivery = env.delivery.expect("delivery block");
        assert_eq!(delivery.original_to.as_deref(), Some("*"));
        assert_eq!(delivery.seq, 1);
        match env.body {
            Body::Deliver(m) => assert_eq!(m.body, "hi"),
            other => panic!("unexpected body {:?}", other),
        }
    }
    expect_no_delivery(&mut alice_events, Duration::from_millis(200)).await;

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_channel_membership_gating() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(dir.path()).await;
    let sock = daemon.socket_path.clone();

    let (alice, _alice_events) = connect(&sock, "Alice").await;
    let (bob, mut bob_events) = connect(&sock, "Bob").await;
    let (carol, mut carol_events) = connect(&sock, "Carol").await;

    alice.join_channel("#general").await.unwrap();
    bob.join_channel("#general").await.unwrap();
    sleep(Duration::from_millis(100)).await;

    alice.send_channel("#general", "yo").await.unwrap();

    let env = next_delivery(&mut bob_events).await;
    assert_eq!(
        env.delivery.unwrap().original_to.as_deref(),
        Some("#general")
    );
    expect_no_delivery(&mut carol_events, Duration::from_millis(200)).await;

    // Carol is not a member.
    carol.send_channel("#general", "sneak").await.unwrap();
    loop {
        match timeout(Duration::from_secs(3), carol_events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            ClientEvent::ServerError(err) => {
                assert_eq!(err.code, ErrorCode::NotMember);
                break;
            }
            ClientEvent::Delivery(env) => panic!("unexpected delivery {:?}", env),
            _ => continue,
        }
    }

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_sync_request_response_and_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(dir.path()).await;
    let sock = daemon.socket_path.clone();

    let (alice, _alice_events) = connect(&sock, "Alice").await;
    let (bob, mut bob_events) = connect(&sock, "Bob").await;

    // Bob answers sync pings with their correlation id.
    let responder = tokio::spawn(async move {
        let env = next_delivery(&mut bob_events).await;
        let sync = env
            .payload_meta
            .and_then(|m| m.sync)
            .expect("sync meta on delivery");
        bob.ack_sync(sync.correlation_id, Some(serde_json::json!("OK")))
            .await
            .unwrap();
        bob
    });

    let reply = alice
        .send_and_wait("Bob", "ping", Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(reply.response, Some(serde_json::json!("OK")));
    let bob = responder.await.unwrap();

    // No ACK this time: the waiter rejects with a timeout cause.
    drop(bob);
    let err = alice
        .send_and_wait("Bob", "ping again", Duration::from_millis(300))
        .await
        .unwrap_err();
    match err {
        ClientError::Failed(FailureCause::Timeout) => {}
        other => panic!("unexpected error {:?}", other),
    }

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_backpressure_busy_and_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(dir.path()).await;
    let sock = daemon.socket_path.clone();

    let (alice, mut alice_events) = connect(&sock, "Alice").await;
    let (bob, mut bob_events) = connect_with(
        &sock,
        "Bob",
        Capabilities {
            ack: true,
            resume: true,
            max_inflight: 4,
            supports_topics: false,
        },
        false, // no auto-ack: the window fills up
    )
    .await;

    for i in 1..=5 {
        alice.send("Bob", format!("m{}", i)).await.unwrap();
    }

    // First four arrive; the fifth bounces as BUSY.
    for want_seq in 1..=4u64 {
        let env = next_delivery(&mut bob_events).await;
        assert_eq!(env.delivery.unwrap().seq, want_seq);
    }
    loop {
        match timeout(Duration::from_secs(3), alice_events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            ClientEvent::Busy(busy) => {
                assert_eq!(busy.to, "Bob");
                break;
            }
            _ => continue,
        }
    }

    // Cumulative ACK up to 2 reopens the window.
    bob.ack(2).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    alice.send("Bob", "m6").await.unwrap();
    let env = next_delivery(&mut bob_events).await;
    assert_eq!(env.delivery.unwrap().seq, 5);

    daemon.shutdown().await;
}

// ---- raw-stream helpers for the resume scenario -------------------------

struct RawConn {
    stream: UnixStream,
    decoder: FrameDecoder,
    pending: std::collections::VecDeque<Envelope>,
}

impl RawConn {
    async fn open(path: &PathBuf) -> Self {
        Self {
            stream: UnixStream::connect(path).await.unwrap(),
            decoder: FrameDecoder::with_framing(Framing::LengthPrefixed),
            pending: std::collections::VecDeque::new(),
        }
    }

    async fn write(&mut self, env: &Envelope) {
        let bytes = encode(env, Framing::LengthPrefixed).unwrap();
        self.stream.write_all(&bytes).await.unwrap();
    }

    async fn read_one(&mut self) -> Envelope {
        let deadline = Instant::now() + Duration::from_secs(3);
        let mut buf = [0u8; 8192];
        loop {
            if let Some(env) = self.pending.pop_front() {
                return env;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            let n = timeout(remaining, self.stream.read(&mut buf))
                .await
                .expect("read timed out")
                .unwrap();
            assert!(n > 0, "stream closed");
            for env in self.decoder.push(&buf[..n]).unwrap() {
                self.pending.push_back(env);
            }
        }
    }
}

#[tokio::test]
async fn test_resume_replays_unacked() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(dir.path()).await;
    let sock = daemon.socket_path.clone();

    let (alice, _alice_events) = connect(&sock, "Alice").await;

    // Bob speaks the raw protocol so the test controls ACKs and can drop
    // the transport without a BYE.
    let mut bob = RawConn::open(&sock).await;
    bob.write(&Envelope::new(Body::Hello(Hello {
        agent: "Bob".to_string(),
        entity: Default::default(),
        cli: None,
        task: None,
        working_directory: None,
        capabilities: Capabilities::default(),
        session: None,
    })))
    .await;
    let welcome = bob.read_one().await;
    let (session_id, token) = match welcome.body {
        Body::Welcome(w) => (w.session_id, w.resume_token),
        other => panic!("unexpected {:?}", other),
    };

    for i in 1..=3 {
        alice.send("Bob", format!("m{}", i)).await.unwrap();
    }
    let mut seen_ids = Vec::new();
    for want_seq in 1..=3u64 {
        let env = bob.read_one().await;
        assert_eq!(env.delivery.as_ref().unwrap().seq, want_seq);
        seen_ids.push(env.id);
    }
    // ACK only the first, then vanish without BYE.
    bob.write(&Envelope::new(Body::Ack(relay_proto::envelope::Ack {
        seq: Some(1),
        ..Default::default()
    })))
    .await;
    sleep(Duration::from_millis(100)).await;
    drop(bob);
    sleep(Duration::from_millis(100)).await;

    // Buffered while Bob is gone.
    alice.send("Bob", "m4").await.unwrap();
    sleep(Duration::from_millis(100)).await;

    let mut bob = RawConn::open(&sock).await;
    bob.write(&Envelope::new(Body::Hello(Hello {
        agent: "Bob".to_string(),
        entity: Default::default(),
        cli: None,
        task: None,
        working_directory: None,
        capabilities: Capabilities::default(),
        session: Some(SessionRef {
            resume_token: token,
            session_id: Some(session_id.clone()),
        }),
    })))
    .await;

    let welcome = bob.read_one().await;
    match welcome.body {
        Body::Welcome(w) => {
            assert!(w.resumed);
            assert_eq!(w.session_id, session_id);
        }
        other => panic!("unexpected {:?}", other),
    }
    // Replay carries only seq > last-acked, in order, before new traffic.
    let mut seqs = Vec::new();
    for _ in 0..3 {
        let env = bob.read_one().await;
        if let Some(d) = &env.delivery {
            seqs.push(d.seq);
        }
    }
    assert_eq!(seqs, vec![2, 3, 4]);

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_control_rpcs() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(dir.path()).await;
    let sock = daemon.socket_path.clone();

    let (alice, _alice_events) = connect(&sock, "Alice").await;
    let (_bob, _bob_events) = connect(&sock, "Bob").await;

    let resp = alice
        .request(Body::Health, Duration::from_secs(2))
        .await
        .unwrap();
    match resp.body {
        Body::HealthResponse(h) => assert!(h.ok),
        other => panic!("unexpected {:?}", other),
    }

    let resp = alice
        .request(Body::ListConnectedAgents, Duration::from_secs(2))
        .await
        .unwrap();
    match resp.body {
        Body::ListConnectedAgentsResponse(list) => {
            let mut names: Vec<String> = list.agents.iter().map(|a| a.name.clone()).collect();
            names.sort();
            assert_eq!(names, vec!["Alice", "Bob"]);
            assert!(list.agents.iter().all(|a| a.online));
        }
        other => panic!("unexpected {:?}", other),
    }

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_inbox_snapshot_does_not_consume() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(dir.path()).await;
    let sock = daemon.socket_path.clone();

    let (alice, _alice_events) = connect(&sock, "Alice").await;
    // Bob connects once so the registry knows him, then leaves cleanly.
    let (bob, _bob_events) = connect(&sock, "Bob").await;
    bob.close().await.unwrap();
    sleep(Duration::from_millis(150)).await;

    alice.send("Bob", "while you were out").await.unwrap();
    sleep(Duration::from_millis(100)).await;

    let resp = alice
        .request(
            Body::Inbox(relay_proto::envelope::InboxQuery {
                agent: Some("Bob".to_string()),
                limit: None,
            }),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    match resp.body {
        Body::InboxResponse(snap) => {
            assert_eq!(snap.agent, "Bob");
            assert_eq!(snap.total, 1);
            assert_eq!(snap.messages[0].body, "while you were out");
        }
        other => panic!("unexpected {:?}", other),
    }

    // The snapshot did not consume: Bob still gets it on reconnect.
    let (_bob, mut bob_events) = connect(&sock, "Bob").await;
    let env = next_delivery(&mut bob_events).await;
    match env.body {
        Body::Deliver(m) => assert_eq!(m.body, "while you were out"),
        other => panic!("unexpected {:?}", other),
    }

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_legacy_line_framing_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(dir.path()).await;
    let sock = daemon.socket_path.clone();

    let mut stream = UnixStream::connect(&sock).await.unwrap();
    let hello = Envelope::new(Body::Hello(Hello {
        agent: "Legacy".to_string(),
        entity: Default::default(),
        cli: None,
        task: None,
        working_directory: None,
        capabilities: Capabilities::default(),
        session: None,
    }));
    let bytes = encode(&hello, Framing::LegacyLine).unwrap();
    stream.write_all(&bytes).await.unwrap();

    let mut decoder = FrameDecoder::with_framing(Framing::LegacyLine);
    let mut buf = [0u8; 8192];
    let deadline = Instant::now() + Duration::from_secs(3);
    let welcome = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let n = timeout(remaining, stream.read(&mut buf))
            .await
            .expect("read timed out")
            .unwrap();
        assert!(n > 0);
        let mut envs = decoder.push(&buf[..n]).unwrap();
        if let Some(env) = envs.pop() {
            break env;
        }
    };
    assert!(matches!(welcome.body, Body::Welcome(_)));

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_message_to_agent_with_send_envelope_meta() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(dir.path()).await;
    let sock = daemon.socket_path.clone();

    let (alice, _alice_events) = connect(&sock, "Alice").await;
    let (_bob, mut bob_events) = connect(&sock, "Bob").await;

    let meta = relay_proto::envelope::PayloadMeta {
        importance: Some(95),
        thread: Some("hotfix".to_string()),
        ..Default::default()
    };
    alice.send_with_meta("Bob", "drop everything", meta).await.unwrap();

    let env = next_delivery(&mut bob_events).await;
    let meta = env.payload_meta.expect("meta preserved");
    assert_eq!(meta.importance, Some(95));
    assert_eq!(meta.thread.as_deref(), Some("hotfix"));
    match env.body {
        Body::Deliver(m) => assert_eq!(m.body, "drop everything"),
        other => panic!("unexpected {:?}", other),
    }

    daemon.shutdown().await;
}

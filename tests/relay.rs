//! End-to-end relay tests: a real client, the relay, and a scripted producer,
//! all over WebSockets on 127.0.0.1.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message as ServerMessage, WebSocketUpgrade};
use axum::routing::get;
use axum::Router;
use camrelay::session::{close_quietly, Session};
use camrelay::{Config, RelayServer};
use futures_util::{future, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, connect_async};

const TIMEOUT: Duration = Duration::from_secs(5);
const BYE: &str = r#"{"type":"bye"}"#;
const UNAVAILABLE: &str = r#"{"error":"Cámara no disponible"}"#;

type ClientWs = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// What the producer does on one accepted connection.
#[derive(Clone)]
enum Script {
    /// Reply `{"error": true}` and wait for the relay to hang up.
    NotReady,
    /// Send `greeting`, then echo every text as `echo:<text>`.
    Ready { greeting: Vec<String> },
    /// Send `greeting`, then close the connection.
    ReadyThenClose { greeting: Vec<String> },
}

/// Events the producer observed, in order.
#[derive(Debug, PartialEq, Eq)]
enum Seen {
    Text(String),
    Closed,
}

/// Counts one accepted producer connection as open until dropped.
struct OpenConnection(Arc<AtomicU32>);

impl Drop for OpenConnection {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MockProducer {
    addr: SocketAddr,
    attempts: Arc<AtomicU32>,
    open: Arc<AtomicU32>,
    peak_open: Arc<AtomicU32>,
    paths: Arc<Mutex<Vec<String>>>,
    seen: mpsc::UnboundedReceiver<Seen>,
}

impl MockProducer {
    async fn start<F>(script_for_attempt: F) -> Self
    where
        F: Fn(u32) -> Script + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let attempts = Arc::new(AtomicU32::new(0));
        let open = Arc::new(AtomicU32::new(0));
        let peak_open = Arc::new(AtomicU32::new(0));
        let paths = Arc::new(Mutex::new(Vec::new()));
        let (tx, seen) = mpsc::unbounded_channel();

        let counter = attempts.clone();
        let open_count = open.clone();
        let peak = peak_open.clone();
        let path_log = paths.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                let now_open = open_count.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now_open, Ordering::SeqCst);
                let conn = OpenConnection(open_count.clone());
                let script = script_for_attempt(attempt);
                tokio::spawn(serve_connection(
                    stream,
                    script,
                    path_log.clone(),
                    tx.clone(),
                    conn,
                ));
            }
        });

        Self {
            addr,
            attempts,
            open,
            peak_open,
            paths,
            seen,
        }
    }

    fn ws_base(&self) -> String {
        format!("ws://{}", self.addr)
    }

    fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn peak_open(&self) -> u32 {
        self.peak_open.load(Ordering::SeqCst)
    }

    /// Wait until every accepted connection has been torn down.
    async fn wait_all_closed(&self) {
        let drained = timeout(TIMEOUT, async {
            while self.open.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(
            drained.is_ok(),
            "producer connections still open: {}",
            self.open.load(Ordering::SeqCst)
        );
    }

    async fn next_seen(&mut self) -> Seen {
        timeout(TIMEOUT, self.seen.recv())
            .await
            .expect("producer event in time")
            .expect("producer channel open")
    }
}

async fn serve_connection(
    stream: TcpStream,
    script: Script,
    paths: Arc<Mutex<Vec<String>>>,
    seen: mpsc::UnboundedSender<Seen>,
    _conn: OpenConnection,
) {
    let handshake = accept_hdr_async(stream, |req: &Request, resp: Response| {
        paths.lock().unwrap().push(req.uri().path().to_string());
        Ok::<_, ErrorResponse>(resp)
    });
    let Ok(mut ws) = handshake.await else {
        return;
    };

    match script {
        Script::NotReady => {
            let _ = ws.send(Message::Text(r#"{"error": true}"#.into())).await;
            while let Some(Ok(_)) = ws.next().await {}
        }
        Script::ReadyThenClose { greeting } => {
            for text in greeting {
                let _ = ws.send(Message::Text(text)).await;
            }
            let _ = ws.close(None).await;
            while let Some(Ok(_)) = ws.next().await {}
        }
        Script::Ready { greeting } => {
            for text in greeting {
                let _ = ws.send(Message::Text(text)).await;
            }
            while let Some(msg) = ws.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let _ = seen.send(Seen::Text(text.clone()));
                        let _ = ws.send(Message::Text(format!("echo:{text}"))).await;
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            let _ = seen.send(Seen::Closed);
        }
    }
}

fn relay_config(producer_ws: &str, max_attempts: u32) -> Config {
    Config {
        listen_addr: "127.0.0.1:0".into(),
        producer_ws_url: Some(producer_ws.to_string()),
        producer_http_url: Some("http://127.0.0.1:1".into()),
        max_attempts,
        retry_delay_ms: 20,
        probe_timeout_ms: 300,
        dial_timeout_ms: 1000,
        ..Config::default()
    }
}

async fn connect_client(relay: &RelayServer, camera_id: &str) -> ClientWs {
    let url = format!("ws://{}/ws/{}", relay.bound_addr(), camera_id);
    let (ws, _) = timeout(TIMEOUT, connect_async(url))
        .await
        .expect("connect in time")
        .expect("client connects");
    ws
}

/// Next text frame, or `None` once the relay closed the connection.
async fn next_text(ws: &mut ClientWs) -> Option<String> {
    loop {
        let msg = timeout(TIMEOUT, ws.next()).await.expect("client frame in time");
        match msg {
            Some(Ok(Message::Text(text))) => return Some(text),
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
            Some(Ok(_)) => continue,
        }
    }
}

#[tokio::test]
async fn camera_ready_on_fourth_attempt_delivers_buffered_message_first() {
    let producer = MockProducer::start(|attempt| {
        if attempt <= 3 {
            Script::NotReady
        } else {
            Script::Ready {
                greeting: vec![r#"{"sdp": "..."}"#.to_string(), "ice-1".to_string()],
            }
        }
    })
    .await;
    let relay = RelayServer::start(&relay_config(&producer.ws_base(), 10), None)
        .await
        .unwrap();

    let mut client = connect_client(&relay, "42").await;
    assert_eq!(next_text(&mut client).await.as_deref(), Some(r#"{"sdp": "..."}"#));
    assert_eq!(next_text(&mut client).await.as_deref(), Some("ice-1"));
    assert_eq!(producer.attempts(), 4);
    assert!(producer
        .paths
        .lock()
        .unwrap()
        .iter()
        .all(|p| p == "/camera/ws/42"));

    relay.abort();
}

#[tokio::test]
async fn never_ready_sends_one_error_frame_after_all_attempts() {
    let producer = MockProducer::start(|_| Script::NotReady).await;
    let mut cfg = relay_config(&producer.ws_base(), 4);
    cfg.retry_delay_ms = 100;
    let relay = RelayServer::start(&cfg, None).await.unwrap();

    let mut client = connect_client(&relay, "7").await;
    assert_eq!(next_text(&mut client).await.as_deref(), Some(UNAVAILABLE));
    assert_eq!(next_text(&mut client).await, None);
    assert_eq!(producer.attempts(), 4);
    // Each not-ready socket is closed before the next dial, and none outlives the session.
    assert_eq!(producer.peak_open(), 1);
    producer.wait_all_closed().await;

    let stats = relay.stats().snapshot();
    assert_eq!(stats.sessions_unavailable, 1);
    assert!(stats.last_error.contains("camera 7"));

    relay.abort();
}

#[tokio::test]
async fn unreachable_producer_reports_unavailable() {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead_addr = probe.local_addr().unwrap();
    drop(probe);

    let relay = RelayServer::start(&relay_config(&format!("ws://{dead_addr}"), 3), None)
        .await
        .unwrap();

    let mut client = connect_client(&relay, "7").await;
    assert_eq!(next_text(&mut client).await.as_deref(), Some(UNAVAILABLE));
    assert_eq!(next_text(&mut client).await, None);

    relay.abort();
}

#[tokio::test]
async fn messages_keep_order_in_both_directions() {
    let mut producer = MockProducer::start(|_| Script::Ready {
        greeting: vec!["p0".to_string()],
    })
    .await;
    let relay = RelayServer::start(&relay_config(&producer.ws_base(), 3), None)
        .await
        .unwrap();

    let mut client = connect_client(&relay, "cam-a").await;
    assert_eq!(next_text(&mut client).await.as_deref(), Some("p0"));

    let sent: Vec<String> = (1..=5).map(|i| format!("c{i}")).collect();
    for text in &sent {
        client.send(Message::Text(text.clone())).await.unwrap();
    }
    for text in &sent {
        assert_eq!(producer.next_seen().await, Seen::Text(text.clone()));
    }
    for text in &sent {
        assert_eq!(
            next_text(&mut client).await,
            Some(format!("echo:{text}"))
        );
    }
    assert_eq!(relay.stats().snapshot().frames_to_producer, 5);

    relay.abort();
}

#[tokio::test]
async fn silent_producer_is_ready_without_buffered_message() {
    let mut producer = MockProducer::start(|_| Script::Ready { greeting: vec![] }).await;
    let relay = RelayServer::start(&relay_config(&producer.ws_base(), 3), None)
        .await
        .unwrap();

    let mut client = connect_client(&relay, "9").await;
    client.send(Message::Text("hello".into())).await.unwrap();
    assert_eq!(producer.next_seen().await, Seen::Text("hello".into()));
    assert_eq!(next_text(&mut client).await.as_deref(), Some("echo:hello"));
    assert_eq!(producer.attempts(), 1);

    relay.abort();
}

#[tokio::test]
async fn client_disconnect_sends_bye_and_closes_producer() {
    let mut producer = MockProducer::start(|_| Script::Ready {
        greeting: vec!["m1".to_string(), "m2".to_string()],
    })
    .await;
    let relay = RelayServer::start(&relay_config(&producer.ws_base(), 3), None)
        .await
        .unwrap();

    let mut client = connect_client(&relay, "42").await;
    assert_eq!(next_text(&mut client).await.as_deref(), Some("m1"));
    assert_eq!(next_text(&mut client).await.as_deref(), Some("m2"));

    client.send(Message::Text("offer-sdp".into())).await.unwrap();
    assert_eq!(producer.next_seen().await, Seen::Text("offer-sdp".into()));
    client.close(None).await.unwrap();

    // The relay answers the client's Close so the handshake completes cleanly.
    let reply = timeout(TIMEOUT, client.next())
        .await
        .expect("close reply in time");
    assert!(
        matches!(reply, Some(Ok(Message::Close(_)))),
        "expected a close reply, got {reply:?}"
    );

    assert_eq!(producer.next_seen().await, Seen::Text(BYE.into()));
    assert_eq!(producer.next_seen().await, Seen::Closed);

    relay.abort();
}

#[tokio::test]
async fn producer_close_ends_session_and_closes_client() {
    let producer = MockProducer::start(|_| Script::ReadyThenClose {
        greeting: vec!["answer".to_string(), "candidate".to_string()],
    })
    .await;
    let relay = RelayServer::start(&relay_config(&producer.ws_base(), 3), None)
        .await
        .unwrap();

    let mut client = connect_client(&relay, "5").await;
    assert_eq!(next_text(&mut client).await.as_deref(), Some("answer"));
    assert_eq!(next_text(&mut client).await.as_deref(), Some("candidate"));
    assert_eq!(next_text(&mut client).await, None);

    relay.abort();
}

#[tokio::test]
async fn closing_a_departed_client_twice_is_harmless() {
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<()>();
    let app = Router::new().route(
        "/ws",
        get(move |ws: WebSocketUpgrade| {
            let done_tx = done_tx.clone();
            async move {
                ws.on_upgrade(move |socket| async move {
                    let session = Session::new("twice");
                    let (tx, mut rx) = socket.split();
                    let mut tx = tx.with(|text: String| {
                        future::ready(Ok::<_, axum::Error>(ServerMessage::Text(text)))
                    });
                    while let Some(Ok(msg)) = rx.next().await {
                        if matches!(msg, ServerMessage::Close(_)) {
                            break;
                        }
                    }
                    close_quietly(&mut tx, "client", &session).await;
                    close_quietly(&mut tx, "client", &session).await;
                    let _ = done_tx.send(());
                })
            }
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move { axum::serve(listener, app).await });

    let (mut client, _) = timeout(TIMEOUT, connect_async(format!("ws://{addr}/ws")))
        .await
        .expect("connect in time")
        .expect("client connects");
    client.close(None).await.unwrap();

    let reply = timeout(TIMEOUT, client.next())
        .await
        .expect("close reply in time");
    assert!(
        matches!(reply, Some(Ok(Message::Close(_)))),
        "expected a close reply, got {reply:?}"
    );
    timeout(TIMEOUT, done_rx.recv())
        .await
        .expect("both closes return")
        .expect("handler finished");

    server.abort();
}

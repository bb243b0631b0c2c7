use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::{RelayError, RelayResult};
use crate::probe::{probe, ProbeResult};
use crate::session::{Session, SessionState};

pub type ProducerSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Knobs for establishing the producer link of one session.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Base such as `ws://producer:8001`; the camera path is appended.
    pub producer_ws_url: String,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub probe_timeout: Duration,
    pub dial_timeout: Duration,
}

impl RelayOptions {
    pub fn new(producer_ws_url: impl Into<String>) -> Self {
        Self {
            producer_ws_url: producer_ws_url.into(),
            max_attempts: 10,
            retry_delay: Duration::from_millis(500),
            probe_timeout: Duration::from_secs(2),
            dial_timeout: Duration::from_secs(5),
        }
    }

    pub fn camera_url(&self, camera_id: &str) -> String {
        format!(
            "{}/camera/ws/{}",
            self.producer_ws_url.trim_end_matches('/'),
            camera_id
        )
    }
}

/// One observation made while establishing the producer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptEvent {
    Dialed,
    DialFailed,
    NotReady,
    Ready,
}

/// Next establishment state after `event` on attempt number `attempt` (1-based).
///
/// Dial failures and not-ready probes draw from the same budget; when the
/// budget is spent the session goes straight to `Closed`.
pub fn step(
    state: SessionState,
    event: AttemptEvent,
    attempt: u32,
    max_attempts: u32,
) -> SessionState {
    let retry_or_give_up = if attempt < max_attempts {
        SessionState::Connecting
    } else {
        SessionState::Closed
    };
    match (state, event) {
        (SessionState::Connecting, AttemptEvent::Dialed) => SessionState::Probing,
        (SessionState::Connecting, AttemptEvent::DialFailed) => retry_or_give_up,
        (SessionState::Probing, AttemptEvent::NotReady) => retry_or_give_up,
        (SessionState::Probing, AttemptEvent::Ready) => SessionState::Active,
        (other, _) => other,
    }
}

/// A producer connection that passed the readiness probe.
pub struct ReadyProducer {
    pub socket: ProducerSocket,
    /// Message consumed by the probe; must reach the client first.
    pub first_message: Option<String>,
}

/// Dial and probe the producer for `session` until it is ready or the attempt
/// budget runs out. On success the session is `Active`; on failure `Closed`
/// and no producer socket is left open.
pub async fn establish(
    session: &mut Session,
    opts: &RelayOptions,
) -> RelayResult<ReadyProducer> {
    let url = opts.camera_url(session.camera_id());
    let max_attempts = opts.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let attempt_str = attempt.to_string();

        match dial(&url, opts.dial_timeout).await {
            Err(err) => {
                crate::logging::warn_kv(
                    "producer dial failed",
                    &[
                        ("camera", session.camera_id()),
                        ("attempt", &attempt_str),
                        ("error", &format!("{err:#}")),
                    ],
                );
                record(session, AttemptEvent::DialFailed, attempt, max_attempts);
            }
            Ok(mut socket) => {
                record(session, AttemptEvent::Dialed, attempt, max_attempts);
                match probe(&mut socket, opts.probe_timeout).await {
                    ProbeResult::Ready(first_message) => {
                        record(session, AttemptEvent::Ready, attempt, max_attempts);
                        crate::logging::info_kv(
                            "producer ready",
                            &[
                                ("camera", session.camera_id()),
                                ("attempt", &attempt_str),
                                ("buffered", if first_message.is_some() { "1" } else { "0" }),
                            ],
                        );
                        return Ok(ReadyProducer {
                            socket,
                            first_message,
                        });
                    }
                    ProbeResult::NotReady => {
                        // Close and drop before the next dial so only one socket is ever open.
                        if let Err(err) = socket.close(None).await {
                            crate::logging::warn_kv(
                                "close failed",
                                &[
                                    ("side", "producer"),
                                    ("camera", session.camera_id()),
                                    ("attempt", &attempt_str),
                                    ("error", &err.to_string()),
                                ],
                            );
                        }
                        drop(socket);
                        crate::logging::info_kv(
                            "camera not ready yet",
                            &[("camera", session.camera_id()), ("attempt", &attempt_str)],
                        );
                        record(session, AttemptEvent::NotReady, attempt, max_attempts);
                    }
                }
            }
        }

        if session.state() == SessionState::Closed {
            return Err(RelayError::ProducerUnavailable {
                camera_id: session.camera_id().to_string(),
                attempts: attempt,
            });
        }
        sleep(opts.retry_delay).await;
    }
}

fn record(session: &mut Session, event: AttemptEvent, attempt: u32, max_attempts: u32) {
    let next = step(session.state(), event, attempt, max_attempts);
    session.advance(next);
}

async fn dial(url: &str, limit: Duration) -> Result<ProducerSocket> {
    match timeout(limit, connect_async(url)).await {
        Ok(Ok((socket, _response))) => Ok(socket),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Err(anyhow!("dial timed out after {}ms", limit.as_millis())),
    }
}

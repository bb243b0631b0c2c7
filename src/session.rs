use std::fmt::Display;

use futures_util::{Sink, SinkExt, Stream};
use uuid::Uuid;

use crate::pump::{pump, Direction, PumpOutcome};
use crate::telemetry::RelayStats;

/// Sent to the client when the producer never became ready.
pub const UNAVAILABLE_MESSAGE: &str = "Cámara no disponible";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Probing,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Probing => "probing",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Connecting)
                | (Connecting, Probing)
                | (Connecting, Closed)
                | (Probing, Connecting)
                | (Probing, Active)
                | (Probing, Closed)
                | (Active, Closing)
                | (Closing, Closed)
        )
    }
}

/// One client connection relayed to the producer for one camera.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    camera_id: String,
    state: SessionState,
}

impl Session {
    pub fn new(camera_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            camera_id: camera_id.into(),
            state: SessionState::Connecting,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `next`. Invalid transitions are ignored and logged; `Closed` is terminal.
    pub fn advance(&mut self, next: SessionState) {
        if !self.state.can_transition_to(next) {
            crate::logging::error_kv(
                "invalid session transition",
                &[
                    ("session", &self.id.to_string()),
                    ("from", self.state.as_str()),
                    ("to", next.as_str()),
                ],
            );
            return;
        }
        self.state = next;
    }
}

pub fn bye_message() -> String {
    serde_json::json!({ "type": "bye" }).to_string()
}

pub fn unavailable_message() -> String {
    serde_json::json!({ "error": UNAVAILABLE_MESSAGE }).to_string()
}

/// Run both pumps of an `Active` session, end it when the first one finishes,
/// and tear both sides down. Never fails; returns the pump that finished first.
///
/// The pumps are multiplexed on the calling task. When one completes, the other
/// future is dropped, which cancels it even while it waits on a read and hands
/// its socket halves back for teardown.
pub async fn coordinate<CR, CRE, CW, PR, PRE, PW>(
    session: &mut Session,
    mut client_rx: CR,
    mut client_tx: CW,
    mut producer_rx: PR,
    mut producer_tx: PW,
    stats: &RelayStats,
) -> PumpOutcome
where
    CR: Stream<Item = Result<String, CRE>> + Unpin,
    CRE: Display,
    CW: Sink<String> + Unpin,
    CW::Error: Display,
    PR: Stream<Item = Result<String, PRE>> + Unpin,
    PRE: Display,
    PW: Sink<String> + Unpin,
    PW::Error: Display,
{
    let first = {
        let upstream = pump(
            Direction::ClientToProducer,
            &mut client_rx,
            &mut producer_tx,
            stats,
        );
        let downstream = pump(
            Direction::ProducerToClient,
            &mut producer_rx,
            &mut client_tx,
            stats,
        );
        tokio::select! {
            outcome = upstream => outcome,
            outcome = downstream => outcome,
        }
    };

    let session_id = session.id().to_string();
    let frames = first.frames.to_string();
    let end = format!("{:?}", first.end);
    crate::logging::info_kv(
        "pump finished",
        &[
            ("session", &session_id),
            ("camera", session.camera_id()),
            ("direction", first.direction.as_str()),
            ("frames", &frames),
            ("end", &end),
        ],
    );

    session.advance(SessionState::Closing);
    teardown(session, &first, &mut client_tx, &mut producer_tx).await;
    session.advance(SessionState::Closed);

    crate::logging::info_kv(
        "session closed",
        &[("session", &session_id), ("camera", session.camera_id())],
    );
    first
}

async fn teardown<CW, PW>(session: &Session, first: &PumpOutcome, client_tx: &mut CW, producer_tx: &mut PW)
where
    CW: Sink<String> + Unpin,
    CW::Error: Display,
    PW: Sink<String> + Unpin,
    PW::Error: Display,
{
    if !first.producer_gone() {
        if let Err(err) = producer_tx.send(bye_message()).await {
            crate::logging::warn_kv(
                "bye not delivered",
                &[("camera", session.camera_id()), ("error", &err.to_string())],
            );
        }
    }
    // Also when the client left first: closing flushes the reply to its Close frame.
    close_quietly(client_tx, "client", session).await;
    close_quietly(producer_tx, "producer", session).await;
}

/// Close `sink`, logging instead of failing. Closing twice is harmless.
pub async fn close_quietly<K>(sink: &mut K, side: &str, session: &Session)
where
    K: Sink<String> + Unpin,
    K::Error: Display,
{
    if let Err(err) = sink.close().await {
        crate::logging::info_kv(
            "close failed",
            &[
                ("side", side),
                ("camera", session.camera_id()),
                ("error", &err.to_string()),
            ],
        );
    }
}

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::pump::Direction;

/// Process-wide relay counters, reported by `/v1/status`.
#[derive(Default)]
pub struct RelayStats {
    sessions_started: AtomicU64,
    sessions_active: AtomicI64,
    sessions_unavailable: AtomicU64,
    frames_to_producer: AtomicU64,
    frames_to_client: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl RelayStats {
    pub fn on_session_start(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_session_end(&self) {
        self.sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn on_unavailable(&self) {
        self.sessions_unavailable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_forward(&self, direction: Direction) {
        let counter = match direction {
            Direction::ClientToProducer => &self.frames_to_producer,
            Direction::ProducerToClient => &self.frames_to_client,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_last_error(&self, err: impl ToString) {
        if let Ok(mut g) = self.last_error.lock() {
            *g = Some(err.to_string());
        }
    }

    pub fn snapshot(&self) -> RelayStatsSnapshot {
        let last_error = self
            .last_error
            .lock()
            .ok()
            .and_then(|g| g.clone())
            .unwrap_or_default();
        RelayStatsSnapshot {
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_active: self.sessions_active.load(Ordering::Relaxed),
            sessions_unavailable: self.sessions_unavailable.load(Ordering::Relaxed),
            frames_to_producer: self.frames_to_producer.load(Ordering::Relaxed),
            frames_to_client: self.frames_to_client.load(Ordering::Relaxed),
            last_error,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RelayStatsSnapshot {
    pub sessions_started: u64,
    pub sessions_active: i64,
    pub sessions_unavailable: u64,
    pub frames_to_producer: u64,
    pub frames_to_client: u64,
    pub last_error: String,
}

use std::fmt::Display;

use futures_util::{Sink, SinkExt, Stream, StreamExt};

use crate::telemetry::RelayStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToProducer,
    ProducerToClient,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::ClientToProducer => "client->producer",
            Direction::ProducerToClient => "producer->client",
        }
    }
}

/// Why a pump stopped. None of these is an error for the session: each one
/// just means the signaling exchange is over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpEnd {
    SourceClosed,
    ReadFailed(String),
    WriteFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PumpOutcome {
    pub direction: Direction,
    pub frames: u64,
    pub end: PumpEnd,
}

impl PumpOutcome {
    /// The producer closed its end, so a `bye` cannot be delivered.
    pub fn producer_gone(&self) -> bool {
        self.direction == Direction::ProducerToClient && self.end == PumpEnd::SourceClosed
    }
}

/// Forward every text item of `source` into `sink`, unmodified and in order,
/// until the source ends or either side fails.
///
/// Dropping the returned future mid-read is the cancellation path; the pump
/// holds nothing that needs cleanup beyond its borrows.
pub async fn pump<S, E, K>(
    direction: Direction,
    source: &mut S,
    sink: &mut K,
    stats: &RelayStats,
) -> PumpOutcome
where
    S: Stream<Item = Result<String, E>> + Unpin,
    E: Display,
    K: Sink<String> + Unpin,
    K::Error: Display,
{
    let mut frames = 0u64;
    let end = loop {
        match source.next().await {
            None => break PumpEnd::SourceClosed,
            Some(Err(err)) => break PumpEnd::ReadFailed(err.to_string()),
            Some(Ok(text)) => {
                if let Err(err) = sink.send(text).await {
                    break PumpEnd::WriteFailed(err.to_string());
                }
                frames += 1;
                stats.on_forward(direction);
            }
        }
    };
    PumpOutcome {
        direction,
        frames,
        end,
    }
}

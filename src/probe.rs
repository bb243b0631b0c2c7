use std::fmt::Display;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tokio::time::timeout;

use crate::peek::{Frame, SignalFrame};

/// Readiness of a freshly dialed producer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    /// The producer reported an error; discard the connection and retry.
    NotReady,
    /// Usable. Carries the first message if the probe had to consume one.
    Ready(Option<String>),
}

/// Peek the first text message from `stream`, waiting at most `wait`.
///
/// Silence until the deadline counts as ready with nothing buffered. A close or
/// read error before any text counts as not ready.
pub async fn probe<S, M, E>(stream: &mut S, wait: Duration) -> ProbeResult
where
    S: Stream<Item = Result<M, E>> + Unpin,
    M: SignalFrame,
    E: Display,
{
    match timeout(wait, first_text(stream)).await {
        Err(_) => ProbeResult::Ready(None),
        Ok(Err(reason)) => {
            crate::logging::info_kv("producer closed during probe", &[("reason", &reason)]);
            ProbeResult::NotReady
        }
        Ok(Ok(text)) if signals_error(&text) => ProbeResult::NotReady,
        Ok(Ok(text)) => ProbeResult::Ready(Some(text)),
    }
}

async fn first_text<S, M, E>(stream: &mut S) -> Result<String, String>
where
    S: Stream<Item = Result<M, E>> + Unpin,
    M: SignalFrame,
    E: Display,
{
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(msg) => match msg.into_frame() {
                Frame::Text(text) => return Ok(text),
                Frame::Skip => continue,
                Frame::Close => return Err("close frame".to_string()),
            },
            Err(err) => return Err(err.to_string()),
        }
    }
    Err("end of stream".to_string())
}

/// True when `raw` is a JSON object whose `error` field is truthy.
///
/// Anything that does not parse as an object is treated as a normal payload.
pub fn signals_error(raw: &str) -> bool {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map.get("error").map(is_truthy).unwrap_or(false),
        _ => false,
    }
}

fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

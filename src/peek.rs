//! Text-frame streams over either side's WebSocket.
//!
//! [`PeekableStream`] turns a raw WebSocket message stream into a stream of
//! signaling text. It can be seeded with one message that was already read off
//! the socket (the readiness probe does this), which is then yielded first and
//! exactly once, ahead of anything read live.

use std::pin::Pin;
use std::task::{ready, Context, Poll};

use axum::extract::ws::Message as ClientMessage;
use futures_util::{Stream, StreamExt};
use tokio_tungstenite::tungstenite::Message as ProducerMessage;

/// What a single WebSocket message means to the relay.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    /// Control traffic or binary that is not UTF-8.
    Skip,
    Close,
}

/// Maps a transport-specific message onto a [`Frame`].
pub trait SignalFrame {
    fn into_frame(self) -> Frame;
}

impl SignalFrame for ProducerMessage {
    fn into_frame(self) -> Frame {
        match self {
            ProducerMessage::Text(text) => Frame::Text(text),
            ProducerMessage::Binary(bin) => utf8_frame(bin),
            ProducerMessage::Close(_) => Frame::Close,
            _ => Frame::Skip,
        }
    }
}

impl SignalFrame for ClientMessage {
    fn into_frame(self) -> Frame {
        match self {
            ClientMessage::Text(text) => Frame::Text(text),
            ClientMessage::Binary(bin) => utf8_frame(bin),
            ClientMessage::Close(_) => Frame::Close,
            _ => Frame::Skip,
        }
    }
}

fn utf8_frame(bin: Vec<u8>) -> Frame {
    match String::from_utf8(bin) {
        Ok(text) => Frame::Text(text),
        Err(_) => Frame::Skip,
    }
}

/// Buffered-then-live stream of text messages.
///
/// Finite and not restartable: once the socket closes, errors or ends, every
/// later poll returns `None`.
pub struct PeekableStream<S> {
    buffered: Option<String>,
    inner: S,
    done: bool,
}

impl<S> PeekableStream<S> {
    pub fn new(inner: S, buffered: Option<String>) -> Self {
        Self {
            buffered,
            inner,
            done: false,
        }
    }

    pub fn live(inner: S) -> Self {
        Self::new(inner, None)
    }
}

impl<S, M, E> Stream for PeekableStream<S>
where
    S: Stream<Item = Result<M, E>> + Unpin,
    M: SignalFrame,
{
    type Item = Result<String, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(first) = this.buffered.take() {
            return Poll::Ready(Some(Ok(first)));
        }
        if this.done {
            return Poll::Ready(None);
        }
        loop {
            match ready!(this.inner.poll_next_unpin(cx)) {
                None => {
                    this.done = true;
                    return Poll::Ready(None);
                }
                Some(Err(err)) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(err)));
                }
                Some(Ok(msg)) => match msg.into_frame() {
                    Frame::Text(text) => return Poll::Ready(Some(Ok(text))),
                    Frame::Skip => continue,
                    Frame::Close => {
                        this.done = true;
                        return Poll::Ready(None);
                    }
                },
            }
        }
    }
}

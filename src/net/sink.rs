//! Per-connection outbound frame queue.
//!
//! Every accepted connection gets a writer task fed by an unbounded
//! channel, the same split the teacher's `tcp_server` uses: a reader task
//! drives the protocol and only ever enqueues frames, a writer task owns
//! the socket's write half and drains the queue. This keeps a slow peer's
//! write-side backpressure from ever blocking a handler that's mutating
//! shared state.

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// A cheaply cloneable handle used to enqueue frames to one connection.
#[derive(Clone)]
pub struct ConnSink {
    tx: UnboundedSender<BytesMut>,
}

impl ConnSink {
    pub fn new() -> (Self, UnboundedReceiver<BytesMut>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Enqueues a frame. Silently dropped if the connection has already
    /// gone away — matching §7's "nothing is retried at the transport
    /// layer" stance.
    pub fn send(&self, frame: BytesMut) {
        let _ = self.tx.send(frame);
    }
}

/// Drains `rx` into `writer` until the channel closes or a write fails.
pub async fn run_writer(mut writer: OwnedWriteHalf, mut rx: UnboundedReceiver<BytesMut>) {
    while let Some(frame) = rx.recv().await {
        if writer.write_all(&frame).await.is_err() {
            break;
        }
    }
}

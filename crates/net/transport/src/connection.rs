//! Frame-oriented duplex connections.
//!
//! A [`FramedConnection`] is the narrowest thing the rest of the stack needs from a
//! transport: whole frames in, whole frames out. Stream transports box a
//! length-delimited codec into it; the in-memory [`FramedConnection::pair`] uses
//! unbounded channels.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::channel::mpsc;
use futures::{Sink, SinkExt, Stream, StreamExt};

pub type FrameSink = Pin<Box<dyn Sink<Bytes, Error = io::Error> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Duplex of whole frames. Dropping either half closes that direction.
pub struct FramedConnection {
    sink: FrameSink,
    stream: FrameStream,
}

impl FramedConnection {
    pub fn new(
        sink: impl Sink<Bytes, Error = io::Error> + Send + 'static,
        stream: impl Stream<Item = io::Result<Bytes>> + Send + 'static,
    ) -> Self {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }

    /// Two connected in-memory endpoints.
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded::<Bytes>();
        let (b_tx, a_rx) = mpsc::unbounded::<Bytes>();
        (Self::from_channels(a_tx, a_rx), Self::from_channels(b_tx, b_rx))
    }

    fn from_channels(tx: mpsc::UnboundedSender<Bytes>, rx: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self::new(ChannelSink(tx), rx.map(Ok))
    }

    pub async fn send(&mut self, frame: Bytes) -> io::Result<()> {
        self.sink.send(frame).await
    }

    /// Next frame, or `None` once the remote closed its sending half.
    pub async fn recv(&mut self) -> Option<io::Result<Bytes>> {
        self.stream.next().await
    }

    pub async fn close(&mut self) -> io::Result<()> {
        self.sink.close().await
    }

    pub fn split(self) -> (FrameSink, FrameStream) {
        (self.sink, self.stream)
    }
}

/// Sending half of an in-memory pair. Keeps reporting `BrokenPipe` for as long as it
/// is polled after the remote went away.
struct ChannelSink(mpsc::UnboundedSender<Bytes>);

fn broken_pipe(err: mpsc::SendError) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, err)
}

impl Sink<Bytes> for ChannelSink {
    type Error = io::Error;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_ready(cx).map_err(broken_pipe)
    }

    fn start_send(self: Pin<&mut Self>, frame: Bytes) -> io::Result<()> {
        Pin::new(&mut self.get_mut().0)
            .start_send(frame)
            .map_err(broken_pipe)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_flush(cx).map_err(broken_pipe)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_close(cx).map_err(broken_pipe)
    }
}

impl fmt::Debug for FramedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramedConnection").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_in_order() {
        let (mut a, mut b) = FramedConnection::pair();
        a.send(Bytes::from_static(b"one")).await.unwrap();
        a.send(Bytes::from_static(b"two")).await.unwrap();

        assert_eq!(b.recv().await.unwrap().unwrap(), Bytes::from_static(b"one"));
        assert_eq!(b.recv().await.unwrap().unwrap(), Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn test_drop_closes_remote_stream() {
        let (a, mut b) = FramedConnection::pair();
        drop(a);
        assert!(b.recv().await.is_none());
        assert!(b.send(Bytes::from_static(b"lost")).await.is_err());
    }

    #[tokio::test]
    async fn test_send_keeps_failing_after_remote_drop() {
        let (mut a, b) = FramedConnection::pair();
        drop(b);
        for _ in 0..3 {
            let err = a.send(Bytes::from_static(b"gone")).await.unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        }
        assert!(a.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_close_ends_remote_stream() {
        let (mut a, mut b) = FramedConnection::pair();
        a.close().await.unwrap();
        assert!(b.recv().await.is_none());
    }
}

//! Virtual streams and the shared tunnel writer.
//!
//! A [`VirtualStream`] is one forwarded full-duplex connection inside the
//! tunnel. Inbound bytes arrive from the multiplexer through a queue of at
//! most [`STREAM_QUEUE_DEPTH`] chunks. The demultiplexer never waits on a slow
//! consumer: a stream whose queue overflows is closed. Outbound bytes are
//! written as `stream_data` frames through the [`TunnelWriter`], which
//! serializes every write to the physical connection.
//!
//! A stream is registered in its tunnel's stream map for as long as its
//! reader is alive. Once it has ended, its id may be reused by a new stream;
//! the old halves never touch the new registration. Closing the stream, dropping it, a remote `stream_close`
//! or the death of the tunnel all end it: readers see `None` and writers get
//! [`RelayError::ConnectionClosed`].

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use futures::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::debug;

use super::frame::Frame;
use super::RelayError;

/// Inbound chunks buffered per stream before it is closed for overflow.
pub const STREAM_QUEUE_DEPTH: usize = 256;

type FrameSink = Pin<Box<dyn Sink<Message, Error = tungstenite::Error> + Send>>;

/// Serialized writer for one physical tunnel connection.
#[derive(Clone)]
pub struct TunnelWriter {
    sink: Arc<tokio::sync::Mutex<FrameSink>>,
    closed: Arc<AtomicBool>,
}

impl TunnelWriter {
    pub fn new<S>(sink: S) -> Self
    where
        S: Sink<Message, Error = tungstenite::Error> + Send + 'static,
    {
        Self {
            sink: Arc::new(tokio::sync::Mutex::new(Box::pin(sink))),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Encode and write one frame. Fails once the tunnel is shut.
    pub async fn send_frame(&self, frame: &Frame) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(RelayError::ConnectionClosed);
        }
        let text = frame.encode()?;
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text.into())).await?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Refuse further writes and send a close frame, best effort.
    pub async fn shut(&self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.sink.lock().await.close().await;
    }
}

/// Outcome of handing inbound bytes to a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Queued,
    /// The reader is gone.
    Gone,
    /// The reader fell [`STREAM_QUEUE_DEPTH`] chunks behind.
    Overflow,
}

/// Registry slot of one live stream.
pub(crate) struct StreamSlot {
    tx: mpsc::Sender<Bytes>,
    closed: Arc<AtomicBool>,
}

impl StreamSlot {
    pub(crate) fn deliver(&self, data: Bytes) -> Delivery {
        match self.tx.try_send(data) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Overflow,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Gone,
        }
    }

    /// Remote side closed: stop accepting writes without echoing a close.
    pub(crate) fn close_remote(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Live streams of one tunnel connection, keyed by stream id.
pub(crate) type StreamMap = Arc<Mutex<HashMap<String, StreamSlot>>>;

pub(crate) fn lock_streams(
    streams: &Mutex<HashMap<String, StreamSlot>>,
) -> std::sync::MutexGuard<'_, HashMap<String, StreamSlot>> {
    streams.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Remove `id` from the map only while the slot still belongs to the stream
/// whose close flag is `closed`.
fn deregister(
    streams: &Weak<Mutex<HashMap<String, StreamSlot>>>,
    id: &str,
    closed: &Arc<AtomicBool>,
) {
    let Some(streams) = streams.upgrade() else {
        return;
    };
    let mut map = lock_streams(&streams);
    if map.get(id).is_some_and(|slot| Arc::ptr_eq(&slot.closed, closed)) {
        map.remove(id);
    }
}

/// Removes the stream from its tunnel's map when dropped.
struct Registration {
    id: Arc<str>,
    closed: Arc<AtomicBool>,
    streams: Weak<Mutex<HashMap<String, StreamSlot>>>,
}

impl Registration {
    fn deregister(&self) {
        deregister(&self.streams, &self.id, &self.closed);
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.deregister();
    }
}

/// Read half of a virtual stream.
pub struct StreamReader {
    incoming: mpsc::Receiver<Bytes>,
    _registration: Registration,
}

impl StreamReader {
    /// Next inbound chunk; `None` once the stream or tunnel has ended.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.incoming.recv().await
    }
}

/// Write half of a virtual stream. Clones share the same close state.
#[derive(Clone)]
pub struct StreamWriter {
    id: Arc<str>,
    tunnel: TunnelWriter,
    closed: Arc<AtomicBool>,
    streams: Weak<Mutex<HashMap<String, StreamSlot>>>,
}

impl StreamWriter {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn send(&self, data: Bytes) -> Result<(), RelayError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RelayError::ConnectionClosed);
        }
        self.tunnel
            .send_frame(&Frame::StreamData {
                stream_id: self.id.to_string(),
                data: STANDARD.encode(&data),
            })
            .await
    }

    /// Send `stream_close` once and deregister. Later calls do nothing.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        deregister(&self.streams, &self.id, &self.closed);
        let frame = Frame::StreamClose {
            stream_id: self.id.to_string(),
        };
        if let Err(e) = self.tunnel.send_frame(&frame).await {
            debug!(stream_id = %self.id, "stream_close not sent: {e}");
        }
    }
}

/// One forwarded connection carried inside the tunnel.
pub struct VirtualStream {
    reader: StreamReader,
    writer: StreamWriter,
}

impl VirtualStream {
    /// Register a new stream under `id`. `None` if the id is already live.
    pub(crate) fn open(id: &str, streams: &StreamMap, tunnel: TunnelWriter) -> Option<Self> {
        let mut map = lock_streams(streams);
        if map.contains_key(id) {
            return None;
        }
        let (tx, incoming) = mpsc::channel(STREAM_QUEUE_DEPTH);
        let closed = Arc::new(AtomicBool::new(false));
        map.insert(
            id.to_string(),
            StreamSlot {
                tx,
                closed: Arc::clone(&closed),
            },
        );
        drop(map);

        let id: Arc<str> = Arc::from(id);
        Some(Self {
            reader: StreamReader {
                incoming,
                _registration: Registration {
                    id: Arc::clone(&id),
                    closed: Arc::clone(&closed),
                    streams: Arc::downgrade(streams),
                },
            },
            writer: StreamWriter {
                id,
                tunnel,
                closed,
                streams: Arc::downgrade(streams),
            },
        })
    }

    pub fn id(&self) -> &str {
        self.writer.id()
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        self.reader.recv().await
    }

    pub async fn send(&self, data: Bytes) -> Result<(), RelayError> {
        self.writer.send(data).await
    }

    pub async fn close(&self) {
        self.writer.close().await;
    }

    /// Separate halves so one task can read while others write.
    pub fn split(self) -> (StreamReader, StreamWriter) {
        (self.reader, self.writer)
    }
}

impl std::fmt::Debug for VirtualStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualStream").field("id", &self.id()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;
    use futures::StreamExt;

    fn writer() -> (TunnelWriter, fmpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = fmpsc::unbounded::<Message>();
        let sink = tx.sink_map_err(|_| tungstenite::Error::ConnectionClosed);
        (TunnelWriter::new(sink), rx)
    }

    async fn next_frame(rx: &mut fmpsc::UnboundedReceiver<Message>) -> Frame {
        match rx.next().await.unwrap() {
            Message::Text(t) => Frame::decode(&t).unwrap(),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_inbound_data_reaches_reader() {
        let (tunnel, _rx) = writer();
        let streams = StreamMap::default();
        let mut stream = VirtualStream::open("s1", &streams, tunnel).unwrap();

        assert_eq!(
            lock_streams(&streams)["s1"].deliver(Bytes::from_static(b"hello")),
            Delivery::Queued
        );
        assert_eq!(stream.recv().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_send_writes_base64_stream_data() {
        let (tunnel, mut rx) = writer();
        let streams = StreamMap::default();
        let stream = VirtualStream::open("s1", &streams, tunnel).unwrap();
        stream.send(Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(
            next_frame(&mut rx).await,
            Frame::StreamData {
                stream_id: "s1".into(),
                data: "aGk=".into()
            }
        );
    }

    #[tokio::test]
    async fn test_close_sends_one_stream_close() {
        let (tunnel, mut rx) = writer();
        let streams = StreamMap::default();
        let stream = VirtualStream::open("s1", &streams, tunnel.clone()).unwrap();

        stream.close().await;
        stream.close().await;
        assert!(lock_streams(&streams).is_empty());
        assert!(matches!(
            stream.send(Bytes::from_static(b"x")).await,
            Err(RelayError::ConnectionClosed)
        ));

        tunnel.shut().await;
        assert_eq!(
            next_frame(&mut rx).await,
            Frame::StreamClose {
                stream_id: "s1".into()
            }
        );
        // Only the close frame from `shut` follows.
        assert!(matches!(rx.next().await, Some(Message::Close(_)) | None));
    }

    #[tokio::test]
    async fn test_duplicate_open_rejected_and_drop_deregisters() {
        let (tunnel, _rx) = writer();
        let streams = StreamMap::default();
        let stream = VirtualStream::open("s1", &streams, tunnel.clone()).unwrap();
        assert!(VirtualStream::open("s1", &streams, tunnel.clone()).is_none());

        drop(stream);
        assert!(lock_streams(&streams).is_empty());
        assert!(VirtualStream::open("s1", &streams, tunnel).is_some());
    }

    #[tokio::test]
    async fn test_split_halves_work_independently() {
        let (tunnel, mut rx) = writer();
        let streams = StreamMap::default();
        let (mut reader, writer) = VirtualStream::open("s1", &streams, tunnel)
            .unwrap()
            .split();

        let clone = writer.clone();
        clone.send(Bytes::from_static(b"a")).await.unwrap();
        assert!(matches!(next_frame(&mut rx).await, Frame::StreamData { .. }));

        lock_streams(&streams)["s1"].deliver(Bytes::from_static(b"b"));
        assert_eq!(reader.recv().await.unwrap(), Bytes::from_static(b"b"));

        lock_streams(&streams).clear();
        assert!(reader.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_remote_close_blocks_writes() {
        let (tunnel, _rx) = writer();
        let streams = StreamMap::default();
        let mut stream = VirtualStream::open("s1", &streams, tunnel).unwrap();
        let slot = lock_streams(&streams).remove("s1").unwrap();
        slot.close_remote();
        drop(slot);
        assert!(stream.recv().await.is_none());
        assert!(stream.send(Bytes::from_static(b"x")).await.is_err());
    }

    #[tokio::test]
    async fn test_reused_id_survives_stale_halves() {
        let (tunnel, _rx) = writer();
        let streams = StreamMap::default();
        let old = VirtualStream::open("1", &streams, tunnel.clone()).unwrap();
        let old_writer = old.writer.clone();

        // Relay closes "1" and immediately reopens it.
        let slot = lock_streams(&streams).remove("1").unwrap();
        slot.close_remote();
        drop(slot);
        let mut new = VirtualStream::open("1", &streams, tunnel).unwrap();

        drop(old);
        old_writer.close().await;
        assert!(lock_streams(&streams).contains_key("1"));
        assert_eq!(
            lock_streams(&streams)["1"].deliver(Bytes::from_static(b"fresh")),
            Delivery::Queued
        );
        assert_eq!(new.recv().await.unwrap(), Bytes::from_static(b"fresh"));

        drop(new);
        assert!(lock_streams(&streams).is_empty());
    }

    #[tokio::test]
    async fn test_slow_reader_overflows() {
        let (tunnel, _rx) = writer();
        let streams = StreamMap::default();
        let mut stream = VirtualStream::open("s1", &streams, tunnel).unwrap();
        {
            let map = lock_streams(&streams);
            for _ in 0..STREAM_QUEUE_DEPTH {
                assert_eq!(map["s1"].deliver(Bytes::from_static(b"x")), Delivery::Queued);
            }
            assert_eq!(map["s1"].deliver(Bytes::from_static(b"x")), Delivery::Overflow);
        }
        assert_eq!(stream.recv().await.unwrap(), Bytes::from_static(b"x"));

        drop(stream.reader);
        assert!(lock_streams(&streams).is_empty());
    }

    #[tokio::test]
    async fn test_dropped_reader_reports_gone() {
        let (tunnel, _rx) = writer();
        let streams = StreamMap::default();
        let (reader, _writer) = VirtualStream::open("s1", &streams, tunnel).unwrap().split();
        let slot = lock_streams(&streams).remove("s1").unwrap();
        drop(reader);
        assert_eq!(slot.deliver(Bytes::from_static(b"x")), Delivery::Gone);
    }

    #[tokio::test]
    async fn test_shut_tunnel_rejects_writes() {
        let (tunnel, _rx) = writer();
        let streams = StreamMap::default();
        let stream = VirtualStream::open("s1", &streams, tunnel.clone()).unwrap();
        tunnel.shut().await;
        assert!(matches!(
            stream.send(Bytes::from_static(b"x")).await,
            Err(RelayError::ConnectionClosed)
        ));
    }
}

//! Demultiplexer for one tunnel connection.
//!
//! [`Multiplexer::run`] reads frames until the connection fails, closes, or
//! is cancelled, and returns why. It never reconnects; that is the relay
//! manager's job. When it returns, every stream it opened has ended and
//! every in-flight HTTP exchange has been aborted.

use std::future::Future;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::frame::{Frame, HttpRequest, HttpResponse};
use super::stream::{lock_streams, Delivery, StreamMap, TunnelWriter, VirtualStream};
use super::RelayError;

/// HTTP exchanges served concurrently per tunnel.
pub const MAX_CONCURRENT_EXCHANGES: usize = 32;

/// Serves relayed HTTP requests. Must always produce a response.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, request: HttpRequest) -> impl Future<Output = HttpResponse> + Send;
}

pub struct Multiplexer<S, H> {
    ws: WebSocketStream<S>,
    handler: Arc<H>,
    new_streams: mpsc::Sender<VirtualStream>,
}

struct Demux<H> {
    writer: TunnelWriter,
    streams: StreamMap,
    handler: Arc<H>,
    new_streams: mpsc::Sender<VirtualStream>,
    limiter: Arc<Semaphore>,
    exchanges: JoinSet<()>,
}

impl<S, H> Multiplexer<S, H>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    H: RequestHandler,
{
    pub fn new(
        ws: WebSocketStream<S>,
        handler: Arc<H>,
        new_streams: mpsc::Sender<VirtualStream>,
    ) -> Self {
        Self {
            ws,
            handler,
            new_streams,
        }
    }

    /// Demultiplex until the connection ends; returns the reason.
    pub async fn run(self, cancel: CancellationToken) -> RelayError {
        let (sink, mut source) = self.ws.split();
        let mut demux = Demux {
            writer: TunnelWriter::new(sink),
            streams: StreamMap::default(),
            handler: self.handler,
            new_streams: self.new_streams,
            limiter: Arc::new(Semaphore::new(MAX_CONCURRENT_EXCHANGES)),
            exchanges: JoinSet::new(),
        };

        let reason = loop {
            let next = tokio::select! {
                () = cancel.cancelled() => break RelayError::Cancelled,
                Some(done) = demux.exchanges.join_next(), if !demux.exchanges.is_empty() => {
                    if let Err(e) = done {
                        if e.is_panic() {
                            warn!("http exchange task panicked");
                        }
                    }
                    continue;
                }
                next = source.next() => next,
            };

            let text = match next {
                None | Some(Ok(Message::Close(_))) => break RelayError::ConnectionClosed,
                Some(Err(e)) => break e.into(),
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Binary(data))) => {
                    warn!(len = data.len(), "ignoring binary tunnel message");
                    continue;
                }
                Some(Ok(_)) => continue,
            };

            let frame = match Frame::decode(&text) {
                Ok(frame) => frame,
                Err(e) => break e,
            };
            if let Err(e) = demux.dispatch(frame, &cancel).await {
                break e;
            }
        };

        demux.teardown().await;
        info!(reason = %reason, "tunnel connection ended");
        reason
    }
}

impl<H: RequestHandler> Demux<H> {
    async fn dispatch(&mut self, frame: Frame, cancel: &CancellationToken) -> Result<(), RelayError> {
        match frame {
            Frame::HttpRequest { id, request } => {
                let permit = tokio::select! {
                    permit = Arc::clone(&self.limiter).acquire_owned() => {
                        permit.map_err(|_| RelayError::Cancelled)?
                    }
                    () = cancel.cancelled() => return Err(RelayError::Cancelled),
                };
                debug!(%id, method = %request.method, path = %request.path, "relayed http request");
                let handler = Arc::clone(&self.handler);
                let writer = self.writer.clone();
                self.exchanges.spawn(async move {
                    let response = handler.handle(request).await;
                    let frame = Frame::HttpResponse {
                        id: id.clone(),
                        response,
                    };
                    if let Err(e) = writer.send_frame(&frame).await {
                        debug!(%id, "http response not delivered: {e}");
                    }
                    drop(permit);
                });
            }
            Frame::StreamOpen { stream_id } => {
                let Some(stream) = VirtualStream::open(&stream_id, &self.streams, self.writer.clone())
                else {
                    warn!(stream_id = %stream_id, "duplicate stream_open ignored");
                    return Ok(());
                };
                debug!(stream_id = %stream_id, "virtual stream opened");
                tokio::select! {
                    sent = self.new_streams.send(stream) => {
                        if let Err(mpsc::error::SendError(stream)) = sent {
                            warn!(stream_id = %stream_id, "no consumer for virtual streams, closing");
                            stream.close().await;
                        }
                    }
                    () = cancel.cancelled() => return Err(RelayError::Cancelled),
                }
            }
            Frame::StreamData { stream_id, data } => {
                let bytes = match STANDARD.decode(data.as_bytes()) {
                    Ok(b) => Bytes::from(b),
                    Err(e) => {
                        warn!(stream_id = %stream_id, "dropping undecodable stream data: {e}");
                        return Ok(());
                    }
                };
                let overflowed = {
                    let mut streams = lock_streams(&self.streams);
                    match streams.get(&stream_id).map(|slot| slot.deliver(bytes)) {
                        None => {
                            warn!(stream_id = %stream_id, "stream_data for unknown stream");
                            false
                        }
                        Some(Delivery::Queued) => false,
                        Some(Delivery::Gone) => {
                            streams.remove(&stream_id);
                            debug!(stream_id = %stream_id, "stream reader gone, deregistered");
                            false
                        }
                        Some(Delivery::Overflow) => {
                            if let Some(slot) = streams.remove(&stream_id) {
                                slot.close_remote();
                            }
                            true
                        }
                    }
                };
                if overflowed {
                    warn!(stream_id = %stream_id, "stream reader too slow, closing stream");
                    let frame = Frame::StreamClose { stream_id };
                    if let Err(e) = self.writer.send_frame(&frame).await {
                        debug!("stream_close not delivered: {e}");
                    }
                }
            }
            Frame::StreamClose { stream_id } => {
                let removed = lock_streams(&self.streams).remove(&stream_id);
                match removed {
                    Some(slot) => {
                        slot.close_remote();
                        debug!(stream_id = %stream_id, "virtual stream closed by relay");
                    }
                    None => warn!(stream_id = %stream_id, "stream_close for unknown stream"),
                }
            }
            Frame::HttpResponse { id, .. } => {
                warn!(%id, "unexpected http_response from relay ignored");
            }
        }
        Ok(())
    }

    /// Invalidate everything this connection owned.
    async fn teardown(&mut self) {
        self.exchanges.abort_all();
        let slots: Vec<_> = lock_streams(&self.streams).drain().map(|(_, s)| s).collect();
        for slot in &slots {
            slot.close_remote();
        }
        if !slots.is_empty() {
            debug!(streams = slots.len(), "invalidated virtual streams");
        }
        drop(slots);
        self.writer.shut().await;
    }
}

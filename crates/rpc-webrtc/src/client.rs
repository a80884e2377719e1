use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::channel::BaseChannel;
use crate::status::{Code, Metadata, Status};
use crate::stream::{fragment, StreamCore};
use crate::wire::{
    decode_response, encode_request, PacketMessage, Request, RequestHeaders, RequestMessage,
    Response, ResponseKind,
};
use crate::workers::Workers;

/// Result of a unary call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnaryResponse {
    pub headers: Metadata,
    pub message: Bytes,
    pub trailers: Metadata,
}

/// Issues RPCs over one data channel.
#[derive(Clone)]
pub struct ClientChannel {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    base: Arc<BaseChannel>,
    next_id: AtomicU64,
    streams: Mutex<HashMap<u64, Arc<ClientStreamState>>>,
    workers: Workers,
}

impl ClientChannel {
    pub fn new(base: Arc<BaseChannel>) -> Self {
        let workers = Workers::new("client-channel", base.cancel_token().clone());
        let inner = Arc::new(ClientInner {
            base,
            next_id: AtomicU64::new(1),
            streams: Mutex::new(HashMap::new()),
            workers,
        });
        match inner.base.take_inbound() {
            Some(inbound) => {
                let reader = inner.clone();
                inner.workers.spawn(async move { reader.read_loop(inbound).await });
            }
            None => warn!(
                target = "rpc_webrtc::client",
                "inbound queue already claimed; responses will never arrive"
            ),
        }
        Self { inner }
    }

    pub fn base(&self) -> &Arc<BaseChannel> {
        &self.inner.base
    }

    pub fn active_streams(&self) -> usize {
        self.inner.streams.lock().len()
    }

    /// Opens a stream. Headers go out lazily with the first send or half-close.
    pub fn new_stream(
        &self,
        method: &str,
        metadata: Metadata,
        timeout: Option<Duration>,
    ) -> Result<ClientStream, Status> {
        let inner = &self.inner;
        if inner.base.cancel_token().is_cancelled() {
            return Err(Status::unavailable("channel closed"));
        }
        let limits = *inner.base.limits();
        let state = {
            let mut streams = inner.streams.lock();
            if streams.len() >= limits.max_concurrent_streams {
                return Err(Status::resource_exhausted(format!(
                    "max concurrent streams ({}) reached",
                    limits.max_concurrent_streams
                )));
            }
            let id = inner.next_id.fetch_add(1, Ordering::SeqCst);
            let state = Arc::new(ClientStreamState::new(
                id,
                RequestHeaders {
                    method: method.to_string(),
                    metadata,
                    timeout,
                },
                &inner.base,
                &inner.workers,
                limits.max_message_bytes,
            ));
            let weak: Weak<ClientInner> = Arc::downgrade(inner);
            state.core.set_on_done(move |id| {
                if let Some(inner) = weak.upgrade() {
                    inner.streams.lock().remove(&id);
                }
            });
            streams.insert(id, state.clone());
            state
        };
        trace!(
            target = "rpc_webrtc::client",
            stream_id = state.core.id(),
            method,
            "stream opened"
        );
        Ok(ClientStream {
            guard: Arc::new(StreamGuard {
                state: state.clone(),
            }),
            state,
        })
    }

    /// Sends one request and waits for exactly one response plus an OK trailer.
    ///
    /// Dropping the returned future cancels the call on both ends.
    pub async fn invoke(
        &self,
        method: &str,
        metadata: Metadata,
        request: Bytes,
        timeout: Option<Duration>,
    ) -> Result<UnaryResponse, Status> {
        let stream = self.new_stream(method, metadata, timeout)?;
        let call = async {
            stream.send_msg(request).await?;
            stream.close_send().await?;
            let message = stream
                .recv_msg()
                .await?
                .ok_or_else(|| Status::internal("server finished without a response message"))?;
            if stream.recv_msg().await?.is_some() {
                stream.reset().await;
                return Err(Status::internal("unary call received more than one response"));
            }
            Ok(UnaryResponse {
                headers: stream.header().await?,
                message,
                trailers: stream.trailer(),
            })
        };
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => {
                    stream.reset().await;
                    Err(Status::deadline_exceeded("call deadline exceeded"))
                }
            },
            None => call.await,
        }
    }

    /// Closes the channel; every open stream fails with `Canceled`.
    pub async fn close(&self) {
        self.inner.base.close().await;
        self.inner.workers.shutdown().await;
    }
}

impl ClientInner {
    async fn read_loop(self: Arc<Self>, mut inbound: tokio::sync::mpsc::UnboundedReceiver<Bytes>) {
        let cancel = self.base.cancel_token().clone();
        loop {
            let data = tokio::select! {
                _ = cancel.cancelled() => break,
                data = inbound.recv() => match data {
                    Some(data) => data,
                    None => break,
                },
            };
            match decode_response(&data) {
                Ok(response) => self.dispatch(response).await,
                Err(err) => warn!(
                    target = "rpc_webrtc::client",
                    error = %err,
                    len = data.len(),
                    "dropping undecodable response frame"
                ),
            }
        }
        let streams: Vec<_> = self.streams.lock().values().cloned().collect();
        for stream in streams {
            stream.core.close(Some(Status::canceled("channel closed")));
        }
    }

    async fn dispatch(&self, response: Response) {
        let stream_id = response.stream_id;
        let stream = self.streams.lock().get(&stream_id).cloned();
        let Some(stream) = stream else {
            warn!(
                target = "rpc_webrtc::client",
                stream_id,
                "discarding frame for unknown stream"
            );
            return;
        };
        if let Some(status) = stream.on_response(response.kind) {
            debug!(
                target = "rpc_webrtc::client",
                stream_id,
                error = %status,
                "closing stream after protocol violation"
            );
            if stream.core.close(Some(status)) {
                stream.send_reset().await;
            }
        }
    }
}

struct ClientStreamState {
    core: StreamCore,
    base: Arc<BaseChannel>,
    workers: Workers,
    request_headers: Mutex<Option<RequestHeaders>>,
    headers_sent: tokio::sync::Mutex<bool>,
    send_closed: AtomicBool,
    header: watch::Sender<Option<Metadata>>,
    trailer: Mutex<Metadata>,
}

impl ClientStreamState {
    fn new(
        stream_id: u64,
        headers: RequestHeaders,
        base: &Arc<BaseChannel>,
        workers: &Workers,
        max_message_bytes: usize,
    ) -> Self {
        let (header, _) = watch::channel(None);
        Self {
            core: StreamCore::new(stream_id, base.cancel_token(), max_message_bytes),
            base: base.clone(),
            workers: workers.clone(),
            request_headers: Mutex::new(Some(headers)),
            headers_sent: tokio::sync::Mutex::new(false),
            send_closed: AtomicBool::new(false),
            header,
            trailer: Mutex::new(Metadata::new()),
        }
    }

    fn headers_received(&self) -> bool {
        self.header.borrow().is_some()
    }

    /// Applies one inbound frame. Returns a status when the frame breaks the protocol.
    fn on_response(&self, kind: ResponseKind) -> Option<Status> {
        match kind {
            ResponseKind::Headers { metadata } => {
                if self.headers_received() {
                    return Some(Status::internal("protocol error: headers received twice"));
                }
                self.header.send_replace(Some(metadata));
                None
            }
            ResponseKind::Message { packet } => {
                if !self.headers_received() {
                    return Some(Status::internal(
                        "protocol error: message received before headers",
                    ));
                }
                match self.core.process_packet(packet) {
                    Ok(Some(msg)) => {
                        self.core.push_message(msg);
                        None
                    }
                    Ok(None) => None,
                    Err(status) => Some(status),
                }
            }
            ResponseKind::Trailers { status, metadata } => {
                if !self.headers_received() {
                    // trailers-only response
                    self.header.send_replace(Some(Metadata::new()));
                }
                *self.trailer.lock() = metadata;
                trace!(
                    target = "rpc_webrtc::client",
                    stream_id = self.core.id(),
                    code = status.code.as_str(),
                    "trailers received"
                );
                let err = if status.is_ok() { None } else { Some(status) };
                self.core.close(err);
                None
            }
        }
    }

    async fn write(&self, request: Request) -> Result<(), Status> {
        match self.base.write(encode_request(&request)).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let status = Status::from(err);
                self.core.close(Some(status.clone()));
                Err(status)
            }
        }
    }

    async fn ensure_headers(&self) -> Result<(), Status> {
        let mut sent = self.headers_sent.lock().await;
        if *sent {
            return Ok(());
        }
        // a reset may have won the lock; its id must not be reopened
        if self.core.is_done() {
            return Err(self.finished_status());
        }
        self.base.ready().await.map_err(Status::from)?;
        let headers = self
            .request_headers
            .lock()
            .take()
            .ok_or_else(|| Status::internal("request headers missing"))?;
        self.write(Request::headers(self.core.id(), headers)).await?;
        *sent = true;
        Ok(())
    }

    fn finished_status(&self) -> Status {
        self.core
            .err()
            .unwrap_or_else(|| Status::new(Code::FailedPrecondition, "stream already finished"))
    }

    /// Tells the server the id is abandoned. Goes out even when headers never did, so
    /// the server can retire the id. Call only after the core is closed.
    async fn send_reset(self: &Arc<Self>) {
        let sent = self.headers_sent.lock().await;
        if !*sent && !self.base.is_ready() {
            let state = self.clone();
            self.workers.spawn_cancellable(async move {
                if state.base.ready().await.is_ok() {
                    state.write_reset().await;
                }
            });
            return;
        }
        self.write_reset().await;
        drop(sent);
    }

    async fn write_reset(&self) {
        let frame = encode_request(&Request::rst_stream(self.core.id()));
        if let Err(err) = self.base.write(frame).await {
            trace!(
                target = "rpc_webrtc::client",
                stream_id = self.core.id(),
                error = %err,
                "failed to send reset"
            );
        }
    }
}

/// Caller-side view of one call.
///
/// `send_msg` and `recv_msg` may run concurrently with each other, but neither may be
/// called concurrently with itself.
///
/// Dropping the last handle of an unfinished stream cancels it and resets it on the
/// server.
#[derive(Clone)]
pub struct ClientStream {
    state: Arc<ClientStreamState>,
    guard: Arc<StreamGuard>,
}

/// Shared by every clone of one `ClientStream`; runs when the last clone goes away.
struct StreamGuard {
    state: Arc<ClientStreamState>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let state = &self.state;
        if !state.core.close(Some(Status::canceled("stream dropped by caller"))) {
            return;
        }
        trace!(
            target = "rpc_webrtc::client",
            stream_id = state.core.id(),
            "stream dropped before finishing"
        );
        // outside a runtime there is nothing left to reset against
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        let state = state.clone();
        state
            .workers
            .clone()
            .spawn_cancellable(async move { state.send_reset().await });
    }
}

impl ClientStream {
    pub fn stream_id(&self) -> u64 {
        self.state.core.id()
    }

    pub async fn send_msg(&self, msg: Bytes) -> Result<(), Status> {
        let state = &self.state;
        if state.core.is_done() {
            return Err(state.finished_status());
        }
        if state.send_closed.load(Ordering::SeqCst) {
            return Err(Status::internal("send after close_send"));
        }
        state.ensure_headers().await?;
        for packet in fragment(&msg) {
            state
                .write(Request::message(
                    state.core.id(),
                    RequestMessage {
                        has_message: true,
                        packet,
                        eos: false,
                    },
                ))
                .await?;
        }
        Ok(())
    }

    /// Half-closes the stream: the server sees end of stream but may keep sending.
    pub async fn close_send(&self) -> Result<(), Status> {
        let state = &self.state;
        if state.send_closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if state.core.is_done() {
            return Ok(());
        }
        state.ensure_headers().await?;
        state
            .write(Request::message(
                state.core.id(),
                RequestMessage {
                    has_message: false,
                    packet: PacketMessage::default(),
                    eos: true,
                },
            ))
            .await
    }

    /// Next response message, `None` after an OK trailer, or the failing status.
    pub async fn recv_msg(&self) -> Result<Option<Bytes>, Status> {
        self.state.core.recv().await
    }

    /// Waits for the response headers.
    pub async fn header(&self) -> Result<Metadata, Status> {
        let mut rx = self.state.header.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(metadata) = current {
                return Ok(metadata);
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(Status::canceled("stream dropped"));
                    }
                }
                _ = self.state.core.wait_done() => {
                    let current = self.state.header.borrow().clone();
                    return current.ok_or_else(|| self.state.finished_status());
                }
            }
        }
    }

    /// Trailer metadata. Empty until the stream has finished.
    pub fn trailer(&self) -> Metadata {
        self.state.trailer.lock().clone()
    }

    /// Aborts the call. The server sees a reset and local readers get `Canceled`.
    pub async fn reset(&self) {
        if !self
            .state
            .core
            .close(Some(Status::canceled("stream reset by client")))
        {
            return;
        }
        self.state.send_reset().await;
    }

    pub async fn done(&self) {
        self.state.core.wait_done().await;
    }
}

impl std::fmt::Debug for ClientStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientStream")
            .field("stream_id", &self.stream_id())
            .field("done", &self.state.core.is_done())
            .field("handles", &Arc::strong_count(&self.guard))
            .finish()
    }
}

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::channel::BaseChannel;
use crate::service::{CallContext, Interceptor, Services};
use crate::status::{Metadata, Status};
use crate::stream::{fragment, StreamCore};
use crate::wire::{
    decode_request, encode_response, Request, RequestHeaders, RequestKind,
    RequestMessage, Response, ResponseKind,
};
use crate::workers::Workers;

/// Per-connection knobs for the serving side.
#[derive(Clone, Default)]
pub struct ServerOptions {
    pub interceptor: Option<Arc<dyn Interceptor>>,
    pub audience: Option<String>,
}

/// Serves RPCs arriving on one data channel.
#[derive(Clone)]
pub struct ServerChannel {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    base: Arc<BaseChannel>,
    services: Arc<Services>,
    options: ServerOptions,
    streams: Mutex<StreamTable>,
    workers: Workers,
}

#[derive(Default)]
struct StreamTable {
    active: HashMap<u64, Arc<ServerStreamState>>,
    // every id at or below the floor is done; `retired` holds the ones above it
    retired_floor: u64,
    retired: HashSet<u64>,
}

impl StreamTable {
    /// Marks an id as done. Frames that arrive for it later are dropped.
    fn retire(&mut self, id: u64) {
        if id <= self.retired_floor {
            return;
        }
        self.retired.insert(id);
        while self.retired.remove(&(self.retired_floor + 1)) {
            self.retired_floor += 1;
        }
    }

    fn is_retired(&self, id: u64) -> bool {
        id <= self.retired_floor || self.retired.contains(&id)
    }
}

impl ServerChannel {
    pub fn new(base: Arc<BaseChannel>, services: Arc<Services>, options: ServerOptions) -> Self {
        let workers = Workers::new("server-channel", base.cancel_token().clone());
        let inner = Arc::new(ServerInner {
            base,
            services,
            options,
            streams: Mutex::new(StreamTable::default()),
            workers,
        });
        match inner.base.take_inbound() {
            Some(inbound) => {
                let reader = inner.clone();
                inner.workers.spawn(async move { reader.read_loop(inbound).await });
            }
            None => warn!(
                target = "rpc_webrtc::server",
                "inbound queue already claimed; channel will not serve requests"
            ),
        }
        Self { inner }
    }

    pub fn base(&self) -> &Arc<BaseChannel> {
        &self.inner.base
    }

    pub fn active_streams(&self) -> usize {
        self.inner.streams.lock().active.len()
    }

    /// Closes the channel, cancels every stream and waits for handlers to unwind.
    pub async fn close(&self) {
        self.inner.base.close().await;
        self.inner.workers.shutdown().await;
    }

    /// Resolves when the underlying channel closes for any reason.
    pub async fn closed(&self) {
        self.inner.base.cancel_token().cancelled().await;
    }
}

impl ServerInner {
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
            match decode_request(&data) {
                Ok(request) => self.dispatch(request).await,
                Err(err) => warn!(
                    target = "rpc_webrtc::server",
                    error = %err,
                    len = data.len(),
                    "dropping undecodable request frame"
                ),
            }
        }
        let streams: Vec<_> = self.streams.lock().active.values().cloned().collect();
        for stream in streams {
            stream.core.close(Some(Status::canceled("channel closed")));
        }
    }

    async fn dispatch(self: &Arc<Self>, request: Request) {
        let stream_id = request.stream_id;
        let existing = self.streams.lock().active.get(&stream_id).cloned();
        if let Some(stream) = existing {
            if let Some(status) = stream.on_request(request.kind) {
                stream.finish(Err(status)).await;
            }
            return;
        }

        // headers can arrive out of id order; only retired ids are late
        if self.streams.lock().is_retired(stream_id) {
            warn!(
                target = "rpc_webrtc::server",
                stream_id,
                "discarding frame for finished stream"
            );
            return;
        }

        match request.kind {
            RequestKind::Headers(headers) => self.open_stream(stream_id, headers).await,
            RequestKind::RstStream => {
                // the client gave the id up before sending headers
                trace!(target = "rpc_webrtc::server", stream_id, "reset for unopened stream");
                self.streams.lock().retire(stream_id);
            }
            RequestKind::Message(_) => {
                debug!(
                    target = "rpc_webrtc::server",
                    stream_id,
                    "message before headers"
                );
                self.write_trailers(
                    stream_id,
                    Status::internal("protocol error: message received before headers"),
                )
                .await;
            }
        }
    }

    async fn open_stream(self: &Arc<Self>, stream_id: u64, headers: RequestHeaders) {
        let limits = *self.base.limits();
        let state = {
            let mut table = self.streams.lock();
            if table.active.len() >= limits.max_concurrent_streams {
                table.retire(stream_id);
                None
            } else {
                let state = Arc::new(ServerStreamState::new(
                    stream_id,
                    headers,
                    &self.base,
                    limits.max_message_bytes,
                ));
                let weak: Weak<ServerInner> = Arc::downgrade(self);
                state.core.set_on_done(move |id| {
                    if let Some(inner) = weak.upgrade() {
                        let mut table = inner.streams.lock();
                        table.active.remove(&id);
                        table.retire(id);
                    }
                });
                table.active.insert(stream_id, state.clone());
                Some(state)
            }
        };
        let Some(state) = state else {
            warn!(
                target = "rpc_webrtc::server",
                stream_id,
                max = limits.max_concurrent_streams,
                "rejecting stream over concurrency limit"
            );
            self.write_trailers(
                stream_id,
                Status::resource_exhausted(format!(
                    "max concurrent streams ({}) reached",
                    limits.max_concurrent_streams
                )),
            )
            .await;
            return;
        };

        let ctx = CallContext {
            stream_id,
            method: state.method.clone(),
            metadata: state.metadata.clone(),
            timeout: state.timeout,
            audience: self.options.audience.clone(),
            cancel: state.core.cancel_token().clone(),
        };
        let stream = ServerStream {
            state: state.clone(),
        };
        let inner = self.clone();
        self.workers
            .spawn(async move { inner.run_handler(ctx, stream).await });
    }

    async fn run_handler(self: Arc<Self>, ctx: CallContext, stream: ServerStream) {
        let cancel = ctx.cancel.clone();
        let timeout = ctx.timeout;
        let method = ctx.method.clone();
        let method_name = method.clone();
        let stream_id = ctx.stream_id;
        let interceptor = self.options.interceptor.clone();
        let handler = self.services.lookup(&method);
        let handler_stream = stream.clone();
        let work = async move {
            if let Some(interceptor) = interceptor {
                interceptor.intercept(&ctx).await?;
            }
            let handler = handler
                .ok_or_else(|| Status::unimplemented(format!("unknown method {method}")))?;
            match timeout {
                Some(limit) => tokio::time::timeout(limit, handler.call(ctx, handler_stream))
                    .await
                    .map_err(|_| Status::deadline_exceeded("handler deadline exceeded"))?,
                None => handler.call(ctx, handler_stream).await,
            }
        };
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                trace!(target = "rpc_webrtc::server", stream_id, "handler abandoned; stream canceled");
                return;
            }
            result = AssertUnwindSafe(work).catch_unwind() => match result {
                Ok(result) => result,
                Err(_) => {
                    warn!(target = "rpc_webrtc::server", stream_id, method = %method_name, "handler panicked");
                    Err(Status::internal("handler panicked"))
                }
            },
        };
        stream.state.finish(result).await;
    }

    async fn write_trailers(&self, stream_id: u64, status: Status) {
        let frame = encode_response(&Response::trailers(stream_id, status));
        if let Err(err) = self.base.write(frame).await {
            debug!(
                target = "rpc_webrtc::server",
                stream_id,
                error = %err,
                "failed to write trailers"
            );
        }
    }
}

struct ServerStreamState {
    core: StreamCore,
    base: Arc<BaseChannel>,
    method: String,
    metadata: Metadata,
    timeout: Option<std::time::Duration>,
    header: Mutex<Metadata>,
    trailer: Mutex<Metadata>,
    headers_sent: AtomicBool,
    finished: AtomicBool,
    client_eos: AtomicBool,
}

impl ServerStreamState {
    fn new(
        stream_id: u64,
        headers: RequestHeaders,
        base: &Arc<BaseChannel>,
        max_message_bytes: usize,
    ) -> Self {
        Self {
            core: StreamCore::new(stream_id, base.cancel_token(), max_message_bytes),
            base: base.clone(),
            method: headers.method,
            metadata: headers.metadata,
            timeout: headers.timeout,
            header: Mutex::new(Metadata::new()),
            trailer: Mutex::new(Metadata::new()),
            headers_sent: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            client_eos: AtomicBool::new(false),
        }
    }

    /// Applies one inbound frame. Returns a status when the frame breaks the protocol.
    fn on_request(&self, kind: RequestKind) -> Option<Status> {
        let stream_id = self.core.id();
        match kind {
            RequestKind::Headers(_) => Some(Status::internal(
                "protocol error: headers received twice",
            )),
            RequestKind::RstStream => {
                debug!(target = "rpc_webrtc::server", stream_id, "stream reset by client");
                self.finished.store(true, Ordering::SeqCst);
                self.core.close(Some(Status::canceled("stream reset by client")));
                None
            }
            RequestKind::Message(message) => self.on_message(message),
        }
    }

    fn on_message(&self, message: RequestMessage) -> Option<Status> {
        if self.client_eos.load(Ordering::SeqCst) {
            return Some(Status::internal(
                "protocol error: message received after end of stream",
            ));
        }
        if message.has_message {
            match self.core.process_packet(message.packet) {
                Ok(Some(msg)) => self.core.push_message(msg),
                Ok(None) => {}
                Err(status) => return Some(status),
            }
        }
        if message.eos {
            self.client_eos.store(true, Ordering::SeqCst);
            self.core.close_recv(None);
        }
        None
    }

    async fn write(&self, kind: ResponseKind) -> Result<(), Status> {
        if self.core.cancel_token().is_cancelled() {
            return Err(self
                .core
                .err()
                .unwrap_or_else(|| Status::canceled("stream canceled")));
        }
        let frame = encode_response(&Response {
            stream_id: self.core.id(),
            kind,
        });
        self.base.write(frame).await.map_err(Status::from)
    }

    async fn send_header(&self) -> Result<(), Status> {
        if self.headers_sent.swap(true, Ordering::SeqCst) {
            return Err(Status::internal("headers already sent"));
        }
        let metadata = self.header.lock().clone();
        self.write(ResponseKind::Headers { metadata }).await
    }

    async fn send_msg(&self, msg: Bytes) -> Result<(), Status> {
        if self.finished.load(Ordering::SeqCst) {
            return Err(Status::internal("send on finished stream"));
        }
        if !self.headers_sent.load(Ordering::SeqCst) {
            self.send_header().await?;
        }
        for packet in fragment(&msg) {
            self.write(ResponseKind::Message { packet }).await?;
        }
        Ok(())
    }

    /// Writes the trailers and releases the stream. Only the first call writes.
    async fn finish(&self, result: Result<(), Status>) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        let status = match &result {
            Ok(()) => Status::ok(),
            Err(status) => status.clone(),
        };
        let metadata = self.trailer.lock().clone();
        let stream_id = self.core.id();
        if let Err(err) = self
            .write(ResponseKind::Trailers {
                status: status.clone(),
                metadata,
            })
            .await
        {
            debug!(
                target = "rpc_webrtc::server",
                stream_id,
                error = %err,
                "failed to write trailers"
            );
        }
        trace!(
            target = "rpc_webrtc::server",
            stream_id,
            code = status.code.as_str(),
            "stream finished"
        );
        self.core.close(result.err());
    }
}

/// Handler-side view of one call.
///
/// `recv_msg` and `send_msg` may run concurrently with each other, but not with
/// themselves.
#[derive(Clone)]
pub struct ServerStream {
    state: Arc<ServerStreamState>,
}

impl ServerStream {
    pub fn stream_id(&self) -> u64 {
        self.state.core.id()
    }

    pub fn method(&self) -> &str {
        &self.state.method
    }

    pub fn metadata(&self) -> &Metadata {
        &self.state.metadata
    }

    /// Next request message, `None` once the client half-closed.
    pub async fn recv_msg(&self) -> Result<Option<Bytes>, Status> {
        self.state.core.recv().await
    }

    /// Adds header metadata to be sent with the (possibly implicit) headers frame.
    pub fn set_header(&self, metadata: Metadata) -> Result<(), Status> {
        if self.state.headers_sent.load(Ordering::SeqCst) {
            return Err(Status::internal("headers already sent"));
        }
        self.state.header.lock().merge(metadata);
        Ok(())
    }

    pub async fn send_header(&self, metadata: Metadata) -> Result<(), Status> {
        self.set_header(metadata)?;
        self.state.send_header().await
    }

    pub fn set_trailer(&self, metadata: Metadata) {
        self.state.trailer.lock().merge(metadata);
    }

    pub async fn send_msg(&self, msg: Bytes) -> Result<(), Status> {
        self.state.send_msg(msg).await
    }
}

impl std::fmt::Debug for ServerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerStream")
            .field("stream_id", &self.stream_id())
            .field("method", &self.state.method)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::MockPipe;
    use crate::wire::encode_request;

    #[test_timeout::timeout]
    fn retired_ids_compact_into_the_floor() {
        let mut table = StreamTable::default();
        table.retire(2);
        assert!(table.is_retired(2));
        assert!(!table.is_retired(1));
        assert!(!table.is_retired(3));

        table.retire(1);
        assert_eq!(table.retired_floor, 2);
        assert!(table.retired.is_empty());

        table.retire(5);
        table.retire(1);
        assert!(table.is_retired(5));
        assert!(!table.is_retired(4));
        assert_eq!(table.retired_floor, 2);
    }

    #[test_timeout::tokio_timeout_test]
    async fn reset_for_unopened_id_lets_the_floor_advance() {
        let base = BaseChannel::new(
            Arc::new(MockPipe::default()),
            crate::config::ChannelLimits::default(),
        );
        base.handle_open();
        let server = ServerChannel::new(
            base.clone(),
            Arc::new(Services::new()),
            ServerOptions::default(),
        );
        {
            let mut table = server.inner.streams.lock();
            for id in 2..=100 {
                table.retire(id);
            }
            assert_eq!(table.retired_floor, 0);
            assert_eq!(table.retired.len(), 99);
        }

        base.handle_message(encode_request(&Request::rst_stream(1)));
        for _ in 0..50 {
            if server.inner.streams.lock().retired_floor == 100 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let table = server.inner.streams.lock();
        assert_eq!(table.retired_floor, 100);
        assert!(table.retired.is_empty());
    }
}

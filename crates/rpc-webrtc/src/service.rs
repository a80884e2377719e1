use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::server::ServerStream;
use crate::status::{Metadata, Status};

/// What a handler knows about the call it is serving.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub stream_id: u64,
    pub method: String,
    pub metadata: Metadata,
    pub timeout: Option<Duration>,
    /// Audience the connection was authenticated for, if the host checked one.
    pub audience: Option<String>,
    pub cancel: CancellationToken,
}

/// Serves one RPC method. The stream is finished with `Ok` or the returned status
/// once `call` returns.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn call(&self, ctx: CallContext, stream: ServerStream) -> Result<(), Status>;
}

/// Runs before dispatch. A rejection ends the stream with the returned status.
#[async_trait]
pub trait Interceptor: Send + Sync + 'static {
    async fn intercept(&self, ctx: &CallContext) -> Result<(), Status>;
}

/// Single request, single response.
pub struct UnaryHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

impl<F, Fut> UnaryHandler<F, Fut>
where
    F: Fn(CallContext, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, Status>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _fut: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> RpcHandler for UnaryHandler<F, Fut>
where
    F: Fn(CallContext, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, Status>> + Send + 'static,
{
    async fn call(&self, ctx: CallContext, stream: ServerStream) -> Result<(), Status> {
        let request = stream
            .recv_msg()
            .await?
            .ok_or_else(|| Status::invalid_argument("unary call without a request message"))?;
        let response = (self.f)(ctx, request).await?;
        stream.send_msg(response).await
    }
}

/// Hands the raw stream to a closure, for client, server and bidi streaming.
pub struct StreamingHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

impl<F, Fut> StreamingHandler<F, Fut>
where
    F: Fn(CallContext, ServerStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Status>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _fut: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> RpcHandler for StreamingHandler<F, Fut>
where
    F: Fn(CallContext, ServerStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Status>> + Send + 'static,
{
    async fn call(&self, ctx: CallContext, stream: ServerStream) -> Result<(), Status> {
        (self.f)(ctx, stream).await
    }
}

/// Method name (`/pkg.Service/Method`) to handler registry.
#[derive(Clone, Default)]
pub struct Services {
    handlers: HashMap<String, Arc<dyn RpcHandler>>,
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, method: impl Into<String>, handler: Arc<dyn RpcHandler>) -> &mut Self {
        self.handlers.insert(method.into(), handler);
        self
    }

    pub fn unary<F, Fut>(&mut self, method: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(CallContext, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, Status>> + Send + 'static,
    {
        self.register(method, Arc::new(UnaryHandler::new(f)))
    }

    pub fn streaming<F, Fut>(&mut self, method: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(CallContext, ServerStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        self.register(method, Arc::new(StreamingHandler::new(f)))
    }

    pub fn lookup(&self, method: &str) -> Option<Arc<dyn RpcHandler>> {
        self.handlers.get(method).cloned()
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut methods: Vec<_> = self.methods().collect();
        methods.sort_unstable();
        f.debug_struct("Services").field("methods", &methods).finish()
    }
}

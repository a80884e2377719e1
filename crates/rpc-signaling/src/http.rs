//! axum routes exposing [`SignalingServer`] over HTTP and WebSockets.
//!
//! Call and Answer are WebSocket streams; CallUpdate and the optional WebRTC config
//! are plain JSON requests. Destination hosts ride in the `rpc-host` header.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rpc_webrtc::{Code, Status};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::{parse_hosts, HOST_METADATA_KEY};
use crate::error::SignalingError;
use crate::proto::{
    AnswerRequest, AnswerResponse, CallRequest, CallResponse, CallUpdateRequest,
    CallUpdateResponse, ErrorStatus, ServerFrame, WebRtcConfig,
};
use crate::rate_limit::{limiter_key, RateLimiter};
use crate::server::SignalingServer;

/// Shared state behind every signaling route.
#[derive(Clone)]
pub struct SignalingState {
    server: Arc<SignalingServer>,
    limiter: Option<Arc<dyn RateLimiter>>,
}

impl SignalingState {
    pub fn new(server: Arc<SignalingServer>) -> Self {
        Self {
            server,
            limiter: None,
        }
    }

    /// Rate limits Call and Answer per remote address.
    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn server(&self) -> &Arc<SignalingServer> {
        &self.server
    }

    async fn admit(&self, method: &str, remote: Option<SocketAddr>) -> Result<(), SignalingError> {
        let Some(limiter) = &self.limiter else {
            return Ok(());
        };
        let caller = remote
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        limiter.allow(&limiter_key(method, &caller)).await
    }
}

/// Builds the signaling router. Serve it with
/// `into_make_service_with_connect_info::<SocketAddr>()` so rate limiting can see
/// the caller's address.
pub fn router(state: SignalingState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws/call", get(call_socket))
        .route("/call/update", post(call_update))
        .route("/ws/answer", get(answer_socket))
        .route("/webrtc-config", get(webrtc_config))
        .with_state(state)
}

/// HTTP status used for an RPC status code on the unary routes and refused upgrades.
pub fn http_status(code: Code) -> StatusCode {
    match code {
        Code::Ok => StatusCode::OK,
        Code::InvalidArgument | Code::OutOfRange => StatusCode::BAD_REQUEST,
        Code::FailedPrecondition => StatusCode::PRECONDITION_FAILED,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::AlreadyExists | Code::Aborted => StatusCode::CONFLICT,
        Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Best guess at the RPC code behind an HTTP error without a status body.
pub fn code_for_http_status(status: u16) -> Code {
    match status {
        400 | 422 => Code::InvalidArgument,
        401 => Code::Unauthenticated,
        403 => Code::PermissionDenied,
        404 => Code::NotFound,
        409 => Code::Aborted,
        412 => Code::FailedPrecondition,
        429 => Code::ResourceExhausted,
        501 => Code::Unimplemented,
        502 | 503 => Code::Unavailable,
        504 => Code::DeadlineExceeded,
        _ => Code::Unknown,
    }
}

/// Signaling failure rendered as an HTTP status with an [`ErrorStatus`] body.
#[derive(Debug)]
pub struct ApiError(pub SignalingError);

impl From<SignalingError> for ApiError {
    fn from(err: SignalingError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = Status::from(self.0);
        (http_status(status.code), Json(ErrorStatus::from(status))).into_response()
    }
}

fn request_hosts(headers: &HeaderMap) -> Vec<String> {
    parse_hosts(
        headers
            .get_all(HOST_METADATA_KEY)
            .iter()
            .filter_map(|value| value.to_str().ok()),
    )
}

async fn health_check() -> &'static str {
    "ok"
}

async fn call_socket(
    State(state): State<SignalingState>,
    remote: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    state.admit("Call", remote.map(|ConnectInfo(addr)| addr)).await?;
    let hosts = request_hosts(&headers);
    SignalingServer::single_host(&hosts)?;
    Ok(ws.on_upgrade(move |socket| serve_call(state, hosts, socket)))
}

async fn call_update(
    State(state): State<SignalingState>,
    headers: HeaderMap,
    Json(request): Json<CallUpdateRequest>,
) -> Result<Json<CallUpdateResponse>, ApiError> {
    let hosts = request_hosts(&headers);
    Ok(Json(state.server.call_update(&hosts, request).await?))
}

async fn answer_socket(
    State(state): State<SignalingState>,
    remote: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    state.admit("Answer", remote.map(|ConnectInfo(addr)| addr)).await?;
    let hosts = request_hosts(&headers);
    state.server.check_answer_hosts(&hosts)?;
    Ok(ws.on_upgrade(move |socket| serve_answer(state, hosts, socket)))
}

async fn webrtc_config(
    State(state): State<SignalingState>,
    headers: HeaderMap,
) -> Result<Json<WebRtcConfig>, ApiError> {
    let hosts = request_hosts(&headers);
    SignalingServer::single_host(&hosts)?;
    Ok(Json(state.server.optional_webrtc_config(&hosts).await?))
}

type SocketSink = SplitSink<WebSocket, Message>;

async fn send_frame<T: Serialize>(sink: &mut SocketSink, frame: &ServerFrame<T>) -> Result<(), SignalingError> {
    let text = serde_json::to_string(frame)?;
    sink.send(Message::Text(text))
        .await
        .map_err(|err| SignalingError::Transport(err.to_string()))
}

async fn send_error(sink: &mut SocketSink, err: SignalingError) {
    let frame: ServerFrame<()> = ServerFrame::Error(Status::from(err).into());
    if let Err(send_err) = send_frame(sink, &frame).await {
        trace!(
            target = "rpc_signaling::http",
            error = %send_err,
            "could not deliver error frame"
        );
    }
}

/// Next JSON message from the peer; `None` once the socket closed.
async fn read_json<T: DeserializeOwned>(
    source: &mut SplitStream<WebSocket>,
) -> Option<Result<T, SignalingError>> {
    while let Some(message) = source.next().await {
        match message {
            Ok(Message::Text(text)) => return Some(serde_json::from_str(&text).map_err(Into::into)),
            Ok(Message::Binary(data)) => return Some(serde_json::from_slice(&data).map_err(Into::into)),
            Ok(Message::Close(_)) => return None,
            Ok(_) => {}
            Err(err) => return Some(Err(SignalingError::Transport(err.to_string()))),
        }
    }
    None
}

async fn serve_call(state: SignalingState, hosts: Vec<String>, socket: WebSocket) {
    let (mut sink, mut source) = socket.split();
    let request = match read_json::<CallRequest>(&mut source).await {
        Some(Ok(request)) => request,
        Some(Err(err)) => {
            send_error(&mut sink, err).await;
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
        None => return,
    };
    let mut stream = match state.server.call(&hosts, request).await {
        Ok(stream) => stream,
        Err(err) => {
            send_error(&mut sink, err).await;
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
    };
    let uuid = stream.uuid().to_string();
    loop {
        tokio::select! {
            next = stream.next() => match next {
                Some(Ok(response)) => {
                    if let Err(err) = send_frame::<CallResponse>(&mut sink, &ServerFrame::Message(response)).await {
                        debug!(
                            target = "rpc_signaling::http",
                            uuid = %uuid,
                            error = %err,
                            "caller socket failed"
                        );
                        break;
                    }
                }
                Some(Err(err)) => {
                    send_error(&mut sink, err).await;
                    break;
                }
                None => break,
            },
            incoming = source.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    debug!(
                        target = "rpc_signaling::http",
                        uuid = %uuid,
                        "caller left before the exchange finished"
                    );
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}

async fn serve_answer(state: SignalingState, hosts: Vec<String>, socket: WebSocket) {
    let (sink, mut source) = socket.split();
    let (to_answerer, mut requests) = mpsc::unbounded_channel::<AnswerRequest>();
    let (responses, mut from_answerer) = mpsc::unbounded_channel::<AnswerResponse>();
    let socket_closed = CancellationToken::new();
    let finished = CancellationToken::new();

    let server = state.server.clone();
    let answering = {
        let finished = finished.clone();
        async move {
            let result = server.answer(&hosts, &to_answerer, &mut from_answerer).await;
            drop(to_answerer);
            finished.cancel();
            result
        }
    };

    // requests move in so that dropping them tells the server the answerer is gone
    let writer = {
        let socket_closed = socket_closed.clone();
        async move {
            let mut sink = sink;
            loop {
                let request = tokio::select! {
                    _ = socket_closed.cancelled() => break,
                    request = requests.recv() => match request {
                        Some(request) => request,
                        None => break,
                    },
                };
                if send_frame(&mut sink, &ServerFrame::Message(request)).await.is_err() {
                    break;
                }
            }
            drop(requests);
            sink
        }
    };

    let reader = {
        let finished = finished.clone();
        async move {
            loop {
                let next = tokio::select! {
                    _ = finished.cancelled() => break,
                    next = read_json::<AnswerResponse>(&mut source) => next,
                };
                match next {
                    Some(Ok(response)) => {
                        if responses.send(response).is_err() {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        debug!(
                            target = "rpc_signaling::http",
                            error = %err,
                            "unreadable answerer frame"
                        );
                        break;
                    }
                    None => break,
                }
            }
            drop(responses);
            socket_closed.cancel();
        }
    };

    let (result, mut sink, ()) = tokio::join!(answering, writer, reader);
    if let Err(err) = result {
        if !err.is_cancelled() {
            debug!(
                target = "rpc_signaling::http",
                error = %err,
                "answer stream failed"
            );
        }
        send_error(&mut sink, err).await;
    }
    let _ = sink.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn status_codes_round_trip_through_http() {
        for code in [
            Code::InvalidArgument,
            Code::FailedPrecondition,
            Code::NotFound,
            Code::ResourceExhausted,
            Code::DeadlineExceeded,
            Code::Unavailable,
            Code::PermissionDenied,
            Code::Unauthenticated,
            Code::Unimplemented,
        ] {
            assert_eq!(code_for_http_status(http_status(code).as_u16()), code);
        }
        assert_eq!(http_status(Code::Internal), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test_timeout::timeout]
    fn hosts_come_from_every_header_value() {
        let mut headers = HeaderMap::new();
        headers.append(HOST_METADATA_KEY, "h1, h2".parse().expect("header"));
        headers.append(HOST_METADATA_KEY, "h3".parse().expect("header"));
        assert_eq!(request_hosts(&headers), vec!["h1", "h2", "h3"]);
    }
}

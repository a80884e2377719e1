//! Client for a remote signaling server: WebSocket streams for Call and Answer,
//! JSON requests for the rest.

use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use rpc_webrtc::workers::Workers;
use rpc_webrtc::Status;
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::answerer::{AnswerConnection, AnswerStream};
use crate::config::HOST_METADATA_KEY;
use crate::dial::{CallEvents, CallSignaling};
use crate::error::SignalingError;
use crate::http::code_for_http_status;
use crate::proto::{
    AnswerRequest, AnswerResponse, CallRequest, CallResponse, CallUpdateRequest,
    CallUpdateResponse, ErrorStatus, ServerFrame, WebRtcConfig,
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct SignalingClient {
    http: reqwest::Client,
    base_url: String,
    workers: Workers,
}

impl SignalingClient {
    /// Builds a client for `base_url` (`http(s)://host:port`) without contacting it.
    pub fn new(base_url: impl Into<String>) -> Result<Self, SignalingError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(SignalingError::InvalidArgument(format!(
                "signaling address must be http(s): {base_url}"
            )));
        }
        Ok(Self {
            http: reqwest::Client::builder().build()?,
            base_url,
            workers: Workers::new("signaling-client", CancellationToken::new()),
        })
    }

    /// Builds a client and checks the server answers its health probe.
    pub async fn connect(base_url: impl Into<String>) -> Result<Self, SignalingError> {
        let client = Self::new(base_url)?;
        client.health().await?;
        Ok(client)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn health(&self) -> Result<(), SignalingError> {
        let response = self.http.get(self.url("/health")).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SignalingError::Transport(format!(
                "health check returned {status}"
            )));
        }
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn ws_url(&self, path: &str) -> String {
        let url = self.url(path);
        match url.strip_prefix("https://") {
            Some(rest) => format!("wss://{rest}"),
            None => url.replacen("http://", "ws://", 1),
        }
    }

    async fn open_socket(&self, path: &str, hosts: &[String]) -> Result<Socket, SignalingError> {
        let mut request = self.ws_url(path).into_client_request()?;
        let value = HeaderValue::from_str(&hosts.join(","))
            .map_err(|err| SignalingError::InvalidArgument(format!("bad host header: {err}")))?;
        request.headers_mut().insert(HOST_METADATA_KEY, value);
        match connect_async(request).await {
            Ok((socket, _)) => Ok(socket),
            Err(WsError::Http(response)) => {
                let body = response.body().as_deref().unwrap_or_default();
                Err(http_error(response.status().as_u16(), body))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Starts a call to `host`; the returned session yields the answerer's stages.
    pub async fn call(&self, host: &str, request: CallRequest) -> Result<CallSession, SignalingError> {
        let mut socket = self.open_socket("/ws/call", &[host.to_string()]).await?;
        socket
            .send(Message::Text(serde_json::to_string(&request)?))
            .await?;
        Ok(CallSession {
            socket,
            finished: false,
        })
    }

    pub async fn call_update(
        &self,
        host: &str,
        request: &CallUpdateRequest,
    ) -> Result<CallUpdateResponse, SignalingError> {
        let response = self
            .http
            .post(self.url("/call/update"))
            .header(HOST_METADATA_KEY, host)
            .json(request)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn optional_webrtc_config(&self, host: &str) -> Result<WebRtcConfig, SignalingError> {
        let response = self
            .http
            .get(self.url("/webrtc-config"))
            .header(HOST_METADATA_KEY, host)
            .send()
            .await?;
        decode(response).await
    }

    /// Opens an Answer stream for `hosts`, pumped by a background task until the
    /// server closes it or the client is closed.
    pub async fn answer(&self, hosts: &[String]) -> Result<AnswerStream, SignalingError> {
        let socket = self.open_socket("/ws/answer", hosts).await?;
        let (mut sink, mut source) = socket.split();
        let (request_tx, requests) = mpsc::unbounded_channel();
        let (responses, mut response_rx) = mpsc::unbounded_channel::<AnswerResponse>();
        let cancel = self.workers.cancel_token().clone();
        let spawned = self.workers.spawn(async move {
            let mut sending = true;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = read_frame::<_, AnswerRequest>(&mut source) => match frame {
                        Some(Ok(ServerFrame::Message(request))) => {
                            let _ = request_tx.send(Ok(request));
                        }
                        Some(Ok(ServerFrame::Error(status))) => {
                            let _ = request_tx.send(Err(SignalingError::from_status(status.into())));
                            break;
                        }
                        Some(Err(err)) => {
                            let _ = request_tx.send(Err(err));
                            break;
                        }
                        None => break,
                    },
                    response = response_rx.recv(), if sending => match response {
                        Some(response) => {
                            let sent = match serde_json::to_string(&response) {
                                Ok(text) => sink.send(Message::Text(text)).await.map_err(SignalingError::from),
                                Err(err) => Err(err.into()),
                            };
                            if let Err(err) = sent {
                                let _ = request_tx.send(Err(err));
                                break;
                            }
                        }
                        // the answerer is done talking; keep reading until the server closes
                        None => sending = false,
                    },
                }
            }
            if let Err(err) = sink.send(Message::Close(None)).await {
                trace!(
                    target = "rpc_signaling::client",
                    error = %err,
                    "answer socket already closed"
                );
            }
        });
        if !spawned {
            return Err(SignalingError::Cancelled);
        }
        Ok(AnswerStream {
            requests,
            responses,
        })
    }

    /// Stops every Answer pump this client started.
    pub async fn close(&self) {
        self.workers.shutdown().await;
        debug!(
            target = "rpc_signaling::client",
            base_url = %self.base_url,
            "signaling client closed"
        );
    }
}

/// Caller side of a Call stream.
pub struct CallSession {
    socket: Socket,
    finished: bool,
}

impl CallSession {
    pub async fn next(&mut self) -> Option<Result<CallResponse, SignalingError>> {
        if self.finished {
            return None;
        }
        let frame = read_frame::<_, CallResponse>(&mut self.socket).await;
        match frame {
            Some(Ok(ServerFrame::Message(response))) => Some(Ok(response)),
            Some(Ok(ServerFrame::Error(status))) => {
                self.finished = true;
                Some(Err(SignalingError::from_status(status.into())))
            }
            Some(Err(err)) => {
                self.finished = true;
                Some(Err(err))
            }
            None => {
                self.finished = true;
                None
            }
        }
    }
}

#[async_trait]
impl CallEvents for CallSession {
    async fn next(&mut self) -> Option<Result<CallResponse, SignalingError>> {
        CallSession::next(self).await
    }
}

#[async_trait]
impl CallSignaling for SignalingClient {
    async fn call(&self, host: &str, request: CallRequest) -> Result<Box<dyn CallEvents>, SignalingError> {
        let session = SignalingClient::call(self, host, request).await?;
        Ok(Box::new(session))
    }

    async fn call_update(&self, host: &str, request: CallUpdateRequest) -> Result<(), SignalingError> {
        SignalingClient::call_update(self, host, &request)
            .await
            .map(|_| ())
    }

    async fn optional_webrtc_config(&self, host: &str) -> Result<WebRtcConfig, SignalingError> {
        SignalingClient::optional_webrtc_config(self, host).await
    }
}

#[async_trait]
impl AnswerConnection for SignalingClient {
    async fn open(&self, hosts: &[String]) -> Result<AnswerStream, SignalingError> {
        self.answer(hosts).await
    }

    async fn close(&self) {
        SignalingClient::close(self).await
    }
}

/// Next server frame; `None` once the socket closed cleanly.
async fn read_frame<S, T>(source: &mut S) -> Option<Result<ServerFrame<T>, SignalingError>>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
    T: DeserializeOwned,
{
    while let Some(message) = source.next().await {
        match message {
            Ok(Message::Text(text)) => return Some(serde_json::from_str(&text).map_err(Into::into)),
            Ok(Message::Binary(data)) => return Some(serde_json::from_slice(&data).map_err(Into::into)),
            Ok(Message::Close(_)) => return None,
            Ok(_) => {}
            Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => return None,
            Err(err) => return Some(Err(err.into())),
        }
    }
    None
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, SignalingError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let body = response.bytes().await?;
    Err(http_error(status.as_u16(), &body))
}

/// Recovers the signaling error behind a failed HTTP exchange.
fn http_error(status: u16, body: &[u8]) -> SignalingError {
    let status = match serde_json::from_slice::<ErrorStatus>(body) {
        Ok(status) => Status::from(status),
        Err(_) => Status::new(
            code_for_http_status(status),
            String::from_utf8_lossy(body).into_owned(),
        ),
    };
    SignalingError::from_status(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpc_webrtc::Code;

    #[test_timeout::timeout]
    fn websocket_urls_follow_the_http_scheme() {
        let plain = SignalingClient::new("http://127.0.0.1:8080/").expect("client");
        assert_eq!(plain.ws_url("/ws/call"), "ws://127.0.0.1:8080/ws/call");
        let tls = SignalingClient::new("https://signal.example").expect("client");
        assert_eq!(tls.ws_url("/ws/answer"), "wss://signal.example/ws/answer");
        assert!(SignalingClient::new("signal.example").is_err());
    }

    #[test_timeout::timeout]
    fn http_errors_prefer_the_status_body() {
        let body = br#"{"code":"ResourceExhausted","message":"rate limit exceeded for Call:1.2.3.4"}"#;
        match http_error(429, body) {
            SignalingError::Remote(status) => {
                assert_eq!(status.code, Code::ResourceExhausted);
                assert!(status.message.contains("Call:1.2.3.4"));
            }
            other => panic!("unexpected {other:?}"),
        }
        match http_error(503, b"upstream down") {
            SignalingError::Remote(status) => {
                assert_eq!(status.code, Code::Unavailable);
                assert_eq!(status.message, "upstream down");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            http_error(499, br#"{"code":"Canceled","message":"gone"}"#),
            SignalingError::Cancelled
        );
    }
}

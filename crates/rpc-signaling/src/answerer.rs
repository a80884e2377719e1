//! Long-running answerer: claims offers for a host set and serves RPCs on every
//! data channel it negotiates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rpc_webrtc::rtc::{decode_sdp, encode_sdp};
use rpc_webrtc::workers::Workers;
use rpc_webrtc::{new_peer, Peer, Role, RtcConfig, ServerChannel, ServerOptions, Services, Status};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::client::SignalingClient;
use crate::config::{DEFAULT_EXCHANGE_DEADLINE, DEFAULT_RECONNECT_BACKOFF};
use crate::error::SignalingError;
use crate::proto::{
    AnswerRequest, AnswerRequestStage, AnswerResponse, AnswerResponseStage, ErrorStatus,
    WebRtcConfig,
};
use crate::server::SignalingServer;

/// One open Answer stream.
///
/// `requests` yields `None` when the stream ended cleanly; a terminal failure is
/// delivered as a single `Err` before that. Dropping `responses` stops sending
/// without closing the stream.
pub struct AnswerStream {
    pub requests: mpsc::UnboundedReceiver<Result<AnswerRequest, SignalingError>>,
    pub responses: mpsc::UnboundedSender<AnswerResponse>,
}

/// Dials the signaling service.
#[async_trait]
pub trait AnswerConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn AnswerConnection>, SignalingError>;
}

/// A live signaling connection that can open Answer streams.
#[async_trait]
pub trait AnswerConnection: Send + Sync {
    async fn open(&self, hosts: &[String]) -> Result<AnswerStream, SignalingError>;
    async fn close(&self);
}

/// Answers through a remote signaling server's WebSocket API.
#[derive(Debug, Clone)]
pub struct WebSocketAnswerConnector {
    base_url: String,
}

impl WebSocketAnswerConnector {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl AnswerConnector for WebSocketAnswerConnector {
    async fn connect(&self) -> Result<Box<dyn AnswerConnection>, SignalingError> {
        let client = SignalingClient::connect(self.base_url.clone()).await?;
        Ok(Box::new(client))
    }
}

/// Answers by driving an in-process [`SignalingServer`].
#[derive(Clone)]
pub struct LocalAnswerConnector {
    server: Arc<SignalingServer>,
}

impl LocalAnswerConnector {
    pub fn new(server: Arc<SignalingServer>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl AnswerConnector for LocalAnswerConnector {
    async fn connect(&self) -> Result<Box<dyn AnswerConnection>, SignalingError> {
        Ok(Box::new(LocalAnswerConnection {
            server: self.server.clone(),
            workers: Workers::new("local-answer", CancellationToken::new()),
        }))
    }
}

struct LocalAnswerConnection {
    server: Arc<SignalingServer>,
    workers: Workers,
}

#[async_trait]
impl AnswerConnection for LocalAnswerConnection {
    async fn open(&self, hosts: &[String]) -> Result<AnswerStream, SignalingError> {
        self.server.check_answer_hosts(hosts)?;
        let (request_tx, requests) = mpsc::unbounded_channel();
        let (responses, mut from_answerer) = mpsc::unbounded_channel();
        let server = self.server.clone();
        let hosts = hosts.to_vec();
        let spawned = self.workers.spawn_cancellable(async move {
            let (to_answerer, mut server_requests) = mpsc::unbounded_channel();
            let answering = server.answer(&hosts, &to_answerer, &mut from_answerer);
            tokio::pin!(answering);
            let mut detached = false;
            let mut drained = false;
            let result = loop {
                tokio::select! {
                    result = &mut answering => break result,
                    request = server_requests.recv(), if !drained => match request {
                        Some(request) => {
                            let _ = request_tx.send(Ok(request));
                        }
                        None => drained = true,
                    },
                    _ = request_tx.closed(), if !detached => {
                        detached = true;
                        server_requests.close();
                    }
                }
            };
            while let Ok(request) = server_requests.try_recv() {
                let _ = request_tx.send(Ok(request));
            }
            if let Err(err) = result {
                let _ = request_tx.send(Err(err));
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

    async fn close(&self) {
        self.workers.shutdown().await;
    }
}

#[derive(Clone)]
pub struct AnswererConfig {
    pub hosts: Vec<String>,
    pub reconnect_backoff: Duration,
    /// Upper bound for one negotiation; the offer's own deadline may cut it shorter.
    pub exchange_timeout: Duration,
    pub rtc: RtcConfig,
    pub services: Arc<Services>,
    pub server_options: ServerOptions,
}

impl AnswererConfig {
    pub fn new(hosts: Vec<String>, services: Arc<Services>) -> Self {
        Self {
            hosts,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            exchange_timeout: DEFAULT_EXCHANGE_DEADLINE,
            rtc: RtcConfig::default(),
            services,
            server_options: ServerOptions::default(),
        }
    }
}

impl std::fmt::Debug for AnswererConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnswererConfig")
            .field("hosts", &self.hosts)
            .field("reconnect_backoff", &self.reconnect_backoff)
            .field("exchange_timeout", &self.exchange_timeout)
            .field("services", &self.services)
            .finish_non_exhaustive()
    }
}

/// Background answer loop. Dropping it cancels the loop without waiting; call
/// [`Answerer::stop`] to wait for everything to unwind.
pub struct Answerer {
    inner: Arc<AnswererInner>,
}

struct AnswererInner {
    config: AnswererConfig,
    connector: Arc<dyn AnswerConnector>,
    workers: Workers,
    channels: Mutex<HashMap<u64, ServerChannel>>,
    next_channel: AtomicU64,
}

/// Offer fields the exchange needs after the Init stage was consumed.
struct OfferInit {
    uuid: String,
    sdp: String,
    optional_config: Option<WebRtcConfig>,
    disable_trickle: bool,
    deadline: chrono::DateTime<Utc>,
}

impl Answerer {
    pub fn start(connector: Arc<dyn AnswerConnector>, config: AnswererConfig) -> Self {
        let inner = Arc::new(AnswererInner {
            config,
            connector,
            workers: Workers::new("answerer", CancellationToken::new()),
            channels: Mutex::new(HashMap::new()),
            next_channel: AtomicU64::new(0),
        });
        let runner = inner.clone();
        inner.workers.spawn(async move { runner.run().await });
        Self { inner }
    }

    /// Data channels currently being served.
    pub fn active_channels(&self) -> usize {
        self.inner.channels.lock().len()
    }

    /// Cancels the loop, waits for in-flight exchanges, then closes every served channel.
    pub async fn stop(&self) {
        self.inner.workers.shutdown().await;
        let channels: Vec<ServerChannel> = self
            .inner
            .channels
            .lock()
            .drain()
            .map(|(_, channel)| channel)
            .collect();
        for channel in channels {
            channel.close().await;
        }
    }
}

impl Drop for Answerer {
    fn drop(&mut self) {
        self.inner.workers.cancel_token().cancel();
    }
}

/// Logs connection state transitions once instead of every retry.
#[derive(Default)]
struct LinkLog {
    failing: Option<String>,
}

impl LinkLog {
    fn connected(&mut self) {
        if let Some(previous) = self.failing.take() {
            info!(
                target = "rpc_signaling::answerer",
                previous_error = %previous,
                "signaling connection restored"
            );
        } else {
            debug!(target = "rpc_signaling::answerer", "signaling connected");
        }
    }

    fn failed(&mut self, err: &SignalingError) {
        let message = err.to_string();
        if self.failing.as_deref() == Some(message.as_str()) {
            trace!(
                target = "rpc_signaling::answerer",
                error = %message,
                "signaling still failing"
            );
            return;
        }
        if err.is_cancelled() {
            debug!(
                target = "rpc_signaling::answerer",
                "signaling cancelled remotely; reconnecting"
            );
        } else {
            warn!(
                target = "rpc_signaling::answerer",
                error = %message,
                "signaling connection failed; reconnecting"
            );
        }
        self.failing = Some(message);
    }
}

impl AnswererInner {
    async fn run(self: Arc<Self>) {
        let cancel = self.workers.cancel_token().clone();
        let mut log = LinkLog::default();
        loop {
            let connected = tokio::select! {
                _ = cancel.cancelled() => return,
                connected = self.connector.connect() => connected,
            };
            match connected {
                Ok(connection) => {
                    log.connected();
                    let outcome = self.serve_connection(&*connection, &cancel).await;
                    connection.close().await;
                    match outcome {
                        Ok(()) => return,
                        Err(err) => log.failed(&err),
                    }
                }
                Err(err) => log.failed(&err),
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.reconnect_backoff) => {}
            }
        }
    }

    /// Opens Answer streams until a failure needs a full reconnect. `Ok` means the
    /// answerer is stopping.
    async fn serve_connection(
        self: &Arc<Self>,
        connection: &dyn AnswerConnection,
        cancel: &CancellationToken,
    ) -> Result<(), SignalingError> {
        loop {
            let offered = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                offered = self.next_offer(connection) => offered,
            };
            match offered {
                Ok((offer, stream)) => {
                    let inner = self.clone();
                    self.workers
                        .spawn(async move { inner.exchange(offer, stream).await });
                }
                Err(SignalingError::StreamEnded) => {
                    trace!(
                        target = "rpc_signaling::answerer",
                        "answer stream ended; reopening"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn next_offer(&self, connection: &dyn AnswerConnection) -> Result<(OfferInit, AnswerStream), SignalingError> {
        let mut stream = connection.open(&self.config.hosts).await?;
        let request = match stream.requests.recv().await {
            Some(request) => request?,
            None => return Err(SignalingError::StreamEnded),
        };
        let AnswerRequestStage::Init {
            sdp,
            optional_config,
            disable_trickle,
            deadline,
        } = request.stage
        else {
            return Err(SignalingError::Protocol(
                "answer stream must start with an offer init".into(),
            ));
        };
        let offer = OfferInit {
            uuid: request.uuid,
            sdp,
            optional_config,
            disable_trickle,
            deadline,
        };
        Ok((offer, stream))
    }

    async fn exchange(self: Arc<Self>, offer: OfferInit, stream: AnswerStream) {
        let AnswerStream {
            mut requests,
            responses,
        } = stream;
        let reporter = AnswerReporter::new(offer.uuid.clone(), responses);
        let until_deadline = (offer.deadline - Utc::now()).to_std().unwrap_or_default();
        let timeout = until_deadline.min(self.config.exchange_timeout);

        let mut rtc = self.config.rtc.clone();
        if let Some(extra) = &offer.optional_config {
            rtc = rtc.with_additional_ice_servers(extra.rtc_ice_servers());
        }
        let peer = match new_peer(&rtc, Role::Answerer).await {
            Ok(peer) => peer,
            Err(err) => {
                let err = SignalingError::from(err);
                warn!(
                    target = "rpc_signaling::answerer",
                    uuid = %offer.uuid,
                    error = %err,
                    "could not create answering peer"
                );
                reporter.error(&err);
                return;
            }
        };

        let cancel = self.workers.cancel_token().clone();
        let negotiated = tokio::select! {
            _ = cancel.cancelled() => Err(SignalingError::Cancelled),
            result = tokio::time::timeout(timeout, negotiate(&peer, &offer, &mut requests, &reporter)) => {
                result.unwrap_or(Err(SignalingError::DeadlineExceeded))
            }
        };
        match negotiated {
            Ok(()) => {
                debug!(
                    target = "rpc_signaling::answerer",
                    uuid = %offer.uuid,
                    "data channel established"
                );
                let channel = ServerChannel::new(
                    peer.channel.clone(),
                    self.config.services.clone(),
                    self.config.server_options.clone(),
                );
                self.track(channel);
            }
            Err(err) => {
                if err.is_cancelled() {
                    debug!(
                        target = "rpc_signaling::answerer",
                        uuid = %offer.uuid,
                        "exchange cancelled"
                    );
                } else {
                    warn!(
                        target = "rpc_signaling::answerer",
                        uuid = %offer.uuid,
                        error = %err,
                        "exchange failed"
                    );
                }
                reporter.error(&err);
                peer.close().await;
            }
        }
    }

    fn track(self: &Arc<Self>, channel: ServerChannel) {
        let id = self.next_channel.fetch_add(1, Ordering::Relaxed);
        self.channels.lock().insert(id, channel.clone());
        let inner = self.clone();
        let cancel = self.workers.cancel_token().clone();
        self.workers.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = channel.closed() => {
                    inner.channels.lock().remove(&id);
                    trace!(
                        target = "rpc_signaling::answerer",
                        channel = id,
                        "served channel closed"
                    );
                }
            }
        });
    }
}

/// Sends the answerer's terminal Done or Error at most once.
struct AnswerReporter {
    uuid: String,
    responses: mpsc::UnboundedSender<AnswerResponse>,
    reported: AtomicBool,
}

impl AnswerReporter {
    fn new(uuid: String, responses: mpsc::UnboundedSender<AnswerResponse>) -> Self {
        Self {
            uuid,
            responses,
            reported: AtomicBool::new(false),
        }
    }

    fn send(&self, stage: AnswerResponseStage) -> Result<(), SignalingError> {
        self.responses
            .send(AnswerResponse {
                uuid: self.uuid.clone(),
                stage,
            })
            .map_err(|_| SignalingError::StreamEnded)
    }

    fn done(&self) -> Result<(), SignalingError> {
        if self.reported.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.send(AnswerResponseStage::Done)
    }

    fn error(&self, err: &SignalingError) {
        if self.reported.swap(true, Ordering::SeqCst) {
            return;
        }
        let status: ErrorStatus = Status::from(err.clone()).into();
        if self.send(AnswerResponseStage::Error { status }).is_err() {
            trace!(
                target = "rpc_signaling::answerer",
                uuid = %self.uuid,
                "answer stream gone before the failure was reported"
            );
        }
    }
}

async fn negotiate(
    peer: &Peer,
    offer: &OfferInit,
    requests: &mut mpsc::UnboundedReceiver<Result<AnswerRequest, SignalingError>>,
    reporter: &AnswerReporter,
) -> Result<(), SignalingError> {
    let trickle = !offer.disable_trickle;
    let mut local_candidates = peer.candidates();
    peer.set_remote_description(decode_sdp(&offer.sdp)?).await?;
    let answer = peer.local_description(trickle).await?;
    reporter.send(AnswerResponseStage::Init {
        sdp: encode_sdp(&answer)?,
    })?;

    // a non-trickle answer already carries every local candidate
    let mut gathered = !trickle;
    if gathered {
        reporter.done()?;
    }
    let mut caller_open = true;
    let mut ready = false;
    loop {
        if ready && gathered {
            return Ok(());
        }
        let step = tokio::select! {
            candidate = local_candidates.recv(), if !gathered => match candidate {
                Some(Some(candidate)) => reporter.send(AnswerResponseStage::Update {
                    candidate: candidate.into(),
                }),
                Some(None) | None => {
                    gathered = true;
                    reporter.done()
                }
            },
            request = requests.recv(), if caller_open => match request {
                None => {
                    caller_open = false;
                    Ok(())
                }
                Some(request) => apply_caller_request(peer, offer, request).await,
            },
            opened = peer.channel.ready(), if !ready => {
                opened?;
                ready = true;
                Ok(())
            }
        };
        if let Err(err) = step {
            if !ready {
                return Err(err);
            }
            // the channel is up; signaling has nothing left to decide
            debug!(
                target = "rpc_signaling::answerer",
                uuid = %offer.uuid,
                error = %err,
                "signaling ended after the channel opened"
            );
            return Ok(());
        }
    }
}

async fn apply_caller_request(
    peer: &Peer,
    offer: &OfferInit,
    request: Result<AnswerRequest, SignalingError>,
) -> Result<(), SignalingError> {
    let request = request?;
    if request.uuid != offer.uuid {
        return Err(SignalingError::Protocol(format!(
            "caller update for offer {} while answering {}",
            request.uuid, offer.uuid
        )));
    }
    match request.stage {
        AnswerRequestStage::Update { candidate } => {
            peer.add_remote_candidate(candidate.into()).await?;
        }
        AnswerRequestStage::Done => trace!(
            target = "rpc_signaling::answerer",
            uuid = %offer.uuid,
            "caller finished gathering"
        ),
        AnswerRequestStage::Error { status } => {
            return Err(SignalingError::from_status(status.into()));
        }
        AnswerRequestStage::Init { .. } => {
            return Err(SignalingError::Protocol("duplicate offer init".into()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SignalingConfig;
    use crate::queue::MemoryCallQueue;

    fn local_server(deadline: Duration) -> Arc<SignalingServer> {
        let config = SignalingConfig {
            exchange_deadline: deadline,
            ..SignalingConfig::default()
        };
        Arc::new(SignalingServer::new(Arc::new(MemoryCallQueue::new(deadline)), config))
    }

    #[test_timeout::timeout]
    fn reporter_sends_one_terminal_update() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reporter = AnswerReporter::new("offer-1".into(), tx);
        reporter.done().expect("done");
        reporter.error(&SignalingError::DeadlineExceeded);
        reporter.done().expect("repeat is a no-op");
        let first = rx.try_recv().expect("one update");
        assert_eq!(first.uuid, "offer-1");
        assert_eq!(first.stage, AnswerResponseStage::Done);
        assert!(rx.try_recv().is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn local_stream_reports_server_rejections() {
        let server = local_server(Duration::from_secs(5));
        let connection = LocalAnswerConnector::new(server)
            .connect()
            .await
            .expect("connect");
        let err = connection.open(&[]).await.err().expect("no hosts");
        assert!(matches!(err, SignalingError::InvalidArgument(_)));
        connection.close().await;
    }

    #[test_timeout::tokio_timeout_test]
    async fn dropping_a_local_stream_releases_the_waiting_answer() {
        let connection = LocalAnswerConnection {
            server: local_server(Duration::from_secs(5)),
            workers: Workers::new("local-answer-test", CancellationToken::new()),
        };
        let stream = connection.open(&["h1".to_string()]).await.expect("open");
        assert_eq!(connection.workers.len(), 1);
        drop(stream);
        while !connection.workers.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        connection.close().await;
        let err = connection.open(&["h1".to_string()]).await.err().expect("closed");
        assert_eq!(err, SignalingError::Cancelled);
    }

    #[test_timeout::tokio_timeout_test]
    async fn stop_unwinds_a_loop_that_cannot_connect() {
        struct Unreachable;

        #[async_trait]
        impl AnswerConnector for Unreachable {
            async fn connect(&self) -> Result<Box<dyn AnswerConnection>, SignalingError> {
                Err(SignalingError::Transport("connection refused".into()))
            }
        }

        let mut config = AnswererConfig::new(vec!["h1".into()], Arc::new(Services::new()));
        config.reconnect_backoff = Duration::from_millis(10);
        let answerer = Answerer::start(Arc::new(Unreachable), config);
        tokio::time::sleep(Duration::from_millis(50)).await;
        answerer.stop().await;
        assert_eq!(answerer.active_channels(), 0);
        assert!(answerer.inner.workers.is_empty());
    }

    /// Scripted signaling link: the first three streams end cleanly, the fourth
    /// open fails the link, and every later stream stays open.
    struct Scripted {
        events: Arc<Mutex<Vec<String>>>,
        opens: Arc<AtomicU64>,
        connects: AtomicU64,
        // keeps the idle streams open
        held: Arc<Mutex<Vec<mpsc::UnboundedSender<Result<AnswerRequest, SignalingError>>>>>,
    }

    struct ScriptedConnection {
        id: u64,
        events: Arc<Mutex<Vec<String>>>,
        opens: Arc<AtomicU64>,
        held: Arc<Mutex<Vec<mpsc::UnboundedSender<Result<AnswerRequest, SignalingError>>>>>,
    }

    #[async_trait]
    impl AnswerConnector for Scripted {
        async fn connect(&self) -> Result<Box<dyn AnswerConnection>, SignalingError> {
            let id = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
            self.events.lock().push(format!("connect {id}"));
            Ok(Box::new(ScriptedConnection {
                id,
                events: self.events.clone(),
                opens: self.opens.clone(),
                held: self.held.clone(),
            }))
        }
    }

    #[async_trait]
    impl AnswerConnection for ScriptedConnection {
        async fn open(&self, hosts: &[String]) -> Result<AnswerStream, SignalingError> {
            assert_eq!(hosts, ["h1".to_string()]);
            let n = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
            self.events.lock().push(format!("open {}", self.id));
            if n == 4 {
                return Err(SignalingError::Transport("link dropped".into()));
            }
            let (request_tx, requests) = mpsc::unbounded_channel();
            let (responses, _response_rx) = mpsc::unbounded_channel();
            if n > 4 {
                self.held.lock().push(request_tx);
            }
            Ok(AnswerStream {
                requests,
                responses,
            })
        }

        async fn close(&self) {
            self.events.lock().push(format!("close {}", self.id));
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn ended_streams_reopen_and_failures_reconnect_after_backoff() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let opens = Arc::new(AtomicU64::new(0));
        let connector = Scripted {
            events: events.clone(),
            opens: opens.clone(),
            connects: AtomicU64::new(0),
            held: Arc::new(Mutex::new(Vec::new())),
        };
        let backoff = Duration::from_millis(150);
        let mut config = AnswererConfig::new(vec!["h1".into()], Arc::new(Services::new()));
        config.reconnect_backoff = backoff;
        let answerer = Answerer::start(Arc::new(connector), config);

        while opens.load(Ordering::SeqCst) < 4 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let failed_at = tokio::time::Instant::now();
        while opens.load(Ordering::SeqCst) < 5 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(failed_at.elapsed() >= backoff - Duration::from_millis(20));

        answerer.stop().await;
        assert_eq!(
            *events.lock(),
            [
                "connect 1", "open 1", "open 1", "open 1", "open 1", "close 1",
                "connect 2", "open 2", "close 2",
            ]
        );
        assert!(answerer.inner.workers.is_empty());
    }
}

//! Signaling RPC surface over a [`CallQueue`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rpc_webrtc::Status;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::SignalingConfig;
use crate::dial::{CallEvents, CallSignaling};
use crate::error::SignalingError;
use crate::ice::{IceServerCache, IceServerProvider};
use crate::proto::{
    AnswerRequest, AnswerRequestStage, AnswerResponse, AnswerResponseStage, CallRequest,
    CallResponse, CallResponseStage, CallUpdate, CallUpdateRequest, CallUpdateResponse,
    IceCandidate, WebRtcConfig,
};
use crate::queue::{CallAnswer, CallQueue, OfferExchange, OfferHandle};

/// Extra time a call stream waits past the exchange deadline so the queue's own
/// verdict (offline or deadline exceeded) reaches the caller first.
const CALL_DEADLINE_GRACE: Duration = Duration::from_millis(500);

pub struct SignalingServer {
    queue: Arc<dyn CallQueue>,
    config: SignalingConfig,
    ice_provider: Option<Arc<dyn IceServerProvider>>,
    ice_cache: IceServerCache,
}

impl SignalingServer {
    pub fn new(queue: Arc<dyn CallQueue>, config: SignalingConfig) -> Self {
        Self {
            queue,
            ice_cache: IceServerCache::new(config.ice_cache_ttl),
            config,
            ice_provider: None,
        }
    }

    pub fn with_ice_provider(mut self, provider: Arc<dyn IceServerProvider>) -> Self {
        self.ice_provider = Some(provider);
        self
    }

    pub fn config(&self) -> &SignalingConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<dyn CallQueue> {
        &self.queue
    }

    pub(crate) fn single_host(hosts: &[String]) -> Result<&str, SignalingError> {
        match hosts {
            [host] => Ok(host),
            [] => Err(SignalingError::InvalidArgument(
                "expected a destination host".into(),
            )),
            _ => Err(SignalingError::InvalidArgument(format!(
                "expected exactly one destination host, got {}",
                hosts.len()
            ))),
        }
    }

    pub(crate) fn check_answer_hosts(&self, hosts: &[String]) -> Result<(), SignalingError> {
        if hosts.is_empty() {
            return Err(SignalingError::InvalidArgument(
                "expected at least one host to answer for".into(),
            ));
        }
        if hosts.len() > self.config.max_answer_hosts {
            return Err(SignalingError::InvalidArgument(format!(
                "too many hosts: {} > {}",
                hosts.len(),
                self.config.max_answer_hosts
            )));
        }
        Ok(())
    }

    /// Queues the offer and streams the answerer's init and candidates back.
    pub async fn call(&self, hosts: &[String], request: CallRequest) -> Result<CallStream, SignalingError> {
        let host = Self::single_host(hosts)?;
        let handle = self
            .queue
            .send_offer_init(host, &request.sdp, request.disable_trickle)
            .await?;
        debug!(
            target = "rpc_signaling::server",
            uuid = %handle.uuid,
            host,
            disable_trickle = request.disable_trickle,
            "call started"
        );
        Ok(CallStream {
            handle,
            deadline: Instant::now() + self.config.exchange_deadline + CALL_DEADLINE_GRACE,
            initialized: false,
            finished: false,
        })
    }

    pub async fn call_update(
        &self,
        hosts: &[String],
        request: CallUpdateRequest,
    ) -> Result<CallUpdateResponse, SignalingError> {
        let host = Self::single_host(hosts)?;
        match request.update {
            CallUpdate::Candidate { candidate } => {
                self.queue
                    .send_offer_update(host, &request.uuid, candidate)
                    .await?
            }
            CallUpdate::Done => self.queue.send_offer_done(host, &request.uuid).await?,
            CallUpdate::Error { status } => {
                let err = SignalingError::from_status(status.into());
                self.queue
                    .send_offer_error(host, &request.uuid, err)
                    .await?
            }
        }
        Ok(CallUpdateResponse::default())
    }

    /// Serves one offer to a connected answerer.
    ///
    /// Caller updates flow out through `to_answerer` while the answerer's responses
    /// are relayed into the queue. A failure on either side stops both relays, and the
    /// combined error is returned after being reported to the caller.
    pub async fn answer(
        &self,
        hosts: &[String],
        to_answerer: &mpsc::UnboundedSender<AnswerRequest>,
        from_answerer: &mut mpsc::UnboundedReceiver<AnswerResponse>,
    ) -> Result<(), SignalingError> {
        self.check_answer_hosts(hosts)?;
        let mut exchange = tokio::select! {
            exchange = self.queue.recv_offer(hosts) => exchange?,
            _ = to_answerer.closed() => return Err(SignalingError::Cancelled),
        };
        let uuid = exchange.uuid().to_string();
        let optional_config = match self.optional_webrtc_config(hosts).await {
            Ok(config) if !config.additional_ice_servers.is_empty() => Some(config),
            Ok(_) => None,
            Err(err) => {
                debug!(
                    target = "rpc_signaling::server",
                    uuid = %uuid,
                    error = %err,
                    "no optional webrtc config for answerer"
                );
                None
            }
        };
        let init = AnswerRequest {
            uuid: uuid.clone(),
            stage: AnswerRequestStage::Init {
                sdp: exchange.sdp().to_string(),
                optional_config,
                disable_trickle: exchange.disable_trickle(),
                deadline: exchange.deadline(),
            },
        };
        if to_answerer.send(init).is_err() {
            let err = SignalingError::Transport("answerer left before the offer was sent".into());
            let _ = exchange.answerer_respond(CallAnswer::Err(err.clone())).await;
            return Err(err);
        }
        debug!(
            target = "rpc_signaling::server",
            uuid = %uuid,
            "offer handed to answerer"
        );

        let remaining = (exchange.deadline() - chrono::Utc::now())
            .to_std()
            .unwrap_or_default();
        let deadline = Instant::now() + remaining;
        let candidates = exchange.take_caller_candidates();
        let cancel = CancellationToken::new();
        let caller_side = async {
            let result = relay_caller(&exchange, candidates, to_answerer, &cancel, deadline).await;
            if result.is_err() {
                cancel.cancel();
            }
            result
        };
        let answerer_side = async {
            let result = relay_answerer(&exchange, from_answerer, &cancel, deadline).await;
            if result.is_err() {
                cancel.cancel();
            }
            result
        };
        let (caller_result, answerer_result) = tokio::join!(caller_side, answerer_side);
        match SignalingError::combine([caller_result.err(), answerer_result.err()]) {
            None => {
                trace!(
                    target = "rpc_signaling::server",
                    uuid = %uuid,
                    "answer exchange complete"
                );
                Ok(())
            }
            Some(err) => {
                if let Err(report_err) = exchange.answerer_respond(CallAnswer::Err(err.clone())).await {
                    trace!(
                        target = "rpc_signaling::server",
                        uuid = %uuid,
                        error = %report_err,
                        "exchange already settled"
                    );
                }
                debug!(
                    target = "rpc_signaling::server",
                    uuid = %uuid,
                    error = %err,
                    "answer exchange failed"
                );
                Err(err)
            }
        }
    }

    /// Additional ICE servers for `hosts`, cached per host set.
    pub async fn optional_webrtc_config(&self, hosts: &[String]) -> Result<WebRtcConfig, SignalingError> {
        let Some(provider) = &self.ice_provider else {
            return Ok(WebRtcConfig::default());
        };
        if let Some(cached) = self.ice_cache.get(hosts) {
            return Ok(cached);
        }
        let config = WebRtcConfig {
            additional_ice_servers: provider.ice_servers(hosts).await?,
        };
        self.ice_cache.put(hosts, config.clone());
        Ok(config)
    }

    pub async fn close(&self) {
        self.queue.close().await;
    }
}

async fn relay_caller(
    exchange: &OfferExchange,
    candidates: Option<mpsc::UnboundedReceiver<IceCandidate>>,
    to_answerer: &mpsc::UnboundedSender<AnswerRequest>,
    cancel: &CancellationToken,
    deadline: Instant,
) -> Result<(), SignalingError> {
    let Some(mut candidates) = candidates else {
        return Err(SignalingError::Protocol(
            "caller candidates already consumed".into(),
        ));
    };
    let send = |stage: AnswerRequestStage| {
        to_answerer
            .send(AnswerRequest {
                uuid: exchange.uuid().to_string(),
                stage,
            })
            .map_err(|_| SignalingError::StreamEnded)
    };
    loop {
        let candidate = tokio::select! {
            _ = cancel.cancelled() => return Err(SignalingError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => return Err(SignalingError::DeadlineExceeded),
            candidate = candidates.recv() => candidate,
        };
        match candidate {
            Some(candidate) => send(AnswerRequestStage::Update { candidate })?,
            None => break,
        }
    }
    match exchange.caller_err() {
        Some(err) => send(AnswerRequestStage::Error {
            status: Status::from(err).into(),
        }),
        None => send(AnswerRequestStage::Done),
    }
}

async fn relay_answerer(
    exchange: &OfferExchange,
    from_answerer: &mut mpsc::UnboundedReceiver<AnswerResponse>,
    cancel: &CancellationToken,
    deadline: Instant,
) -> Result<(), SignalingError> {
    let mut initialized = false;
    loop {
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(SignalingError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => return Err(SignalingError::DeadlineExceeded),
            response = from_answerer.recv() => response,
        };
        let Some(response) = response else {
            return Err(SignalingError::StreamEnded);
        };
        if response.uuid != exchange.uuid() {
            return Err(SignalingError::Protocol(format!(
                "answer for offer {} while exchanging {}",
                response.uuid,
                exchange.uuid()
            )));
        }
        match response.stage {
            AnswerResponseStage::Init { sdp } => {
                if initialized {
                    return Err(SignalingError::Protocol("duplicate answer init".into()));
                }
                initialized = true;
                exchange.answerer_respond(CallAnswer::InitialSdp(sdp)).await?;
            }
            AnswerResponseStage::Update { candidate } => {
                if !initialized {
                    return Err(SignalingError::Protocol(
                        "answer candidate before init".into(),
                    ));
                }
                exchange
                    .answerer_respond(CallAnswer::Candidate(candidate))
                    .await?;
            }
            AnswerResponseStage::Done => {
                if !initialized {
                    return Err(SignalingError::Protocol("answer done before init".into()));
                }
                return exchange.answerer_done().await;
            }
            AnswerResponseStage::Error { status } => {
                let err = SignalingError::from_status(status.into());
                return exchange.answerer_respond(CallAnswer::Err(err)).await;
            }
        }
    }
}

/// The caller's side of a [`SignalingServer::call`].
///
/// Dropping the stream before the answerer finished cancels the offer.
pub struct CallStream {
    handle: OfferHandle,
    deadline: Instant,
    initialized: bool,
    finished: bool,
}

impl CallStream {
    pub fn uuid(&self) -> &str {
        &self.handle.uuid
    }

    /// Next stage for the caller; `None` once the answerer is done.
    pub async fn next(&mut self) -> Option<Result<CallResponse, SignalingError>> {
        if self.finished {
            return None;
        }
        let answer = tokio::select! {
            answer = self.handle.answers.recv() => answer,
            _ = tokio::time::sleep_until(self.deadline) => {
                self.finished = true;
                self.handle.cancel();
                return Some(Err(SignalingError::DeadlineExceeded));
            }
        };
        let uuid = self.handle.uuid.clone();
        let stage = match answer {
            None => {
                self.finished = true;
                if self.initialized {
                    return None;
                }
                return Some(Err(SignalingError::Protocol(
                    "answerer finished without an answer".into(),
                )));
            }
            Some(CallAnswer::Err(err)) => {
                self.finished = true;
                return Some(Err(err));
            }
            Some(CallAnswer::InitialSdp(sdp)) => {
                if self.initialized {
                    self.finished = true;
                    return Some(Err(SignalingError::Protocol("duplicate answer init".into())));
                }
                self.initialized = true;
                CallResponseStage::Init { sdp }
            }
            Some(CallAnswer::Candidate(candidate)) => {
                if !self.initialized {
                    self.finished = true;
                    return Some(Err(SignalingError::Protocol(
                        "answer candidate before init".into(),
                    )));
                }
                CallResponseStage::Update { candidate }
            }
        };
        Some(Ok(CallResponse { uuid, stage }))
    }
}

#[async_trait]
impl CallEvents for CallStream {
    async fn next(&mut self) -> Option<Result<CallResponse, SignalingError>> {
        CallStream::next(self).await
    }
}

#[async_trait]
impl CallSignaling for SignalingServer {
    async fn call(&self, host: &str, request: CallRequest) -> Result<Box<dyn CallEvents>, SignalingError> {
        let stream = SignalingServer::call(self, &[host.to_string()], request).await?;
        Ok(Box::new(stream))
    }

    async fn call_update(&self, host: &str, request: CallUpdateRequest) -> Result<(), SignalingError> {
        SignalingServer::call_update(self, &[host.to_string()], request)
            .await
            .map(|_| ())
    }

    async fn optional_webrtc_config(&self, host: &str) -> Result<WebRtcConfig, SignalingError> {
        SignalingServer::optional_webrtc_config(self, &[host.to_string()]).await
    }
}

//! Caller side: negotiate a data channel to a host through signaling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use rpc_webrtc::rtc::{decode_sdp, encode_sdp};
use rpc_webrtc::{new_peer, ClientChannel, Peer, Role, RtcConfig, Status};
use tracing::{debug, trace};

use crate::config::DEFAULT_EXCHANGE_DEADLINE;
use crate::error::SignalingError;
use crate::proto::{
    CallRequest, CallResponse, CallResponseStage, CallUpdate, CallUpdateRequest, ErrorStatus,
    WebRtcConfig,
};

/// Answerer stages for one call.
#[async_trait]
pub trait CallEvents: Send {
    /// `None` once the answerer is done.
    async fn next(&mut self) -> Option<Result<CallResponse, SignalingError>>;
}

/// The caller-facing half of the signaling surface, remote or in-process.
#[async_trait]
pub trait CallSignaling: Send + Sync {
    async fn call(&self, host: &str, request: CallRequest) -> Result<Box<dyn CallEvents>, SignalingError>;
    async fn call_update(&self, host: &str, request: CallUpdateRequest) -> Result<(), SignalingError>;
    async fn optional_webrtc_config(&self, host: &str) -> Result<WebRtcConfig, SignalingError>;
}

#[derive(Debug, Clone)]
pub struct DialOptions {
    pub rtc: RtcConfig,
    pub disable_trickle: bool,
    pub timeout: Duration,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            rtc: RtcConfig::default(),
            disable_trickle: false,
            timeout: DEFAULT_EXCHANGE_DEADLINE,
        }
    }
}

/// Reports the caller's terminal update exactly once.
struct CallReporter<'a> {
    signaling: &'a dyn CallSignaling,
    host: &'a str,
    uuid: OnceLock<String>,
    reported: AtomicBool,
}

impl<'a> CallReporter<'a> {
    fn new(signaling: &'a dyn CallSignaling, host: &'a str) -> Self {
        Self {
            signaling,
            host,
            uuid: OnceLock::new(),
            reported: AtomicBool::new(false),
        }
    }

    async fn send(&self, update: CallUpdate) -> Result<(), SignalingError> {
        let Some(uuid) = self.uuid.get() else {
            return Ok(());
        };
        self.signaling
            .call_update(
                self.host,
                CallUpdateRequest {
                    uuid: uuid.clone(),
                    update,
                },
            )
            .await
    }

    async fn done(&self) -> Result<(), SignalingError> {
        if self.reported.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.send(CallUpdate::Done).await
    }

    async fn error(&self, err: &SignalingError) {
        if self.reported.swap(true, Ordering::SeqCst) {
            return;
        }
        let status: ErrorStatus = Status::from(err.clone()).into();
        if let Err(report_err) = self.send(CallUpdate::Error { status }).await {
            trace!(
                target = "rpc_signaling::dial",
                host = self.host,
                error = %report_err,
                "could not report dial failure"
            );
        }
    }
}

/// Negotiates a data channel with an answerer for `host` and returns an RPC client on it.
pub async fn dial(
    signaling: &dyn CallSignaling,
    host: &str,
    options: DialOptions,
) -> Result<ClientChannel, SignalingError> {
    let mut rtc = options.rtc.clone();
    match signaling.optional_webrtc_config(host).await {
        Ok(extra) => rtc = rtc.with_additional_ice_servers(extra.rtc_ice_servers()),
        Err(err) => debug!(
            target = "rpc_signaling::dial",
            host,
            error = %err,
            "continuing without optional webrtc config"
        ),
    }
    let peer = new_peer(&rtc, Role::Offerer).await?;
    let reporter = CallReporter::new(signaling, host);
    let negotiated = tokio::time::timeout(
        options.timeout,
        negotiate(signaling, host, &peer, options.disable_trickle, &reporter),
    )
    .await
    .unwrap_or(Err(SignalingError::DeadlineExceeded));
    match negotiated {
        Ok(()) => {
            debug!(
                target = "rpc_signaling::dial",
                host,
                uuid = reporter.uuid.get().map(String::as_str).unwrap_or_default(),
                "data channel established"
            );
            Ok(ClientChannel::new(peer.channel.clone()))
        }
        Err(err) => {
            reporter.error(&err).await;
            peer.close().await;
            Err(err)
        }
    }
}

async fn negotiate(
    signaling: &dyn CallSignaling,
    host: &str,
    peer: &Peer,
    disable_trickle: bool,
    reporter: &CallReporter<'_>,
) -> Result<(), SignalingError> {
    let trickle = !disable_trickle;
    let mut local_candidates = peer.candidates();
    let offer = peer.local_description(trickle).await?;
    let mut answers = signaling
        .call(
            host,
            CallRequest {
                sdp: encode_sdp(&offer)?,
                disable_trickle,
            },
        )
        .await?;

    let first = answers
        .next()
        .await
        .ok_or_else(|| SignalingError::Protocol("call ended before an answer".into()))??;
    let uuid = first.uuid.clone();
    let _ = reporter.uuid.set(uuid.clone());
    let CallResponseStage::Init { sdp } = first.stage else {
        return Err(SignalingError::Protocol("answer candidate before init".into()));
    };
    peer.set_remote_description(decode_sdp(&sdp)?).await?;

    // without trickle the offer already carried every local candidate
    let mut gathered = !trickle;
    if gathered {
        reporter.done().await?;
    }
    let mut answers_open = true;
    let mut ready = false;
    loop {
        if ready && gathered {
            return Ok(());
        }
        let step = tokio::select! {
            candidate = local_candidates.recv(), if !gathered => match candidate {
                Some(Some(candidate)) => {
                    signaling
                        .call_update(
                            host,
                            CallUpdateRequest {
                                uuid: uuid.clone(),
                                update: CallUpdate::Candidate { candidate: candidate.into() },
                            },
                        )
                        .await
                }
                Some(None) | None => {
                    gathered = true;
                    reporter.done().await
                }
            },
            event = answers.next(), if answers_open => match event {
                None => {
                    answers_open = false;
                    Ok(())
                }
                Some(Err(err)) => Err(err),
                Some(Ok(response)) => match response.stage {
                    CallResponseStage::Update { candidate } => peer
                        .add_remote_candidate(candidate.into())
                        .await
                        .map_err(SignalingError::from),
                    CallResponseStage::Init { .. } => {
                        Err(SignalingError::Protocol("duplicate answer init".into()))
                    }
                },
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
            debug!(
                target = "rpc_signaling::dial",
                host,
                uuid = %uuid,
                error = %err,
                "signaling ended after the channel opened"
            );
            return Ok(());
        }
    }
}

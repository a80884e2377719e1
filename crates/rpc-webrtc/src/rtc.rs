use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, trace};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::util::vnet::net::{Net, NetConfig};
use webrtc::util::vnet::router::{Router, RouterConfig};

use crate::channel::{is_benign_error, BaseChannel, ChannelError, DataPipe};
use crate::config::RtcConfig;

/// Id of the pre-negotiated data channel both peers create out of band.
pub const DATA_CHANNEL_ID: u16 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Creates the offer (the calling side).
    Offerer,
    /// Answers an offer (the serving side).
    Answerer,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Offerer => "offerer",
            Role::Answerer => "answerer",
        }
    }
}

/// One peer connection with its data channel already wrapped in a `BaseChannel`.
pub struct Peer {
    pub role: Role,
    pub pc: Arc<RTCPeerConnection>,
    pub dc: Arc<RTCDataChannel>,
    pub channel: Arc<BaseChannel>,
}

impl Peer {
    /// Local candidates as they are gathered; `None` marks the end of gathering.
    pub fn candidates(&self) -> mpsc::UnboundedReceiver<Option<RTCIceCandidateInit>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let role = self.role;
        self.pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                match candidate {
                    Some(candidate) => match candidate.to_json() {
                        Ok(init) => {
                            let _ = tx.send(Some(init));
                        }
                        Err(err) => debug!(
                            target = "rpc_webrtc::rtc",
                            role = role.as_str(),
                            error = %err,
                            "failed to serialise local candidate"
                        ),
                    },
                    None => {
                        let _ = tx.send(None);
                    }
                }
            })
        }));
        rx
    }

    /// Creates and applies the local offer or answer. Without trickle the call waits
    /// for ICE gathering so the returned description carries every candidate.
    pub async fn local_description(&self, trickle: bool) -> Result<RTCSessionDescription, ChannelError> {
        let desc = match self.role {
            Role::Offerer => self.pc.create_offer(None).await,
            Role::Answerer => self.pc.create_answer(None).await,
        }
        .map_err(transport_error)?;
        let gathering = if trickle {
            None
        } else {
            Some(self.pc.gathering_complete_promise().await)
        };
        self.pc
            .set_local_description(desc)
            .await
            .map_err(transport_error)?;
        if let Some(gathering) = gathering {
            wait_for_gathering(self.role, gathering).await;
        }
        self.pc
            .local_description()
            .await
            .ok_or_else(|| ChannelError::Transport("missing local description".into()))
    }

    pub async fn set_remote_description(&self, desc: RTCSessionDescription) -> Result<(), ChannelError> {
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(transport_error)
    }

    pub async fn add_remote_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), ChannelError> {
        self.pc
            .add_ice_candidate(candidate)
            .await
            .map_err(transport_error)
    }

    /// Closes the channel and the peer connection behind it.
    pub async fn close(&self) {
        self.channel.close().await;
    }
}

async fn wait_for_gathering(role: Role, mut gathering: mpsc::Receiver<()>) {
    trace!(
        target = "rpc_webrtc::rtc",
        role = role.as_str(),
        await = "pc.gathering_complete_promise",
        state = "start"
    );
    let _ = gathering.recv().await;
    trace!(
        target = "rpc_webrtc::rtc",
        role = role.as_str(),
        await = "pc.gathering_complete_promise",
        state = "end"
    );
}

pub fn build_api(setting: SettingEngine) -> Result<API, ChannelError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(transport_error)?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(transport_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Builds a peer connection plus the negotiated, ordered data channel and wires
/// every event into a fresh `BaseChannel`.
pub async fn new_peer(config: &RtcConfig, role: Role) -> Result<Peer, ChannelError> {
    let api = build_api(config.build_setting_engine())?;
    let rtc_config = RTCConfiguration {
        ice_servers: config.ice_servers.clone(),
        ..Default::default()
    };
    let pc = Arc::new(
        api.new_peer_connection(rtc_config)
            .await
            .map_err(transport_error)?,
    );
    let init = RTCDataChannelInit {
        ordered: Some(true),
        negotiated: Some(DATA_CHANNEL_ID),
        ..Default::default()
    };
    let dc = match pc
        .create_data_channel(&config.data_channel_label, Some(init))
        .await
    {
        Ok(dc) => dc,
        Err(err) => {
            let _ = pc.close().await;
            return Err(transport_error(err));
        }
    };
    let pipe = Arc::new(RtcPipe {
        pc: pc.clone(),
        dc: dc.clone(),
    });
    let channel = BaseChannel::new(pipe, config.limits);
    attach(&channel, &pc, &dc).await;
    trace!(
        target = "rpc_webrtc::rtc",
        role = role.as_str(),
        label = %config.data_channel_label,
        "peer created"
    );
    Ok(Peer {
        role,
        pc,
        dc,
        channel,
    })
}

/// Registers the peer connection and data channel callbacks. Handlers hold a weak
/// reference so a dropped channel does not stay alive through its own callbacks.
pub async fn attach(channel: &Arc<BaseChannel>, pc: &Arc<RTCPeerConnection>, dc: &Arc<RTCDataChannel>) {
    let weak = Arc::downgrade(channel);

    let open = weak.clone();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            if let Some(channel) = open.upgrade() {
                channel.handle_open();
            }
        })
    }));

    let closed = weak.clone();
    dc.on_close(Box::new(move || {
        let closed = closed.clone();
        Box::pin(async move {
            if let Some(channel) = closed.upgrade() {
                channel.handle_close();
            }
        })
    }));

    let inbound = weak.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let inbound = inbound.clone();
        Box::pin(async move {
            if let Some(channel) = inbound.upgrade() {
                channel.handle_message(msg.data);
            }
        })
    }));

    dc.set_buffered_amount_low_threshold(channel.limits().low_water)
        .await;
    let low = weak.clone();
    dc.on_buffered_amount_low(Box::new(move || {
        let low = low.clone();
        Box::pin(async move {
            if let Some(channel) = low.upgrade() {
                channel.handle_buffered_low();
            }
        })
    }))
    .await;

    let ice: Weak<BaseChannel> = weak;
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let ice = ice.clone();
        Box::pin(async move {
            if let Some(channel) = ice.upgrade() {
                channel.handle_ice_state(state);
            }
        })
    }));

    if dc.ready_state() == RTCDataChannelState::Open {
        channel.handle_open();
    }
}

struct RtcPipe {
    pc: Arc<RTCPeerConnection>,
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataPipe for RtcPipe {
    async fn send(&self, data: Bytes) -> Result<(), ChannelError> {
        self.dc
            .send(&data)
            .await
            .map(|_| ())
            .map_err(transport_error)
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn close(&self) -> Result<(), ChannelError> {
        if let Err(err) = self.dc.close().await {
            let message = err.to_string();
            if !is_benign_error(&message) {
                debug!(target = "rpc_webrtc::rtc", error = %message, "data channel close failed");
            }
        }
        self.pc.close().await.map_err(transport_error)
    }
}

/// Serialises a session description for signaling: base64 over JSON.
pub fn encode_sdp(desc: &RTCSessionDescription) -> Result<String, ChannelError> {
    let json = serde_json::to_vec(desc)
        .map_err(|err| ChannelError::Transport(format!("encode sdp: {err}")))?;
    Ok(BASE64.encode(json))
}

pub fn decode_sdp(encoded: &str) -> Result<RTCSessionDescription, ChannelError> {
    let json = BASE64
        .decode(encoded.trim())
        .map_err(|err| ChannelError::Transport(format!("decode sdp: {err}")))?;
    serde_json::from_slice(&json).map_err(|err| ChannelError::Transport(format!("decode sdp: {err}")))
}

fn transport_error<E: std::fmt::Display>(err: E) -> ChannelError {
    ChannelError::Transport(err.to_string())
}

/// Virtual network connecting peers in-process, for tests and local demos.
pub struct VirtualNetwork {
    router: Arc<AsyncMutex<Router>>,
}

impl VirtualNetwork {
    /// Creates a router on 10.0.0.0/24 with one host per address and returns a
    /// peer configuration bound to each host, in order.
    pub async fn new(ips: &[&str]) -> Result<(Self, Vec<RtcConfig>), ChannelError> {
        let router = Arc::new(AsyncMutex::new(
            Router::new(RouterConfig {
                cidr: "10.0.0.0/24".to_owned(),
                ..Default::default()
            })
            .map_err(transport_error)?,
        ));
        let mut configs = Vec::with_capacity(ips.len());
        for ip in ips {
            let net = Arc::new(Net::new(Some(NetConfig {
                static_ips: vec![(*ip).to_owned()],
                ..Default::default()
            })));
            attach_net(&net, &router).await?;
            configs.push(RtcConfig::local_only().with_setting_engine(move || {
                let mut setting = SettingEngine::default();
                setting.set_vnet(Some(net.clone()));
                setting.set_ice_timeouts(
                    Some(Duration::from_secs(1)),
                    Some(Duration::from_secs(1)),
                    Some(Duration::from_millis(200)),
                );
                setting
            }));
        }
        router.lock().await.start().await.map_err(transport_error)?;
        Ok((Self { router }, configs))
    }

    pub async fn stop(&self) {
        if let Err(err) = self.router.lock().await.stop().await {
            debug!(target = "rpc_webrtc::rtc", error = %err, "virtual router stop failed");
        }
    }
}

async fn attach_net(net: &Arc<Net>, router: &Arc<AsyncMutex<Router>>) -> Result<(), ChannelError> {
    let nic = net.get_nic().map_err(transport_error)?;
    {
        let mut router_guard = router.lock().await;
        router_guard
            .add_net(Arc::clone(&nic))
            .await
            .map_err(transport_error)?;
    }
    let nic_guard = nic.lock().await;
    nic_guard
        .set_router(Arc::clone(router))
        .await
        .map_err(transport_error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;

    #[test_timeout::timeout]
    fn sdp_survives_signaling_encoding() {
        let desc =
            RTCSessionDescription::offer("v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n".to_string())
                .expect("offer");
        let encoded = encode_sdp(&desc).expect("encode");
        assert!(!encoded.contains('{'));
        let decoded = decode_sdp(&encoded).expect("decode");
        assert_eq!(decoded.sdp_type, RTCSdpType::Offer);
        assert_eq!(decoded.sdp, desc.sdp);
    }

    #[test_timeout::timeout]
    fn garbage_sdp_is_rejected() {
        assert!(decode_sdp("not base64!").is_err());
        assert!(decode_sdp(&BASE64.encode(b"{\"type\":\"bogus\"}")).is_err());
    }
}

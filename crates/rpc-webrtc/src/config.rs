use std::fmt;
use std::sync::Arc;

use tracing::warn;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::ice_transport::ice_server::RTCIceServer;

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_DATA_CHANNEL_LABEL: &str = "data";
pub const DEFAULT_MAX_CONCURRENT_STREAMS: usize = 256;
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 32 * 1024 * 1024;
pub const DEFAULT_HIGH_WATER: usize = 1024 * 1024;
pub const DEFAULT_LOW_WATER: usize = 256 * 1024;

const ENV_DISABLE_STUN: &str = "RPC_WEBRTC_DISABLE_STUN";
const ENV_STUN_URLS: &str = "RPC_WEBRTC_STUN_URLS";

/// Builds a fresh `SettingEngine` for each peer connection.
pub type SettingEngineFactory = Arc<dyn Fn() -> SettingEngine + Send + Sync>;

/// Peer connection configuration shared by callers and answerers.
#[derive(Clone)]
pub struct RtcConfig {
    pub ice_servers: Vec<RTCIceServer>,
    pub data_channel_label: String,
    /// Overrides the default setting engine, e.g. to attach a virtual network.
    pub setting_engine: Option<SettingEngineFactory>,
    pub limits: ChannelLimits,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![RTCIceServer {
                urls: vec![DEFAULT_STUN_URL.to_string()],
                ..Default::default()
            }],
            data_channel_label: DEFAULT_DATA_CHANNEL_LABEL.to_string(),
            setting_engine: None,
            limits: ChannelLimits::default(),
        }
    }
}

impl fmt::Debug for RtcConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtcConfig")
            .field("ice_servers", &self.ice_servers)
            .field("data_channel_label", &self.data_channel_label)
            .field("custom_setting_engine", &self.setting_engine.is_some())
            .field("limits", &self.limits)
            .finish()
    }
}

impl RtcConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if std::env::var(ENV_DISABLE_STUN)
            .map(|value| parse_flag(&value))
            .unwrap_or(false)
        {
            config.ice_servers.clear();
            return config;
        }
        if let Ok(raw) = std::env::var(ENV_STUN_URLS) {
            let urls = parse_url_list(&raw);
            if urls.is_empty() {
                warn!(
                    target = "rpc_webrtc::config",
                    var = ENV_STUN_URLS,
                    "no usable STUN urls in env; keeping default"
                );
            } else {
                config.ice_servers = vec![RTCIceServer {
                    urls,
                    ..Default::default()
                }];
            }
        }
        config
    }

    /// Configuration without any STUN/TURN servers, for loopback and virtual networks.
    pub fn local_only() -> Self {
        Self {
            ice_servers: Vec::new(),
            ..Self::default()
        }
    }

    pub fn with_setting_engine<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> SettingEngine + Send + Sync + 'static,
    {
        self.setting_engine = Some(Arc::new(factory));
        self
    }

    pub fn with_additional_ice_servers(mut self, servers: Vec<RTCIceServer>) -> Self {
        self.ice_servers.extend(servers);
        self
    }

    pub(crate) fn build_setting_engine(&self) -> SettingEngine {
        match &self.setting_engine {
            Some(factory) => factory(),
            None => SettingEngine::default(),
        }
    }
}

/// Per-channel resource limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelLimits {
    pub max_concurrent_streams: usize,
    pub max_message_bytes: usize,
    pub high_water: usize,
    pub low_water: usize,
}

impl Default for ChannelLimits {
    fn default() -> Self {
        Self {
            max_concurrent_streams: DEFAULT_MAX_CONCURRENT_STREAMS,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            high_water: DEFAULT_HIGH_WATER,
            low_water: DEFAULT_LOW_WATER,
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_url_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|url| url.starts_with("stun:") || url.starts_with("turn:") || url.starts_with("turns:"))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn parses_flags_like_the_shell_does() {
        assert!(parse_flag(" TRUE "));
        assert!(parse_flag("1"));
        assert!(!parse_flag("0"));
        assert!(!parse_flag("nope"));
    }

    #[test_timeout::timeout]
    fn url_list_drops_garbage() {
        let urls = parse_url_list("stun:a.example:3478, http://bad, ,turn:b.example");
        assert_eq!(urls, vec!["stun:a.example:3478", "turn:b.example"]);
    }

    #[test_timeout::timeout]
    fn defaults_match_documented_limits() {
        let limits = ChannelLimits::default();
        assert_eq!(limits.max_concurrent_streams, 256);
        assert_eq!(limits.max_message_bytes, 32 << 20);
        assert!(limits.low_water < limits.high_water);
        assert_eq!(RtcConfig::local_only().ice_servers.len(), 0);
    }
}

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::SignalingError;
use crate::proto::{IceServer, WebRtcConfig};

/// Supplies extra ICE servers (typically TURN credentials) for a destination host set.
#[async_trait]
pub trait IceServerProvider: Send + Sync {
    async fn ice_servers(&self, hosts: &[String]) -> Result<Vec<IceServer>, SignalingError>;
}

/// The same servers for every host set.
#[derive(Debug, Clone, Default)]
pub struct StaticIceServers(pub Vec<IceServer>);

#[async_trait]
impl IceServerProvider for StaticIceServers {
    async fn ice_servers(&self, _hosts: &[String]) -> Result<Vec<IceServer>, SignalingError> {
        Ok(self.0.clone())
    }
}

/// Per host set cache of provider answers.
pub struct IceServerCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, WebRtcConfig)>>,
}

impl IceServerCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn key(hosts: &[String]) -> String {
        let mut sorted: Vec<&str> = hosts.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        sorted.dedup();
        sorted.join(",")
    }

    pub fn get(&self, hosts: &[String]) -> Option<WebRtcConfig> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, (expires_at, _)| *expires_at > now);
        entries.get(&Self::key(hosts)).map(|(_, config)| config.clone())
    }

    pub fn put(&self, hosts: &[String], config: WebRtcConfig) {
        self.entries
            .lock()
            .insert(Self::key(hosts), (Instant::now() + self.ttl, config));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(list: &[&str]) -> Vec<String> {
        list.iter().map(|h| h.to_string()).collect()
    }

    fn config(url: &str) -> WebRtcConfig {
        WebRtcConfig {
            additional_ice_servers: vec![IceServer {
                urls: vec![url.to_string()],
                ..Default::default()
            }],
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn entries_are_keyed_by_host_set_and_expire() {
        tokio::time::pause();
        let cache = IceServerCache::new(Duration::from_secs(60));
        cache.put(&hosts(&["b", "a"]), config("turn:one"));
        assert_eq!(cache.get(&hosts(&["a", "b"])), Some(config("turn:one")));
        assert_eq!(cache.get(&hosts(&["a"])), None);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get(&hosts(&["a", "b"])), None);
    }
}

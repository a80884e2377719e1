use std::time::Duration;

pub const DEFAULT_EXCHANGE_DEADLINE: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_ANSWER_HOSTS: usize = 32;
pub const DEFAULT_ICE_CACHE_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Metadata key (and HTTP header) naming the destination host(s) of a call.
pub const HOST_METADATA_KEY: &str = "rpc-host";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingConfig {
    /// Bounds a whole offer/answer exchange, including how long an offer waits for an answerer.
    pub exchange_deadline: Duration,
    pub max_answer_hosts: usize,
    pub ice_cache_ttl: Duration,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            exchange_deadline: DEFAULT_EXCHANGE_DEADLINE,
            max_answer_hosts: DEFAULT_MAX_ANSWER_HOSTS,
            ice_cache_ttl: DEFAULT_ICE_CACHE_TTL,
        }
    }
}

/// Splits `rpc-host` values, accepting repeated headers as well as comma separated lists.
pub fn parse_hosts<'a>(values: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut hosts = Vec::new();
    for value in values {
        for host in value.split(',') {
            let host = host.trim();
            if !host.is_empty() && !hosts.iter().any(|h| h == host) {
                hosts.push(host.to_string());
            }
        }
    }
    hosts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn parses_repeated_and_comma_separated_hosts() {
        assert_eq!(
            parse_hosts(["h1, h2", "h3", "", " h1 "]),
            vec!["h1".to_string(), "h2".to_string(), "h3".to_string()]
        );
        assert!(parse_hosts([" , "]).is_empty());
    }

    #[test_timeout::timeout]
    fn defaults_match_documented_constants() {
        let config = SignalingConfig::default();
        assert_eq!(config.exchange_deadline, Duration::from_secs(10));
        assert_eq!(config.max_answer_hosts, 32);
        assert_eq!(config.ice_cache_ttl, Duration::from_secs(60));
    }
}

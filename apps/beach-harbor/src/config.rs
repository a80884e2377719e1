use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use rpc_signaling::SignalingConfig;

#[derive(Parser, Debug)]
#[command(name = "beach-harbor")]
#[command(about = "Signaling host for rpc-webrtc callers and answerers")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Probe a running harbor's health endpoint
    Check {
        /// Harbor base URL
        #[arg(short, long, default_value = "http://localhost:8090")]
        url: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum QueueBackend {
    Memory,
    Redis,
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    #[arg(long, env = "HARBOR_PORT", default_value_t = 8090)]
    pub port: u16,

    /// Where pending offers live; `redis` lets several harbors share them
    #[arg(long, env = "HARBOR_QUEUE", value_enum, default_value_t = QueueBackend::Memory)]
    pub queue: QueueBackend,

    #[arg(long, env = "REDIS_URL", default_value = "redis://localhost:6379")]
    pub redis_url: String,

    #[arg(long, env = "HARBOR_KEY_PREFIX", default_value = "harbor")]
    pub key_prefix: String,

    #[arg(long, env = "HARBOR_EXCHANGE_DEADLINE_SECS", default_value_t = 10)]
    pub exchange_deadline_secs: u64,

    /// Calls and answers admitted per caller and window; 0 disables limiting
    #[arg(long, env = "HARBOR_RATE_LIMIT", default_value_t = 0)]
    pub rate_limit: usize,

    #[arg(long, env = "HARBOR_RATE_WINDOW_SECS", default_value_t = 60)]
    pub rate_window_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimit {
    pub limit: usize,
    pub window: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub queue: QueueBackend,
    pub redis_url: String,
    pub key_prefix: String,
    pub signaling: SignalingConfig,
    pub rate_limit: Option<RateLimit>,
}

impl Config {
    pub fn from_args(args: ServeArgs) -> Result<Self> {
        if args.exchange_deadline_secs == 0 {
            bail!("HARBOR_EXCHANGE_DEADLINE_SECS must be positive");
        }
        let rate_limit = match args.rate_limit {
            0 => None,
            limit => {
                if args.rate_window_secs == 0 {
                    bail!("HARBOR_RATE_WINDOW_SECS must be positive when rate limiting");
                }
                Some(RateLimit {
                    limit,
                    window: Duration::from_secs(args.rate_window_secs),
                })
            }
        };
        Ok(Self {
            port: args.port,
            queue: args.queue,
            redis_url: args.redis_url,
            key_prefix: args.key_prefix,
            signaling: SignalingConfig {
                exchange_deadline: Duration::from_secs(args.exchange_deadline_secs),
                ..SignalingConfig::default()
            },
            rate_limit,
        })
    }

    /// The rate limiter shares the queue's backend.
    pub fn uses_redis(&self) -> bool {
        self.queue == QueueBackend::Redis
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("beach-harbor").chain(args.iter().copied()))
            .expect("arguments parse")
    }

    #[test_timeout::timeout]
    fn flags_override_defaults() {
        let cli = parse(&[
            "--port",
            "9000",
            "--queue",
            "redis",
            "--key-prefix",
            "harbor-test",
            "--exchange-deadline-secs",
            "3",
            "--rate-limit",
            "5",
            "--rate-window-secs",
            "30",
        ]);
        assert!(cli.command.is_none());
        let config = Config::from_args(cli.serve).expect("config");
        assert_eq!(config.port, 9000);
        assert!(config.uses_redis());
        assert_eq!(config.key_prefix, "harbor-test");
        assert_eq!(config.signaling.exchange_deadline, Duration::from_secs(3));
        assert_eq!(
            config.rate_limit,
            Some(RateLimit {
                limit: 5,
                window: Duration::from_secs(30)
            })
        );
    }

    #[test_timeout::timeout]
    fn zero_rate_limit_disables_limiting() {
        let cli = parse(&["--rate-limit", "0", "--queue", "memory"]);
        let config = Config::from_args(cli.serve).expect("config");
        assert_eq!(config.rate_limit, None);
        assert!(!config.uses_redis());
    }

    #[test_timeout::timeout]
    fn invalid_windows_are_rejected() {
        let cli = parse(&["--exchange-deadline-secs", "0"]);
        assert!(Config::from_args(cli.serve).is_err());
        let cli = parse(&["--rate-limit", "2", "--rate-window-secs", "0"]);
        assert!(Config::from_args(cli.serve).is_err());
    }

    #[test_timeout::timeout]
    fn check_subcommand_takes_a_url() {
        let cli = parse(&["check", "--url", "http://harbor.internal:8090"]);
        match cli.command {
            Some(Commands::Check { url }) => assert_eq!(url, "http://harbor.internal:8090"),
            other => panic!("unexpected {other:?}"),
        }
    }
}

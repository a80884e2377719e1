//! Sliding-window admission checks keyed by caller identity.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use tracing::warn;
use uuid::Uuid;

use crate::error::SignalingError;

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// `Err(RateLimited)` when `key` already used its budget for the current window.
    async fn allow(&self, key: &str) -> Result<(), SignalingError>;
}

/// Builds the limiter key for one signaling method and caller.
pub fn limiter_key(method: &str, caller: &str) -> String {
    format!("{method}:{caller}")
}

pub struct MemoryRateLimiter {
    limit: usize,
    window: Duration,
    requests: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl MemoryRateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            requests: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, key: &str, now: Instant) -> Result<(), SignalingError> {
        let mut requests = self.requests.lock();
        let window_start = now.checked_sub(self.window);
        // keys whose whole history fell out of the window are dropped outright
        requests.retain(|_, stamps| {
            prune(stamps, window_start);
            !stamps.is_empty()
        });
        let stamps = requests.entry(key.to_string()).or_default();
        if stamps.len() >= self.limit {
            return Err(SignalingError::RateLimited(key.to_string()));
        }
        stamps.push_back(now);
        Ok(())
    }

    pub fn tracked_keys(&self) -> usize {
        self.requests.lock().len()
    }
}

fn prune(stamps: &mut VecDeque<Instant>, window_start: Option<Instant>) {
    let Some(window_start) = window_start else {
        return;
    };
    while stamps.front().is_some_and(|stamp| *stamp <= window_start) {
        stamps.pop_front();
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn allow(&self, key: &str) -> Result<(), SignalingError> {
        self.check(key, Instant::now())
    }
}

/// Redis sorted-set limiter: one set of request timestamps per key, trimmed to the
/// window on every check and expiring after one idle window.
pub struct RedisRateLimiter {
    conn: ConnectionManager,
    prefix: String,
    limit: usize,
    window: Duration,
}

impl RedisRateLimiter {
    pub async fn connect(
        url: &str,
        prefix: impl Into<String>,
        limit: usize,
        window: Duration,
    ) -> Result<Self, SignalingError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            prefix: prefix.into(),
            limit,
            window,
        })
    }

    async fn record(&self, key: &str) -> Result<bool, redis::RedisError> {
        let redis_key = format!("{}:ratelimit:{key}", self.prefix);
        let now_ms = Utc::now().timestamp_millis();
        let window_ms = self.window.as_millis() as i64;
        let member = format!("{now_ms}-{}", Uuid::new_v4());
        let mut conn = self.conn.clone();
        let (count,): (usize,) = redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&redis_key)
            .arg(0)
            .arg(now_ms - window_ms)
            .ignore()
            .cmd("ZADD")
            .arg(&redis_key)
            .arg(now_ms)
            .arg(&member)
            .ignore()
            .cmd("ZCARD")
            .arg(&redis_key)
            .cmd("PEXPIRE")
            .arg(&redis_key)
            .arg(window_ms.max(1))
            .ignore()
            .query_async(&mut conn)
            .await?;
        if count > self.limit {
            // rejected requests do not consume budget
            let _: () = redis::cmd("ZREM")
                .arg(&redis_key)
                .arg(&member)
                .query_async(&mut conn)
                .await?;
            return Ok(false);
        }
        Ok(true)
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn allow(&self, key: &str) -> Result<(), SignalingError> {
        match self.record(key).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(SignalingError::RateLimited(key.to_string())),
            Err(err) => {
                warn!(
                    target = "rpc_signaling::rate_limit",
                    key,
                    error = %err,
                    "rate limiter store unavailable; allowing request"
                );
                Ok(())
            }
        }
    }
}

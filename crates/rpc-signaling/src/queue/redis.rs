use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use rpc_webrtc::workers::Workers;
use rpc_webrtc::Status;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::{
    deadline_from_now, AnswerSink, CallAnswer, CallQueue, OfferExchange, OfferHandle, UpdateFeed,
};
use crate::error::SignalingError;
use crate::proto::{ErrorStatus, IceCandidate};

pub const DEFAULT_KEY_PREFIX: &str = "rpc-signaling";

const STREAM_BLOCK: Duration = Duration::from_millis(500);
const STREAM_BATCH: usize = 64;
const CLAIM_POLL: Duration = Duration::from_millis(100);
// records outlive the exchange deadline a little so late updates still find them
const RECORD_GRACE: Duration = Duration::from_secs(30);

const KIND_INIT: &str = "init";
const KIND_CANDIDATE: &str = "candidate";
const KIND_DONE: &str = "done";
const KIND_ERROR: &str = "error";

// clears a claim only while it still carries the claimer's token
const RELEASE_CLAIM: &str = r"
if redis.call('HGET', KEYS[1], 'answered') == ARGV[1] then
  return redis.call('HDEL', KEYS[1], 'answered')
end
return 0
";

fn offer_key(prefix: &str, uuid: &str) -> String {
    format!("{prefix}:offer:{uuid}")
}

fn pending_key(prefix: &str, host: &str) -> String {
    format!("{prefix}:pending:{host}")
}

fn caller_stream_key(prefix: &str, uuid: &str) -> String {
    format!("{prefix}:offer:{uuid}:caller")
}

fn answerer_stream_key(prefix: &str, uuid: &str) -> String {
    format!("{prefix}:offer:{uuid}:answerer")
}

fn encode_error(err: &SignalingError) -> String {
    serde_json::to_string(&ErrorStatus::from(Status::from(err.clone()))).unwrap_or_default()
}

fn decode_error(payload: &str) -> SignalingError {
    match serde_json::from_str::<ErrorStatus>(payload) {
        Ok(status) => SignalingError::from_status(status.into()),
        Err(err) => SignalingError::Protocol(format!("undecodable error entry: {err}")),
    }
}

fn instant_for(deadline: DateTime<Utc>) -> Instant {
    let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    Instant::now() + remaining
}

struct StreamEntry {
    kind: String,
    payload: String,
}

impl StreamEntry {
    fn from_id(id: &StreamId) -> Option<Self> {
        let kind: String = id.get("kind")?;
        let payload: String = id.get("payload").unwrap_or_default();
        Some(Self { kind, payload })
    }
}

enum Step {
    Continue,
    Stop(Option<SignalingError>),
}

enum Follow {
    Finished(Option<SignalingError>),
    Expired,
    Cancelled,
}

/// Call queue shared by several signaling processes through Redis.
///
/// Each offer is a hash (`{prefix}:offer:{uuid}`) expiring shortly after its deadline,
/// queued by uuid on `{prefix}:pending:{host}`. Answerers scan the pending lists and
/// claim with `HSETNX answered <token>`; an entry leaves its list only once a claim
/// has won, and a claim abandoned mid-flight is released again. Caller and answerer
/// updates are appended to one Redis
/// stream per side and read back from the start, so a late watcher sees every update.
#[derive(Clone)]
pub struct RedisCallQueue {
    inner: Arc<Inner>,
}

struct Inner {
    client: redis::Client,
    conn: ConnectionManager,
    prefix: String,
    deadline: Duration,
    workers: Workers,
}

impl RedisCallQueue {
    pub async fn connect(
        url: &str,
        prefix: impl Into<String>,
        deadline: Duration,
    ) -> Result<Self, SignalingError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            inner: Arc::new(Inner {
                client,
                conn,
                prefix: prefix.into(),
                deadline,
                workers: Workers::new("redis-call-queue", CancellationToken::new()),
            }),
        })
    }
}

impl Inner {
    fn record_ttl_secs(&self) -> u64 {
        (self.deadline + RECORD_GRACE).as_secs().max(1)
    }

    async fn append(&self, stream: &str, kind: &str, payload: &str) -> Result<(), SignalingError> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .cmd("XADD")
            .arg(stream)
            .arg("*")
            .arg("kind")
            .arg(kind)
            .arg("payload")
            .arg(payload)
            .ignore()
            .cmd("EXPIRE")
            .arg(stream)
            .arg(self.record_ttl_secs())
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Fails unless the offer exists for `host` and the caller has not finished yet.
    async fn caller_may_update(&self, host: &str, uuid: &str) -> Result<(), SignalingError> {
        let mut conn = self.conn.clone();
        let (owner, deadline, done, failed): (
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
        ) = redis::cmd("HMGET")
            .arg(offer_key(&self.prefix, uuid))
            .arg("host")
            .arg("deadline")
            .arg("caller_done")
            .arg("caller_error")
            .query_async(&mut conn)
            .await?;
        let live = deadline
            .and_then(|deadline| DateTime::parse_from_rfc3339(&deadline).ok())
            .is_some_and(|deadline| deadline.with_timezone(&Utc) > Utc::now());
        match owner {
            Some(owner) if owner == host && live && done.is_none() && failed.is_none() => Ok(()),
            _ => Err(SignalingError::InactiveOffer(uuid.to_string())),
        }
    }

    async fn finish_caller(
        &self,
        uuid: &str,
        err: Option<&SignalingError>,
    ) -> Result<(), SignalingError> {
        let key = offer_key(&self.prefix, uuid);
        let stream = caller_stream_key(&self.prefix, uuid);
        let (field, kind, payload) = match err {
            Some(err) => ("caller_error", KIND_ERROR, encode_error(err)),
            None => ("caller_done", KIND_DONE, String::new()),
        };
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(&key)
            .arg(field)
            .arg(if payload.is_empty() { "1" } else { payload.as_str() })
            .ignore()
            .cmd("XADD")
            .arg(&stream)
            .arg("*")
            .arg("kind")
            .arg(kind)
            .arg("payload")
            .arg(&payload)
            .ignore()
            .cmd("EXPIRE")
            .arg(&stream)
            .arg(self.record_ttl_secs())
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Reads `stream` from its first entry until `on_entry` stops, the deadline
    /// passes or the watch is cancelled.
    async fn follow(
        &self,
        stream: &str,
        expires_at: Instant,
        cancel: &CancellationToken,
        mut on_entry: impl FnMut(StreamEntry) -> Step,
    ) -> Result<Follow, SignalingError> {
        // XREAD BLOCK would stall every other command sharing the connection
        let mut conn: MultiplexedConnection = self.client.get_multiplexed_async_connection().await?;
        let queue_cancel = self.workers.cancel_token().clone();
        let mut last_id = "0-0".to_string();
        loop {
            let block = STREAM_BLOCK.min(expires_at.saturating_duration_since(Instant::now()));
            if block.is_zero() {
                return Ok(Follow::Expired);
            }
            let opts = StreamReadOptions::default()
                .block(block.as_millis() as usize)
                .count(STREAM_BATCH);
            let keys = [stream];
            let ids = [last_id.as_str()];
            let reply: Option<StreamReadReply> = tokio::select! {
                _ = cancel.cancelled() => return Ok(Follow::Cancelled),
                _ = queue_cancel.cancelled() => return Ok(Follow::Cancelled),
                reply = conn.xread_options(&keys, &ids, &opts) => reply?,
            };
            let Some(reply) = reply else {
                continue;
            };
            for key in reply.keys {
                for id in key.ids {
                    last_id = id.id.clone();
                    let Some(entry) = StreamEntry::from_id(&id) else {
                        warn!(
                            target = "rpc_signaling::queue::redis",
                            stream,
                            id = %id.id,
                            "skipping stream entry without kind"
                        );
                        continue;
                    };
                    if let Step::Stop(err) = on_entry(entry) {
                        return Ok(Follow::Finished(err));
                    }
                }
            }
        }
    }

    /// Relays answerer entries to the caller's handle.
    async fn watch_answers(
        self: Arc<Self>,
        uuid: String,
        host: String,
        expires_at: Instant,
        answers: Arc<UpdateFeed<CallAnswer>>,
        cancel: CancellationToken,
    ) {
        let stream = answerer_stream_key(&self.prefix, &uuid);
        let outcome = self
            .follow(&stream, expires_at, &cancel, |entry| match entry.kind.as_str() {
                KIND_INIT => {
                    answers.push(CallAnswer::InitialSdp(entry.payload));
                    Step::Continue
                }
                KIND_CANDIDATE => match serde_json::from_str::<IceCandidate>(&entry.payload) {
                    Ok(candidate) => {
                        answers.push(CallAnswer::Candidate(candidate));
                        Step::Continue
                    }
                    Err(err) => Step::Stop(Some(SignalingError::Protocol(format!(
                        "undecodable answerer candidate: {err}"
                    )))),
                },
                KIND_DONE => Step::Stop(None),
                KIND_ERROR => Step::Stop(Some(decode_error(&entry.payload))),
                other => {
                    warn!(
                        target = "rpc_signaling::queue::redis",
                        uuid = %uuid,
                        kind = other,
                        "ignoring unknown answerer entry"
                    );
                    Step::Continue
                }
            })
            .await;

        let failure = match outcome {
            Ok(Follow::Finished(None)) => {
                answers.finish(None);
                None
            }
            Ok(Follow::Finished(Some(err))) => Some(err),
            Ok(Follow::Expired) => {
                self.withdraw(&host, &uuid).await;
                if self.was_answered(&uuid).await {
                    Some(SignalingError::DeadlineExceeded)
                } else {
                    Some(SignalingError::Offline(host.clone()))
                }
            }
            Ok(Follow::Cancelled) => {
                if cancel.is_cancelled() {
                    // the caller gave up; tell whichever answerer holds the offer
                    self.withdraw(&host, &uuid).await;
                    if let Err(err) = self.finish_caller(&uuid, Some(&SignalingError::Cancelled)).await {
                        trace!(
                            target = "rpc_signaling::queue::redis",
                            uuid = %uuid,
                            error = %err,
                            "failed to record caller cancellation"
                        );
                    }
                }
                Some(SignalingError::Cancelled)
            }
            Err(err) => Some(err),
        };
        if let Some(err) = failure {
            debug!(
                target = "rpc_signaling::queue::redis",
                uuid = %uuid,
                host = %host,
                error = %err,
                "offer terminated"
            );
            answers.fail(err);
        }
    }

    /// Relays caller entries to the answerer's exchange.
    async fn watch_caller(
        self: Arc<Self>,
        uuid: String,
        expires_at: Instant,
        caller: Arc<UpdateFeed<IceCandidate>>,
    ) {
        let stream = caller_stream_key(&self.prefix, &uuid);
        let cancel = self.workers.cancel_token().clone();
        let outcome = self
            .follow(&stream, expires_at, &cancel, |entry| match entry.kind.as_str() {
                KIND_CANDIDATE => match serde_json::from_str::<IceCandidate>(&entry.payload) {
                    Ok(candidate) => {
                        caller.push(candidate);
                        Step::Continue
                    }
                    Err(err) => Step::Stop(Some(SignalingError::Protocol(format!(
                        "undecodable caller candidate: {err}"
                    )))),
                },
                KIND_DONE => Step::Stop(None),
                KIND_ERROR => Step::Stop(Some(decode_error(&entry.payload))),
                other => {
                    warn!(
                        target = "rpc_signaling::queue::redis",
                        uuid = %uuid,
                        kind = other,
                        "ignoring unknown caller entry"
                    );
                    Step::Continue
                }
            })
            .await;
        let err = match outcome {
            Ok(Follow::Finished(err)) => err,
            Ok(Follow::Expired) => Some(SignalingError::DeadlineExceeded),
            Ok(Follow::Cancelled) => Some(SignalingError::Cancelled),
            Err(err) => Some(err),
        };
        caller.finish(err);
    }

    async fn withdraw(&self, host: &str, uuid: &str) {
        let mut conn = self.conn.clone();
        let removed: Result<i64, _> = conn.lrem(pending_key(&self.prefix, host), 0, uuid).await;
        if let Err(err) = removed {
            trace!(
                target = "rpc_signaling::queue::redis",
                uuid,
                error = %err,
                "failed to withdraw pending offer"
            );
        }
    }

    fn withdraw_later(self: &Arc<Self>, host: &str, uuid: &str) {
        let inner = self.clone();
        let (host, uuid) = (host.to_string(), uuid.to_string());
        self.workers
            .spawn(async move { inner.withdraw(&host, &uuid).await });
    }

    async fn was_answered(&self, uuid: &str) -> bool {
        let mut conn = self.conn.clone();
        conn.hexists(offer_key(&self.prefix, uuid), "answered")
            .await
            .unwrap_or(false)
    }

    /// Marks the offer answered. Returns `None` when another answerer won or the
    /// record is gone or past its deadline.
    ///
    /// If the returned future is dropped before it resolves, the claim is released
    /// and the offer stays pending.
    async fn try_claim(
        self: &Arc<Self>,
        host: &str,
        uuid: &str,
    ) -> Result<Option<OfferExchange>, SignalingError> {
        let key = offer_key(&self.prefix, uuid);
        let mut guard = ClaimGuard {
            inner: self.clone(),
            key: key.clone(),
            token: Uuid::new_v4().to_string(),
            armed: true,
        };
        let mut conn = self.conn.clone();
        let won: bool = conn.hset_nx(&key, "answered", &guard.token).await?;
        if !won {
            guard.armed = false;
            return Ok(None);
        }
        let record: HashMap<String, String> = conn.hgetall(&key).await?;
        guard.armed = false;
        let (Some(sdp), Some(deadline)) = (record.get("caller_sdp"), record.get("deadline")) else {
            // the record expired before the claim; HSETNX recreated an empty hash
            let _: Result<(), _> = conn.del(&key).await;
            self.withdraw_later(host, uuid);
            return Ok(None);
        };
        let deadline = match DateTime::parse_from_rfc3339(deadline) {
            Ok(deadline) => deadline.with_timezone(&Utc),
            Err(err) => {
                warn!(
                    target = "rpc_signaling::queue::redis",
                    uuid,
                    error = %err,
                    "dropping offer with unreadable deadline"
                );
                self.withdraw_later(host, uuid);
                return Ok(None);
            }
        };
        self.withdraw_later(host, uuid);
        if deadline <= Utc::now() {
            return Ok(None);
        }

        let (caller, caller_rx) = UpdateFeed::new();
        let watcher = self.clone();
        if !self.workers.spawn(watcher.watch_caller(
            uuid.to_string(),
            instant_for(deadline),
            caller.clone(),
        )) {
            return Err(SignalingError::Cancelled);
        }
        let disable_trickle = record.get("disable_trickle").map(String::as_str) == Some("1");
        Ok(Some(OfferExchange::new(
            uuid.to_string(),
            sdp.clone(),
            disable_trickle,
            deadline,
            caller_rx,
            caller,
            Arc::new(RedisAnswerSink {
                inner: self.clone(),
                uuid: uuid.to_string(),
                finished: AtomicBool::new(false),
            }),
        )))
    }
}

#[async_trait]
impl CallQueue for RedisCallQueue {
    async fn send_offer_init(
        &self,
        host: &str,
        sdp: &str,
        disable_trickle: bool,
    ) -> Result<OfferHandle, SignalingError> {
        let inner = &self.inner;
        if inner.workers.cancel_token().is_cancelled() {
            return Err(SignalingError::Cancelled);
        }
        let uuid = Uuid::new_v4().to_string();
        let deadline = deadline_from_now(inner.deadline);
        let key = offer_key(&inner.prefix, &uuid);
        let pending = pending_key(&inner.prefix, host);
        let ttl = inner.record_ttl_secs();
        let mut conn = inner.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(&key)
            .arg("id")
            .arg(&uuid)
            .arg("host")
            .arg(host)
            .arg("started_at")
            .arg(Utc::now().to_rfc3339())
            .arg("deadline")
            .arg(deadline.to_rfc3339())
            .arg("caller_sdp")
            .arg(sdp)
            .arg("disable_trickle")
            .arg(if disable_trickle { "1" } else { "0" })
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(ttl)
            .ignore()
            .cmd("RPUSH")
            .arg(&pending)
            .arg(&uuid)
            .ignore()
            .cmd("EXPIRE")
            .arg(&pending)
            .arg(ttl)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        let (answers, answers_rx) = UpdateFeed::new();
        let cancel = CancellationToken::new();
        let watcher = inner.clone();
        if !inner.workers.spawn(watcher.watch_answers(
            uuid.clone(),
            host.to_string(),
            instant_for(deadline),
            answers.clone(),
            cancel.clone(),
        )) {
            return Err(SignalingError::Cancelled);
        }
        debug!(
            target = "rpc_signaling::queue::redis",
            uuid = %uuid,
            host,
            disable_trickle,
            "offer queued"
        );
        Ok(OfferHandle::new(uuid, answers_rx, answers.done_token(), cancel))
    }

    async fn send_offer_update(
        &self,
        host: &str,
        uuid: &str,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError> {
        self.inner.caller_may_update(host, uuid).await?;
        let payload = serde_json::to_string(&candidate)?;
        self.inner
            .append(&caller_stream_key(&self.inner.prefix, uuid), KIND_CANDIDATE, &payload)
            .await
    }

    async fn send_offer_done(&self, host: &str, uuid: &str) -> Result<(), SignalingError> {
        self.inner.caller_may_update(host, uuid).await?;
        self.inner.finish_caller(uuid, None).await
    }

    async fn send_offer_error(
        &self,
        host: &str,
        uuid: &str,
        err: SignalingError,
    ) -> Result<(), SignalingError> {
        self.inner.caller_may_update(host, uuid).await?;
        self.inner.finish_caller(uuid, Some(&err)).await
    }

    async fn recv_offer(&self, hosts: &[String]) -> Result<OfferExchange, SignalingError> {
        if hosts.is_empty() {
            return Err(SignalingError::InvalidArgument("no hosts to answer for".into()));
        }
        let inner = &self.inner;
        let queue_cancel = inner.workers.cancel_token().clone();
        let mut conn = inner.conn.clone();
        loop {
            for host in hosts {
                let pending = pending_key(&inner.prefix, host);
                let queued: Vec<String> = tokio::select! {
                    _ = queue_cancel.cancelled() => return Err(SignalingError::Cancelled),
                    queued = conn.lrange(&pending, 0, -1) => queued?,
                };
                for uuid in queued {
                    if let Some(exchange) = inner.try_claim(host, &uuid).await? {
                        debug!(
                            target = "rpc_signaling::queue::redis",
                            uuid = %uuid,
                            host = %host,
                            "offer claimed"
                        );
                        return Ok(exchange);
                    }
                    trace!(
                        target = "rpc_signaling::queue::redis",
                        uuid = %uuid,
                        "skipping stale or already answered offer"
                    );
                }
            }
            tokio::select! {
                _ = queue_cancel.cancelled() => return Err(SignalingError::Cancelled),
                _ = tokio::time::sleep(CLAIM_POLL) => {}
            }
        }
    }

    async fn close(&self) {
        self.inner.workers.shutdown().await;
    }
}

/// Releases a claim whose outcome was never observed by the claimer.
struct ClaimGuard {
    inner: Arc<Inner>,
    key: String,
    token: String,
    armed: bool,
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut conn = self.inner.conn.clone();
        let (key, token) = (std::mem::take(&mut self.key), std::mem::take(&mut self.token));
        self.inner.workers.spawn(async move {
            let released: Result<i64, _> = redis::Script::new(RELEASE_CLAIM)
                .key(&key)
                .arg(&token)
                .invoke_async(&mut conn)
                .await;
            match released {
                Ok(1) => debug!(
                    target = "rpc_signaling::queue::redis",
                    key = %key,
                    "released abandoned claim"
                ),
                Ok(_) => {}
                Err(err) => warn!(
                    target = "rpc_signaling::queue::redis",
                    key = %key,
                    error = %err,
                    "failed to release abandoned claim"
                ),
            }
        });
    }
}

struct RedisAnswerSink {
    inner: Arc<Inner>,
    uuid: String,
    finished: AtomicBool,
}

impl RedisAnswerSink {
    fn stream(&self) -> String {
        answerer_stream_key(&self.inner.prefix, &self.uuid)
    }

    fn inactive(&self) -> SignalingError {
        SignalingError::InactiveOffer(self.uuid.clone())
    }
}

#[async_trait]
impl AnswerSink for RedisAnswerSink {
    async fn respond(&self, answer: CallAnswer) -> Result<(), SignalingError> {
        if self.finished.load(Ordering::SeqCst) {
            return Err(self.inactive());
        }
        match answer {
            CallAnswer::InitialSdp(sdp) => self.inner.append(&self.stream(), KIND_INIT, &sdp).await,
            CallAnswer::Candidate(candidate) => {
                let payload = serde_json::to_string(&candidate)?;
                self.inner
                    .append(&self.stream(), KIND_CANDIDATE, &payload)
                    .await
            }
            CallAnswer::Err(err) => {
                if self.finished.swap(true, Ordering::SeqCst) {
                    return Err(self.inactive());
                }
                let payload = encode_error(&err);
                let mut conn = self.inner.conn.clone();
                let _: () = conn
                    .hset(offer_key(&self.inner.prefix, &self.uuid), "answerer_error", &payload)
                    .await?;
                self.inner.append(&self.stream(), KIND_ERROR, &payload).await
            }
        }
    }

    async fn done(&self) -> Result<(), SignalingError> {
        if self.finished.swap(true, Ordering::SeqCst) {
            return Err(self.inactive());
        }
        let mut conn = self.inner.conn.clone();
        let _: () = conn
            .hset(offer_key(&self.inner.prefix, &self.uuid), "answerer_done", "1")
            .await?;
        self.inner.append(&self.stream(), KIND_DONE, "").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpc_webrtc::Code;

    #[test_timeout::timeout]
    fn key_layout_is_prefixed_per_offer_and_host() {
        assert_eq!(offer_key("p", "u1"), "p:offer:u1");
        assert_eq!(pending_key("p", "h1"), "p:pending:h1");
        assert_eq!(caller_stream_key("p", "u1"), "p:offer:u1:caller");
        assert_eq!(answerer_stream_key("p", "u1"), "p:offer:u1:answerer");
    }

    #[test_timeout::timeout]
    fn error_entries_keep_their_status() {
        let encoded = encode_error(&SignalingError::Offline("h1".into()));
        match decode_error(&encoded) {
            SignalingError::Remote(status) => {
                assert_eq!(status.code, Code::DeadlineExceeded);
                assert!(status.message.contains("h1"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            decode_error(&encode_error(&SignalingError::Cancelled)),
            SignalingError::Cancelled
        );
        assert!(matches!(decode_error("{"), SignalingError::Protocol(_)));
    }
}

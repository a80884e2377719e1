//! Call queues match caller offers with answerers listening for a host.
//!
//! Two implementations share one contract: [`MemoryCallQueue`] for a single
//! signaling process and [`RedisCallQueue`] for several signaling processes behind
//! a load balancer. Each offer is claimed by at most one answerer, unanswered
//! offers expire with [`SignalingError::Offline`] after the exchange deadline, and
//! updates recorded before a side starts watching are still delivered in order.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::SignalingError;
use crate::proto::IceCandidate;

mod memory;
mod redis;

pub use self::memory::MemoryCallQueue;
pub use self::redis::{RedisCallQueue, DEFAULT_KEY_PREFIX};

pub(crate) fn deadline_from_now(after: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(after).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Answerer-side event as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallAnswer {
    InitialSdp(String),
    Candidate(IceCandidate),
    Err(SignalingError),
}

#[async_trait]
pub trait CallQueue: Send + Sync {
    /// Registers an offer for `host` and returns the caller's view of it.
    async fn send_offer_init(
        &self,
        host: &str,
        sdp: &str,
        disable_trickle: bool,
    ) -> Result<OfferHandle, SignalingError>;

    async fn send_offer_update(
        &self,
        host: &str,
        uuid: &str,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError>;

    async fn send_offer_done(&self, host: &str, uuid: &str) -> Result<(), SignalingError>;

    async fn send_offer_error(
        &self,
        host: &str,
        uuid: &str,
        err: SignalingError,
    ) -> Result<(), SignalingError>;

    /// Waits for an offer addressed to any of `hosts` and claims it.
    async fn recv_offer(&self, hosts: &[String]) -> Result<OfferExchange, SignalingError>;

    /// Fails outstanding offers with `Cancelled` and waits for background work to stop.
    async fn close(&self);
}

/// Ordered, single-consumer feed of updates with a completion signal.
///
/// `finish` closes the feed: queued items stay readable, later pushes are refused.
pub struct UpdateFeed<T> {
    tx: Mutex<Option<mpsc::UnboundedSender<T>>>,
    done: CancellationToken,
    err: Mutex<Option<SignalingError>>,
}

impl<T> UpdateFeed<T> {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let feed = Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            done: CancellationToken::new(),
            err: Mutex::new(None),
        });
        (feed, rx)
    }

    pub fn push(&self, item: T) -> bool {
        match self.tx.lock().as_ref() {
            Some(tx) => {
                let _ = tx.send(item);
                true
            }
            None => false,
        }
    }

    /// Returns false when the feed had already finished.
    pub fn finish(&self, err: Option<SignalingError>) -> bool {
        let tx = self.tx.lock().take();
        if tx.is_none() {
            return false;
        }
        if let Some(err) = err {
            *self.err.lock() = Some(err);
        }
        drop(tx);
        self.done.cancel();
        true
    }

    pub fn is_finished(&self) -> bool {
        self.done.is_cancelled()
    }

    pub async fn done(&self) {
        self.done.cancelled().await
    }

    pub fn done_token(&self) -> CancellationToken {
        self.done.clone()
    }

    pub fn err(&self) -> Option<SignalingError> {
        self.err.lock().clone()
    }
}

impl UpdateFeed<CallAnswer> {
    /// Delivers `err` as the last answer event and closes the feed.
    pub fn fail(&self, err: SignalingError) -> bool {
        let tx = self.tx.lock().take();
        let Some(tx) = tx else {
            return false;
        };
        let _ = tx.send(CallAnswer::Err(err.clone()));
        *self.err.lock() = Some(err);
        drop(tx);
        self.done.cancel();
        true
    }
}

/// The caller's handle on one offer.
///
/// Dropping the handle before any answerer finished cancels the offer.
pub struct OfferHandle {
    pub uuid: String,
    pub answers: mpsc::UnboundedReceiver<CallAnswer>,
    done: CancellationToken,
    cancel: CancellationToken,
}

impl OfferHandle {
    pub fn new(
        uuid: String,
        answers: mpsc::UnboundedReceiver<CallAnswer>,
        done: CancellationToken,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            uuid,
            answers,
            done,
            cancel,
        }
    }

    /// Resolves once the answerer finished, failed, or the offer expired.
    pub async fn done(&self) {
        self.done.cancelled().await
    }

    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for OfferHandle {
    fn drop(&mut self) {
        if !self.done.is_cancelled() {
            self.cancel.cancel();
        }
    }
}

/// Answerer side of the queue for one claimed offer.
#[async_trait]
pub trait AnswerSink: Send + Sync {
    async fn respond(&self, answer: CallAnswer) -> Result<(), SignalingError>;
    async fn done(&self) -> Result<(), SignalingError>;
}

/// A claimed offer as seen by its answerer.
pub struct OfferExchange {
    uuid: String,
    sdp: String,
    disable_trickle: bool,
    deadline: DateTime<Utc>,
    caller_candidates: Option<mpsc::UnboundedReceiver<IceCandidate>>,
    caller: Arc<UpdateFeed<IceCandidate>>,
    sink: Arc<dyn AnswerSink>,
}

impl OfferExchange {
    pub fn new(
        uuid: String,
        sdp: String,
        disable_trickle: bool,
        deadline: DateTime<Utc>,
        caller_candidates: mpsc::UnboundedReceiver<IceCandidate>,
        caller: Arc<UpdateFeed<IceCandidate>>,
        sink: Arc<dyn AnswerSink>,
    ) -> Self {
        Self {
            uuid,
            sdp,
            disable_trickle,
            deadline,
            caller_candidates: Some(caller_candidates),
            caller,
            sink,
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn sdp(&self) -> &str {
        &self.sdp
    }

    pub fn disable_trickle(&self) -> bool {
        self.disable_trickle
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    /// Caller candidates in submission order. The stream ends once the caller is done
    /// or failed. Can be taken once.
    pub fn take_caller_candidates(&mut self) -> Option<mpsc::UnboundedReceiver<IceCandidate>> {
        self.caller_candidates.take()
    }

    pub async fn caller_done(&self) {
        self.caller.done().await
    }

    pub fn caller_err(&self) -> Option<SignalingError> {
        self.caller.err()
    }

    pub async fn answerer_respond(&self, answer: CallAnswer) -> Result<(), SignalingError> {
        self.sink.respond(answer).await
    }

    pub async fn answerer_done(&self) -> Result<(), SignalingError> {
        self.sink.done().await
    }
}

impl std::fmt::Debug for OfferExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfferExchange")
            .field("uuid", &self.uuid)
            .field("disable_trickle", &self.disable_trickle)
            .field("deadline", &self.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test]
    async fn feed_keeps_queued_items_after_finish() {
        let (feed, mut rx) = UpdateFeed::new();
        assert!(feed.push(1));
        assert!(feed.push(2));
        assert!(feed.finish(None));
        assert!(!feed.push(3));
        assert!(!feed.finish(Some(SignalingError::Cancelled)));
        assert_eq!(feed.err(), None);
        feed.done().await;
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, None);
    }

    #[test_timeout::tokio_timeout_test]
    async fn failing_an_answer_feed_delivers_the_error_last() {
        let (feed, mut rx) = UpdateFeed::<CallAnswer>::new();
        feed.push(CallAnswer::InitialSdp("world".into()));
        assert!(feed.fail(SignalingError::Offline("h1".into())));
        assert!(!feed.fail(SignalingError::Cancelled));
        assert_eq!(rx.recv().await, Some(CallAnswer::InitialSdp("world".into())));
        assert_eq!(
            rx.recv().await,
            Some(CallAnswer::Err(SignalingError::Offline("h1".into())))
        );
        assert_eq!(rx.recv().await, None);
        assert!(feed.is_finished());
    }

    #[test_timeout::tokio_timeout_test]
    async fn dropping_an_unfinished_handle_cancels_the_offer() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let done = CancellationToken::new();
        let cancel = CancellationToken::new();
        drop(OfferHandle::new("u".into(), rx, done.clone(), cancel.clone()));
        assert!(cancel.is_cancelled());

        let (_tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        done.cancel();
        drop(OfferHandle::new("u".into(), rx, done, cancel.clone()));
        assert!(!cancel.is_cancelled());
    }
}

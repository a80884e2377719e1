use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rpc_webrtc::workers::Workers;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use super::{
    deadline_from_now, AnswerSink, CallAnswer, CallQueue, OfferExchange, OfferHandle, UpdateFeed,
};
use crate::error::SignalingError;
use crate::proto::IceCandidate;

/// In-process call queue. Offers wait in a per-host FIFO until an answerer claims them.
#[derive(Clone)]
pub struct MemoryCallQueue {
    inner: Arc<Inner>,
}

struct Inner {
    deadline: Duration,
    state: Mutex<State>,
    offer_ready: Notify,
    workers: Workers,
}

#[derive(Default)]
struct State {
    pending: HashMap<String, VecDeque<Arc<Offer>>>,
    offers: HashMap<String, Arc<Offer>>,
    closed: bool,
}

struct Offer {
    uuid: String,
    host: String,
    sdp: String,
    disable_trickle: bool,
    deadline: DateTime<Utc>,
    expires_at: Instant,
    answered: AtomicBool,
    caller: Arc<UpdateFeed<IceCandidate>>,
    caller_rx: Mutex<Option<mpsc::UnboundedReceiver<IceCandidate>>>,
    answers: Arc<UpdateFeed<CallAnswer>>,
    cancel: CancellationToken,
}

impl Offer {
    fn claimable(&self) -> bool {
        !self.cancel.is_cancelled() && !self.answers.is_finished() && Instant::now() < self.expires_at
    }
}

impl MemoryCallQueue {
    pub fn new(deadline: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                deadline,
                state: Mutex::new(State::default()),
                offer_ready: Notify::new(),
                workers: Workers::new("memory-call-queue", CancellationToken::new()),
            }),
        }
    }

    /// Offers that are still live, answered or not.
    pub fn live_offers(&self) -> usize {
        self.inner.state.lock().offers.len()
    }

    /// Offers still waiting for an answerer.
    pub fn pending_offers(&self) -> usize {
        self.inner
            .state
            .lock()
            .pending
            .values()
            .map(|queue| queue.iter().filter(|offer| offer.claimable()).count())
            .sum()
    }
}

impl Inner {
    fn live_offer(&self, host: &str, uuid: &str) -> Result<Arc<Offer>, SignalingError> {
        self.state
            .lock()
            .offers
            .get(uuid)
            .filter(|offer| offer.host == host)
            .cloned()
            .ok_or_else(|| SignalingError::InactiveOffer(uuid.to_string()))
    }

    fn claim(&self, hosts: &[String]) -> Result<Option<Arc<Offer>>, SignalingError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(SignalingError::Cancelled);
        }
        let mut claimed = None;
        'hosts: for host in hosts {
            let Some(queue) = state.pending.get_mut(host) else {
                continue;
            };
            while let Some(offer) = queue.pop_front() {
                if offer.claimable() && !offer.answered.swap(true, Ordering::SeqCst) {
                    claimed = Some(offer);
                    break 'hosts;
                }
            }
        }
        state.pending.retain(|_, queue| !queue.is_empty());
        Ok(claimed)
    }

    fn exchange(&self, offer: Arc<Offer>) -> Result<OfferExchange, SignalingError> {
        let caller_rx = offer
            .caller_rx
            .lock()
            .take()
            .ok_or_else(|| SignalingError::InactiveOffer(offer.uuid.clone()))?;
        Ok(OfferExchange::new(
            offer.uuid.clone(),
            offer.sdp.clone(),
            offer.disable_trickle,
            offer.deadline,
            caller_rx,
            offer.caller.clone(),
            Arc::new(MemoryAnswerSink {
                offer: offer.clone(),
            }),
        ))
    }

    fn forget(&self, offer: &Offer) {
        let mut state = self.state.lock();
        state.offers.remove(&offer.uuid);
        if let Some(queue) = state.pending.get_mut(&offer.host) {
            queue.retain(|pending| pending.uuid != offer.uuid);
            if queue.is_empty() {
                state.pending.remove(&offer.host);
            }
        }
    }

    /// Terminates the offer once both sides are done, or fails it at the deadline.
    async fn watch_offer(self: Arc<Self>, offer: Arc<Offer>) {
        let queue_cancel = self.workers.cancel_token().clone();
        let both_done = async {
            offer.answers.done().await;
            offer.caller.done().await;
        };
        let failure = tokio::select! {
            _ = both_done => None,
            _ = tokio::time::sleep_until(offer.expires_at) => {
                if offer.answered.load(Ordering::SeqCst) {
                    Some(SignalingError::DeadlineExceeded)
                } else {
                    Some(SignalingError::Offline(offer.host.clone()))
                }
            }
            _ = offer.cancel.cancelled() => Some(SignalingError::Cancelled),
            _ = queue_cancel.cancelled() => Some(SignalingError::Cancelled),
        };
        match failure {
            Some(err) => {
                debug!(
                    target = "rpc_signaling::queue::memory",
                    uuid = %offer.uuid,
                    host = %offer.host,
                    error = %err,
                    "offer terminated"
                );
                offer.answers.fail(err.clone());
                offer.caller.finish(Some(err));
            }
            None => trace!(
                target = "rpc_signaling::queue::memory",
                uuid = %offer.uuid,
                "offer exchange complete"
            ),
        }
        self.forget(&offer);
    }
}

#[async_trait]
impl CallQueue for MemoryCallQueue {
    async fn send_offer_init(
        &self,
        host: &str,
        sdp: &str,
        disable_trickle: bool,
    ) -> Result<OfferHandle, SignalingError> {
        let (caller, caller_rx) = UpdateFeed::new();
        let (answers, answers_rx) = UpdateFeed::new();
        let offer = Arc::new(Offer {
            uuid: Uuid::new_v4().to_string(),
            host: host.to_string(),
            sdp: sdp.to_string(),
            disable_trickle,
            deadline: deadline_from_now(self.inner.deadline),
            expires_at: Instant::now() + self.inner.deadline,
            answered: AtomicBool::new(false),
            caller,
            caller_rx: Mutex::new(Some(caller_rx)),
            answers,
            cancel: CancellationToken::new(),
        });
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(SignalingError::Cancelled);
            }
            state.offers.insert(offer.uuid.clone(), offer.clone());
            state
                .pending
                .entry(offer.host.clone())
                .or_default()
                .push_back(offer.clone());
        }
        let watcher = self.inner.clone();
        if !self.inner.workers.spawn(watcher.watch_offer(offer.clone())) {
            self.inner.forget(&offer);
            return Err(SignalingError::Cancelled);
        }
        self.inner.offer_ready.notify_waiters();
        debug!(
            target = "rpc_signaling::queue::memory",
            uuid = %offer.uuid,
            host = %offer.host,
            disable_trickle,
            "offer queued"
        );
        Ok(OfferHandle::new(
            offer.uuid.clone(),
            answers_rx,
            offer.answers.done_token(),
            offer.cancel.clone(),
        ))
    }

    async fn send_offer_update(
        &self,
        host: &str,
        uuid: &str,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError> {
        let offer = self.inner.live_offer(host, uuid)?;
        if offer.caller.push(candidate) {
            Ok(())
        } else {
            Err(SignalingError::InactiveOffer(uuid.to_string()))
        }
    }

    async fn send_offer_done(&self, host: &str, uuid: &str) -> Result<(), SignalingError> {
        let offer = self.inner.live_offer(host, uuid)?;
        if offer.caller.finish(None) {
            Ok(())
        } else {
            Err(SignalingError::InactiveOffer(uuid.to_string()))
        }
    }

    async fn send_offer_error(
        &self,
        host: &str,
        uuid: &str,
        err: SignalingError,
    ) -> Result<(), SignalingError> {
        let offer = self.inner.live_offer(host, uuid)?;
        if offer.caller.finish(Some(err)) {
            Ok(())
        } else {
            Err(SignalingError::InactiveOffer(uuid.to_string()))
        }
    }

    async fn recv_offer(&self, hosts: &[String]) -> Result<OfferExchange, SignalingError> {
        let cancel = self.inner.workers.cancel_token().clone();
        loop {
            let notified = self.inner.offer_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(offer) = self.inner.claim(hosts)? {
                debug!(
                    target = "rpc_signaling::queue::memory",
                    uuid = %offer.uuid,
                    host = %offer.host,
                    "offer claimed"
                );
                return self.inner.exchange(offer);
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(SignalingError::Cancelled),
            }
        }
    }

    async fn close(&self) {
        self.inner.state.lock().closed = true;
        self.inner.workers.shutdown().await;
        self.inner.offer_ready.notify_waiters();
    }
}

struct MemoryAnswerSink {
    offer: Arc<Offer>,
}

#[async_trait]
impl AnswerSink for MemoryAnswerSink {
    async fn respond(&self, answer: CallAnswer) -> Result<(), SignalingError> {
        let accepted = match answer {
            CallAnswer::Err(err) => self.offer.answers.fail(err),
            answer => self.offer.answers.push(answer),
        };
        if accepted {
            Ok(())
        } else {
            Err(SignalingError::InactiveOffer(self.offer.uuid.clone()))
        }
    }

    async fn done(&self) -> Result<(), SignalingError> {
        if self.offer.answers.finish(None) {
            Ok(())
        } else {
            Err(SignalingError::InactiveOffer(self.offer.uuid.clone()))
        }
    }
}

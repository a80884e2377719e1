use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;

use crate::config::ChannelLimits;
use crate::status::Status;
use crate::wire::WireError;
use crate::workers::Workers;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("io: read/write on closed pipe")]
    ClosedPipe,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("frame decode failed: {0}")]
    Wire(#[from] WireError),
}

impl From<ChannelError> for Status {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::ClosedPipe => Status::canceled(err.to_string()),
            ChannelError::Transport(_) => Status::unavailable(err.to_string()),
            ChannelError::Wire(_) => Status::internal(err.to_string()),
        }
    }
}

/// The raw message pipe a channel writes to. Implemented over a webrtc data channel
/// in production and by in-memory doubles in tests.
#[async_trait]
pub trait DataPipe: Send + Sync + 'static {
    async fn send(&self, data: Bytes) -> Result<(), ChannelError>;
    async fn buffered_amount(&self) -> usize;
    /// Tears down the pipe and whatever connection carries it.
    async fn close(&self) -> Result<(), ChannelError>;
}

/// Errors that show up during normal teardown and say nothing about the peer's health.
pub fn is_benign_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("user initiated abort")
        || lower.contains("reset packet does not exist")
        || lower.contains("closed pipe")
        || lower.contains("already closed")
        || lower.contains("connection closed")
}

#[derive(Debug, Default)]
struct CloseState {
    closed: bool,
    reason: Option<ChannelError>,
}

/// Owns one data channel and the peer connection behind it.
///
/// Webrtc callbacks feed the `handle_*` methods, which only flip local state and never
/// await the peer connection, so a callback can never wait on itself.
pub struct BaseChannel {
    pipe: Arc<dyn DataPipe>,
    limits: ChannelLimits,
    cancel: CancellationToken,
    ready: watch::Sender<bool>,
    state: Mutex<CloseState>,
    low_water: Notify,
    pipe_closed: Arc<AtomicBool>,
    workers: Workers,
    inbound_tx: mpsc::UnboundedSender<Bytes>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
}

impl BaseChannel {
    pub fn new(pipe: Arc<dyn DataPipe>, limits: ChannelLimits) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let (ready, _) = watch::channel(false);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            pipe,
            limits,
            workers: Workers::new("base-channel", cancel.clone()),
            cancel,
            ready,
            state: Mutex::new(CloseState::default()),
            low_water: Notify::new(),
            pipe_closed: Arc::new(AtomicBool::new(false)),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
        })
    }

    pub fn limits(&self) -> &ChannelLimits {
        &self.limits
    }

    /// Token cancelled once the channel closes. Stream tokens are children of it.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Hands out the inbound message queue. Only the first caller gets it.
    pub fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<Bytes>> {
        self.inbound_rx.lock().take()
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Resolves once the data channel is open, or fails if it closes first.
    pub async fn ready(&self) -> Result<(), ChannelError> {
        let mut rx = self.ready.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(ChannelError::ClosedPipe);
                    }
                }
                _ = self.cancel.cancelled() => {
                    return Err(self.closed().1.unwrap_or(ChannelError::ClosedPipe));
                }
            }
        }
    }

    /// Returns whether the channel is closed and the reason it closed with, if any.
    pub fn closed(&self) -> (bool, Option<ChannelError>) {
        let state = self.state.lock();
        (state.closed, state.reason.clone())
    }

    /// Sends one encoded frame, waiting while the pipe holds more than the high-water mark.
    pub async fn write(&self, frame: Bytes) -> Result<(), ChannelError> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(ChannelError::ClosedPipe);
            }
            let notified = self.low_water.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let buffered = self.pipe.buffered_amount().await;
            if buffered <= self.limits.high_water {
                break;
            }
            trace!(
                target = "rpc_webrtc::channel",
                buffered,
                high_water = self.limits.high_water,
                "write blocked on backpressure"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(ChannelError::ClosedPipe),
                _ = &mut notified => {}
            }
        }
        match self.pipe.send(frame).await {
            Ok(()) => Ok(()),
            Err(_) if self.cancel.is_cancelled() => Err(ChannelError::ClosedPipe),
            Err(err) => Err(err),
        }
    }

    pub async fn close(&self) {
        self.close_with_reason(None).await;
    }

    /// Idempotent. Returns after the pipe is torn down and channel workers have exited.
    pub async fn close_with_reason(&self, reason: Option<ChannelError>) {
        self.shutdown(reason);
        close_pipe(self.pipe.clone(), self.pipe_closed.clone()).await;
        self.workers.shutdown().await;
    }

    pub fn handle_open(&self) {
        debug!(target = "rpc_webrtc::channel", "data channel open");
        self.ready.send_replace(true);
    }

    pub fn handle_buffered_low(&self) {
        self.low_water.notify_waiters();
    }

    pub fn handle_message(&self, data: Bytes) {
        if self.cancel.is_cancelled() {
            return;
        }
        if self.inbound_tx.send(data).is_err() {
            trace!(target = "rpc_webrtc::channel", "inbound message dropped; no reader");
        }
    }

    pub fn handle_close(&self) {
        debug!(target = "rpc_webrtc::channel", "data channel closed by transport");
        self.shutdown(None);
        self.spawn_pipe_close();
    }

    /// Reacts to ICE state. The transport can hang on read after the remote side
    /// disappears, so lost connectivity closes the peer connection right away.
    pub fn handle_ice_state(&self, state: RTCIceConnectionState) {
        trace!(target = "rpc_webrtc::channel", state = %state, "ice connection state");
        let reason = match state {
            RTCIceConnectionState::Disconnected | RTCIceConnectionState::Failed => Some(
                ChannelError::Transport(format!("ice connection {state}")),
            ),
            RTCIceConnectionState::Closed => None,
            _ => return,
        };
        self.shutdown(reason);
        self.spawn_pipe_close();
    }

    fn shutdown(&self, reason: Option<ChannelError>) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            state.closed = true;
            state.reason = reason.clone();
        }
        match &reason {
            Some(err) if !is_benign_error(&err.to_string()) => {
                warn!(target = "rpc_webrtc::channel", error = %err, "channel closed with error");
            }
            Some(err) => {
                debug!(target = "rpc_webrtc::channel", error = %err, "channel closed");
            }
            None => debug!(target = "rpc_webrtc::channel", "channel closed"),
        }
        self.cancel.cancel();
        self.low_water.notify_waiters();
        true
    }

    fn spawn_pipe_close(&self) {
        let pipe = self.pipe.clone();
        let flag = self.pipe_closed.clone();
        self.workers.spawn(close_pipe(pipe, flag));
    }
}

async fn close_pipe(pipe: Arc<dyn DataPipe>, flag: Arc<AtomicBool>) {
    if flag.swap(true, Ordering::SeqCst) {
        return;
    }
    if let Err(err) = pipe.close().await {
        let message = err.to_string();
        if is_benign_error(&message) {
            trace!(target = "rpc_webrtc::channel", error = %message, "pipe close");
        } else {
            warn!(target = "rpc_webrtc::channel", error = %message, "failed to close pipe");
        }
    }
}

impl std::fmt::Debug for BaseChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BaseChannel")
            .field("ready", &*self.ready.borrow())
            .field("closed", &state.closed)
            .field("reason", &state.reason)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// In-memory pipe that records sent frames and lets tests steer backpressure.
    #[derive(Default)]
    pub struct MockPipe {
        pub sent: Mutex<Vec<Bytes>>,
        pub buffered: AtomicUsize,
        pub closes: AtomicUsize,
        pub sent_notify: Notify,
    }

    impl MockPipe {
        pub fn sent_frames(&self) -> Vec<Bytes> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl DataPipe for MockPipe {
        async fn send(&self, data: Bytes) -> Result<(), ChannelError> {
            if self.closes.load(Ordering::SeqCst) > 0 {
                return Err(ChannelError::Transport("sctp: connection closed".into()));
            }
            self.sent.lock().push(data);
            self.sent_notify.notify_waiters();
            Ok(())
        }

        async fn buffered_amount(&self) -> usize {
            self.buffered.load(Ordering::SeqCst)
        }

        async fn close(&self) -> Result<(), ChannelError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MockPipe;
    use super::*;
    use std::time::Duration;

    fn channel_with(pipe: Arc<MockPipe>) -> Arc<BaseChannel> {
        let limits = ChannelLimits {
            high_water: 100,
            low_water: 10,
            ..ChannelLimits::default()
        };
        BaseChannel::new(pipe, limits)
    }

    #[test_timeout::tokio_timeout_test]
    async fn ready_fires_on_open() {
        let channel = channel_with(Arc::new(MockPipe::default()));
        assert!(!channel.is_ready());
        let waiter = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.ready().await })
        };
        tokio::task::yield_now().await;
        channel.handle_open();
        assert_eq!(waiter.await.expect("join"), Ok(()));
        assert!(channel.is_ready());
    }

    #[test_timeout::tokio_timeout_test]
    async fn ready_fails_when_closed_before_open() {
        let channel = channel_with(Arc::new(MockPipe::default()));
        channel.handle_ice_state(RTCIceConnectionState::Failed);
        let err = channel.ready().await.expect_err("closed channel");
        assert!(matches!(err, ChannelError::Transport(_)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn write_waits_for_low_water() {
        let pipe = Arc::new(MockPipe::default());
        pipe.buffered.store(500, Ordering::SeqCst);
        let channel = channel_with(pipe.clone());

        let writer = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.write(Bytes::from_static(b"frame")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!writer.is_finished());
        assert!(pipe.sent_frames().is_empty());

        pipe.buffered.store(5, Ordering::SeqCst);
        channel.handle_buffered_low();
        assert_eq!(writer.await.expect("join"), Ok(()));
        assert_eq!(pipe.sent_frames(), vec![Bytes::from_static(b"frame")]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn close_unblocks_pending_write_with_closed_pipe() {
        let pipe = Arc::new(MockPipe::default());
        pipe.buffered.store(500, Ordering::SeqCst);
        let channel = channel_with(pipe.clone());

        let writer = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.write(Bytes::from_static(b"stuck")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        channel.close().await;
        assert_eq!(writer.await.expect("join"), Err(ChannelError::ClosedPipe));
        assert_eq!(
            channel.write(Bytes::from_static(b"late")).await,
            Err(ChannelError::ClosedPipe)
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn close_is_idempotent_and_keeps_first_reason() {
        let pipe = Arc::new(MockPipe::default());
        let channel = channel_with(pipe.clone());
        channel
            .close_with_reason(Some(ChannelError::Transport("boom".into())))
            .await;
        channel.close().await;
        channel.handle_close();
        channel.handle_ice_state(RTCIceConnectionState::Closed);
        channel.close().await;

        let (closed, reason) = channel.closed();
        assert!(closed);
        assert_eq!(reason, Some(ChannelError::Transport("boom".into())));
        assert_eq!(pipe.closes.load(Ordering::SeqCst), 1);
        assert!(channel.cancel_token().is_cancelled());
    }

    #[test_timeout::tokio_timeout_test]
    async fn ice_disconnect_tears_down_pipe() {
        let pipe = Arc::new(MockPipe::default());
        let channel = channel_with(pipe.clone());
        channel.handle_ice_state(RTCIceConnectionState::Connected);
        assert!(!channel.closed().0);
        channel.handle_ice_state(RTCIceConnectionState::Disconnected);
        channel.close().await;
        assert_eq!(pipe.closes.load(Ordering::SeqCst), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn inbound_messages_flow_until_close() {
        let channel = channel_with(Arc::new(MockPipe::default()));
        let mut inbound = channel.take_inbound().expect("inbound");
        assert!(channel.take_inbound().is_none());
        channel.handle_message(Bytes::from_static(b"one"));
        assert_eq!(inbound.recv().await, Some(Bytes::from_static(b"one")));
        channel.close().await;
        channel.handle_message(Bytes::from_static(b"two"));
        assert!(inbound.try_recv().is_err());
    }

    #[test_timeout::timeout]
    fn benign_errors_are_recognised() {
        assert!(is_benign_error("Abort chunk, with following errors: User Initiated Abort"));
        assert!(is_benign_error("reset packet does not exist"));
        assert!(!is_benign_error("dtls handshake failed"));
    }
}

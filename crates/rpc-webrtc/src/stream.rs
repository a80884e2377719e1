use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::status::Status;
use crate::wire::{PacketMessage, MAX_PACKET_DATA};

type DoneHook = Box<dyn FnOnce(u64) + Send>;

/// State shared by client and server streams: the receive queue, the terminal
/// status latch and the packet reassembly buffer.
///
/// Callers must serialise their own `recv` calls; sending and receiving may overlap.
pub(crate) struct StreamCore {
    id: u64,
    cancel: CancellationToken,
    msgs_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    msgs_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    recv_err: Mutex<Option<Status>>,
    done: CancellationToken,
    packet_buf: Mutex<Option<BytesMut>>,
    max_message_bytes: usize,
    on_done: Mutex<Option<DoneHook>>,
}

impl StreamCore {
    pub(crate) fn new(id: u64, parent: &CancellationToken, max_message_bytes: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            id,
            cancel: parent.child_token(),
            msgs_tx: Mutex::new(Some(tx)),
            msgs_rx: tokio::sync::Mutex::new(rx),
            recv_err: Mutex::new(None),
            done: CancellationToken::new(),
            packet_buf: Mutex::new(None),
            max_message_bytes,
            on_done: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Registers the hook that removes the stream from its channel. Runs once, on close.
    pub(crate) fn set_on_done(&self, hook: impl FnOnce(u64) + Send + 'static) {
        *self.on_done.lock() = Some(Box::new(hook));
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    pub(crate) async fn wait_done(&self) {
        self.done.cancelled().await;
    }

    /// Terminal error, if the stream ended with one.
    pub(crate) fn err(&self) -> Option<Status> {
        self.recv_err.lock().clone()
    }

    /// Appends a fragment. Returns the whole message once its last fragment arrives.
    pub(crate) fn process_packet(&self, packet: PacketMessage) -> Result<Option<Bytes>, Status> {
        let mut guard = self.packet_buf.lock();
        let pending = guard.as_ref().map(BytesMut::len).unwrap_or(0);
        if pending + packet.data.len() > self.max_message_bytes {
            *guard = None;
            warn!(
                target = "rpc_webrtc::stream",
                stream_id = self.id,
                size = pending + packet.data.len(),
                max = self.max_message_bytes,
                "discarding oversized message"
            );
            return Err(Status::resource_exhausted(format!(
                "message exceeds max size of {} bytes",
                self.max_message_bytes
            )));
        }
        if packet.eom && guard.is_none() {
            return Ok(Some(packet.data));
        }
        let buf = guard.get_or_insert_with(BytesMut::new);
        buf.extend_from_slice(&packet.data);
        if packet.eom {
            Ok(guard.take().map(BytesMut::freeze))
        } else {
            Ok(None)
        }
    }

    pub(crate) fn push_message(&self, msg: Bytes) {
        if let Some(tx) = self.msgs_tx.lock().as_ref() {
            let _ = tx.send(msg);
        }
    }

    /// Ends the receive side. Queued messages are still delivered before the end
    /// (or `err`) is reported. Returns false if it was already closed.
    pub(crate) fn close_recv(&self, err: Option<Status>) -> bool {
        let Some(_tx) = self.msgs_tx.lock().take() else {
            return false;
        };
        if let Some(err) = err {
            *self.recv_err.lock() = Some(err);
        }
        true
    }

    /// Finishes the stream. Idempotent; the done hook runs on the first call only.
    pub(crate) fn close(&self, err: Option<Status>) -> bool {
        let recv_was_open = self.close_recv(err.clone());
        if !recv_was_open {
            if let Some(err) = err {
                let mut slot = self.recv_err.lock();
                if slot.is_none() && !self.done.is_cancelled() {
                    *slot = Some(err);
                }
            }
        }
        if self.done.is_cancelled() {
            return false;
        }
        self.done.cancel();
        self.cancel.cancel();
        *self.packet_buf.lock() = None;
        if let Some(hook) = self.on_done.lock().take() {
            hook(self.id);
        }
        true
    }

    /// Next complete message, `Ok(None)` on a clean end, or the terminal error.
    pub(crate) async fn recv(&self) -> Result<Option<Bytes>, Status> {
        let mut rx = self.msgs_rx.lock().await;
        tokio::select! {
            biased;
            msg = rx.recv() => match msg {
                Some(msg) => Ok(Some(msg)),
                None => match self.err() {
                    Some(err) => Err(err),
                    None => Ok(None),
                },
            },
            _ = self.cancel.cancelled() => {
                if let Ok(msg) = rx.try_recv() {
                    return Ok(Some(msg));
                }
                Err(self.err().unwrap_or_else(|| Status::canceled("stream canceled")))
            }
        }
    }
}

/// Splits a message into data-channel sized packets. An empty message is one empty
/// packet so the receiver still sees an end-of-message marker.
pub(crate) fn fragment(msg: &Bytes) -> Vec<PacketMessage> {
    if msg.is_empty() {
        return vec![PacketMessage {
            data: Bytes::new(),
            eom: true,
        }];
    }
    let mut packets = Vec::with_capacity(msg.len().div_ceil(MAX_PACKET_DATA));
    let mut offset = 0;
    while offset < msg.len() {
        let end = (offset + MAX_PACKET_DATA).min(msg.len());
        packets.push(PacketMessage {
            data: msg.slice(offset..end),
            eom: end == msg.len(),
        });
        offset = end;
    }
    packets
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn core() -> StreamCore {
        StreamCore::new(1, &CancellationToken::new(), 4 * MAX_PACKET_DATA)
    }

    #[test_timeout::timeout]
    fn fragment_then_reassemble_is_identity() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let sizes = [
            0,
            1,
            MAX_PACKET_DATA - 1,
            MAX_PACKET_DATA,
            MAX_PACKET_DATA + 1,
            3 * MAX_PACKET_DATA + 17,
        ];
        for size in sizes {
            let mut payload = vec![0u8; size];
            rng.fill(payload.as_mut_slice());
            let payload = Bytes::from(payload);
            let packets = fragment(&payload);
            assert!(packets.iter().all(|p| p.data.len() <= MAX_PACKET_DATA));
            assert_eq!(packets.iter().filter(|p| p.eom).count(), 1);

            let stream = core();
            let mut out = None;
            for packet in packets {
                if let Some(msg) = stream.process_packet(packet).expect("within limit") {
                    assert!(out.is_none());
                    out = Some(msg);
                }
            }
            assert_eq!(out.expect("message"), payload, "size {size}");
        }
    }

    #[test_timeout::timeout]
    fn oversized_reassembly_is_rejected_and_reset() {
        let stream = StreamCore::new(9, &CancellationToken::new(), 10);
        let first = PacketMessage {
            data: Bytes::from_static(b"12345678"),
            eom: false,
        };
        assert_eq!(stream.process_packet(first), Ok(None));
        let second = PacketMessage {
            data: Bytes::from_static(b"9abc"),
            eom: true,
        };
        let err = stream.process_packet(second).expect_err("too large");
        assert_eq!(err.code, crate::status::Code::ResourceExhausted);

        let small = PacketMessage {
            data: Bytes::from_static(b"ok"),
            eom: true,
        };
        assert_eq!(stream.process_packet(small), Ok(Some(Bytes::from_static(b"ok"))));
    }

    #[test_timeout::tokio_timeout_test]
    async fn queued_messages_drain_before_terminal_error() {
        let stream = core();
        stream.push_message(Bytes::from_static(b"a"));
        stream.push_message(Bytes::from_static(b"b"));
        stream.close(Some(Status::internal("boom")));

        assert_eq!(stream.recv().await, Ok(Some(Bytes::from_static(b"a"))));
        assert_eq!(stream.recv().await, Ok(Some(Bytes::from_static(b"b"))));
        assert_eq!(stream.recv().await, Err(Status::internal("boom")));
    }

    #[test_timeout::tokio_timeout_test]
    async fn close_recv_reports_clean_end_without_finishing() {
        let stream = core();
        stream.push_message(Bytes::from_static(b"last"));
        assert!(stream.close_recv(None));
        assert!(!stream.close_recv(None));
        assert_eq!(stream.recv().await, Ok(Some(Bytes::from_static(b"last"))));
        assert_eq!(stream.recv().await, Ok(None));
        assert!(!stream.is_done());
    }

    #[test_timeout::tokio_timeout_test]
    async fn parent_cancel_unblocks_recv() {
        let parent = CancellationToken::new();
        let stream = Arc::new(StreamCore::new(3, &parent, 1024));
        let reader = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.recv().await })
        };
        tokio::task::yield_now().await;
        parent.cancel();
        let err = reader.await.expect("join").expect_err("canceled");
        assert_eq!(err.code, crate::status::Code::Canceled);
    }

    #[test_timeout::tokio_timeout_test]
    async fn done_hook_runs_once() {
        let stream = core();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        stream.set_on_done(move |id| {
            assert_eq!(id, 1);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(stream.close(None));
        assert!(!stream.close(Some(Status::internal("late"))));
        stream.wait_done().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(stream.err(), None);
    }
}

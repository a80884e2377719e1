//! One behavioural suite for every call queue. The Redis run needs a server
//! (`REDIS_URL`, default `redis://127.0.0.1/`) and is ignored by default:
//! `cargo test -p rpc-signaling --test call_queue -- --ignored`.

use std::sync::Arc;
use std::time::Duration;

use rpc_signaling::proto::IceCandidate;
use rpc_signaling::queue::{CallAnswer, CallQueue, MemoryCallQueue, RedisCallQueue};
use rpc_signaling::SignalingError;

async fn memory_queue(deadline: Duration) -> Arc<dyn CallQueue> {
    Arc::new(MemoryCallQueue::new(deadline))
}

async fn redis_queue(deadline: Duration) -> Arc<dyn CallQueue> {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".into());
    let prefix = format!("rpc-signaling-test-{}", uuid::Uuid::new_v4());
    Arc::new(
        RedisCallQueue::connect(&url, prefix, deadline)
            .await
            .expect("redis call queue"),
    )
}

fn hosts(list: &[&str]) -> Vec<String> {
    list.iter().map(|host| host.to_string()).collect()
}

async fn drain_answers(answers: &mut tokio::sync::mpsc::UnboundedReceiver<CallAnswer>) -> Vec<CallAnswer> {
    let mut seen = Vec::new();
    while let Some(answer) = answers.recv().await {
        seen.push(answer);
    }
    seen
}

mod suite {
    use super::*;

    pub async fn exchanges_offer_and_answer(queue: Arc<dyn CallQueue>) {
        let mut handle = queue.send_offer_init("h1", "hello", false).await.expect("offer");
        let mut exchange = queue.recv_offer(&hosts(&["h1"])).await.expect("claim");
        assert_eq!(exchange.uuid(), handle.uuid);
        assert_eq!(exchange.sdp(), "hello");
        assert!(!exchange.disable_trickle());

        queue
            .send_offer_update("h1", &handle.uuid, IceCandidate::new("caller-1"))
            .await
            .expect("caller candidate");
        queue.send_offer_done("h1", &handle.uuid).await.expect("caller done");

        let mut candidates = exchange.take_caller_candidates().expect("candidates");
        assert_eq!(candidates.recv().await, Some(IceCandidate::new("caller-1")));
        assert_eq!(candidates.recv().await, None);
        exchange.caller_done().await;
        assert_eq!(exchange.caller_err(), None);

        exchange
            .answerer_respond(CallAnswer::InitialSdp("world".into()))
            .await
            .expect("answer init");
        exchange
            .answerer_respond(CallAnswer::Candidate(IceCandidate::new("answerer-1")))
            .await
            .expect("answer candidate");
        exchange.answerer_done().await.expect("answerer done");

        assert_eq!(
            drain_answers(&mut handle.answers).await,
            vec![
                CallAnswer::InitialSdp("world".into()),
                CallAnswer::Candidate(IceCandidate::new("answerer-1")),
            ]
        );
        handle.done().await;
        queue.close().await;
    }

    pub async fn at_most_one_answerer_claims(queue: Arc<dyn CallQueue>) {
        let mut waiting = Vec::new();
        for _ in 0..8 {
            let queue = queue.clone();
            waiting.push(tokio::spawn(async move {
                queue.recv_offer(&hosts(&["h0", "h1"])).await.map(|exchange| exchange.uuid().to_string())
            }));
        }
        // give every receiver time to start waiting
        tokio::time::sleep(Duration::from_millis(200)).await;
        let handle = queue.send_offer_init("h1", "hello", false).await.expect("offer");
        tokio::time::sleep(Duration::from_millis(500)).await;
        queue.close().await;

        let mut claimed = Vec::new();
        for task in waiting {
            match task.await.expect("join") {
                Ok(uuid) => claimed.push(uuid),
                Err(err) => assert_eq!(err, SignalingError::Cancelled),
            }
        }
        assert_eq!(claimed, vec![handle.uuid.clone()]);
    }

    pub async fn unanswered_offer_goes_offline(queue: Arc<dyn CallQueue>) {
        let mut handle = queue.send_offer_init("h1", "hello", false).await.expect("offer");
        assert_eq!(
            drain_answers(&mut handle.answers).await,
            vec![CallAnswer::Err(SignalingError::Offline("h1".into()))]
        );
        assert!(handle.is_done());
        let err = queue
            .send_offer_update("h1", &handle.uuid, IceCandidate::new("late"))
            .await
            .expect_err("expired offer");
        assert!(matches!(err, SignalingError::InactiveOffer(_)), "{err:?}");
        queue.close().await;
    }

    pub async fn unknown_offers_are_inactive(queue: Arc<dyn CallQueue>) {
        let err = queue
            .send_offer_update("h1", "no-such-offer", IceCandidate::new("c"))
            .await
            .expect_err("unknown offer");
        assert_eq!(err, SignalingError::InactiveOffer("no-such-offer".into()));
        let err = queue
            .send_offer_done("h1", "no-such-offer")
            .await
            .expect_err("unknown offer");
        assert_eq!(err, SignalingError::InactiveOffer("no-such-offer".into()));
        queue.close().await;
    }

    pub async fn updates_recorded_before_claim_arrive_in_order(queue: Arc<dyn CallQueue>) {
        let handle = queue.send_offer_init("h1", "hello", true).await.expect("offer");
        for i in 0..5 {
            queue
                .send_offer_update("h1", &handle.uuid, IceCandidate::new(format!("c{i}")))
                .await
                .expect("candidate");
        }
        queue
            .send_offer_error("h1", &handle.uuid, SignalingError::Transport("ice failed".into()))
            .await
            .expect("caller error");

        let mut exchange = queue.recv_offer(&hosts(&["h1"])).await.expect("claim");
        assert!(exchange.disable_trickle());
        let mut candidates = exchange.take_caller_candidates().expect("candidates");
        let mut seen = Vec::new();
        while let Some(candidate) = candidates.recv().await {
            seen.push(candidate.candidate);
        }
        assert_eq!(seen, vec!["c0", "c1", "c2", "c3", "c4"]);
        exchange.caller_done().await;
        let err = exchange.caller_err().expect("caller error");
        assert!(err.to_string().contains("ice failed"), "{err}");
        queue.close().await;
    }

    pub async fn answerer_may_respond_before_caller_updates(queue: Arc<dyn CallQueue>) {
        let mut handle = queue.send_offer_init("h1", "hello", false).await.expect("offer");
        let mut exchange = queue.recv_offer(&hosts(&["h1"])).await.expect("claim");
        exchange
            .answerer_respond(CallAnswer::InitialSdp("world".into()))
            .await
            .expect("answer init");
        exchange
            .answerer_respond(CallAnswer::Candidate(IceCandidate::new("c1")))
            .await
            .expect("answer candidate");
        exchange.answerer_done().await.expect("answerer done");

        assert_eq!(
            drain_answers(&mut handle.answers).await,
            vec![
                CallAnswer::InitialSdp("world".into()),
                CallAnswer::Candidate(IceCandidate::new("c1")),
            ]
        );

        queue
            .send_offer_update("h1", &handle.uuid, IceCandidate::new("a"))
            .await
            .expect("caller a");
        queue
            .send_offer_update("h1", &handle.uuid, IceCandidate::new("b"))
            .await
            .expect("caller b");
        queue.send_offer_done("h1", &handle.uuid).await.expect("caller done");

        let mut candidates = exchange.take_caller_candidates().expect("candidates");
        assert_eq!(candidates.recv().await, Some(IceCandidate::new("a")));
        assert_eq!(candidates.recv().await, Some(IceCandidate::new("b")));
        assert_eq!(candidates.recv().await, None);
        exchange.caller_done().await;
        assert_eq!(exchange.caller_err(), None);
        handle.done().await;
        queue.close().await;
    }

    pub async fn abandoned_receives_leave_the_offer_claimable(queue: Arc<dyn CallQueue>) {
        let handle = queue.send_offer_init("h1", "hello", false).await.expect("offer");
        let mut claimed = None;
        for micros in [0, 50, 200, 500, 1_000, 2_000, 5_000, 10_000] {
            let wanted = hosts(&["h1"]);
            let attempt = queue.recv_offer(&wanted);
            if let Ok(result) = tokio::time::timeout(Duration::from_micros(micros), attempt).await {
                claimed = Some(result.expect("claim"));
                break;
            }
        }
        let exchange = match claimed {
            Some(exchange) => exchange,
            None => tokio::time::timeout(Duration::from_secs(3), queue.recv_offer(&hosts(&["h1"])))
                .await
                .expect("offer still pending after abandoned receives")
                .expect("claim"),
        };
        assert_eq!(exchange.uuid(), handle.uuid);
        assert_eq!(exchange.sdp(), "hello");
        drop(exchange);
        queue.close().await;
    }

    pub async fn close_cancels_outstanding_offers(queue: Arc<dyn CallQueue>) {
        let mut handle = queue.send_offer_init("h1", "hello", false).await.expect("offer");
        queue.close().await;
        assert_eq!(
            drain_answers(&mut handle.answers).await,
            vec![CallAnswer::Err(SignalingError::Cancelled)]
        );
        let err = queue.recv_offer(&hosts(&["h1"])).await.expect_err("closed");
        assert_eq!(err, SignalingError::Cancelled);
    }
}

#[test_timeout::tokio_timeout_test(10)]
async fn memory_exchanges_offer_and_answer() {
    suite::exchanges_offer_and_answer(memory_queue(Duration::from_secs(5)).await).await;
}

#[test_timeout::tokio_timeout_test(10, multi_thread)]
async fn memory_at_most_one_answerer_claims() {
    suite::at_most_one_answerer_claims(memory_queue(Duration::from_secs(5)).await).await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn memory_unanswered_offer_goes_offline() {
    suite::unanswered_offer_goes_offline(memory_queue(Duration::from_millis(300)).await).await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn memory_unknown_offers_are_inactive() {
    suite::unknown_offers_are_inactive(memory_queue(Duration::from_secs(5)).await).await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn memory_updates_recorded_before_claim_arrive_in_order() {
    suite::updates_recorded_before_claim_arrive_in_order(memory_queue(Duration::from_secs(5)).await)
        .await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn memory_close_cancels_outstanding_offers() {
    suite::close_cancels_outstanding_offers(memory_queue(Duration::from_secs(5)).await).await;
}

#[test_timeout::tokio_timeout_test(20)]
#[ignore]
async fn redis_exchanges_offer_and_answer() {
    suite::exchanges_offer_and_answer(redis_queue(Duration::from_secs(5)).await).await;
}

#[test_timeout::tokio_timeout_test(20, multi_thread)]
#[ignore]
async fn redis_at_most_one_answerer_claims() {
    suite::at_most_one_answerer_claims(redis_queue(Duration::from_secs(5)).await).await;
}

#[test_timeout::tokio_timeout_test(20)]
#[ignore]
async fn redis_unanswered_offer_goes_offline() {
    suite::unanswered_offer_goes_offline(redis_queue(Duration::from_secs(1)).await).await;
}

#[test_timeout::tokio_timeout_test(20)]
#[ignore]
async fn redis_unknown_offers_are_inactive() {
    suite::unknown_offers_are_inactive(redis_queue(Duration::from_secs(5)).await).await;
}

#[test_timeout::tokio_timeout_test(20)]
#[ignore]
async fn redis_updates_recorded_before_claim_arrive_in_order() {
    suite::updates_recorded_before_claim_arrive_in_order(redis_queue(Duration::from_secs(5)).await)
        .await;
}

#[test_timeout::tokio_timeout_test(20)]
#[ignore]
async fn redis_close_cancels_outstanding_offers() {
    suite::close_cancels_outstanding_offers(redis_queue(Duration::from_secs(5)).await).await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn memory_answerer_may_respond_before_caller_updates() {
    suite::answerer_may_respond_before_caller_updates(memory_queue(Duration::from_secs(5)).await)
        .await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn memory_abandoned_receives_leave_the_offer_claimable() {
    suite::abandoned_receives_leave_the_offer_claimable(memory_queue(Duration::from_secs(5)).await)
        .await;
}

#[test_timeout::tokio_timeout_test(20)]
#[ignore]
async fn redis_answerer_may_respond_before_caller_updates() {
    suite::answerer_may_respond_before_caller_updates(redis_queue(Duration::from_secs(5)).await)
        .await;
}

#[test_timeout::tokio_timeout_test(20)]
#[ignore]
async fn redis_abandoned_receives_leave_the_offer_claimable() {
    suite::abandoned_receives_leave_the_offer_claimable(redis_queue(Duration::from_secs(5)).await)
        .await;
}

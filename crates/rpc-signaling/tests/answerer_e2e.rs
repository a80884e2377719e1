//! Full caller/answerer runs over the webrtc virtual network. They skip when the
//! peer engine cannot be built in this environment.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rpc_signaling::{
    dial, router, Answerer, AnswererConfig, DialOptions, LocalAnswerConnector, MemoryCallQueue,
    SignalingClient, SignalingConfig, SignalingError, SignalingServer, SignalingState,
    WebSocketAnswerConnector,
};
use rpc_webrtc::rtc::VirtualNetwork;
use rpc_webrtc::{new_peer, Metadata, Role, RtcConfig, Services};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Two vnet-bound configs, or `None` when webrtc cannot run here.
async fn virtual_peers() -> Option<(VirtualNetwork, RtcConfig, RtcConfig)> {
    let (net, mut configs) = match VirtualNetwork::new(&["10.0.0.2", "10.0.0.3"]).await {
        Ok(setup) => setup,
        Err(err) => {
            tracing::warn!(target = "rpc_signaling::tests", error = %err, "skipping: no virtual network");
            return None;
        }
    };
    match new_peer(&configs[0], Role::Offerer).await {
        Ok(probe) => probe.close().await,
        Err(err) => {
            tracing::warn!(target = "rpc_signaling::tests", error = %err, "skipping: no peer engine");
            net.stop().await;
            return None;
        }
    }
    let answerer = configs.pop()?;
    let caller = configs.pop()?;
    Some((net, caller, answerer))
}

fn signaling_server(deadline: Duration) -> Arc<SignalingServer> {
    let config = SignalingConfig {
        exchange_deadline: deadline,
        ..SignalingConfig::default()
    };
    Arc::new(SignalingServer::new(Arc::new(MemoryCallQueue::new(deadline)), config))
}

fn echo_services() -> Arc<Services> {
    let mut services = Services::new();
    services.unary("/echo.Echo/Unary", |_ctx, request| async move { Ok(request) });
    Arc::new(services)
}

fn answerer_config(rtc: RtcConfig) -> AnswererConfig {
    let mut config = AnswererConfig::new(vec!["echo-host".into()], echo_services());
    config.rtc = rtc;
    config.reconnect_backoff = Duration::from_millis(100);
    config
}

async fn wait_for_channels(answerer: &Answerer, expected: usize) {
    while answerer.active_channels() != expected {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[test_timeout::tokio_timeout_test(60, multi_thread)]
async fn dial_reaches_an_in_process_answerer() {
    init_tracing();
    let Some((net, caller_rtc, answerer_rtc)) = virtual_peers().await else {
        return;
    };
    let server = signaling_server(Duration::from_secs(10));
    let answerer = Answerer::start(
        Arc::new(LocalAnswerConnector::new(server.clone())),
        answerer_config(answerer_rtc),
    );

    let options = DialOptions {
        rtc: caller_rtc,
        disable_trickle: false,
        timeout: Duration::from_secs(15),
    };
    let client = dial(&*server, "echo-host", options).await.expect("dial");
    let response = client
        .invoke(
            "/echo.Echo/Unary",
            Metadata::new(),
            Bytes::from_static(b"ping"),
            Some(Duration::from_secs(5)),
        )
        .await
        .expect("echo");
    assert_eq!(response.message, Bytes::from_static(b"ping"));
    wait_for_channels(&answerer, 1).await;

    answerer.stop().await;
    assert_eq!(answerer.active_channels(), 0);
    client.close().await;
    server.close().await;
    net.stop().await;
}

#[test_timeout::tokio_timeout_test(60, multi_thread)]
async fn dial_without_trickle_through_websocket_signaling() {
    init_tracing();
    let Some((net, caller_rtc, answerer_rtc)) = virtual_peers().await else {
        return;
    };
    let server = signaling_server(Duration::from_secs(10));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let base = format!("http://{}", listener.local_addr().expect("local addr"));
    let app = router(SignalingState::new(server.clone()))
        .into_make_service_with_connect_info::<SocketAddr>();
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    let answerer = Answerer::start(
        Arc::new(WebSocketAnswerConnector::new(base.clone())),
        answerer_config(answerer_rtc),
    );
    let signaling = SignalingClient::connect(base).await.expect("signaling client");
    let options = DialOptions {
        rtc: caller_rtc,
        disable_trickle: true,
        timeout: Duration::from_secs(15),
    };
    let client = dial(&signaling, "echo-host", options).await.expect("dial");
    let response = client
        .invoke(
            "/echo.Echo/Unary",
            Metadata::new(),
            Bytes::from_static(b"no trickle"),
            Some(Duration::from_secs(5)),
        )
        .await
        .expect("echo");
    assert_eq!(response.message, Bytes::from_static(b"no trickle"));

    answerer.stop().await;
    client.close().await;
    signaling.close().await;
    net.stop().await;
}

#[test_timeout::tokio_timeout_test(30, multi_thread)]
async fn dial_to_an_absent_host_reports_offline() {
    init_tracing();
    let Some((net, caller_rtc, _)) = virtual_peers().await else {
        return;
    };
    let server = signaling_server(Duration::from_millis(500));
    let options = DialOptions {
        rtc: caller_rtc,
        disable_trickle: false,
        timeout: Duration::from_secs(10),
    };
    let err = dial(&*server, "nobody-home", options)
        .await
        .err()
        .expect("no answerer");
    assert_eq!(err, SignalingError::Offline("nobody-home".into()));
    server.close().await;
    net.stop().await;
}

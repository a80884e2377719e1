use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rpc_webrtc::rtc::{decode_sdp, encode_sdp, VirtualNetwork};
use rpc_webrtc::wire::MAX_PACKET_DATA;
use rpc_webrtc::{
    new_peer, ChannelError, ClientChannel, Metadata, Peer, Role, ServerChannel, ServerOptions,
    Services,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn connected_pair() -> Result<(VirtualNetwork, Peer, Peer), ChannelError> {
    let (net, configs) = VirtualNetwork::new(&["10.0.0.2", "10.0.0.3"]).await?;
    let offerer = new_peer(&configs[0], Role::Offerer).await?;
    let answerer = new_peer(&configs[1], Role::Answerer).await?;

    let offer = offerer.local_description(false).await?;
    answerer
        .set_remote_description(decode_sdp(&encode_sdp(&offer)?)?)
        .await?;
    let answer = answerer.local_description(false).await?;
    offerer
        .set_remote_description(decode_sdp(&encode_sdp(&answer)?)?)
        .await?;

    tokio::time::timeout(Duration::from_secs(10), offerer.channel.ready())
        .await
        .map_err(|_| ChannelError::Transport("data channel did not open".into()))??;
    tokio::time::timeout(Duration::from_secs(10), answerer.channel.ready())
        .await
        .map_err(|_| ChannelError::Transport("data channel did not open".into()))??;
    Ok((net, offerer, answerer))
}

#[test_timeout::tokio_timeout_test(45, multi_thread)]
async fn rpc_over_virtual_network() {
    init_tracing();
    let (net, offerer, answerer) = match connected_pair().await {
        Ok(pair) => pair,
        Err(err) => {
            tracing::warn!(target = "rpc_webrtc::tests", error = %err, "skipping webrtc e2e test");
            return;
        }
    };

    let mut services = Services::new();
    services.unary("/echo.Echo/Unary", |_ctx, request| async move { Ok(request) });
    services.streaming("/echo.Echo/Bidi", |_ctx, stream| async move {
        while let Some(msg) = stream.recv_msg().await? {
            stream.send_msg(msg).await?;
        }
        Ok(())
    });
    let server = ServerChannel::new(
        answerer.channel.clone(),
        Arc::new(services),
        ServerOptions::default(),
    );
    let client = ClientChannel::new(offerer.channel.clone());

    let response = client
        .invoke(
            "/echo.Echo/Unary",
            Metadata::new(),
            Bytes::from_static(b"over the wire"),
            Some(Duration::from_secs(5)),
        )
        .await
        .expect("unary call");
    assert_eq!(response.message, Bytes::from_static(b"over the wire"));

    let payload: Bytes = (0..(2 * MAX_PACKET_DATA + 1))
        .map(|i| (i % 13) as u8)
        .collect::<Vec<_>>()
        .into();
    let stream = client
        .new_stream("/echo.Echo/Bidi", Metadata::new(), None)
        .expect("stream");
    stream.send_msg(payload.clone()).await.expect("send");
    assert_eq!(stream.recv_msg().await.expect("recv"), Some(payload));
    stream.close_send().await.expect("close send");
    assert_eq!(stream.recv_msg().await.expect("end"), None);

    client.close().await;
    server.close().await;
    assert!(offerer.channel.closed().0);
    assert!(answerer.channel.closed().0);
    net.stop().await;
}

mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rpc_signaling::{
    router, CallQueue, MemoryCallQueue, MemoryRateLimiter, RateLimiter, RedisCallQueue,
    RedisRateLimiter, SignalingClient, SignalingServer, SignalingState,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::{Cli, Commands, Config, QueueBackend};

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Some(Commands::Check { url }) => check(url).await,
        None => match Config::from_args(cli.serve) {
            Ok(config) => serve(config).await,
            Err(err) => Err(err),
        },
    };
    if let Err(err) = outcome {
        error!("{err:#}");
        std::process::exit(1);
    }
}

async fn check(url: String) -> Result<()> {
    let client = SignalingClient::connect(url.clone())
        .await
        .with_context(|| format!("harbor at {url} is not healthy"))?;
    info!(base_url = client.base_url(), "harbor is healthy");
    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    let deadline = config.signaling.exchange_deadline;
    info!(
        port = config.port,
        queue = ?config.queue,
        exchange_deadline_secs = deadline.as_secs(),
        "starting beach harbor"
    );

    let queue: Arc<dyn CallQueue> = match config.queue {
        QueueBackend::Memory => Arc::new(MemoryCallQueue::new(deadline)),
        QueueBackend::Redis => Arc::new(
            RedisCallQueue::connect(&config.redis_url, config.key_prefix.clone(), deadline)
                .await
                .with_context(|| format!("connecting call queue to {}", config.redis_url))?,
        ),
    };
    let server = Arc::new(SignalingServer::new(queue, config.signaling.clone()));

    let mut state = SignalingState::new(server.clone());
    if let Some(rate) = &config.rate_limit {
        let limiter: Arc<dyn RateLimiter> = if config.uses_redis() {
            Arc::new(
                RedisRateLimiter::connect(
                    &config.redis_url,
                    config.key_prefix.clone(),
                    rate.limit,
                    rate.window,
                )
                .await
                .with_context(|| format!("connecting rate limiter to {}", config.redis_url))?,
            )
        } else {
            Arc::new(MemoryRateLimiter::new(rate.limit, rate.window))
        };
        info!(
            limit = rate.limit,
            window_secs = rate.window.as_secs(),
            "rate limiting calls and answers"
        );
        state = state.with_rate_limiter(limiter);
    }

    let app = router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("beach harbor listening on {addr}");

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;
    server.close().await;
    info!("beach harbor stopped");
    served.context("serving signaling")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

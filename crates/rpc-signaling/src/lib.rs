//! Offer/answer signaling for rpc-webrtc.
//!
//! Callers queue an SDP offer for a destination host; an [`Answerer`] serving that
//! host claims it through the [`CallQueue`], negotiates a peer connection and serves
//! RPCs on the resulting data channel. The queue runs in process or on Redis, and the
//! [`SignalingServer`] can be exposed over HTTP/WebSockets with [`http::router`].

pub mod answerer;
pub mod client;
pub mod config;
pub mod dial;
pub mod error;
pub mod http;
pub mod ice;
pub mod proto;
pub mod queue;
pub mod rate_limit;
pub mod server;

pub use answerer::{
    AnswerConnection, AnswerConnector, AnswerStream, Answerer, AnswererConfig,
    LocalAnswerConnector, WebSocketAnswerConnector,
};
pub use client::{CallSession, SignalingClient};
pub use config::{SignalingConfig, HOST_METADATA_KEY};
pub use dial::{dial, CallEvents, CallSignaling, DialOptions};
pub use error::SignalingError;
pub use http::{router, SignalingState};
pub use ice::{IceServerCache, IceServerProvider, StaticIceServers};
pub use queue::{CallAnswer, CallQueue, MemoryCallQueue, OfferExchange, OfferHandle, RedisCallQueue};
pub use rate_limit::{MemoryRateLimiter, RateLimiter, RedisRateLimiter};
pub use server::{CallStream, SignalingServer};

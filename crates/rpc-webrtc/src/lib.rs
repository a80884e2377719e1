//! Multiplexed, gRPC-shaped RPC streams over a single WebRTC data channel.
//!
//! A [`BaseChannel`] owns the data channel and its backpressure; [`ClientChannel`] and
//! [`ServerChannel`] multiplex numbered streams of headers, fragmented messages and
//! trailers on top of it.

pub mod channel;
pub mod client;
pub mod config;
pub mod rtc;
pub mod server;
pub mod service;
pub mod status;
mod stream;
pub mod wire;
pub mod workers;

pub use channel::{BaseChannel, ChannelError, DataPipe};
pub use client::{ClientChannel, ClientStream, UnaryResponse};
pub use config::{ChannelLimits, RtcConfig};
pub use rtc::{new_peer, Peer, Role};
pub use server::{ServerChannel, ServerOptions, ServerStream};
pub use service::{CallContext, Interceptor, RpcHandler, Services};
pub use status::{Code, Metadata, Status};

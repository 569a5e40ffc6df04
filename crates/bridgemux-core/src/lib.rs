//! bridgemux-core: multiplexed stream transport and RPC layer for the
//! bridge connection.
//!
//! This crate defines:
//! - Transport frames and flags ([`TransportFrame`], [`FrameFlags`])
//! - Stream sub-frames and reassembly ([`StreamFrame`], [`Opcode`],
//!   [`Reassembler`])
//! - Output retention ([`Scrollback`], [`DetachedQueue`])
//! - The stream state machine ([`StreamHandle`], [`StreamStatus`])
//! - The multiplexed connection endpoint ([`Connection`])
//! - The RPC layer ([`RpcClient`], [`Method`], [`Args`])
//! - Transports ([`Transport`]; WebSocket behind the `websocket` /
//!   `websocket-axum` features)

mod config;
mod connection;
mod error;
mod frame;
mod rpc;
mod scrollback;
mod stream;
mod subframe;
mod transfer;
mod transport;

pub use config::*;
pub use connection::*;
pub use error::*;
pub use frame::*;
pub use rpc::*;
pub use scrollback::*;
pub use stream::*;
pub use subframe::*;
pub use transfer::*;
pub use transport::*;

//! bridgemux-relay: the backend endpoint of the bridge connection.
//!
//! The relay implements the peer side of the framing and
//! stream-lifecycle contract: it accepts a SYN per new stream, creates
//! the local operation keyed by the same stream ID synchronously, runs
//! each operation on its own worker task, honors Abort by cancelling
//! the work, and emits FIN when the worker completes. The built-in
//! `"bridge"` handler dispatches RPC invocations through an open-ended
//! command registry.

mod context;
mod registry;
mod relay;
mod rpc;

pub use context::*;
pub use registry::*;
pub use relay::*;
pub use rpc::*;

//! Symmetric request/response RPC over a WebSocket session.
//!
//! Either end may call methods the other end registered. Streaming methods
//! emit zero or more `event` frames before their single `response`.

mod error;
mod methods;
mod peer;

pub use error::RpcError;
pub use methods::{Call, EventSink, MethodTable};
pub use peer::{CallStream, Disconnect, Outbox, Peer};

//! WebSocket transport: JSON-RPC requests in, relay events out.

pub mod client;
pub mod event_bridge;
pub mod handlers;
pub mod rpc;
pub mod server;

pub use server::{start, ServerConfig, ServerHandle};

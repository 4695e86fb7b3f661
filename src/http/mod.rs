//! HTTP module: client connection pooling and the transport layer.

pub mod client;
pub mod server;

pub use server::Transport;

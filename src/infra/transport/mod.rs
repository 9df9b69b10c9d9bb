//! Agent transports.

#[cfg(not(target_arch = "wasm32"))]
pub mod channel;

#[cfg(not(target_arch = "wasm32"))]
pub use channel::{AgentEndpoint, ChannelTransport, Published};

//! Infrastructure adapters for storage and agent transport.

pub mod store;
pub mod transport;

pub use store::InMemoryLabStore;
#[cfg(not(target_arch = "wasm32"))]
pub use transport::ChannelTransport;

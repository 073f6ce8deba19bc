//! Remote tool server integration: wire protocol, transports, supervision.

pub mod cache;
pub mod framing;
pub mod manager;
pub mod protocol;
pub mod transport;

pub use manager::McpManager;

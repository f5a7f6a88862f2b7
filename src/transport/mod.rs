// =============================================================================
// Streaming Transport
// =============================================================================

pub mod backoff;
pub mod client;

pub use backoff::{Backoff, ReconnectPolicy};
pub use client::{
    Compression, ConnectionState, StreamingTransport, TransportConfig, TransportEvent,
};

// =============================================================================
// tickflow — streaming OHLCV ingest, shared ring storage and decimation
// =============================================================================
//
// Data path:
//   transport (WebSocket) -> protocol (binary frames) -> channel (ring per
//   series) -> worker pool (decimation / aggregation) -> render frames
// =============================================================================

pub mod aggregation;
pub mod channel;
pub mod codec;
pub mod decimation;
pub mod error;
pub mod pipeline;
pub mod protocol;
pub mod render;
pub mod runtime_config;
pub mod transport;
pub mod types;
pub mod worker;

pub use error::{PipelineError, Result};

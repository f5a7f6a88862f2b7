// =============================================================================
// Shared Ring Channel
// =============================================================================
//
// - memory:  the two memory backends (shared atomics / single-context cells)
// - ring:    per-series circular point store with atomic metadata
// - staging: non-wrapping DataBuffer for batch staging

pub mod memory;
pub mod ring;
pub mod staging;

pub use memory::{LocalBuffers, LocalMemory, MemoryBackend, SharedBuffers, SharedMemory};
pub use ring::{
    ChannelConfig, LocalRingChannel, RingChannel, SharedRingChannel, UpsertOutcome, WaitOutcome,
};
pub use staging::DataBuffer;

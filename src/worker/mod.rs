// =============================================================================
// Worker Dispatch Pool
// =============================================================================
//
// - task: task payloads, outputs and the default handler
// - pool: thread pool with id-correlated request/response

pub mod pool;
pub mod task;

pub use pool::{default_pool_size, PoolConfig, PoolEvent, TaskHandler, WorkerPool};
pub use task::{run_task, TaskKind, TaskOutput, WorkerTask};

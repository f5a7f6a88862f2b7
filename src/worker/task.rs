// =============================================================================
// Worker tasks — request / response payloads and the default handler
// =============================================================================

use bytes::Bytes;

use crate::aggregation::aggregate;
use crate::decimation::{DecimationJob, DecimationOutput};
use crate::error::Result;
use crate::protocol::{decode_message, Message};
use crate::types::Candle;

/// Work that can be shipped to a pool worker. Payloads are moved, never
/// shared, across the thread boundary.
#[derive(Debug, Clone)]
pub enum WorkerTask {
    Decimate(DecimationJob),
    Aggregate {
        candles: Vec<Candle>,
        interval_seconds: u32,
    },
    DecodeMessage(Bytes),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Decimate,
    Aggregate,
    DecodeMessage,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Decimate => "decimate",
            Self::Aggregate => "aggregate",
            Self::DecodeMessage => "decode_message",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl WorkerTask {
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::Decimate(_) => TaskKind::Decimate,
            Self::Aggregate { .. } => TaskKind::Aggregate,
            Self::DecodeMessage(_) => TaskKind::DecodeMessage,
        }
    }
}

/// Successful result of a [`WorkerTask`].
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutput {
    Decimated(DecimationOutput),
    Aggregated(Vec<Candle>),
    Decoded(Option<Message>),
}

/// The handler every pool worker runs unless a custom one is injected.
pub fn run_task(task: WorkerTask) -> Result<TaskOutput> {
    match task {
        WorkerTask::Decimate(job) => job.run().map(TaskOutput::Decimated),
        WorkerTask::Aggregate {
            candles,
            interval_seconds,
        } => aggregate(&candles, interval_seconds).map(TaskOutput::Aggregated),
        WorkerTask::DecodeMessage(bytes) => decode_message(&bytes).map(TaskOutput::Decoded),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_heartbeat_at;

    #[test]
    fn dispatches_by_kind() {
        let task = WorkerTask::DecodeMessage(encode_heartbeat_at(7));
        assert_eq!(task.kind().as_str(), "decode_message");
        assert_eq!(
            run_task(task).unwrap(),
            TaskOutput::Decoded(Some(Message::Heartbeat { timestamp: 7 }))
        );

        let candles = vec![Candle::new(0.0, 1.0, 2.0, 0.5, 1.5, 3.0)];
        let out = run_task(WorkerTask::Aggregate {
            candles: candles.clone(),
            interval_seconds: 60,
        })
        .unwrap();
        assert_eq!(out, TaskOutput::Aggregated(candles));
    }

    #[test]
    fn handler_errors_propagate() {
        let task = WorkerTask::Aggregate {
            candles: vec![],
            interval_seconds: 0,
        };
        assert!(run_task(task).is_err());
    }
}

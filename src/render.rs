// =============================================================================
// Render tick — channel window -> decimated frame
// =============================================================================
//
// `tick` never blocks. A window that already fits the point budget becomes a
// frame immediately. A larger one is shipped to the worker pool, and until
// that task finishes the caller keeps getting the previous frame (stale but
// valid). A failed decimation keeps the old frame too.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::channel::SharedRingChannel;
use crate::decimation::{Algorithm, DecimationJob};
use crate::error::Result;
use crate::worker::{TaskOutput, WorkerPool, WorkerTask};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderConfig {
    /// Most points a frame may carry.
    pub target_points: usize,
    /// Newest points read from the channel per tick.
    pub visible_points: usize,
    #[serde(default)]
    pub algorithm: Algorithm,
}

/// One series' drawable points, in the channel's byte layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub series: usize,
    pub data: Bytes,
    pub point_count: usize,
    /// Points in the window the frame was built from.
    pub source_count: usize,
    pub decimated: bool,
    pub sequence: u64,
}

#[derive(Default)]
struct Slot {
    frame: Option<Arc<Frame>>,
    in_flight: bool,
}

pub struct FrameProducer {
    channel: Arc<SharedRingChannel>,
    pool: Arc<WorkerPool>,
    config: RenderConfig,
    slots: Arc<Mutex<HashMap<usize, Slot>>>,
    sequence: Arc<AtomicU64>,
}

impl FrameProducer {
    pub fn new(channel: Arc<SharedRingChannel>, pool: Arc<WorkerPool>, config: RenderConfig) -> Self {
        Self {
            channel,
            pool,
            config,
            slots: Arc::new(Mutex::new(HashMap::new())),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    /// The last completed frame for `series`, if any.
    pub fn current(&self, series: usize) -> Option<Arc<Frame>> {
        self.slots.lock().get(&series).and_then(|s| s.frame.clone())
    }

    /// Produce the frame to draw now. Must be called inside a tokio runtime
    /// when the window needs decimation.
    pub fn tick(&self, series: usize) -> Result<Option<Arc<Frame>>> {
        let data = self.channel.latest_bytes(series, self.config.visible_points)?;
        let stride = self.channel.layout().stride();
        let source_count = data.len() / stride;

        if source_count <= self.config.target_points {
            let frame = Arc::new(Frame {
                series,
                data,
                point_count: source_count,
                source_count,
                decimated: false,
                sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            });
            let mut slots = self.slots.lock();
            slots.entry(series).or_default().frame = Some(frame.clone());
            return Ok(Some(frame));
        }

        let mut slots = self.slots.lock();
        let slot = slots.entry(series).or_default();
        if !slot.in_flight {
            slot.in_flight = true;
            self.dispatch(series, data, source_count);
        }
        Ok(slot.frame.clone())
    }

    fn dispatch(&self, series: usize, data: Bytes, source_count: usize) {
        let job = DecimationJob {
            data,
            layout: self.channel.layout(),
            target: self.config.target_points,
            algorithm: self.config.algorithm,
            keep_indices: false,
        };
        let pool = self.pool.clone();
        let slots = self.slots.clone();
        let sequence = self.sequence.clone();

        tokio::spawn(async move {
            let result = pool.execute(WorkerTask::Decimate(job)).await;
            let mut slots = slots.lock();
            let slot = slots.entry(series).or_default();
            slot.in_flight = false;
            match result {
                Ok(TaskOutput::Decimated(out)) => {
                    debug!(series, source_count, points = out.point_count, "frame decimated");
                    slot.frame = Some(Arc::new(Frame {
                        series,
                        data: out.data,
                        point_count: out.point_count,
                        source_count,
                        decimated: true,
                        sequence: sequence.fetch_add(1, Ordering::Relaxed),
                    }));
                }
                Ok(other) => warn!(series, output = ?other, "unexpected worker output for frame"),
                Err(e) => warn!(series, error = %e, "decimation failed, keeping previous frame"),
            }
        });
    }
}

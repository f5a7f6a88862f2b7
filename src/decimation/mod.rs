// =============================================================================
// Decimation Engine
// =============================================================================
//
// Point reduction for display. Every algorithm works on index selection so
// the caller can keep the original positions of the retained points (needed
// for exact-value lookups after reduction).
//
// - nth_point:       first point of each bucket, O(n)
// - douglas_peucker: shape-preserving simplification, approximate count
// - lttb:            exact count, visually faithful for lines/areas
// - min_max:         both extremes per bucket, for volume/volatility
// =============================================================================

pub mod douglas_peucker;
pub mod lttb;
pub mod min_max;
pub mod nth_point;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::channel::DataBuffer;
use crate::codec::decode_points;
use crate::error::Result;
use crate::types::{Candle, Point, PointLayout, WirePoint};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Algorithm {
    NthPoint,
    DouglasPeucker {
        #[serde(default)]
        tolerance: Option<f32>,
    },
    Lttb,
    MinMax,
}

impl Default for Algorithm {
    fn default() -> Self {
        Self::Lttb
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NthPoint => write!(f, "nth_point"),
            Self::DouglasPeucker { .. } => write!(f, "douglas_peucker"),
            Self::Lttb => write!(f, "lttb"),
            Self::MinMax => write!(f, "min_max"),
        }
    }
}

/// Reduced points plus the input index of each retained point.
#[derive(Debug, Clone, PartialEq)]
pub struct Decimated<P> {
    pub points: Vec<P>,
    pub indices: Vec<usize>,
}

impl<P: WirePoint> Decimated<P> {
    fn identity(points: &[P]) -> Self {
        Self {
            points: points.to_vec(),
            indices: (0..points.len()).collect(),
        }
    }

    fn from_indices(points: &[P], indices: Vec<usize>) -> Self {
        Self {
            points: indices.iter().map(|&i| points[i]).collect(),
            indices,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

fn select<P: WirePoint>(points: &[P], target: usize, algorithm: Algorithm) -> Vec<usize> {
    match algorithm {
        Algorithm::NthPoint => nth_point::select(points.len(), target),
        Algorithm::DouglasPeucker { tolerance } => {
            douglas_peucker::select(points, tolerance.map(f64::from))
        }
        Algorithm::Lttb => lttb::select(points, target),
        Algorithm::MinMax => min_max::select(points, target),
    }
}

/// Reduce `points` toward `target` with `algorithm`.
///
/// Input no longer than `target` comes back unchanged. Douglas-Peucker may
/// return more than `target` points; use [`decimate_capped`] for a hard cap.
pub fn decimate<P: WirePoint>(points: &[P], target: usize, algorithm: Algorithm) -> Decimated<P> {
    if points.len() <= target {
        return Decimated::identity(points);
    }
    if target == 0 {
        return Decimated {
            points: Vec::new(),
            indices: Vec::new(),
        };
    }
    Decimated::from_indices(points, select(points, target, algorithm))
}

/// Like [`decimate`], but never returns more than `target` points. Oversized
/// output is thinned with nth-point over the retained set.
pub fn decimate_capped<P: WirePoint>(
    points: &[P],
    target: usize,
    algorithm: Algorithm,
) -> Decimated<P> {
    let first = decimate(points, target, algorithm);
    if first.len() <= target {
        return first;
    }
    let keep = nth_point::select(first.len(), target);
    Decimated {
        points: keep.iter().map(|&i| first.points[i]).collect(),
        indices: keep.iter().map(|&i| first.indices[i]).collect(),
    }
}

// ---------------------------------------------------------------------------
// Byte-level job (what the worker pool runs)
// ---------------------------------------------------------------------------

/// A decimation request over an encoded point buffer.
#[derive(Debug, Clone)]
pub struct DecimationJob {
    pub data: Bytes,
    pub layout: PointLayout,
    pub target: usize,
    pub algorithm: Algorithm,
    pub keep_indices: bool,
}

/// Result of a [`DecimationJob`], in the same layout as the input.
#[derive(Debug, Clone, PartialEq)]
pub struct DecimationOutput {
    pub data: Bytes,
    pub indices: Option<Vec<u32>>,
    pub point_count: usize,
}

impl DecimationJob {
    pub fn run(&self) -> Result<DecimationOutput> {
        match self.layout {
            PointLayout::Scalar => self.run_typed::<Point>(),
            PointLayout::Candle => self.run_typed::<Candle>(),
        }
    }

    fn run_typed<P: WirePoint>(&self) -> Result<DecimationOutput> {
        let points = decode_points::<P>(&self.data)?;
        let reduced = decimate_capped(&points, self.target, self.algorithm);
        // Sized to the point cap: oversized output fails instead of shipping.
        let mut staged = DataBuffer::new(self.target.min(points.len()) * P::LAYOUT.stride());
        staged.append_points(&reduced.points)?;
        Ok(DecimationOutput {
            data: staged.drain(),
            indices: self
                .keep_indices
                .then(|| reduced.indices.iter().map(|&i| i as u32).collect()),
            point_count: reduced.len(),
        })
    }
}

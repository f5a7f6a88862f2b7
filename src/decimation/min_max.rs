// =============================================================================
// MinMax decimation
// =============================================================================
//
// target/2 buckets of ceil(n / buckets) points; each bucket contributes its
// minimum and maximum by value, in index order. Peaks and troughs survive
// exactly, which is what a price chart needs from a zoomed-out view.
// =============================================================================

use super::nth_point;
use crate::types::WirePoint;

/// Indices retained by MinMax. A bucket whose min and max coincide (single
/// point or flat values) contributes that index twice.
pub fn select<P: WirePoint>(points: &[P], target: usize) -> Vec<usize> {
    let n = points.len();
    if target >= n {
        return (0..n).collect();
    }
    if target < 2 {
        return nth_point::select(n, target);
    }

    let buckets = (target / 2).max(1);
    let size = n.div_ceil(buckets);
    let mut out = Vec::with_capacity(buckets * 2);

    for start in (0..n).step_by(size) {
        let end = (start + size).min(n);
        let mut lo = start;
        let mut hi = start;
        for i in start + 1..end {
            let v = points[i].value();
            if v < points[lo].value() {
                lo = i;
            }
            if v > points[hi].value() {
                hi = i;
            }
        }
        out.push(lo.min(hi));
        out.push(lo.max(hi));
    }
    out
}

// =============================================================================
// Nth-point decimation
// =============================================================================
//
// Split the input into contiguous buckets of `ceil(len / target)` points and
// keep the first point of each. O(n), used as the cheap path and as the
// trimming fallback for algorithms without an exact output count.
// =============================================================================

/// Indices of the first point of each bucket.
///
/// Returns every index when `len <= target`, and nothing when `target == 0`.
pub fn select(len: usize, target: usize) -> Vec<usize> {
    if target == 0 {
        return Vec::new();
    }
    if len <= target {
        return (0..len).collect();
    }
    let bucket = len.div_ceil(target);
    (0..len).step_by(bucket).collect()
}

// =============================================================================
// Largest-Triangle-Three-Buckets (LTTB)
// =============================================================================
//
// The first and last points are always kept. The n-2 interior points are
// split into target-2 buckets; from each bucket we keep the point forming the
// largest triangle with the previously kept point and the centroid of the
// next bucket. Every bucket is scanned once, so the whole pass is O(n).
//
// Output size is exactly `target` whenever `len >= target >= 2`.
// =============================================================================

use crate::types::WirePoint;

/// Indices retained by LTTB, ascending.
pub fn select<P: WirePoint>(points: &[P], target: usize) -> Vec<usize> {
    let n = points.len();
    if target >= n {
        return (0..n).collect();
    }
    match target {
        0 => return Vec::new(),
        1 => return vec![0],
        2 => return vec![0, n - 1],
        _ => {}
    }

    let every = (n - 2) as f64 / (target - 2) as f64;
    let bucket_bound = |i: usize| ((i as f64 * every).floor() as usize + 1).min(n - 1);

    let mut out = Vec::with_capacity(target);
    out.push(0);
    let mut a = 0usize;

    for i in 0..target - 2 {
        let start = bucket_bound(i);
        let end = bucket_bound(i + 1).max(start + 1);

        // Centroid of the next bucket; the last interior bucket looks ahead
        // to the final point.
        let next_start = end;
        let next_end = (((i + 2) as f64 * every).floor() as usize + 1).clamp(next_start + 1, n);
        let span = (next_end - next_start) as f64;
        let (sum_x, sum_y) = points[next_start..next_end]
            .iter()
            .fold((0.0f64, 0.0f64), |(sx, sy), p| {
                (sx + p.time() as f64, sy + p.value() as f64)
            });
        let (cx, cy) = (sum_x / span, sum_y / span);

        let ax = points[a].time() as f64;
        let ay = points[a].value() as f64;

        let mut max_area = -1.0f64;
        let mut max_idx = start;
        for (k, p) in points.iter().enumerate().take(end).skip(start) {
            let px = p.time() as f64;
            let py = p.value() as f64;
            // Twice the triangle area; the factor does not change the argmax.
            let area = ((ax - cx) * (py - ay) - (ax - px) * (cy - ay)).abs();
            if area > max_area {
                max_area = area;
                max_idx = k;
            }
        }

        out.push(max_idx);
        a = max_idx;
    }

    out.push(n - 1);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Point;

    fn sine(n: usize) -> Vec<Point> {
        (0..n)
            .map(|i| Point::new(i as f32, (i as f32 * 0.01).sin() * 100.0))
            .collect()
    }

    #[test]
    fn exact_output_size_with_fixed_endpoints() {
        for (n, target) in [(10, 3), (100, 7), (1_000, 999), (1_001, 1_000), (5_000, 1_000)] {
            let out = select(&sine(n), target);
            assert_eq!(out.len(), target, "n={n} target={target}");
            assert_eq!(out[0], 0);
            assert_eq!(*out.last().unwrap(), n - 1);
            assert!(out.windows(2).all(|w| w[0] < w[1]), "indices must ascend");
        }
    }

    #[test]
    fn small_targets() {
        let pts = sine(50);
        assert!(select(&pts, 0).is_empty());
        assert_eq!(select(&pts, 1), vec![0]);
        assert_eq!(select(&pts, 2), vec![0, 49]);
    }

    #[test]
    fn keeps_isolated_spike() {
        let mut pts: Vec<Point> = (0..1_000).map(|i| Point::new(i as f32, 0.0)).collect();
        pts[501].value = 1_000.0;
        let out = select(&pts, 20);
        assert!(out.contains(&501));
    }

    #[test]
    fn flat_series_picks_first_point_of_each_bucket() {
        let pts: Vec<Point> = (0..12).map(|i| Point::new(i as f32, 5.0)).collect();
        // every = 10 / 3; buckets start at 1, 4, 7.
        assert_eq!(select(&pts, 5), vec![0, 1, 4, 7, 11]);
    }
}

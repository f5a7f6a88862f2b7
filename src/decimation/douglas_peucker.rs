// =============================================================================
// Douglas-Peucker line simplification
// =============================================================================
//
// For a segment [start, end], keep the interior point farthest from the line
// through the endpoints when that distance exceeds `tolerance`, then recurse
// on both halves; otherwise the segment collapses to its endpoints. Segments
// of two or fewer points terminate.
//
// The output size depends on the data, not on a target count. Callers that
// need a hard cap re-check the length and trim with nth-point.
// =============================================================================

use crate::types::WirePoint;

/// Default tolerance: one percent of the value range.
pub fn default_tolerance<P: WirePoint>(points: &[P]) -> f64 {
    let (min, max) = points.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| {
        let v = p.value() as f64;
        (lo.min(v), hi.max(v))
    });
    if min.is_finite() && max.is_finite() {
        (max - min) / 100.0
    } else {
        0.0
    }
}

/// Perpendicular distance from `p` to the line through `a` and `b`. Falls
/// back to the distance from `a` when the endpoints coincide.
fn perpendicular_distance(p: (f64, f64), a: (f64, f64), b: (f64, f64)) -> f64 {
    let dx = b.0 - a.0;
    let dy = b.1 - a.1;
    let len = (dx * dx + dy * dy).sqrt();
    if len == 0.0 {
        return ((p.0 - a.0).powi(2) + (p.1 - a.1).powi(2)).sqrt();
    }
    (dy * p.0 - dx * p.1 + b.0 * a.1 - b.1 * a.0).abs() / len
}

fn xy<P: WirePoint>(p: &P) -> (f64, f64) {
    (p.time() as f64, p.value() as f64)
}

/// Indices retained by Douglas-Peucker, ascending. Ties on the maximum
/// distance keep the earliest index.
pub fn select<P: WirePoint>(points: &[P], tolerance: Option<f64>) -> Vec<usize> {
    let n = points.len();
    if n <= 2 {
        return (0..n).collect();
    }
    let tolerance = tolerance.unwrap_or_else(|| default_tolerance(points));

    let mut keep = vec![false; n];
    keep[0] = true;
    keep[n - 1] = true;

    // Explicit stack instead of recursion: 250k-point inputs would otherwise
    // risk the thread's stack on monotonic data.
    let mut stack = vec![(0usize, n - 1)];
    while let Some((start, end)) = stack.pop() {
        if end - start < 2 {
            continue;
        }
        let a = xy(&points[start]);
        let b = xy(&points[end]);
        let mut max_dist = -1.0f64;
        let mut max_idx = start + 1;
        for (i, p) in points.iter().enumerate().take(end).skip(start + 1) {
            let d = perpendicular_distance(xy(p), a, b);
            if d > max_dist {
                max_dist = d;
                max_idx = i;
            }
        }
        if max_dist > tolerance {
            keep[max_idx] = true;
            stack.push((max_idx, end));
            stack.push((start, max_idx));
        }
    }

    keep.iter()
        .enumerate()
        .filter_map(|(i, k)| k.then_some(i))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Point;

    fn series(values: &[f32]) -> Vec<Point> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| Point::new(i as f32, *v))
            .collect()
    }

    #[test]
    fn straight_line_collapses_to_endpoints() {
        let pts: Vec<Point> = (0..100).map(|i| Point::new(i as f32, i as f32 * 2.0)).collect();
        assert_eq!(select(&pts, None), vec![0, 99]);
    }

    #[test]
    fn spike_is_kept() {
        let mut values = vec![1.0; 50];
        values[20] = 100.0;
        let out = select(&series(&values), None);
        assert!(out.contains(&20));
        assert_eq!(out.first(), Some(&0));
        assert_eq!(out.last(), Some(&49));
    }

    #[test]
    fn explicit_tolerance_overrides_default() {
        let values = [0.0, 0.5, 0.0, 0.5, 0.0];
        assert_eq!(select(&series(&values), Some(10.0)), vec![0, 4]);
        assert_eq!(select(&series(&values), Some(0.1)).len(), 5);
    }

    #[test]
    fn tie_keeps_earliest_index() {
        // Points 1 and 3 are equally far from the baseline.
        let values = [0.0, 5.0, 0.0, 5.0, 0.0];
        assert_eq!(select(&series(&values), Some(4.0)), vec![0, 1, 4]);
    }

    #[test]
    fn default_tolerance_is_one_percent_of_range() {
        let pts = series(&[10.0, 210.0, 60.0]);
        assert!((default_tolerance(&pts) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn two_points_or_fewer_are_kept() {
        assert_eq!(select(&series(&[1.0, 2.0]), None), vec![0, 1]);
        assert!(select::<Point>(&[], None).is_empty());
    }

    #[test]
    fn deep_monotonic_input_does_not_overflow() {
        // Exponential curve forces a split at nearly every point.
        let pts: Vec<Point> = (0..5_000)
            .map(|i| Point::new(i as f32, (i as f32 / 500.0).exp()))
            .collect();
        let out = select(&pts, Some(0.0));
        assert!(out.len() > 2);
        assert!(out.windows(2).all(|w| w[0] < w[1]));
    }
}

// =============================================================================
// Aggregation Engine — roll candles up into coarser intervals
// =============================================================================
//
// Pure, stateless: candles are grouped by floor(time / interval) * interval.
// Within a group: open = first, close = last, high = max, low = min,
// volume = sum. "First" and "last" follow input order among candles with the
// same time, and time order otherwise.
// =============================================================================

use std::collections::BTreeMap;

use crate::error::{PipelineError, Result};
use crate::types::Candle;

/// Bucket start for `time` at `interval_seconds`.
pub fn bucket_start(time: f32, interval_seconds: u32) -> f32 {
    let interval = interval_seconds as f64;
    ((time as f64 / interval).floor() * interval) as f32
}

/// Aggregate `candles` into `interval_seconds` buckets, ascending by bucket
/// time. Empty buckets are never emitted.
pub fn aggregate(candles: &[Candle], interval_seconds: u32) -> Result<Vec<Candle>> {
    if interval_seconds == 0 {
        return Err(PipelineError::InvalidInput(
            "aggregation interval must be positive".into(),
        ));
    }

    // Key on the bucket index, which is exact, rather than the float start.
    let interval = interval_seconds as f64;
    let mut groups: BTreeMap<i64, Vec<&Candle>> = BTreeMap::new();
    for candle in candles {
        let key = (candle.time as f64 / interval).floor() as i64;
        groups.entry(key).or_default().push(candle);
    }

    let out = groups
        .into_iter()
        .map(|(key, mut members)| {
            // Stable: equal times keep arrival order.
            members.sort_by(|a, b| a.time.total_cmp(&b.time));
            let first = members[0];
            let last = members[members.len() - 1];
            let (high, low, volume) = members.iter().fold(
                (f32::NEG_INFINITY, f32::INFINITY, 0.0f32),
                |(h, l, v), c| (h.max(c.high), l.min(c.low), v + c.volume),
            );
            Candle::new((key as f64 * interval) as f32, first.open, high, low, last.close, volume)
        })
        .collect();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(time: f32, open: f32, high: f32, low: f32, close: f32, volume: f32) -> Candle {
        Candle::new(time, open, high, low, close, volume)
    }

    #[test]
    fn five_minute_buckets_match_hand_computed() {
        let one_minute = vec![
            c(0.0, 10.0, 12.0, 9.0, 11.0, 1.0),
            c(60.0, 11.0, 15.0, 10.0, 14.0, 2.0),
            c(120.0, 14.0, 14.5, 8.0, 9.0, 3.0),
            c(180.0, 9.0, 10.0, 8.5, 9.5, 4.0),
            c(240.0, 9.5, 11.0, 9.0, 10.5, 5.0),
            c(300.0, 10.5, 13.0, 10.0, 12.0, 6.0),
            c(360.0, 12.0, 12.5, 7.0, 7.5, 7.0),
        ];
        let out = aggregate(&one_minute, 300).unwrap();
        assert_eq!(
            out,
            vec![
                c(0.0, 10.0, 15.0, 8.0, 10.5, 15.0),
                c(300.0, 10.5, 13.0, 7.0, 7.5, 13.0),
            ]
        );
    }

    #[test]
    fn single_candle_passes_through() {
        let one = c(600.0, 1.0, 2.0, 0.5, 1.5, 9.0);
        assert_eq!(aggregate(&[one], 300).unwrap(), vec![one]);
    }

    #[test]
    fn gaps_are_not_emitted_and_output_is_sorted() {
        let input = vec![
            c(3_700.0, 5.0, 6.0, 4.0, 5.5, 1.0),
            c(10.0, 1.0, 2.0, 0.5, 1.5, 1.0),
        ];
        let out = aggregate(&input, 60).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].time, 0.0);
        assert_eq!(out[1].time, 3_660.0);
    }

    #[test]
    fn unsorted_input_uses_time_order_for_open_close() {
        let input = vec![
            c(120.0, 3.0, 3.0, 3.0, 3.0, 1.0),
            c(0.0, 1.0, 1.0, 1.0, 1.0, 1.0),
            c(60.0, 2.0, 2.0, 2.0, 2.0, 1.0),
        ];
        let out = aggregate(&input, 300).unwrap();
        assert_eq!(out, vec![c(0.0, 1.0, 3.0, 1.0, 3.0, 3.0)]);
    }

    #[test]
    fn zero_interval_is_rejected() {
        assert!(matches!(aggregate(&[], 0), Err(PipelineError::InvalidInput(_))));
        assert!(aggregate(&[], 60).unwrap().is_empty());
    }

    #[test]
    fn bucket_start_floors() {
        assert_eq!(bucket_start(299.0, 300), 0.0);
        assert_eq!(bucket_start(300.0, 300), 300.0);
        assert_eq!(bucket_start(-1.0, 60), -60.0);
    }
}

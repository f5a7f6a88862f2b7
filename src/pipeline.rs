// =============================================================================
// Feed Pipeline — transport -> protocol -> ring channel
// =============================================================================
//
// One ring series per subscribed symbol, candle layout. Updates are merged
// into the candle already stored at the same timestamp (present fields
// replace, never accumulate) and upserted, so a replayed or re-delivered
// update is idempotent and late updates land in time order.
//
// Stored times are f32 offsets from a time origin. Without a configured
// origin the first applied update anchors it. An offset beyond the range
// where f32 still holds whole seconds exactly is rejected, since it would
// collapse distinct candles onto one slot.
//
// Malformed frames are logged and dropped; the connection stays up.
// `stop()` unsubscribes and clears every series, but does not touch tasks
// already handed to the worker pool.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::channel::{ChannelConfig, SharedRingChannel, UpsertOutcome};
use crate::error::{PipelineError, Result};
use crate::protocol::{decode_message, encode_subscribe, encode_unsubscribe, Message, Update};
use crate::transport::{StreamingTransport, TransportConfig, TransportEvent};
use crate::types::{Candle, PointLayout};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub symbols: Vec<String>,
    pub fields: Vec<String>,
    pub max_data_points: usize,
    /// Subtracted from wire timestamps before narrowing to f32. `None`
    /// anchors it to the first applied update.
    #[serde(default)]
    pub time_origin: Option<f64>,
    /// Only candles are ingested; anything else is rejected at construction.
    #[serde(default)]
    pub layout: PointLayout,
}

/// Largest offset from the origin at which f32 still represents every whole
/// second (2^24).
pub const MAX_TIME_OFFSET: f64 = 16_777_216.0;

/// Ingest counters.
#[derive(Debug, Default)]
pub struct IngestStats {
    pub applied: AtomicU64,
    pub dropped: AtomicU64,
}

impl IngestStats {
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// The part of the pipeline the ingest task owns a handle to.
struct Ingest {
    channel: Arc<SharedRingChannel>,
    series: HashMap<String, usize>,
    time_origin: OnceLock<f64>,
    stats: IngestStats,
}

impl Ingest {
    fn apply_update(&self, update: &Update) -> Result<Option<UpsertOutcome>> {
        let Some(&series) = self.series.get(&update.symbol) else {
            debug!(symbol = %update.symbol, "update for unsubscribed symbol, ignoring");
            return Ok(None);
        };
        let time = self.stored_time(&update.symbol, update.timestamp)?;
        let existing = match self.channel.find_time(series, time)? {
            Some(idx) => self
                .channel
                .read_points::<Candle>(series, idx, 1)?
                .into_iter()
                .next(),
            None => None,
        };
        let candle = update.merge_into(time, existing);
        let outcome = self.channel.upsert(series, candle)?;
        trace!(symbol = %update.symbol, time, ?outcome, "update applied");
        Ok(Some(outcome))
    }

    fn stored_time(&self, symbol: &str, timestamp: f64) -> Result<f32> {
        if !timestamp.is_finite() {
            return Err(PipelineError::InvalidInput(format!(
                "{symbol}: non-finite timestamp {timestamp}"
            )));
        }
        let origin = *self.time_origin.get_or_init(|| {
            info!(origin = timestamp, "time origin anchored to first update");
            timestamp
        });
        let offset = timestamp - origin;
        if offset.abs() >= MAX_TIME_OFFSET {
            return Err(PipelineError::InvalidInput(format!(
                "{symbol}: timestamp {timestamp} is {offset}s from origin {origin}, beyond f32 precision"
            )));
        }
        Ok(offset as f32)
    }

    fn apply(&self, bytes: &[u8]) -> Result<Option<UpsertOutcome>> {
        let outcome = match decode_message(bytes)? {
            Some(Message::Update(update)) => self.apply_update(&update)?,
            Some(Message::Heartbeat { timestamp }) => {
                trace!(timestamp, "heartbeat");
                None
            }
            // Reserved bodies: nothing to apply.
            Some(Message::Snapshot(_)) | Some(Message::Error(_)) => None,
            Some(other) => {
                debug!(kind = ?other.message_type(), "unexpected client-bound message, ignoring");
                None
            }
            None => None,
        };
        if outcome.is_some() {
            self.stats.applied.fetch_add(1, Ordering::Relaxed);
        }
        Ok(outcome)
    }
}

pub struct FeedPipeline {
    ingest: Arc<Ingest>,
    transport: StreamingTransport,
    symbols: Vec<String>,
    subscribe: Bytes,
    unsubscribe: Bytes,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FeedPipeline {
    pub fn new(config: PipelineConfig, transport: TransportConfig) -> Result<Self> {
        if config.symbols.is_empty() {
            return Err(PipelineError::InvalidInput("no symbols to subscribe".into()));
        }
        if config.layout != PointLayout::Candle {
            return Err(PipelineError::InvalidInput(format!(
                "feed pipeline stores candles, not {} points",
                config.layout
            )));
        }
        let subscribe = encode_subscribe(&config.symbols, &config.fields)?;
        let unsubscribe = encode_unsubscribe(&config.symbols)?;
        let channel = SharedRingChannel::new(ChannelConfig {
            series_count: config.symbols.len(),
            max_data_points: config.max_data_points,
            layout: config.layout,
        })?;
        let series = config
            .symbols
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i))
            .collect();

        let time_origin = config.time_origin.map(OnceLock::from).unwrap_or_default();

        Ok(Self {
            ingest: Arc::new(Ingest {
                channel: Arc::new(channel),
                series,
                time_origin,
                stats: IngestStats::default(),
            }),
            transport: StreamingTransport::new(transport),
            symbols: config.symbols,
            subscribe,
            unsubscribe,
            task: Mutex::new(None),
        })
    }

    pub fn channel(&self) -> &Arc<SharedRingChannel> {
        &self.ingest.channel
    }

    pub fn transport(&self) -> &StreamingTransport {
        &self.transport
    }

    pub fn stats(&self) -> &IngestStats {
        &self.ingest.stats
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn series_index(&self, symbol: &str) -> Option<usize> {
        self.ingest.series.get(symbol).copied()
    }

    /// Origin stored times are relative to, once known.
    pub fn time_origin(&self) -> Option<f64> {
        self.ingest.time_origin.get().copied()
    }

    /// Decode and apply one frame. Used by the ingest loop and for offline
    /// replay.
    pub fn apply_message(&self, bytes: &[u8]) -> Result<Option<UpsertOutcome>> {
        self.ingest.apply(bytes)
    }

    /// Queue the subscription, start ingesting and connect.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let mut events = self.transport.subscribe();
        let ingest = self.ingest.clone();
        let transport = self.transport.clone();
        let subscribe = self.subscribe.clone();

        // First open flushes this; later opens re-send it below.
        self.transport.send(subscribe.clone());

        *task = Some(tokio::spawn(async move {
            let mut opens = 0u64;
            loop {
                match events.recv().await {
                    Ok(TransportEvent::Message(bytes)) => {
                        if let Err(e) = ingest.apply(&bytes) {
                            ingest.stats.dropped.fetch_add(1, Ordering::Relaxed);
                            warn!(error = %e, len = bytes.len(), "dropping feed message");
                        }
                    }
                    Ok(TransportEvent::Open) => {
                        opens += 1;
                        if opens > 1 {
                            info!("feed reconnected, re-subscribing");
                            transport.send(subscribe.clone());
                        }
                    }
                    Ok(TransportEvent::Reconnecting { attempt, delay }) => {
                        info!(attempt, delay_ms = delay.as_millis() as u64, "feed reconnecting");
                    }
                    Ok(TransportEvent::Closed { will_reconnect }) => {
                        debug!(will_reconnect, "feed connection closed");
                    }
                    Ok(TransportEvent::Error(e)) => {
                        debug!(error = %e, "feed transport error");
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        ingest.stats.dropped.fetch_add(skipped, Ordering::Relaxed);
                        warn!(skipped, "ingest fell behind transport, messages lost");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));

        info!(symbols = ?self.symbols, url = %self.transport.url(), "feed pipeline started");
        self.transport.connect();
    }

    /// Unsubscribe, close the transport, stop ingesting and clear every
    /// series, waking any `wait_for_data` caller with `Cleared`.
    pub async fn stop(&self) {
        self.transport.send(self.unsubscribe.clone());
        self.transport.close().await;
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            handle.abort();
        }
        for series in 0..self.symbols.len() {
            if let Err(e) = self.ingest.channel.clear(series) {
                warn!(series, error = %e, "failed to clear series on stop");
            }
        }
        info!(
            applied = self.ingest.stats.applied(),
            dropped = self.ingest.stats.dropped(),
            "feed pipeline stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::WaitOutcome;
    use crate::protocol::{encode_update, FieldValues, UpdateField};
    use crate::runtime_config::RuntimeConfig;
    use futures_util::{SinkExt, StreamExt};
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    fn config(symbols: &[&str], capacity: usize) -> PipelineConfig {
        PipelineConfig {
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            fields: vec!["ohlc".to_string()],
            max_data_points: capacity,
            time_origin: Some(0.0),
            layout: PointLayout::Candle,
        }
    }

    fn update(symbol: &str, timestamp: f64, values: FieldValues) -> Update {
        Update {
            symbol: symbol.to_string(),
            timestamp,
            values,
        }
    }

    /// Small deterministic generator so the scenario is reproducible.
    struct XorShift(u64);

    impl XorShift {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }
    }

    #[test]
    fn out_of_order_updates_with_duplicates_count_distinct_timestamps() {
        let pipeline =
            FeedPipeline::new(config(&["BTCUSD"], 4_096), TransportConfig::new("ws://unused")).unwrap();
        let mut rng = XorShift(0x9E37_79B9_7F4A_7C15);
        let mut model: BTreeMap<i64, Candle> = BTreeMap::new();

        for _ in 0..10_000 {
            let minute = (rng.next() % 2_000) as i64;
            let mut values = FieldValues::default();
            let mask = (rng.next() % 512) as u16;
            for field in UpdateField::ALL {
                if mask & field.bit() != 0 {
                    values.set(field, (rng.next() % 10_000) as f32 / 10.0);
                }
            }
            let u = update("BTCUSD", (minute * 60) as f64, values);
            let expected = u.merge_into((minute * 60) as f32, model.get(&minute).copied());
            model.insert(minute, expected);

            let outcome = pipeline.apply_message(&encode_update(&u)).unwrap();
            assert!(outcome.is_some());
        }

        let series = pipeline.series_index("BTCUSD").unwrap();
        let channel = pipeline.channel();
        assert_eq!(channel.data_count(series).unwrap() as usize, model.len());

        let stored = channel.read_points::<Candle>(series, 0, model.len()).unwrap();
        let expected: Vec<Candle> = model.into_values().collect();
        assert_eq!(stored, expected);
    }

    #[test]
    fn same_timestamp_replaces_present_fields() {
        let pipeline =
            FeedPipeline::new(config(&["ETHUSD"], 16), TransportConfig::new("ws://unused")).unwrap();
        let first = update(
            "ETHUSD",
            120.0,
            FieldValues::default()
                .with(UpdateField::Open, 10.0)
                .with(UpdateField::Close, 10.5)
                .with(UpdateField::Volume, 3.0),
        );
        let second = update(
            "ETHUSD",
            120.0,
            FieldValues::default()
                .with(UpdateField::Close, 11.0)
                .with(UpdateField::Volume, 4.0),
        );
        assert_eq!(
            pipeline.apply_message(&encode_update(&first)).unwrap(),
            Some(UpsertOutcome::Appended)
        );
        assert_eq!(
            pipeline.apply_message(&encode_update(&second)).unwrap(),
            Some(UpsertOutcome::Replaced)
        );
        let stored = pipeline.channel().latest::<Candle>(0, 10).unwrap();
        assert_eq!(stored, vec![Candle::new(120.0, 10.0, 10.5, 10.5, 11.0, 4.0)]);
    }

    #[test]
    fn unknown_symbols_and_bad_frames_are_not_fatal() {
        let pipeline =
            FeedPipeline::new(config(&["BTCUSD"], 16), TransportConfig::new("ws://unused")).unwrap();
        let other = update("DOGEUSD", 1.0, FieldValues::default().with(UpdateField::Close, 1.0));
        assert_eq!(pipeline.apply_message(&encode_update(&other)).unwrap(), None);
        assert!(pipeline.apply_message(&[3, 200, 0, 0, 0]).is_err());
        assert_eq!(pipeline.apply_message(&[42]).unwrap(), None);
        assert_eq!(pipeline.channel().data_count(0).unwrap(), 0);
    }

    #[test]
    fn time_origin_is_subtracted() {
        let mut cfg = config(&["BTCUSD"], 16);
        cfg.time_origin = Some(1_700_000_000.0);
        let pipeline = FeedPipeline::new(cfg, TransportConfig::new("ws://unused")).unwrap();
        let u = update("BTCUSD", 1_700_000_060.5, FieldValues::default().with(UpdateField::Close, 2.0));
        pipeline.apply_message(&encode_update(&u)).unwrap();
        let stored = pipeline.channel().latest::<Candle>(0, 1).unwrap();
        assert_eq!(stored[0].time, 60.5);
    }

    #[test]
    fn default_config_keeps_epoch_minutes_distinct() {
        let pipeline = FeedPipeline::new(
            RuntimeConfig::default().pipeline(),
            TransportConfig::new("ws://unused"),
        )
        .unwrap();
        assert_eq!(pipeline.time_origin(), None);

        let series = pipeline.series_index("BTCUSD").unwrap();
        for i in 0..5 {
            let ts = 1_700_000_000.0 + 60.0 * i as f64;
            let u = update("BTCUSD", ts, FieldValues::default().with(UpdateField::Close, i as f32));
            assert_eq!(
                pipeline.apply_message(&encode_update(&u)).unwrap(),
                Some(UpsertOutcome::Appended)
            );
        }

        assert_eq!(pipeline.time_origin(), Some(1_700_000_000.0));
        assert_eq!(pipeline.channel().data_count(series).unwrap(), 5);
        let times: Vec<f32> = pipeline
            .channel()
            .latest::<Candle>(series, 5)
            .unwrap()
            .iter()
            .map(|c| c.time)
            .collect();
        assert_eq!(times, vec![0.0, 60.0, 120.0, 180.0, 240.0]);
    }

    #[test]
    fn millisecond_epochs_anchor_and_stay_exact() {
        let mut cfg = config(&["BTCUSD"], 16);
        cfg.time_origin = None;
        let pipeline = FeedPipeline::new(cfg, TransportConfig::new("ws://unused")).unwrap();
        for i in 0..3 {
            let ts = 1_700_000_000_000.0 + 60_000.0 * i as f64;
            let u = update("BTCUSD", ts, FieldValues::default().with(UpdateField::Close, 1.0));
            pipeline.apply_message(&encode_update(&u)).unwrap();
        }
        assert_eq!(pipeline.channel().data_count(0).unwrap(), 3);
    }

    #[test]
    fn offsets_beyond_f32_precision_are_rejected() {
        let pipeline =
            FeedPipeline::new(config(&["BTCUSD"], 16), TransportConfig::new("ws://unused")).unwrap();
        let far = update("BTCUSD", 1_700_000_000.0, FieldValues::default().with(UpdateField::Close, 1.0));
        let err = pipeline.apply_message(&encode_update(&far)).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));

        let bad = update("BTCUSD", f64::NAN, FieldValues::default().with(UpdateField::Close, 1.0));
        assert!(pipeline.apply_message(&encode_update(&bad)).is_err());
        assert_eq!(pipeline.channel().data_count(0).unwrap(), 0);
    }

    #[test]
    fn non_candle_layout_is_rejected() {
        let mut cfg = config(&["BTCUSD"], 16);
        cfg.layout = PointLayout::Scalar;
        let err = FeedPipeline::new(cfg, TransportConfig::new("ws://unused")).err().unwrap();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn stop_clears_series_and_wakes_waiters() {
        let pipeline =
            FeedPipeline::new(config(&["BTCUSD"], 16), TransportConfig::new("ws://unused")).unwrap();
        let u = update("BTCUSD", 60.0, FieldValues::default().with(UpdateField::Close, 1.0));
        pipeline.apply_message(&encode_update(&u)).unwrap();
        assert_eq!(pipeline.channel().data_count(0).unwrap(), 1);

        let channel = pipeline.channel().clone();
        let waiter = tokio::task::spawn_blocking(move || {
            channel.wait_for_data(0, 5, Duration::from_secs(10))
        });
        // Let the waiter park before the series is cleared.
        tokio::time::sleep(Duration::from_millis(100)).await;

        pipeline.stop().await;
        assert_eq!(pipeline.channel().data_count(0).unwrap(), 0);

        let outcome = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Cleared);
    }

    #[test]
    fn empty_symbol_list_is_rejected() {
        assert!(FeedPipeline::new(config(&[], 16), TransportConfig::new("ws://unused")).is_err());
    }

    #[tokio::test]
    async fn live_feed_subscribes_ingests_and_unsubscribes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();

            let mut seen = Vec::new();
            // Subscribe arrives first.
            if let Some(Ok(WsMessage::Binary(b))) = ws.next().await {
                seen.push(decode_message(&b).unwrap());
            }
            for minute in [2.0, 0.0, 1.0, 1.0] {
                let u = update(
                    "BTCUSD",
                    minute * 60.0,
                    FieldValues::default().with(UpdateField::Close, 100.0 + minute as f32),
                );
                ws.send(WsMessage::Binary(encode_update(&u).to_vec())).await.unwrap();
            }
            // Then the unsubscribe on stop.
            while let Some(Ok(msg)) = ws.next().await {
                if let WsMessage::Binary(b) = msg {
                    seen.push(decode_message(&b).unwrap());
                }
            }
            seen
        });

        let pipeline =
            FeedPipeline::new(config(&["BTCUSD"], 64), TransportConfig::new(format!("ws://{addr}")))
                .unwrap();
        pipeline.start();

        let channel = pipeline.channel().clone();
        tokio::task::spawn_blocking(move || {
            channel.wait_for_data(0, 3, Duration::from_secs(5))
        })
        .await
        .unwrap()
        .unwrap();

        let stored = pipeline.channel().latest::<Candle>(0, 3).unwrap();
        let times: Vec<f32> = stored.iter().map(|c| c.time).collect();
        assert_eq!(times, vec![0.0, 60.0, 120.0]);

        pipeline.stop().await;
        let seen = server.await.unwrap();
        assert_eq!(
            seen,
            vec![
                Some(Message::Subscribe {
                    symbols: vec!["BTCUSD".to_string()],
                    fields: vec!["ohlc".to_string()],
                }),
                Some(Message::Unsubscribe {
                    symbols: vec!["BTCUSD".to_string()],
                }),
            ]
        );
    }
}

// =============================================================================
// Shared point types used across the data pipeline
// =============================================================================
//
// Both point shapes share one flat little-endian f32 layout so that bytes can
// flow channel -> decimation -> render without re-encoding:
//   scalar: (time, value)                                 8 bytes
//   candle: (time, open, high, low, close, volume)       24 bytes
// =============================================================================

use serde::{Deserialize, Serialize};

/// A single scalar sample.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub time: f32,
    pub value: f32,
}

impl Point {
    pub fn new(time: f32, value: f32) -> Self {
        Self { time, value }
    }
}

/// One OHLCV candle.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Candle {
    pub time: f32,
    pub open: f32,
    pub high: f32,
    pub low: f32,
    pub close: f32,
    pub volume: f32,
}

impl Candle {
    pub fn new(time: f32, open: f32, high: f32, low: f32, close: f32, volume: f32) -> Self {
        Self {
            time,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// A flat candle where every price equals `price`.
    pub fn flat(time: f32, price: f32) -> Self {
        Self::new(time, price, price, price, price, 0.0)
    }
}

/// Memory layout of a series in the ring channel and on the worker wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointLayout {
    Scalar,
    Candle,
}

impl PointLayout {
    /// Number of f32 words per point.
    pub const fn words(self) -> usize {
        match self {
            Self::Scalar => 2,
            Self::Candle => 6,
        }
    }

    /// Number of bytes per point.
    pub const fn stride(self) -> usize {
        self.words() * 4
    }
}

impl Default for PointLayout {
    fn default() -> Self {
        Self::Candle
    }
}

impl std::fmt::Display for PointLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scalar => write!(f, "scalar"),
            Self::Candle => write!(f, "candle"),
        }
    }
}

/// A point type that can be stored in the flat f32 layout.
///
/// `value()` is the coordinate the decimation engine reduces on; for candles
/// that is the close price.
pub trait WirePoint: Copy + Send + Sync + 'static {
    const LAYOUT: PointLayout;

    fn time(&self) -> f32;

    fn value(&self) -> f32;

    /// Write the point into `out`, which is exactly `LAYOUT.words()` long.
    fn write_words(&self, out: &mut [f32]);

    /// Read a point back from exactly `LAYOUT.words()` words.
    fn from_words(words: &[f32]) -> Self;
}

impl WirePoint for Point {
    const LAYOUT: PointLayout = PointLayout::Scalar;

    fn time(&self) -> f32 {
        self.time
    }

    fn value(&self) -> f32 {
        self.value
    }

    fn write_words(&self, out: &mut [f32]) {
        out[0] = self.time;
        out[1] = self.value;
    }

    fn from_words(words: &[f32]) -> Self {
        Self::new(words[0], words[1])
    }
}

impl WirePoint for Candle {
    const LAYOUT: PointLayout = PointLayout::Candle;

    fn time(&self) -> f32 {
        self.time
    }

    fn value(&self) -> f32 {
        self.close
    }

    fn write_words(&self, out: &mut [f32]) {
        out[0] = self.time;
        out[1] = self.open;
        out[2] = self.high;
        out[3] = self.low;
        out[4] = self.close;
        out[5] = self.volume;
    }

    fn from_words(words: &[f32]) -> Self {
        Self::new(words[0], words[1], words[2], words[3], words[4], words[5])
    }
}

// =============================================================================
// Wire Protocol — framing for subscribe / update / heartbeat messages
// =============================================================================
//
// Layout (little-endian throughout):
//   byte 0      message type (1..=6)
//   Subscribe   u16 n, n x string; u16 m, m x string
//   Unsubscribe u16 n, n x string
//   Update      string symbol, f64 timestamp, u16 field mask,
//               one f32 per set bit in ascending bit order
//   Heartbeat   u32 timestamp (unix seconds)
//   Snapshot / Error bodies are reserved and carried as raw bytes.
//
// Strings are u32 byte length + UTF-8. Only bits 0..=8 of the field mask are
// defined; the upper 7 are reserved and ignored on decode.
// =============================================================================

use bytes::Bytes;
use tracing::warn;

use crate::codec::{ByteReader, ByteWriter};
use crate::error::{PipelineError, Result};
use crate::types::Candle;

// ---------------------------------------------------------------------------
// Message type tag
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Subscribe = 1,
    Unsubscribe = 2,
    Update = 3,
    Snapshot = 4,
    Error = 5,
    Heartbeat = 6,
}

impl MessageType {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Subscribe),
            2 => Some(Self::Unsubscribe),
            3 => Some(Self::Update),
            4 => Some(Self::Snapshot),
            5 => Some(Self::Error),
            6 => Some(Self::Heartbeat),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Update fields
// ---------------------------------------------------------------------------

/// Optional numeric fields of an update, in wire bit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UpdateField {
    Open = 0,
    High = 1,
    Low = 2,
    Close = 3,
    Volume = 4,
    Bid = 5,
    Ask = 6,
    BidSize = 7,
    AskSize = 8,
}

pub const FIELD_COUNT: usize = 9;

impl UpdateField {
    pub const ALL: [UpdateField; FIELD_COUNT] = [
        Self::Open,
        Self::High,
        Self::Low,
        Self::Close,
        Self::Volume,
        Self::Bid,
        Self::Ask,
        Self::BidSize,
        Self::AskSize,
    ];

    pub fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

/// Bitmap of the fields present in an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FieldMask(pub u16);

impl FieldMask {
    pub const EMPTY: FieldMask = FieldMask(0);
    pub const ALL: FieldMask = FieldMask((1 << FIELD_COUNT) - 1);

    pub fn contains(self, field: UpdateField) -> bool {
        self.0 & field.bit() != 0
    }

    pub fn insert(&mut self, field: UpdateField) {
        self.0 |= field.bit();
    }

    /// Number of defined fields present.
    pub fn len(self) -> usize {
        (self.0 & Self::ALL.0).count_ones() as usize
    }

    pub fn is_empty(self) -> bool {
        self.len() == 0
    }
}

/// Field values carried by one update; `None` means absent from the wire.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FieldValues([Option<f32>; FIELD_COUNT]);

impl FieldValues {
    pub fn get(&self, field: UpdateField) -> Option<f32> {
        self.0[field as usize]
    }

    pub fn set(&mut self, field: UpdateField, value: f32) {
        self.0[field as usize] = Some(value);
    }

    pub fn with(mut self, field: UpdateField, value: f32) -> Self {
        self.set(field, value);
        self
    }

    pub fn mask(&self) -> FieldMask {
        let mut mask = FieldMask::EMPTY;
        for field in UpdateField::ALL {
            if self.get(field).is_some() {
                mask.insert(field);
            }
        }
        mask
    }

    /// Present fields in bit order.
    pub fn iter(&self) -> impl Iterator<Item = (UpdateField, f32)> + '_ {
        UpdateField::ALL
            .into_iter()
            .filter_map(|f| self.get(f).map(|v| (f, v)))
    }
}

/// A price update for one symbol at one timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub symbol: String,
    pub timestamp: f64,
    pub values: FieldValues,
}

impl Update {
    /// Merge this update into the candle already stored at the same
    /// timestamp, or build a new one. Present fields replace; they never
    /// accumulate. A fresh candle seeds missing prices from the first price
    /// the update does carry.
    pub fn merge_into(&self, time: f32, existing: Option<Candle>) -> Candle {
        let v = &self.values;
        let mut candle = existing.unwrap_or_else(|| {
            let seed = [
                UpdateField::Close,
                UpdateField::Open,
                UpdateField::High,
                UpdateField::Low,
                UpdateField::Bid,
                UpdateField::Ask,
            ]
            .into_iter()
            .find_map(|f| v.get(f))
            .unwrap_or(0.0);
            Candle::flat(time, seed)
        });
        candle.time = time;
        if let Some(x) = v.get(UpdateField::Open) {
            candle.open = x;
        }
        if let Some(x) = v.get(UpdateField::High) {
            candle.high = x;
        }
        if let Some(x) = v.get(UpdateField::Low) {
            candle.low = x;
        }
        if let Some(x) = v.get(UpdateField::Close) {
            candle.close = x;
        }
        if let Some(x) = v.get(UpdateField::Volume) {
            candle.volume = x;
        }
        candle
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Subscribe { symbols: Vec<String>, fields: Vec<String> },
    Unsubscribe { symbols: Vec<String> },
    Update(Update),
    /// Reserved body, passed through undecoded.
    Snapshot(Bytes),
    /// Reserved body, passed through undecoded.
    Error(Bytes),
    Heartbeat { timestamp: u32 },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Subscribe { .. } => MessageType::Subscribe,
            Self::Unsubscribe { .. } => MessageType::Unsubscribe,
            Self::Update(_) => MessageType::Update,
            Self::Snapshot(_) => MessageType::Snapshot,
            Self::Error(_) => MessageType::Error,
            Self::Heartbeat { .. } => MessageType::Heartbeat,
        }
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Lists carry a u16 count; longer ones cannot be framed.
fn put_string_list(w: &mut ByteWriter, what: &str, items: &[String]) -> Result<()> {
    let count = u16::try_from(items.len()).map_err(|_| {
        PipelineError::InvalidInput(format!(
            "{} {what} exceed the {} a frame can carry",
            items.len(),
            u16::MAX
        ))
    })?;
    w.put_u16(count);
    for item in items {
        w.put_string(item);
    }
    Ok(())
}

pub fn encode_subscribe(symbols: &[String], fields: &[String]) -> Result<Bytes> {
    let mut w = ByteWriter::with_capacity(16 + symbols.len() * 12 + fields.len() * 12);
    w.put_u8(MessageType::Subscribe as u8);
    put_string_list(&mut w, "symbols", symbols)?;
    put_string_list(&mut w, "fields", fields)?;
    Ok(w.finish())
}

pub fn encode_unsubscribe(symbols: &[String]) -> Result<Bytes> {
    let mut w = ByteWriter::with_capacity(8 + symbols.len() * 12);
    w.put_u8(MessageType::Unsubscribe as u8);
    put_string_list(&mut w, "symbols", symbols)?;
    Ok(w.finish())
}

/// Heartbeat stamped with the current unix time.
pub fn encode_heartbeat() -> Bytes {
    encode_heartbeat_at(chrono::Utc::now().timestamp() as u32)
}

pub fn encode_heartbeat_at(timestamp: u32) -> Bytes {
    let mut w = ByteWriter::with_capacity(5);
    w.put_u8(MessageType::Heartbeat as u8);
    w.put_u32(timestamp);
    w.finish()
}

pub fn encode_update(update: &Update) -> Bytes {
    let mask = update.values.mask();
    let mut w = ByteWriter::with_capacity(1 + 4 + update.symbol.len() + 8 + 2 + mask.len() * 4);
    w.put_u8(MessageType::Update as u8);
    w.put_string(&update.symbol);
    w.put_f64(update.timestamp);
    w.put_u16(mask.0);
    for (_, value) in update.values.iter() {
        w.put_f32(value);
    }
    w.finish()
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

fn get_string_list(r: &mut ByteReader<'_>) -> Result<Vec<String>> {
    let n = r.get_u16()? as usize;
    let mut items = Vec::with_capacity(n.min(r.remaining() / 4));
    for _ in 0..n {
        items.push(r.get_string()?);
    }
    Ok(items)
}

fn decode_update(r: &mut ByteReader<'_>) -> Result<Update> {
    let symbol = r.get_string()?;
    let timestamp = r.get_f64()?;
    let mask = FieldMask(r.get_u16()?);
    let mut values = FieldValues::default();
    for field in UpdateField::ALL {
        if mask.contains(field) {
            values.set(field, r.get_f32()?);
        }
    }
    Ok(Update {
        symbol,
        timestamp,
        values,
    })
}

/// Decode one framed message.
///
/// Unknown message types are logged and yield `Ok(None)`; malformed bodies
/// yield `Decode`. Neither is fatal to the connection.
pub fn decode_message(bytes: &[u8]) -> Result<Option<Message>> {
    let mut r = ByteReader::new(bytes);
    let tag = r
        .get_u8()
        .map_err(|_| PipelineError::decode("empty message"))?;

    let Some(kind) = MessageType::from_u8(tag) else {
        warn!(tag, len = bytes.len(), "unknown message type, dropping");
        return Ok(None);
    };

    let message = match kind {
        MessageType::Subscribe => Message::Subscribe {
            symbols: get_string_list(&mut r)?,
            fields: get_string_list(&mut r)?,
        },
        MessageType::Unsubscribe => Message::Unsubscribe {
            symbols: get_string_list(&mut r)?,
        },
        MessageType::Update => Message::Update(decode_update(&mut r)?),
        MessageType::Snapshot => Message::Snapshot(Bytes::copy_from_slice(r.rest())),
        MessageType::Error => Message::Error(Bytes::copy_from_slice(r.rest())),
        MessageType::Heartbeat => Message::Heartbeat {
            timestamp: r.get_u32()?,
        },
    };
    Ok(Some(message))
}

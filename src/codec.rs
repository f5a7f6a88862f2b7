// =============================================================================
// Binary Codec — little-endian primitives and flat point buffers
// =============================================================================
//
// `ByteReader` checks the remaining length before every read so malformed
// input surfaces as `PipelineError::Decode` rather than a panic inside
// `bytes::Buf`.
// =============================================================================

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{PipelineError, Result};
use crate::types::WirePoint;

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Growable little-endian byte writer.
#[derive(Debug, Default)]
pub struct ByteWriter {
    buf: BytesMut,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn put_f32(&mut self, v: f32) {
        self.buf.put_f32_le(v);
    }

    pub fn put_f64(&mut self, v: f64) {
        self.buf.put_f64_le(v);
    }

    /// u32 byte length followed by the UTF-8 bytes.
    pub fn put_string(&mut self, s: &str) {
        self.buf.put_u32_le(s.len() as u32);
        self.buf.put_slice(s.as_bytes());
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Bounds-checked little-endian reader over a borrowed slice.
#[derive(Debug)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn ensure(&self, needed: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < needed {
            return Err(PipelineError::decode(format!(
                "truncated {what}: need {needed} bytes, {} remaining",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        self.ensure(1, "u8")?;
        Ok(self.buf.get_u8())
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        self.ensure(2, "u16")?;
        Ok(self.buf.get_u16_le())
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        self.ensure(4, "u32")?;
        Ok(self.buf.get_u32_le())
    }

    pub fn get_f32(&mut self) -> Result<f32> {
        self.ensure(4, "f32")?;
        Ok(self.buf.get_f32_le())
    }

    pub fn get_f64(&mut self) -> Result<f64> {
        self.ensure(8, "f64")?;
        Ok(self.buf.get_f64_le())
    }

    /// Length-prefixed UTF-8 string. A length larger than the remaining
    /// buffer is a decode error.
    pub fn get_string(&mut self) -> Result<String> {
        let len = self.get_u32()? as usize;
        if len > self.buf.remaining() {
            return Err(PipelineError::decode(format!(
                "string length {len} exceeds remaining {} bytes",
                self.buf.remaining()
            )));
        }
        let (head, tail) = self.buf.split_at(len);
        let s = std::str::from_utf8(head)
            .map_err(|e| PipelineError::decode(format!("invalid UTF-8 in string: {e}")))?
            .to_string();
        self.buf = tail;
        Ok(s)
    }

    /// Everything not yet consumed.
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = self.buf;
        self.buf = &[];
        rest
    }
}

// ---------------------------------------------------------------------------
// Point buffers
// ---------------------------------------------------------------------------

/// Encode points into the flat little-endian f32 layout.
pub fn encode_points<P: WirePoint>(points: &[P]) -> Bytes {
    let words = P::LAYOUT.words();
    let mut buf = BytesMut::with_capacity(points.len() * P::LAYOUT.stride());
    let mut scratch = [0.0f32; 6];
    for p in points {
        p.write_words(&mut scratch[..words]);
        for w in &scratch[..words] {
            buf.put_f32_le(*w);
        }
    }
    buf.freeze()
}

/// Decode a flat little-endian f32 buffer. The length must be an exact
/// multiple of the layout stride.
pub fn decode_points<P: WirePoint>(bytes: &[u8]) -> Result<Vec<P>> {
    let stride = P::LAYOUT.stride();
    if bytes.len() % stride != 0 {
        return Err(PipelineError::decode(format!(
            "point buffer of {} bytes is not a multiple of stride {stride}",
            bytes.len()
        )));
    }
    let words = P::LAYOUT.words();
    let mut scratch = [0.0f32; 6];
    let mut points = Vec::with_capacity(bytes.len() / stride);
    for chunk in bytes.chunks_exact(stride) {
        let mut cursor = chunk;
        for w in scratch[..words].iter_mut() {
            *w = cursor.get_f32_le();
        }
        points.push(P::from_words(&scratch[..words]));
    }
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Candle, Point};

    #[test]
    fn primitives_are_little_endian() {
        let mut w = ByteWriter::new();
        w.put_u16(0x0102);
        w.put_u32(0x0A0B0C0D);
        let bytes = w.finish();
        assert_eq!(&bytes[..], &[0x02, 0x01, 0x0D, 0x0C, 0x0B, 0x0A]);
    }

    #[test]
    fn string_is_length_prefixed() {
        let mut w = ByteWriter::new();
        w.put_string("BTC");
        let bytes = w.finish();
        assert_eq!(&bytes[..], &[3, 0, 0, 0, b'B', b'T', b'C']);

        let mut r = ByteReader::new(&bytes);
        assert_eq!(r.get_string().unwrap(), "BTC");
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn oversized_string_length_is_decode_error() {
        let mut w = ByteWriter::new();
        w.put_u32(100);
        w.put_u8(b'x');
        let bytes = w.finish();
        let mut r = ByteReader::new(&bytes);
        assert!(matches!(r.get_string(), Err(PipelineError::Decode(_))));
    }

    #[test]
    fn truncated_reads_fail_without_panicking() {
        let mut r = ByteReader::new(&[1, 2, 3]);
        assert!(matches!(r.get_f64(), Err(PipelineError::Decode(_))));
        assert!(matches!(r.get_u32(), Err(PipelineError::Decode(_))));
        assert_eq!(r.get_u16().unwrap(), 0x0201);
    }

    #[test]
    fn scalar_points_use_eight_byte_stride() {
        let bytes = encode_points(&[Point::new(1.0, 2.0), Point::new(3.0, 4.0)]);
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[0..4], &1.0f32.to_le_bytes());
        let back: Vec<Point> = decode_points(&bytes).unwrap();
        assert_eq!(back[1], Point::new(3.0, 4.0));
    }

    #[test]
    fn candle_buffer_with_partial_point_is_rejected() {
        let bytes = encode_points(&[Candle::flat(0.0, 1.0)]);
        assert!(decode_points::<Candle>(&bytes[..20]).is_err());
        assert_eq!(decode_points::<Candle>(&bytes).unwrap().len(), 1);
    }
}

// =============================================================================
// DataBuffer — non-wrapping staging area for point batches
// =============================================================================

use bytes::{Bytes, BytesMut};

use crate::codec::encode_points;
use crate::error::{PipelineError, Result};
use crate::types::WirePoint;

/// Fixed-capacity append-only byte buffer. Unlike the ring channel it never
/// overwrites: an append that does not fit fails with `BufferOverflow` and
/// leaves the buffer untouched.
#[derive(Debug)]
pub struct DataBuffer {
    buf: BytesMut,
    capacity: usize,
}

impl DataBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        let available = self.capacity - self.buf.len();
        if bytes.len() > available {
            return Err(PipelineError::BufferOverflow {
                requested: bytes.len(),
                available,
            });
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Stage typed points in their flat wire layout, all or nothing.
    pub fn append_points<P: WirePoint>(&mut self, points: &[P]) -> Result<()> {
        self.append(&encode_points(points))
    }

    /// Hand the staged bytes off and start over empty.
    pub fn drain(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Point, PointLayout};

    #[test]
    fn append_within_capacity() {
        let mut buf = DataBuffer::new(16);
        buf.append(&[1; 8]).unwrap();
        buf.append(&[2; 8]).unwrap();
        assert_eq!(buf.len(), 16);
    }

    #[test]
    fn overflow_is_rejected_without_partial_write() {
        let mut buf = DataBuffer::new(10);
        buf.append(&[1; 8]).unwrap();
        let err = buf.append(&[2; 8]).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::BufferOverflow { requested: 8, available: 2 }
        ));
        assert_eq!(buf.as_slice(), &[1; 8]);
    }

    #[test]
    fn point_batches_respect_capacity() {
        let mut buf = DataBuffer::new(3 * PointLayout::Scalar.stride());
        buf.append_points(&[Point::new(0.0, 1.0), Point::new(1.0, 2.0)]).unwrap();
        let err = buf
            .append_points(&[Point::new(2.0, 3.0), Point::new(3.0, 4.0)])
            .unwrap_err();
        assert!(matches!(err, PipelineError::BufferOverflow { requested: 16, available: 8 }));
        assert_eq!(buf.len(), 16);
        buf.append_points(&[Point::new(2.0, 3.0)]).unwrap();
        assert_eq!(buf.len(), buf.capacity());
    }

    #[test]
    fn drain_empties_buffer() {
        let mut buf = DataBuffer::new(4);
        buf.append(&[7, 8]).unwrap();
        let staged = buf.drain();
        assert_eq!(&staged[..], &[7, 8]);
        assert!(buf.is_empty());
        buf.append(&[1, 2, 3, 4]).unwrap();
    }
}

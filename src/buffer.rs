/*
 * Copyright (C) 2026 Picket Contributors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::cmp;

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum BufferError {
    #[error("ring capacity must be a nonzero power of two")]
    CapacityNotPowerOfTwo,
}

/// Fixed-capacity circular byte buffer.
///
/// The capacity is a power of two, fixed at construction. Cursors are
/// monotonically increasing 64-bit counters; the physical index of a cursor
/// is `pos & (capacity - 1)`. The buffered size is `write_pos - read_pos`
/// and never exceeds the capacity.
///
/// Both cursors support put-back: a caller that advanced a cursor may
/// rewind it by any amount not yet overwritten, restoring the buffer to
/// the state before the advance. Parsers rely on this to retry partial
/// reads from the same point on a later pass.
pub struct RingBuffer {
    data: Vec<u8>,
    mask: u64,
    read_pos: u64,
    write_pos: u64,
}

#[allow(clippy::len_without_is_empty)]
impl RingBuffer {
    pub fn new(capacity: usize) -> Result<Self, BufferError> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(BufferError::CapacityNotPowerOfTwo);
        }

        Ok(Self {
            data: vec![0; capacity],
            mask: (capacity as u64) - 1,
            read_pos: 0,
            write_pos: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        (self.write_pos - self.read_pos) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.read_pos == self.write_pos
    }

    pub fn write_avail(&self) -> usize {
        self.capacity() - self.len()
    }

    /// Copies up to `sink.len()` bytes out, bounded by the buffered size,
    /// and advances the read cursor. Returns the count copied. Never
    /// blocks and never errors; 0 means the buffer is empty (or the sink
    /// has zero length).
    pub fn read(&mut self, sink: &mut [u8]) -> usize {
        let size = cmp::min(sink.len(), self.len());
        let mut copied = 0;

        while copied < size {
            let start = (self.read_pos & self.mask) as usize;
            let run = cmp::min(size - copied, self.capacity() - start);

            sink[copied..(copied + run)].copy_from_slice(&self.data[start..(start + run)]);

            self.read_pos += run as u64;
            copied += run;
        }

        copied
    }

    /// Copies up to `src.len()` bytes in, bounded by the free space, and
    /// advances the write cursor. Returns the count copied, which may be
    /// less than requested; a partial write is a normal outcome, not an
    /// error.
    pub fn write(&mut self, src: &[u8]) -> usize {
        let size = cmp::min(src.len(), self.write_avail());
        let mut copied = 0;

        while copied < size {
            let start = (self.write_pos & self.mask) as usize;
            let run = cmp::min(size - copied, self.capacity() - start);

            self.data[start..(start + run)].copy_from_slice(&src[copied..(copied + run)]);

            self.write_pos += run as u64;
            copied += run;
        }

        copied
    }

    /// Rewinds the read cursor by `n` bytes. The caller must only rewind
    /// by an amount previously advanced and not yet overwritten.
    pub fn putback_read(&mut self, n: usize) {
        let n = n as u64;

        assert!(n <= self.read_pos);
        assert!(self.write_pos - (self.read_pos - n) <= self.capacity() as u64);

        self.read_pos -= n;
    }

    /// Rewinds the write cursor by `n` bytes. Only bytes still buffered
    /// (not yet consumed by the read cursor) may be unwritten.
    pub fn putback_write(&mut self, n: usize) {
        let n = n as u64;

        assert!(n <= self.write_pos - self.read_pos);

        self.write_pos -= n;
    }

    /// Returns the contiguous run of readable bytes and pre-advances the
    /// read cursor by the run length. The run may be shorter than the
    /// total buffered size when the used region wraps; callers loop or
    /// call `simplify()`. A caller that does not consume the whole slot
    /// must put back the unused remainder via `putback_read`.
    pub fn read_slot(&mut self) -> &[u8] {
        let start = (self.read_pos & self.mask) as usize;
        let run = cmp::min(self.len(), self.capacity() - start);

        self.read_pos += run as u64;

        &self.data[start..(start + run)]
    }

    /// Returns the contiguous run of writable space and pre-advances the
    /// write cursor by the run length. Length 0 means the buffer is full.
    /// A caller that does not fill the whole slot must put back the
    /// unused remainder via `putback_write`.
    pub fn write_slot(&mut self) -> &mut [u8] {
        let start = (self.write_pos & self.mask) as usize;
        let run = cmp::min(self.write_avail(), self.capacity() - start);

        self.write_pos += run as u64;

        &mut self.data[start..(start + run)]
    }

    /// Relocates the used region to start at physical offset 0 so that
    /// both the readable bytes and the free space become contiguous, then
    /// resets the cursors to canonical values (read 0, write = size). On
    /// an empty buffer this only resets the cursors, bounding counter
    /// growth over the life of the connection.
    pub fn simplify(&mut self) {
        let size = self.len() as u64;
        let start = (self.read_pos & self.mask) as usize;

        if start != 0 && size != 0 {
            self.data.rotate_left(start);
        }

        self.read_pos = 0;
        self.write_pos = size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(r: &mut RingBuffer) -> Vec<u8> {
        let mut out = vec![0; r.len()];
        let n = r.read(&mut out);
        assert_eq!(n, out.len());
        out
    }

    #[test]
    fn test_capacity_must_be_power_of_two() {
        assert!(RingBuffer::new(0).is_err());
        assert!(RingBuffer::new(12).is_err());
        assert!(RingBuffer::new(8).is_ok());
        assert!(RingBuffer::new(1024).is_ok());
    }

    #[test]
    fn test_round_trip() {
        for &cap in &[8usize, 16, 1024] {
            let mut r = RingBuffer::new(cap).unwrap();

            assert_eq!(r.len(), 0);
            assert_eq!(r.write_avail(), cap);

            // write/read in uneven pieces, wrapping several times
            let payload: Vec<u8> = (0..(cap * 3)).map(|i| (i % 251) as u8).collect();
            let mut fed = 0;
            let mut drained = Vec::new();

            while drained.len() < payload.len() {
                if fed < payload.len() {
                    let n = r.write(&payload[fed..cmp::min(fed + 5, payload.len())]);
                    fed += n;
                }

                let mut buf = [0u8; 3];
                let n = r.read(&mut buf);
                drained.extend_from_slice(&buf[..n]);
            }

            assert_eq!(drained, payload);
            assert!(r.is_empty());
        }
    }

    #[test]
    fn test_zero_length_ops() {
        let mut r = RingBuffer::new(8).unwrap();

        assert_eq!(r.write(b""), 0);
        assert_eq!(r.read(&mut []), 0);
        r.putback_read(0);
        r.putback_write(0);
        assert!(r.is_empty());
    }

    #[test]
    fn test_partial_write_on_full() {
        let mut r = RingBuffer::new(8).unwrap();

        assert_eq!(r.write(b"hello"), 5);
        assert_eq!(r.write(b"world"), 3);
        assert_eq!(r.write_avail(), 0);
        assert_eq!(r.write(b"x"), 0);
        assert_eq!(filled(&mut r), b"hellowor");
    }

    #[test]
    fn test_putback_read_idempotence() {
        let mut r = RingBuffer::new(16).unwrap();
        r.write(b"abcdefgh");

        let mut buf = [0u8; 6];
        let n = r.read(&mut buf);
        assert_eq!(&buf[..n], b"abcdef");

        r.putback_read(n);

        let mut again = [0u8; 6];
        let m = r.read(&mut again);
        assert_eq!(m, n);
        assert_eq!(again, buf);
        assert_eq!(filled(&mut r), b"gh");
    }

    #[test]
    fn test_putback_write_idempotence() {
        let mut r = RingBuffer::new(16).unwrap();
        r.write(b"abc");
        r.write(b"defgh");

        r.putback_write(5);
        assert_eq!(r.len(), 3);

        r.write(b"defgh");
        assert_eq!(filled(&mut r), b"abcdefgh");
    }

    #[test]
    fn test_putback_across_wrap() {
        let mut r = RingBuffer::new(8).unwrap();

        // wrap the cursors
        r.write(b"123456");
        let mut buf = [0u8; 6];
        r.read(&mut buf);
        r.write(b"abcdef");

        let n = r.read(&mut buf);
        assert_eq!(&buf[..n], b"abcdef");

        r.putback_read(6);
        let n = r.read(&mut buf);
        assert_eq!(&buf[..n], b"abcdef");
    }

    #[test]
    fn test_slots_full_empty_boundary() {
        let mut r = RingBuffer::new(8).unwrap();

        // empty ring: read slot is length 0
        assert_eq!(r.read_slot().len(), 0);

        r.write(b"12345678");

        // full ring: write slot is length 0
        assert_eq!(r.write_slot().len(), 0);
    }

    #[test]
    fn test_write_slot_putback() {
        let mut r = RingBuffer::new(8).unwrap();

        let slot = r.write_slot();
        let slot_len = slot.len();
        assert_eq!(slot_len, 8);
        slot[..3].copy_from_slice(b"abc");

        r.putback_write(slot_len - 3);
        assert_eq!(r.len(), 3);
        assert_eq!(filled(&mut r), b"abc");
    }

    #[test]
    fn test_read_slot_putback() {
        let mut r = RingBuffer::new(8).unwrap();
        r.write(b"abcdef");

        let slot = r.read_slot();
        let slot_len = slot.len();
        assert_eq!(&slot[..2], b"ab");

        // pretend only 2 bytes were consumed
        r.putback_read(slot_len - 2);
        assert_eq!(filled(&mut r), b"cdef");
    }

    #[test]
    fn test_slot_wraps_are_contiguous_runs() {
        let mut r = RingBuffer::new(8).unwrap();

        r.write(b"123456");
        let mut buf = [0u8; 4];
        r.read(&mut buf);
        r.write(b"abcd"); // "cd" wraps to the front of the backing storage

        let first = r.read_slot().to_vec();
        assert_eq!(first, b"56ab");
        let second = r.read_slot().to_vec();
        assert_eq!(second, b"cd");
        assert!(r.is_empty());
    }

    #[test]
    fn test_simplify_makes_contiguous() {
        let mut r = RingBuffer::new(8).unwrap();

        r.write(b"123456");
        let mut buf = [0u8; 4];
        r.read(&mut buf);
        r.write(b"abcd");

        // wrapped: the contiguous read run stops at the end of storage
        let run = r.read_slot().len();
        assert_eq!(run, 4);
        r.putback_read(run);

        r.simplify();

        let slot = r.read_slot();
        assert_eq!(slot, b"56abcd");
    }

    #[test]
    fn test_simplify_empty_resets_cursors() {
        let mut r = RingBuffer::new(8).unwrap();

        // push the cursors forward
        for _ in 0..5 {
            r.write(b"12345678");
            let mut buf = [0u8; 8];
            r.read(&mut buf);
        }

        r.simplify();
        assert!(r.is_empty());

        // after canonicalization the full capacity is one contiguous slot
        assert_eq!(r.write_slot().len(), 8);
        r.putback_write(8);
    }
}

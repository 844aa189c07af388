use thiserror::Error;

#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum BufError {
    #[error("bad buffer position")]
    BadPosition,
}

/// Growable byte buffer used for all socket staging.
///
/// Four cursors: `capacity`, `position`, `limit`, `mark`, with
/// `0 <= mark <= position <= limit <= capacity`. Write mode appends at
/// `position` with `limit` tracking it; read mode consumes `position..limit`.
/// The mark remembers where consumption may resume after a partial socket
/// write.
pub struct ByteBuf {
    buf: Vec<u8>,
    pos: usize,
    limit: usize,
    mark: usize,
}

impl ByteBuf {
    pub fn new(capacity: usize) -> Self {
        Self { buf: vec![0; capacity], pos: 0, limit: 0, mark: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn mark(&self) -> usize {
        self.mark
    }

    /// Free space between `position` and `capacity`.
    pub fn remaining(&self) -> usize {
        self.capacity() - self.pos
    }

    /// Unread bytes between `position` and `limit`.
    pub fn available(&self) -> usize {
        self.limit - self.pos
    }

    pub fn reset(&mut self) {
        self.pos = 0;
        self.limit = 0;
        self.mark = 0;
    }

    /// Read mode: consumption resumes at the mark.
    pub fn set_read_mode(&mut self) {
        self.pos = self.mark;
    }

    /// Write mode: appending resumes at the limit.
    pub fn set_write_mode(&mut self) {
        self.pos = self.limit;
    }

    pub fn set_mark(&mut self) {
        self.mark = self.pos;
    }

    /// Grows to `max(2 * capacity, position + amount)`.
    pub fn grow(&mut self, amount: usize) {
        let target = (self.capacity() * 2).max(self.pos + amount);
        self.buf.resize(target, 0);
    }

    pub fn ensure_capacity(&mut self, capacity: usize) {
        if self.capacity() < capacity {
            self.grow(capacity - self.pos);
        }
    }

    fn ensure_remaining(&mut self, amount: usize) {
        if self.remaining() < amount {
            self.grow(amount);
        }
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.ensure_remaining(bytes.len());
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        self.limit = self.pos;
    }

    pub fn append_u16(&mut self, v: u16) {
        self.append(&v.to_be_bytes());
    }

    pub fn append_u32(&mut self, v: u32) {
        self.append(&v.to_be_bytes());
    }

    /// Drains every unread byte of `other` into this buffer, growing as
    /// needed.
    pub fn append_from(&mut self, other: &mut ByteBuf) {
        let n = other.available();
        self.ensure_remaining(n);
        self.buf[self.pos..self.pos + n].copy_from_slice(&other.buf[other.pos..other.pos + n]);
        self.pos += n;
        self.limit = self.pos;
        other.pos += n;
    }

    /// Copies as many unread bytes of `other` as fit without growing.
    /// Returns the number of bytes copied; 0 means this buffer is full.
    pub fn append_no_resize(&mut self, other: &mut ByteBuf) -> usize {
        let n = self.remaining().min(other.available());
        if n > 0 {
            self.buf[self.pos..self.pos + n].copy_from_slice(&other.buf[other.pos..other.pos + n]);
            self.pos += n;
            self.limit = self.pos;
            other.pos += n;
        }
        n
    }

    /// Consumes `out.len()` unread bytes into a plain byte region.
    pub fn read_bytes(&mut self, out: &mut [u8]) -> Result<(), BufError> {
        if out.len() > self.available() {
            return Err(BufError::BadPosition);
        }
        out.copy_from_slice(&self.buf[self.pos..self.pos + out.len()]);
        self.pos += out.len();
        Ok(())
    }

    /// Appends `n` unread bytes of this buffer into `out`.
    pub fn read_into(&mut self, n: usize, out: &mut ByteBuf) -> Result<(), BufError> {
        if n > self.available() {
            return Err(BufError::BadPosition);
        }
        out.append(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(())
    }

    pub fn read_u16(&mut self) -> Result<u16, BufError> {
        if self.available() < 2 {
            return Err(BufError::BadPosition);
        }
        let v = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    pub fn read_u32(&mut self) -> Result<u32, BufError> {
        if self.available() < 4 {
            return Err(BufError::BadPosition);
        }
        let v = u32::from_be_bytes([
            self.buf[self.pos],
            self.buf[self.pos + 1],
            self.buf[self.pos + 2],
            self.buf[self.pos + 3],
        ]);
        self.pos += 4;
        Ok(v)
    }

    pub fn advance_read(&mut self, n: usize) -> Result<(), BufError> {
        if n > self.available() {
            return Err(BufError::BadPosition);
        }
        self.pos += n;
        Ok(())
    }

    /// Records `n` bytes written directly into the spare region.
    pub fn advance_write(&mut self, n: usize) {
        debug_assert!(self.pos + n <= self.capacity());
        self.pos += n;
        self.limit = self.pos;
    }

    /// Spare region for direct socket reads; pair with `advance_write`.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        let pos = self.pos;
        &mut self.buf[pos..]
    }

    /// Unread region for direct socket writes; pair with `advance_read`.
    pub fn unread(&self) -> &[u8] {
        &self.buf[self.pos..self.limit]
    }

    /// Every written byte regardless of the read position.
    pub fn written(&self) -> &[u8] {
        &self.buf[..self.limit]
    }

    /// Moves the unread tail to the front: position 0, limit = bytes kept,
    /// mark 0.
    pub fn compact(&mut self) {
        let n = self.limit - self.pos;
        self.buf.copy_within(self.pos..self.limit, 0);
        self.pos = 0;
        self.limit = n;
        self.mark = 0;
    }
}

impl std::fmt::Debug for ByteBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteBuf")
            .field("capacity", &self.capacity())
            .field("pos", &self.pos)
            .field("limit", &self.limit)
            .field("mark", &self.mark)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn append_then_read_big_endian() {
        let mut b = ByteBuf::new(16);
        b.append_u32(0x0102_0304);
        b.append_u16(0xBEEF);
        assert_eq!(b.written(), &[1, 2, 3, 4, 0xBE, 0xEF]);

        b.set_read_mode();
        assert_eq!(b.read_u32(), Ok(0x0102_0304));
        assert_eq!(b.read_u16(), Ok(0xBEEF));
        assert_eq!(b.read_u16(), Err(BufError::BadPosition));
    }

    #[test]
    fn grow_doubles_or_fits() {
        let mut b = ByteBuf::new(8);
        b.append(&[0u8; 8]);
        assert_eq!(b.capacity(), 8);
        b.append(&[1u8; 4]);
        assert_eq!(b.capacity(), 16);
        b.append(&[2u8; 100]);
        assert!(b.capacity() >= 112);
        assert_eq!(b.limit(), 112);
    }

    #[test]
    fn ensure_capacity_grows_only_when_needed() {
        let mut b = ByteBuf::new(8);
        b.ensure_capacity(4);
        assert_eq!(b.capacity(), 8);
        b.ensure_capacity(20);
        assert!(b.capacity() >= 20);
    }

    #[test]
    fn append_no_resize_stops_at_capacity() {
        let mut src = ByteBuf::new(16);
        src.append(&[7u8; 10]);
        src.set_read_mode();

        let mut dst = ByteBuf::new(4);
        assert_eq!(dst.append_no_resize(&mut src), 4);
        assert_eq!(dst.append_no_resize(&mut src), 0);
        assert_eq!(src.available(), 6);
        assert_eq!(dst.written(), &[7u8; 4]);
    }

    #[test]
    fn compact_preserves_unread_tail() {
        let mut b = ByteBuf::new(8);
        b.append(&[1, 2, 3, 4, 5]);
        b.set_read_mode();
        b.advance_read(3).unwrap();
        b.set_mark();
        b.compact();
        assert_eq!(b.position(), 0);
        assert_eq!(b.limit(), 2);
        assert_eq!(b.mark(), 0);
        assert_eq!(b.unread(), &[4, 5]);

        // appending continues after the preserved bytes
        b.set_write_mode();
        b.append(&[6, 7]);
        b.set_read_mode();
        assert_eq!(b.unread(), &[4, 5, 6, 7]);
    }

    #[test]
    fn mark_resumes_partial_read() {
        let mut b = ByteBuf::new(8);
        b.append(&[9, 8, 7, 6]);
        b.set_read_mode();
        b.advance_read(2).unwrap();
        b.set_mark();
        // a later read-mode switch resumes exactly at the mark
        b.set_read_mode();
        assert_eq!(b.unread(), &[7, 6]);
    }

    #[test]
    fn append_from_drains_source() {
        let mut src = ByteBuf::new(4);
        src.append(&[1, 2, 3]);
        src.set_read_mode();
        let mut dst = ByteBuf::new(0);
        dst.append_from(&mut src);
        assert_eq!(dst.written(), &[1, 2, 3]);
        assert_eq!(src.available(), 0);
    }

    #[test]
    fn spare_write_roundtrip() {
        let mut b = ByteBuf::new(8);
        b.spare_mut()[..3].copy_from_slice(&[1, 2, 3]);
        b.advance_write(3);
        b.set_read_mode();
        assert_eq!(b.unread(), &[1, 2, 3]);
        assert_eq!(b.remaining(), 8 - 3);
    }
}

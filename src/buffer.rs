//! The executable code buffer.
//!
//! An append-only byte sink over an anonymous `rwx` mapping. Bytes already
//! written are immutable except through [`CodeBuffer::patch`], which label
//! resolution uses to fill in branch displacements.

use crate::error::{Error, Result};

/// A contiguous region of executable memory with a write cursor.
pub struct CodeBuffer {
    base: *mut u8,
    capacity: usize,
    cursor: usize,
}

impl CodeBuffer {
    /// Map a new writable + executable region of at least `capacity` bytes
    /// (rounded up to the page size).
    pub fn new(capacity: usize) -> Result<CodeBuffer> {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let capacity = capacity.max(1).div_ceil(page) * page;
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            return Err(Error::MapFailed(errno));
        }
        Ok(CodeBuffer {
            base: base.cast(),
            capacity,
            cursor: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.cursor
    }

    /// Pointer to the first byte of the buffer.
    pub fn entry(&self) -> *const u8 {
        self.base
    }

    /// Pointer to the byte at `off`.
    pub fn addr_at(&self, off: usize) -> *const u8 {
        debug_assert!(off <= self.capacity);
        unsafe { self.base.add(off) }
    }

    /// Fail with `BufferFull` unless `n` more bytes fit. The encoder calls
    /// this with a worst-case instruction length before emitting anything,
    /// so a failed operation never leaves a partial instruction behind.
    pub fn require(&self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return Err(Error::BufferFull);
        }
        Ok(())
    }

    /// Append one byte. Infallible; the caller must have passed `require`.
    #[inline]
    pub(crate) fn put1(&mut self, b: u8) {
        debug_assert!(self.cursor < self.capacity);
        unsafe { self.base.add(self.cursor).write(b) };
        self.cursor += 1;
    }

    #[inline]
    pub(crate) fn put2(&mut self, v: u16) {
        self.put(&v.to_le_bytes());
    }

    #[inline]
    pub(crate) fn put4(&mut self, v: u32) {
        self.put(&v.to_le_bytes());
    }

    #[inline]
    pub(crate) fn put8(&mut self, v: u64) {
        self.put(&v.to_le_bytes());
    }

    #[inline]
    pub(crate) fn put(&mut self, bytes: &[u8]) {
        debug_assert!(self.remaining() >= bytes.len());
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(self.cursor), bytes.len());
        }
        self.cursor += bytes.len();
    }

    /// Append one byte, checking capacity.
    pub fn write_byte(&mut self, b: u8) -> Result<()> {
        self.require(1)?;
        self.put1(b);
        Ok(())
    }

    /// Append a little-endian 16-bit value, checking capacity.
    pub fn write_u16(&mut self, v: u16) -> Result<()> {
        self.require(2)?;
        self.put2(v);
        Ok(())
    }

    /// Append a little-endian 32-bit value, checking capacity.
    pub fn write_u32(&mut self, v: u32) -> Result<()> {
        self.require(4)?;
        self.put4(v);
        Ok(())
    }

    /// Append a little-endian 64-bit value, checking capacity.
    pub fn write_u64(&mut self, v: u64) -> Result<()> {
        self.require(8)?;
        self.put8(v);
        Ok(())
    }

    /// Append a byte slice, checking capacity.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.require(bytes.len())?;
        self.put(bytes);
        Ok(())
    }

    /// Overwrite already-written bytes at `off`. Used by label fixup
    /// resolution and never moves the cursor.
    pub fn patch(&mut self, off: usize, bytes: &[u8]) {
        debug_assert!(off + bytes.len() <= self.cursor, "patch beyond cursor");
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(off), bytes.len());
        }
    }

    /// The bytes emitted so far.
    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base, self.cursor) }
    }
}

impl Drop for CodeBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.cast(), self.capacity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_advance_cursor() {
        let mut buf = CodeBuffer::new(64).unwrap();
        buf.write_byte(0x90).unwrap();
        buf.write_u16(0x0201).unwrap();
        buf.write_u32(0x0605_0403).unwrap();
        buf.write_u64(0x0e0d_0c0b_0a09_0807).unwrap();
        assert_eq!(buf.cursor(), 15);
        assert_eq!(
            buf.bytes(),
            &[0x90, 1, 2, 3, 4, 5, 6, 7, 8, 9, 0xa, 0xb, 0xc, 0xd, 0xe]
        );
    }

    #[test]
    fn full_buffer_preserves_cursor() {
        let mut buf = CodeBuffer::new(1).unwrap();
        let cap = buf.capacity();
        buf.write_bytes(&vec![0x90; cap]).unwrap();
        let at = buf.cursor();
        assert!(matches!(buf.write_byte(0x90), Err(Error::BufferFull)));
        assert_eq!(buf.cursor(), at);
    }

    #[test]
    fn patch_rewrites_in_place() {
        let mut buf = CodeBuffer::new(64).unwrap();
        buf.write_u32(0).unwrap();
        buf.patch(1, &[0xaa, 0xbb]);
        assert_eq!(buf.bytes(), &[0, 0xaa, 0xbb, 0]);
        assert_eq!(buf.cursor(), 4);
    }
}

//! JIT code buffer backed by mmap'd memory.

use std::io;
use std::slice;

/// Default code buffer size: 16 MiB.
pub const DEFAULT_CODE_BUF_SIZE: usize = 16 * 1024 * 1024;

/// A region of memory that generated code is emitted into.
///
/// Pages follow the write-then-execute discipline: the mapping starts
/// writable, `set_executable` seals it before any generated code
/// runs, and every later mutation — a freshly compiled block, a chain
/// patch, an unlink — happens inside a `set_writable` ..
/// `set_executable` bracket. The dispatcher owns the bracketing; this
/// type only moves bytes and flips protections.
pub struct CodeBuffer {
    ptr: *mut u8,
    size: usize,
    offset: usize,
}

// SAFETY: CodeBuffer owns its mapping exclusively.
unsafe impl Send for CodeBuffer {}

impl CodeBuffer {
    /// Map a new writable buffer of `size` bytes (rounded up to the
    /// page size).
    pub fn new(size: usize) -> io::Result<CodeBuffer> {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let size = (size + page - 1) & !(page - 1);

        // SAFETY: anonymous private mapping, no file backing.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(CodeBuffer {
            ptr: ptr as *mut u8,
            size,
            offset: 0,
        })
    }

    pub fn with_default_size() -> io::Result<CodeBuffer> {
        CodeBuffer::new(DEFAULT_CODE_BUF_SIZE)
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.size - self.offset
    }

    #[inline]
    pub fn base_ptr(&self) -> *const u8 {
        self.ptr as *const u8
    }

    #[inline]
    pub fn ptr_at(&self, offset: usize) -> *const u8 {
        assert!(offset <= self.size);
        // SAFETY: offset is in bounds.
        unsafe { self.ptr.add(offset) as *const u8 }
    }

    /// Rewind the write cursor (cache flush, or discarding a block
    /// whose compile failed part-way).
    #[inline]
    pub fn set_offset(&mut self, offset: usize) {
        assert!(offset <= self.size);
        self.offset = offset;
    }

    /// The whole mapping as a byte slice.
    fn window(&self) -> &[u8] {
        // SAFETY: the mapping spans `size` readable bytes.
        unsafe { slice::from_raw_parts(self.ptr, self.size) }
    }

    /// Writes through this require the writable protection state.
    fn window_mut(&mut self) -> &mut [u8] {
        // SAFETY: the mapping spans `size` bytes and is exclusively
        // owned.
        unsafe { slice::from_raw_parts_mut(self.ptr, self.size) }
    }

    // -- emission --

    /// Append raw instruction bytes at the cursor.
    pub fn emit(&mut self, data: &[u8]) {
        let at = self.offset;
        let end = at + data.len();
        assert!(end <= self.size, "out of code buffer space");
        self.window_mut()[at..end].copy_from_slice(data);
        self.offset = end;
    }

    #[inline]
    pub fn emit_u8(&mut self, val: u8) {
        self.emit(&[val]);
    }

    #[inline]
    pub fn emit_u32(&mut self, val: u32) {
        self.emit(&val.to_le_bytes());
    }

    #[inline]
    pub fn emit_u64(&mut self, val: u64) {
        self.emit(&val.to_le_bytes());
    }

    // -- back-patching --

    /// Overwrite previously emitted bytes (jump resolution and chain
    /// linking).
    pub fn patch(&mut self, at: usize, data: &[u8]) {
        let end = at + data.len();
        assert!(end <= self.offset, "patch beyond emitted code");
        self.window_mut()[at..end].copy_from_slice(data);
    }

    #[inline]
    pub fn patch_u8(&mut self, at: usize, val: u8) {
        self.patch(at, &[val]);
    }

    #[inline]
    pub fn patch_u32(&mut self, at: usize, val: u32) {
        self.patch(at, &val.to_le_bytes());
    }

    pub fn read_u32(&self, at: usize) -> u32 {
        let w = &self.window()[at..at + 4];
        u32::from_le_bytes([w[0], w[1], w[2], w[3]])
    }

    /// Everything emitted so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.window()[..self.offset]
    }

    // -- page protection (write-then-execute) --

    /// Seal the mapping for execution.
    pub fn set_executable(&self) -> io::Result<()> {
        self.protect(libc::PROT_READ | libc::PROT_EXEC)
    }

    /// Reopen the mapping for emission or patching.
    pub fn set_writable(&self) -> io::Result<()> {
        self.protect(libc::PROT_READ | libc::PROT_WRITE)
    }

    fn protect(&self, prot: i32) -> io::Result<()> {
        let ret = unsafe { libc::mprotect(self.ptr as *mut libc::c_void, self.size, prot) };
        if ret != 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

impl Drop for CodeBuffer {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.size);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_and_read_back() {
        let mut buf = CodeBuffer::new(4096).unwrap();
        buf.emit_u8(0x90);
        buf.emit_u32(0xDEAD_BEEF);
        assert_eq!(buf.offset(), 5);
        assert_eq!(buf.as_slice()[0], 0x90);
        assert_eq!(buf.read_u32(1), 0xDEAD_BEEF);
    }

    #[test]
    fn patch_in_place() {
        let mut buf = CodeBuffer::new(4096).unwrap();
        buf.emit_u32(0);
        buf.patch_u32(0, 0x1234_5678);
        assert_eq!(buf.read_u32(0), 0x1234_5678);
        assert_eq!(buf.offset(), 4);
    }

    #[test]
    fn rewind() {
        let mut buf = CodeBuffer::new(4096).unwrap();
        buf.emit_u64(0);
        buf.set_offset(0);
        assert_eq!(buf.remaining(), buf.capacity());
    }

    #[test]
    fn protection_brackets_allow_further_emission() {
        let mut buf = CodeBuffer::new(4096).unwrap();
        buf.emit_u8(0xC3);
        buf.set_executable().unwrap();
        // Reads stay legal while sealed.
        assert_eq!(buf.as_slice(), &[0xC3]);
        buf.set_writable().unwrap();
        buf.emit_u8(0x90);
        assert_eq!(buf.as_slice(), &[0xC3, 0x90]);
    }
}

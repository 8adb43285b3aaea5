use std::io::{ErrorKind, Write};

/// A stack allocated, fixed capacity writer.
///
/// `FixedBufferWriter<N>` implements `std::io::Write` over an internal buffer
/// on the stack, so a forked child can format without touching the heap.
///
/// # Example
///
/// ```rust
/// use std::io::Write;
/// use fdfence::FixedBufferWriter;
///
/// let mut w: FixedBufferWriter<6> = FixedBufferWriter::new();
/// write!(&mut w, "exec {}", 2).unwrap();
/// assert_eq!(w.buffer(), b"exec 2");
/// ```
pub struct FixedBufferWriter<const COUNT: usize> {
    buffer: [u8; COUNT],
    pos: usize,
}

impl<const COUNT: usize> FixedBufferWriter<COUNT> {
    pub fn new() -> Self {
        Self {
            pos: 0,
            buffer: [0u8; COUNT],
        }
    }

    /// The bytes written so far.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer[..self.pos]
    }

    /// Number of written bytes.
    pub fn len(&self) -> usize {
        self.pos
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<const COUNT: usize> Default for FixedBufferWriter<COUNT> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const COUNT: usize> Write for FixedBufferWriter<COUNT> {
    /// All or nothing: a write that does not fit leaves the buffer untouched.
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let end = self.pos + buf.len();

        if end > COUNT {
            return Err(std::io::Error::from(ErrorKind::WriteZero));
        }

        self.buffer[self.pos..end].copy_from_slice(buf);
        self.pos = end;

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

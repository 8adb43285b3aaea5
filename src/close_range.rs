/// A small wrapper around close_range(2).
///
/// Only immediate closing is supported, the restricting pass has no use for
/// `CLOSE_RANGE_CLOEXEC` or `CLOSE_RANGE_UNSHARE`.
///
/// # Signal Safety
/// This builder is async-signal-safe, it is a plain syscall.
pub struct CloseRange {
    first: u32,
    last: u32,
}

impl CloseRange {
    /// Descriptors from `first` to `last`, both inclusive.
    pub fn new(first: u32, last: u32) -> Self {
        Self { first, last }
    }

    /// Close every descriptor of the range.
    ///
    /// Fails with `ENOSYS` on kernels older than 5.9 and `EINVAL` when
    /// `first > last`.
    pub fn close(&self) -> Result<(), crate::Errno> {
        let ret = unsafe {
            libc::syscall(
                libc::SYS_close_range,
                self.first as libc::c_uint,
                self.last as libc::c_uint,
                0 as libc::c_uint,
            )
        };

        match ret {
            0 => Ok(()),
            _ => Err(crate::Errno::last()),
        }
    }
}

//! Reporting a failed launch from the child without touching the heap.
//!
//! The child formats `"<stage> <errno>"` into a [`FixedBufferWriter`] and
//! writes it to the close-on-exec status pipe. The parent reads the pipe
//! after spawning: no bytes means `exec` succeeded.

use std::{fmt, io::Write, os::fd::RawFd};

use crate::fixed_buf_writer::FixedBufferWriter;

/// A raw `errno` value captured in the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Errno(pub i32);

impl Errno {
    /// Read `errno` for the calling thread.
    ///
    /// # Signal Safety
    /// This function is signal safe, it does not allocate.
    pub fn last() -> Self {
        Self(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }
}

/// The child-side stage that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// A launch option could not set up its redirection.
    Redirect,
    /// Collecting or closing descriptors failed. Always reported with
    /// [`RESTRICT_ERRNO`].
    Restrict,
    /// `execve` returned.
    Exec,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Redirect => "redirect",
            Stage::Restrict => "restrict",
            Stage::Exec => "exec",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "redirect" => Some(Stage::Redirect),
            "restrict" => Some(Stage::Restrict),
            "exec" => Some(Stage::Exec),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errno sent with [`Stage::Restrict`].
///
/// The only way the restricting pass fails in the child is protected storage
/// too small for what the options contribute, which is not an allocation
/// failure.
pub const RESTRICT_ERRNO: Errno = Errno(libc::ENOBUFS);

/// Longest report: the longest stage name, a space and an `i32`.
pub const REPORT_LEN: usize = 8 + 1 + 11;

/// Format a failure report.
pub fn format_report(
    stage: Stage,
    errno: Errno,
) -> FixedBufferWriter<REPORT_LEN> {
    let mut w = FixedBufferWriter::new();
    // REPORT_LEN fits every stage and errno.
    let _ = write!(&mut w, "{} {}", stage.as_str(), errno.0);
    w
}

/// Write a failure report to `fd`, retrying on `EINTR`. Errors are dropped,
/// the child has nowhere left to report them.
///
/// # Signal Safety
/// This function is signal safe.
pub fn send_report(fd: RawFd, stage: Stage, errno: Errno) {
    let report = format_report(stage, errno);
    let mut remaining = report.buffer();

    while !remaining.is_empty() {
        let n = unsafe {
            libc::write(fd, remaining.as_ptr().cast(), remaining.len())
        };
        if n < 0 {
            if Errno::last().0 == libc::EINTR {
                continue;
            }
            return;
        }
        remaining = &remaining[n as usize..];
    }
}

/// Parse a report read from the status pipe.
pub fn parse_report(bytes: &[u8]) -> Option<(Stage, Errno)> {
    let text = std::str::from_utf8(bytes).ok()?;
    let (stage, errno) = text.split_once(' ')?;
    Some((Stage::parse(stage)?, Errno(errno.parse().ok()?)))
}

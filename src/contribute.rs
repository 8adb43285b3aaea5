//! The contribution protocol: how launch options declare which descriptors
//! must survive into the child.

use std::{collections::TryReserveError, os::fd::RawFd};

use serde::{Deserialize, Serialize};

/// Which collection pass is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    /// Before duplication. The sink may grow its storage.
    Prepare,
    /// Between duplication and program replacement. The sink never
    /// allocates; entries that do not fit are dropped and counted.
    Critical,
}

/// Append-only destination for contributed descriptors.
///
/// # Signal Safety
/// During [`Pass::Critical`] pushing is async-signal-safe, it only writes
/// into capacity reserved ahead of time.
pub struct FdSink<'a> {
    buf: &'a mut Vec<RawFd>,
    pass: Pass,
    dropped: usize,
    reserve_error: Option<TryReserveError>,
}

impl<'a> FdSink<'a> {
    pub(crate) fn new(buf: &'a mut Vec<RawFd>, pass: Pass) -> Self {
        Self {
            buf,
            pass,
            dropped: 0,
            reserve_error: None,
        }
    }

    pub fn push(&mut self, fd: RawFd) {
        if self.buf.len() == self.buf.capacity() {
            match self.pass {
                Pass::Critical => {
                    self.dropped += 1;
                    return;
                }
                Pass::Prepare => {
                    if let Err(e) = self.buf.try_reserve(1) {
                        self.dropped += 1;
                        self.reserve_error.get_or_insert(e);
                        return;
                    }
                }
            }
        }

        self.buf.push(fd);
    }

    pub fn push_stream(&mut self, stream: StdStream) {
        self.push(stream.fd());
    }

    /// Number of descriptors that did not fit.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub(crate) fn finish(self) -> (usize, Option<TryReserveError>) {
        (self.dropped, self.reserve_error)
    }
}

/// Implemented by everything that can take part in a launch.
///
/// The default body contributes nothing, which is right for options that
/// never touch a descriptor. Options that redirect a standard stream or hand
/// a descriptor to the child must override it, otherwise the descriptor is
/// closed before the program starts.
///
/// Implementations must only push into the sink: no allocation, no locks,
/// no failure.
///
/// # Example
///
/// ```rust
/// use std::os::fd::RawFd;
/// use fdfence::{CollectFds, FdSink};
///
/// struct ListenSocket(RawFd);
///
/// impl CollectFds for ListenSocket {
///     fn collect_fds(&self, sink: &mut FdSink<'_>) {
///         sink.push(self.0);
///     }
/// }
/// ```
pub trait CollectFds {
    fn collect_fds(&self, _sink: &mut FdSink<'_>) {}
}

impl<T: CollectFds + ?Sized> CollectFds for &T {
    fn collect_fds(&self, sink: &mut FdSink<'_>) {
        (**self).collect_fds(sink);
    }
}

impl<T: CollectFds + ?Sized> CollectFds for Box<T> {
    fn collect_fds(&self, sink: &mut FdSink<'_>) {
        (**self).collect_fds(sink);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StdStream {
    Stdin,
    Stdout,
    Stderr,
}

impl StdStream {
    pub fn fd(self) -> RawFd {
        match self {
            StdStream::Stdin => libc::STDIN_FILENO,
            StdStream::Stdout => libc::STDOUT_FILENO,
            StdStream::Stderr => libc::STDERR_FILENO,
        }
    }
}

/// A stream an output option can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutStream {
    Stdout,
    Stderr,
}

impl From<OutStream> for StdStream {
    fn from(stream: OutStream) -> Self {
        match stream {
            OutStream::Stdout => StdStream::Stdout,
            OutStream::Stderr => StdStream::Stderr,
        }
    }
}

/// The two independent target parameters of an output option.
///
/// Each slot binds stdout, stderr or nothing. Both slots may name the same
/// stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutTargets {
    first: Option<OutStream>,
    second: Option<OutStream>,
}

impl OutTargets {
    pub fn new(first: Option<OutStream>, second: Option<OutStream>) -> Self {
        Self { first, second }
    }

    pub fn stdout() -> Self {
        Self::new(Some(OutStream::Stdout), None)
    }

    pub fn stderr() -> Self {
        Self::new(Some(OutStream::Stderr), None)
    }

    /// Bind stdout and stderr to the same destination (`2>&1`).
    pub fn both() -> Self {
        Self::new(Some(OutStream::Stdout), Some(OutStream::Stderr))
    }

    pub fn binds(&self, stream: OutStream) -> bool {
        self.first == Some(stream) || self.second == Some(stream)
    }

    /// Iterate over the bound streams, each at most once, stdout first.
    pub fn streams(&self) -> impl Iterator<Item = StdStream> + use<> {
        let stdout = self.binds(OutStream::Stdout).then_some(StdStream::Stdout);
        let stderr = self.binds(OutStream::Stderr).then_some(StdStream::Stderr);
        stdout.into_iter().chain(stderr)
    }
}

impl CollectFds for OutTargets {
    fn collect_fds(&self, sink: &mut FdSink<'_>) {
        for stream in self.streams() {
            sink.push_stream(stream);
        }
    }
}

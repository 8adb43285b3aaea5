//! Built-in launch options for wiring the child's standard streams.
//!
//! Each option declares the standard stream(s) it binds through
//! [`CollectFds`] and performs the redirection in [`LaunchOption::on_exec_setup`].
//! Source descriptors (pipe ends, opened files) are not contributed: once
//! duplicated onto the standard stream they are closed by the restricting
//! pass.

use std::{
    ffi::{CStr, CString, OsStr},
    os::fd::RawFd,
};

use crate::{
    child_report::Errno,
    contribute::{CollectFds, FdSink, OutTargets, StdStream},
    error::{FenceError, Result},
};

/// A unit of launch configuration.
///
/// `on_exec_setup` runs in the child after duplication, before the
/// restricting pass and before `execve`. It must only use async-signal-safe
/// calls: no allocation, no locks, no logging. See signal-safety(7).
pub trait LaunchOption: CollectFds {
    fn on_exec_setup(&self) -> std::result::Result<(), Errno> {
        Ok(())
    }
}

impl<T: LaunchOption + ?Sized> LaunchOption for Box<T> {
    fn on_exec_setup(&self) -> std::result::Result<(), Errno> {
        (**self).on_exec_setup()
    }
}

const DEV_NULL: &CStr = c"/dev/null";

fn path_to_cstring<P: AsRef<OsStr>>(path: P) -> Result<CString> {
    CString::new(path.as_ref().as_encoded_bytes())
        .map_err(|source| FenceError::Nul {
            what: "path",
            source,
        })
}

fn cvt(ret: libc::c_int) -> std::result::Result<libc::c_int, Errno> {
    if ret < 0 { Err(Errno::last()) } else { Ok(ret) }
}

fn open(path: &CStr, flags: libc::c_int) -> std::result::Result<RawFd, Errno> {
    cvt(unsafe { libc::open(path.as_ptr(), flags, 0o644 as libc::c_uint) })
}

/// Duplicate `src` onto `dst`, retrying on `EINTR`.
fn redirect(src: RawFd, dst: RawFd) -> std::result::Result<(), Errno> {
    loop {
        match cvt(unsafe { libc::dup2(src, dst) }) {
            Ok(_) => return Ok(()),
            Err(Errno(libc::EINTR)) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Open `path` and put it on every stream of `streams`.
///
/// The file is opened close-on-exec so only its copies on the standard
/// streams reach the new program, restricted or not. `dup2` clears the flag
/// on the copy; when `open` lands directly on a target stream the flag is
/// cleared by hand.
fn open_onto<I>(
    path: &CStr,
    flags: libc::c_int,
    streams: I,
) -> std::result::Result<(), Errno>
where
    I: IntoIterator<Item = StdStream>,
{
    let fd = open(path, flags | libc::O_CLOEXEC)?;
    for stream in streams {
        if fd == stream.fd() {
            cvt(unsafe { libc::fcntl(fd, libc::F_SETFD, 0) })?;
        } else {
            redirect(fd, stream.fd())?;
        }
    }
    Ok(())
}

fn redirect_onto<I>(fd: RawFd, streams: I) -> std::result::Result<(), Errno>
where
    I: IntoIterator<Item = StdStream>,
{
    for stream in streams {
        if fd != stream.fd() {
            redirect(fd, stream.fd())?;
        }
    }
    Ok(())
}

const WRITE_FLAGS: libc::c_int = libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC;

/// Read standard input from a file.
#[derive(Debug, Clone)]
pub struct FileIn {
    path: CString,
}

impl FileIn {
    pub fn new<P: AsRef<OsStr>>(path: P) -> Result<Self> {
        Ok(Self {
            path: path_to_cstring(path)?,
        })
    }
}

impl CollectFds for FileIn {
    fn collect_fds(&self, sink: &mut FdSink<'_>) {
        sink.push_stream(StdStream::Stdin);
    }
}

impl LaunchOption for FileIn {
    fn on_exec_setup(&self) -> std::result::Result<(), Errno> {
        open_onto(&self.path, libc::O_RDONLY, [StdStream::Stdin])
    }
}

/// Write stdout and/or stderr to a file, truncating it.
#[derive(Debug, Clone)]
pub struct FileOut {
    path: CString,
    targets: OutTargets,
}

impl FileOut {
    pub fn new<P: AsRef<OsStr>>(path: P, targets: OutTargets) -> Result<Self> {
        Ok(Self {
            path: path_to_cstring(path)?,
            targets,
        })
    }
}

impl CollectFds for FileOut {
    fn collect_fds(&self, sink: &mut FdSink<'_>) {
        self.targets.collect_fds(sink);
    }
}

impl LaunchOption for FileOut {
    fn on_exec_setup(&self) -> std::result::Result<(), Errno> {
        open_onto(&self.path, WRITE_FLAGS, self.targets.streams())
    }
}

/// Read standard input from the read end of a pipe.
#[derive(Debug, Clone, Copy)]
pub struct PipeIn {
    read_end: RawFd,
}

impl PipeIn {
    pub fn new(read_end: RawFd) -> Self {
        Self { read_end }
    }
}

impl CollectFds for PipeIn {
    fn collect_fds(&self, sink: &mut FdSink<'_>) {
        sink.push_stream(StdStream::Stdin);
    }
}

impl LaunchOption for PipeIn {
    fn on_exec_setup(&self) -> std::result::Result<(), Errno> {
        redirect_onto(self.read_end, [StdStream::Stdin])
    }
}

/// Write stdout and/or stderr into the write end of a pipe.
#[derive(Debug, Clone, Copy)]
pub struct PipeOut {
    write_end: RawFd,
    targets: OutTargets,
}

impl PipeOut {
    pub fn new(write_end: RawFd, targets: OutTargets) -> Self {
        Self { write_end, targets }
    }
}

impl CollectFds for PipeOut {
    fn collect_fds(&self, sink: &mut FdSink<'_>) {
        self.targets.collect_fds(sink);
    }
}

impl LaunchOption for PipeOut {
    fn on_exec_setup(&self) -> std::result::Result<(), Errno> {
        redirect_onto(self.write_end, self.targets.streams())
    }
}

/// Standard input reads from `/dev/null`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullIn;

impl CollectFds for NullIn {
    fn collect_fds(&self, sink: &mut FdSink<'_>) {
        sink.push_stream(StdStream::Stdin);
    }
}

impl LaunchOption for NullIn {
    fn on_exec_setup(&self) -> std::result::Result<(), Errno> {
        open_onto(DEV_NULL, libc::O_RDONLY, [StdStream::Stdin])
    }
}

/// Discard stdout and/or stderr into `/dev/null`.
#[derive(Debug, Clone, Copy)]
pub struct NullOut {
    targets: OutTargets,
}

impl NullOut {
    pub fn new(targets: OutTargets) -> Self {
        Self { targets }
    }
}

impl CollectFds for NullOut {
    fn collect_fds(&self, sink: &mut FdSink<'_>) {
        self.targets.collect_fds(sink);
    }
}

impl LaunchOption for NullOut {
    fn on_exec_setup(&self) -> std::result::Result<(), Errno> {
        open_onto(DEV_NULL, libc::O_WRONLY, self.targets.streams())
    }
}

/// Child half of a pipe whose other end feeds a buffer to the child's
/// standard input asynchronously. Servicing the parent end is the caller's
/// job.
#[derive(Debug, Clone, Copy)]
pub struct AsyncInBuffer {
    read_end: RawFd,
}

impl AsyncInBuffer {
    pub fn new(read_end: RawFd) -> Self {
        Self { read_end }
    }
}

impl CollectFds for AsyncInBuffer {
    fn collect_fds(&self, sink: &mut FdSink<'_>) {
        sink.push_stream(StdStream::Stdin);
    }
}

impl LaunchOption for AsyncInBuffer {
    fn on_exec_setup(&self) -> std::result::Result<(), Errno> {
        redirect_onto(self.read_end, [StdStream::Stdin])
    }
}

/// Child half of a pipe whose other end captures stdout and/or stderr into
/// a buffer asynchronously.
#[derive(Debug, Clone, Copy)]
pub struct AsyncOutBuffer {
    write_end: RawFd,
    targets: OutTargets,
}

impl AsyncOutBuffer {
    pub fn new(write_end: RawFd, targets: OutTargets) -> Self {
        Self { write_end, targets }
    }
}

impl CollectFds for AsyncOutBuffer {
    fn collect_fds(&self, sink: &mut FdSink<'_>) {
        self.targets.collect_fds(sink);
    }
}

impl LaunchOption for AsyncOutBuffer {
    fn on_exec_setup(&self) -> std::result::Result<(), Errno> {
        redirect_onto(self.write_end, self.targets.streams())
    }
}

/// Child end of an asynchronous pipe feeding standard input. The parent end
/// is serviced by the caller's event loop.
#[derive(Debug, Clone, Copy)]
pub struct AsyncPipeIn {
    read_end: RawFd,
}

impl AsyncPipeIn {
    pub fn new(read_end: RawFd) -> Self {
        Self { read_end }
    }
}

impl CollectFds for AsyncPipeIn {
    fn collect_fds(&self, sink: &mut FdSink<'_>) {
        sink.push_stream(StdStream::Stdin);
    }
}

impl LaunchOption for AsyncPipeIn {
    fn on_exec_setup(&self) -> std::result::Result<(), Errno> {
        redirect_onto(self.read_end, [StdStream::Stdin])
    }
}

/// Child end of an asynchronous pipe draining stdout and/or stderr.
#[derive(Debug, Clone, Copy)]
pub struct AsyncPipeOut {
    write_end: RawFd,
    targets: OutTargets,
}

impl AsyncPipeOut {
    pub fn new(write_end: RawFd, targets: OutTargets) -> Self {
        Self { write_end, targets }
    }
}

impl CollectFds for AsyncPipeOut {
    fn collect_fds(&self, sink: &mut FdSink<'_>) {
        self.targets.collect_fds(sink);
    }
}

impl LaunchOption for AsyncPipeOut {
    fn on_exec_setup(&self) -> std::result::Result<(), Errno> {
        redirect_onto(self.write_end, self.targets.streams())
    }
}

/// Like [`AsyncOutBuffer`], but the parent resolves the captured output as a
/// single value once the child closes its end.
#[derive(Debug, Clone, Copy)]
pub struct AsyncOutFuture {
    write_end: RawFd,
    targets: OutTargets,
}

impl AsyncOutFuture {
    pub fn new(write_end: RawFd, targets: OutTargets) -> Self {
        Self { write_end, targets }
    }
}

impl CollectFds for AsyncOutFuture {
    fn collect_fds(&self, sink: &mut FdSink<'_>) {
        self.targets.collect_fds(sink);
    }
}

impl LaunchOption for AsyncOutFuture {
    fn on_exec_setup(&self) -> std::result::Result<(), Errno> {
        redirect_onto(self.write_end, self.targets.streams())
    }
}

use std::{
    ffi::{CString, NulError, OsStr},
    fs::File,
    io::Read,
    os::{
        fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
        unix::process::ExitStatusExt,
    },
    process::ExitStatus,
};

use crate::{
    child_report::{self, Errno, REPORT_LEN, RESTRICT_ERRNO, Stage},
    clone3::{Duplicated, duplicate},
    closer::FdRestrict,
    collector::LaunchConfiguration,
    config::RestrictConfig,
    contribute::{CollectFds, FdSink},
    error::{FenceError, Result},
    options::LaunchOption,
};

/// A program to launch with a restricted descriptor table.
///
/// Only the standard streams bound by its options, descriptors passed to
/// [`Command::preserve_fd`] and the internal status pipe survive into the
/// child; `execve` closes the status pipe.
///
/// # Example
///
/// ```no_run
/// use fdfence::{Command, NullOut, OutTargets};
///
/// let mut child = Command::new("/bin/true")
///     .option(NullOut::new(OutTargets::both()))
///     .spawn()
///     .unwrap();
/// assert!(child.wait().unwrap().success());
/// ```
pub struct Command {
    cmd: CString,
    args: Vec<CString>,
    env: Vec<CString>,
    options: Vec<Box<dyn LaunchOption>>,
    preserved: Vec<RawFd>,
    restrict: RestrictConfig,
    /// Write end of the status pipe while a spawn is in flight.
    status_fd: Option<RawFd>,
    /// First value rejected while building, reported by every `spawn`.
    invalid: Option<(&'static str, NulError)>,
}

impl Command {
    pub fn new<C: AsRef<OsStr>>(cmd: C) -> Self {
        let mut invalid = None;
        let cmd = to_cstring(cmd, "command", &mut invalid);
        let mut args = Vec::with_capacity(2);
        args.push(cmd.clone());

        Self {
            cmd,
            args,
            env: vec![],
            options: vec![],
            preserved: vec![],
            restrict: RestrictConfig::default(),
            status_fd: None,
            invalid,
        }
    }

    pub fn arg<C: AsRef<OsStr>>(mut self, arg: C) -> Self {
        let arg = to_cstring(arg, "argument", &mut self.invalid);
        self.args.push(arg);
        self
    }

    /// Add a `KEY=VALUE` entry. The child environment holds only these.
    pub fn env<C: AsRef<OsStr>>(mut self, env: C) -> Self {
        let env = to_cstring(env, "environment", &mut self.invalid);
        self.env.push(env);
        self
    }

    pub fn option<O: LaunchOption + 'static>(mut self, option: O) -> Self {
        self.options.push(Box::new(option));
        self
    }

    /// Keep `fd` open in the child, under the same number.
    pub fn preserve_fd(mut self, fd: RawFd) -> Self {
        self.preserved.push(fd);
        self
    }

    pub fn restrict(mut self, config: RestrictConfig) -> Self {
        self.restrict = config;
        self
    }

    /// Return a c-style null-terminated array for self.args
    fn get_argv(&self) -> Vec<*const libc::c_char> {
        let mut argv: Vec<*const libc::c_char> =
            self.args.iter().map(|arg| arg.as_ptr()).collect();

        argv.push(std::ptr::null());
        argv
    }

    /// Return a c-style null-terminated array for self.env
    fn get_envp(&self) -> Vec<*const libc::c_char> {
        let mut envp: Vec<*const libc::c_char> =
            self.env.iter().map(|env| env.as_ptr()).collect();

        envp.push(std::ptr::null());
        envp
    }

    /// Room for every option binding two streams, the preserved descriptors
    /// and the status pipe.
    fn capacity_hint(&self) -> usize {
        2 * self.options.len() + self.preserved.len() + 1
    }

    pub fn spawn(&mut self) -> Result<Child> {
        if let Some((what, source)) = &self.invalid {
            return Err(FenceError::Nul {
                what: *what,
                source: source.clone(),
            });
        }

        let argv = self.get_argv();
        let envp = self.get_envp();

        let (status_read, status_write) = status_pipe()?;
        self.status_fd = Some(status_write.as_raw_fd());

        let mut restrict = if self.restrict.enabled {
            match self.prepare_restrict() {
                Ok(restrict) => Some(restrict),
                Err(e) => {
                    self.status_fd = None;
                    return Err(e);
                }
            }
        } else {
            None
        };

        // SAFETY: The child only runs async-signal-safe functions
        // See: signal-safety(7)
        let duplicated = unsafe { duplicate() };

        let pid = match duplicated {
            Ok(Duplicated::Child) => {
                self.exec_child(restrict.as_mut(), &argv, &envp)
            }
            Ok(Duplicated::Parent(pid)) => pid,
            Err(source) => {
                self.status_fd = None;
                return Err(FenceError::Os {
                    call: "clone3",
                    source,
                });
            }
        };

        self.status_fd = None;
        drop(status_write);
        tracing::debug!(pid, program = ?self.cmd, "spawned child");

        settle(Child { pid, status: None }, read_report(status_read))
    }

    fn prepare_restrict(&self) -> Result<FdRestrict> {
        let mut restrict =
            FdRestrict::from_config(&self.restrict, self.capacity_hint())?;
        restrict.prepare(self)?;
        Ok(restrict)
    }

    /// Runs in the child. Never returns.
    fn exec_child(
        &self,
        restrict: Option<&mut FdRestrict>,
        argv: &[*const libc::c_char],
        envp: &[*const libc::c_char],
    ) -> ! {
        let status_fd = self.status_fd.unwrap_or(-1);
        let fail = |stage: Stage, errno: Errno| -> ! {
            child_report::send_report(status_fd, stage, errno);
            unsafe { libc::_exit(127) }
        };

        for option in &self.options {
            if let Err(errno) = option.on_exec_setup() {
                fail(Stage::Redirect, errno);
            }
        }

        if let Some(restrict) = restrict {
            if restrict.on_exec_setup(self).is_err() {
                fail(Stage::Restrict, RESTRICT_ERRNO);
            }
        }

        unsafe {
            libc::execve(self.cmd.as_ptr(), argv.as_ptr(), envp.as_ptr())
        };
        fail(Stage::Exec, Errno::last())
    }
}

impl CollectFds for Command {
    fn collect_fds(&self, sink: &mut FdSink<'_>) {
        if let Some(fd) = self.status_fd {
            sink.push(fd);
        }
        for &fd in &self.preserved {
            sink.push(fd);
        }
    }
}

impl LaunchConfiguration for Command {
    fn visit_contributors(&self, visit: &mut dyn FnMut(&dyn CollectFds)) {
        visit(self);
        for option in &self.options {
            visit(option);
        }
    }
}

fn to_cstring<C: AsRef<OsStr>>(
    value: C,
    what: &'static str,
    invalid: &mut Option<(&'static str, NulError)>,
) -> CString {
    CString::new(value.as_ref().as_encoded_bytes()).unwrap_or_else(|source| {
        invalid.get_or_insert((what, source));
        CString::default()
    })
}

/// A close-on-exec pipe, `(read, write)`.
fn status_pipe() -> Result<(File, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];

    #[cfg(target_os = "linux")]
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };

    #[cfg(not(target_os = "linux"))]
    let ret = unsafe {
        let ret = libc::pipe(fds.as_mut_ptr());
        if ret == 0 {
            libc::fcntl(fds[0], libc::F_SETFD, libc::FD_CLOEXEC);
            libc::fcntl(fds[1], libc::F_SETFD, libc::FD_CLOEXEC);
        }
        ret
    };

    if ret != 0 {
        return Err(FenceError::last_os("pipe"));
    }

    // SAFETY: both descriptors were just opened and are owned by nobody else.
    Ok(unsafe { (File::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Wait for `exec` to close the status pipe, or for a failure report.
fn read_report(mut status: File) -> Result<Option<(Stage, Errno)>> {
    let mut buf = [0u8; REPORT_LEN];
    let mut len = 0;

    loop {
        match status.read(&mut buf[len..]) {
            Ok(0) => break,
            Ok(n) => {
                len += n;
                if len == buf.len() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(source) => {
                return Err(FenceError::Os {
                    call: "read",
                    source,
                });
            }
        }
    }

    if len == 0 {
        return Ok(None);
    }
    Ok(Some(
        child_report::parse_report(&buf[..len])
            .unwrap_or((Stage::Exec, Errno(libc::EIO))),
    ))
}

/// Turn the status pipe's verdict into the result of `spawn`. A child that
/// failed, or whose report could not be read, is reaped before returning.
fn settle(
    mut child: Child,
    report: Result<Option<(Stage, Errno)>>,
) -> Result<Child> {
    match report {
        Ok(None) => Ok(child),
        Ok(Some((stage, errno))) => {
            // reap it, the report already says why it died
            let _ = child.wait();
            Err(FenceError::ChildSetup {
                stage,
                source: std::io::Error::from_raw_os_error(errno.0),
            })
        }
        Err(e) => {
            tracing::warn!(pid = child.pid, error = %e, "status pipe unreadable");
            let _ = child.wait();
            Err(e)
        }
    }
}

/// A spawned child process.
#[derive(Debug)]
pub struct Child {
    pid: libc::pid_t,
    status: Option<ExitStatus>,
}

impl Child {
    pub fn id(&self) -> libc::pid_t {
        self.pid
    }

    /// Block until the child exits. Calling it again returns the same status.
    pub fn wait(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }

        let mut raw = 0;
        loop {
            let ret = unsafe { libc::waitpid(self.pid, &mut raw, 0) };
            if ret >= 0 {
                break;
            }
            let source = std::io::Error::last_os_error();
            if source.kind() != std::io::ErrorKind::Interrupted {
                return Err(FenceError::Os {
                    call: "waitpid",
                    source,
                });
            }
        }

        let status = ExitStatus::from_raw(raw);
        self.status = Some(status);
        Ok(status)
    }
}

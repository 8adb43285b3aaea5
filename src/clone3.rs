//! Process duplication: clone3(2) with a fork(2) fallback.

use std::io::Error;

pub enum Duplicated {
    Child,
    Parent(libc::pid_t),
}

/// Duplicate the calling process.
///
/// Issues `clone3` with `SIGCHLD` as the exit signal and no other flags,
/// which is a plain fork. Falls back to `fork` where `clone3` is missing or
/// filtered, and everywhere but Linux.
///
/// # Safety
/// Duplicating a multithreaded program is inherently unsafe: only the
/// calling thread survives in the child, so the child must only call
/// async-signal-safe functions until it execs or exits.
///
/// # Example
///
/// ```no_run
/// use fdfence::clone3::{duplicate, Duplicated};
///
/// match unsafe { duplicate() }.unwrap() {
///     Duplicated::Child => unsafe { libc::_exit(0) },
///     Duplicated::Parent(pid) => {
///         unsafe { libc::waitpid(pid, std::ptr::null_mut(), 0) };
///     }
/// }
/// ```
pub unsafe fn duplicate() -> Result<Duplicated, Error> {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: is the caller's responsibility.
        match unsafe { clone3() } {
            Err(e)
                if matches!(
                    e.raw_os_error(),
                    Some(libc::ENOSYS) | Some(libc::EPERM)
                ) => {}
            result => return result,
        }
    }

    // SAFETY: is the caller's responsibility.
    let pid = unsafe { libc::fork() };
    duplicated(pid as i64)
}

#[cfg(target_os = "linux")]
unsafe fn clone3() -> Result<Duplicated, Error> {
    let clone_args = libc::clone_args {
        flags: 0,
        pidfd: 0,
        child_tid: 0,
        parent_tid: 0,
        exit_signal: libc::SIGCHLD as u64,
        stack: 0,
        stack_size: 0,
        tls: 0,
        set_tid: 0,
        set_tid_size: 0,
        cgroup: 0,
    };

    // SAFETY: is the caller's responsibility.
    let pid = unsafe {
        libc::syscall(
            libc::SYS_clone3,
            &clone_args as *const libc::clone_args,
            size_of::<libc::clone_args>(),
        )
    };

    duplicated(pid as i64)
}

fn duplicated(pid: i64) -> Result<Duplicated, Error> {
    if pid < 0 {
        return Err(Error::last_os_error());
    };

    Ok(match pid {
        0 => Duplicated::Child,
        _ => Duplicated::Parent(pid as libc::pid_t),
    })
}

//! # Process-group isolation.
//!
//! A supervised command runs as the leader of a fresh process group. A monitor process, double
//! forked into the same group, blocks on the read end of a *monitor pipe* whose write end stays
//! with the supervisor. EOF on that pipe (the supervisor closed it, exited or crashed) makes the
//! monitor deliver `SIGHUP` + `SIGCONT` to the whole group, the same pair the kernel sends to an
//! orphaned process group, and then `SIGKILL`.
//!
//! ```text
//! supervisor ──(write end)── monitor pipe ──(read end)──► monitor ── EOF ──► kill(0, HUP/CONT/KILL)
//!      │                                                     ▲
//!      └── spawn ──► child: setpgid(0, 0) ── fork ── fork ───┘
//!                          └── exec(command)
//! ```
//!
//! The routine runs between `fork` and `exec`: only async-signal-safe calls, no allocation.

use std::io;
use std::os::fd::RawFd;

/// Moves the calling process into a new process group and starts the group monitor on
/// `monitor_fd`.
///
/// Every descriptor except `monitor_fd` is closed in the monitor, so it holds no other pipe
/// open. `monitor_fd` is closed in the caller before returning.
///
/// Used as the pre-exec hook of supervised commands and by the `taskloop-launch` binary.
///
/// # Errors
/// `setpgid` or the first `fork` failed.
pub fn isolate_in_process_group(monitor_fd: RawFd) -> io::Result<()> {
    // SAFETY: plain system calls on our own process; the forked children never return.
    unsafe {
        if libc::setpgid(0, 0) < 0 {
            return Err(io::Error::last_os_error());
        }
        let pid = libc::fork();
        if pid < 0 {
            return Err(io::Error::last_os_error());
        }
        if pid == 0 {
            let monitor = libc::fork();
            if monitor < 0 {
                libc::kill(0, libc::SIGKILL);
                libc::_exit(1);
            }
            if monitor == 0 {
                watch_monitor_pipe(monitor_fd);
            }
            libc::_exit(0);
        }

        let mut status = 0;
        while libc::waitpid(pid, &mut status, 0) < 0 {
            if io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
                break;
            }
        }
        libc::close(monitor_fd);
    }
    Ok(())
}

/// Monitor body: wait for EOF on `monitor_fd`, then take the process group down.
///
/// # Safety
/// Must only run in the freshly forked monitor process.
unsafe fn watch_monitor_pipe(monitor_fd: RawFd) -> ! {
    unsafe {
        let max_fd = match libc::sysconf(libc::_SC_OPEN_MAX) {
            n if n > 0 => n.min(65_536) as RawFd,
            _ => 1024,
        };
        for fd in 0..max_fd {
            if fd != monitor_fd {
                libc::close(fd);
            }
        }

        let mut buf = [0u8; 1];
        while libc::read(monitor_fd, buf.as_mut_ptr().cast(), 1) < 0 {
            if io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
                libc::kill(0, libc::SIGKILL);
                libc::_exit(1);
            }
        }

        // Block SIGHUP so SIGCONT still goes out before the default action ends us.
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGHUP);
        libc::sigprocmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
        libc::kill(0, libc::SIGHUP);
        libc::kill(0, libc::SIGCONT);
        libc::sigprocmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut());
        libc::kill(0, libc::SIGKILL);
        libc::_exit(1)
    }
}

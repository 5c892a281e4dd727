//! # Blocking-pipe helper process.
//!
//! Whether the job server pipe is blocking depends on who created it (make 4.2 vs 4.3+), and
//! that flag belongs to the shared open file description, so it cannot be changed without
//! affecting every other client. When reads would block, a forked helper performs them and
//! relays tokens over a private pipe the loop can poll.
//!
//! ```text
//!   loop ── "!" per wanted token ──► request pipe ──► helper ── read(server) ──┐
//!   loop ◄────────────── response pipe ◄──────────── token ◄───────────────────┘
//! ```
//!
//! ## Shutdown
//! 1. The loop returns held tokens and closes the request pipe (EOF = "stop").
//! 2. It sends `SIGUSR1`, interrupting a blocking read in the helper (no `SA_RESTART`).
//! 3. It drains the response pipe until EOF, writing every in-flight token back to the server.
//!    The signal is repeated while the helper has not exited.
//! 4. It reaps the helper.
//!
//! The helper keeps `SIGUSR1` blocked except while it waits (`ppoll`) or reads from the server,
//! so a stop request is either seen on the request pipe or interrupts the wait.
//!
//! The helper runs between `fork` and `_exit` only: raw system calls, no allocation.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::sys;

const RESIGNAL_INTERVAL: Duration = Duration::from_millis(100);

static STOP: AtomicBool = AtomicBool::new(false);

pub(crate) struct Helper {
    pid: libc::pid_t,
    request: Option<OwnedFd>,
    response: OwnedFd,
}

extern "C" fn interrupt(_signal: libc::c_int) {
    STOP.store(true, Ordering::Relaxed);
}

impl Helper {
    /// Forks the helper for the server pipe `(server_read, server_write)`.
    pub(crate) fn spawn(server_read: RawFd, server_write: RawFd) -> io::Result<Helper> {
        let (request_read, request_write) = sys::pipe()?;
        let (response_read, response_write) = sys::pipe()?;
        sys::set_nonblocking(request_read.as_raw_fd(), true)?;
        sys::set_nonblocking(response_read.as_raw_fd(), true)?;

        // SAFETY: the child only performs async-signal-safe calls before `_exit`.
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(io::Error::last_os_error());
        }
        if pid == 0 {
            // SAFETY: we are the freshly forked child; closing our copies of the loop's ends.
            unsafe {
                libc::close(request_write.as_raw_fd());
                libc::close(response_read.as_raw_fd());
                let status = relay(
                    server_read,
                    server_write,
                    request_read.as_raw_fd(),
                    response_write.as_raw_fd(),
                );
                libc::_exit(status);
            }
        }
        drop(request_read);
        drop(response_write);
        tracing::debug!(pid, "started job server helper");
        Ok(Helper { pid, request: Some(request_write), response: response_read })
    }

    /// Descriptor the loop polls for relayed tokens.
    pub(crate) fn response_fd(&self) -> RawFd {
        self.response.as_raw_fd()
    }

    /// Asks the helper for one more token.
    pub(crate) fn request_token(&self) -> io::Result<()> {
        match &self.request {
            Some(fd) => sys::write_all(fd.as_raw_fd(), b"!"),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "job server helper stopped")),
        }
    }

    /// Stops the helper, returning every token still in flight to `server_write`.
    pub(crate) fn shutdown(mut self, server_write: RawFd) {
        drop(self.request.take());
        // SAFETY: signalling our own child.
        unsafe { libc::kill(self.pid, libc::SIGUSR1) };

        let fd = self.response.as_raw_fd();
        loop {
            match sys::read_byte(fd) {
                Ok(Some(token)) => {
                    if let Err(err) = sys::write_all(server_write, &[token]) {
                        tracing::warn!(%err, "failed to return job server token");
                    }
                }
                Ok(None) => break,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    match sys::wait_readable(fd, RESIGNAL_INTERVAL) {
                        Ok(true) => {}
                        // SAFETY: signalling our own, not yet reaped, child.
                        Ok(false) => unsafe {
                            libc::kill(self.pid, libc::SIGUSR1);
                        },
                        Err(_) => break,
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, "failed to drain job server helper");
                    break;
                }
            }
        }

        let mut status = 0;
        // SAFETY: reaping our own child.
        unsafe { libc::waitpid(self.pid, &mut status, 0) };
        tracing::debug!(pid = self.pid, "stopped job server helper");
    }
}

/// Helper main loop. Returns the exit status.
///
/// # Safety
/// Must only run in a forked child; uses raw descriptors it does not own.
unsafe fn relay(server_read: RawFd, server_write: RawFd, request: RawFd, response: RawFd) -> i32 {
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_IGN);

        let mut blocked: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut blocked);
        libc::sigaddset(&mut blocked, libc::SIGUSR1);
        let mut unblocked: libc::sigset_t = std::mem::zeroed();
        libc::sigprocmask(libc::SIG_BLOCK, &blocked, &mut unblocked);
        libc::sigdelset(&mut unblocked, libc::SIGUSR1);

        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = interrupt as extern "C" fn(libc::c_int) as libc::sighandler_t;
        action.sa_flags = 0;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(libc::SIGUSR1, &action, std::ptr::null_mut());

        let mut pending: usize = 0;
        let mut buf = [0u8; 1024];
        loop {
            let n = libc::read(request, buf.as_mut_ptr().cast(), buf.len());
            if n == 0 {
                // The loop closed the request pipe.
                return 0;
            }
            if n > 0 {
                pending += n as usize;
                continue;
            }

            let mut fds = [
                libc::pollfd { fd: request, events: libc::POLLIN, revents: 0 },
                libc::pollfd { fd: server_read, events: libc::POLLIN, revents: 0 },
            ];
            let watched = if pending == 0 { 1 } else { 2 };
            if wait(&mut fds[..watched], &unblocked) <= 0 {
                // EINTR: re-check the request pipe first.
                continue;
            }
            if fds[0].revents != 0 || fds[1].revents == 0 {
                continue;
            }

            // Another client may take the token first, so the read can still block.
            libc::sigprocmask(libc::SIG_SETMASK, &unblocked, std::ptr::null_mut());
            let mut token = 0u8;
            let r = if STOP.load(Ordering::Relaxed) {
                -1
            } else {
                libc::read(server_read, (&mut token as *mut u8).cast(), 1)
            };
            libc::sigprocmask(libc::SIG_BLOCK, &blocked, std::ptr::null_mut());
            if r == 0 {
                // Server gone; the loop sees EOF on the response pipe.
                return 1;
            }
            if r < 0 {
                continue;
            }

            pending -= 1;
            if libc::write(response, (&token as *const u8).cast(), 1) != 1 {
                libc::write(server_write, (&token as *const u8).cast(), 1);
                return 1;
            }
        }
    }
}

/// Polls `fds` with `SIGUSR1` deliverable for the duration of the wait only.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
unsafe fn wait(fds: &mut [libc::pollfd], unblocked: &libc::sigset_t) -> libc::c_int {
    unsafe { libc::ppoll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, std::ptr::null(), unblocked) }
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
unsafe fn wait(fds: &mut [libc::pollfd], unblocked: &libc::sigset_t) -> libc::c_int {
    unsafe {
        let mut previous: libc::sigset_t = std::mem::zeroed();
        libc::sigprocmask(libc::SIG_SETMASK, unblocked, &mut previous);
        let n = if STOP.load(Ordering::Relaxed) {
            -1
        } else {
            libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1)
        };
        libc::sigprocmask(libc::SIG_SETMASK, &previous, std::ptr::null_mut());
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_with(tokens: &[u8]) -> (OwnedFd, OwnedFd) {
        let (read, write) = sys::pipe().unwrap();
        sys::write_all(write.as_raw_fd(), tokens).unwrap();
        (read, write)
    }

    fn drain(fd: RawFd) -> Vec<u8> {
        sys::set_nonblocking(fd, true).unwrap();
        let mut tokens = Vec::new();
        while let Ok(Some(token)) = sys::read_byte(fd) {
            tokens.push(token);
        }
        tokens
    }

    #[test]
    fn test_relays_requested_token() {
        let (read, write) = server_with(b"x");
        let helper = Helper::spawn(read.as_raw_fd(), write.as_raw_fd()).unwrap();

        helper.request_token().unwrap();
        assert!(sys::wait_readable(helper.response_fd(), Duration::from_secs(5)).unwrap());
        assert_eq!(sys::read_byte(helper.response_fd()).unwrap(), Some(b'x'));

        helper.shutdown(write.as_raw_fd());
        assert!(drain(read.as_raw_fd()).is_empty());
    }

    #[test]
    fn test_shutdown_returns_in_flight_token() {
        let (read, write) = server_with(b"y");
        let helper = Helper::spawn(read.as_raw_fd(), write.as_raw_fd()).unwrap();

        helper.request_token().unwrap();
        helper.shutdown(write.as_raw_fd());
        assert_eq!(drain(read.as_raw_fd()), b"y");
    }

    #[test]
    fn test_shutdown_interrupts_helper_waiting_on_empty_server() {
        let (read, write) = server_with(b"");
        let helper = Helper::spawn(read.as_raw_fd(), write.as_raw_fd()).unwrap();

        helper.request_token().unwrap();
        helper.request_token().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        helper.shutdown(write.as_raw_fd());
        assert!(drain(read.as_raw_fd()).is_empty());
    }
}

//! # Own job server.
//!
//! When no job server is inherited and more than one job is allowed, the loop becomes a job
//! server itself: a pipe (or a FIFO in a temporary directory) pre-filled with `job_count - 1`
//! tokens. The implicit extra slot is the local slot every client owns.

use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use tempfile::TempDir;

use crate::jobs::JobServerMode;
use crate::sys;

const TOKEN: u8 = b'*';

enum Channel {
    Pipe { read: OwnedFd, write: OwnedFd },
    Fifo { fd: OwnedFd, _dir: TempDir },
}

pub(crate) struct Server {
    channel: Option<Channel>,
    makeflags: Vec<String>,
}

impl Server {
    pub(crate) fn new(job_count: usize, mode: JobServerMode) -> io::Result<Server> {
        let job_count = job_count.max(1);
        if job_count == 1 {
            return Ok(Server { channel: None, makeflags: Vec::new() });
        }
        let tokens = vec![TOKEN; job_count - 1];
        let (channel, makeflags) = match mode {
            JobServerMode::Fifo => {
                let dir = tempfile::tempdir()?;
                let path = dir.path().join("fifo");
                let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
                // SAFETY: `c_path` is a valid NUL-terminated path.
                if unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) } != 0 {
                    return Err(io::Error::last_os_error());
                }
                let fd: OwnedFd = OpenOptions::new().read(true).write(true).open(&path)?.into();
                sys::write_all(fd.as_raw_fd(), &tokens)?;
                let flags = vec![
                    format!("-j{job_count}"),
                    format!("--jobserver-auth=fifo:{}", path.display()),
                ];
                (Channel::Fifo { fd, _dir: dir }, flags)
            }
            _ => {
                let (read, write) = sys::pipe()?;
                if mode == JobServerMode::NonBlocking {
                    sys::set_nonblocking(read.as_raw_fd(), true)?;
                }
                sys::write_all(write.as_raw_fd(), &tokens)?;
                let (r, w) = (read.as_raw_fd(), write.as_raw_fd());
                let flags = vec![
                    format!("-j{job_count}"),
                    format!("--jobserver-auth={r},{w}"),
                    format!("--jobserver-fds={r},{w}"),
                ];
                (Channel::Pipe { read, write }, flags)
            }
        };
        tracing::debug!(job_count, ?mode, "started job server");
        Ok(Server { channel: Some(channel), makeflags })
    }

    /// `(read, write)` descriptors, `None` for a single-job server without a pipe.
    pub(crate) fn fds(&self) -> Option<(RawFd, RawFd)> {
        self.channel.as_ref().map(|channel| match channel {
            Channel::Pipe { read, write } => (read.as_raw_fd(), write.as_raw_fd()),
            Channel::Fifo { fd, .. } => (fd.as_raw_fd(), fd.as_raw_fd()),
        })
    }

    /// Descriptors a child must inherit to reach this server.
    pub(crate) fn pass_fds(&self) -> Vec<RawFd> {
        match &self.channel {
            Some(Channel::Pipe { read, write }) => vec![read.as_raw_fd(), write.as_raw_fd()],
            _ => Vec::new(),
        }
    }

    /// The `MAKEFLAGS` words advertising this server.
    pub(crate) fn makeflags(&self) -> &[String] {
        &self.makeflags
    }
}

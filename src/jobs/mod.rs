//! Concurrency slots: leases, the make-compatible job server bridge and the priority layer.
//!
//! - [`lease`]: the [`Lease`] handle and the [`Scheduler`] trait;
//! - [`client`]: local slots plus job server tokens ([`Client`]);
//! - [`priority`]: priority-ordered waiting ([`PriorityScheduler`], [`JobPriorities`]);
//! - `environment`, `server`, `helper`: `MAKEFLAGS` parsing, the own server, the blocking-pipe helper.

mod client;
mod environment;
mod helper;
mod lease;
mod priority;
mod server;

pub use client::{Client, SubprocessSetup};
pub use environment::init_job_server_environment;
pub use lease::{Lease, Ready, Scheduler};
pub use priority::{JobPriorities, PriorityScheduler};

/// How the loop provides job slots when no job server is inherited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobServerMode {
    /// Own server on an anonymous pipe (blocking reads, served through a helper process).
    #[default]
    Pipe,
    /// Own server on a named pipe in a temporary directory.
    Fifo,
    /// Own server on an anonymous pipe with non-blocking reads.
    NonBlocking,
    /// No server; slots are counted in-process only and not shared with children.
    Local,
}

impl JobServerMode {
    /// Parses the `YOSYS_JOBSERVER` spelling (`fifo`, `local`, `nonblocking`); anything else is
    /// [`JobServerMode::Pipe`].
    pub fn from_env_value(value: &str) -> Self {
        match value {
            "fifo" => JobServerMode::Fifo,
            "local" => JobServerMode::Local,
            "nonblocking" => JobServerMode::NonBlocking,
            _ => JobServerMode::Pipe,
        }
    }
}

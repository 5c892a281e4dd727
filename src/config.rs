//! # Task loop configuration.
//!
//! Provides [`Config`], the settings [`run_task_loop_with`](crate::run_task_loop_with) applies
//! when it installs a loop.
//!
//! ## Sentinel values
//! - `jobs = 0` → choose automatically (inherited `-jN`, else available parallelism)
//!
//! ## Environment
//! [`Config::from_env`] starts from the defaults and applies:
//! - `YOSYS_JOBSERVER=fifo|local|nonblocking` → [`Config::job_server`]
//! - `YOSYS_JOBSERVER_FORCE_HELPER=<non-empty>` → [`Config::force_helper`]

use crate::jobs::JobServerMode;

/// Configuration of one task loop.
///
/// ## Field semantics
/// - `handle_sigint`: install the interrupt handler (`Interrupted` event, then cancel the root)
/// - `jobs`: fallback job count when no job server is inherited (`0` = automatic)
/// - `job_server`: kind of job server to create when none is inherited
/// - `force_helper`: read tokens through the helper process even from a non-blocking pipe
/// - `inherit_makeflags`: join a job server advertised in `MAKEFLAGS`
///
/// ## Notes
/// All fields are public. Prefer the helper accessors over checking sentinels directly.
#[derive(Clone, Debug)]
pub struct Config {
    /// Handle `SIGINT` inside the loop.
    ///
    /// The first interrupt emits an `Interrupted` event on the root task and cancels it; a
    /// second one terminates the process with status 130.
    pub handle_sigint: bool,

    /// Number of concurrent jobs when no job server is inherited.
    ///
    /// - `0` = automatic
    /// - `n > 0` = exactly `n`
    pub jobs: usize,

    /// Job server to create when none is inherited.
    pub job_server: JobServerMode,

    /// Always use the helper process for token reads.
    pub force_helper: bool,

    /// Honour a job server inherited through `MAKEFLAGS`.
    pub inherit_makeflags: bool,
}

impl Config {
    /// Configuration from the defaults plus the `YOSYS_JOBSERVER*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        if let Ok(mode) = std::env::var("YOSYS_JOBSERVER") {
            config.job_server = JobServerMode::from_env_value(&mode);
        }
        config.force_helper = std::env::var_os("YOSYS_JOBSERVER_FORCE_HELPER").is_some_and(|v| !v.is_empty());
        config
    }

    /// Returns the configured job count as an `Option`.
    ///
    /// - `None` → automatic
    /// - `Some(n)` → `n` jobs
    #[inline]
    pub fn fallback_job_count(&self) -> Option<usize> {
        if self.jobs == 0 { None } else { Some(self.jobs) }
    }
}

impl Default for Config {
    /// Default configuration:
    ///
    /// - `handle_sigint = true`
    /// - `jobs = 0` (automatic)
    /// - `job_server = JobServerMode::Pipe`
    /// - `force_helper = false`
    /// - `inherit_makeflags = true`
    fn default() -> Self {
        Self {
            handle_sigint: true,
            jobs: 0,
            job_server: JobServerMode::Pipe,
            force_helper: false,
            inherit_makeflags: true,
        }
    }
}

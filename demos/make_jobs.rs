//! # Job-limited processes
//!
//! Demonstrates the lease scheduler together with supervised processes:
//! - Processes hold a job lease while they run (`-j` limit, shared with a parent `make`)
//! - Higher `JobPriorities::PRIORITY` waits are served first
//! - Output lines are forwarded to the log
//!
//! Run directly (`cargo run --example make_jobs`) or from a Makefile rule prefixed with `+` so
//! that the job server of `make -j4` is inherited.

use taskloop::{
    Config, JobPriorities, LogDestination, Process, TaskError, init_job_server_environment, log,
    run_task_loop_with, start_logging,
};

fn main() -> Result<(), TaskError> {
    init_job_server_environment();

    let config = Config { jobs: 2, ..Config::from_env() };
    run_task_loop_with(config, || async {
        start_logging(LogDestination::stderr(), None)?;

        let mut processes = Vec::new();
        for i in 0..6 {
            let sleeper = Process::builder(["sh", "-c", "sleep 0.2; echo \"job $JOB done\""])
                .name(format!("job{i}"))
                .env("JOB", i.to_string())
                .build()?;
            // The last job jumps the queue.
            let priority = if i == 5 { 10 } else { 0 };
            JobPriorities::PRIORITY.set_in(sleeper.task(), vec![priority]);
            sleeper.log_output();
            processes.push(sleeper);
        }

        for process in &processes {
            process.finished().await?;
            log(format!("{} exited with {:?}", process.path(), process.returncode()));
        }
        Ok(())
    })
}

//! `taskloop-launch <monitor-fd> <executable> [argv0 [args...]]`
//!
//! Runs `executable` as the leader of a new process group that is torn down once the monitor
//! pipe `<monitor-fd>` reports EOF. If the executable cannot be started the whole group is
//! killed, so the parent never mistakes the failure for a normal exit status.

use std::ffi::OsString;
use std::os::fd::RawFd;
use std::os::unix::process::CommandExt;
use std::process::{Command, ExitCode};

fn kill_group() {
    // SAFETY: signalling our own process group.
    unsafe { libc::kill(0, libc::SIGKILL) };
}

fn main() -> ExitCode {
    let args: Vec<OsString> = std::env::args_os().collect();
    if args.len() < 3 {
        eprintln!("usage: taskloop-launch <monitor-fd> <executable> [argv0 [args...]]");
        return ExitCode::from(1);
    }
    let Some(monitor_fd) = args[1].to_str().and_then(|s| s.parse::<RawFd>().ok()) else {
        eprintln!("taskloop-launch: invalid monitor descriptor {:?}", args[1]);
        return ExitCode::from(1);
    };

    if let Err(err) = taskloop::isolate_in_process_group(monitor_fd) {
        eprintln!("taskloop-launch: unexpected error setting up the process group: {err}");
        // SAFETY: signalling ourselves.
        unsafe { libc::kill(libc::getpid(), libc::SIGKILL) };
        return ExitCode::from(1);
    }

    let mut command = Command::new(&args[2]);
    if let Some(argv0) = args.get(3) {
        command.arg0(argv0).args(&args[4..]);
    }
    let err = command.exec();
    eprintln!("taskloop-launch: unexpected error in exec: {err}");
    kill_group();
    ExitCode::from(1)
}

//! # Supervised subprocesses.
//!
//! A [`Process`] is a task that runs one command. It holds a job lease while the command runs,
//! forwards its output as [`EventType::Stdout`]/[`EventType::Stderr`] events (one line each,
//! newline included) and emits [`EventType::Exit`] with the return code.
//!
//! ## Lifecycle
//! ```text
//! Process::new(cmd) ── snapshot cwd ──► pending ── lease ──► spawn (isolated process group)
//!                                                               ├─ stdout lines ──► Stdout events
//!                                                               ├─ stderr lines ──► Stderr events
//!                                                               └─ wait ──► Exit event ──► on_exit
//! ```
//!
//! ## Rules
//! - The command runs under the environment of [`ProcessContext::ENV`] plus the job-server
//!   `MAKEFLAGS`, in [`ProcessContext::CWD`] as seen when the process task was created.
//! - A non-zero return code fails the task with [`TaskError::NonZeroExit`] unless an `on_exit`
//!   handler says otherwise.
//! - Input written before the command starts is buffered (interactive processes only).
//! - Cancelling closes the monitor pipe, which takes down the whole process group; without a
//!   monitor pipe the command gets `SIGTERM`. Neither blocks.

pub(crate) mod command;
mod launcher;

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::ops::Deref;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::rc::Rc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::ChildStdin;
use tokio::sync::mpsc;

use crate::context::{ContextMap, ContextVar};
use crate::core::{BackgroundOpts, SyncHandlerRegistration, Task, job_client};
use crate::error::TaskError;
use crate::events::{Event, EventType};
use crate::logging::log;
use crate::sys;
use crate::tasks::{TaskBuilder, TaskHandler};

pub use launcher::isolate_in_process_group;

/// Context variables for [`Process`] tasks.
pub struct ProcessContext;

impl ProcessContext {
    /// Working directory for new processes. Defaults to the current directory of the program.
    pub const CWD: ContextVar<PathBuf> = ContextVar::with_default("ProcessContext", "cwd", current_dir);
    /// Environment for new processes. Defaults to the environment of the program.
    pub const ENV: ContextMap<String, String> = ContextMap::with_default("ProcessContext", "env", environment);
}

fn current_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

fn environment() -> HashMap<String, String> {
    std::env::vars().collect()
}

type ExitHandler = Rc<dyn Fn(i32) -> Result<(), TaskError>>;

#[derive(Default)]
struct ProcessState {
    stdin: Option<mpsc::UnboundedSender<Vec<u8>>>,
    pending_stdin: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    monitor: Option<OwnedFd>,
    pid: Option<u32>,
    returncode: Option<i32>,
}

struct ProcessHandler {
    command: Vec<String>,
    interact: bool,
    on_exit: Option<ExitHandler>,
    state: RefCell<ProcessState>,
}

impl ProcessHandler {
    fn shell_command(&self, task: &Task) -> String {
        let line = command::join(&self.command);
        let cwd = ProcessContext::CWD.get_in(task).ok();
        match cwd {
            Some(cwd) if std::env::current_dir().ok().as_ref() != Some(&cwd) => {
                format!("(cd {} && {line})", command::quote(&cwd.to_string_lossy()))
            }
            _ => line,
        }
    }

    fn check_exit(&self, task: &Task, returncode: i32) -> Result<(), TaskError> {
        match &self.on_exit {
            Some(on_exit) => on_exit(returncode),
            None if returncode != 0 => {
                Err(TaskError::NonZeroExit { command: self.shell_command(task), returncode })
            }
            None => Ok(()),
        }
    }

    fn terminate(&self) {
        let mut state = self.state.borrow_mut();
        if state.monitor.take().is_some() {
            return;
        }
        if let Some(pid) = state.pid.take() {
            // SAFETY: signalling the child we spawned.
            unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        }
    }
}

#[async_trait(?Send)]
impl TaskHandler for ProcessHandler {
    async fn on_run(&self, task: &Task) -> Result<(), TaskError> {
        let client = job_client()?;
        let setup = client.subprocess_args(ProcessContext::ENV.view_from(task).to_map());
        let cwd = ProcessContext::CWD.get_in(task)?;

        log(format!("starting process {}", self.shell_command(task)));

        let program = &self.command[0];
        let search_path = setup.env.get("PATH").map_or("", String::as_str);
        let executable = command::resolve_executable(program, search_path, &cwd).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("No such file or directory: {program:?}"))
        })?;

        let (monitor_read, monitor_write) = sys::pipe()?;
        let monitor_fd = monitor_read.as_raw_fd();
        let pass_fds = setup.pass_fds.clone();

        let mut cmd = tokio::process::Command::new(&executable);
        cmd.arg0(program)
            .args(&self.command[1..])
            .current_dir(&cwd)
            .env_clear()
            .envs(&setup.env)
            .stdin(if self.interact { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // SAFETY: the hook only makes async-signal-safe system calls.
        unsafe {
            cmd.pre_exec(move || {
                for &fd in &pass_fds {
                    sys::set_cloexec(fd, false)?;
                }
                isolate_in_process_group(monitor_fd)
            });
        }

        let mut child = cmd.spawn()?;
        drop(monitor_read);
        let pending_stdin = {
            let mut state = self.state.borrow_mut();
            state.monitor = Some(monitor_write);
            state.pid = child.id();
            state.pending_stdin.take()
        };

        if let (Some(stdin), Some(input)) = (child.stdin.take(), pending_stdin) {
            task.background(write_stdin(stdin, input), BackgroundOpts::default())?;
        }
        let wait = BackgroundOpts { wait: true, ..BackgroundOpts::default() };
        let stdout = match child.stdout.take() {
            Some(out) => Some(task.background(forward_lines(out, |line| Event::stdout(line)), wait)?),
            None => None,
        };
        let stderr = match child.stderr.take() {
            Some(err) => Some(task.background(forward_lines(err, |line| Event::stderr(line)), wait)?),
            None => None,
        };

        let status = child.wait().await?;
        let returncode = status.code().unwrap_or_else(|| -status.signal().unwrap_or(0));
        {
            let mut state = self.state.borrow_mut();
            state.monitor = None;
            state.pid = None;
            state.returncode = Some(returncode);
        }

        for reader in [stdout, stderr].into_iter().flatten() {
            let _ = reader.await;
        }
        Event::exit(returncode).emit()?;

        let result = self.check_exit(task, returncode);
        log(format!("finished (returncode={returncode})"));
        result
    }

    fn on_cancel(&self, _task: &Task) {
        self.terminate();
    }

    fn on_cleanup(&self, _task: &Task) {
        self.terminate();
    }
}

async fn forward_lines<R>(reader: R, make: fn(String) -> Event) -> Result<(), TaskError>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Ok(());
        }
        make(String::from_utf8_lossy(&line).into_owned()).emit()?;
    }
}

async fn write_stdin(mut stdin: ChildStdin, mut input: mpsc::UnboundedReceiver<Vec<u8>>) -> Result<(), TaskError> {
    while let Some(data) = input.recv().await {
        match stdin.write_all(&data).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => return Ok(()),
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Builder for [`Process`] tasks.
pub struct ProcessBuilder {
    command: Vec<String>,
    name: Option<String>,
    cwd: Option<PathBuf>,
    env: HashMap<String, String>,
    interact: bool,
    on_exit: Option<ExitHandler>,
}

impl ProcessBuilder {
    /// Task name, default: the program name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Working directory instead of [`ProcessContext::CWD`].
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Sets one environment variable on top of [`ProcessContext::ENV`].
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Pipe stdin so [`Process::write`] can feed the command.
    pub fn interact(mut self, interact: bool) -> Self {
        self.interact = interact;
        self
    }

    /// Replaces the return code check; the default fails on any non-zero code.
    pub fn on_exit(mut self, on_exit: impl Fn(i32) -> Result<(), TaskError> + 'static) -> Self {
        self.on_exit = Some(Rc::new(on_exit));
        self
    }

    /// Creates the process task as a child of the current task.
    ///
    /// # Errors
    /// An empty command, or the errors of [`TaskBuilder::build`].
    pub fn build(self) -> Result<Process, TaskError> {
        let Some(program) = self.command.first() else {
            return Err(TaskError::msg("cannot run an empty command"));
        };
        let name = self.name.unwrap_or_else(|| program.clone());
        let (stdin, pending_stdin) = if self.interact {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let handler = Rc::new(ProcessHandler {
            command: self.command,
            interact: self.interact,
            on_exit: self.on_exit,
            state: RefCell::new(ProcessState { stdin, pending_stdin, ..ProcessState::default() }),
        });
        let task = TaskBuilder::new().with_name(name).with_lease(true).build_shared(handler.clone())?;

        let cwd = match self.cwd {
            Some(cwd) => cwd,
            None => ProcessContext::CWD.get_in(&task)?,
        };
        ProcessContext::CWD.set_in(&task, cwd);
        let env = ProcessContext::ENV.view_from(&task);
        for (key, value) in self.env {
            env.insert(key, value);
        }
        Ok(Process { task, handler })
    }
}

/// Task running and supervising one command.
///
/// Dereferences to its [`Task`].
#[derive(Clone)]
pub struct Process {
    task: Task,
    handler: Rc<ProcessHandler>,
}

impl Process {
    /// Runs `command` (program and arguments) with the defaults.
    ///
    /// # Example
    /// ```no_run
    /// use taskloop::{Process, run_task_loop};
    ///
    /// run_task_loop(|| async {
    ///     let ls = Process::new(["ls", "-l"])?;
    ///     ls.log_output();
    ///     ls.finished().await
    /// })
    /// .unwrap();
    /// ```
    pub fn new<I, S>(command: I) -> Result<Process, TaskError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::builder(command).build()
    }

    pub fn builder<I, S>(command: I) -> ProcessBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ProcessBuilder {
            command: command.into_iter().map(Into::into).collect(),
            name: None,
            cwd: None,
            env: HashMap::new(),
            interact: false,
            on_exit: None,
        }
    }

    /// The underlying task.
    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn command(&self) -> &[String] {
        &self.handler.command
    }

    /// The command as a line that can be pasted into a shell, including a `cd` when the
    /// working directory differs from the program's.
    pub fn shell_command(&self) -> String {
        self.handler.shell_command(&self.task)
    }

    /// Return code once the command exited; negative for termination by a signal.
    pub fn returncode(&self) -> Option<i32> {
        self.handler.state.borrow().returncode
    }

    /// Sends `data` to the command's stdin, buffering it until the command starts.
    ///
    /// # Errors
    /// The process is not interactive, or stdin was closed.
    pub fn write(&self, data: impl Into<Vec<u8>>) -> Result<(), TaskError> {
        if !self.handler.interact {
            return Err(TaskError::msg("stdin is only available for interactive processes"));
        }
        let state = self.handler.state.borrow();
        let sender = state.stdin.as_ref().ok_or_else(|| TaskError::msg("stdin was closed"))?;
        sender.send(data.into()).map_err(|_| TaskError::msg("stdin was closed"))
    }

    /// Closes stdin once everything written so far was delivered.
    pub fn close_stdin(&self) {
        self.handler.state.borrow_mut().stdin = None;
    }

    /// Logs every output line of the command (without its trailing newline).
    pub fn log_output(&self) -> SyncHandlerRegistration {
        self.task.sync_handle_events(EventType::Output, |event| {
            log(event.message_str().trim_end_matches('\n'));
            Ok(())
        })
    }
}

impl Deref for Process {
    type Target = Task;

    fn deref(&self) -> &Task {
        &self.task
    }
}

//! Log destinations and the handlers that write to them.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::io::{self, Write};
use std::rc::Rc;

use crate::core::{Task, current_task, root_task};
use crate::error::RuntimeError;
use crate::events::{Event, EventType};
use crate::logging::format::{debug_event_line, default_log_format, interrupted_line};
use crate::logging::{LogContext, LogLevel};

thread_local! {
    static ROOT_DESTINATIONS: RefCell<Vec<LogDestination>> = const { RefCell::new(Vec::new()) };
}

fn no_color() -> bool {
    std::env::var_os("NO_COLOR").is_some_and(|v| !v.is_empty())
}

struct Sink {
    writer: RefCell<Box<dyn Write>>,
    color: bool,
    failed: Cell<bool>,
}

/// Where formatted log lines go.
///
/// Cheap to clone; clones write to the same sink. After the first failed write the destination
/// stays silent.
#[derive(Clone)]
pub struct LogDestination {
    sink: Rc<Sink>,
}

impl LogDestination {
    fn new(writer: Box<dyn Write>, color: bool) -> Self {
        Self { sink: Rc::new(Sink { writer: RefCell::new(writer), color: color && !no_color(), failed: Cell::new(false) }) }
    }

    /// Standard output, coloured when it is a terminal.
    pub fn stdout() -> Self {
        let color = console::Term::stdout().features().colors_supported();
        Self::new(Box::new(io::stdout()), color)
    }

    /// Standard error, coloured when it is a terminal.
    pub fn stderr() -> Self {
        let color = console::Term::stderr().features().colors_supported();
        Self::new(Box::new(io::stderr()), color)
    }

    /// Any writer, without colour.
    pub fn writer(writer: impl Write + 'static) -> Self {
        Self::new(Box::new(writer), false)
    }

    /// Forces colour on or off. `NO_COLOR` still disables it.
    pub fn with_color(self, color: bool) -> Self {
        let writer = match Rc::try_unwrap(self.sink) {
            Ok(sink) => sink.writer.into_inner(),
            Err(shared) => return LogDestination { sink: shared },
        };
        Self::new(writer, color)
    }

    pub(crate) fn write_line(&self, line: &str) {
        if self.sink.failed.get() {
            return;
        }
        let line = if self.sink.color { line.to_string() } else { console::strip_ansi_codes(line).to_string() };
        let mut writer = self.sink.writer.borrow_mut();
        let result = writeln!(writer, "{line}").and_then(|()| writer.flush());
        if let Err(err) = result {
            tracing::warn!(%err, "log destination failed, disabling it");
            self.sink.failed.set(true);
        }
    }
}

impl fmt::Debug for LogDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogDestination").field("color", &self.sink.color).finish()
    }
}

/// Writes `event` to the destinations registered at root level (log calls outside any task).
pub(crate) fn write_to_root_destinations(event: &Event) {
    let destinations = ROOT_DESTINATIONS.with(|d| d.borrow().clone());
    if destinations.is_empty() {
        return;
    }
    let format = LogContext::LOG_FORMAT.get().unwrap_or_else(|_| Rc::new(default_log_format));
    let formatted = format(event);
    for destination in destinations {
        destination.write_line(&formatted);
    }
}

pub(crate) fn clear_root_destinations() {
    ROOT_DESTINATIONS.with(|d| d.borrow_mut().clear());
}

/// Writes every log event reaching the current task to `destination`.
///
/// Events below the minimum level are skipped: `LogContext::DEST_LEVELS[label]` if `label` is
/// given and present, otherwise `LogContext::LEVEL`, both read from the event's source task. The
/// formatter (`LogContext::LOG_FORMAT`) is read from the current task. An interrupt prints
/// `<Interrupted>`.
///
/// May be called several times to log to several destinations.
///
/// # Errors
/// [`RuntimeError::NoCurrentTask`] outside of any task.
pub fn start_logging(destination: LogDestination, label: Option<&str>) -> Result<(), RuntimeError> {
    let task = current_task()?;
    let label = label.map(str::to_string);

    let log_dest = destination.clone();
    task.sync_handle_events(EventType::Log, move |event| {
        let level = event.level.unwrap_or_default();
        if level < minimum_level(event, label.as_deref()) {
            return Ok(());
        }
        let format = LogContext::LOG_FORMAT.get()?;
        log_dest.write_line(&format(event));
        Ok(())
    });

    let interrupt_dest = destination.clone();
    task.sync_handle_events(EventType::Interrupted, move |_| {
        interrupt_dest.write_line(&interrupted_line());
        Ok(())
    });

    ROOT_DESTINATIONS.with(|d| d.borrow_mut().push(destination));
    Ok(())
}

fn minimum_level(event: &Event, label: Option<&str>) -> LogLevel {
    let source = event.source().ok();
    let configured = |task: Option<&Task>| {
        let level = match task {
            Some(task) => LogContext::LEVEL.get_in(task),
            None => LogContext::LEVEL.get(),
        };
        level.unwrap_or_default()
    };
    let Some(label) = label else {
        return configured(source);
    };
    let view = match source {
        Some(task) => LogContext::DEST_LEVELS.view_from(task),
        None => LogContext::DEST_LEVELS.view(),
    };
    view.get(&label.to_string()).unwrap_or_else(|| configured(source))
}

/// Writes every event reaching the current task to `destination` in its debug rendering.
///
/// Log events are skipped unless `include_log` is set.
///
/// # Errors
/// [`RuntimeError::NoCurrentTask`] outside of any task.
pub fn start_debug_event_logging(destination: LogDestination, include_log: bool) -> Result<(), RuntimeError> {
    current_task()?.sync_handle_events(EventType::Any, move |event| {
        if include_log || event.kind != EventType::Log {
            destination.write_line(&debug_event_line(event));
        }
        Ok(())
    });
    Ok(())
}

/// Installs a fallback error handler on the root task that logs an abort and re-raises it as
/// [`TaskError::Logged`](crate::TaskError::Logged), ending the task loop.
///
/// # Errors
/// [`RuntimeError::NoCurrentTask`] outside of any task, [`RuntimeError::InvalidState`] when the
/// current task is not the root task.
pub fn install_root_error_handler() -> Result<(), RuntimeError> {
    let task = current_task()?;
    if task != root_task()? {
        return Err(RuntimeError::InvalidState {
            task: task.path(),
            state: task.state(),
            action: "install the root error handler on",
        });
    }
    task.set_error_handler(None, |err| Err(crate::logging::log_exception(&err)));
    Ok(())
}

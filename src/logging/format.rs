//! Default log line and timestamp formatting.

use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

use console::{Style, style};

use crate::core::Task;
use crate::events::Event;
use crate::logging::{LogContext, LogLevel};

/// Formats `event` as `APP_NAME HH:MM:SS [WORK_DIR] SCOPE: LEVEL: message`, one output line per
/// message line.
///
/// The prefix values are read from the event's source task. Styling is always emitted; a
/// destination without colour strips it again.
pub fn default_log_format(event: &Event) -> String {
    let source = event.source().ok();
    let app_name = read(source, |t| LogContext::APP_NAME.get_in(t), || LogContext::APP_NAME.get());
    let work_dir = read(source, |t| LogContext::WORK_DIR.get_in(t), || LogContext::WORK_DIR.get());
    let scope = read(source, |t| LogContext::SCOPE.get_in(t), || LogContext::SCOPE.get());
    let time_format = LogContext::TIME_FORMAT.get().unwrap_or_else(|_| default_time_format_fn());

    let mut prefix = String::new();
    if let Some(app_name) = app_name {
        let _ = write!(prefix, "{} ", styled(Style::new().blue(), &app_name));
    }
    let time = time_format(event.at);
    if !time.is_empty() {
        let _ = write!(prefix, "{} ", styled(Style::new().green(), &time));
    }
    if let Some(work_dir) = work_dir {
        let _ = write!(prefix, "[{}] ", styled(Style::new().blue(), &work_dir));
    }
    if let Some(scope) = scope {
        let _ = write!(prefix, "{}: ", styled(Style::new().magenta(), &scope));
    }

    let level = event.level.unwrap_or_default();
    event
        .message_str()
        .lines()
        .map(|line| match level {
            LogLevel::Debug => format!("{prefix}{}", styled(Style::new().cyan(), &format!("DEBUG: {line}"))),
            LogLevel::Warning => format!("{prefix}{}", styled(Style::new().yellow(), &format!("WARNING: {line}"))),
            LogLevel::Error => format!("{prefix}{}", styled(Style::new().red(), &format!("ERROR: {line}"))),
            LogLevel::Info => format!("{prefix}{line}"),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn read<T: Default>(
    source: Option<&Task>,
    in_task: impl FnOnce(&Task) -> Result<T, crate::RuntimeError>,
    ambient: impl FnOnce() -> Result<T, crate::RuntimeError>,
) -> T {
    match source {
        Some(task) => in_task(task),
        None => ambient(),
    }
    .unwrap_or_default()
}

pub(crate) fn styled(style: Style, text: &str) -> String {
    style.force_styling(true).apply_to(text).to_string()
}

pub(crate) fn interrupted_line() -> String {
    style("<Interrupted>").yellow().force_styling(true).to_string()
}

pub(crate) fn debug_event_line(event: &Event) -> String {
    styled(Style::new().cyan(), &event.to_string())
}

pub(crate) fn default_time_format_fn() -> crate::logging::TimeFormatter {
    std::rc::Rc::new(default_time_format)
}

/// Local wall-clock time as `HH:MM:SS`.
pub fn default_time_format(at: SystemTime) -> String {
    let secs = match at.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs() as libc::time_t,
        Err(_) => 0,
    };
    // SAFETY: `localtime_r` only writes into the provided `tm`.
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    let converted = unsafe { !libc::localtime_r(&secs, &mut tm).is_null() };
    if !converted {
        let of_day = secs.rem_euclid(86_400);
        return format!("{:02}:{:02}:{:02}", of_day / 3600, of_day / 60 % 60, of_day % 60);
    }
    format!("{:02}:{:02}:{:02}", tm.tm_hour, tm.tm_min, tm.tm_sec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_time_format_shape() {
        let formatted = default_time_format(UNIX_EPOCH + Duration::from_secs(3 * 3600 + 25 * 60 + 7));
        assert_eq!(formatted.len(), 8);
        assert_eq!(&formatted[2..3], ":");
        assert!(formatted.ends_with(":07"));
    }

    #[test]
    fn test_levels_prefix_each_line() {
        let event = Event::log(LogLevel::Warning, "first\nsecond");
        let plain = console::strip_ansi_codes(&default_log_format(&event)).to_string();
        let lines: Vec<&str> = plain.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("WARNING: first"));
        assert!(lines[1].ends_with("WARNING: second"));
    }

    #[test]
    fn test_info_has_no_level_prefix() {
        let event = Event::log(LogLevel::Info, "hello");
        let plain = console::strip_ansi_codes(&default_log_format(&event)).to_string();
        assert!(plain.ends_with(" hello"));
        assert!(!plain.contains("INFO"));
    }
}

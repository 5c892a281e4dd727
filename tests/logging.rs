mod common;

use std::cell::RefCell;
use std::rc::Rc;

use taskloop::{
    Event, LogContext, LogDestination, LogLevel, RuntimeError, Task, TaskError, TimeFormatter,
    install_root_error_handler, log, log_debug, log_exception, log_warning, run_task_loop_with, start_debug_event_logging,
    start_logging,
};

use common::{Buffer, config, serial};

fn errors(buffer: &Buffer) -> Vec<String> {
    buffer.lines().into_iter().filter(|l| l.starts_with("ERROR:")).collect()
}

fn fixed_time() -> TimeFormatter {
    Rc::new(|_| "12:00:00".to_string())
}

#[test]
fn test_prefixes_and_levels() {
    let _guard = serial();
    let buffer = Buffer::default();

    let sink = buffer.clone();
    let result = run_task_loop_with(config(1), move || async move {
        LogContext::TIME_FORMAT.set(fixed_time());
        LogContext::APP_NAME.set(Some("app".to_string()));
        start_logging(LogDestination::writer(sink), None)?;

        log("hello");
        log_warning("careful\nvery careful");
        log_debug("hidden");

        let build = Task::builder().with_name("build").build_fn(|_| async {
            log("compiling");
            Ok(())
        })?;
        LogContext::SCOPE.set_in(&build, Some("build".to_string()));
        LogContext::WORK_DIR.set_in(&build, Some("out".to_string()));
        build.finished().await
    });

    assert!(result.is_ok(), "{result:?}");
    assert_eq!(
        buffer.lines(),
        [
            "app 12:00:00 hello",
            "app 12:00:00 WARNING: careful",
            "app 12:00:00 WARNING: very careful",
            "app 12:00:00 [out] build: compiling",
        ]
    );
}

#[test]
fn test_quiet_and_task_levels() {
    let _guard = serial();
    let buffer = Buffer::default();

    let sink = buffer.clone();
    let result = run_task_loop_with(config(1), move || async move {
        LogContext::TIME_FORMAT.set(Rc::new(|_| String::new()));
        start_logging(LogDestination::writer(sink), None)?;

        let verbose = Task::builder().with_name("verbose").build_fn(|_| async {
            log_debug("details");
            Ok(())
        })?;
        LogContext::LEVEL.set_in(&verbose, LogLevel::Debug);

        let quiet = Task::builder().with_name("quiet").build_fn(|_| async {
            log("chatter");
            log_warning("still shown");
            Ok(())
        })?;
        LogContext::QUIET.set_in(&quiet, true);

        verbose.finished().await?;
        quiet.finished().await
    });

    assert!(result.is_ok(), "{result:?}");
    assert_eq!(buffer.lines(), ["DEBUG: details", "WARNING: still shown"]);
}

#[test]
fn test_destination_levels() {
    let _guard = serial();
    let everything = Buffer::default();
    let warnings = Buffer::default();

    let (all_sink, warn_sink) = (everything.clone(), warnings.clone());
    let result = run_task_loop_with(config(1), move || async move {
        LogContext::TIME_FORMAT.set(Rc::new(|_| String::new()));
        LogContext::DEST_LEVELS.insert("file".to_string(), LogLevel::Warning);
        start_logging(LogDestination::writer(all_sink), None)?;
        start_logging(LogDestination::writer(warn_sink), Some("file"))?;

        log("info");
        log_warning("warn");
        Ok(())
    });

    assert!(result.is_ok(), "{result:?}");
    assert_eq!(everything.lines(), ["info", "WARNING: warn"]);
    assert_eq!(warnings.lines(), ["WARNING: warn"]);
}

#[test]
fn test_custom_log_format() {
    let _guard = serial();
    let buffer = Buffer::default();

    let sink = buffer.clone();
    let result = run_task_loop_with(config(1), move || async move {
        LogContext::LOG_FORMAT.set(Rc::new(|event: &Event| {
            format!("[{}] {}", event.level.unwrap_or_default(), event.message_str())
        }));
        start_logging(LogDestination::writer(sink), None)?;
        log("formatted");
        Ok(())
    });

    assert!(result.is_ok(), "{result:?}");
    assert_eq!(buffer.lines(), ["[info] formatted"]);
}

#[test]
fn test_root_error_handler_logs_once() {
    let _guard = serial();
    let buffer = Buffer::default();

    let sink = buffer.clone();
    let result = run_task_loop_with(config(1), move || async move {
        LogContext::TIME_FORMAT.set(Rc::new(|_| String::new()));
        start_logging(LogDestination::writer(sink), None)?;
        install_root_error_handler()?;

        let broken = Task::builder().with_name("broken").build_fn(|_| async { Err(TaskError::msg("boom")) })?;
        let dependent = Task::builder().with_name("dependent").build_fn(|_| async { Ok(()) })?;
        dependent.depends_on(&broken)?;
        Ok(())
    });

    let Err(TaskError::Failed { cause, .. }) = result else {
        panic!("expected a failed root, got {result:?}");
    };
    assert!(matches!(&*cause, TaskError::Logged { message, .. } if &**message == "boom"), "{cause:?}");
    assert_eq!(errors(&buffer), ["ERROR: boom"]);
}

#[test]
fn test_logged_errors_are_forgotten_between_loops() {
    let _guard = serial();
    let first = Buffer::default();
    let second = Buffer::default();
    let failure: Rc<RefCell<Option<TaskError>>> = Rc::default();

    let (sink, slot) = (first.clone(), failure.clone());
    let result = run_task_loop_with(config(1), move || async move {
        LogContext::TIME_FORMAT.set(Rc::new(|_| String::new()));
        start_logging(LogDestination::writer(sink), None)?;
        let broken = Task::builder().with_name("broken").build_fn(|_| async { Err(TaskError::msg("boom")) })?;
        broken.handle_error(|_| Ok(()))?;
        let err = broken.finished().await.err().ok_or_else(|| TaskError::msg("broken succeeded"))?;
        log_exception(&err);
        log_exception(&err);
        *slot.borrow_mut() = Some(err);
        Ok(())
    });
    assert!(result.is_ok(), "{result:?}");
    assert_eq!(errors(&first), ["ERROR: boom"]);

    let (sink, slot) = (second.clone(), failure.clone());
    let result = run_task_loop_with(config(1), move || async move {
        LogContext::TIME_FORMAT.set(Rc::new(|_| String::new()));
        start_logging(LogDestination::writer(sink), None)?;
        if let Some(err) = slot.borrow().as_ref() {
            log_exception(err);
        }
        Ok(())
    });
    assert!(result.is_ok(), "{result:?}");
    assert_eq!(errors(&second), ["ERROR: boom"]);
}

#[test]
fn test_root_error_handler_only_on_root() {
    let _guard = serial();

    let result = run_task_loop_with(config(1), || async {
        let child = Task::from_fn(|_| async { Ok(()) })?;
        match child.as_current_task(install_root_error_handler) {
            Err(RuntimeError::InvalidState { .. }) => Ok(()),
            other => Err(TaskError::msg(format!("unexpected {other:?}"))),
        }
    });

    assert!(result.is_ok(), "{result:?}");
}

#[test]
fn test_interrupt_and_debug_events() {
    let _guard = serial();
    let buffer = Buffer::default();
    let debug = Buffer::default();

    let (sink, debug_sink) = (buffer.clone(), debug.clone());
    let result = run_task_loop_with(config(1), move || async move {
        start_logging(LogDestination::writer(sink), None)?;
        start_debug_event_logging(LogDestination::writer(debug_sink), false)?;
        Event::interrupted().emit()?;

        let step = Task::builder().with_name("step").build_fn(|_| async { Ok(()) })?;
        step.finished().await
    });

    assert!(result.is_ok(), "{result:?}");
    assert_eq!(buffer.lines(), ["<Interrupted>"]);
    let debug = debug.lines();
    assert!(debug.contains(&"step: none -> preparing".to_string()), "{debug:?}");
    assert!(debug.contains(&"step: running -> waiting".to_string()), "{debug:?}");
}

#[test]
fn test_log_outside_tasks_uses_root_destinations() {
    let _guard = serial();
    let buffer = Buffer::default();

    let sink = buffer.clone();
    let result = run_task_loop_with(config(1), move || async move {
        start_logging(LogDestination::writer(sink), None)?;
        Ok(())
    });
    assert!(result.is_ok(), "{result:?}");

    let event = log("after the loop");
    assert!(event.source().is_err());
    let lines = buffer.lines();
    assert!(lines.last().is_some_and(|l| l.ends_with("after the loop")), "{lines:?}");
}

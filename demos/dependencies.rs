//! # Dependency graph
//!
//! Demonstrates the task tree:
//! - Dependencies between sibling tasks
//! - A failing dependency handled by an error handler
//! - Event streams and logging
//!
//! Run with: `cargo run --example dependencies`

use std::time::Duration;

use taskloop::{
    EventType, LogContext, LogDestination, Task, TaskError, TaskGroup, log, log_warning, run_task_loop,
    start_logging,
};

fn step(name: &'static str, millis: u64) -> Result<Task, TaskError> {
    let task = Task::builder().with_name(name).build_fn(move |_| async move {
        log(format!("working for {millis}ms"));
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok(())
    })?;
    Ok(task)
}

fn main() -> Result<(), TaskError> {
    run_task_loop(|| async {
        LogContext::APP_NAME.set(Some("deps".to_string()));
        start_logging(LogDestination::stdout(), None)?;

        let fetch = step("fetch", 200)?;
        let configure = step("configure", 100)?;
        configure.depends_on(&fetch)?;

        let flaky = Task::builder()
            .with_name("flaky")
            .build_fn(|_| async { Err(TaskError::msg("network unreachable")) })?;

        let build = step("build", 300)?;
        build.depends_on(&configure)?;
        build.depends_on(&flaky)?;
        build.set_error_handler(Some(&flaky), |err| {
            log_warning(format!("ignoring: {err}"));
            Ok(())
        });
        // The root sees the failed child too.
        flaky.handle_error(|_| Ok(()))?;

        // A group collects the test tasks; it finishes once all of them finished.
        let tests = Task::builder().with_name("tests").build(TaskGroup)?;
        tests.depends_on(&build)?;
        tests.as_current_task(|| -> Result<(), TaskError> {
            for name in ["unit", "integration"] {
                step(name, 150)?;
            }
            Ok(())
        })?;

        tests.events(EventType::StateChange).handle(|event| async move {
            log(format!("observed {event}"));
            Ok(())
        })?;

        tests.finished().await?;
        log("all done");
        Ok(())
    })
}

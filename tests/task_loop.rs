mod common;

use std::time::Duration;

use futures::StreamExt;
use taskloop::{
    BackgroundOpts, Event, EventType, RuntimeError, Task, TaskError, TaskGroup, TaskState, current_task,
    run_task_loop_with,
};

use common::{Trace, config, serial};

fn step(trace: &Trace, name: &'static str, millis: u64) -> Result<Task, RuntimeError> {
    let trace = trace.clone();
    Task::builder().with_name(name).build_fn(move |_| {
        let trace = trace.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            trace.push(name);
            Ok(())
        }
    })
}

/// Lets the task's own main future record its final state after `finished` resolved.
async fn settle() {
    tokio::task::yield_now().await;
}

#[test]
fn test_dependencies_run_in_order() {
    let _guard = serial();
    let trace = Trace::default();

    let inner = trace.clone();
    let result = run_task_loop_with(config(4), move || async move {
        let slow = step(&inner, "slow", 40)?;
        let fast = step(&inner, "fast", 0)?;
        let last = step(&inner, "last", 0)?;
        fast.depends_on(&slow)?;
        last.depends_on(&fast)?;
        Ok(())
    });

    assert!(result.is_ok(), "{result:?}");
    assert_eq!(trace.entries(), ["slow", "fast", "last"]);
}

#[test]
fn test_done_dependency_is_satisfied_immediately() {
    let _guard = serial();
    let trace = Trace::default();

    let inner = trace.clone();
    let result = run_task_loop_with(config(1), move || async move {
        let first = step(&inner, "first", 0)?;
        first.finished().await?;
        let second = step(&inner, "second", 0)?;
        second.depends_on(&first)?;
        if second.dependencies() != vec![first] {
            return Err(TaskError::msg("dependency not recorded"));
        }
        second.finished().await
    });

    assert!(result.is_ok(), "{result:?}");
    assert_eq!(trace.entries(), ["first", "second"]);
}

#[test]
fn test_failure_propagates_to_root() {
    let _guard = serial();

    let result = run_task_loop_with(config(1), || async {
        Task::builder().with_name("broken").build_fn(|_| async { Err(TaskError::msg("boom")) })?;
        Ok(())
    });

    let Err(TaskError::Failed { cause, .. }) = result else {
        panic!("expected the root to fail, got {result:?}");
    };
    assert!(
        matches!(&*cause, TaskError::ChildFailed { task, .. } if &*task.path == "broken" && task.top_level),
        "{cause:?}"
    );
    assert!(cause.as_message().ends_with("boom"), "{}", cause.as_message());
}

#[test]
fn test_error_handler_absorbs_dependency_failure() {
    let _guard = serial();
    let trace = Trace::default();

    let inner = trace.clone();
    let result = run_task_loop_with(config(1), move || async move {
        let broken = Task::builder().with_name("broken").build_fn(|_| async { Err(TaskError::msg("boom")) })?;
        let dependent = step(&inner, "dependent", 0)?;
        dependent.depends_on(&broken)?;

        let handled = inner.clone();
        dependent.set_error_handler(Some(&broken), move |err| {
            if let TaskError::DependencyFailed { task, .. } = &err {
                handled.push(format!("handled {}", task.path));
            }
            Ok(())
        });
        broken.handle_error(|_| Ok(()))?;

        dependent.finished().await?;
        if broken.state() == TaskState::Failed {
            inner.push("broken failed");
        }
        Ok(())
    });

    assert!(result.is_ok(), "{result:?}");
    assert_eq!(trace.entries(), ["handled broken", "dependent", "broken failed"]);
}

#[test]
fn test_error_handler_may_escalate() {
    let _guard = serial();

    let result = run_task_loop_with(config(1), || async {
        let broken = Task::builder().with_name("broken").build_fn(|_| async { Err(TaskError::msg("boom")) })?;
        let dependent = Task::builder().with_name("dependent").build_fn(|_| async { Ok(()) })?;
        dependent.depends_on(&broken)?;
        dependent.set_error_handler(None, |_| Err(TaskError::msg("escalated")));
        broken.handle_error(|_| Ok(()))?;
        dependent.handle_error(|_| Ok(()))?;

        let err = dependent.finished().await.err();
        match err {
            Some(TaskError::Failed { cause, .. }) if cause.to_string() == "escalated" => Ok(()),
            other => Err(TaskError::msg(format!("unexpected outcome {other:?}"))),
        }
    });

    assert!(result.is_ok(), "{result:?}");
}

#[test]
fn test_cancel_cascades_to_children() {
    let _guard = serial();
    let trace = Trace::default();

    let inner = trace.clone();
    let result = run_task_loop_with(config(1), move || async move {
        let parent = Task::builder().with_name("parent").build(TaskGroup)?;
        let child = parent.as_current_task(|| {
            Task::builder().with_name("child").build_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            })
        })?;

        child.started().await?;
        parent.cancel();

        if let Err(TaskError::Cancelled { task, .. }) = parent.finished().await {
            inner.push(format!("{} cancelled", task.path));
        }
        inner.push(format!("parent {}", parent.state().as_str()));
        inner.push(format!("child {}", child.state().as_str()));
        Ok(())
    });

    assert!(result.is_ok(), "{result:?}");
    assert_eq!(trace.entries(), ["parent cancelled", "parent cancelled", "child discarded"]);
}

#[test]
fn test_unneeded_dependency_is_discarded() {
    let _guard = serial();
    let trace = Trace::default();

    let inner = trace.clone();
    let result = run_task_loop_with(config(1), move || async move {
        let dependency = Task::builder().with_name("dependency").build_fn(|_| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        })?;
        let user = Task::builder().with_name("user").build_fn(|_| async { Ok(()) })?;
        user.depends_on(&dependency)?;
        dependency.handle_error(|_| Ok(()))?;

        dependency.started().await?;
        user.cancel();
        let _ = dependency.finished().await;
        inner.push(format!("user {}", user.state().as_str()));
        inner.push(format!("dependency {}", dependency.state().as_str()));
        Ok(())
    });

    assert!(result.is_ok(), "{result:?}");
    assert_eq!(trace.entries(), ["user cancelled", "dependency discarded"]);
}

#[test]
fn test_cancelled_dependency_discards_dependent() {
    let _guard = serial();
    let trace = Trace::default();

    let inner = trace.clone();
    let result = run_task_loop_with(config(1), move || async move {
        let dependency = Task::builder().with_name("dependency").build_fn(|_| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        })?;
        let user = step(&inner, "user", 0)?;
        user.depends_on(&dependency)?;
        dependency.handle_error(|_| Ok(()))?;
        user.handle_error(|_| Ok(()))?;

        dependency.started().await?;
        dependency.cancel();
        if let Err(TaskError::Cancelled { task, .. }) = user.finished().await {
            inner.push(format!("{} aborted", task.path));
        }
        settle().await;
        inner.push(format!("dependency {}", dependency.state().as_str()));
        inner.push(format!("user {}", user.state().as_str()));
        Ok(())
    });

    assert!(result.is_ok(), "{result:?}");
    assert_eq!(trace.entries(), ["user aborted", "dependency cancelled", "user discarded"]);
}

/// `user` depends on an empty group; the group is restarted with a slow child before the
/// dependency callback of its first lifetime runs.
fn restarted_dependency(depend_again: bool) -> Vec<String> {
    let trace = Trace::default();

    let inner = trace.clone();
    let result = run_task_loop_with(config(2), move || async move {
        let group = Task::builder().with_name("group").build(TaskGroup)?;
        let user = step(&inner, "user", 0)?;
        user.depends_on(&group)?;

        group.finished().await?;
        group.as_current_task(|| step(&inner, "late", 50))?;
        if depend_again {
            user.depends_on(&group)?;
        }
        inner.push(format!("restarts {}", group.restart_counter()));
        Ok(())
    });

    assert!(result.is_ok(), "{result:?}");
    trace.entries()
}

#[test]
fn test_restarted_dependency_counts_as_finished() {
    let _guard = serial();
    assert_eq!(restarted_dependency(false), ["restarts 1", "user", "late"]);
}

#[test]
fn test_dependency_added_again_waits_for_restart() {
    let _guard = serial();
    assert_eq!(restarted_dependency(true), ["restarts 1", "late", "user"]);
}

#[test]
fn test_failing_sync_handler_fails_subscriber() {
    let _guard = serial();
    let trace = Trace::default();

    let inner = trace.clone();
    let result = run_task_loop_with(config(1), move || async move {
        let watcher = Task::builder().with_name("watcher").build_fn(|_| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        })?;
        watcher.sync_handle_events(EventType::Custom("boom"), |_| Err(TaskError::msg("rejected")));
        watcher.handle_error(|_| Ok(()))?;

        let trace = inner.clone();
        let emitter = watcher.as_current_task(|| {
            Task::builder().with_name("emitter").build_fn(move |_| {
                let trace = trace.clone();
                async move {
                    Event::custom("boom").emit()?;
                    trace.push("after emit");
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    trace.push("emitter resumed");
                    Ok(())
                }
            })
        })?;

        if let Err(TaskError::Failed { cause, .. }) = watcher.finished().await {
            inner.push(format!("watcher failed: {cause}"));
        }
        let _ = emitter.finished().await;
        settle().await;
        inner.push(format!("watcher {}", watcher.state().as_str()));
        inner.push(format!("emitter {}", emitter.state().as_str()));
        Ok(())
    });

    assert!(result.is_ok(), "{result:?}");
    assert_eq!(
        trace.entries(),
        ["after emit", "watcher failed: rejected", "watcher failed", "emitter discarded"]
    );
}

#[test]
fn test_failing_own_sync_handler_aborts_at_next_await() {
    let _guard = serial();
    let trace = Trace::default();

    let inner = trace.clone();
    let result = run_task_loop_with(config(1), move || async move {
        let trace = inner.clone();
        let selfish = Task::builder().with_name("selfish").build_fn(move |task| {
            let trace = trace.clone();
            async move {
                task.sync_handle_events(EventType::Custom("oops"), |_| Err(TaskError::msg("own handler")));
                Event::custom("oops").emit()?;
                trace.push(format!("continued while {}", task.state().as_str()));
                tokio::task::yield_now().await;
                trace.push("resumed");
                Ok(())
            }
        })?;
        selfish.handle_error(|_| Ok(()))?;

        let failed = selfish.finished().await.is_err();
        settle().await;
        inner.push(format!("selfish {} {failed}", selfish.state().as_str()));
        Ok(())
    });

    assert!(result.is_ok(), "{result:?}");
    assert_eq!(trace.entries(), ["continued while failed", "selfish failed true"]);
}

#[test]
fn test_group_restarts_for_new_children() {
    let _guard = serial();
    let trace = Trace::default();

    let inner = trace.clone();
    let result = run_task_loop_with(config(2), move || async move {
        let group = Task::builder().with_name("group").build(TaskGroup)?;
        group.as_current_task(|| step(&inner, "first", 0))?;
        group.finished().await?;
        settle().await;
        inner.push(format!("group {} after {}", group.state().as_str(), group.restart_counter()));

        group.as_current_task(|| step(&inner, "second", 0))?;
        group.finished().await?;
        settle().await;
        inner.push(format!("group {} after {}", group.state().as_str(), group.restart_counter()));
        Ok(())
    });

    assert!(result.is_ok(), "{result:?}");
    assert_eq!(trace.entries(), ["first", "group done after 0", "second", "group done after 1"]);
}

#[test]
fn test_child_of_finished_task_is_rejected() {
    let _guard = serial();

    let result = run_task_loop_with(config(1), || async {
        let plain = Task::builder().with_name("plain").build_fn(|_| async { Ok(()) })?;
        plain.finished().await?;
        settle().await;
        match plain.as_current_task(|| Task::from_fn(|_| async { Ok(()) })) {
            Err(RuntimeError::InvalidState { .. }) => Ok(()),
            other => Err(TaskError::msg(format!("unexpected {other:?}"))),
        }
    });

    assert!(result.is_ok(), "{result:?}");
}

#[test]
fn test_background_wait_keeps_task_alive() {
    let _guard = serial();
    let trace = Trace::default();

    let inner = trace.clone();
    let result = run_task_loop_with(config(1), move || async move {
        let trace = inner.clone();
        let task = Task::builder().with_name("worker").build_fn(move |task| {
            let trace = trace.clone();
            async move {
                let background = trace.clone();
                task.background(
                    async move {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        background.push("background");
                        Ok(())
                    },
                    BackgroundOpts { wait: true, ..BackgroundOpts::default() },
                )?;
                trace.push("run");
                Ok(())
            }
        })?;
        task.finished().await?;
        inner.push("finished");
        Ok(())
    });

    assert!(result.is_ok(), "{result:?}");
    assert_eq!(trace.entries(), ["run", "background", "finished"]);
}

#[test]
fn test_background_failure_fails_task() {
    let _guard = serial();

    let result = run_task_loop_with(config(1), || async {
        let task = Task::builder().with_name("worker").build_fn(|task| async move {
            task.background(async { Err(TaskError::msg("lost connection")) }, BackgroundOpts::default())?;
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        })?;
        task.handle_error(|_| Ok(()))?;
        match task.finished().await {
            Err(TaskError::Failed { cause, .. }) if cause.to_string() == "lost connection" => Ok(()),
            other => Err(TaskError::msg(format!("unexpected {other:?}"))),
        }
    });

    assert!(result.is_ok(), "{result:?}");
}

#[test]
fn test_finish_block_delays_done() {
    let _guard = serial();
    let trace = Trace::default();

    let inner = trace.clone();
    let result = run_task_loop_with(config(1), move || async move {
        let task = Task::builder().with_name("blocked").build_fn(|_| async { Ok(()) })?;
        let block = task.block_finishing();
        task.started().await?;
        tokio::time::sleep(Duration::from_millis(20)).await;
        inner.push(format!("blocked {}", task.state().as_str()));
        drop(block);
        task.finished().await?;
        settle().await;
        inner.push(format!("released {}", task.state().as_str()));
        Ok(())
    });

    assert!(result.is_ok(), "{result:?}");
    assert_eq!(trace.entries(), ["blocked waiting", "released done"]);
}

#[test]
fn test_state_change_stream() {
    let _guard = serial();
    let trace = Trace::default();

    let inner = trace.clone();
    let result = run_task_loop_with(config(1), move || async move {
        let task = Task::builder().with_name("observed").build_fn(|_| async { Ok(()) })?;
        let states = inner.clone();
        task.events(EventType::StateChange).process(
            move |mut events| async move {
                while let Some(event) = events.next().await {
                    if let Some(state) = event.state {
                        states.push(state.as_str());
                    }
                }
                Ok(())
            },
            true,
        )?;
        Ok(())
    });

    assert!(result.is_ok(), "{result:?}");
    assert_eq!(trace.entries(), ["preparing", "pending", "running", "waiting", "done"]);
}

#[test]
fn test_sync_handlers_see_descendant_events() {
    let _guard = serial();
    let trace = Trace::default();

    let inner = trace.clone();
    let result = run_task_loop_with(config(1), move || async move {
        let seen = inner.clone();
        let registration = current_task()?.sync_handle_events(EventType::Custom("ping"), move |event| {
            seen.push(format!("{} from {}", event.kind.as_str(), event.source()?.path()));
            Ok(())
        });

        let outer = Task::builder().with_name("outer").build(TaskGroup)?;
        let inner_task = outer.as_current_task(|| {
            Task::builder().with_name("inner").build_fn(|_| async {
                Event::custom("ping").emit()?;
                Ok(())
            })
        })?;
        inner_task.finished().await?;

        registration.remove();
        inner_task.as_current_task(|| Event::custom("ping").emit())?;
        Ok(())
    });

    assert!(result.is_ok(), "{result:?}");
    assert_eq!(trace.entries(), ["ping from outer.inner"]);
}

#[test]
fn test_sibling_names_are_unique() {
    let _guard = serial();
    let trace = Trace::default();

    let inner = trace.clone();
    let result = run_task_loop_with(config(1), move || async move {
        for _ in 0..3 {
            let task = Task::builder().with_name("job").build_fn(|_| async { Ok(()) })?;
            inner.push(task.path());
        }
        Ok(())
    });

    assert!(result.is_ok(), "{result:?}");
    let names = trace.entries();
    assert_eq!(names[0], "job");
    assert_ne!(names[0], names[1]);
    assert_ne!(names[1], names[2]);
    assert!(names[1].starts_with("job"));
}

#[test]
fn test_one_loop_at_a_time() {
    let _guard = serial();
    let trace = Trace::default();

    assert!(matches!(Task::from_fn(|_| async { Ok(()) }), Err(RuntimeError::NoTaskLoop)));

    let inner = trace.clone();
    let result = run_task_loop_with(config(1), move || async move {
        let nested = run_task_loop_with(config(1), || async { Ok(()) });
        if let Err(TaskError::Runtime(RuntimeError::AlreadyRunning)) = nested {
            inner.push("rejected");
        }
        Ok(())
    });

    assert!(result.is_ok(), "{result:?}");
    assert_eq!(trace.entries(), ["rejected"]);

    // The slot is released again.
    assert!(run_task_loop_with(config(1), || async { Ok(()) }).is_ok());
}

#[test]
fn test_root_run_error_is_returned() {
    let _guard = serial();

    let result = run_task_loop_with(config(1), || async { Err(TaskError::msg("setup failed")) });

    match result {
        Err(TaskError::Failed { cause, .. }) => assert_eq!(cause.to_string(), "setup failed"),
        other => panic!("unexpected {other:?}"),
    }
}

mod common;

use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use taskloop::{
    Client, Config, JobPriorities, JobServerMode, RuntimeError, Scheduler, Task, TaskError, run_task_loop_with,
};

use common::{Trace, config, serial};

#[derive(Clone, Default)]
struct Gauge {
    running: Rc<Cell<usize>>,
    peak: Rc<Cell<usize>>,
    completed: Rc<Cell<usize>>,
}

impl Gauge {
    fn enter(&self) {
        self.running.set(self.running.get() + 1);
        self.peak.set(self.peak.get().max(self.running.get()));
    }

    fn leave(&self) {
        self.running.set(self.running.get() - 1);
        self.completed.set(self.completed.get() + 1);
    }
}

fn leased_job(gauge: &Gauge, name: String, hold: Duration) -> Result<Task, RuntimeError> {
    let gauge = gauge.clone();
    Task::builder().with_name(name).with_lease(true).build_fn(move |_| {
        let gauge = gauge.clone();
        async move {
            gauge.enter();
            tokio::time::sleep(hold).await;
            gauge.leave();
            Ok(())
        }
    })
}

/// Runs `waiters` leased jobs holding their lease for `hold`; returns `(result, peak, completed)`.
fn run_limited(config: Config, waiters: usize, hold: Duration) -> (Result<(), TaskError>, usize, usize) {
    let gauge = Gauge::default();
    let inner = gauge.clone();
    let result = run_task_loop_with(config, move || async move {
        for i in 0..waiters {
            leased_job(&inner, format!("job{i}"), hold)?;
        }
        Ok(())
    });
    (result, gauge.peak.get(), gauge.completed.get())
}

#[test]
fn test_local_slots_limit_concurrency() {
    let _guard = serial();

    let (result, peak, completed) = run_limited(config(2), 6, Duration::from_millis(20));

    assert!(result.is_ok(), "{result:?}");
    assert_eq!((peak, completed), (2, 6));
}

#[test]
fn test_own_server_limits_concurrency() {
    let _guard = serial();

    let config = Config { job_server: JobServerMode::NonBlocking, ..config(3) };
    let (result, peak, completed) = run_limited(config, 9, Duration::from_millis(20));

    assert!(result.is_ok(), "{result:?}");
    assert_eq!((peak, completed), (3, 9));
}

fn assert_four_of_ten(config: Config) {
    let (result, peak, completed) = run_limited(config, 10, Duration::from_millis(150));

    assert!(result.is_ok(), "{result:?}");
    assert_eq!(peak, 4);
    assert_eq!(completed, 10);
}

#[test]
fn test_blocking_pipe_server_through_helper() {
    let _guard = serial();
    assert_four_of_ten(Config { job_server: JobServerMode::Pipe, ..config(4) });
}

#[test]
fn test_fifo_server() {
    let _guard = serial();
    assert_four_of_ten(Config { job_server: JobServerMode::Fifo, ..config(4) });
}

#[test]
fn test_forced_helper_on_non_blocking_server() {
    let _guard = serial();
    assert_four_of_ten(Config { job_server: JobServerMode::NonBlocking, force_helper: true, ..config(4) });
}

#[test]
fn test_tasks_without_lease_are_unlimited() {
    let _guard = serial();
    let gauge = Gauge::default();

    let inner = gauge.clone();
    let result = run_task_loop_with(config(1), move || async move {
        for _ in 0..4 {
            let gauge = inner.clone();
            Task::from_fn(move |_| {
                let gauge = gauge.clone();
                async move {
                    gauge.enter();
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    gauge.leave();
                    Ok(())
                }
            })?;
        }
        Ok(())
    });

    assert!(result.is_ok(), "{result:?}");
    assert_eq!(gauge.peak.get(), 4);
}

#[test]
fn test_priorities_order_waiting_tasks() {
    let _guard = serial();
    let trace = Trace::default();

    let inner = trace.clone();
    let result = run_task_loop_with(config(1), move || async move {
        let holder = Task::builder().with_name("holder").with_lease(true).build_fn(|_| async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok(())
        })?;
        holder.started().await?;

        let waiting: [(&'static str, Vec<i64>); 5] = [
            ("low", vec![]),
            ("tie-a", vec![1]),
            ("high", vec![5]),
            ("tie-b", vec![1, 0]),
            ("nested", vec![1, 2]),
        ];
        for (name, priority) in waiting {
            let trace = inner.clone();
            let task = Task::builder().with_name(name).with_lease(true).build_fn(move |_| {
                let trace = trace.clone();
                async move {
                    trace.push(name);
                    Ok(())
                }
            })?;
            JobPriorities::PRIORITY.set_in(&task, priority);
        }
        Ok(())
    });

    assert!(result.is_ok(), "{result:?}");
    assert_eq!(trace.entries(), ["high", "nested", "tie-a", "tie-b", "low"]);
}

#[test]
fn test_dropped_lease_request_is_skipped() {
    let _guard = serial();
    let trace = Trace::default();

    let inner = trace.clone();
    let result = run_task_loop_with(config(1), move || async move {
        let client = Client::new(&config(1))?;
        let first = client.request_lease();
        let abandoned = client.request_lease();
        let third = client.request_lease();
        inner.push(format!("first ready {}", first.is_ready()));

        drop(abandoned);
        drop(first);
        third.ready().await;
        inner.push(format!("third ready {}", third.is_ready()));
        third.return_lease();
        inner.push(format!("third done {}", third.is_done()));
        Ok(())
    });

    assert!(result.is_ok(), "{result:?}");
    assert_eq!(trace.entries(), ["first ready true", "third ready true", "third done true"]);
}

#[test]
fn test_subprocess_args_advertise_own_server() {
    let _guard = serial();

    let config = Config { job_server: JobServerMode::NonBlocking, ..config(3) };
    let client = Client::new(&config).expect("job server");
    assert_eq!(client.job_count(), 3);

    let setup = client.subprocess_args(HashMap::from([("PATH".to_string(), "/bin".to_string())]));
    let makeflags = &setup.env["MAKEFLAGS"];
    assert!(makeflags.contains("-j3"), "{makeflags}");
    assert!(makeflags.contains("--jobserver-auth="), "{makeflags}");
    assert_eq!(setup.env["PATH"], "/bin");
    assert_eq!(setup.pass_fds.len(), 2);
    client.shutdown();
}

#[test]
fn test_local_mode_passes_nothing() {
    let _guard = serial();

    let client = Client::new(&config(4)).expect("local slots");
    let setup = client.subprocess_args(HashMap::new());
    assert!(setup.env.is_empty());
    assert!(setup.pass_fds.is_empty());
}

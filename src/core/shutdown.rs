//! # Interrupt handling.
//!
//! Provides [`watch_interrupts`], spawned by the task loop when `handle_sigint` is set.
//!
//! ## Signals
//! - first `SIGINT`: emit [`EventType::Interrupted`](crate::EventType::Interrupted) as the root
//!   task, then cancel the root (and with it the whole tree)
//! - second `SIGINT`: terminate the process with status 130
//!
//! The tokio signal driver stays registered for the rest of the process once installed.

use tokio::signal::unix::{SignalKind, signal};

use crate::core::task::WeakTask;
use crate::core::current::with_current;
use crate::events::Event;

const INTERRUPTED_STATUS: i32 = 130;

/// Waits for interrupts and applies them to `root` until the loop ends.
pub(crate) async fn watch_interrupts(root: WeakTask) -> std::io::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;

    if sigint.recv().await.is_none() {
        return Ok(());
    }
    if let Some(root) = root.upgrade() {
        tracing::info!("interrupted, cancelling all tasks");
        with_current(&root, || {
            if let Err(err) = Event::interrupted().emit() {
                tracing::warn!(%err, "failed to emit interrupt event");
            }
        });
        root.cancel();
    }

    if sigint.recv().await.is_some() {
        tracing::warn!("interrupted again, exiting");
        std::process::exit(INTERRUPTED_STATUS);
    }
    Ok(())
}

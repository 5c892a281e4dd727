//! # Job server client.
//!
//! Hands out [`Lease`]s backed by a local slot counter and, beyond that, by tokens of a
//! make-compatible job server: one byte read from the server pipe is one extra slot, writing the
//! byte back releases it.
//!
//! ## Slot accounting
//! ```text
//! request_lease():  local slot free? ── yes ──► ready now
//!                        │ no
//!                        └──► queue (weak) ── helper? write "!" ── ensure poller
//!
//! token arrives:    held += token ──► wake oldest live waiter, else release it again
//!
//! release:          holding a token? ── yes ──► write it back to the server
//!                        │ no
//!                        └──► wake oldest live waiter, else local slots += 1
//! ```
//!
//! ## Rules
//! - At most `job_count` leases are ready at any time across all cooperating processes.
//! - Tokens are returned before local slots so other processes are not starved.
//! - Waiters are served FIFO; abandoned (dropped) waiters are skipped.
//! - EOF on the polled descriptor means the job server is gone; this is logged and polling
//!   stops.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};

use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::jobs::environment::{self, InheritedJobServer, join_words};
use crate::jobs::helper::Helper;
use crate::jobs::lease::{Lease, LeaseState, Scheduler, SlotPool};
use crate::jobs::server::Server;
use crate::jobs::JobServerMode;
use crate::sys;

/// Environment and descriptors a child process needs to join the job server.
#[derive(Debug, Clone, Default)]
pub struct SubprocessSetup {
    /// Environment to use for the child (`MAKEFLAGS` adjusted).
    pub env: HashMap<String, String>,
    /// Descriptors the child must inherit.
    pub pass_fds: Vec<RawFd>,
}

struct Pipe {
    read: RawFd,
    write: RawFd,
}

#[derive(Default)]
struct Slots {
    local: usize,
    acquired: Vec<u8>,
    pending: VecDeque<Weak<LeaseState>>,
    polling: bool,
}

struct ClientInner {
    job_count: usize,
    /// Descriptors of an inherited server children must keep.
    inherited_fds: Vec<RawFd>,
    /// `MAKEFLAGS` words forwarded when advertising the own server.
    other_makeflags: Vec<String>,
    server: Option<Server>,
    pipe: Option<Pipe>,
    helper: RefCell<Option<Helper>>,
    poll_fd: Option<RawFd>,
    slots: RefCell<Slots>,
    shutdown: CancellationToken,
}

/// Lease scheduler backed by local slots and a job server.
///
/// Cheap to clone; clones share the same slots.
#[derive(Clone)]
pub struct Client {
    inner: Rc<ClientInner>,
}

impl Client {
    /// Creates a client according to `config` and the inherited `MAKEFLAGS`.
    ///
    /// Job count: inherited server count, else `config.jobs`, else the `-jN` of `MAKEFLAGS`,
    /// else the available parallelism.
    ///
    /// # Errors
    /// Creating the own job server pipe, or forking the helper, failed.
    pub fn new(config: &Config) -> io::Result<Client> {
        if config.inherit_makeflags {
            Client::with_inherited(config, environment::inherited())
        } else {
            Client::with_inherited(config, &InheritedJobServer::default())
        }
    }

    /// Creates a client for `config` with `found` as the inherited job server.
    ///
    /// An unsupported or unreachable server disables parallel execution: one job, no pipe.
    pub(crate) fn with_inherited(config: &Config, found: &InheritedJobServer) -> io::Result<Client> {
        let mut fallback = config.fallback_job_count();
        let mut have_server = found.present;
        if have_server && !found.supported {
            tracing::warn!("found unsupported job server type in MAKEFLAGS, disabling parallel execution");
            have_server = false;
            fallback = Some(1);
        }
        if have_server && found.fds.is_none() {
            tracing::warn!("could not connect to job server found in MAKEFLAGS, disabling parallel execution");
            have_server = false;
            fallback = Some(1);
        }

        let job_count = if have_server {
            found.job_count
        } else if fallback.is_some() {
            fallback
        } else {
            found
                .job_count
                .filter(|&count| count > 0)
                .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
        };
        let job_count = job_count.unwrap_or(1).max(1);

        let mut local = 1;
        let mut server = None;
        let mut pipe = None;
        if config.job_server == JobServerMode::Local {
            local = job_count;
        } else if have_server {
            pipe = found.fds.map(|(read, write)| Pipe { read, write });
        } else {
            let own = Server::new(job_count, config.job_server)?;
            pipe = own.fds().map(|(read, write)| Pipe { read, write });
            server = Some(own);
        }

        let mut helper = None;
        let mut poll_fd = None;
        if let Some(pipe) = &pipe {
            if sys::is_blocking(pipe.read)? || config.force_helper {
                let spawned = Helper::spawn(pipe.read, pipe.write)?;
                poll_fd = Some(spawned.response_fd());
                helper = Some(spawned);
            } else {
                poll_fd = Some(pipe.read);
            }
        }

        tracing::debug!(job_count, local, helper = helper.is_some(), "job server client ready");
        Ok(Client {
            inner: Rc::new(ClientInner {
                job_count,
                inherited_fds: if have_server { found.pass_fds.clone() } else { Vec::new() },
                other_makeflags: found.other_makeflags.clone(),
                server,
                pipe,
                helper: RefCell::new(helper),
                poll_fd,
                slots: RefCell::new(Slots { local, ..Slots::default() }),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Total number of concurrent jobs this client schedules for.
    #[inline]
    pub fn job_count(&self) -> usize {
        self.inner.job_count
    }

    /// Environment and descriptors for a child process, derived from `env`.
    ///
    /// With an own server the child gets a `MAKEFLAGS` advertising it; with an inherited server
    /// the environment is passed through and the inherited descriptors are kept open.
    pub fn subprocess_args(&self, env: HashMap<String, String>) -> SubprocessSetup {
        let mut env = env;
        if let Some(server) = &self.inner.server {
            let words: Vec<&str> = self
                .inner
                .other_makeflags
                .iter()
                .chain(server.makeflags())
                .map(String::as_str)
                .collect();
            env.insert("MAKEFLAGS".to_string(), join_words(&words));
            return SubprocessSetup { env, pass_fds: server.pass_fds() };
        }
        SubprocessSetup { env, pass_fds: self.inner.inherited_fds.clone() }
    }

    /// Returns held tokens and stops the helper and poller.
    ///
    /// Called by the task loop on exit; further leases are served from local slots only.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let Some(pipe) = &self.inner.pipe else {
            return;
        };
        let held = std::mem::take(&mut self.inner.slots.borrow_mut().acquired);
        for token in held {
            if let Err(err) = sys::write_all(pipe.write, &[token]) {
                tracing::warn!(%err, "failed to return job server token");
            }
        }
        if let Some(helper) = self.inner.helper.borrow_mut().take() {
            helper.shutdown(pipe.write);
        }
    }

    fn ensure_polling(&self) {
        let Some(fd) = self.inner.poll_fd else {
            return;
        };
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        {
            let mut slots = self.inner.slots.borrow_mut();
            if slots.polling {
                return;
            }
            slots.polling = true;
        }
        let inner = self.inner.clone();
        tokio::task::spawn_local(async move {
            if let Err(err) = poll_tokens(&inner, fd).await {
                tracing::error!(%err, "job server polling stopped");
            }
            inner.slots.borrow_mut().polling = false;
        });
    }
}

impl Scheduler for Client {
    fn request_lease(&self) -> Lease {
        let lease = Lease::new(self.inner.clone());
        let granted = {
            let mut slots = self.inner.slots.borrow_mut();
            if slots.local > 0 {
                slots.local -= 1;
                true
            } else {
                slots.pending.push_back(lease.downgrade());
                false
            }
        };
        if granted {
            lease.mark_ready();
            return lease;
        }
        if let Some(helper) = self.inner.helper.borrow().as_ref() {
            if let Err(err) = helper.request_token() {
                tracing::warn!(%err, "failed to request job server token");
            }
        }
        self.ensure_polling();
        lease
    }
}

impl ClientInner {
    fn wants_tokens(&self) -> bool {
        if self.helper.borrow().is_some() {
            return true;
        }
        let mut slots = self.slots.borrow_mut();
        while slots.pending.back().is_some_and(|w| !w.upgrade().is_some_and(|l| l.is_live())) {
            slots.pending.pop_back();
        }
        !slots.pending.is_empty()
    }

    /// Wakes the oldest live waiter; `false` if there is none.
    fn activate_pending(&self) -> bool {
        loop {
            let next = self.slots.borrow_mut().pending.pop_front();
            let Some(weak) = next else {
                return false;
            };
            if let Some(lease) = weak.upgrade().filter(|l| l.is_live()) {
                lease.mark_ready();
                return true;
            }
        }
    }

    fn got_token(&self, token: u8) {
        self.slots.borrow_mut().acquired.push(token);
        if !self.activate_pending() {
            self.release_slot();
        }
    }
}

impl SlotPool for ClientInner {
    fn release_slot(&self) {
        let token = self.slots.borrow_mut().acquired.pop();
        if let Some(token) = token {
            if let Some(pipe) = &self.pipe {
                if let Err(err) = sys::write_all(pipe.write, &[token]) {
                    tracing::warn!(%err, "failed to return job server token");
                }
            }
            return;
        }
        if self.activate_pending() {
            return;
        }
        self.slots.borrow_mut().local += 1;
    }
}

async fn poll_tokens(inner: &Rc<ClientInner>, fd: RawFd) -> io::Result<()> {
    let async_fd = AsyncFd::with_interest(fd, Interest::READABLE)?;
    while inner.wants_tokens() {
        let mut guard = tokio::select! {
            guard = async_fd.readable() => guard?,
            _ = inner.shutdown.cancelled() => return Ok(()),
        };
        match sys::read_byte(fd) {
            Ok(Some(token)) => inner.got_token(token),
            Ok(None) => {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "job server is gone"));
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => guard.clear_ready(),
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_client(jobs: usize) -> Client {
        let config = Config {
            jobs,
            job_server: JobServerMode::Local,
            inherit_makeflags: false,
            ..Config::default()
        };
        Client::new(&config).unwrap()
    }

    #[test]
    fn test_local_slots_are_granted_immediately() {
        let client = local_client(2);
        let a = client.request_lease();
        let b = client.request_lease();
        let c = client.request_lease();
        assert!(a.is_ready() && b.is_ready());
        assert!(!c.is_ready());

        drop(a);
        assert!(c.is_ready());
    }

    #[test]
    fn test_abandoned_waiter_is_skipped() {
        let client = local_client(1);
        let a = client.request_lease();
        let b = client.request_lease();
        let c = client.request_lease();
        drop(b);

        a.return_lease();
        assert!(c.is_ready());
        assert!(a.is_done());
        drop(a); // second return is a no-op

        drop(c);
        let d = client.request_lease();
        assert!(d.is_ready());
        let e = client.request_lease();
        assert!(!e.is_ready());
    }

    fn inherited_config() -> Config {
        Config { jobs: 4, job_server: JobServerMode::Pipe, ..Config::default() }
    }

    fn assert_serial(client: &Client) {
        assert_eq!(client.job_count(), 1);
        assert!(client.inner.pipe.is_none());
        assert!(client.inner.poll_fd.is_none());
        assert!(client.inner.helper.borrow().is_none());
        assert!(client.subprocess_args(HashMap::new()).pass_fds.is_empty());

        let first = client.request_lease();
        let second = client.request_lease();
        assert!(first.is_ready());
        assert!(!second.is_ready());
    }

    #[test]
    fn test_unsupported_server_runs_serially() {
        let found = InheritedJobServer {
            present: true,
            supported: false,
            job_count: Some(8),
            other_makeflags: vec!["--jobserver-auth=sem:make".to_string()],
            ..InheritedJobServer::default()
        };
        let client = Client::with_inherited(&inherited_config(), &found).unwrap();
        assert_serial(&client);
    }

    #[test]
    fn test_unreachable_server_runs_serially() {
        let found = InheritedJobServer {
            present: true,
            supported: true,
            job_count: Some(8),
            fds: None,
            pass_fds: vec![97, 98],
            ..InheritedJobServer::default()
        };
        let client = Client::with_inherited(&inherited_config(), &found).unwrap();
        assert_serial(&client);
    }

    #[test]
    fn test_own_server_advertises_makeflags() {
        let config = Config {
            jobs: 3,
            job_server: JobServerMode::NonBlocking,
            inherit_makeflags: false,
            ..Config::default()
        };
        let client = Client::new(&config).unwrap();
        assert_eq!(client.job_count(), 3);

        let setup = client.subprocess_args(HashMap::new());
        let makeflags = &setup.env["MAKEFLAGS"];
        assert!(makeflags.contains("-j3"));
        assert!(makeflags.contains("--jobserver-auth="));
        assert_eq!(setup.pass_fds.len(), 2);
        client.shutdown();
    }
}

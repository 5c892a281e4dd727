//! # Inherited job server (`MAKEFLAGS`).
//!
//! A make-compatible parent advertises its job server in `MAKEFLAGS`:
//!
//! ```text
//! MAKEFLAGS="kw -j8 --jobserver-auth=fifo:/tmp/GMfifo123"     (make >= 4.4)
//! MAKEFLAGS="-j8 --jobserver-auth=3,4"                         (pipe descriptors)
//! MAKEFLAGS="-j8 --jobserver-fds=3,4"                          (older spelling)
//! ```
//!
//! The environment is examined once per process ([`init_job_server_environment`]); ideally
//! early, while the inherited descriptors are the only ones open, so a stale descriptor number
//! is not mistaken for the job server.

use std::fs::OpenOptions;
use std::os::fd::{IntoRawFd, RawFd};
use std::path::PathBuf;
use std::sync::OnceLock;

use crate::process::command::quote;
use crate::sys;

/// One parsed `MAKEFLAGS` word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Flag {
    /// `-jN`; a bare `-j` (unlimited) is `Some(0)`, an unparsable count `None`.
    Jobs(Option<usize>),
    /// `--jobserver-auth=` / `--jobserver-fds=`.
    Auth { raw: String, auth: Auth },
    /// Anything else, passed on to children untouched.
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Auth {
    Fifo(PathBuf),
    Fds(RawFd, RawFd),
    Unsupported,
}

/// What was found in the environment.
#[derive(Debug, Clone, Default)]
pub(crate) struct InheritedJobServer {
    /// A job server was advertised.
    pub(crate) present: bool,
    /// It uses an encoding we understand.
    pub(crate) supported: bool,
    /// `-jN` of the parent.
    pub(crate) job_count: Option<usize>,
    /// Usable `(read, write)` descriptors.
    pub(crate) fds: Option<(RawFd, RawFd)>,
    /// Descriptors children must inherit.
    pub(crate) pass_fds: Vec<RawFd>,
    /// Flags to forward when we advertise our own server.
    pub(crate) other_makeflags: Vec<String>,
}

static INHERITED: OnceLock<InheritedJobServer> = OnceLock::new();

/// Examines `MAKEFLAGS` for an inherited job server.
///
/// Later calls are no-ops. Call this early in `main` when the process may be started by
/// `make`, before any other descriptors are opened.
pub fn init_job_server_environment() {
    inherited();
}

pub(crate) fn inherited() -> &'static InheritedJobServer {
    INHERITED.get_or_init(|| {
        let makeflags = std::env::var("MAKEFLAGS").unwrap_or_default();
        resolve(parse_makeflags(&makeflags))
    })
}

pub(crate) fn parse_makeflags(makeflags: &str) -> Vec<Flag> {
    split_words(makeflags)
        .into_iter()
        .map(|word| {
            if let Some(count) = word.strip_prefix("-j") {
                return Flag::Jobs(if count.is_empty() { Some(0) } else { count.parse().ok() });
            }
            let arg = word
                .strip_prefix("--jobserver-auth=")
                .or_else(|| word.strip_prefix("--jobserver-fds="));
            match arg {
                Some(arg) => Flag::Auth { auth: parse_auth(arg), raw: word.clone() },
                None => Flag::Other(word),
            }
        })
        .collect()
}

fn parse_auth(arg: &str) -> Auth {
    if let Some(path) = arg.strip_prefix("fifo:") {
        return Auth::Fifo(PathBuf::from(path));
    }
    let mut parts = arg.split(',');
    match (parts.next().map(str::parse), parts.next().map(str::parse)) {
        (Some(Ok(read)), Some(Ok(write))) => Auth::Fds(read, write),
        _ => Auth::Unsupported,
    }
}

/// Turns parsed flags into usable descriptors, opening FIFOs and probing descriptors.
pub(crate) fn resolve(flags: Vec<Flag>) -> InheritedJobServer {
    let mut found = InheritedJobServer::default();
    for flag in flags {
        match flag {
            Flag::Jobs(Some(count)) => found.job_count = Some(count),
            Flag::Jobs(None) => {}
            Flag::Other(word) => found.other_makeflags.push(word),
            Flag::Auth { raw, auth } => {
                found.present = true;
                match auth {
                    Auth::Fifo(path) => {
                        found.supported = true;
                        match OpenOptions::new().read(true).write(true).open(&path) {
                            Ok(file) => {
                                // Kept open for the rest of the process.
                                let fd = file.into_raw_fd();
                                found.fds = Some((fd, fd));
                            }
                            Err(err) => {
                                tracing::debug!(path = %path.display(), %err, "job server fifo not reachable");
                                found.other_makeflags.push(raw);
                            }
                        }
                    }
                    Auth::Fds(read, write) => {
                        found.supported = true;
                        let mut pass = vec![read, write];
                        pass.sort_unstable();
                        pass.dedup();
                        found.pass_fds = pass;
                        if sys::is_open(read) && sys::is_open(write) {
                            found.fds = Some((read, write));
                        } else {
                            found.other_makeflags.push(raw);
                        }
                    }
                    Auth::Unsupported => found.other_makeflags.push(raw),
                }
            }
        }
    }
    found
}

/// Splits `MAKEFLAGS` into words, honouring shell quoting.
pub(crate) fn split_words(input: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                for q in chars.by_ref() {
                    if q == '\'' {
                        break;
                    }
                    current.push(q);
                }
            }
            '"' => {
                in_word = true;
                while let Some(q) = chars.next() {
                    match q {
                        '"' => break,
                        '\\' => current.extend(chars.next()),
                        q => current.push(q),
                    }
                }
            }
            '\\' => {
                in_word = true;
                current.extend(chars.next());
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

/// Joins words into a shell-safe string (inverse of [`split_words`]).
pub(crate) fn join_words<S: AsRef<str>>(words: &[S]) -> String {
    words.iter().map(|w| quote(w.as_ref())).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_parse_job_counts() {
        assert_eq!(parse_makeflags("-j8"), vec![Flag::Jobs(Some(8))]);
        assert_eq!(parse_makeflags("-j"), vec![Flag::Jobs(Some(0))]);
        assert_eq!(parse_makeflags("-jx"), vec![Flag::Jobs(None)]);
    }

    #[test]
    fn test_parse_auth_variants() {
        let flags = parse_makeflags("kw --jobserver-auth=fifo:/tmp/f --jobserver-fds=3,4 --jobserver-auth=sem");
        assert_eq!(flags[0], Flag::Other("kw".into()));
        assert!(matches!(&flags[1], Flag::Auth { auth: Auth::Fifo(p), .. } if p == &PathBuf::from("/tmp/f")));
        assert!(matches!(&flags[2], Flag::Auth { auth: Auth::Fds(3, 4), .. }));
        assert!(matches!(&flags[3], Flag::Auth { auth: Auth::Unsupported, .. }));
    }

    #[test]
    fn test_resolve_open_pipe() {
        let (read, write) = sys::pipe().unwrap();
        let (r, w) = (read.as_raw_fd(), write.as_raw_fd());
        let found = resolve(parse_makeflags(&format!("-j3 --jobserver-auth={r},{w}")));

        assert!(found.present && found.supported);
        assert_eq!(found.fds, Some((r, w)));
        assert_eq!(found.job_count, Some(3));
        assert!(found.other_makeflags.is_empty());
    }

    #[test]
    fn test_resolve_unreachable_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let found = resolve(parse_makeflags(&format!("--jobserver-auth=fifo:{}", missing.display())));

        assert!(found.present && found.supported);
        assert!(found.fds.is_none());
        assert_eq!(found.other_makeflags.len(), 1);
    }

    #[test]
    fn test_resolve_unsupported() {
        let found = resolve(parse_makeflags("--jobserver-auth=sem:name"));
        assert!(found.present);
        assert!(!found.supported);
        assert!(found.fds.is_none());
    }

    #[test]
    fn test_split_and_join() {
        assert_eq!(split_words(r#" a  'b c' "d\"e" f\ g "#), vec!["a", "b c", "d\"e", "f g"]);
        assert_eq!(join_words(&["-j4", "a b", "it's"]), r#"-j4 'a b' 'it'"'"'s'"#);
        assert_eq!(join_words(&["", "kw"]), "'' kw");
        assert_eq!(split_words(&join_words(&["", "kw"])), vec!["", "kw"]);
    }
}

//! Command line helpers: shell rendering and executable lookup.

use std::borrow::Cow;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

fn is_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || "@%+=:,./_-".contains(c)
}

/// Quotes `word` for a POSIX shell, leaving it as is when nothing needs quoting.
pub(crate) fn quote(word: &str) -> Cow<'_, str> {
    if word.is_empty() {
        return Cow::Borrowed("''");
    }
    if word.chars().all(is_safe) {
        return Cow::Borrowed(word);
    }
    Cow::Owned(format!("'{}'", word.replace('\'', r#"'"'"'"#)))
}

/// Joins `command` into a line a shell would split back into the same words.
pub(crate) fn join(command: &[String]) -> String {
    command.iter().map(|word| quote(word)).collect::<Vec<_>>().join(" ")
}

fn is_executable(path: &Path) -> bool {
    path.metadata().is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

/// Resolves `program` like a shell would, searching `search_path` when it has no slash.
///
/// Relative results are made absolute against `cwd`.
pub(crate) fn resolve_executable(program: &str, search_path: &str, cwd: &Path) -> Option<PathBuf> {
    if program.contains('/') {
        let path = cwd.join(program);
        return is_executable(&path).then_some(path);
    }
    search_path
        .split(':')
        .map(|dir| if dir.is_empty() { Path::new(".") } else { Path::new(dir) })
        .map(|dir| cwd.join(dir).join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote() {
        assert_eq!(quote("plain-word_1.txt"), "plain-word_1.txt");
        assert_eq!(quote(""), "''");
        assert_eq!(quote("two words"), "'two words'");
        assert_eq!(quote("it's"), r#"'it'"'"'s'"#);
    }

    #[test]
    fn test_join() {
        let command = vec!["echo".to_string(), "a b".to_string(), "$HOME".to_string()];
        assert_eq!(join(&command), "echo 'a b' '$HOME'");
    }

    #[test]
    fn test_resolve_in_search_path() {
        let cwd = std::env::temp_dir();
        let found = resolve_executable("sh", "/nonexistent:/bin:/usr/bin", &cwd);
        assert!(found.is_some_and(|p| p.is_absolute() && p.ends_with("sh")));
        assert!(resolve_executable("definitely-not-a-command", "/bin", &cwd).is_none());
    }
}

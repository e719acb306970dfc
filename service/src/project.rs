//! Project definition and identifier rules.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Longest identifier accepted. Identifiers become directory names.
pub const MAX_ID_LEN: usize = 64;

/// A supervised, independently runnable program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub root: PathBuf,
    pub run_command: String,
    pub created_at: DateTime<Utc>,
}

impl Project {
    pub fn new(
        id: impl Into<String>,
        root: impl Into<PathBuf>,
        run_command: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            root: root.into(),
            run_command: run_command.into(),
            created_at: Utc::now(),
        }
    }
}

/// Why an identifier was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("identifier is empty")]
    Empty,

    #[error("identifier is longer than {MAX_ID_LEN} characters")]
    TooLong,

    #[error("identifier contains a path traversal sequence")]
    Traversal,

    #[error("identifier contains {0:?}; only letters, digits, '-' and '_' are allowed")]
    BadChar(char),
}

/// Validate a project identifier.
///
/// Accepts ASCII letters, digits, hyphen and underscore. Anything that could
/// be interpreted as a path component other than a single plain name is
/// rejected, so `<projects_dir>/<id>` can never escape `projects_dir`.
pub fn validate_id(id: &str) -> Result<(), IdError> {
    if id.is_empty() {
        return Err(IdError::Empty);
    }
    if id.len() > MAX_ID_LEN {
        return Err(IdError::TooLong);
    }
    if id.contains("..") || id.contains('/') || id.contains('\\') {
        return Err(IdError::Traversal);
    }
    match id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        Some(c) => Err(IdError::BadChar(c)),
        None => Ok(()),
    }
}

/// Split a run command into argv using POSIX shell-word rules.
///
/// The result is executed directly; no shell ever sees the string, so
/// `;`, `|`, `$(..)` and friends are passed through as literal arguments.
pub fn tokenize_command(command: &str) -> Result<Vec<String>, String> {
    let argv = shlex::split(command).ok_or_else(|| "unbalanced quotes".to_string())?;
    if argv.is_empty() {
        return Err("command is empty".to_string());
    }
    Ok(argv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn accepts_plain_identifiers() {
        for id in ["echo-bot", "bot_1", "A", "x-y_z-09"] {
            assert_eq!(validate_id(id), Ok(()), "{id}");
        }
    }

    #[test]
    fn rejects_traversal_and_separators() {
        assert_eq!(validate_id(".."), Err(IdError::Traversal));
        assert_eq!(validate_id("a/b"), Err(IdError::Traversal));
        assert_eq!(validate_id("..\\evil"), Err(IdError::Traversal));
        assert_eq!(validate_id("bot..x"), Err(IdError::Traversal));
    }

    #[test]
    fn rejects_other_characters() {
        assert_eq!(validate_id(""), Err(IdError::Empty));
        assert_eq!(validate_id("bot name"), Err(IdError::BadChar(' ')));
        assert_eq!(validate_id("bot.py"), Err(IdError::BadChar('.')));
        assert_eq!(validate_id("ботик"), Err(IdError::BadChar('б')));
        assert_eq!(validate_id(&"a".repeat(MAX_ID_LEN + 1)), Err(IdError::TooLong));
    }

    #[test]
    fn tokenize_respects_quotes_without_a_shell() {
        assert_eq!(
            tokenize_command("python3 main.py --name 'my bot'").unwrap(),
            vec!["python3", "main.py", "--name", "my bot"]
        );
        assert_eq!(
            tokenize_command("echo hi; rm -rf /").unwrap(),
            vec!["echo", "hi;", "rm", "-rf", "/"]
        );
        assert!(tokenize_command("   ").is_err());
        assert!(tokenize_command("echo 'open").is_err());
    }
}

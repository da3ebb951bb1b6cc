//! One-shot operations over pooled connections.
//!
//! - [`StatsExecutor`]: system stats, service and process listing/control.
//! - [`FileExecutor`]: directory listing, file read/write, filename search.
//!
//! Executors hold no state of their own beyond a handle to the pool. Every
//! call acquires the connection for its [`PoolKey`](super::pool::PoolKey),
//! runs its commands, and turns the text output into typed results.

mod files;
pub(crate) mod sftp;
mod stats;

pub use files::FileExecutor;
pub use stats::StatsExecutor;

use super::error::EngineError;

/// Quote `value` for a POSIX shell.
pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Service unit names: `[A-Za-z0-9@._:-]+`.
pub(crate) fn validate_service_name(name: &str) -> Result<(), EngineError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '_' | ':' | '-'));
    if valid {
        Ok(())
    } else {
        Err(EngineError::Validation(format!(
            "invalid service name '{}'",
            name
        )))
    }
}

/// Truncate to at most `max` characters without splitting one.
pub(crate) fn truncate_chars(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((idx, _)) => value[..idx].to_string(),
        None => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("$(rm -rf /)"), "'$(rm -rf /)'");
    }

    #[test]
    fn test_service_name_validation() {
        assert!(validate_service_name("nginx").is_ok());
        assert!(validate_service_name("getty@tty1.service").is_ok());
        assert!(validate_service_name("").is_err());
        assert!(validate_service_name("nginx; reboot").is_err());
        assert!(validate_service_name("a b").is_err());
    }

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("abcdef", 3), "abc");
        assert_eq!(truncate_chars("ab", 3), "ab");
        assert_eq!(truncate_chars("héllo", 2), "hé");
    }
}

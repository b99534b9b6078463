//! Retry classification and exponential backoff
//!
//! Classification is table-driven: SQLSTATE codes (exact or two-character
//! class) map to a verdict, and errors without a usable code fall back to a
//! keyword scan of the message. The built-in table is assembled once; extra
//! entries come from `RetryTableConfig` at startup.

use std::collections::HashMap;
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::config::RetryTableConfig;
use crate::error::StoreError;

/// Outcome of classifying a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    /// Transient infrastructure trouble; safe to run the unit of work again
    Retryable,
    /// Caller or schema problem; surface immediately
    Permanent,
}

impl Verdict {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable)
    }
}

/// SQLSTATE code or class, verdict, and the condition name for logs
const BUILTIN_CODES: &[(&str, Verdict, &str)] = &[
    ("40001", Verdict::Retryable, "serialization_failure"),
    ("40P01", Verdict::Retryable, "deadlock_detected"),
    ("53000", Verdict::Retryable, "insufficient_resources"),
    ("53100", Verdict::Retryable, "disk_full"),
    ("53200", Verdict::Retryable, "out_of_memory"),
    ("53300", Verdict::Retryable, "too_many_connections"),
    ("08000", Verdict::Retryable, "connection_exception"),
    ("08001", Verdict::Retryable, "sqlclient_unable_to_establish_sqlconnection"),
    ("08003", Verdict::Retryable, "connection_does_not_exist"),
    ("08004", Verdict::Retryable, "sqlserver_rejected_establishment_of_sqlconnection"),
    ("08006", Verdict::Retryable, "connection_failure"),
    ("57P01", Verdict::Retryable, "admin_shutdown"),
    ("57P02", Verdict::Retryable, "crash_shutdown"),
    ("57P03", Verdict::Retryable, "cannot_connect_now"),
    ("42", Verdict::Permanent, "syntax_error_or_access_rule_violation"),
    ("23", Verdict::Permanent, "integrity_constraint_violation"),
    ("22", Verdict::Permanent, "data_exception"),
];

const BUILTIN_KEYWORDS: &[&str] = &[
    "connection",
    "timeout",
    "deadlock",
    "serialization",
    "resource",
    "memory",
    "disk",
    "shutdown",
    "network",
    "temporary",
];

static BUILTIN: Lazy<RetryPolicy> = Lazy::new(|| {
    let mut policy = RetryPolicy {
        exact: HashMap::new(),
        classes: HashMap::new(),
        keywords: Vec::new(),
    };
    for (code, verdict, _) in BUILTIN_CODES {
        policy.insert(code, *verdict);
    }
    policy.keywords = BUILTIN_KEYWORDS.iter().map(|k| k.to_string()).collect();
    policy
});

/// Condition name for a built-in SQLSTATE code or class, for log fields.
pub fn condition_name(code: &str) -> Option<&'static str> {
    let code = code.to_ascii_uppercase();
    BUILTIN_CODES
        .iter()
        .find(|(c, _, _)| *c == code)
        .or_else(|| BUILTIN_CODES.iter().find(|(c, _, _)| Some(*c) == code.get(..2)))
        .map(|(_, _, name)| *name)
}

/// SQLSTATE of a driver error, when it carries one.
pub fn sqlstate(err: &StoreError) -> Option<String> {
    match err {
        StoreError::Database(sqlx::Error::Database(db)) => db.code().map(|c| c.into_owned()),
        _ => None,
    }
}

/// Retryable/permanent lookup table
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    exact: HashMap<String, Verdict>,
    classes: HashMap<String, Verdict>,
    keywords: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        BUILTIN.clone()
    }
}

impl RetryPolicy {
    /// Built-in table extended with configured entries. Configured codes
    /// override built-in ones.
    pub fn from_config(config: &RetryTableConfig) -> Self {
        let mut policy = Self::default();
        for code in &config.retryable_codes {
            policy.insert(code, Verdict::Retryable);
        }
        for code in &config.permanent_codes {
            policy.insert(code, Verdict::Permanent);
        }
        for keyword in &config.retryable_keywords {
            let keyword = keyword.to_ascii_lowercase();
            if !keyword.is_empty() && !policy.keywords.contains(&keyword) {
                policy.keywords.push(keyword);
            }
        }
        policy
    }

    fn insert(&mut self, code: &str, verdict: Verdict) {
        let code = code.trim().to_ascii_uppercase();
        match code.len() {
            2 => {
                self.classes.insert(code, verdict);
            }
            5 => {
                self.exact.insert(code, verdict);
            }
            _ => tracing::warn!(code = %code, "ignoring malformed SQLSTATE in retry table"),
        }
    }

    /// Classify from a SQLSTATE (if the driver exposed one) and a message.
    ///
    /// Exact codes win over classes; an unknown or missing code falls back
    /// to the keyword scan.
    pub fn classify_parts(&self, code: Option<&str>, message: &str) -> Verdict {
        if let Some(code) = code {
            let code = code.to_ascii_uppercase();
            if let Some(verdict) = self.exact.get(&code) {
                return *verdict;
            }
            if let Some(verdict) = code.get(..2).and_then(|class| self.classes.get(class)) {
                return *verdict;
            }
        }
        self.classify_message(message)
    }

    fn classify_message(&self, message: &str) -> Verdict {
        let message = message.to_ascii_lowercase();
        if self.keywords.iter().any(|k| message.contains(k.as_str())) {
            Verdict::Retryable
        } else {
            Verdict::Permanent
        }
    }

    /// Classify a store error. Pure: the same error always yields the same verdict.
    pub fn classify(&self, err: &StoreError) -> Verdict {
        match err {
            StoreError::NotFound { .. }
            | StoreError::StateTransition { .. }
            | StoreError::Validation(_)
            | StoreError::Json(_)
            | StoreError::Migrate(_)
            | StoreError::Processing { .. } => Verdict::Permanent,
            StoreError::PoolExhausted { .. } | StoreError::Timeout { .. } => Verdict::Retryable,
            StoreError::Database(e) => self.classify_sqlx(e),
        }
    }

    fn classify_sqlx(&self, err: &sqlx::Error) -> Verdict {
        match err {
            sqlx::Error::Database(db) => {
                let code = db.code();
                self.classify_parts(code.as_deref(), db.message())
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
                Verdict::Retryable
            }
            sqlx::Error::PoolClosed
            | sqlx::Error::RowNotFound
            | sqlx::Error::Configuration(_)
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::ColumnIndexOutOfBounds { .. }
            | sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::TypeNotFound { .. } => Verdict::Permanent,
            other => self.classify_message(&other.to_string()),
        }
    }
}

/// Exponential backoff schedule
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl Backoff {
    /// Delay before retry number `attempt` (counted from 1):
    /// `base * multiplier^(attempt - 1)`, capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        let cap = self.max.as_secs_f64();
        if !secs.is_finite() || secs >= cap {
            self.max
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_codes() {
        let policy = RetryPolicy::default();
        let cases = [
            ("40001", Verdict::Retryable),
            ("40P01", Verdict::Retryable),
            ("53300", Verdict::Retryable),
            ("08006", Verdict::Retryable),
            ("57P01", Verdict::Retryable),
            ("57P03", Verdict::Retryable),
            ("42601", Verdict::Permanent), // syntax_error
            ("42P01", Verdict::Permanent), // undefined_table
            ("42501", Verdict::Permanent), // insufficient_privilege
            ("23505", Verdict::Permanent), // unique_violation
            ("23503", Verdict::Permanent), // foreign_key_violation
            ("22P02", Verdict::Permanent), // invalid_text_representation
        ];
        for (code, expected) in cases {
            assert_eq!(
                policy.classify_parts(Some(code), "irrelevant"),
                expected,
                "code {code}"
            );
        }
    }

    #[test]
    fn code_beats_keywords() {
        let policy = RetryPolicy::default();
        // message mentions "connection" but the class is permanent
        assert_eq!(
            policy.classify_parts(Some("42501"), "permission denied for table connection_log"),
            Verdict::Permanent
        );
    }

    #[test]
    fn keyword_fallback() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.classify_parts(None, "Connection reset by peer"),
            Verdict::Retryable
        );
        assert_eq!(
            policy.classify_parts(None, "could not serialize access due to concurrent update (serialization)"),
            Verdict::Retryable
        );
        assert_eq!(
            policy.classify_parts(None, "column \"foo\" does not exist"),
            Verdict::Permanent
        );
        // unknown code: statement timeout (57014) is caught by the keyword scan
        assert_eq!(
            policy.classify_parts(Some("57014"), "canceling statement due to statement timeout"),
            Verdict::Retryable
        );
    }

    #[test]
    fn configured_overrides() {
        let policy = RetryPolicy::from_config(&RetryTableConfig {
            retryable_codes: vec!["55p03".into()],
            permanent_codes: vec!["40P01".into(), "nonsense".into()],
            retryable_keywords: vec!["Try Again".into()],
        });
        assert_eq!(policy.classify_parts(Some("55P03"), ""), Verdict::Retryable);
        assert_eq!(policy.classify_parts(Some("40P01"), ""), Verdict::Permanent);
        assert_eq!(
            policy.classify_parts(None, "server says: try again later"),
            Verdict::Retryable
        );
        // the built-in table is untouched
        assert_eq!(
            RetryPolicy::default().classify_parts(Some("40P01"), ""),
            Verdict::Retryable
        );
    }

    #[test]
    fn store_errors() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.classify(&StoreError::not_found("a1")),
            Verdict::Permanent
        );
        assert_eq!(
            policy.classify(&StoreError::transition("a1", "version mismatch")),
            Verdict::Permanent
        );
        assert_eq!(
            policy.classify(&StoreError::PoolExhausted {
                waited: Duration::from_secs(5)
            }),
            Verdict::Retryable
        );
        assert_eq!(
            policy.classify(&StoreError::Database(sqlx::Error::PoolTimedOut)),
            Verdict::Retryable
        );
        assert_eq!(
            policy.classify(&StoreError::Database(sqlx::Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset"
            )))),
            Verdict::Retryable
        );
        assert_eq!(
            policy.classify(&StoreError::Database(sqlx::Error::RowNotFound)),
            Verdict::Permanent
        );
        assert_eq!(
            policy.classify(&StoreError::Database(sqlx::Error::PoolClosed)),
            Verdict::Permanent
        );
        assert_eq!(
            policy.classify(&StoreError::Database(sqlx::Error::Protocol(
                "unexpected network hiccup".into()
            ))),
            Verdict::Retryable
        );
    }

    #[test]
    fn condition_names() {
        assert_eq!(condition_name("40p01"), Some("deadlock_detected"));
        assert_eq!(condition_name("23505"), Some("integrity_constraint_violation"));
        assert_eq!(condition_name("XX000"), None);
        assert_eq!(sqlstate(&StoreError::not_found("a1")), None);
    }

    #[test]
    fn backoff_schedule() {
        let backoff = Backoff {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_secs(10),
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(20), Duration::from_secs(10));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(10));
        // attempt 0 is treated like the first retry
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
    }

    #[test]
    fn flat_backoff() {
        let backoff = Backoff {
            base: Duration::from_millis(50),
            multiplier: 1.0,
            max: Duration::from_secs(1),
        };
        assert_eq!(backoff.delay(1), backoff.delay(7));
    }
}

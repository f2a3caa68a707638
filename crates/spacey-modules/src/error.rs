// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Error types for the module engine

use crate::key::ModuleKey;
use crate::record::ModuleState;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for module engine operations
pub type Result<T> = std::result::Result<T, ModuleError>;

/// Errors produced by the specifier resolver
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    /// No candidate path matched
    #[error("Cannot find module '{specifier}' (tried {})", describe_tried(.tried))]
    NotFound {
        /// The specifier as written by the importer
        specifier: String,
        /// Module that requested the specifier
        referrer: Option<ModuleKey>,
        /// Every candidate path that was probed
        tried: Vec<String>,
    },

    /// Two alias entries match with the same specificity
    #[error("Ambiguous alias for '{specifier}': {}", .prefixes.join(", "))]
    AmbiguousAlias {
        /// The specifier as written by the importer
        specifier: String,
        /// Alias entries that matched
        prefixes: Vec<String>,
    },
}

/// Failure taxonomy shared by every load error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Specifier could not be resolved
    Resolution,
    /// An attempt did not finish before its deadline
    Timeout,
    /// Network-class error from the source
    Transient,
    /// Malformed module, missing file, evaluation error
    Permanent,
    /// Circuit breaker rejected the call
    CircuitOpen,
    /// Every alternative of a fallback chain failed
    Aggregate,
    /// Module loaded but failed a compatibility check
    Incompatible,
    /// Every waiter gave up on the load
    Cancelled,
    /// Engine invariant violated
    Internal,
}

impl FailureKind {
    /// Whether another attempt may succeed
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureKind::Timeout | FailureKind::Transient)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Resolution => "ResolutionError",
            FailureKind::Timeout => "TimeoutFailure",
            FailureKind::Transient => "TransientFailure",
            FailureKind::Permanent => "PermanentFailure",
            FailureKind::CircuitOpen => "CircuitOpenError",
            FailureKind::Aggregate => "AggregateFailure",
            FailureKind::Incompatible => "IncompatibleModule",
            FailureKind::Cancelled => "Cancelled",
            FailureKind::Internal => "InternalError",
        };
        f.write_str(name)
    }
}

/// One failed fetch attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    /// 1-based attempt number
    pub attempt: u32,
    /// What went wrong
    pub kind: FailureKind,
    /// Error message from the source or evaluator
    pub message: String,
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "attempt {}: {} ({})", self.attempt, self.message, self.kind)
    }
}

/// Errors surfaced by the module engine.
///
/// Cloneable because a single load task settles every coalesced waiter with
/// the same value.
#[derive(Debug, Clone, Error)]
pub enum ModuleError {
    /// Specifier resolution failed (never retried)
    #[error("Error resolving module '{specifier}': {source}")]
    Resolution {
        /// The specifier as written by the importer
        specifier: String,
        /// Underlying resolver error
        source: ResolutionError,
    },

    /// Every attempt timed out
    #[error("Module '{key}' timed out after {} attempt(s)", .attempts.len())]
    Timeout {
        /// Module key
        key: ModuleKey,
        /// Attempt log
        attempts: Vec<AttemptFailure>,
    },

    /// Retry budget exhausted on network-class errors
    #[error("Module '{key}' failed after {} attempt(s): {}", .attempts.len(), last_message(.attempts))]
    Transient {
        /// Module key
        key: ModuleKey,
        /// Attempt log
        attempts: Vec<AttemptFailure>,
    },

    /// Non-retryable failure
    #[error("Module '{key}' failed: {message}")]
    Permanent {
        /// Module key
        key: ModuleKey,
        /// Reason for failure
        message: String,
        /// Attempt log (empty for evaluation errors)
        attempts: Vec<AttemptFailure>,
    },

    /// Circuit breaker is open for the key
    #[error("Circuit breaker open for '{key}', retry in {retry_after:?}")]
    CircuitOpen {
        /// Module key
        key: ModuleKey,
        /// Time until the breaker lets a probe through
        retry_after: Duration,
    },

    /// A fallback chain ran out of alternatives
    #[error("All {} alternative(s) failed", .errors.len())]
    Aggregate {
        /// Error of each alternative, in the order they were tried
        errors: Vec<ModuleError>,
    },

    /// A static dependency failed, so the importer cannot evaluate
    #[error("Module '{key}' failed because '{dependency}' failed: {source}")]
    Dependency {
        /// Importing module
        key: ModuleKey,
        /// Dependency that failed
        dependency: ModuleKey,
        /// The dependency's error
        source: Box<ModuleError>,
    },

    /// Module loaded but was rejected by a compatibility check
    #[error("Module '{key}' is not compatible: {reason}")]
    Incompatible {
        /// Module key
        key: ModuleKey,
        /// Reason given by the check
        reason: String,
    },

    /// The last waiter cancelled the load
    #[error("Loading of '{key}' was cancelled")]
    Cancelled {
        /// Module key
        key: ModuleKey,
    },

    /// Illegal state transition
    #[error("Invalid state transition for '{key}': {from:?} -> {to:?}")]
    State {
        /// Module key
        key: ModuleKey,
        /// Current state
        from: ModuleState,
        /// Requested state
        to: ModuleState,
    },
}

impl ModuleError {
    /// Taxonomy kind of this error
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Resolution { .. } => FailureKind::Resolution,
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::Transient { .. } => FailureKind::Transient,
            Self::Permanent { .. } => FailureKind::Permanent,
            Self::CircuitOpen { .. } => FailureKind::CircuitOpen,
            Self::Aggregate { .. } => FailureKind::Aggregate,
            Self::Dependency { source, .. } => source.kind(),
            Self::Incompatible { .. } => FailureKind::Incompatible,
            Self::Cancelled { .. } => FailureKind::Cancelled,
            Self::State { .. } => FailureKind::Internal,
        }
    }

    /// Key of the module this error is about, when there is one
    pub fn key(&self) -> Option<&ModuleKey> {
        match self {
            Self::Timeout { key, .. }
            | Self::Transient { key, .. }
            | Self::Permanent { key, .. }
            | Self::CircuitOpen { key, .. }
            | Self::Dependency { key, .. }
            | Self::Incompatible { key, .. }
            | Self::Cancelled { key }
            | Self::State { key, .. } => Some(key),
            Self::Resolution { .. } | Self::Aggregate { .. } => None,
        }
    }

    /// Attempt log for fetch failures
    pub fn attempts(&self) -> &[AttemptFailure] {
        match self {
            Self::Timeout { attempts, .. }
            | Self::Transient { attempts, .. }
            | Self::Permanent { attempts, .. } => attempts,
            _ => &[],
        }
    }

    /// Alternatives tried by a fallback chain
    pub fn alternatives(&self) -> &[ModuleError] {
        match self {
            Self::Aggregate { errors } => errors,
            _ => &[],
        }
    }

    /// Create a permanent failure with no attempt log
    pub fn permanent(key: ModuleKey, message: impl Into<String>) -> Self {
        Self::Permanent {
            key,
            message: message.into(),
            attempts: Vec::new(),
        }
    }
}

/// Errors from the write side of an export binding
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindingError {
    /// The owning record has been torn down
    #[error("Module '{0}' is no longer loaded")]
    Detached(ModuleKey),

    /// Writing a name the module never defined
    #[error("Module '{key}' has no export named '{name}'")]
    UnknownExport {
        /// Owning module
        key: ModuleKey,
        /// Export name
        name: String,
    },

    /// Writing through a re-export
    #[error("Export '{name}' of '{key}' is a re-export and cannot be written")]
    NotOwned {
        /// Re-exporting module
        key: ModuleKey,
        /// Export name
        name: String,
    },
}

/// Errors raised by a module evaluator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    /// Source could not be parsed
    #[error("SyntaxError: {message} (line {line})")]
    Syntax {
        /// 1-based line number
        line: usize,
        /// Description
        message: String,
    },

    /// Module body failed while running
    #[error("{0}")]
    Runtime(String),
}

impl From<BindingError> for EvalError {
    fn from(err: BindingError) -> Self {
        EvalError::Runtime(err.to_string())
    }
}

/// Errors while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading the config file failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The config file is not valid TOML for [`crate::Config`]
    #[error("Invalid config file: {0}")]
    Toml(#[from] toml::de::Error),

    /// A key/value override could not be applied
    #[error("Invalid value '{value}' for config key '{key}'")]
    Invalid {
        /// Config key
        key: String,
        /// Rejected value
        value: String,
    },
}

fn describe_tried(tried: &[String]) -> String {
    if tried.is_empty() {
        "no candidates".to_string()
    } else {
        tried.join(", ")
    }
}

fn last_message(attempts: &[AttemptFailure]) -> &str {
    attempts.last().map(|a| a.message.as_str()).unwrap_or("unknown error")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(FailureKind::Timeout.is_retryable());
        assert!(FailureKind::Transient.is_retryable());
        assert!(!FailureKind::Permanent.is_retryable());
        assert!(!FailureKind::Resolution.is_retryable());
        assert!(!FailureKind::CircuitOpen.is_retryable());
    }

    #[test]
    fn test_dependency_error_kind() {
        let inner = ModuleError::Transient {
            key: ModuleKey::new("/b.js"),
            attempts: vec![AttemptFailure {
                attempt: 1,
                kind: FailureKind::Transient,
                message: "connection reset".into(),
            }],
        };
        let err = ModuleError::Dependency {
            key: ModuleKey::new("/a.js"),
            dependency: ModuleKey::new("/b.js"),
            source: Box::new(inner),
        };
        assert_eq!(err.kind(), FailureKind::Transient);
        assert_eq!(err.key().map(|k| k.as_str()), Some("/a.js"));
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn test_not_found_message() {
        let err = ResolutionError::NotFound {
            specifier: "./a".into(),
            referrer: None,
            tried: vec!["/a".into(), "/a.js".into()],
        };
        assert_eq!(err.to_string(), "Cannot find module './a' (tried /a, /a.js)");
    }
}

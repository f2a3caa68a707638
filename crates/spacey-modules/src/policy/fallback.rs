// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Fallback chains and graceful degradation

use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::binding::Namespace;
use crate::error::ModuleError;

type CompatibilityCheck = Arc<dyn Fn(&Namespace) -> Result<(), String> + Send + Sync>;

/// Ordered alternatives for one import; the first that loads wins
#[derive(Clone)]
pub struct FallbackChain {
    specifiers: Vec<String>,
    check: Option<CompatibilityCheck>,
}

impl FallbackChain {
    /// Create a chain from specifiers, in preference order
    pub fn new<I, S>(specifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            specifiers: specifiers.into_iter().map(Into::into).collect(),
            check: None,
        }
    }

    /// Reject loaded alternatives that fail `check`.
    ///
    /// Used for version downgrades: list `v3`, `v2`, `v1` and check the
    /// exported API; an incompatible module counts as a failed alternative.
    pub fn with_check<F>(mut self, check: F) -> Self
    where
        F: Fn(&Namespace) -> Result<(), String> + Send + Sync + 'static,
    {
        self.check = Some(Arc::new(check));
        self
    }

    /// Specifiers in preference order
    pub fn specifiers(&self) -> &[String] {
        &self.specifiers
    }

    /// Whether there are no alternatives
    pub fn is_empty(&self) -> bool {
        self.specifiers.is_empty()
    }

    /// Run the compatibility check on a loaded alternative
    pub(crate) fn accept(&self, namespace: &Namespace) -> Result<(), ModuleError> {
        match &self.check {
            Some(check) => check(namespace).map_err(|reason| ModuleError::Incompatible {
                key: namespace.key().clone(),
                reason,
            }),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for FallbackChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackChain")
            .field("specifiers", &self.specifiers)
            .field("checked", &self.check.is_some())
            .finish()
    }
}

/// Result of an import that may fall back to a substitute value
#[derive(Debug, Clone)]
pub enum Degradable {
    /// The module loaded
    Loaded(Namespace),
    /// The module failed; `fallback` stands in for it
    Degraded {
        /// Substitute value produced by the caller
        fallback: Value,
        /// Why the module could not be used
        cause: ModuleError,
    },
}

impl Degradable {
    /// Whether the fallback was used
    pub fn is_degraded(&self) -> bool {
        matches!(self, Degradable::Degraded { .. })
    }

    /// Namespace of a loaded module
    pub fn namespace(&self) -> Option<&Namespace> {
        match self {
            Degradable::Loaded(ns) => Some(ns),
            Degradable::Degraded { .. } => None,
        }
    }

    /// Error that caused degradation
    pub fn cause(&self) -> Option<&ModuleError> {
        match self {
            Degradable::Loaded(_) => None,
            Degradable::Degraded { cause, .. } => Some(cause),
        }
    }

    /// Default export of the module, or the fallback value
    pub fn value(&self) -> Option<Value> {
        match self {
            Degradable::Loaded(ns) => ns.get("default"),
            Degradable::Degraded { fallback, .. } => Some(fallback.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ModuleKey;
    use serde_json::json;

    #[test]
    fn test_chain_specifiers() {
        let chain = FallbackChain::new(["./v3.js", "./v2.js"]);
        assert_eq!(chain.specifiers(), &["./v3.js".to_string(), "./v2.js".to_string()]);
        assert!(!chain.is_empty());
        assert!(format!("{:?}", chain).contains("checked: false"));
    }

    #[test]
    fn test_degraded_accessors() {
        let degraded = Degradable::Degraded {
            fallback: json!({"theme": "plain"}),
            cause: ModuleError::Cancelled {
                key: ModuleKey::new("/theme.js"),
            },
        };
        assert!(degraded.is_degraded());
        assert!(degraded.namespace().is_none());
        assert_eq!(degraded.value(), Some(json!({"theme": "plain"})));
        assert!(degraded.cause().is_some());
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! # spacey-modules
//!
//! The module loading engine of the Spacey runtime.
//!
//! This crate turns import specifiers into evaluated modules with live
//! bindings, including:
//!
//! - Specifier resolution with alias maps and extension probing
//! - A registry holding one record per canonical module key
//! - Dependency graphs with cycle-tolerant initialization order
//! - Coalesced loads with timeouts, retry backoff and priority scheduling
//! - Circuit breaking, fallback chains and graceful degradation
//! - Live export bindings that survive hot reload
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use spacey_modules::{Config, FsSource, ModuleSystem, ScriptEvaluator};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let system = ModuleSystem::new(
//!         Config::load(None)?,
//!         Arc::new(FsSource::new("./app")),
//!         Arc::new(ScriptEvaluator::new()),
//!     );
//!     let main = system.import("./main.js", None).await?;
//!     println!("{:?}", main.get("default"));
//!     Ok(())
//! }
//! ```
//!
//! ## Hot Reload
//!
//! Invalidation keeps a module's export cells in place, so importers holding
//! a [`Namespace`] see the new values once the module is loaded again:
//!
//! ```rust,ignore
//! system.on_invalidate(None, |inv| println!("{} -> v{}", inv.key, inv.version));
//! system.reload(&ModuleKey::new("/theme.js")).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod binding;
pub mod config;
pub mod error;
pub mod events;
pub mod graph;
pub mod host;
pub mod key;
pub mod loader;
pub mod policy;
pub mod record;
pub mod registry;
pub mod resolver;
pub mod script;
pub mod system;

// Re-exports
pub use binding::{BindingValue, ExportWriter, ImportedBinding, Namespace};
pub use config::Config;
pub use error::{BindingError, EvalError, FailureKind, ModuleError, ResolutionError, Result};
pub use events::StateEvent;
pub use graph::{DependencyGraph, EdgeKind, InitStep};
pub use host::{Clock, FsSource, MemorySource, ModuleSource, PathProbe, SourceError, TokioClock};
pub use key::{ModuleKey, ModuleKind};
pub use loader::{LoadOptions, LoadStats};
pub use policy::{CircuitState, Degradable, FallbackChain};
pub use record::{ModuleState, RecordSnapshot};
pub use registry::{Invalidation, ListenerId};
pub use resolver::SpecifierResolver;
pub use script::{EvalContext, ModuleEvaluator, ParsedModule, ScriptEvaluator};
pub use system::ModuleSystem;

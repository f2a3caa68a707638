// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Failure policies layered over the loader
//!
//! - [`CircuitBreaker`]: stop calling a source that keeps failing
//! - [`FallbackChain`]: try alternatives in order
//! - [`Degradable`]: substitute a value when an import fails, visibly

mod breaker;
mod fallback;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use fallback::{Degradable, FallbackChain};

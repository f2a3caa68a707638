// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Canonical module keys and import kinds

use crate::graph::EdgeKind;
use std::fmt;
use std::sync::Arc;

/// Canonical, resolved identifier of a module.
///
/// Keys are normalized absolute paths (`/src/app/main.js`). They are produced
/// by the resolver and never change afterwards, so cloning one is a pointer
/// copy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleKey(Arc<str>);

impl ModuleKey {
    /// Create a key from an already-normalized path
    pub fn new(path: impl AsRef<str>) -> Self {
        Self(Arc::from(path.as_ref()))
    }

    /// The key as a path string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Directory part of the key, without a trailing slash (`/` for root files)
    pub fn dir(&self) -> &str {
        match self.0.rfind('/') {
            Some(0) => "/",
            Some(pos) => &self.0[..pos],
            None => ".",
        }
    }

    /// File name part of the key
    pub fn file_name(&self) -> &str {
        match self.0.rfind('/') {
            Some(pos) => &self.0[pos + 1..],
            None => &self.0,
        }
    }

    /// Extension of the file name including the dot (`.js`)
    pub fn extension(&self) -> Option<&str> {
        let name = self.file_name();
        match name.rfind('.') {
            Some(0) | None => None,
            Some(pos) => Some(&name[pos..]),
        }
    }
}

impl fmt::Display for ModuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModuleKey {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

/// How a module is requested by its importer.
///
/// The kind is fixed when the import is parsed and decides how the engine
/// links the target; nothing is probed at call time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleKind {
    /// `import x from './x.js'`
    Static,
    /// `import('./x.js')`
    Dynamic,
    /// `new Worker('./x.js', { type: 'module' })`
    Worker,
}

/// Capabilities required by a [`ModuleKind`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// The target is fetched and linked before the importer evaluates
    pub links_eagerly: bool,
    /// The importer cannot evaluate until the target is ready
    pub blocks_evaluation: bool,
    /// The target's bindings are visible in the importer's scope
    pub shares_scope: bool,
}

impl ModuleKind {
    /// Capability set for this kind
    pub const fn capabilities(self) -> Capabilities {
        match self {
            ModuleKind::Static => Capabilities {
                links_eagerly: true,
                blocks_evaluation: true,
                shares_scope: true,
            },
            ModuleKind::Dynamic => Capabilities {
                links_eagerly: false,
                blocks_evaluation: false,
                shares_scope: true,
            },
            ModuleKind::Worker => Capabilities {
                links_eagerly: false,
                blocks_evaluation: false,
                shares_scope: false,
            },
        }
    }

    /// Dependency edge kind recorded for this import
    pub const fn edge_kind(self) -> EdgeKind {
        if self.capabilities().links_eagerly {
            EdgeKind::Static
        } else {
            EdgeKind::Dynamic
        }
    }
}

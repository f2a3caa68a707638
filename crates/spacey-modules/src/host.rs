// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Host collaborators: path probing, module sources and time.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::key::ModuleKey;

/// Answers whether a candidate path exists
pub trait PathProbe: Send + Sync {
    /// Whether `path` names a loadable module
    fn exists(&self, path: &str) -> bool;
}

impl<F> PathProbe for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn exists(&self, path: &str) -> bool {
        self(path)
    }
}

/// Whether a source error is worth retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceErrorKind {
    /// Network-class error, retried
    Transient,
    /// Missing or unreadable module, never retried
    Permanent,
}

/// Error returned by a [`ModuleSource`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct SourceError {
    /// Retry classification
    pub kind: SourceErrorKind,
    /// Description
    pub message: String,
}

impl SourceError {
    /// A retryable error
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: SourceErrorKind::Transient,
            message: message.into(),
        }
    }

    /// A non-retryable error
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: SourceErrorKind::Permanent,
            message: message.into(),
        }
    }
}

impl From<io::Error> for SourceError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound
            | io::ErrorKind::InvalidData
            | io::ErrorKind::PermissionDenied => SourceError::permanent(err.to_string()),
            _ => SourceError::transient(err.to_string()),
        }
    }
}

/// Where module text comes from
#[async_trait]
pub trait ModuleSource: PathProbe {
    /// Read the text of a resolved module
    async fn read(&self, key: &ModuleKey) -> Result<String, SourceError>;
}

/// Time source for timeouts, backoff and the circuit breaker
pub trait Clock: Send + Sync {
    /// Current instant
    fn now(&self) -> Instant;

    /// Complete after `duration`
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Clock backed by tokio's timer (follows paused test time)
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Module source reading files under a root directory.
///
/// Keys are mapped onto the root, so `/src/main.js` reads
/// `<root>/src/main.js`.
#[derive(Debug, Clone)]
pub struct FsSource {
    root: PathBuf,
}

impl FsSource {
    /// Create a source rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path of a key or candidate path
    pub fn path_of(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    /// Key of a filesystem path under the root
    pub fn key_of(&self, path: &Path) -> Option<ModuleKey> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(ModuleKey::new(format!("/{}", parts.join("/"))))
    }
}

impl PathProbe for FsSource {
    fn exists(&self, path: &str) -> bool {
        self.path_of(path).is_file()
    }
}

#[async_trait]
impl ModuleSource for FsSource {
    async fn read(&self, key: &ModuleKey) -> Result<String, SourceError> {
        let path = self.path_of(key.as_str());
        tracing::debug!("Reading {}", path.display());
        Ok(tokio::fs::read_to_string(&path).await?)
    }
}

/// In-memory module source
#[derive(Debug, Default)]
pub struct MemorySource {
    modules: DashMap<String, String>,
    reads: AtomicUsize,
}

impl MemorySource {
    /// Create an empty source
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a source from `(path, text)` pairs
    pub fn with_modules<I, P, S>(modules: I) -> Self
    where
        I: IntoIterator<Item = (P, S)>,
        P: Into<String>,
        S: Into<String>,
    {
        let source = Self::new();
        for (path, text) in modules {
            source.insert(path, text);
        }
        source
    }

    /// Add or replace a module
    pub fn insert(&self, path: impl Into<String>, text: impl Into<String>) {
        self.modules.insert(path.into(), text.into());
    }

    /// Remove a module
    pub fn remove(&self, path: &str) -> Option<String> {
        self.modules.remove(path).map(|(_, text)| text)
    }

    /// Number of reads served so far
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }
}

impl PathProbe for MemorySource {
    fn exists(&self, path: &str) -> bool {
        self.modules.contains_key(path)
    }
}

#[async_trait]
impl ModuleSource for MemorySource {
    async fn read(&self, key: &ModuleKey) -> Result<String, SourceError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.modules
            .get(key.as_str())
            .map(|text| text.value().clone())
            .ok_or_else(|| SourceError::permanent(format!("No such module: {}", key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_classification() {
        let missing: SourceError = io::Error::from(io::ErrorKind::NotFound).into();
        assert_eq!(missing.kind, SourceErrorKind::Permanent);

        let reset: SourceError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert_eq!(reset.kind, SourceErrorKind::Transient);
    }

    #[tokio::test]
    async fn test_fs_source() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/main.js"), "export const x = 1;").unwrap();

        let source = FsSource::new(dir.path());
        assert!(source.exists("/src/main.js"));
        assert!(!source.exists("/src"));
        assert!(!source.exists("/src/other.js"));

        let key = ModuleKey::new("/src/main.js");
        assert_eq!(source.read(&key).await.unwrap(), "export const x = 1;");
        assert_eq!(
            source.key_of(&dir.path().join("src/main.js")),
            Some(key)
        );

        let err = source.read(&ModuleKey::new("/nope.js")).await.unwrap_err();
        assert_eq!(err.kind, SourceErrorKind::Permanent);
    }

    #[tokio::test]
    async fn test_memory_source() {
        let source = MemorySource::with_modules([("/a.js", "export default 1;")]);
        assert!(source.exists("/a.js"));
        assert_eq!(
            source.read(&ModuleKey::new("/a.js")).await.unwrap(),
            "export default 1;"
        );
        assert!(source.read(&ModuleKey::new("/b.js")).await.is_err());
        assert_eq!(source.read_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_paused_time() {
        let clock = TokioClock;
        let start = clock.now();
        clock.sleep(Duration::from_secs(30)).await;
        assert!(clock.now() - start >= Duration::from_secs(30));
    }
}

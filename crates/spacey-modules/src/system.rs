// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Module system facade
//!
//! Ties the resolver, registry, graph, loader and failure policies together.
//! An import runs in three phases:
//!
//! 1. resolve the specifier and fetch the root module,
//! 2. walk its static imports, fetching each level concurrently and
//!    recording edges in the graph,
//! 3. evaluate the graph's initialization order synchronously.

use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::binding::Namespace;
use crate::config::Config;
use crate::error::{ModuleError, Result};
use crate::events::{EventBus, StateEvent};
use crate::graph::{DependencyGraph, EdgeKind};
use crate::host::{Clock, ModuleSource, PathProbe, TokioClock};
use crate::key::{ModuleKey, ModuleKind};
use crate::loader::{LoadOptions, LoadStats, LoaderEngine};
use crate::policy::{CircuitBreaker, CircuitState, Degradable, FallbackChain};
use crate::record::{LinkedImport, ModuleRecord, ModuleState, RecordSnapshot};
use crate::registry::{Invalidation, ListenerId, Registry};
use crate::resolver::{ResolvedModule, SpecifierResolver};
use crate::script::ModuleEvaluator;

/// Probes paths through the module source
struct SourceProbe<'a>(&'a dyn ModuleSource);

impl PathProbe for SourceProbe<'_> {
    fn exists(&self, path: &str) -> bool {
        self.0.exists(path)
    }
}

/// The module loading engine
pub struct ModuleSystem {
    config: Config,
    resolver: SpecifierResolver,
    registry: Arc<Registry>,
    graph: Arc<DependencyGraph>,
    loader: LoaderEngine,
    source: Arc<dyn ModuleSource>,
    events: Arc<EventBus>,
    /// Serializes evaluation passes
    eval_lock: Mutex<()>,
}

impl ModuleSystem {
    /// Create a module system on tokio's clock
    pub fn new(
        config: Config,
        source: Arc<dyn ModuleSource>,
        evaluator: Arc<dyn ModuleEvaluator>,
    ) -> Self {
        Self::with_clock(config, source, evaluator, Arc::new(TokioClock))
    }

    /// Create a module system with an explicit clock
    pub fn with_clock(
        config: Config,
        source: Arc<dyn ModuleSource>,
        evaluator: Arc<dyn ModuleEvaluator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let events = Arc::new(EventBus::new());
        let registry = Arc::new(Registry::new(events.clone()));
        let breaker = Arc::new(CircuitBreaker::new(config.breaker_config()));
        let loader = LoaderEngine::new(
            registry.clone(),
            source.clone(),
            evaluator,
            clock,
            breaker,
            config.load.max_concurrent,
        );

        Self {
            resolver: SpecifierResolver::new(config.resolve.clone()),
            config,
            registry,
            graph: Arc::new(DependencyGraph::new()),
            loader,
            source,
            events,
            eval_lock: Mutex::new(()),
        }
    }

    /// Configuration in effect
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Load options built from the configuration
    pub fn default_options(&self) -> LoadOptions {
        self.config.load_options()
    }

    /// Resolve a specifier without loading it
    pub fn resolve(&self, specifier: &str, from: Option<&ModuleKey>) -> Result<ModuleKey> {
        self.resolve_module(specifier, from, None)
            .map(|resolved| resolved.key)
    }

    /// Resolve a specifier and its module type tag
    pub fn resolve_module(
        &self,
        specifier: &str,
        from: Option<&ModuleKey>,
        type_attribute: Option<&str>,
    ) -> Result<ResolvedModule> {
        let probe = SourceProbe(self.source.as_ref());
        self.resolver
            .resolve_module(specifier, from, type_attribute, &probe)
            .map_err(|source| ModuleError::Resolution {
                specifier: specifier.to_string(),
                source,
            })
    }

    /// Import a module with the configured options
    pub async fn import(&self, specifier: &str, from: Option<&ModuleKey>) -> Result<Namespace> {
        self.import_with(specifier, from, &self.default_options())
            .await
    }

    /// Import a module with explicit load options
    #[instrument(skip(self, from, options), fields(from = ?from.map(ModuleKey::as_str)))]
    pub async fn import_with(
        &self,
        specifier: &str,
        from: Option<&ModuleKey>,
        options: &LoadOptions,
    ) -> Result<Namespace> {
        let resolved = self.resolve_module(specifier, from, None)?;
        self.import_resolved(resolved, options).await
    }

    /// Import an already canonical key
    pub async fn import_key(&self, key: &ModuleKey, options: &LoadOptions) -> Result<Namespace> {
        let module_type = self
            .registry
            .get(key)
            .and_then(|record| record.module_type())
            .or_else(|| self.resolver.type_tag(key));

        self.import_resolved(
            ResolvedModule {
                key: key.clone(),
                module_type,
            },
            options,
        )
        .await
    }

    /// `import()` from inside a loaded module.
    ///
    /// Records a dynamic edge from the importer; dynamic edges never take
    /// part in the importer's initialization order.
    pub async fn import_dynamic(&self, specifier: &str, from: &ModuleKey) -> Result<Namespace> {
        let resolved = self.resolve_module(specifier, Some(from), None)?;
        self.graph.add_edge(from, &resolved.key, EdgeKind::Dynamic);
        self.import_resolved(resolved, &self.default_options())
            .await
    }

    /// Import several modules concurrently, each with its own priority.
    ///
    /// Results come back in request order. Fetches share the scheduler, so
    /// with limited slots higher priorities are fetched first.
    pub async fn import_all<I, S>(&self, requests: I, from: Option<&ModuleKey>) -> Vec<Result<Namespace>>
    where
        I: IntoIterator<Item = (S, i32)>,
        S: Into<String>,
    {
        let defaults = self.default_options();
        let requests: Vec<(String, LoadOptions)> = requests
            .into_iter()
            .map(|(specifier, priority)| (specifier.into(), defaults.clone().with_priority(priority)))
            .collect();

        join_all(
            requests
                .iter()
                .map(|(specifier, options)| self.import_with(specifier, from, options)),
        )
        .await
    }

    /// Fetch and link modules without evaluating them.
    ///
    /// A later import of the same module only has to evaluate.
    pub async fn preload<I, S>(&self, specifiers: I, from: Option<&ModuleKey>) -> Vec<Result<ModuleKey>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let options = &self.default_options();
        let specifiers: Vec<S> = specifiers.into_iter().collect();

        join_all(specifiers.iter().map(|specifier| async move {
            let resolved = self.resolve_module(specifier.as_ref(), from, None)?;
            let record = self
                .loader
                .fetch(&resolved.key, resolved.module_type, options)
                .await?;
            self.discover(&record, options).await;
            debug!("Preloaded {}", record.key());
            Ok::<_, ModuleError>(record.key().clone())
        }))
        .await
    }

    /// Import the first alternative of a chain that loads (and passes the
    /// chain's check).
    ///
    /// When every alternative fails the error is [`ModuleError::Aggregate`]
    /// holding each failure in order.
    pub async fn import_first(&self, chain: &FallbackChain, from: Option<&ModuleKey>) -> Result<Namespace> {
        let mut errors = Vec::new();

        for specifier in chain.specifiers() {
            let outcome = match self.import(specifier, from).await {
                Ok(namespace) => chain.accept(&namespace).map(|()| namespace),
                Err(err) => Err(err),
            };
            match outcome {
                Ok(namespace) => {
                    if !errors.is_empty() {
                        info!(
                            "Fell back to '{}' after {} failed alternative(s)",
                            specifier,
                            errors.len()
                        );
                    }
                    return Ok(namespace);
                }
                Err(err) => {
                    debug!("Alternative '{}' rejected: {}", specifier, err);
                    errors.push(err);
                }
            }
        }

        Err(ModuleError::Aggregate { errors })
    }

    /// Import a module, substituting `fallback` if it cannot be loaded
    pub async fn import_or_else<F>(&self, specifier: &str, from: Option<&ModuleKey>, fallback: F) -> Degradable
    where
        F: FnOnce(&ModuleError) -> Value,
    {
        match self.import(specifier, from).await {
            Ok(namespace) => Degradable::Loaded(namespace),
            Err(cause) => {
                warn!("Degrading '{}': {}", specifier, cause);
                Degradable::Degraded {
                    fallback: fallback(&cause),
                    cause,
                }
            }
        }
    }

    /// Reset a settled module so the next import loads it again.
    ///
    /// Importers are not touched; they keep reading the old values until the
    /// module is loaded again.
    pub fn invalidate(&self, key: &ModuleKey) -> Option<u64> {
        self.registry.invalidate(key)
    }

    /// Invalidate and import a module again
    pub async fn reload(&self, key: &ModuleKey) -> Result<Namespace> {
        self.invalidate(key);
        let namespace = self.import_key(key, &self.default_options()).await?;
        info!("Reloaded {}", key);
        Ok(namespace)
    }

    /// Reload a module and every module that statically depends on it.
    ///
    /// Everything is invalidated first, so a cycle never observes a mix of
    /// old and new values. Results are reported nearest dependent first,
    /// starting with `key` itself.
    pub async fn reload_cascade(&self, key: &ModuleKey) -> Vec<(ModuleKey, Result<Namespace>)> {
        let mut keys = vec![key.clone()];
        keys.extend(
            self.graph
                .transitive_dependents(key)
                .into_iter()
                .filter(|dependent| dependent != key),
        );

        for target in &keys {
            self.invalidate(target);
        }

        let options = self.default_options();
        let mut results = Vec::with_capacity(keys.len());
        for target in keys {
            let result = self.import_key(&target, &options).await;
            results.push((target, result));
        }
        info!("Reloaded {} and {} dependent(s)", key, results.len() - 1);
        results
    }

    /// Run `listener` after a key (or any key) is invalidated
    pub fn on_invalidate<F>(&self, key: Option<ModuleKey>, listener: F) -> ListenerId
    where
        F: Fn(&Invalidation) + Send + Sync + 'static,
    {
        self.registry.on_invalidate(key, listener)
    }

    /// Remove an invalidation listener
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.registry.remove_listener(id)
    }

    /// Receive every state transition from now on
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StateEvent> {
        self.events.subscribe()
    }

    /// Module registry
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Dependency graph
    pub fn graph(&self) -> &Arc<DependencyGraph> {
        &self.graph
    }

    /// Loader engine
    pub fn loader(&self) -> &LoaderEngine {
        &self.loader
    }

    /// Load statistics
    pub fn stats(&self) -> &Arc<LoadStats> {
        self.loader.stats()
    }

    /// Circuit state of a key
    pub fn breaker_state(&self, key: &ModuleKey) -> CircuitState {
        self.loader.breaker().state(key)
    }

    /// Snapshot of every record
    pub fn snapshot(&self) -> Vec<RecordSnapshot> {
        self.registry.snapshot()
    }

    /// Drop every record, edge, circuit and subscriber
    pub fn teardown(&self) {
        self.registry.teardown();
        self.graph.clear();
        self.loader.breaker().clear();
        self.events.close();
        info!("Module system torn down");
    }

    async fn import_resolved(&self, resolved: ResolvedModule, options: &LoadOptions) -> Result<Namespace> {
        let key = resolved.key;
        let root = loop {
            let root = self
                .loader
                .fetch(&key, resolved.module_type.clone(), options)
                .await?;

            if root.state() != ModuleState::Ready {
                self.discover(&root, options).await;
                self.evaluate_from(&key);
            }

            // Invalidated between fetch and evaluation: load it again
            if root.state() == ModuleState::Unresolved {
                debug!("{} was invalidated while importing, restarting", key);
                continue;
            }
            break root;
        };

        match root.state() {
            ModuleState::Ready => {
                info!("Imported {}", key);
                Ok(Namespace::new(&root))
            }
            ModuleState::Failed => Err(root
                .error()
                .unwrap_or_else(|| ModuleError::permanent(key.clone(), "failed"))),
            state => Err(ModuleError::State {
                key,
                from: state,
                to: ModuleState::Ready,
            }),
        }
    }

    /// Link and fetch everything statically reachable from `root`.
    ///
    /// Each level of the walk is fetched concurrently. Fetch failures leave
    /// the dependency `Failed`; evaluation reports them on the importer.
    async fn discover(&self, root: &Arc<ModuleRecord>, options: &LoadOptions) {
        let mut visited = HashSet::new();
        visited.insert(root.key().clone());
        let mut frontier = vec![root.clone()];

        while !frontier.is_empty() {
            let pending: Vec<(ModuleKey, Option<String>)> = frontier
                .iter()
                .flat_map(|record| self.link(record))
                .filter(|(key, _)| visited.insert(key.clone()))
                .collect();

            let fetched = join_all(
                pending
                    .iter()
                    .map(|(key, module_type)| self.loader.fetch(key, module_type.clone(), options)),
            )
            .await;

            frontier = Vec::with_capacity(fetched.len());
            for ((key, _), result) in pending.into_iter().zip(fetched) {
                match result {
                    Ok(record) => frontier.push(record),
                    Err(err) => {
                        debug!("Dependency {} failed to load: {}", key, err);
                        // Fast-failed loads never reached the record
                        if let Some(record) = self.registry.get(&key) {
                            if !record.state().is_active() {
                                let _ = record.fail(err);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Resolve a fetched record's imports and record its edges.
    ///
    /// Returns the static dependencies with their type tags. An unresolvable
    /// static import fails the record; unresolvable dynamic ones are only
    /// logged, since they may never run.
    fn link(&self, record: &Arc<ModuleRecord>) -> Vec<(ModuleKey, Option<String>)> {
        if !record.is_fetched() {
            return Vec::new();
        }
        let Some(parsed) = record.parsed() else {
            return Vec::new();
        };

        let key = record.key();
        let mut linked = Vec::with_capacity(parsed.imports.len());
        let mut statics = Vec::new();

        for import in &parsed.imports {
            let resolved = match self.resolve_module(
                &import.specifier,
                Some(key),
                import.type_attribute.as_deref(),
            ) {
                Ok(resolved) => resolved,
                Err(err) if import.kind == ModuleKind::Static => {
                    debug!("Cannot link {}: {}", key, err);
                    let _ = record.fail(err);
                    return Vec::new();
                }
                Err(err) => {
                    debug!("Skipping {:?} import in {}: {}", import.kind, key, err);
                    continue;
                }
            };

            let kind = import.kind.edge_kind();
            if kind == EdgeKind::Static {
                statics.push((resolved.key.clone(), resolved.module_type));
            } else {
                self.graph.add_edge(key, &resolved.key, kind);
            }
            linked.push(LinkedImport {
                specifier: import.specifier.clone(),
                key: resolved.key,
                kind,
            });
        }

        let static_keys: Vec<ModuleKey> = statics.iter().map(|(k, _)| k.clone()).collect();
        self.graph.replace_static_edges(key, &static_keys);
        record.set_dependencies(linked);
        statics
    }

    /// Evaluate every fetched module in `root`'s initialization order
    fn evaluate_from(&self, root: &ModuleKey) {
        let _guard = self.eval_lock.lock();

        for key in self.graph.initialization_order(root) {
            let Some(record) = self.registry.get(&key) else {
                continue;
            };
            if let Err(err) = self.loader.evaluate(&record) {
                debug!("Evaluation of {} failed: {}", key, err);
            }
        }
    }
}

impl fmt::Debug for ModuleSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleSystem")
            .field("registry", &self.registry)
            .field("loader", &self.loader)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemorySource;
    use crate::script::ScriptEvaluator;
    use serde_json::json;

    fn system(modules: &[(&str, &str)]) -> ModuleSystem {
        let source = Arc::new(MemorySource::with_modules(modules.iter().copied()));
        ModuleSystem::new(Config::default(), source, Arc::new(ScriptEvaluator))
    }

    #[tokio::test]
    async fn test_import_chain() {
        let system = system(&[
            ("/main.js", "import { greet } from './lib/greet.js';\nexport const message = greet + ', world';"),
            ("/lib/greet.js", "export const greet = 'hello';"),
        ]);

        let ns = system.import("./main", None).await.unwrap();
        assert_eq!(ns.get("message"), Some(json!("hello, world")));
        assert_eq!(
            system.graph().dependencies(&ModuleKey::new("/main.js")),
            vec![(ModuleKey::new("/lib/greet.js"), EdgeKind::Static)]
        );

        let greet = system.registry().get(&ModuleKey::new("/lib/greet.js")).unwrap();
        let main = system.registry().get(&ModuleKey::new("/main.js")).unwrap();
        assert!(greet.loaded_at() < main.loaded_at());
    }

    #[tokio::test]
    async fn test_unresolvable_static_import_fails_importer() {
        let system = system(&[("/main.js", "import './missing.js';")]);

        let err = system.import("/main.js", None).await.unwrap_err();
        assert!(matches!(err, ModuleError::Resolution { .. }));
        assert_eq!(
            system.registry().get(&ModuleKey::new("/main.js")).unwrap().state(),
            ModuleState::Failed
        );
    }

    #[tokio::test]
    async fn test_failed_dependency_propagates() {
        let system = system(&[
            ("/main.js", "import { x } from './dep.js';\nexport const y = 1;"),
            ("/dep.js", "export const x = missing;"),
        ]);

        let err = system.import("/main.js", None).await.unwrap_err();
        match err {
            ModuleError::Dependency { key, dependency, .. } => {
                assert_eq!(key.as_str(), "/main.js");
                assert_eq!(dependency.as_str(), "/dep.js");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_dynamic_imports_are_linked_lazily() {
        let system = system(&[
            ("/main.js", "export const later = import('./lazy.js');"),
            ("/lazy.js", "export default 42;"),
        ]);
        let main = ModuleKey::new("/main.js");

        system.import("/main.js", None).await.unwrap();
        assert_eq!(
            system.graph().dependencies(&main),
            vec![(ModuleKey::new("/lazy.js"), EdgeKind::Dynamic)]
        );
        assert!(system.registry().get(&ModuleKey::new("/lazy.js")).is_none());

        let lazy = system.import_dynamic("./lazy.js", &main).await.unwrap();
        assert_eq!(lazy.get("default"), Some(json!(42)));
    }

    #[tokio::test]
    async fn test_json_import_attribute() {
        let system = system(&[
            ("/main.js", "import config from './settings' with { type: 'json' };\nexport const port = config.port;"),
            ("/settings", "{\"port\": 8080}"),
        ]);

        let ns = system.import("/main.js", None).await.unwrap();
        assert_eq!(ns.get("port"), Some(json!(8080)));
        assert_eq!(
            system
                .registry()
                .get(&ModuleKey::new("/settings"))
                .unwrap()
                .module_type(),
            Some("json".to_string())
        );
    }

    #[tokio::test]
    async fn test_preload_defers_evaluation() {
        let system = system(&[
            ("/main.js", "import './dep.js';\nexport const ok = true;"),
            ("/dep.js", "export const ready = true;"),
        ]);

        let keys = system.preload(["/main.js"], None).await;
        assert_eq!(keys[0].as_ref().unwrap().as_str(), "/main.js");
        let dep = system.registry().get(&ModuleKey::new("/dep.js")).unwrap();
        assert_eq!(dep.state(), ModuleState::Loading);

        system.import("/main.js", None).await.unwrap();
        assert_eq!(dep.state(), ModuleState::Ready);
    }

    #[tokio::test]
    async fn test_teardown_detaches_namespaces() {
        let system = system(&[("/a.js", "export const x = 1;")]);
        let ns = system.import("/a.js", None).await.unwrap();

        system.teardown();
        assert!(!ns.is_attached());
        assert!(system.registry().is_empty());
        assert!(system.snapshot().is_empty());
    }
}

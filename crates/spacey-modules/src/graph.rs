// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Dependency graph between module keys.
//!
//! The graph only stores keys; records live in the registry. Cycles are
//! allowed: ordering treats a back-edge as "already being initialized".

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

use crate::key::ModuleKey;

/// How an importer links a dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// Linked and evaluated before the importer
    Static,
    /// Loaded on demand, not part of initialization order
    Dynamic,
}

/// Directed edge `from -> to`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEdge {
    /// Importer
    pub from: ModuleKey,
    /// Imported module
    pub to: ModuleKey,
    /// Link kind
    pub kind: EdgeKind,
}

/// One step of an initialization plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitStep {
    /// Evaluate the module
    Evaluate(ModuleKey),
    /// `requested_by` sees `key` before it finished initializing
    Placeholder {
        /// Module still on the initialization stack
        key: ModuleKey,
        /// Importer that closes the cycle
        requested_by: ModuleKey,
    },
}

/// Module dependency graph
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// Module -> (dependency, kind), insertion ordered
    dependencies: RwLock<HashMap<ModuleKey, Vec<(ModuleKey, EdgeKind)>>>,
}

impl DependencyGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an edge.
    ///
    /// Duplicates are ignored; a static edge upgrades an existing dynamic one.
    pub fn add_edge(&self, from: &ModuleKey, to: &ModuleKey, kind: EdgeKind) {
        let mut dependencies = self.dependencies.write();
        let edges = dependencies.entry(from.clone()).or_default();
        match edges.iter_mut().find(|(key, _)| key == to) {
            Some((_, existing)) => {
                if kind == EdgeKind::Static {
                    *existing = EdgeKind::Static;
                }
            }
            None => edges.push((to.clone(), kind)),
        }
    }

    /// Replace the static edges of `from`, keeping dynamic ones
    pub fn replace_static_edges(&self, from: &ModuleKey, tos: &[ModuleKey]) {
        {
            let mut dependencies = self.dependencies.write();
            if let Some(edges) = dependencies.get_mut(from) {
                edges.retain(|(_, kind)| *kind == EdgeKind::Dynamic);
            }
        }
        for to in tos {
            self.add_edge(from, to, EdgeKind::Static);
        }
    }

    /// Direct dependencies of a module, in insertion order
    pub fn dependencies(&self, key: &ModuleKey) -> Vec<(ModuleKey, EdgeKind)> {
        self.dependencies
            .read()
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Direct importers of a module, sorted
    pub fn dependents(&self, key: &ModuleKey) -> Vec<ModuleKey> {
        let mut dependents: Vec<ModuleKey> = self
            .dependencies
            .read()
            .iter()
            .filter(|(_, edges)| edges.iter().any(|(to, _)| to == key))
            .map(|(from, _)| from.clone())
            .collect();
        dependents.sort();
        dependents
    }

    /// Every module that reaches `key` through static edges, nearest first
    pub fn transitive_dependents(&self, key: &ModuleKey) -> Vec<ModuleKey> {
        let dependencies = self.dependencies.read();
        let mut result = Vec::new();
        let mut visited = HashSet::new();
        let mut queue = std::collections::VecDeque::from([key.clone()]);
        visited.insert(key.clone());

        while let Some(current) = queue.pop_front() {
            let mut importers: Vec<&ModuleKey> = dependencies
                .iter()
                .filter(|(_, edges)| {
                    edges
                        .iter()
                        .any(|(to, kind)| to == &current && *kind == EdgeKind::Static)
                })
                .map(|(from, _)| from)
                .collect();
            importers.sort();

            for importer in importers {
                if visited.insert(importer.clone()) {
                    result.push(importer.clone());
                    queue.push_back(importer.clone());
                }
            }
        }

        result
    }

    /// Every edge, sorted by importer then insertion order
    pub fn edges(&self) -> Vec<DependencyEdge> {
        let dependencies = self.dependencies.read();
        let mut froms: Vec<&ModuleKey> = dependencies.keys().collect();
        froms.sort();
        froms
            .into_iter()
            .flat_map(|from| {
                dependencies[from].iter().map(move |(to, kind)| DependencyEdge {
                    from: from.clone(),
                    to: to.clone(),
                    kind: *kind,
                })
            })
            .collect()
    }

    /// Static-edge post-order from `root`: dependencies before importers.
    ///
    /// Every reachable key appears once. A back-edge to a module still on the
    /// stack is skipped, so cycles never fail ordering.
    pub fn initialization_order(&self, root: &ModuleKey) -> Vec<ModuleKey> {
        self.initialization_plan(root)
            .into_iter()
            .filter_map(|step| match step {
                InitStep::Evaluate(key) => Some(key),
                InitStep::Placeholder { .. } => None,
            })
            .collect()
    }

    /// Initialization order with the cycle placeholders made explicit
    pub fn initialization_plan(&self, root: &ModuleKey) -> Vec<InitStep> {
        let dependencies = self.dependencies.read();
        let mut plan = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = HashSet::new();
        plan_visit(&dependencies, root, &mut visited, &mut stack, &mut plan);
        plan
    }

    /// Check for a static cycle reachable from `root`
    pub fn has_cycle(&self, root: &ModuleKey) -> bool {
        self.find_cycle(root).is_some()
    }

    /// First static cycle reachable from `root`, as the keys along it
    pub fn find_cycle(&self, root: &ModuleKey) -> Option<Vec<ModuleKey>> {
        let dependencies = self.dependencies.read();
        let mut visited = HashSet::new();
        let mut path = Vec::new();
        cycle_visit(&dependencies, root, &mut visited, &mut path)
    }

    /// Drop every edge from `key`
    pub fn remove(&self, key: &ModuleKey) {
        self.dependencies.write().remove(key);
    }

    /// Drop every edge
    pub fn clear(&self) {
        self.dependencies.write().clear();
    }
}

fn static_edges<'a>(
    dependencies: &'a HashMap<ModuleKey, Vec<(ModuleKey, EdgeKind)>>,
    key: &ModuleKey,
) -> impl Iterator<Item = &'a ModuleKey> + use<'a> {
    dependencies
        .get(key)
        .into_iter()
        .flatten()
        .filter(|(_, kind)| *kind == EdgeKind::Static)
        .map(|(to, _)| to)
}

fn plan_visit(
    dependencies: &HashMap<ModuleKey, Vec<(ModuleKey, EdgeKind)>>,
    key: &ModuleKey,
    visited: &mut HashSet<ModuleKey>,
    stack: &mut HashSet<ModuleKey>,
    plan: &mut Vec<InitStep>,
) {
    visited.insert(key.clone());
    stack.insert(key.clone());

    for dep in static_edges(dependencies, key) {
        if stack.contains(dep) {
            plan.push(InitStep::Placeholder {
                key: dep.clone(),
                requested_by: key.clone(),
            });
        } else if !visited.contains(dep) {
            plan_visit(dependencies, dep, visited, stack, plan);
        }
    }

    stack.remove(key);
    plan.push(InitStep::Evaluate(key.clone()));
}

fn cycle_visit(
    dependencies: &HashMap<ModuleKey, Vec<(ModuleKey, EdgeKind)>>,
    key: &ModuleKey,
    visited: &mut HashSet<ModuleKey>,
    path: &mut Vec<ModuleKey>,
) -> Option<Vec<ModuleKey>> {
    if let Some(pos) = path.iter().position(|k| k == key) {
        return Some(path[pos..].to_vec());
    }
    if !visited.insert(key.clone()) {
        return None;
    }

    path.push(key.clone());
    for dep in static_edges(dependencies, key) {
        if let Some(cycle) = cycle_visit(dependencies, dep, visited, path) {
            return Some(cycle);
        }
    }
    path.pop();
    None
}

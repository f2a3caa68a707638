// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Hot reload loop
//!
//! File events from `notify` are forwarded over a channel and dispatched
//! here: each changed module is reloaded together with its dependents.

use notify::{Event, EventKind, RecursiveMode, Watcher};
use owo_colors::OwoColorize;
use spacey_modules::{FsSource, ModuleKey, ModuleSystem};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::{print_exports, report};

/// Import `entry`, then reload on every change under the source root
pub async fn run(system: Arc<ModuleSystem>, source: FsSource, entry: &str) -> anyhow::Result<()> {
    match system.import(entry, None).await {
        Ok(ns) => print_exports(&ns),
        Err(err) => report(&err),
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let _ = tx.send(res);
    })?;
    watcher.watch(source.root(), RecursiveMode::Recursive)?;

    system.on_invalidate(None, |inv| {
        tracing::debug!("{} invalidated (version {})", inv.key, inv.version);
    });

    println!(
        "{} {} {}",
        "Watching".cyan().bold(),
        source.root().display(),
        "(Ctrl+C to stop)".dimmed()
    );

    while let Some(res) = rx.recv().await {
        let event = match res {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("Watch error: {}", e);
                continue;
            }
        };

        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        ) {
            continue;
        }

        let changed: BTreeSet<ModuleKey> = event
            .paths
            .iter()
            .filter_map(|path| source.key_of(path))
            .filter(|key| system.registry().contains(key))
            .collect();

        for key in changed {
            println!("{} {}", "changed".yellow(), key);
            for (reloaded, result) in system.reload_cascade(&key).await {
                match result {
                    Ok(_) => println!("  {} {}", "reloaded".green(), reloaded),
                    Err(err) => report(&err),
                }
            }
        }

        // Show the entry's exports as they are now
        match system.import(entry, None).await {
            Ok(ns) => print_exports(&ns),
            Err(err) => report(&err),
        }
    }

    Ok(())
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! sload - command line front end for the Spacey module loader
//!
//! ## Commands
//!
//! - `resolve`: print the key a specifier resolves to
//! - `graph`: fetch a module graph and print its initialization plan
//! - `run`: import a module and print its exports
//! - `watch`: import a module and hot-reload it as files change

mod watch;

use anyhow::Context;
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use spacey_modules::{
    BindingValue, Config, EdgeKind, FsSource, InitStep, ModuleError, ModuleKey, ModuleSystem,
    Namespace, ScriptEvaluator,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "sload",
    about = "Resolve, load and hot-reload module graphs with the Spacey module engine",
    version,
    author = "Pegasus Heavy Industries"
)]
struct Cli {
    /// Configuration file (defaults to ./spacey-modules.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory that module keys are rooted at
    #[arg(short, long, global = true, default_value = ".")]
    root: PathBuf,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve a specifier to a module key
    Resolve {
        /// Specifier as written in an import
        specifier: String,

        /// Key of the importing module
        #[arg(long)]
        from: Option<String>,
    },

    /// Fetch a module graph and print its initialization plan
    Graph {
        /// Entry specifier
        entry: String,
    },

    /// Import a module and print its exports
    Run {
        /// Entry specifier
        entry: String,

        /// Print load statistics afterwards
        #[arg(long)]
        stats: bool,
    },

    /// Import a module and reload it whenever its files change
    Watch {
        /// Entry specifier
        entry: String,
    },

    /// Print a configuration value
    Config {
        /// Setting name, e.g. `timeout` or `load.timeout_ms`
        key: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "spacey_modules=debug,sload=debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    if let Command::Config { key } = &cli.command {
        return Ok(match config.get(key) {
            Some(value) => {
                println!("{}", value);
                ExitCode::SUCCESS
            }
            None => {
                eprintln!("{}: unknown key '{}'", "Error".red().bold(), key.cyan());
                ExitCode::FAILURE
            }
        });
    }

    let root = std::fs::canonicalize(&cli.root)
        .with_context(|| format!("Cannot open root directory {}", cli.root.display()))?;
    let source = FsSource::new(root);
    let system = Arc::new(ModuleSystem::new(
        config,
        Arc::new(source.clone()),
        Arc::new(ScriptEvaluator::new()),
    ));

    let result = match cli.command {
        Command::Resolve { specifier, from } => {
            let from = from.map(ModuleKey::new);
            system.resolve(&specifier, from.as_ref()).map(|key| {
                println!("{}", key);
            })
        }
        Command::Graph { entry } => print_graph(&system, &entry).await,
        Command::Run { entry, stats } => {
            let result = system.import(&entry, None).await.map(|ns| print_exports(&ns));
            if stats {
                println!("{}", system.stats().summary().dimmed());
            }
            result
        }
        Command::Watch { entry } => {
            return watch::run(system, source, &entry).await.map(|()| ExitCode::SUCCESS);
        }
        Command::Config { .. } => Ok(()),
    };

    Ok(match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report(&err);
            ExitCode::FAILURE
        }
    })
}

/// Fetch without evaluating, then print edges and the initialization plan
async fn print_graph(system: &ModuleSystem, entry: &str) -> Result<(), ModuleError> {
    let key = system
        .preload([entry], None)
        .await
        .into_iter()
        .next()
        .unwrap_or_else(|| system.resolve(entry, None))?;

    println!("{}", "Edges".bold());
    for edge in system.graph().edges() {
        let arrow = match edge.kind {
            EdgeKind::Static => "->".to_string(),
            EdgeKind::Dynamic => "~>".dimmed().to_string(),
        };
        println!("  {} {} {}", edge.from, arrow, edge.to);
    }

    println!("{}", "Initialization order".bold());
    let mut position = 0;
    for step in system.graph().initialization_plan(&key) {
        match step {
            InitStep::Evaluate(key) => {
                position += 1;
                println!("  {:>3}. {}", position, key);
            }
            InitStep::Placeholder { key, requested_by } => {
                println!(
                    "       {} {} sees {} before it is initialized",
                    "cycle:".yellow(),
                    requested_by,
                    key
                );
            }
        }
    }

    if let Some(cycle) = system.graph().find_cycle(&key) {
        let path: Vec<&str> = cycle.iter().map(ModuleKey::as_str).collect();
        println!("{} {}", "Cycle:".yellow().bold(), path.join(" -> "));
    }
    Ok(())
}

/// Print every export of a namespace
pub(crate) fn print_exports(ns: &Namespace) {
    println!("{}", ns.key().cyan().bold());
    for name in ns.names() {
        let value = match ns.read(&name) {
            BindingValue::Value(value) => value.to_string(),
            BindingValue::Uninitialized => "<uninitialized>".dimmed().to_string(),
        };
        println!("  {} = {}", name.green(), value);
    }
}

/// Print an error with its attempt log and alternatives
pub(crate) fn report(err: &ModuleError) {
    eprintln!("{}: {}", "Error".red().bold(), err);
    for attempt in err.attempts() {
        eprintln!("  {}", attempt.dimmed());
    }
    for alternative in err.alternatives() {
        eprintln!("  {} {}", "-".dimmed(), alternative);
    }
}

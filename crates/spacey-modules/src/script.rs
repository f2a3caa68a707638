// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Module evaluation.
//!
//! The engine only needs two things from a module body: the imports it
//! declares (to build the graph before evaluation) and a way to run it
//! against its linked imports. [`ModuleEvaluator`] is that seam.
//!
//! [`ScriptEvaluator`] implements a small module syntax, enough to wire real
//! dependency graphs together:
//!
//! ```text
//! import greet, { name as who } from './greet.js';
//! import * as config from './config.json' with { type: 'json' };
//! import './polyfill.js';
//! const banner = 'Hello, ' + who;
//! export const message = banner + config.suffix;
//! export default message;
//! export { helper } from './helpers.js';
//! export * from './more.js';
//! const lazy = import('./lazy.js');
//! ```
//!
//! Values are JSON. Expressions support literals, identifiers, member access
//! and `+`.

use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use crate::binding::{BindingValue, ExportWriter, ImportedBinding, Namespace};
use crate::error::EvalError;
use crate::key::{ModuleKey, ModuleKind};

/// An import declared by a module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRequest {
    /// Specifier as written
    pub specifier: String,
    /// How the import is written
    pub kind: ModuleKind,
    /// `type` of the `with` / `assert` import attribute
    pub type_attribute: Option<String>,
}

/// A module that was fetched and parsed but not evaluated yet
#[derive(Debug, Clone)]
pub struct ParsedModule {
    /// Declared imports, in source order
    pub imports: Vec<ImportRequest>,
    /// Module text
    pub source: Arc<str>,
    /// Module type tag
    pub module_type: Option<String>,
}

impl ParsedModule {
    /// Imports linked before evaluation
    pub fn static_imports(&self) -> impl Iterator<Item = &ImportRequest> {
        self.imports
            .iter()
            .filter(|import| import.kind == ModuleKind::Static)
    }
}

/// Everything a module body can reach while it runs
#[derive(Debug)]
pub struct EvalContext {
    /// Module being evaluated
    pub key: ModuleKey,
    /// Write capability over the module's exports
    pub exports: ExportWriter,
    /// Namespaces of linked static imports, by specifier
    pub imports: HashMap<String, Namespace>,
}

impl EvalContext {
    /// Namespace linked for `specifier`
    pub fn import(&self, specifier: &str) -> Option<&Namespace> {
        self.imports.get(specifier)
    }
}

/// Parses and runs module bodies
pub trait ModuleEvaluator: Send + Sync {
    /// Extract the imports of a module.
    ///
    /// Errors here are syntax errors and are never retried.
    fn parse(
        &self,
        key: &ModuleKey,
        module_type: Option<&str>,
        source: &str,
    ) -> Result<ParsedModule, EvalError>;

    /// Run a parsed module, defining its exports through `ctx.exports`
    fn evaluate(&self, module: &ParsedModule, ctx: &EvalContext) -> Result<(), EvalError>;
}

/// Content class selected from the module type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContentType {
    Script,
    Json,
    Asset,
}

impl ContentType {
    fn from_tag(tag: Option<&str>) -> Self {
        match tag {
            None | Some("js") | Some("javascript") | Some("module") => ContentType::Script,
            Some("json") => ContentType::Json,
            Some(_) => ContentType::Asset,
        }
    }
}

/// Evaluator for the built-in module syntax, JSON modules and opaque assets
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptEvaluator;

impl ScriptEvaluator {
    /// Create an evaluator
    pub fn new() -> Self {
        Self
    }
}

impl ModuleEvaluator for ScriptEvaluator {
    fn parse(
        &self,
        _key: &ModuleKey,
        module_type: Option<&str>,
        source: &str,
    ) -> Result<ParsedModule, EvalError> {
        let imports = match ContentType::from_tag(module_type) {
            ContentType::Script => parse_program(source)?.imports,
            ContentType::Json => {
                parse_json(source)?;
                Vec::new()
            }
            ContentType::Asset => Vec::new(),
        };

        Ok(ParsedModule {
            imports,
            source: Arc::from(source),
            module_type: module_type.map(String::from),
        })
    }

    fn evaluate(&self, module: &ParsedModule, ctx: &EvalContext) -> Result<(), EvalError> {
        match ContentType::from_tag(module.module_type.as_deref()) {
            ContentType::Json => {
                let value = parse_json(&module.source)?;
                if let Value::Object(map) = &value {
                    for (name, field) in map {
                        ctx.exports.define(name, field.clone())?;
                    }
                }
                ctx.exports.define("default", value)?;
            }
            ContentType::Asset => {
                ctx.exports
                    .define("default", Value::String(module.source.to_string()))?;
            }
            ContentType::Script => {
                let program = parse_program(&module.source)?;
                let mut scope = Scope::new(ctx);
                for (line, statement) in program.statements {
                    scope.execute(statement).map_err(|err| match err {
                        EvalError::Runtime(message) => {
                            EvalError::Runtime(format!("{} (line {})", message, line))
                        }
                        other => other,
                    })?;
                }
            }
        }
        Ok(())
    }
}

fn parse_json(source: &str) -> Result<Value, EvalError> {
    serde_json::from_str(source).map_err(|e| EvalError::Syntax {
        line: e.line(),
        message: e.to_string(),
    })
}

// ============================================================================
// Parsing
// ============================================================================

static IMPORT_FROM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?s)^import\s+(?:([\w$]+)\s*,?\s*)?(?:\{([^}]*)\}\s*)?(?:\*\s*as\s+([\w$]+)\s*)?from\s*['"]([^'"]+)['"](.*)$"#,
    )
    .unwrap()
});

static IMPORT_BARE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?s)^import\s*['"]([^'"]+)['"](.*)$"#).unwrap());

static IMPORT_ATTRIBUTES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)^\s*(?:with|assert)\s*\{\s*type\s*:\s*['"]([^'"]+)['"]\s*,?\s*\}\s*$"#)
        .unwrap()
});

static EXPORT_ALL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?s)^export\s*\*\s*from\s*['"]([^'"]+)['"](.*)$"#).unwrap());

static EXPORT_LIST_FROM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)^export\s*\{([^}]*)\}\s*from\s*['"]([^'"]+)['"](.*)$"#).unwrap()
});

static EXPORT_LIST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?s)^export\s*\{([^}]*)\}$"#).unwrap());

static EXPORT_DEFAULT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?s)^export\s+default\s+(.+)$"#).unwrap());

static EXPORT_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)^export\s+(?:const|let|var)\s+([\w$]+)\s*=\s*(.+)$"#).unwrap()
});

static DECL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?s)^(?:const|let|var)\s+([\w$]+)\s*=\s*(.+)$"#).unwrap());

static ASSIGN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?s)^([\w$]+)\s*=\s*([^=].*)$"#).unwrap());

static DYNAMIC_IMPORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\bimport\s*\(\s*['"]([^'"]+)['"]\s*\)"#).unwrap());

static WORKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\bnew\s+Worker\s*\(\s*['"]([^'"]+)['"]"#).unwrap());

static LIST_ENTRY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^([\w$]+)(?:\s+as\s+([\w$]+))?$"#).unwrap());

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^[A-Za-z_$][\w$]*$"#).unwrap());

/// One top-level statement
#[derive(Debug, Clone, PartialEq)]
enum Stmt {
    /// `import d, { a as b } from 's'`, `import * as ns from 's'`, `import 's'`
    Import {
        specifier: String,
        default: Option<String>,
        /// (imported, local)
        named: Vec<(String, String)>,
        namespace: Option<String>,
    },
    ExportDecl {
        name: String,
        expr: String,
    },
    ExportDefault {
        expr: String,
    },
    /// (local, exported)
    ExportList {
        names: Vec<(String, String)>,
    },
    /// (imported, exported)
    ExportFrom {
        specifier: String,
        names: Vec<(String, String)>,
    },
    ExportAll {
        specifier: String,
    },
    Declare {
        name: String,
        expr: String,
    },
    Assign {
        name: String,
        expr: String,
    },
    Expr {
        expr: String,
    },
}

#[derive(Debug, Default)]
struct Program {
    statements: Vec<(usize, Stmt)>,
    imports: Vec<ImportRequest>,
}

fn parse_program(source: &str) -> Result<Program, EvalError> {
    let mut program = Program::default();

    for (line, text) in split_statements(source)? {
        let statement = parse_statement(line, &text)?;

        match &statement {
            Stmt::Import { specifier, .. } => {
                let attributes = IMPORT_FROM
                    .captures(&text)
                    .and_then(|c| c.get(5))
                    .or_else(|| IMPORT_BARE.captures(&text).and_then(|c| c.get(2)))
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                program.imports.push(ImportRequest {
                    specifier: specifier.clone(),
                    kind: ModuleKind::Static,
                    type_attribute: parse_attributes(line, attributes)?,
                });
            }
            Stmt::ExportFrom { specifier, .. } | Stmt::ExportAll { specifier } => {
                program.imports.push(ImportRequest {
                    specifier: specifier.clone(),
                    kind: ModuleKind::Static,
                    type_attribute: None,
                });
            }
            _ => {
                for cap in DYNAMIC_IMPORT.captures_iter(&text) {
                    program.imports.push(ImportRequest {
                        specifier: cap[1].to_string(),
                        kind: ModuleKind::Dynamic,
                        type_attribute: None,
                    });
                }
                for cap in WORKER.captures_iter(&text) {
                    program.imports.push(ImportRequest {
                        specifier: cap[1].to_string(),
                        kind: ModuleKind::Worker,
                        type_attribute: None,
                    });
                }
            }
        }

        program.statements.push((line, statement));
    }

    Ok(program)
}

fn parse_statement(line: usize, text: &str) -> Result<Stmt, EvalError> {
    let syntax = |message: &str| EvalError::Syntax {
        line,
        message: message.to_string(),
    };

    if let Some(cap) = IMPORT_FROM.captures(text) {
        let named = match cap.get(2) {
            Some(list) => parse_list(line, list.as_str())?,
            None => Vec::new(),
        };
        return Ok(Stmt::Import {
            specifier: cap[4].to_string(),
            default: cap.get(1).map(|m| m.as_str().to_string()),
            named,
            namespace: cap.get(3).map(|m| m.as_str().to_string()),
        });
    }

    if let Some(cap) = IMPORT_BARE.captures(text) {
        return Ok(Stmt::Import {
            specifier: cap[1].to_string(),
            default: None,
            named: Vec::new(),
            namespace: None,
        });
    }

    if let Some(cap) = EXPORT_ALL.captures(text) {
        if !cap[2].trim().is_empty() {
            return Err(syntax("Unexpected tokens after export"));
        }
        return Ok(Stmt::ExportAll {
            specifier: cap[1].to_string(),
        });
    }

    if let Some(cap) = EXPORT_LIST_FROM.captures(text) {
        if !cap[3].trim().is_empty() {
            return Err(syntax("Unexpected tokens after export"));
        }
        return Ok(Stmt::ExportFrom {
            specifier: cap[2].to_string(),
            names: parse_list(line, &cap[1])?,
        });
    }

    if let Some(cap) = EXPORT_LIST.captures(text) {
        return Ok(Stmt::ExportList {
            names: parse_list(line, &cap[1])?,
        });
    }

    if let Some(cap) = EXPORT_DEFAULT.captures(text) {
        return Ok(Stmt::ExportDefault {
            expr: cap[1].trim().to_string(),
        });
    }

    if let Some(cap) = EXPORT_DECL.captures(text) {
        return Ok(Stmt::ExportDecl {
            name: cap[1].to_string(),
            expr: cap[2].trim().to_string(),
        });
    }

    if let Some(cap) = DECL.captures(text) {
        return Ok(Stmt::Declare {
            name: cap[1].to_string(),
            expr: cap[2].trim().to_string(),
        });
    }

    if text.starts_with("export") {
        return Err(syntax("Unsupported export declaration"));
    }
    if text.starts_with("import") && !DYNAMIC_IMPORT.is_match(text) {
        return Err(syntax("Unsupported import declaration"));
    }

    if let Some(cap) = ASSIGN.captures(text) {
        return Ok(Stmt::Assign {
            name: cap[1].to_string(),
            expr: cap[2].trim().to_string(),
        });
    }

    Ok(Stmt::Expr {
        expr: text.to_string(),
    })
}

/// Parse `a, b as c` into `(a, a)`, `(b, c)`
fn parse_list(line: usize, list: &str) -> Result<Vec<(String, String)>, EvalError> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let cap = LIST_ENTRY.captures(entry).ok_or_else(|| EvalError::Syntax {
                line,
                message: format!("Invalid binding list entry '{}'", entry),
            })?;
            let name = cap[1].to_string();
            let alias = cap.get(2).map(|m| m.as_str().to_string());
            Ok((name.clone(), alias.unwrap_or(name)))
        })
        .collect()
}

fn parse_attributes(line: usize, text: &str) -> Result<Option<String>, EvalError> {
    if text.trim().is_empty() {
        return Ok(None);
    }
    IMPORT_ATTRIBUTES
        .captures(text)
        .map(|cap| Some(cap[1].to_string()))
        .ok_or_else(|| EvalError::Syntax {
            line,
            message: format!("Invalid import attributes '{}'", text.trim()),
        })
}

/// Split source into top-level statements with their starting line.
///
/// Statements end at `;` or a newline outside strings and brackets. Comments
/// are dropped.
fn split_statements(source: &str) -> Result<Vec<(usize, String)>, EvalError> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut start_line = 1;
    let mut line = 1;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut brackets: Vec<(char, usize)> = Vec::new();
    let mut chars = source.chars().peekable();

    let mut flush = |current: &mut String, start_line: usize| {
        let text = current.trim();
        if !text.is_empty() {
            statements.push((start_line, text.to_string()));
        }
        current.clear();
    };

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            if c == '\n' {
                return Err(EvalError::Syntax {
                    line,
                    message: "Unterminated string literal".to_string(),
                });
            }
            current.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }

        match c {
            '/' if chars.peek() == Some(&'/') => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        if brackets.is_empty() {
                            flush(&mut current, start_line);
                        } else {
                            current.push('\n');
                        }
                        line += 1;
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                let mut closed = false;
                for next in chars.by_ref() {
                    if next == '\n' {
                        line += 1;
                    }
                    if prev == '*' && next == '/' {
                        closed = true;
                        break;
                    }
                    prev = next;
                }
                if !closed {
                    return Err(EvalError::Syntax {
                        line,
                        message: "Unterminated comment".to_string(),
                    });
                }
                current.push(' ');
            }
            '\'' | '"' => {
                if current.trim().is_empty() {
                    start_line = line;
                }
                quote = Some(c);
                current.push(c);
            }
            '(' | '[' | '{' => {
                if current.trim().is_empty() {
                    start_line = line;
                }
                brackets.push((c, line));
                current.push(c);
            }
            ')' | ']' | '}' => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match brackets.pop() {
                    Some((open, _)) if open == expected => current.push(c),
                    _ => {
                        return Err(EvalError::Syntax {
                            line,
                            message: format!("Unexpected '{}'", c),
                        });
                    }
                }
            }
            ';' if brackets.is_empty() => flush(&mut current, start_line),
            '\n' => {
                if brackets.is_empty() {
                    flush(&mut current, start_line);
                } else {
                    current.push('\n');
                }
                line += 1;
            }
            _ => {
                if current.trim().is_empty() && !c.is_whitespace() {
                    start_line = line;
                }
                current.push(c);
            }
        }
    }

    if quote.is_some() {
        return Err(EvalError::Syntax {
            line,
            message: "Unterminated string literal".to_string(),
        });
    }
    if let Some((open, open_line)) = brackets.pop() {
        return Err(EvalError::Syntax {
            line: open_line,
            message: format!("Unclosed '{}'", open),
        });
    }
    flush(&mut current, start_line);

    Ok(statements)
}

/// Split on `sep` outside strings and brackets
fn split_top_level(text: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut start = 0;

    for (i, c) in text.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            _ if c == sep && depth == 0 => {
                parts.push(&text[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

// ============================================================================
// Evaluation
// ============================================================================

#[derive(Debug, Clone)]
enum Local {
    Value(BindingValue),
    Import(ImportedBinding),
    Namespace(Namespace),
}

struct Scope<'a> {
    ctx: &'a EvalContext,
    locals: HashMap<String, Local>,
    /// Local name -> export names that mirror it
    exported: HashMap<String, Vec<String>>,
}

impl<'a> Scope<'a> {
    fn new(ctx: &'a EvalContext) -> Self {
        Self {
            ctx,
            locals: HashMap::new(),
            exported: HashMap::new(),
        }
    }

    fn namespace(&self, specifier: &str) -> Result<&'a Namespace, EvalError> {
        self.ctx.import(specifier).ok_or_else(|| {
            EvalError::Runtime(format!("Module '{}' was not linked", specifier))
        })
    }

    fn execute(&mut self, statement: Stmt) -> Result<(), EvalError> {
        match statement {
            Stmt::Import {
                specifier,
                default,
                named,
                namespace,
            } => {
                let ns = self.namespace(&specifier)?;
                if let Some(local) = default {
                    self.locals
                        .insert(local, Local::Import(ns.binding("default")));
                }
                for (imported, local) in named {
                    self.locals
                        .insert(local, Local::Import(ns.binding(&imported)));
                }
                if let Some(local) = namespace {
                    self.locals.insert(local, Local::Namespace(ns.clone()));
                }
            }
            Stmt::ExportDecl { name, expr } => {
                self.declare(&name)?;
                self.exported
                    .entry(name.clone())
                    .or_default()
                    .push(name.clone());
                let value = self.eval(&expr)?;
                self.assign(&name, value)?;
            }
            Stmt::ExportDefault { expr } => {
                let value = self.eval(&expr)?;
                self.ctx.exports.define("default", value)?;
            }
            Stmt::ExportList { names } => {
                for (local, exported) in names {
                    match self.locals.get(&local) {
                        Some(Local::Import(binding)) => {
                            self.ctx.exports.reexport(&exported, binding.clone())?;
                        }
                        Some(Local::Namespace(_)) => {
                            return Err(EvalError::Runtime(format!(
                                "Cannot export namespace '{}'",
                                local
                            )));
                        }
                        Some(Local::Value(value)) => {
                            self.ctx.exports.define(&exported, value.clone())?;
                            self.exported.entry(local).or_default().push(exported);
                        }
                        None => {
                            self.ctx
                                .exports
                                .define(&exported, BindingValue::Uninitialized)?;
                            self.exported.entry(local).or_default().push(exported);
                        }
                    }
                }
            }
            Stmt::ExportFrom { specifier, names } => {
                let ns = self.namespace(&specifier)?;
                for (imported, exported) in names {
                    self.ctx.exports.reexport(&exported, ns.binding(&imported))?;
                }
            }
            Stmt::ExportAll { specifier } => {
                let ns = self.namespace(&specifier)?;
                for name in ns.names() {
                    if name != "default" {
                        self.ctx.exports.reexport(&name, ns.binding(&name))?;
                    }
                }
            }
            Stmt::Declare { name, expr } => {
                self.declare(&name)?;
                let value = self.eval(&expr)?;
                self.assign(&name, value)?;
            }
            Stmt::Assign { name, expr } => {
                match self.locals.get(&name) {
                    Some(Local::Value(_)) => {}
                    Some(_) => {
                        return Err(EvalError::Runtime(format!(
                            "TypeError: Assignment to constant variable '{}'",
                            name
                        )));
                    }
                    None => {
                        return Err(EvalError::Runtime(format!(
                            "ReferenceError: {} is not defined",
                            name
                        )));
                    }
                }
                let value = self.eval(&expr)?;
                self.assign(&name, value)?;
            }
            Stmt::Expr { expr } => {
                self.eval(&expr)?;
            }
        }
        Ok(())
    }

    fn declare(&mut self, name: &str) -> Result<(), EvalError> {
        if self.locals.contains_key(name) {
            return Err(EvalError::Runtime(format!(
                "SyntaxError: Identifier '{}' has already been declared",
                name
            )));
        }
        self.locals
            .insert(name.to_string(), Local::Value(BindingValue::Uninitialized));
        Ok(())
    }

    fn assign(&mut self, name: &str, value: Value) -> Result<(), EvalError> {
        self.locals.insert(
            name.to_string(),
            Local::Value(BindingValue::Value(value.clone())),
        );
        if let Some(exports) = self.exported.get(name) {
            for exported in exports {
                self.ctx.exports.define(exported, value.clone())?;
            }
        }
        Ok(())
    }

    fn eval(&self, expr: &str) -> Result<Value, EvalError> {
        let mut terms = split_top_level(expr, '+').into_iter();
        let first = terms.next().unwrap_or_default();
        let mut acc = self.eval_term(first)?;
        for term in terms {
            let rhs = self.eval_term(term)?;
            acc = add(acc, rhs);
        }
        Ok(acc)
    }

    fn eval_term(&self, term: &str) -> Result<Value, EvalError> {
        let term = term.trim();
        if term.is_empty() {
            return Err(EvalError::Runtime(
                "SyntaxError: Unexpected end of expression".to_string(),
            ));
        }

        if is_parenthesized(term) {
            return self.eval(&term[1..term.len() - 1]);
        }

        if (term.starts_with("import") && DYNAMIC_IMPORT.is_match(term))
            || term.starts_with("new Worker")
        {
            // Started by the host through the dynamic import API
            return Ok(Value::Null);
        }

        if let Some(inner) = term.strip_prefix('\'').and_then(|t| t.strip_suffix('\'')) {
            return Ok(Value::String(inner.replace("\\'", "'").replace("\\\\", "\\")));
        }

        let first = term.chars().next().unwrap_or_default();
        if first == '"'
            || first == '-'
            || first == '['
            || first == '{'
            || first.is_ascii_digit()
            || matches!(term, "true" | "false" | "null")
        {
            return serde_json::from_str(term).map_err(|e| {
                EvalError::Runtime(format!("SyntaxError: Invalid literal '{}': {}", term, e))
            });
        }

        self.lookup(term)
    }

    fn lookup(&self, path: &str) -> Result<Value, EvalError> {
        let mut parts = path.split('.').map(str::trim);
        let root = parts.next().unwrap_or_default();
        if !IDENTIFIER.is_match(root) {
            return Err(EvalError::Runtime(format!(
                "SyntaxError: Unsupported expression '{}'",
                path
            )));
        }

        let uninitialized =
            || EvalError::Runtime(format!("ReferenceError: Cannot access '{}' before initialization", root));

        let mut value = match self.locals.get(root) {
            Some(Local::Value(BindingValue::Value(v))) => v.clone(),
            Some(Local::Value(BindingValue::Uninitialized)) => return Err(uninitialized()),
            Some(Local::Import(binding)) => binding.read().into_value().ok_or_else(uninitialized)?,
            Some(Local::Namespace(ns)) => match parts.next() {
                Some(member) => {
                    if !ns.names().iter().any(|n| n == member) {
                        Value::Null
                    } else {
                        ns.read(member).into_value().ok_or_else(|| {
                            EvalError::Runtime(format!(
                                "ReferenceError: Cannot access '{}.{}' before initialization",
                                root, member
                            ))
                        })?
                    }
                }
                None => Value::Object(
                    ns.names()
                        .into_iter()
                        .filter_map(|name| ns.get(&name).map(|v| (name, v)))
                        .collect(),
                ),
            },
            None => {
                return Err(EvalError::Runtime(format!(
                    "ReferenceError: {} is not defined",
                    root
                )));
            }
        };

        for member in parts {
            if !IDENTIFIER.is_match(member) && member.parse::<usize>().is_err() {
                return Err(EvalError::Runtime(format!(
                    "SyntaxError: Unsupported expression '{}'",
                    path
                )));
            }
            value = match &value {
                Value::Object(map) => map.get(member).cloned().unwrap_or(Value::Null),
                Value::Array(items) => member
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| items.get(i).cloned())
                    .unwrap_or(Value::Null),
                _ => Value::Null,
            };
        }

        Ok(value)
    }
}

/// Whether the whole term is one parenthesized group
fn is_parenthesized(term: &str) -> bool {
    if !(term.starts_with('(') && term.ends_with(')')) {
        return false;
    }

    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in term.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return i == term.len() - 1;
                }
            }
            _ => {}
        }
    }
    false
}

/// `+` on JSON values: numeric addition, otherwise string concatenation
fn add(lhs: Value, rhs: Value) -> Value {
    match (&lhs, &rhs) {
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
                if let Some(sum) = a.checked_add(b) {
                    return Value::from(sum);
                }
            }
            let sum = a.as_f64().unwrap_or(f64::NAN) + b.as_f64().unwrap_or(f64::NAN);
            serde_json::Number::from_f64(sum)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
        _ => Value::String(format!("{}{}", display(&lhs), display(&rhs))),
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

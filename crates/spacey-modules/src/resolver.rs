// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Module specifier resolution
//!
//! Turns what an importer writes (`./a`, `/lib/b.js`, `#utils/date`, `vue`)
//! into a canonical [`ModuleKey`]. Resolution is pure: the only outside
//! question it asks is whether a path exists, through [`PathProbe`].

use crate::config::ResolveConfig;
use crate::error::ResolutionError;
use crate::host::PathProbe;
use crate::key::ModuleKey;

/// Result of module resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModule {
    /// Canonical key
    pub key: ModuleKey,
    /// Opaque module type tag (`json`, `css`, ...), if any
    pub module_type: Option<String>,
}

/// Specifier resolver driven by a [`ResolveConfig`]
#[derive(Debug, Clone)]
pub struct SpecifierResolver {
    config: ResolveConfig,
}

impl SpecifierResolver {
    /// Create a new resolver
    pub fn new(config: ResolveConfig) -> Self {
        Self { config }
    }

    /// Resolver configuration
    pub fn config(&self) -> &ResolveConfig {
        &self.config
    }

    /// Resolve a specifier to a canonical key
    pub fn resolve(
        &self,
        specifier: &str,
        from: Option<&ModuleKey>,
        probe: &dyn PathProbe,
    ) -> Result<ModuleKey, ResolutionError> {
        self.resolve_module(specifier, from, None, probe)
            .map(|resolved| resolved.key)
    }

    /// Resolve a specifier, also reporting its module type tag.
    ///
    /// `type_attribute` is the `type` of an import attribute (`with` or
    /// `assert`); it wins over the extension table.
    pub fn resolve_module(
        &self,
        specifier: &str,
        from: Option<&ModuleKey>,
        type_attribute: Option<&str>,
        probe: &dyn PathProbe,
    ) -> Result<ResolvedModule, ResolutionError> {
        let rewritten = self.apply_alias(specifier)?;
        let target = rewritten.as_deref().unwrap_or(specifier);

        let path = if is_relative(target) {
            let dir = from.map(|k| k.dir()).unwrap_or(&self.config.base_dir);
            join(dir, target)
        } else if target.starts_with('/') {
            normalize(target)
        } else {
            // Bare specifier with no alias entry
            return Err(ResolutionError::NotFound {
                specifier: specifier.to_string(),
                referrer: from.cloned(),
                tried: Vec::new(),
            });
        };

        let directory_only = target.ends_with('/');
        let key = self.probe_candidates(specifier, &path, directory_only, from, probe)?;

        let module_type = type_attribute
            .map(String::from)
            .or_else(|| self.type_tag(&key));

        Ok(ResolvedModule { key, module_type })
    }

    /// Type tag the extension table gives a key
    pub fn type_tag(&self, key: &ModuleKey) -> Option<String> {
        key.extension()
            .and_then(|ext| self.config.module_types.get(ext).cloned())
    }

    /// Rewrite a specifier through the alias map.
    ///
    /// The most specific entry wins; equally specific matches are ambiguous.
    fn apply_alias(&self, specifier: &str) -> Result<Option<String>, ResolutionError> {
        let mut best: Option<(usize, &str, String)> = None;
        let mut tied: Vec<&str> = Vec::new();

        for (entry, target) in &self.config.alias_map {
            let Some((specificity, rewritten)) = match_alias(entry, target, specifier) else {
                continue;
            };

            match &best {
                Some((current, _, _)) if specificity < *current => {}
                Some((current, _, _)) if specificity == *current => tied.push(entry),
                _ => {
                    best = Some((specificity, entry, rewritten));
                    tied.clear();
                }
            }
        }

        match best {
            Some((_, entry, _)) if !tied.is_empty() => {
                let mut prefixes = vec![entry.to_string()];
                prefixes.extend(tied.into_iter().map(String::from));
                Err(ResolutionError::AmbiguousAlias {
                    specifier: specifier.to_string(),
                    prefixes,
                })
            }
            Some((_, entry, rewritten)) => {
                tracing::debug!("Alias '{}' rewrote '{}' to '{}'", entry, specifier, rewritten);
                Ok(Some(rewritten))
            }
            None => Ok(None),
        }
    }

    /// Probe the exact path, then extensions, then directory index files
    fn probe_candidates(
        &self,
        specifier: &str,
        path: &str,
        directory_only: bool,
        from: Option<&ModuleKey>,
        probe: &dyn PathProbe,
    ) -> Result<ModuleKey, ResolutionError> {
        let mut tried = Vec::new();
        let mut check = |candidate: String| {
            let found = probe.exists(&candidate);
            tried.push(candidate);
            found
        };

        if !directory_only && check(path.to_string()) {
            return Ok(ModuleKey::new(path));
        }

        if self.config.allow_extensionless {
            if !directory_only {
                for ext in &self.config.extension_order {
                    let candidate = format!("{}{}", path, ext);
                    if check(candidate.clone()) {
                        return Ok(ModuleKey::new(candidate));
                    }
                }
            }

            for ext in &self.config.extension_order {
                let candidate = join(path, &format!("index{}", ext));
                if check(candidate.clone()) {
                    return Ok(ModuleKey::new(candidate));
                }
            }
        }

        Err(ResolutionError::NotFound {
            specifier: specifier.to_string(),
            referrer: from.cloned(),
            tried,
        })
    }
}

impl Default for SpecifierResolver {
    fn default() -> Self {
        Self::new(ResolveConfig::default())
    }
}

/// Match one alias entry, returning its specificity and the rewritten path
fn match_alias(entry: &str, target: &str, specifier: &str) -> Option<(usize, String)> {
    if let Some(prefix) = entry.strip_suffix('*') {
        let rest = specifier.strip_prefix(prefix)?;
        let rewritten = if target.contains('*') {
            target.replacen('*', rest, 1)
        } else {
            format!("{}{}", target, rest)
        };
        Some((prefix.len(), rewritten))
    } else if entry.ends_with('/') {
        let rest = specifier.strip_prefix(entry)?;
        Some((entry.len(), format!("{}{}", target, rest)))
    } else if specifier == entry {
        Some((entry.len(), target.to_string()))
    } else {
        None
    }
}

fn is_relative(specifier: &str) -> bool {
    specifier.starts_with("./")
        || specifier.starts_with("../")
        || specifier == "."
        || specifier == ".."
}

/// Join a relative path onto a directory and normalize the result
pub(crate) fn join(dir: &str, relative: &str) -> String {
    normalize(&format!("{}/{}", dir, relative))
}

/// Collapse `.`, `..` and empty segments into an absolute path
pub(crate) fn normalize(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    format!("/{}", segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::collections::HashSet;

    fn files(paths: &[&str]) -> impl Fn(&str) -> bool + Send + Sync + use<> {
        let set: HashSet<String> = paths.iter().map(|p| p.to_string()).collect();
        move |path: &str| set.contains(path)
    }

    fn mod_resolver() -> SpecifierResolver {
        SpecifierResolver::new(ResolveConfig {
            extension_order: vec![".mod".to_string(), ".idx.mod".to_string()],
            ..ResolveConfig::default()
        })
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/src/./a/../b.js"), "/src/b.js");
        assert_eq!(normalize("/../../x"), "/x");
        assert_eq!(normalize("//a//b/"), "/a/b");
        assert_eq!(join("/src", "../lib/c.js"), "/lib/c.js");
    }

    #[test]
    fn test_extension_probe_order() {
        let resolver = mod_resolver();
        let from = ModuleKey::new("/src/b.mod");

        let both = files(&["/src/a.mod", "/src/a.idx.mod"]);
        assert_eq!(
            resolver.resolve("./a", Some(&from), &both).unwrap(),
            ModuleKey::new("/src/a.mod")
        );

        let idx_only = files(&["/src/a.idx.mod"]);
        assert_eq!(
            resolver.resolve("./a", Some(&from), &idx_only).unwrap(),
            ModuleKey::new("/src/a.idx.mod")
        );

        let none = files(&[]);
        let err = resolver.resolve("./a", Some(&from), &none).unwrap_err();
        match err {
            ResolutionError::NotFound { tried, referrer, .. } => {
                assert_eq!(referrer, Some(from));
                assert_eq!(tried[0], "/src/a");
                assert_eq!(tried[1], "/src/a.mod");
                assert_eq!(tried[2], "/src/a.idx.mod");
                assert_eq!(tried[3], "/src/a/index.mod");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_exact_match_wins() {
        let resolver = SpecifierResolver::default();
        let probe = files(&["/lib/util.js", "/lib/util.js.js"]);
        assert_eq!(
            resolver.resolve("/lib/util.js", None, &probe).unwrap(),
            ModuleKey::new("/lib/util.js")
        );
    }

    #[test]
    fn test_directory_index() {
        let resolver = SpecifierResolver::default();
        let from = ModuleKey::new("/app/main.js");
        let probe = files(&["/app/features/index.js"]);

        assert_eq!(
            resolver.resolve("./features", Some(&from), &probe).unwrap(),
            ModuleKey::new("/app/features/index.js")
        );
        assert_eq!(
            resolver.resolve("./features/", Some(&from), &probe).unwrap(),
            ModuleKey::new("/app/features/index.js")
        );
    }

    #[test]
    fn test_strict_extensions() {
        let resolver = SpecifierResolver::new(ResolveConfig {
            allow_extensionless: false,
            ..ResolveConfig::default()
        });
        let probe = files(&["/utils.js"]);
        assert!(resolver.resolve("./utils", None, &probe).is_err());
        assert!(resolver.resolve("./utils.js", None, &probe).is_ok());
    }

    #[test]
    fn test_bare_specifier_not_found() {
        let resolver = SpecifierResolver::default();
        let probe = files(&["/lodash.js"]);
        assert!(matches!(
            resolver.resolve("lodash", None, &probe),
            Err(ResolutionError::NotFound { .. })
        ));
    }

    #[test]
    fn test_alias_kinds() {
        let mut alias_map = BTreeMap::new();
        alias_map.insert("vue".to_string(), "/vendor/vue.js".to_string());
        alias_map.insert("lib/".to_string(), "/vendor/lib/".to_string());
        alias_map.insert("#utils/*".to_string(), "./src/utils/*.js".to_string());
        alias_map.insert("@/*".to_string(), "/src/".to_string());

        let resolver = SpecifierResolver::new(ResolveConfig {
            alias_map,
            ..ResolveConfig::default()
        });
        let probe = files(&[
            "/vendor/vue.js",
            "/vendor/lib/testing.js",
            "/src/utils/date.js",
            "/src/components/button.js",
        ]);

        assert_eq!(
            resolver.resolve("vue", None, &probe).unwrap().as_str(),
            "/vendor/vue.js"
        );
        assert_eq!(
            resolver.resolve("lib/testing", None, &probe).unwrap().as_str(),
            "/vendor/lib/testing.js"
        );
        assert_eq!(
            resolver.resolve("#utils/date", None, &probe).unwrap().as_str(),
            "/src/utils/date.js"
        );
        assert_eq!(
            resolver
                .resolve("@/components/button.js", None, &probe)
                .unwrap()
                .as_str(),
            "/src/components/button.js"
        );
        // Exact entries do not act as prefixes
        assert!(resolver.resolve("vue/extra", None, &probe).is_err());
    }

    #[test]
    fn test_longest_alias_wins() {
        let mut alias_map = BTreeMap::new();
        alias_map.insert("#lib/".to_string(), "/generic/".to_string());
        alias_map.insert("#lib/admin/".to_string(), "/admin/".to_string());

        let resolver = SpecifierResolver::new(ResolveConfig {
            alias_map,
            ..ResolveConfig::default()
        });
        let probe = files(&["/admin/ui.js", "/generic/admin/ui.js"]);
        assert_eq!(
            resolver.resolve("#lib/admin/ui.js", None, &probe).unwrap().as_str(),
            "/admin/ui.js"
        );
    }

    #[test]
    fn test_ambiguous_alias() {
        let mut alias_map = BTreeMap::new();
        alias_map.insert("#a/".to_string(), "/one/".to_string());
        alias_map.insert("#a/*".to_string(), "/two/*".to_string());

        let resolver = SpecifierResolver::new(ResolveConfig {
            alias_map,
            ..ResolveConfig::default()
        });
        let probe = files(&["/one/x.js", "/two/x.js"]);
        match resolver.resolve("#a/x.js", None, &probe) {
            Err(ResolutionError::AmbiguousAlias { prefixes, .. }) => {
                assert_eq!(prefixes.len(), 2);
                assert!(prefixes.contains(&"#a/".to_string()));
                assert!(prefixes.contains(&"#a/*".to_string()));
            }
            other => panic!("expected ambiguity, got {:?}", other),
        }
    }

    #[test]
    fn test_module_type_tags() {
        let resolver = SpecifierResolver::default();
        let probe = files(&["/data.json", "/styles.css", "/app.js"]);

        let json = resolver.resolve_module("./data.json", None, None, &probe).unwrap();
        assert_eq!(json.module_type.as_deref(), Some("json"));

        let plain = resolver.resolve_module("./app.js", None, None, &probe).unwrap();
        assert_eq!(plain.module_type, None);

        let attributed = resolver
            .resolve_module("./styles.css", None, Some("css-sheet"), &probe)
            .unwrap();
        assert_eq!(attributed.module_type.as_deref(), Some("css-sheet"));
    }
}

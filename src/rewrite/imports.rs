//! Import bookkeeping for one file.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

/// Upper bound on suffixes tried by [`next_name`].
pub const MAX_NAME_ATTEMPTS: usize = 100_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImportError {
    #[error("package name cannot be empty")]
    EmptyName,

    #[error("import path cannot be empty")]
    EmptyPath,

    #[error("inconsistent name of package {path}: given {given}, previous {previous}")]
    InconsistentName {
        path: String,
        given: String,
        previous: String,
    },

    #[error("duplicate import {path:?}")]
    DuplicateImport { path: String },

    #[error("no free name derived from {name} after {MAX_NAME_ATTEMPTS} attempts")]
    NamesExhausted { name: String },
}

/// First of `name`, `name1`, `name2`, ... accepted by `accept`.
pub fn next_name(name: &str, mut accept: impl FnMut(&str) -> bool) -> Result<String, ImportError> {
    if accept(name) {
        return Ok(name.to_string());
    }
    for i in 1..MAX_NAME_ATTEMPTS {
        let candidate = format!("{name}{i}");
        if accept(&candidate) {
            return Ok(candidate);
        }
    }
    Err(ImportError::NamesExhausted {
        name: name.to_string(),
    })
}

/// Package name implied by an import path: the last element, skipping a
/// trailing major-version element such as `v2`.
pub fn default_package_name(path: &str) -> String {
    let mut elems = path.rsplit('/').filter(|e| !e.is_empty());
    let mut last = elems.next().unwrap_or(path);
    if is_major_version(last) {
        if let Some(prev) = elems.next() {
            last = prev;
        }
    }
    // gopkg.in/yaml.v3
    if let Some((stem, suffix)) = last.rsplit_once('.') {
        if is_major_version(suffix) {
            last = stem;
        }
    }
    last.replace(['-', '.'], "_")
}

fn is_major_version(elem: &str) -> bool {
    elem.strip_prefix('v')
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

/// An import introduced by [`ImportList::must_import`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewImport {
    /// Empty when the package is used under its own name.
    pub alias: String,
    pub path: String,
}

impl NewImport {
    /// Import spec text: `alias "path"` or `"path"`.
    pub fn spec(&self) -> String {
        if self.alias.is_empty() {
            format!("{:?}", self.path)
        } else {
            format!("{} {:?}", self.alias, self.path)
        }
    }
}

/// Result of [`ImportList::must_import`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    /// Name to reference the package by.
    pub name: String,
    /// Set when a new import has to be emitted.
    pub new_import: Option<NewImport>,
}

/// Tracks, per import path, the package's own name and every local name
/// bound to it, plus which path owns each local name.
#[derive(Debug, Default)]
pub struct ImportList {
    names: HashMap<String, String>,
    aliases: HashMap<String, HashSet<String>>,
    uses: HashMap<String, String>,
    added: Vec<NewImport>,
}

impl ImportList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an import already present in the file. `alias` is empty for an
    /// unaliased import.
    pub fn seed(&mut self, path: &str, name: &str, alias: &str) -> Result<(), ImportError> {
        self.check_name(path, name)?;
        let aliases = self.aliases.entry(path.to_string()).or_default();
        if !aliases.insert(alias.to_string()) {
            return Err(ImportError::DuplicateImport {
                path: path.to_string(),
            });
        }
        let used = if alias.is_empty() { name } else { alias };
        self.uses.insert(used.to_string(), path.to_string());
        Ok(())
    }

    /// Make `path` importable and return the name to use for it.
    ///
    /// `suggested_alias` defaults to `name`. A taken or forbidden name is
    /// replaced by the next free `nameN`. `_` asks for a bare import and
    /// introduces no name; it is emitted only if the path is not imported yet.
    pub fn must_import(
        &mut self,
        path: &str,
        name: &str,
        suggested_alias: Option<&str>,
        forbidden: Option<&dyn Fn(&str) -> bool>,
    ) -> Result<Resolved, ImportError> {
        self.check_name(path, name)?;
        let mut used = suggested_alias.filter(|a| !a.is_empty()).unwrap_or(name).to_string();

        let already_imported = self.aliases.get(path).is_some_and(|a| !a.is_empty());
        if used == "_" && already_imported {
            return Ok(Resolved {
                name: used,
                new_import: None,
            });
        }

        if used != "_" {
            let uses = &self.uses;
            used = next_name(&used, |candidate| {
                if forbidden.is_some_and(|f| f(candidate)) {
                    return false;
                }
                !matches!(uses.get(candidate), Some(owner) if owner != path)
            })?;

            let aliases = self.aliases.entry(path.to_string()).or_default();
            if aliases.contains(&used) || (used == name && aliases.contains("")) {
                return Ok(Resolved {
                    name: used,
                    new_import: None,
                });
            }
            aliases.insert(used.clone());
            self.uses.insert(used.clone(), path.to_string());
        } else {
            self.aliases
                .entry(path.to_string())
                .or_default()
                .insert(used.clone());
        }

        let import = NewImport {
            alias: if used == name { String::new() } else { used.clone() },
            path: path.to_string(),
        };
        self.added.push(import.clone());
        Ok(Resolved {
            name: used,
            new_import: Some(import),
        })
    }

    /// Imports introduced through [`ImportList::must_import`], in order.
    pub fn added(&self) -> &[NewImport] {
        &self.added
    }

    fn check_name(&mut self, path: &str, name: &str) -> Result<(), ImportError> {
        if name.is_empty() {
            return Err(ImportError::EmptyName);
        }
        if path.is_empty() {
            return Err(ImportError::EmptyPath);
        }
        match self.names.get(path) {
            None => {
                self.names.insert(path.to_string(), name.to_string());
                Ok(())
            }
            Some(previous) if previous == name => Ok(()),
            Some(previous) => Err(ImportError::InconsistentName {
                path: path.to_string(),
                given: name.to_string(),
                previous: previous.clone(),
            }),
        }
    }
}

//! Reading `shadowbuild.toml`.
//!
//! Loading parses, resolves relative directories against the file's own
//! directory, then validates everything at once: the settings themselves and
//! every rule's replacement template against its pattern.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::schema::{RuleDefinition, RuleSurface, Settings, ValidationError, ValidationIssue};

/// Where settings text came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Inline,
    File(PathBuf),
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Inline => f.write_str("<inline>"),
            Origin::File(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read settings {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse settings {origin}: {source}")]
    Parse {
        origin: Origin,
        #[source]
        source: toml_edit::de::Error,
    },

    #[error("invalid settings {origin}:\n{source}")]
    Invalid {
        origin: Origin,
        #[source]
        source: ValidationError,
    },
}

impl ConfigError {
    pub fn origin(&self) -> Origin {
        match self {
            ConfigError::Read { path, .. } => Origin::File(path.clone()),
            ConfigError::Parse { origin, .. } | ConfigError::Invalid { origin, .. } => {
                origin.clone()
            }
        }
    }
}

/// Parse settings that are not backed by a file. Relative directories stay
/// as written, so extra modules must use absolute dirs.
pub fn load_from_str(input: &str) -> Result<Settings, ConfigError> {
    load(input, Origin::Inline)
}

/// Parse `path`. Relative `rewrite.base_dir`, `build.go_cache` and extra
/// module dirs are taken relative to the directory holding the file.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Settings, ConfigError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    load(&contents, Origin::File(path.to_path_buf()))
}

fn load(input: &str, origin: Origin) -> Result<Settings, ConfigError> {
    let mut settings: Settings =
        toml_edit::de::from_str(input).map_err(|source| ConfigError::Parse {
            origin: origin.clone(),
            source,
        })?;

    if let Origin::File(path) = &origin {
        if let Some(dir) = path.parent() {
            resolve_relative(&mut settings, dir);
        }
    }

    let mut issues = match settings.validate() {
        Ok(()) => Vec::new(),
        Err(e) => e.issues,
    };
    for rule in &settings.rules {
        issues.extend(template_issues(rule));
    }
    if !issues.is_empty() {
        return Err(ConfigError::Invalid {
            origin,
            source: ValidationError { issues },
        });
    }

    let surfaces: HashSet<RuleSurface> = settings.rules.iter().map(|r| r.surface).collect();
    if surfaces.len() > 1 {
        warn!(
            %origin,
            "rules mix edit and rewrite surfaces; a file matched by both fails as a duplicate output"
        );
    }
    debug!(%origin, rules = settings.rules.len(), extras = settings.extras.len(), "loaded settings");
    Ok(settings)
}

fn resolve_relative(settings: &mut Settings, dir: &Path) {
    let absolute = |p: &mut PathBuf| {
        if p.is_relative() {
            *p = dir.join(&*p);
        }
    };
    if let Some(base) = settings.rewrite.base_dir.as_mut() {
        absolute(base);
    }
    if let Some(cache) = settings.build.go_cache.as_mut() {
        absolute(cache);
    }
    for extra in &mut settings.extras {
        absolute(&mut extra.dir);
    }
}

fn metavar_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    RE.get_or_init(|| Regex::new(r"\$(?:\$\$)?([A-Z_][A-Z0-9_]*)").expect("invalid metavariable regex"))
}

/// Replacement metavariables must be captured by the pattern, or be
/// `$IMPORTn` naming one of the rule's imports.
fn template_issues(rule: &RuleDefinition) -> Vec<ValidationIssue> {
    let captured: HashSet<&str> = metavar_regex()
        .captures_iter(&rule.pattern)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();

    let mut issues = Vec::new();
    let mut reported = HashSet::new();
    for name in metavar_regex()
        .captures_iter(&rule.replacement)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
    {
        if captured.contains(name) || !reported.insert(name) {
            continue;
        }
        match name.strip_prefix("IMPORT").and_then(|n| n.parse::<usize>().ok()) {
            Some(index) if index < rule.imports.len() => {}
            Some(index) => issues.push(ValidationIssue::ImportOutOfRange {
                rule_id: rule.id.clone(),
                index,
                imports: rule.imports.len(),
            }),
            None => issues.push(ValidationIssue::UnknownCapture {
                rule_id: rule.id.clone(),
                name: name.to_string(),
            }),
        }
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::DEFAULT_IGNORES;
    use tempfile::TempDir;

    #[test]
    fn empty_file_gives_defaults() {
        let settings = load_from_str("").unwrap();
        assert_eq!(settings.sync.ignores.len(), DEFAULT_IGNORES.len());
        assert!(settings.sync.delete_not_found);
        assert_eq!(settings.sync.progress_interval_ms, 200);
        assert_eq!(settings.rewrite.name, "shadowbuild");
        assert_eq!(settings.build.go_binary, "go");
        assert!(settings.rules.is_empty());
    }

    #[test]
    fn full_settings() {
        let settings = load_from_str(
            r#"
[sync]
workers = 8
ignores = ["\\.idea"]

[rewrite]
name = "trace"
base_dir = "/var/tmp"
force = true

[build]
flags = ["-race"]
debug = true

[[extras]]
path = "github.com/acme/lib"
dir = "/gopath/pkg/mod/github.com/acme/lib@v1.2.0"
version = "v1.2.0"

[[rules]]
id = "log-calls"
pattern = "fmt.Println($$$ARGS)"
replacement = "$IMPORT0.Log($$$ARGS)"
imports = ["example.com/trace"]
surface = "rewrite"
"#,
        )
        .unwrap();
        assert_eq!(settings.sync.workers, 8);
        assert_eq!(settings.sync.ignores, vec![r"\.idea".to_string()]);
        assert_eq!(settings.rewrite.name, "trace");
        assert!(settings.rewrite.force);
        assert_eq!(settings.build.flags, vec!["-race".to_string()]);
        assert_eq!(settings.extras[0].version.as_deref(), Some("v1.2.0"));
        assert_eq!(settings.rules[0].surface, RuleSurface::Rewrite);
    }

    #[test]
    fn invalid_settings_report_every_issue() {
        let err = load_from_str(
            r#"
[sync]
ignores = ["("]

[rewrite]
name = ""

[[rules]]
id = "a"
pattern = ""
replacement = "x"

[[rules]]
id = "a"
pattern = "f()"
replacement = "g()"
"#,
        )
        .unwrap_err();
        assert_eq!(err.origin(), Origin::Inline);
        let ConfigError::Invalid { source, .. } = err else {
            panic!("expected validation error, got {err}");
        };
        assert!(source
            .issues
            .iter()
            .any(|i| matches!(i, ValidationIssue::DuplicateRule { .. })));
        assert!(source.issues.len() >= 4);
    }

    #[test]
    fn replacement_must_reference_known_captures() {
        let err = load_from_str(
            r#"
[[rules]]
id = "swap"
pattern = "fmt.Println($A, $$$REST)"
replacement = "$IMPORT0.Print($B, $A, $IMPORT1, $$$REST, $B)"
imports = ["log"]
"#,
        )
        .unwrap_err();
        let ConfigError::Invalid { source, .. } = err else {
            panic!("expected validation error, got {err}");
        };
        assert_eq!(source.issues.len(), 2);
        assert!(matches!(
            &source.issues[0],
            ValidationIssue::UnknownCapture { rule_id, name } if rule_id == "swap" && name == "B"
        ));
        assert!(matches!(
            source.issues[1],
            ValidationIssue::ImportOutOfRange { index: 1, imports: 1, .. }
        ));
    }

    #[test]
    fn parse_errors_name_the_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shadowbuild.toml");
        fs::write(&path, "[sync\n").unwrap();
        let err = load_from_path(&path).unwrap_err();
        assert!(matches!(&err, ConfigError::Parse { origin: Origin::File(p), .. } if *p == path));
        assert!(err.to_string().contains("shadowbuild.toml"));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.toml");
        let err = load_from_path(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert_eq!(err.origin(), Origin::File(path));
    }

    #[test]
    fn relative_dirs_follow_the_config_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shadowbuild.toml");
        fs::write(
            &path,
            r#"
[rewrite]
base_dir = "out"

[build]
go_cache = "/var/cache/go"

[[extras]]
path = "example.com/lib"
dir = "../lib"
"#,
        )
        .unwrap();
        let settings = load_from_path(&path).unwrap();
        assert_eq!(settings.rewrite.base_dir, Some(dir.path().join("out")));
        assert_eq!(settings.build.go_cache, Some(PathBuf::from("/var/cache/go")));
        assert_eq!(settings.extras[0].dir, dir.path().join("../lib"));

        // without a file there is nothing to resolve against
        let err = load_from_str("[[extras]]\npath = \"example.com/lib\"\ndir = \"../lib\"\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }
}

use regex::Regex;
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;

/// Ignore patterns applied to every sync unless configured otherwise.
pub const DEFAULT_IGNORES: &[&str] = &[r"(.*/)?\.git\b", r"(.*/)?node_modules\b"];

/// Environment variable naming the Go build cache directory.
pub const GOCACHE_ENV: &str = "SHADOWBUILD_GOCACHE";

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Settings {
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub rewrite: RewriteSettings,
    #[serde(default)]
    pub build: BuildSettings,
    /// Foreign modules rewritten together with the target.
    #[serde(default)]
    pub extras: Vec<ExtraModule>,
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncSettings {
    #[serde(default = "default_ignores")]
    pub ignores: Vec<String>,
    /// 0 uses the engine default.
    #[serde(default)]
    pub workers: usize,
    #[serde(default = "default_true")]
    pub delete_not_found: bool,
    #[serde(default = "default_progress_interval")]
    pub progress_interval_ms: u64,
    #[serde(default)]
    pub verbose: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            ignores: default_ignores(),
            workers: 0,
            delete_not_found: true,
            progress_interval_ms: default_progress_interval(),
            verbose: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RewriteSettings {
    /// Directory name under `base_dir` holding every project's shadow tree.
    #[serde(default = "default_name")]
    pub name: String,
    /// Defaults to the system temp directory.
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
    #[serde(default)]
    pub rewrite_std: bool,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub include_tests: bool,
    /// Drive visitors from the rayon pool.
    #[serde(default)]
    pub parallel: bool,
}

impl Default for RewriteSettings {
    fn default() -> Self {
        Self {
            name: default_name(),
            base_dir: None,
            rewrite_std: false,
            force: false,
            include_tests: false,
            parallel: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BuildSettings {
    #[serde(default = "default_go_binary")]
    pub go_binary: String,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub disable_trim_path: bool,
    #[serde(default)]
    pub go_cache: Option<PathBuf>,
    /// Build without optimizations for debuggers.
    #[serde(default)]
    pub debug: bool,
    /// Build the test binary (`go test -c`).
    #[serde(default)]
    pub test: bool,
    #[serde(default)]
    pub output: Option<PathBuf>,
    /// Package pattern passed to the build tool.
    #[serde(default = "default_package")]
    pub package: String,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            go_binary: default_go_binary(),
            flags: Vec::new(),
            disable_trim_path: false,
            go_cache: None,
            debug: false,
            test: false,
            output: None,
            package: default_package(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ExtraModule {
    pub path: String,
    pub dir: PathBuf,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub std: bool,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum RuleSurface {
    /// Localized edits to the file.
    #[default]
    Edit,
    /// Whole-file rewrite.
    Rewrite,
}

/// Replace every node matching `pattern` with `replacement`, where
/// `$NAME`/`$$$NAME` refer to the pattern's captures.
#[derive(Debug, Deserialize, Clone)]
pub struct RuleDefinition {
    pub id: String,
    pub pattern: String,
    pub replacement: String,
    /// Import paths the replacement relies on.
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(default)]
    pub surface: RuleSurface,
}

fn default_ignores() -> Vec<String> {
    DEFAULT_IGNORES.iter().map(|s| s.to_string()).collect()
}

fn default_true() -> bool {
    true
}

fn default_progress_interval() -> u64 {
    200
}

fn default_name() -> String {
    "shadowbuild".to_string()
}

fn default_go_binary() -> String {
    "go".to_string()
}

fn default_package() -> String {
    "./".to_string()
}

impl Settings {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut issues = Vec::new();

        if self.rewrite.name.trim().is_empty() {
            issues.push(ValidationIssue::MissingField {
                rule_id: None,
                field: "rewrite.name",
            });
        }
        if self.rewrite.name.contains(['/', '\\']) {
            issues.push(ValidationIssue::InvalidValue {
                field: "rewrite.name",
                message: "must be a single directory name".to_string(),
            });
        }
        if self.sync.progress_interval_ms == 0 {
            issues.push(ValidationIssue::InvalidValue {
                field: "sync.progress_interval_ms",
                message: "must be positive".to_string(),
            });
        }
        for pattern in &self.sync.ignores {
            if let Err(e) = Regex::new(pattern) {
                issues.push(ValidationIssue::InvalidValue {
                    field: "sync.ignores",
                    message: format!("{pattern}: {e}"),
                });
            }
        }
        if self.build.go_binary.trim().is_empty() {
            issues.push(ValidationIssue::MissingField {
                rule_id: None,
                field: "build.go_binary",
            });
        }

        for extra in &self.extras {
            if extra.path.trim().is_empty() {
                issues.push(ValidationIssue::MissingField {
                    rule_id: None,
                    field: "extras.path",
                });
            }
            if !extra.dir.is_absolute() {
                issues.push(ValidationIssue::InvalidValue {
                    field: "extras.dir",
                    message: format!("{} is not absolute", extra.dir.display()),
                });
            }
        }

        let mut seen = Vec::new();
        for rule in &self.rules {
            if rule.id.trim().is_empty() {
                issues.push(ValidationIssue::MissingField {
                    rule_id: None,
                    field: "id",
                });
            } else if seen.contains(&rule.id.as_str()) {
                issues.push(ValidationIssue::DuplicateRule {
                    rule_id: rule.id.clone(),
                });
            } else {
                seen.push(rule.id.as_str());
            }
            if rule.pattern.trim().is_empty() {
                issues.push(ValidationIssue::MissingField {
                    rule_id: Some(rule.id.clone()),
                    field: "pattern",
                });
            }
            if rule.imports.iter().any(|i| i.trim().is_empty()) {
                issues.push(ValidationIssue::MissingField {
                    rule_id: Some(rule.id.clone()),
                    field: "imports",
                });
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { issues })
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, issue) in self.issues.iter().enumerate() {
            if idx > 0 {
                writeln!(f)?;
            }
            write!(f, "{issue}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug, Clone)]
pub enum ValidationIssue {
    MissingField {
        rule_id: Option<String>,
        field: &'static str,
    },
    InvalidValue {
        field: &'static str,
        message: String,
    },
    DuplicateRule {
        rule_id: String,
    },
    /// The replacement names a metavariable the pattern never captures.
    UnknownCapture {
        rule_id: String,
        name: String,
    },
    /// `$IMPORTn` with no n-th entry in `imports`.
    ImportOutOfRange {
        rule_id: String,
        index: usize,
        imports: usize,
    },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::MissingField { rule_id, field } => match rule_id {
                Some(id) => write!(f, "rule '{id}' missing required field '{field}'"),
                None => write!(f, "missing required field '{field}'"),
            },
            ValidationIssue::InvalidValue { field, message } => {
                write!(f, "invalid value for '{field}': {message}")
            }
            ValidationIssue::DuplicateRule { rule_id } => {
                write!(f, "rule id '{rule_id}' is used more than once")
            }
            ValidationIssue::UnknownCapture { rule_id, name } => {
                write!(f, "rule '{rule_id}' replacement uses ${name}, which the pattern does not capture")
            }
            ValidationIssue::ImportOutOfRange {
                rule_id,
                index,
                imports,
            } => write!(
                f,
                "rule '{rule_id}' replacement uses $IMPORT{index} but only {imports} imports are listed"
            ),
        }
    }
}

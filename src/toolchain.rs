//! Building the rewritten tree with the Go toolchain.
//!
//! The build runs inside the shadow copy of the project. Debug info is
//! mapped back to the original paths through `-trimpath`, so debuggers and
//! stack traces show the user's files.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::BuildSettings;
use crate::context::RunContext;
use crate::filecopy::rebase_path;

/// Cross-compilation target forwarded as `GOOS`.
pub const TARGET_GOOS_ENV: &str = "TARGET_GOOS";
/// Cross-compilation target forwarded as `GOARCH`.
pub const TARGET_GOARCH_ENV: &str = "TARGET_GOARCH";

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("build of {output} failed ({status})\n{stderr}")]
    Failed {
        output: PathBuf,
        status: String,
        stdout: String,
        stderr: String,
    },

    #[error("trim path target for {from} must not be empty")]
    EmptyTrimTarget { from: PathBuf },
}

/// Facts from the rewrite pass the build depends on.
#[derive(Debug, Clone, Default)]
pub struct BuildInputs {
    /// Original module dir -> `@`-free dir of its shadow copy.
    pub mapped_mod: BTreeMap<PathBuf, PathBuf>,
    /// The standard library was rewritten into the shadow tree.
    pub std_relocated: bool,
}

/// One fully resolved toolchain invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPlan {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub work_dir: PathBuf,
    pub output: PathBuf,
}

impl BuildPlan {
    /// Resolve flags, environment and output for `packages`.
    pub fn new(
        ctx: &RunContext,
        settings: &BuildSettings,
        inputs: &BuildInputs,
        packages: &[String],
    ) -> Result<Self, BuildError> {
        let output = output_path(&ctx.project_dir, settings);
        let work_dir = ctx.shadow_project_dir();

        let mut gcflags: Vec<String> = Vec::new();
        if settings.debug {
            gcflags.push("-N".to_string());
            gcflags.push("-l".to_string());
        }
        if !settings.disable_trim_path {
            gcflags.push(format!(
                "-trimpath={}",
                trim_path_list(ctx, &inputs.mapped_mod)?
            ));
        }

        let mut args = Vec::new();
        if settings.test {
            args.push("test".to_string());
            args.push("-c".to_string());
        } else {
            args.push("build".to_string());
        }
        args.push("-o".to_string());
        args.push(output.to_string_lossy().into_owned());
        // the toolchain honors only the last -gcflags, so everything goes in one
        if !gcflags.is_empty() {
            args.push(format!("-gcflags=all={}", gcflags.join(" ")));
        }
        args.extend(settings.flags.iter().cloned());
        if packages.is_empty() {
            args.push(settings.package.clone());
        } else {
            args.extend(packages.iter().cloned());
        }

        let mut vars = vec![(
            "GOCACHE".to_string(),
            ctx.go_cache.to_string_lossy().into_owned(),
        )];
        if inputs.std_relocated {
            if let Some(goroot) = &ctx.goroot {
                let relocated = rebase_path(&ctx.shadow_root, goroot);
                vars.push((
                    "GOROOT".to_string(),
                    relocated.to_string_lossy().into_owned(),
                ));
            } else {
                warn!("standard library was rewritten but GOROOT is unknown");
            }
        }
        for (from, to) in [(TARGET_GOOS_ENV, "GOOS"), (TARGET_GOARCH_ENV, "GOARCH")] {
            if let Ok(value) = env::var(from) {
                if !value.is_empty() {
                    vars.push((to.to_string(), value));
                }
            }
        }

        Ok(Self {
            program: settings.go_binary.clone(),
            args,
            env: vars,
            work_dir,
            output,
        })
    }

    /// Shell-like rendering for logs.
    pub fn command_line(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().map(|a| {
            if a.contains(char::is_whitespace) {
                format!("{a:?}")
            } else {
                a.clone()
            }
        }));
        parts.join(" ")
    }
}

/// Default output is `exec[-test].bin`, or `debug[-test].bin` for debug
/// builds, inside the project directory.
pub fn output_path(project_dir: &Path, settings: &BuildSettings) -> PathBuf {
    if let Some(output) = &settings.output {
        return if output.is_absolute() {
            output.clone()
        } else {
            project_dir.join(output)
        };
    }
    let mut name = String::from(if settings.debug { "debug" } else { "exec" });
    if settings.test {
        name.push_str("-test");
    }
    name.push_str(".bin");
    project_dir.join(name)
}

/// `<shadow>/<project>=><project>` plus one mapping per relocated module,
/// joined with `;`.
pub fn trim_path_list(
    ctx: &RunContext,
    mapped_mod: &BTreeMap<PathBuf, PathBuf>,
) -> Result<String, BuildError> {
    let mut list = vec![trim_entry(&ctx.shadow_project_dir(), &ctx.project_dir)?];
    for (orig, cleaned) in mapped_mod {
        list.push(trim_entry(&rebase_path(&ctx.shadow_root, cleaned), orig)?);
    }
    Ok(list.join(";"))
}

fn trim_entry(from: &Path, to: &Path) -> Result<String, BuildError> {
    if to.as_os_str().is_empty() {
        return Err(BuildError::EmptyTrimTarget {
            from: from.to_path_buf(),
        });
    }
    if to == Path::new("/") {
        warn!(from = %from.display(), "trim path maps to /, expected at least one child");
    }
    Ok(format!("{}=>{}", from.display(), to.display()))
}

/// Runs a resolved plan.
pub trait BuildTool {
    fn build(&self, plan: &BuildPlan) -> Result<PathBuf, BuildError>;
}

/// Spawns the Go binary and captures its output.
#[derive(Debug, Default, Clone, Copy)]
pub struct GoTool;

impl BuildTool for GoTool {
    fn build(&self, plan: &BuildPlan) -> Result<PathBuf, BuildError> {
        info!(dir = %plan.work_dir.display(), "{}", plan.command_line());
        let mut cmd = Command::new(&plan.program);
        cmd.current_dir(&plan.work_dir)
            .args(&plan.args)
            .envs(plan.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let Output {
            status,
            stdout,
            stderr,
        } = cmd.output().map_err(|source| BuildError::Spawn {
            program: plan.program.clone(),
            source,
        })?;

        if !status.success() {
            return Err(BuildError::Failed {
                output: plan.output.clone(),
                status: status.to_string(),
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            });
        }
        debug!(output = %plan.output.display(), "build finished");
        Ok(plan.output.clone())
    }
}

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use shadowbuild::config::{self, ExtraModule, Settings};
use shadowbuild::filecopy::{clean_go_fs_path, sync, ProgressLogger, RebaseSource, SyncOptions};
use shadowbuild::gomod::{relocate, GoMod, ModuleRef, RelocateInput};
use shadowbuild::{logging, GoTool, Pipeline, RunContext, RunReport, ShadowGuard};
use similar::{ChangeTag, TextDiff};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings file looked up in the project directory when `--config` is absent.
const DEFAULT_CONFIG: &str = "shadowbuild.toml";

#[derive(Parser)]
#[command(name = "shadowbuild")]
#[command(about = "Rewrite Go sources into a shadow build root", long_about = None)]
#[command(version)]
struct Cli {
    /// Log debug details
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mirror source directories into a destination root
    Sync {
        /// Source files or directories
        #[arg(required = true)]
        sources: Vec<PathBuf>,

        /// Destination root; sources land at <dest>/<absolute source path>
        #[arg(short, long)]
        dest: PathBuf,

        /// Remove destination entries missing from the sources
        #[arg(long)]
        delete: bool,

        /// Copy every file regardless of modification time
        #[arg(short, long)]
        force: bool,

        /// Regex of source paths to skip (repeatable)
        #[arg(long = "ignore")]
        ignores: Vec<String>,

        /// Copy workers (default 50)
        #[arg(long, default_value_t = 0)]
        workers: usize,
    },

    /// Show how go.mod would be rewritten for the shadow root
    Relocate {
        /// Project directory holding go.mod
        #[arg(short, long, default_value = ".")]
        project: PathBuf,

        /// Rewritten dependency as PATH=DIR[@VER] (repeatable)
        #[arg(long = "extra")]
        extras: Vec<String>,

        /// Shadow root (defaults to the one `run` would use)
        #[arg(long)]
        shadow: Option<PathBuf>,

        /// Show unified diff of changes
        #[arg(short, long)]
        diff: bool,
    },

    /// Rewrite the project into its shadow root and build it
    Run {
        /// Project directory holding go.mod
        #[arg(short, long, default_value = ".")]
        project: PathBuf,

        /// Settings file (defaults to <project>/shadowbuild.toml when present)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Ignore cached state and rewrite everything
        #[arg(short, long)]
        force: bool,

        /// Stop after the shadow tree is ready
        #[arg(long)]
        skip_build: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match cli.command {
        Commands::Sync {
            sources,
            dest,
            delete,
            force,
            ignores,
            workers,
        } => cmd_sync(sources, dest, delete, force, ignores, workers, cli.verbose),

        Commands::Relocate {
            project,
            extras,
            shadow,
            diff,
        } => cmd_relocate(project, extras, shadow, diff),

        Commands::Run {
            project,
            config,
            force,
            skip_build,
        } => cmd_run(project, config, force, skip_build),
    }
}

/// Helper: Show unified diff between original and rewritten content
fn display_diff(file: &Path, original: &str, modified: &str) {
    println!(
        "\n{}",
        format!("--- {} (original)", file.display()).dimmed()
    );
    println!("{}", format!("+++ {} (shadow)", file.display()).dimmed());

    let diff = TextDiff::from_lines(original, modified);

    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Delete => format!("-{}", change).red(),
            ChangeTag::Insert => format!("+{}", change).green(),
            ChangeTag::Equal => format!(" {}", change).normal(),
        };
        print!("{}", sign);
    }
}

/// Parse `PATH=DIR[@VER]`. Module cache dirs contain `@` themselves, so an
/// existing DIR is taken whole.
fn parse_extra(spec: &str) -> Result<ExtraModule> {
    let (path, rest) = spec
        .split_once('=')
        .with_context(|| format!("extra module {spec:?} is not PATH=DIR[@VER]"))?;
    let (dir, version) = match rest.rsplit_once('@') {
        Some((dir, ver)) if !Path::new(rest).exists() => (dir, Some(ver.to_string())),
        _ => (rest, None),
    };
    let dir = fs::canonicalize(dir).with_context(|| format!("extra module dir {dir}"))?;
    Ok(ExtraModule {
        path: path.to_string(),
        dir,
        version,
        std: false,
    })
}

fn load_settings(project: &Path, config: Option<PathBuf>) -> Result<Settings> {
    let path = config.or_else(|| {
        let candidate = project.join(DEFAULT_CONFIG);
        candidate.is_file().then_some(candidate)
    });
    match path {
        Some(path) => {
            println!("{}", format!("Settings: {}", path.display()).dimmed());
            Ok(config::load_from_path(&path)?)
        }
        None => Ok(Settings::default()),
    }
}

fn cmd_sync(
    sources: Vec<PathBuf>,
    dest: PathBuf,
    delete: bool,
    force: bool,
    ignores: Vec<String>,
    workers: usize,
    verbose: bool,
) -> Result<()> {
    let roots = sources
        .iter()
        .map(|s| fs::canonicalize(s).with_context(|| format!("source {}", s.display())))
        .collect::<Result<Vec<_>>>()?;
    fs::create_dir_all(&dest).with_context(|| format!("create {}", dest.display()))?;
    let dest = fs::canonicalize(&dest)?;
    ShadowGuard::new(&dest, None)?.check_sources(&roots)?;

    let opts = SyncOptions {
        ignores,
        delete_not_found: delete,
        force,
        workers,
        on_progress: Some(ProgressLogger::new(Duration::from_millis(200), verbose).into_callback()),
        process_dest_path: Some(Box::new(|p: &Path| clean_go_fs_path(p))),
        ..SyncOptions::default()
    };
    let stats = sync(&roots, &RebaseSource::new(&dest), &opts)?;

    println!("{}", "Summary:".bold());
    println!("  {} files seen", stats.total);
    println!("  {} copied", format!("{}", stats.copied).green());
    println!(
        "  {} up to date",
        format!("{}", stats.total - stats.copied).cyan()
    );
    Ok(())
}

fn cmd_relocate(
    project: PathBuf,
    extras: Vec<String>,
    shadow: Option<PathBuf>,
    show_diff: bool,
) -> Result<()> {
    let project = fs::canonicalize(&project)
        .with_context(|| format!("project {}", project.display()))?;
    let manifest = project.join("go.mod");
    let text = fs::read_to_string(&manifest)
        .with_context(|| format!("read {}", manifest.display()))?;
    let module_path = GoMod::parse(&text)?
        .module
        .with_context(|| format!("{} declares no module", manifest.display()))?;

    let shadow_root = match shadow {
        Some(shadow) => shadow,
        None => RunContext::new(&Settings::default(), &project)?.shadow_root,
    };
    let extras = extras
        .iter()
        .map(|s| parse_extra(s))
        .collect::<Result<Vec<_>>>()?;
    let extra_refs: Vec<ModuleRef> = extras
        .iter()
        .map(|e| ModuleRef {
            path: e.path.clone(),
            dir: e.dir.clone(),
            is_std: e.std,
        })
        .collect();
    let target = ModuleRef {
        path: module_path,
        dir: project.clone(),
        is_std: false,
    };

    let relocation = relocate(&RelocateInput {
        shadow_root: &shadow_root,
        target: &target,
        extras: &extra_refs,
        project_dir: &project,
    })?;

    println!("Project: {}", project.display());
    println!("Shadow root: {}", shadow_root.display());
    println!();

    for (module, dir) in &relocation.replacements {
        println!("{} {} => {}", "↪".cyan(), module, dir);
    }
    for root in &relocation.extra_roots {
        println!("{} also mirrored: {}", "+".green(), root.display());
    }
    if relocation.std_relocated {
        println!("{}", "GOROOT is overridden for the build".yellow());
    }

    let files = relocation
        .manifests
        .iter()
        .chain(relocation.vendor.iter().map(|(p, t)| (p, t)));
    let mut changed = 0;
    for (path, updated) in files {
        let original = fs::read_to_string(path).unwrap_or_default();
        if &original == updated {
            continue;
        }
        changed += 1;
        if show_diff {
            display_diff(path, &original, updated);
        }
    }

    println!();
    println!("{}", "Summary:".bold());
    println!("  {} manifests changed", format!("{}", changed).green());
    println!(
        "  {} replacements",
        format!("{}", relocation.replacements.len()).cyan()
    );
    Ok(())
}

fn print_report(report: &RunReport) {
    println!("{}", "Summary:".bold());
    println!(
        "  {} packages, {} files loaded",
        report.packages, report.files
    );
    println!(
        "  {} rule matches",
        format!("{}", report.rule_matches).cyan()
    );
    println!(
        "  {} sources copied ({} seen)",
        format!("{}", report.mirrored.copied).green(),
        report.mirrored.total
    );
    println!(
        "  {} generated files written ({} total)",
        format!("{}", report.generated.copied).green(),
        report.outputs
    );
    if report.vendor_mode {
        println!("  {}", "vendor mode: go.mod untouched".yellow());
    }
    println!("  done in {:.2?}", report.elapsed);
}

fn cmd_run(
    project: PathBuf,
    config: Option<PathBuf>,
    force: bool,
    skip_build: bool,
) -> Result<()> {
    let mut settings = load_settings(&project, config)?;
    if force {
        settings.rewrite.force = true;
    }

    let ctx = RunContext::new(&settings, &project)?;
    println!("Project: {}", ctx.project_dir.display());
    println!("Shadow: {}", ctx.shadow_project_dir().display());
    println!();

    let pipeline = Pipeline::new(&settings, &ctx);
    let report = pipeline.run()?;
    print_report(&report);

    if skip_build {
        return Ok(());
    }

    println!();
    match pipeline.build(&report, &GoTool, &[]) {
        Ok(output) => {
            println!("{} built {}", "✓".green(), output.display());
            Ok(())
        }
        Err(e) => {
            eprintln!("{} {}", "✗".red(), e);
            std::process::exit(1);
        }
    }
}

//! One rewrite pass end to end.
//!
//! 1. load the target module plus configured extras
//! 2. run the rule visitor and any caller visitors over every package
//! 3. collect every surface's output, plus relocated manifests, into an
//!    overlay keyed by source path
//! 4. mirror the real trees into the shadow root (phase 1)
//! 5. write the overlay on top, skipping files whose digest is unchanged
//!    (phase 2)
//! 6. record the digests for the next run
//!
//! Nothing is written before every output has been computed, so a failing
//! rewriter leaves the shadow tree as the previous run left it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{content_digest, CacheError, DigestCache};
use crate::config::{RuleDefinition, RuleSurface, Settings};
use crate::context::RunContext;
use crate::filecopy::{
    clean_go_fs_path, mtime_newer, rebase_path, sync, Content, GeneratedSource, ProgressLogger,
    ProgressStats, RebaseSource, SourceEntry, SyncError, SyncOptions,
};
use crate::gomod::{relocate, GoModError, ModuleRef, RelocateInput, Relocation};
use crate::registry::{Registry, RegistryError};
use crate::rewrite::{
    combine_hooks, default_package_name, rewrite_node, FileSurface, Hook, RewriteFault,
    SurfaceError,
};
use crate::safety::{SafetyError, ShadowGuard};
use crate::select::{expand_template, PatternSelector, Selection};
use crate::session::{Generated, Session, SessionError};
use crate::syntax::{LoadError, LoadOptions, Loader, ModuleRole, ModuleSpec, NodeId, PackageId};
use crate::toolchain::{BuildError, BuildInputs, BuildPlan, BuildTool};
use crate::visit::{visit_all, visit_all_parallel, Visitor};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("rebuilding {path}: {source}")]
    Reconstruct {
        path: PathBuf,
        #[source]
        source: RewriteFault,
    },

    #[error("rule '{rule_id}' failed in {path}: {source}")]
    Rule {
        rule_id: String,
        path: PathBuf,
        #[source]
        source: SurfaceError,
    },

    #[error("two outputs target {path}")]
    DuplicateOutput { path: PathBuf },

    #[error(transparent)]
    GoMod(#[from] GoModError),

    #[error("{phase} sync failed: {source}")]
    Sync {
        phase: &'static str,
        #[source]
        source: SyncError,
    },

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Safety(#[from] SafetyError),

    #[error(transparent)]
    Build(#[from] BuildError),
}

/// Post-processing applied to every node rebuilt by a rewrite-mode rule.
pub type NodeHook<'h> = dyn Fn(NodeId, String) -> String + Send + Sync + 'h;

/// Applies configured pattern rules through the session's edit surfaces.
///
/// Matches are computed before the walk. A replaced node is not descended
/// into, so nested matches of the same pass never overlap. Edit-mode rules
/// replace each match in place. Rewrite-mode rules rebuild the top-level
/// declaration holding their matches, running the hook on every node.
pub struct RuleVisitor<'r> {
    rules: &'r [RuleDefinition],
    /// node -> (rule index, match)
    matches: HashMap<NodeId, (usize, Selection)>,
    /// top-level declaration -> rewrite-mode matches inside it, in source order
    rewrite_roots: HashMap<NodeId, Vec<NodeId>>,
    hook: Option<&'r NodeHook<'r>>,
    errors: Mutex<Vec<PipelineError>>,
}

impl<'r> RuleVisitor<'r> {
    /// Match every rule against every file. A node matched by several rules
    /// gets the first one.
    pub fn new(rules: &'r [RuleDefinition], registry: &Registry) -> Self {
        let mut matches = HashMap::new();
        for (idx, rule) in rules.iter().enumerate() {
            let found = PatternSelector::new(&rule.pattern).select(registry);
            debug!(rule = %rule.id, matches = found.len(), "rule matched");
            for selection in found {
                matches.entry(selection.node).or_insert((idx, selection));
            }
        }

        let mut rewrite_roots: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for (&node, (idx, selection)) in &matches {
            if rules[*idx].surface != RuleSurface::Rewrite {
                continue;
            }
            let file_root = registry.program().file(selection.file).root;
            rewrite_roots
                .entry(top_level(registry, file_root, node))
                .or_default()
                .push(node);
        }
        for group in rewrite_roots.values_mut() {
            group.sort();
        }

        Self {
            rules,
            matches,
            rewrite_roots,
            hook: None,
            errors: Mutex::new(Vec::new()),
        }
    }

    /// Run `hook` on the output of every node rebuilt by a rewrite-mode rule.
    pub fn with_hook(mut self, hook: Option<&'r NodeHook<'r>>) -> Self {
        self.hook = hook;
        self
    }

    pub fn match_count(&self) -> usize {
        self.matches.len()
    }

    /// Errors raised while visiting, in the order they happened.
    pub fn take_errors(&self) -> Vec<PipelineError> {
        std::mem::take(&mut *self.errors.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn record(&self, result: Result<(), PipelineError>) {
        if let Err(e) = result {
            self.errors
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(e);
        }
    }

    /// Replacement text for one match, importing the rule's packages into
    /// `surface` first.
    fn replacement(
        &self,
        rule: &RuleDefinition,
        selection: &Selection,
        surface: &FileSurface,
    ) -> Result<String, PipelineError> {
        let mut captures = selection.captures.clone();
        for (i, import) in rule.imports.iter().enumerate() {
            let name = default_package_name(import);
            let local = surface
                .must_import(import, &name, None, None)
                .map_err(|source| rule_error(rule, surface.path(), source))?;
            captures.insert(format!("IMPORT{i}"), local);
        }
        Ok(expand_template(&rule.replacement, &captures))
    }

    fn apply_edit(
        &self,
        node: NodeId,
        rule: &RuleDefinition,
        selection: &Selection,
        session: &Session,
    ) -> Result<(), PipelineError> {
        let surface = session.file_edit(selection.file).map_err(|e| {
            rule_error(rule, &session.program().file(selection.file).path, e.into())
        })?;
        let text = self.replacement(rule, selection, &surface)?;

        let Some(span) = session.program().arena.span(node) else {
            return Ok(());
        };
        surface
            .replace(span.start, span.end, text)
            .map_err(|source| rule_error(rule, surface.path(), source))
    }

    /// Rebuild `root` with every rewrite-mode match inside it replaced.
    fn apply_rewrite(
        &self,
        root: NodeId,
        group: &[NodeId],
        session: &Session,
    ) -> Result<(), PipelineError> {
        let Some((first_idx, first)) = group.first().and_then(|n| self.matches.get(n)) else {
            return Ok(());
        };
        let first_rule = &self.rules[*first_idx];
        let program = session.program();
        let surface = session.file_rewrite(first.file).map_err(|e| {
            rule_error(first_rule, &program.file(first.file).path, e.into())
        })?;

        let mut texts = HashMap::with_capacity(group.len());
        for node in group {
            if let Some((idx, selection)) = self.matches.get(node) {
                let text = self.replacement(&self.rules[*idx], selection, &surface)?;
                texts.insert(*node, text);
            }
        }

        let Some(span) = program.arena.span(root) else {
            return Ok(());
        };
        let hook: Option<&(dyn Fn(NodeId, String) -> String + '_)> = match self.hook {
            Some(hook) => Some(hook),
            None => None,
        };
        let text = rewrite_node(program, root, |id| texts.remove(&id), hook).map_err(|source| {
            PipelineError::Reconstruct {
                path: surface.path().to_path_buf(),
                source,
            }
        })?;
        surface
            .replace(span.start, span.end, text)
            .map_err(|source| rule_error(first_rule, surface.path(), source))
    }
}

fn rule_error(rule: &RuleDefinition, path: &Path, source: SurfaceError) -> PipelineError {
    PipelineError::Rule {
        rule_id: rule.id.clone(),
        path: path.to_path_buf(),
        source,
    }
}

/// Child of `file_root` that contains `node`.
fn top_level(registry: &Registry, file_root: NodeId, node: NodeId) -> NodeId {
    let mut current = node;
    while let Some(parent) = registry.parent(current) {
        if parent == file_root {
            return current;
        }
        current = parent;
    }
    node
}

impl Visitor for RuleVisitor<'_> {
    fn visit(&self, node: NodeId, session: &Session) -> bool {
        if let Some(group) = self.rewrite_roots.get(&node) {
            self.record(self.apply_rewrite(node, group, session));
        }
        let Some((idx, selection)) = self.matches.get(&node) else {
            return true;
        };
        let rule = &self.rules[*idx];
        if rule.surface == RuleSurface::Edit {
            self.record(self.apply_edit(node, rule, selection, session));
        }
        false
    }
}

/// What one pass did.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub files: usize,
    pub packages: usize,
    pub rule_matches: usize,
    /// Overlay entries, generated and relocated files together.
    pub outputs: usize,
    pub mirrored: ProgressStats,
    pub generated: ProgressStats,
    /// Manifest relocation was skipped because dependencies are vendored.
    pub vendor_mode: bool,
    pub relocation: Option<Relocation>,
    pub build_inputs: BuildInputs,
    pub elapsed: Duration,
}

pub struct Pipeline<'a> {
    settings: &'a Settings,
    ctx: &'a RunContext,
    visitors: Vec<&'a dyn Visitor>,
    hook: Option<Hook<'a>>,
}

impl<'a> Pipeline<'a> {
    pub fn new(settings: &'a Settings, ctx: &'a RunContext) -> Self {
        Self {
            settings,
            ctx,
            visitors: Vec::new(),
            hook: None,
        }
    }

    /// Run `visitor` after the configured rules.
    pub fn with_visitor(mut self, visitor: &'a dyn Visitor) -> Self {
        self.visitors.push(visitor);
        self
    }

    /// Post-process the output of every node rebuilt by rewrite-mode rules.
    /// Hooks run in the order they were added.
    pub fn with_rewrite_hook(mut self, hook: Hook<'a>) -> Self {
        self.hook = Some(match self.hook.take() {
            Some(previous) => combine_hooks(vec![previous, hook]),
            None => hook,
        });
        self
    }

    pub fn run(&self) -> Result<RunReport, PipelineError> {
        let started = Instant::now();
        let ctx = self.ctx;
        let guard = ShadowGuard::new(&ctx.shadow_root, ctx.goroot.as_deref())?;

        let registry = Arc::new(Registry::build(Arc::new(self.load()?))?);
        let session = Session::new(Arc::clone(&registry), &ctx.project_dir);
        let program = session.program();
        let mut report = RunReport {
            files: program.files.len(),
            packages: program.packages.len(),
            ..RunReport::default()
        };

        let rewrite_started = Instant::now();
        report.rule_matches = self.rewrite(&session)?;
        info!(
            matches = report.rule_matches,
            elapsed = ?rewrite_started.elapsed(),
            "rewrite done"
        );

        let mut overlay = collect_outputs(&session, &ctx.shadow_root)?;

        report.vendor_mode = self.vendor_mode(&session);
        if report.vendor_mode {
            info!("dependencies are vendored, go.mod left as is");
        } else {
            let relocation = self.relocate(&session)?;
            add_relocation(&mut overlay, &relocation, &ctx.shadow_root);
            report.build_inputs = BuildInputs {
                mapped_mod: relocation.mapped_mod.clone(),
                std_relocated: relocation.std_relocated,
            };
            report.relocation = Some(relocation);
        }
        report.outputs = overlay.len();

        for key in overlay.keys() {
            guard.validate_path(rebase_path(&ctx.shadow_root, key))?;
        }
        let overlay_dests: HashSet<PathBuf> = overlay
            .keys()
            .map(|k| rebase_path(&ctx.shadow_root, k))
            .collect();

        let mut digests = if self.settings.rewrite.force {
            DigestCache::empty(&ctx.digest_path)
        } else {
            DigestCache::load(&ctx.digest_path)
        };
        // dests rewritten last run but not this one must be restored
        let stale: HashSet<PathBuf> = digests
            .paths()
            .map(Path::to_path_buf)
            .filter(|p| !overlay_dests.contains(p))
            .collect();

        let roots = self.mirror_roots(&session, &report);
        guard.check_sources(&roots)?;
        let touched = Mutex::new(HashSet::new());
        report.mirrored = self.mirror(&roots, &overlay_dests, &stale, &touched)?;

        let touched = touched.into_inner().unwrap_or_else(PoisonError::into_inner);
        report.generated = self.materialize(&overlay, &digests, &touched)?;

        digests.replace_all(
            overlay
                .iter()
                .map(|(k, c)| (rebase_path(&ctx.shadow_root, k), content_digest(&c.bytes))),
        );
        digests.save()?;

        report.elapsed = started.elapsed();
        info!(
            outputs = report.outputs,
            mirrored = report.mirrored.copied,
            generated = report.generated.copied,
            elapsed = ?report.elapsed,
            "shadow tree ready at {}",
            ctx.shadow_project_dir().display()
        );
        Ok(report)
    }

    /// Build the shadow project with `tool`.
    pub fn build(
        &self,
        report: &RunReport,
        tool: &dyn BuildTool,
        packages: &[String],
    ) -> Result<PathBuf, PipelineError> {
        let plan = BuildPlan::new(self.ctx, &self.settings.build, &report.build_inputs, packages)?;
        Ok(tool.build(&plan)?)
    }

    fn load(&self) -> Result<crate::syntax::Program, PipelineError> {
        let started = Instant::now();
        let extras: Vec<ModuleSpec> = self
            .settings
            .extras
            .iter()
            .filter(|extra| {
                if extra.std && !self.settings.rewrite.rewrite_std {
                    warn!(module = %extra.path, "standard library rewriting disabled, skipped");
                    return false;
                }
                true
            })
            .map(|extra| ModuleSpec {
                path: extra.path.clone(),
                dir: extra.dir.clone(),
                version: extra.version.clone(),
                is_std: extra.std,
                packages: Vec::new(),
            })
            .collect();

        let loader = Loader::new(LoadOptions {
            include_tests: self.settings.rewrite.include_tests,
        });
        let program = loader.load(&self.ctx.project_dir, &extras)?;
        info!(
            modules = program.modules.len(),
            packages = program.packages.len(),
            files = program.files.len(),
            elapsed = ?started.elapsed(),
            "loaded"
        );
        Ok(program)
    }

    fn rewrite(&self, session: &Session) -> Result<usize, PipelineError> {
        let packages: Vec<PackageId> = session.program().packages.iter().map(|p| p.id).collect();
        let rules = RuleVisitor::new(&self.settings.rules, session.registry())
            .with_hook(self.hook.as_deref());
        let matches = rules.match_count();

        let mut visitors: Vec<&dyn Visitor> = Vec::with_capacity(self.visitors.len() + 1);
        if matches > 0 {
            visitors.push(&rules);
        }
        visitors.extend(self.visitors.iter().copied());

        for visitor in visitors {
            if self.settings.rewrite.parallel {
                visit_all_parallel(&packages, session, visitor);
            } else {
                visit_all(&packages, session, visitor);
            }
        }

        if let Some(first) = rules.take_errors().into_iter().next() {
            return Err(first);
        }
        Ok(matches)
    }

    /// A vendored project whose extra packages come from `vendor/` keeps its
    /// manifests.
    fn vendor_mode(&self, session: &Session) -> bool {
        let vendor = self.ctx.project_dir.join("vendor");
        if !vendor.is_dir() {
            return false;
        }
        session
            .program()
            .modules
            .iter()
            .filter(|m| m.role == ModuleRole::Extra)
            .any(|m| m.dir.starts_with(&vendor))
    }

    fn relocate(&self, session: &Session) -> Result<Relocation, PipelineError> {
        let program = session.program();
        let target = program
            .target_module()
            .map(|m| ModuleRef {
                path: m.path.clone(),
                dir: m.dir.clone(),
                is_std: false,
            })
            .ok_or_else(|| LoadError::MissingModule {
                path: self.ctx.project_dir.join("go.mod"),
            })?;
        let extras: Vec<ModuleRef> = program
            .modules
            .iter()
            .filter(|m| m.role == ModuleRole::Extra)
            .map(|m| ModuleRef {
                path: m.path.clone(),
                dir: m.dir.clone(),
                is_std: m.is_std,
            })
            .collect();

        Ok(relocate(&RelocateInput {
            shadow_root: &self.ctx.shadow_root,
            target: &target,
            extras: &extras,
            project_dir: &self.ctx.project_dir,
        })?)
    }

    /// Project dir, extra module dirs, relative replace targets and, when
    /// the standard library moved, GOROOT. Roots nested in another root are
    /// dropped.
    fn mirror_roots(&self, session: &Session, report: &RunReport) -> Vec<PathBuf> {
        let mut roots = vec![self.ctx.project_dir.clone()];
        for module in &session.program().modules {
            if module.role == ModuleRole::Extra {
                roots.push(module.dir.clone());
            }
        }
        if let Some(relocation) = &report.relocation {
            roots.extend(relocation.extra_roots.iter().cloned());
        }
        if report.build_inputs.std_relocated {
            if let Some(goroot) = &self.ctx.goroot {
                roots.push(goroot.clone());
            }
        }
        dedupe_roots(roots)
    }

    fn progress(&self) -> ProgressLogger {
        ProgressLogger::new(
            Duration::from_millis(self.settings.sync.progress_interval_ms),
            self.settings.sync.verbose,
        )
    }

    fn mirror(
        &self,
        roots: &[PathBuf],
        overlay_dests: &HashSet<PathBuf>,
        stale: &HashSet<PathBuf>,
        touched: &Mutex<HashSet<PathBuf>>,
    ) -> Result<ProgressStats, PipelineError> {
        let sync_settings = &self.settings.sync;
        let opts = SyncOptions {
            ignores: sync_settings.ignores.clone(),
            delete_not_found: sync_settings.delete_not_found,
            force: self.settings.rewrite.force,
            workers: sync_settings.workers,
            on_progress: Some(self.progress().into_callback()),
            process_dest_path: Some(Box::new(|dest: &Path| clean_go_fs_path(dest))),
            did_copy: Some(Box::new(|_src: &Path, dest: &Path| {
                touched
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(dest.to_path_buf());
            })),
            should_copy: Some(Box::new(
                |entry: &SourceEntry, dest: &Path, meta: &Metadata| -> std::io::Result<bool> {
                    Ok(stale.contains(dest) || mtime_newer(entry, meta))
                },
            )),
            retain: Some(Box::new(|dest: &Path| {
                overlay_dests.contains(dest) || overlay_dests.iter().any(|d| d.starts_with(dest))
            })),
        };
        let source = RebaseSource::new(&self.ctx.shadow_root);
        let stats = sync(roots, &source, &opts).map_err(|source| PipelineError::Sync {
            phase: "source",
            source,
        })?;
        info!(roots = roots.len(), copied = stats.copied, total = stats.total, "sources mirrored");
        Ok(stats)
    }

    fn materialize(
        &self,
        overlay: &BTreeMap<PathBuf, Content>,
        digests: &DigestCache,
        touched: &HashSet<PathBuf>,
    ) -> Result<ProgressStats, PipelineError> {
        let source = GeneratedSource::new(
            &self.ctx.shadow_root,
            overlay,
            Box::new(|_path: &Path, content: &Content, dest: &Path, _meta: &Metadata| {
                let source_changed = content
                    .source_dest
                    .as_ref()
                    .is_some_and(|d| touched.contains(d));
                source_changed || !digests.is_current(dest, &content_digest(&content.bytes))
            }),
        );
        let opts = SyncOptions {
            force: self.settings.rewrite.force,
            workers: self.settings.sync.workers,
            on_progress: Some(self.progress().into_callback()),
            ..SyncOptions::default()
        };
        let stats = sync(&source.roots(), &source, &opts).map_err(|source| {
            PipelineError::Sync {
                phase: "generated",
                source,
            }
        })?;
        info!(copied = stats.copied, total = stats.total, "generated files written");
        Ok(stats)
    }
}

/// Every surface's final text keyed by its cleaned source path. Outputs
/// derived from a loaded file remember where that file's copy lands, so a
/// changed source forces a rewrite.
pub fn collect_outputs(
    session: &Session,
    shadow_root: &Path,
) -> Result<BTreeMap<PathBuf, Content>, PipelineError> {
    let mut overlay: BTreeMap<PathBuf, Content> = BTreeMap::new();
    let mut duplicate: Option<PathBuf> = None;

    let mut add = |key: PathBuf, content: Content| {
        if overlay.contains_key(&key) {
            duplicate = Some(key);
            return false;
        }
        overlay.insert(key, content);
        true
    };

    let complete = session.gen(|generated| match generated {
        Generated::Rewrite { file, text } | Generated::Edit { file, text } => {
            let key = clean_go_fs_path(&file.path);
            let source_dest = rebase_path(shadow_root, &key);
            add(key, Content::derived(source_dest, text.into_bytes()))
        }
        Generated::Package { path, text, .. } => {
            add(path.to_path_buf(), Content::generated(text.into_bytes()))
        }
    })?;
    if complete {
        for (key, text) in session.overlay() {
            if !add(key, Content::generated(text.into_bytes())) {
                break;
            }
        }
    }

    if let Some(path) = duplicate {
        return Err(PipelineError::DuplicateOutput { path });
    }
    debug!(outputs = overlay.len(), "collected outputs");
    Ok(overlay)
}

/// Relocated manifests join the overlay unless a rewriter already supplied
/// that file.
fn add_relocation(
    overlay: &mut BTreeMap<PathBuf, Content>,
    relocation: &Relocation,
    shadow_root: &Path,
) {
    let files = relocation
        .manifests
        .iter()
        .chain(relocation.vendor.iter().map(|(p, t)| (p, t)));
    for (path, text) in files {
        let key = clean_go_fs_path(path);
        if overlay.contains_key(&key) {
            debug!(path = %key.display(), "manifest supplied by a rewriter, relocation skipped");
            continue;
        }
        let source_dest = rebase_path(shadow_root, &key);
        overlay.insert(key, Content::derived(source_dest, text.clone().into_bytes()));
    }
}

fn dedupe_roots(mut roots: Vec<PathBuf>) -> Vec<PathBuf> {
    roots.sort();
    let mut kept: Vec<PathBuf> = Vec::with_capacity(roots.len());
    for root in roots {
        if kept.iter().any(|k| root.starts_with(k)) {
            continue;
        }
        kept.push(root);
    }
    kept
}

//! Rewrites manifests so a module tree relocated under the shadow root still
//! resolves its local and foreign dependencies.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::errors::GoModError;
use super::parse::{GoMod, ModuleVersion};
use super::vendor::rewrite_modules_txt;
use crate::filecopy::{clean_go_fs_path, clean_path, rebase_path};

/// A module taking part in the relocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRef {
    pub path: String,
    /// Absolute directory holding the module's go.mod.
    pub dir: PathBuf,
    pub is_std: bool,
}

pub struct RelocateInput<'a> {
    pub shadow_root: &'a Path,
    pub target: &'a ModuleRef,
    /// Foreign modules whose packages were rewritten.
    pub extras: &'a [ModuleRef],
    pub project_dir: &'a Path,
}

/// Everything the relocation wants written, keyed by original path.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Relocation {
    /// Rewritten go.mod files keyed by the original manifest path.
    pub manifests: BTreeMap<PathBuf, String>,
    /// Rewritten `vendor/modules.txt`, keyed by its original path.
    pub vendor: Option<(PathBuf, String)>,
    /// Original module dir -> `@`-free dir whose shadow copy replaces it.
    pub mapped_mod: BTreeMap<PathBuf, PathBuf>,
    /// Module path -> replacement target, as written to the manifest.
    pub replacements: BTreeMap<String, String>,
    /// Directories referenced by relative replaces, to be copied as well.
    pub extra_roots: Vec<PathBuf>,
    /// A standard-library module was rewritten; GOROOT must be overridden.
    pub std_relocated: bool,
}

/// Forced replace for every foreign module, as `(module path, shadow dir)`.
pub fn forced_replaces(
    shadow_root: &Path,
    extras: &[ModuleRef],
    mapped_mod: &mut BTreeMap<PathBuf, PathBuf>,
) -> (Vec<(String, PathBuf)>, bool) {
    let mut forced: Vec<(String, PathBuf)> = Vec::new();
    let mut std_relocated = false;
    for module in extras {
        if module.is_std {
            std_relocated = true;
            continue;
        }
        if forced.iter().any(|(path, _)| *path == module.path) {
            continue;
        }
        let clean_dir = clean_go_fs_path(&module.dir);
        forced.push((module.path.clone(), rebase_path(shadow_root, &clean_dir)));
        mapped_mod.insert(module.dir.clone(), clean_dir);
    }
    (forced, std_relocated)
}

/// Rewrite one manifest: relative replaces become absolute shadow paths and
/// every forced replace is set. Returns the new text plus the relative
/// replaces rewritten, as `(module path, original target dir)`.
pub fn relocate_manifest(
    text: &str,
    module_dir: &Path,
    shadow_root: &Path,
    forced: &[(String, PathBuf)],
) -> Result<(String, Vec<(String, PathBuf)>), GoModError> {
    let mut gomod = GoMod::parse(text)?;

    let mut relative = Vec::new();
    for rep in gomod.replaces.clone() {
        if forced.iter().any(|(path, _)| *path == rep.old.path) {
            continue;
        }
        if !rep.new.is_relative_path() {
            continue;
        }
        let target_dir = clean_path(&module_dir.join(&rep.new.path));
        let new_path = rebase_path(shadow_root, &target_dir);
        gomod.set_replace(
            &rep.old,
            &ModuleVersion::unversioned(new_path.to_string_lossy()),
        )?;
        relative.push((rep.old.path.clone(), target_dir));
    }

    for (path, dir) in forced {
        gomod.set_replace(
            &ModuleVersion::unversioned(path.as_str()),
            &ModuleVersion::unversioned(dir.to_string_lossy()),
        )?;
    }

    Ok((gomod.into_text(), relative))
}

/// Compute the manifest and vendor rewrites for one pass.
pub fn relocate(input: &RelocateInput<'_>) -> Result<Relocation, GoModError> {
    let target = input.target;
    if !target.dir.is_absolute() {
        return Err(GoModError::RelativeModuleDir {
            path: target.dir.clone(),
        });
    }

    let mut relocation = Relocation::default();
    let (forced, std_relocated) =
        forced_replaces(input.shadow_root, input.extras, &mut relocation.mapped_mod);
    relocation.std_relocated = std_relocated;
    for (path, dir) in &forced {
        relocation
            .replacements
            .insert(path.clone(), dir.to_string_lossy().into_owned());
    }

    let manifest_path = target.dir.join("go.mod");
    let text = read_to_string(&manifest_path)?.ok_or_else(|| GoModError::MissingModule {
        path: manifest_path.clone(),
    })?;

    let (updated, relative) =
        relocate_manifest(&text, &target.dir, input.shadow_root, &forced)?;
    for (path, dir) in relative {
        let shadow_dir = rebase_path(input.shadow_root, &dir);
        debug!(module = %path, dir = %dir.display(), "relative replace relocated");
        relocation
            .replacements
            .insert(path, shadow_dir.to_string_lossy().into_owned());
        if !relocation.extra_roots.contains(&dir) {
            relocation.extra_roots.push(dir);
        }
    }
    if updated != text {
        info!(module = %target.path, "made replace directives absolute in go.mod");
    }
    relocation.manifests.insert(manifest_path, updated);

    let modules_txt = input.project_dir.join("vendor").join("modules.txt");
    if !relocation.replacements.is_empty() {
        if let Some(vendor) = read_to_string(&modules_txt)? {
            let updated = rewrite_modules_txt(&vendor, &relocation.replacements);
            relocation.vendor = Some((modules_txt, updated));
        }
    }

    Ok(relocation)
}

fn read_to_string(path: &Path) -> Result<Option<String>, GoModError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(GoModError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

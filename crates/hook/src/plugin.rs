//! Applying a module's copy and bind rules to a container root.

use std::fs;

use anyhow::{Context, Result};
use camino::Utf8Path;

use crate::rules::resolve;
use crate::{HookEnv, HookLog, HostOps, Module};

/// The operations a module rule can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Copy files or directory trees into the container root
    Copy,
    /// Recursively bind mount paths into the container root
    Bind,
}

impl Action {
    /// All actions, in the order they are applied.
    pub const ALL: [Action; 2] = [Action::Copy, Action::Bind];

    /// The rules `module` declares for this action.
    pub fn rules(self, module: &Module) -> &[String] {
        let rules = match self {
            Action::Copy => &module.copy,
            Action::Bind => &module.bind,
        };
        rules.as_deref().unwrap_or_default()
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Action::Copy => "copy",
            Action::Bind => "bind",
        })
    }
}

/// Apply every rule of `module` against the container `root`.
///
/// This never fails: each rule and each resolved path is independent, and
/// problems are logged before moving on to the next one.
pub fn apply_module(
    root: &Utf8Path,
    module: &Module,
    module_dir: &Utf8Path,
    env: &HookEnv,
    log: &HookLog,
    host: &dyn HostOps,
) {
    log.line(format_args!("Module: {}", module.name));
    for action in Action::ALL {
        for rule in action.rules(module) {
            log.line(format_args!("\t{rule}"));
            for (src, dest) in resolve(rule, root, module_dir, env, log) {
                log.line(format_args!("\t\t{action}: {src} to {dest}"));
                let r = match action {
                    Action::Copy => copy(&src, &dest, log),
                    Action::Bind => bind(&src, &dest, log, host),
                };
                if let Err(e) = r {
                    log.line(format_args!("{action}: {src} -> {dest} failed: {e:#}"));
                }
            }
        }
    }
}

fn ensure_parent(dest: &Utf8Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).with_context(|| format!("Creating {parent}"))?;
    }
    Ok(())
}

fn copy(src: &Utf8Path, dest: &Utf8Path, log: &HookLog) -> Result<()> {
    if !src.exists() {
        log.line(format_args!("copy: source does not exist: {src}"));
        return Ok(());
    }
    ensure_parent(dest)?;
    if src.is_dir() {
        podman_hpc_utils::copy_tree(src.as_std_path(), dest.as_std_path())
    } else {
        podman_hpc_utils::copy_preserving_symlink(src.as_std_path(), dest.as_std_path())
    }
}

fn bind(src: &Utf8Path, dest: &Utf8Path, log: &HookLog, host: &dyn HostOps) -> Result<()> {
    if !src.exists() {
        log.line(format_args!("bind: source does not exist: {src}"));
        return Ok(());
    }
    ensure_parent(dest)?;
    // The mount point must exist and be of the same type as the source.
    if !dest.exists() {
        if src.is_dir() {
            fs::create_dir_all(dest)
        } else {
            fs::File::create(dest).map(drop)
        }
        .with_context(|| format!("Creating mount point {dest}"))?;
    }
    host.bind_mount(src, dest)
}

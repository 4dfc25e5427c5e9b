//! Site module definitions, one YAML file per module.
//!
//! ```yaml
//! name: mpich
//! env: ENABLE_MPICH
//! copy:
//!   - /opt/cray/pe/lib64/*.so.12:/usr/lib64/
//! bind:
//!   - /etc/motd
//! ```

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::{HookEnv, HookLog};

/// A named bundle of copy and bind rules, enabled by an environment variable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    /// Unique module name
    pub name: String,
    /// The module is active when this variable is set in the container environment
    #[serde(default)]
    pub env: Option<String>,
    /// `SRC[:DST]` rules for files copied into the container root
    #[serde(default)]
    pub copy: Option<Vec<String>>,
    /// `SRC[:DST]` rules for paths bind mounted into the container root
    #[serde(default)]
    pub bind: Option<Vec<String>>,
}

impl Module {
    /// Whether this module's enabling variable is present in `env`.
    pub fn is_active(&self, env: &HookEnv) -> bool {
        self.env
            .as_deref()
            .is_some_and(|k| !k.is_empty() && env.contains_key(k))
    }
}

/// Parse a single module file.  Returns `Ok(None)` for a document without a `name`.
fn parse_module(buf: &str) -> Result<Option<Module>> {
    let v: serde_yaml::Value = serde_yaml::from_str(buf)?;
    if v.get("name").is_none() {
        return Ok(None);
    }
    Ok(Some(serde_yaml::from_value(v)?))
}

/// Read every `*.yaml` file in `dir`, keyed by module name.
///
/// Files that fail to parse or lack a `name` are logged and skipped.  If
/// the directory cannot be read, no modules are returned.  Files are read in
/// sorted order, and a later file wins if two share a name.
pub fn load_modules(dir: &Utf8Path, log: &HookLog) -> BTreeMap<String, Module> {
    let mut r = BTreeMap::new();
    let paths = match yaml_files(dir) {
        Ok(p) => p,
        Err(e) => {
            log.line(format_args!("Failed to read modules from {dir}: {e:#}"));
            return r;
        }
    };
    for path in paths {
        let parsed = std::fs::read_to_string(&path)
            .with_context(|| format!("Reading {path}"))
            .and_then(|buf| parse_module(&buf).with_context(|| format!("Parsing {path}")));
        match parsed {
            Ok(Some(m)) => {
                r.insert(m.name.clone(), m);
            }
            Ok(None) => log.line(format_args!("Skipping invalid config (missing name): {path}")),
            Err(e) => log.line(format_args!("Failed to load config {path}: {e:#}")),
        }
    }
    r
}

fn yaml_files(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
    let mut r = Vec::new();
    for entry in dir.read_dir_utf8()? {
        let entry = entry?;
        if entry.path().extension() == Some("yaml") {
            r.push(entry.into_path());
        }
    }
    r.sort();
    Ok(r)
}

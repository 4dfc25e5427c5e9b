//! Locations of the image stores and the tools used to build squash images.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

/// Destination store override.
pub const SQUASH_DIR_ENV: &str = "SQUASH_DIR";
/// Podman binary override.
pub const PODMAN_BIN_ENV: &str = "PODMANHPC_PODMAN_BIN";
/// mksquashfs binary override.
pub const MKSQUASHFS_BIN_ENV: &str = "PODMANHPC_MKSQUASHFS_BIN";

/// Where the squash builder is mounted inside the container.
pub const MKSQUASHFS_MOUNT: &str = "/mksq";
/// Where the destination `overlay/l` is mounted inside the container.
pub const SQUASH_MOUNT: &str = "/sqout";

/// Migration configuration.  Store locations left unset are resolved from
/// the environment when first needed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct StoreConfig {
    /// The container engine, run to build squash images
    pub podman_bin: String,
    /// A statically linked mksquashfs; looked up in `PATH` unless absolute
    pub mksquashfs_bin: String,
    /// The source store
    pub graph_root: Option<Utf8PathBuf>,
    /// The destination store
    pub squash_dir: Option<Utf8PathBuf>,
    /// Extra arguments for mksquashfs
    pub mksquashfs_options: Vec<String>,
    /// Paths inside the image which are left out of the squash image
    pub exclude: Vec<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            podman_bin: "podman".into(),
            mksquashfs_bin: "mksquashfs.static".into(),
            graph_root: None,
            squash_dir: None,
            mksquashfs_options: ["-comp", "lz4", "-xattrs-exclude", "security.capability"]
                .map(String::from)
                .into(),
            exclude: [SQUASH_MOUNT, MKSQUASHFS_MOUNT, "/proc", "/sys", "/dev"]
                .map(String::from)
                .into(),
        }
    }
}

fn process_env(k: &str) -> Option<String> {
    std::env::var(k).ok().filter(|v| !v.is_empty())
}

/// The `graphroot` key of a containers `storage.conf`.
fn storage_conf_graphroot(path: &Utf8Path) -> Option<Utf8PathBuf> {
    let buf = std::fs::read_to_string(path).ok()?;
    let conf: toml::Table = match toml::from_str(&buf) {
        Ok(c) => c,
        Err(e) => {
            tracing::debug!("Ignoring {path}: {e}");
            return None;
        }
    };
    let v = conf
        .get("storage")
        .and_then(|s| s.get("graphroot"))
        .or_else(|| conf.get("graphroot"))?;
    v.as_str().filter(|s| !s.is_empty()).map(Utf8PathBuf::from)
}

impl StoreConfig {
    /// The defaults, with overrides from the process environment.
    pub fn from_env() -> Self {
        Self::from_env_with(process_env)
    }

    /// The defaults, with overrides looked up by `env`.
    pub fn from_env_with(env: impl Fn(&str) -> Option<String>) -> Self {
        let mut r = Self::default();
        if let Some(v) = env(PODMAN_BIN_ENV) {
            r.podman_bin = v;
        }
        if let Some(v) = env(MKSQUASHFS_BIN_ENV) {
            r.mksquashfs_bin = v;
        }
        r.squash_dir = env(SQUASH_DIR_ENV).map(Into::into);
        r
    }

    /// The source store: the configured one, else `graphroot` from the
    /// user's `storage.conf`, else a per-user directory under `/tmp`.
    pub fn source_dir(&self) -> Utf8PathBuf {
        self.source_dir_with(process_env)
    }

    /// As [`Self::source_dir`], looking up `HOME` through `env`.
    pub fn source_dir_with(&self, env: impl Fn(&str) -> Option<String>) -> Utf8PathBuf {
        if let Some(p) = self.graph_root.as_ref() {
            return p.clone();
        }
        env("HOME")
            .map(|home| Utf8PathBuf::from(home).join(".config/containers/storage.conf"))
            .and_then(|p| storage_conf_graphroot(&p))
            .unwrap_or_else(|| {
                let uid = rustix::process::getuid().as_raw();
                format!("/tmp/{uid}_hpc/storage").into()
            })
    }

    /// The destination store: the configured one, else `$SCRATCH/storage`,
    /// else `/tmp/storage`.
    pub fn destination_dir(&self) -> Utf8PathBuf {
        self.destination_dir_with(process_env)
    }

    /// As [`Self::destination_dir`], looking up `SCRATCH` through `env`.
    pub fn destination_dir_with(&self, env: impl Fn(&str) -> Option<String>) -> Utf8PathBuf {
        if let Some(p) = self.squash_dir.as_ref() {
            return p.clone();
        }
        let scratch = env("SCRATCH").unwrap_or_else(|| "/tmp".into());
        Utf8PathBuf::from(scratch).join("storage")
    }

    /// Absolute path of the squash builder.
    pub fn mksquashfs_path(&self) -> Result<Utf8PathBuf> {
        let bin = Utf8Path::new(&self.mksquashfs_bin);
        if bin.is_absolute() {
            return Ok(bin.to_owned());
        }
        let p = which::which(bin.as_str()).with_context(|| format!("Finding {bin}"))?;
        Utf8PathBuf::try_from(p).context("Non-UTF-8 path")
    }
}

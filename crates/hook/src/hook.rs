//! The prestart hook itself: read the OCI state and bundle config, enter the
//! container's mount namespace and apply every active module.

use std::collections::BTreeMap;
use std::io::Read;
use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use podman_hpc_mount::NamespaceKind;
use podman_hpc_utils::CommandRunExt;
use serde::Deserialize;

use crate::{HookLog, apply_module, load_modules};

/// Environment variables visible to the hook, by name.
pub type HookEnv = BTreeMap<String, String>;

/// Overrides the directory holding module YAML files.
pub const MODULES_DIR_ENV: &str = "PODMANHPC_MODULES_DIR";
/// When set, the hook writes a diagnostic log to this path.
pub const LOG_PATH_ENV: &str = "LOG_PLUGIN";
/// Default location of module YAML files.
pub const DEFAULT_MODULES_DIR: &str = "/etc/podman_hpc/modules.d";
/// The bundle configuration, relative to the hook's working directory.
pub const CONFIG_JSON: &str = "config.json";

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Fatal hook errors.  Anything not listed here is logged and skipped.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    /// The container state on stdin is not JSON.
    #[error("Failed to parse container state from stdin")]
    Input(#[source] serde_json::Error),
    /// The container state has no usable `pid`.
    #[error("Invalid or missing 'pid' in container state")]
    InvalidPid,
    /// The bundle configuration does not exist.
    #[error("Missing required {0}")]
    MissingConfig(Utf8PathBuf),
    /// The bundle configuration could not be read or parsed.
    #[error("Failed to read {path}")]
    Config {
        /// Path to the configuration
        path: Utf8PathBuf,
        /// The underlying error
        #[source]
        source: BoxError,
    },
    /// The bundle configuration has no `root.path`.
    #[error("Missing root.path in {0}")]
    MissingRootPath(Utf8PathBuf),
    /// The modules directory could not be made absolute.
    #[error("Failed to resolve modules directory {path}")]
    ModulesDir {
        /// The configured directory
        path: Utf8PathBuf,
        /// The underlying error
        #[source]
        source: std::io::Error,
    },
    /// The hook was not started with euid 0.
    #[error("Must be run as root")]
    NotRoot,
    /// Joining the container's mount namespace failed.
    #[error("Failed to join mount namespace of pid {pid}")]
    Namespace {
        /// The container process
        pid: i32,
        /// The underlying error
        #[source]
        source: BoxError,
    },
    /// Changing root failed.
    #[error("Failed to chroot to {path}")]
    Chroot {
        /// The requested root
        path: Utf8PathBuf,
        /// The underlying error
        #[source]
        source: BoxError,
    },
}

/// The OCI container state passed to hooks on stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookInput {
    /// Host PID of the container's init process
    pub pid: i32,
    /// Container annotations
    pub annotations: BTreeMap<String, String>,
}

impl HookInput {
    /// Parse the container state; `pid` must be a positive integer.
    pub fn parse(v: &serde_json::Value) -> Result<Self, HookError> {
        let pid = v
            .get("pid")
            .and_then(|p| p.as_i64())
            .and_then(|p| i32::try_from(p).ok())
            .filter(|&p| p > 0)
            .ok_or(HookError::InvalidPid)?;
        let annotations = v
            .get("annotations")
            .and_then(|a| serde_json::from_value(a.clone()).ok())
            .unwrap_or_default();
        Ok(Self { pid, annotations })
    }
}

/// The subset of the OCI bundle configuration used by the hook.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HookConfig {
    /// The container root filesystem
    #[serde(default)]
    pub root: Option<Root>,
    /// The container process
    #[serde(default)]
    pub process: Option<Process>,
}

/// `root` in the bundle configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Root {
    /// Path to the root filesystem, as seen from the host
    #[serde(default)]
    pub path: Option<Utf8PathBuf>,
}

/// `process` in the bundle configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Process {
    /// `NAME=VALUE` environment entries
    #[serde(default)]
    pub env: Vec<String>,
}

/// Privileged operations performed against the host.
pub trait HostOps {
    /// Whether the hook runs with euid 0.
    fn is_root(&self) -> bool;
    /// Irrevocably move into the mount namespace of `pid`.
    fn join_mount_namespace(&self, pid: i32) -> Result<()>;
    /// Change the root directory.
    fn chroot(&self, path: &Utf8Path) -> Result<()>;
    /// Recursively bind mount `src` onto `dest`.
    fn bind_mount(&self, src: &Utf8Path, dest: &Utf8Path) -> Result<()>;
    /// Rebuild the dynamic linker cache of the current root.
    fn refresh_linker_cache(&self) -> Result<()>;
}

/// The real host.
#[derive(Debug, Default)]
pub struct LiveHost;

impl HostOps for LiveHost {
    fn is_root(&self) -> bool {
        podman_hpc_mount::running_as_root()
    }

    fn join_mount_namespace(&self, pid: i32) -> Result<()> {
        podman_hpc_mount::attach(pid, NamespaceKind::Mount)?;
        Ok(())
    }

    fn chroot(&self, path: &Utf8Path) -> Result<()> {
        podman_hpc_mount::chroot(path)
    }

    fn bind_mount(&self, src: &Utf8Path, dest: &Utf8Path) -> Result<()> {
        podman_hpc_mount::rbind(src, dest)
    }

    fn refresh_linker_cache(&self) -> Result<()> {
        let Ok(ldconfig) = which::which("ldconfig") else {
            tracing::debug!("No ldconfig in container");
            return Ok(());
        };
        Command::new(ldconfig).log_debug().run_capture_stderr()
    }
}

/// Combine the host environment with the container's `NAME=VALUE` entries;
/// container entries win and entries without `=` are ignored.
pub fn merge_env(mut host_env: HookEnv, container_env: &[String]) -> HookEnv {
    for entry in container_env {
        if let Some((k, v)) = entry.split_once('=') {
            host_env.insert(k.to_owned(), v.to_owned());
        }
    }
    host_env
}

fn read_config(path: &Utf8Path) -> Result<serde_json::Value, HookError> {
    let buf = match std::fs::read_to_string(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(HookError::MissingConfig(path.to_owned()));
        }
        Err(e) => {
            return Err(HookError::Config {
                path: path.to_owned(),
                source: e.into(),
            });
        }
    };
    serde_json::from_str(&buf).map_err(|e| HookError::Config {
        path: path.to_owned(),
        source: e.into(),
    })
}

fn open_log(env: &HookEnv) -> HookLog {
    let Some(path) = env.get(LOG_PATH_ENV).filter(|p| !p.is_empty()) else {
        return HookLog::disabled();
    };
    match HookLog::open(Utf8Path::new(path)) {
        Ok(log) => log,
        Err(e) => {
            eprintln!("Failed to open log file {path}: {e}");
            HookLog::disabled()
        }
    }
}

fn pretty(v: &serde_json::Value) -> String {
    serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string())
}

/// Run the hook.
///
/// `stdin` carries the OCI container state, and `workdir` is the bundle
/// directory containing `config.json`.  Module files are read from the host
/// before joining the container's mount namespace.  After the namespace is
/// joined there is no way back, and errors from individual modules are
/// only logged.
pub fn run(
    mut stdin: impl Read,
    workdir: &Utf8Path,
    host_env: HookEnv,
    host: &dyn HostOps,
) -> Result<(), HookError> {
    let mut buf = String::new();
    stdin
        .read_to_string(&mut buf)
        .map_err(|e| HookError::Input(serde_json::Error::io(e)))?;
    let raw_input: serde_json::Value = serde_json::from_str(&buf).map_err(HookError::Input)?;
    let input = HookInput::parse(&raw_input)?;

    let config_path = workdir.join(CONFIG_JSON);
    let raw_config = read_config(&config_path)?;
    let config: HookConfig =
        serde_json::from_value(raw_config.clone()).map_err(|e| HookError::Config {
            path: config_path.clone(),
            source: e.into(),
        })?;

    let container_env = config.process.map(|p| p.env).unwrap_or_default();
    let env = merge_env(host_env, &container_env);
    let log = open_log(&env);
    log.line("input");
    log.line(pretty(&raw_input));
    log.line(CONFIG_JSON);
    log.line(pretty(&raw_config));

    let root = config
        .root
        .and_then(|r| r.path)
        .ok_or_else(|| HookError::MissingRootPath(config_path.clone()))?;

    let modules_dir = env
        .get(MODULES_DIR_ENV)
        .map(Utf8PathBuf::from)
        .unwrap_or_else(|| DEFAULT_MODULES_DIR.into());
    // Relative rule sources are resolved against this after the chroot,
    // when the working directory is no longer the bundle.
    let modules_dir = camino::absolute_utf8(workdir.join(&modules_dir))
        .map_err(|source| HookError::ModulesDir {
            path: modules_dir,
            source,
        })?;
    let modules = load_modules(&modules_dir, &log);

    if !host.is_root() {
        return Err(HookError::NotRoot);
    }
    host.join_mount_namespace(input.pid)
        .map_err(|e| HookError::Namespace {
            pid: input.pid,
            source: e.into(),
        })?;
    // Resolve paths from the top of the container's mount namespace.
    let slash = Utf8Path::new("/");
    host.chroot(slash).map_err(|e| HookError::Chroot {
        path: slash.to_owned(),
        source: e.into(),
    })?;

    for module in modules.values().filter(|m| m.is_active(&env)) {
        log.line(format_args!("Loading {}", module.name));
        apply_module(&root, module, &modules_dir, &env, &log, host);
    }

    host.chroot(&root).map_err(|e| HookError::Chroot {
        path: root.clone(),
        source: e.into(),
    })?;
    if let Err(e) = host
        .refresh_linker_cache()
        .context("Refreshing linker cache")
    {
        log.line(format_args!("{e:#}"));
    }
    Ok(())
}

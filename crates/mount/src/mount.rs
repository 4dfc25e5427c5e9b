//! Helpers for entering namespaces, changing root and bind mounting.
//!
//! Everything here changes state of the *calling process* (or the mount
//! namespace it belongs to) and generally requires `CAP_SYS_ADMIN`.
//! Joining a namespace is one-way: there is no API to go back.

use std::fs::File;
use std::io::ErrorKind;
use std::os::fd::AsFd;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use rustix::io::Errno;

/// A Linux namespace type, named as in `/proc/<pid>/ns/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceKind {
    /// Mount namespace
    Mount,
    /// User namespace
    User,
    /// Network namespace
    Net,
    /// IPC namespace
    Ipc,
    /// UTS (hostname) namespace
    Uts,
    /// PID namespace
    Pid,
    /// Cgroup namespace
    Cgroup,
}

impl NamespaceKind {
    /// The file name under `/proc/<pid>/ns`.
    pub fn as_str(&self) -> &'static str {
        match self {
            NamespaceKind::Mount => "mnt",
            NamespaceKind::User => "user",
            NamespaceKind::Net => "net",
            NamespaceKind::Ipc => "ipc",
            NamespaceKind::Uts => "uts",
            NamespaceKind::Pid => "pid",
            NamespaceKind::Cgroup => "cgroup",
        }
    }

    /// Path to the namespace handle of `pid`.
    pub fn proc_path(&self, pid: i32) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("/proc/{pid}/ns/{}", self.as_str()))
    }
}

impl std::fmt::Display for NamespaceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from [`attach`].
#[derive(Debug, thiserror::Error)]
pub enum NamespaceError {
    /// The namespace handle does not exist (e.g. the process has exited).
    #[error("Namespace path does not exist: {0}")]
    NotFound(Utf8PathBuf),
    /// The namespace handle exists but could not be opened.
    #[error("Opening {path}")]
    Open {
        /// The namespace handle
        path: Utf8PathBuf,
        /// The underlying error
        #[source]
        source: std::io::Error,
    },
    /// The kernel rejected the `setns` call.
    #[error("Joining {path}")]
    Os {
        /// The namespace handle
        path: Utf8PathBuf,
        /// The kernel error
        #[source]
        errno: Errno,
    },
}

/// Move the calling process into the `kind` namespace of `pid`.
///
/// This permanently changes the namespace membership of the caller; do
/// everything that needs the original namespace first.
pub fn attach(pid: i32, kind: NamespaceKind) -> std::result::Result<(), NamespaceError> {
    let path = kind.proc_path(pid);
    let f = match File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Err(NamespaceError::NotFound(path)),
        Err(source) => return Err(NamespaceError::Open { path, source }),
    };
    tracing::debug!("Joining {path}");
    rustix::thread::move_into_link_name_space(f.as_fd(), None)
        .map_err(|errno| NamespaceError::Os { path, errno })
}

/// Change the root directory of the calling process.
#[context("chroot({path})")]
pub fn chroot(path: &Utf8Path) -> Result<()> {
    rustix::process::chroot(path.as_std_path())?;
    // chroot(2) does not change the working directory.
    std::env::set_current_dir("/").context("Changing to new root")?;
    Ok(())
}

/// Recursively bind mount `source` (and everything mounted beneath it) onto `target`.
#[context("Bind mounting {source} to {target}")]
pub fn rbind(source: &Utf8Path, target: &Utf8Path) -> Result<()> {
    tracing::debug!("Bind mounting {source} to {target}");
    rustix::mount::mount_bind_recursive(source.as_std_path(), target.as_std_path())?;
    Ok(())
}

/// Returns true if the effective user ID of the current process is 0.
pub fn running_as_root() -> bool {
    rustix::process::geteuid().is_root()
}

//! Builder for running a one-shot command inside a container image via `podman run`.
use std::ffi::OsStr;
use std::process::Command;

use camino::Utf8Path;

/// Builder for `podman run --rm` invocations against an explicit image store.
#[derive(Debug)]
pub struct PodmanRunCmd<'a> {
    /// The podman binary to invoke
    podman: &'a str,
    /// Graph root of the store holding the image
    root: Option<&'a Utf8Path>,
    /// Volume mounts in format (source, target)
    volumes: Vec<(&'a str, &'a str)>,
    /// User to run as inside the container
    user: Option<&'a str>,
    /// Entrypoint override
    entrypoint: Option<&'a str>,
}

impl<'a> PodmanRunCmd<'a> {
    /// Create a new builder using the given podman binary.
    pub fn new(podman: &'a str) -> Self {
        Self {
            podman,
            root: None,
            volumes: Vec::new(),
            user: None,
            entrypoint: None,
        }
    }

    /// Use the image store at `root` instead of the default one.
    pub fn root(mut self, root: &'a Utf8Path) -> Self {
        self.root = Some(root);
        self
    }

    /// Add a bind mount from source on the host to target inside the container.
    pub fn volume(mut self, source: &'a str, target: &'a str) -> Self {
        self.volumes.push((source, target));
        self
    }

    /// Run the command as this user.
    pub fn user(mut self, user: &'a str) -> Self {
        self.user = Some(user);
        self
    }

    /// Replace the image entrypoint.
    pub fn entrypoint(mut self, entrypoint: &'a str) -> Self {
        self.entrypoint = Some(entrypoint);
        self
    }

    /// Build the command which runs `image` with the given arguments.
    pub fn command<S: AsRef<OsStr>>(
        self,
        image: &str,
        args: impl IntoIterator<Item = S>,
    ) -> Command {
        let mut cmd = Command::new(self.podman);
        cmd.args(["run", "--rm"]);

        if let Some(root) = self.root {
            cmd.args(["--root", root.as_str()]);
        }

        for (source, target) in &self.volumes {
            cmd.arg("-v").arg(format!("{source}:{target}"));
        }

        if let Some(user) = self.user {
            cmd.args(["--user", user]);
        }

        if let Some(entrypoint) = self.entrypoint {
            cmd.args(["--entrypoint", entrypoint]);
        }

        cmd.arg(image);
        cmd.args(args);
        cmd
    }
}

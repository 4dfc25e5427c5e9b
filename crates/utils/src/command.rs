//! Helpers for running external commands.

use std::process::{Command, Output, Stdio};

use anyhow::{Context, Result};

/// Helpers intended for [`std::process::Command`].
pub trait CommandRunExt {
    /// Log (at debug level) the full child commandline.
    fn log_debug(&mut self) -> &mut Self;

    /// Execute the child process, capturing stdout and stderr.  A non-zero
    /// exit is not an error here; callers inspect [`Output::status`].
    fn run_get_output(&mut self) -> Result<Output>;

    /// Execute the child process and wait for it to exit successfully.
    /// On failure the captured stderr is included in the error.
    fn run_capture_stderr(&mut self) -> Result<()>;
}

fn describe(cmd: &Command) -> String {
    let args = cmd
        .get_args()
        .map(|a| a.to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    format!("{} {}", cmd.get_program().to_string_lossy(), args.join(" "))
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("exec: {}", describe(self));
        self
    }

    fn run_get_output(&mut self) -> Result<Output> {
        self.stdin(Stdio::null())
            .output()
            .with_context(|| format!("Spawning {}", self.get_program().to_string_lossy()))
    }

    fn run_capture_stderr(&mut self) -> Result<()> {
        let output = self.stdout(Stdio::null()).run_get_output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "Subprocess {} failed: {}\n{}",
                self.get_program().to_string_lossy(),
                output.status,
                stderr.trim_end()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_capture_stderr() {
        Command::new("true").run_capture_stderr().unwrap();
        let e = Command::new("/bin/sh")
            .args(["-c", "echo oops 1>&2; exit 1"])
            .run_capture_stderr()
            .unwrap_err();
        let msg = format!("{e:#}");
        assert!(msg.contains("oops"), "{msg}");
    }

    #[test]
    fn test_run_get_output_nonzero() {
        let o = Command::new("/bin/sh")
            .args(["-c", "echo hi; exit 3"])
            .log_debug()
            .run_get_output()
            .unwrap();
        assert_eq!(o.status.code(), Some(3));
        assert_eq!(String::from_utf8_lossy(&o.stdout), "hi\n");
    }

    #[test]
    fn test_spawn_failure() {
        assert!(
            Command::new("/this/does/not/exist")
                .run_get_output()
                .is_err()
        );
    }
}

//! OCI prestart hook which injects site "modules" into podman-hpc containers.
//!
//! A module is a YAML file naming an environment variable and a set of
//! copy and bind rules.  For each module whose variable is set in the
//! container environment, the hook enters the container's mount namespace
//! and copies or bind mounts host paths into the container root.

mod hook;
mod log;
mod modules;
mod plugin;
mod rules;

pub use hook::*;
pub use log::HookLog;
pub use modules::{Module, load_modules};
pub use plugin::{Action, apply_module};
pub use rules::resolve;

//! The `podman-hpc-hook` binary, invoked by the OCI runtime in the bundle directory.

use camino::Utf8Path;
use podman_hpc_hook::{HookEnv, LiveHost};

fn main() {
    podman_hpc_utils::run_main(|| {
        podman_hpc_utils::initialize_tracing(None);
        let env: HookEnv = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        podman_hpc_hook::run(std::io::stdin().lock(), Utf8Path::new("."), env, &LiveHost)?;
        Ok(())
    })
}

//! The main entrypoint for podman-hpc, which just performs global initialization
//! and then calls out into the library.

fn run() -> anyhow::Result<()> {
    let code = podman_hpc_lib::cli::run_from_iter(std::env::args_os())?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn main() {
    podman_hpc_utils::run_main(run)
}

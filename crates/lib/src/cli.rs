//! # podman-hpc command line
//!
//! Command line tool to manage squashed images for podman-hpc.

use std::ffi::OsString;
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use podman_hpc_utils::CommandRunExt;

use crate::config::StoreConfig;
use crate::migrate::Migrator;

/// Manage squashed images for podman-hpc.
#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = "podman-hpc")]
#[clap(rename_all = "kebab-case")]
#[clap(version, about)]
pub struct Cli {
    /// Destination image store for squashed images
    #[clap(long, global = true)]
    pub squash_dir: Option<Utf8PathBuf>,

    /// Source image store (podman's graph root)
    #[clap(long, global = true)]
    pub graph_root: Option<Utf8PathBuf>,

    /// Log filter, e.g. `debug`; `RUST_LOG` takes precedence
    #[clap(long, global = true)]
    pub log_level: Option<String>,

    /// The operation
    #[clap(subcommand)]
    pub opt: Opt,
}

/// Subcommands.
#[derive(Debug, Subcommand, PartialEq, Eq)]
pub enum Opt {
    /// Migrate an image to the squashed image store.
    Migrate {
        /// Image name or ID prefix
        image: String,
    },
    /// Remove a squashed image.
    #[clap(alias = "rmsqi")]
    Rmi {
        /// Image name or ID prefix
        image: String,
    },
    /// Initialize the squashed image store.
    Init,
    /// Pull an image with podman and migrate it.
    Pull {
        /// Extra arguments for `podman pull`, followed by the image
        #[clap(
            required = true,
            num_args = 1..,
            trailing_var_arg = true,
            allow_hyphen_values = true,
            value_name = "PODMAN_ARGS.. IMAGE"
        )]
        args: Vec<String>,
    },
}

impl Cli {
    /// The store configuration, with command line overrides applied.
    pub fn store_config(&self, mut config: StoreConfig) -> StoreConfig {
        if let Some(d) = self.squash_dir.as_ref() {
            config.squash_dir = Some(d.clone());
        }
        if let Some(d) = self.graph_root.as_ref() {
            config.graph_root = Some(d.clone());
        }
        config
    }
}

fn status_code(ok: bool) -> i32 {
    if ok { 0 } else { 1 }
}

fn pull(migrator: &mut Migrator, args: &[String]) -> Result<i32> {
    let (image, podman_args) = args.split_last().ok_or_else(|| anyhow!("Missing image"))?;
    let config = migrator.config();
    let status = Command::new(&config.podman_bin)
        .arg("--root")
        .arg(config.source_dir())
        .arg("pull")
        .args(podman_args)
        .arg(image)
        .log_debug()
        .status()
        .with_context(|| format!("Running {}", config.podman_bin))?;
    if !status.success() {
        tracing::error!("Pull failed: {status}");
        return Ok(status.code().unwrap_or(1));
    }
    tracing::info!("Migrating image to {}", config.destination_dir());
    Ok(status_code(migrator.migrate_image(image)?))
}

/// Parse the provided arguments and execute.  Returns the process exit code.
pub fn run_from_iter<I>(args: I) -> Result<i32>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    podman_hpc_utils::initialize_tracing(cli.log_level.as_deref());
    let config = cli.store_config(StoreConfig::from_env());
    let squash_dir = config.destination_dir();
    let mut migrator = Migrator::new(config);
    if !squash_dir.exists() {
        tracing::info!("Initializing {squash_dir}");
        migrator.init_destination()?;
    }
    match &cli.opt {
        Opt::Migrate { image } => Ok(status_code(migrator.migrate_image(image)?)),
        Opt::Rmi { image } => Ok(status_code(migrator.remove_image(image)?)),
        Opt::Init => {
            migrator.init_destination()?;
            Ok(0)
        }
        Opt::Pull { args } => pull(&mut migrator, args),
    }
}

//! # Squashed image stores for podman-hpc
//!
//! Images are pulled by podman into a per-user overlay store.  To run them
//! efficiently from shared or network filesystems they are migrated into a
//! second store, and a squashfs image of each one's merged root filesystem
//! is generated next to its top layer.

pub mod cli;
pub mod config;
#[cfg(test)]
mod fixture;
pub mod migrate;
pub mod store;

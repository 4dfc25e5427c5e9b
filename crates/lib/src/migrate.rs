//! Copying images and their layer chains between overlay stores, and
//! building a squash image for each migrated image.

use std::collections::{HashMap, HashSet};
use std::os::unix::fs::symlink;

use anyhow::{Context, Result, anyhow};
use camino::Utf8Path;
use fn_error_context::context;
use podman_hpc_utils::{CommandRunExt, PodmanRunCmd};

use crate::config::{MKSQUASHFS_MOUNT, SQUASH_MOUNT, StoreConfig};
use crate::store::{ImageRecord, ImageStore, LINK_DIR, LayerRecord, merge_records_preserve_first};

/// Overlay scaffold directories mirrored for each layer.
const LAYER_SUBDIRS: &[&str] = &["empty", "merged", "work", "diff"];

/// The source (read-only) and destination stores.
#[derive(Debug)]
struct Stores {
    src: ImageStore,
    dst: ImageStore,
}

impl Stores {
    fn open(config: &StoreConfig) -> Result<Self> {
        let src = ImageStore::open(&config.source_dir(), true)?;
        let dst = ImageStore::open(&config.destination_dir(), false)?;
        tracing::debug!("Source {} destination {}", src.base(), dst.base());
        Ok(Self { src, dst })
    }

    /// The layer `top` and all of its ancestors, looked up in both stores
    /// with source records preferred.  Fails if any ancestor is missing.
    fn required_layers(&self, top: &str) -> Result<Vec<LayerRecord>> {
        let all = merge_records_preserve_first(&[self.src.layers(), self.dst.layers()]);
        let by_id: HashMap<&str, &LayerRecord> = all.iter().map(|l| (l.id.as_str(), l)).collect();
        let mut seen = HashSet::new();
        let mut r = Vec::new();
        let mut cur = *by_id
            .get(top)
            .ok_or_else(|| anyhow!("Layer {top} not found"))?;
        loop {
            tracing::debug!("Adding layer {}", cur.id);
            seen.insert(cur.id.as_str());
            r.push(cur.clone());
            match cur.parent.as_deref() {
                Some(p) if !p.is_empty() && !seen.contains(p) => {
                    cur = *by_id.get(p).ok_or_else(|| {
                        anyhow!("Layer {p} (parent of {}) not found", cur.id)
                    })?;
                }
                _ => break,
            }
        }
        Ok(r)
    }

    fn copy_image_info(&self, image_id: &str) -> Result<()> {
        let src = self.src.images_dir().join(image_id);
        let dst = self.dst.images_dir().join(image_id);
        if !dst.exists() {
            podman_hpc_utils::copy_tree(src.as_std_path(), dst.as_std_path())?;
        }
        Ok(())
    }

    fn copy_required_layers(&mut self, layers: &[LayerRecord]) -> Result<()> {
        for layer in layers {
            let name = format!("{}.tar-split.gz", layer.id);
            let src = self.src.layers_dir().join(&name);
            let dst = self.dst.layers_dir().join(&name);
            if dst.exists() {
                continue;
            }
            if !src.exists() {
                tracing::warn!("Missing {src}");
                continue;
            }
            tracing::debug!("Copy {src} to {dst}");
            std::fs::copy(&src, &dst).with_context(|| format!("Copying {src}"))?;
        }
        self.dst.add_records(layers)?;
        Ok(())
    }

    fn copy_overlay(&self, layers: &[LayerRecord]) -> Result<()> {
        for layer in layers {
            let id = layer.id.as_str();
            let src_dir = self.src.overlay_dir().join(id);
            let dst_dir = self.dst.overlay_dir().join(id);
            if src_dir.exists() && !dst_dir.exists() {
                std::fs::create_dir(&dst_dir).with_context(|| format!("Creating {dst_dir}"))?;
            }
            for name in LAYER_SUBDIRS {
                let (s, d) = (src_dir.join(name), dst_dir.join(name));
                if s.exists() && !d.exists() {
                    std::fs::create_dir(&d).with_context(|| format!("Creating {d}"))?;
                }
            }
            let dst_link = dst_dir.join("link");
            if !dst_link.exists() {
                let src_link = src_dir.join("link");
                tracing::debug!("Copy {src_link} to {dst_link}");
                std::fs::copy(&src_link, &dst_link)
                    .with_context(|| format!("Copying {src_link}"))?;
            }

            let link = self.dst.read_link_file(id)?;
            let lname = self.dst.overlay_dir().join(LINK_DIR).join(&link);
            if lname.symlink_metadata().is_err() {
                match symlink(format!("../{id}/diff"), &lname) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                    Err(e) => tracing::warn!("Failed to create symlink {lname}: {e}"),
                }
            }

            let src_squash = self.src.squash_file_path(&link);
            let dst_squash = self.dst.squash_file_path(&link);
            if src_squash.exists() && !dst_squash.exists() {
                tracing::debug!("Copy {src_squash} to {dst_squash}");
                std::fs::copy(&src_squash, &dst_squash)
                    .with_context(|| format!("Copying {src_squash}"))?;
            }
        }
        Ok(())
    }

    /// Build `overlay/l/<link>.squash` for the top layer of `image` by
    /// running mksquashfs inside the image.  Returns false if the build failed.
    ///
    /// The builder writes `<link>.squash.tmp`, which is renamed into place
    /// only after it succeeds, so a failed build leaves no squash file.
    #[context("Generating squash image for {}", image.id)]
    fn generate_squash(&self, config: &StoreConfig, image: &ImageRecord) -> Result<bool> {
        let link = self.dst.read_link_file(&image.layer)?;
        let target = self.dst.squash_file_path(&link);
        if target.exists() {
            tracing::info!("Squash file already generated");
            return Ok(true);
        }
        let tmpname = format!("{link}.squash.tmp");
        let tmp = self.dst.overlay_dir().join(LINK_DIR).join(&tmpname);
        // mksquashfs appends to an existing file
        remove_if_exists(&tmp)?;
        let mksquashfs = config.mksquashfs_path()?;
        tracing::info!("Generating squash file {target}");
        let sqout = format!("{}/", self.dst.overlay_dir().join(LINK_DIR));
        let mut args = vec!["/".to_owned(), format!("{SQUASH_MOUNT}/{tmpname}")];
        args.extend(config.mksquashfs_options.iter().cloned());
        for e in &config.exclude {
            args.extend(["-e".to_owned(), e.clone()]);
        }
        let out = PodmanRunCmd::new(&config.podman_bin)
            .root(self.src.base())
            .volume(mksquashfs.as_str(), MKSQUASHFS_MOUNT)
            .volume(&sqout, SQUASH_MOUNT)
            .user("0")
            .entrypoint(MKSQUASHFS_MOUNT)
            .command(&image.id, args)
            .log_debug()
            .run_get_output()?;
        if !out.status.success() {
            tracing::error!("Squash failed: {}", out.status);
            tracing::error!("{}", String::from_utf8_lossy(&out.stdout));
            tracing::error!("{}", String::from_utf8_lossy(&out.stderr));
            remove_if_exists(&tmp)?;
            return Ok(false);
        }
        if !tmp.exists() {
            tracing::error!("Squash builder exited successfully but wrote no {tmpname}");
            return Ok(false);
        }
        std::fs::rename(&tmp, &target).with_context(|| format!("Renaming {tmp}"))?;
        tracing::info!("Created squash image");
        Ok(true)
    }
}

fn remove_if_exists(path: &Utf8Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Removing {path}")),
    }
}

/// Moves images from the user's store into the shared squash store.
///
/// The stores are opened on first use.
#[derive(Debug)]
pub struct Migrator {
    config: StoreConfig,
    stores: Option<Stores>,
}

fn open_stores<'a>(config: &StoreConfig, slot: &'a mut Option<Stores>) -> Result<&'a mut Stores> {
    let stores = match slot.take() {
        Some(s) => s,
        None => Stores::open(config)?,
    };
    Ok(slot.insert(stores))
}

impl Migrator {
    /// Create a migrator; nothing is touched until an operation runs.
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            stores: None,
        }
    }

    /// The configuration in use.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Create the destination store layout if missing.
    pub fn init_destination(&mut self) -> Result<()> {
        let stores = open_stores(&self.config, &mut self.stores)?;
        stores.dst.init_store()?;
        stores.dst.refresh()
    }

    /// Copy `image` and the layers it needs to the destination store and
    /// build its squash image.
    ///
    /// Returns `Ok(false)` if the image does not exist or the squash image
    /// could not be built; in the latter case the image is not registered
    /// in the destination.  Migrating an image twice is a no-op.
    #[context("Migrating {image}")]
    pub fn migrate_image(&mut self, image: &str) -> Result<bool> {
        let Self { config, stores } = self;
        let stores = open_stores(config, stores)?;
        tracing::debug!("Migrating {image}");
        stores.dst.init_store()?;
        stores.src.refresh()?;
        stores.dst.refresh()?;

        let (img, fullname) = match stores.src.lookup_image(image) {
            Ok(r) => r,
            Err(e) => {
                tracing::error!("{e}");
                return Ok(false);
            }
        };
        tracing::debug!("Resolved {image} to {fullname}");
        let layers = stores.required_layers(&img.layer)?;

        if stores.dst.image_exists(&img.id) {
            tracing::info!("Previously migrated");
            return Ok(true);
        }

        // The destination doesn't have this image, so any current holder
        // of one of its tags is a different image.
        stores.dst.drop_tag(&img.names)?;
        stores.copy_image_info(&img.id)?;
        stores.copy_required_layers(&layers)?;
        stores.copy_overlay(&layers)?;

        if !stores.generate_squash(config, &img)? {
            return Ok(false);
        }
        // Last, so a partially migrated image is never visible.
        stores.dst.add_records(&[img])?;
        Ok(true)
    }

    /// Remove `image` and its squash file from the destination store.
    ///
    /// Layers are left in place since other images may share them.
    /// Returns `Ok(false)` if the image does not exist.
    #[context("Removing {image}")]
    pub fn remove_image(&mut self, image: &str) -> Result<bool> {
        let stores = open_stores(&self.config, &mut self.stores)?;
        tracing::debug!("Removing {image}");
        stores.dst.refresh()?;
        let (img, _) = match stores.dst.lookup_image(image) {
            Ok(r) => r,
            Err(e) => {
                tracing::error!("{e}");
                return Ok(false);
            }
        };
        stores.required_layers(&img.layer)?;

        let link = stores.dst.read_link_file(&img.layer)?;
        let squash = stores.dst.squash_file_path(&link);
        if squash.exists() {
            tracing::info!("Removing squash file");
            std::fs::remove_file(&squash).with_context(|| format!("Removing {squash}"))?;
        }
        tracing::info!("Removing image record");
        stores
            .dst
            .delete_record(crate::store::RecordKind::Images, &img.id, "id")?;
        Ok(true)
    }
}

//! A minimal reader and writer for the containers-storage overlay layout.
//!
//! ```text
//! <base>/overlay/<layer>/{diff,work,merged,empty,link}
//! <base>/overlay/l/<link> -> ../<layer>/diff
//! <base>/overlay/l/<link>.squash
//! <base>/overlay-images/{images.json,images.lock,<image>/manifest}
//! <base>/overlay-layers/{layers.json,layers.lock,<layer>.tar-split.gz}
//! ```
//!
//! Every read-modify-write of a JSON record file holds an exclusive lock on
//! the matching `.lock` file, and the file is replaced atomically.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::ambient_authority;
use cap_std_ext::cap_std::fs::{Dir, Permissions, PermissionsExt};
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use rustix::fs::FlockOperation;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Per-layer overlay directories, and the short link name symlinks.
pub const OVERLAY_DIR: &str = "overlay";
/// Directory under [`OVERLAY_DIR`] holding link symlinks and squash files.
pub const LINK_DIR: &str = "l";
/// Image records and per-image metadata.
pub const IMAGES_DIR: &str = "overlay-images";
/// Layer records and tar-split blobs.
pub const LAYERS_DIR: &str = "overlay-layers";

/// Prefixes tried, in order, when looking up an image by name.
const NAME_PREFIXES: &[&str] = &["", "docker.io/", "docker.io/library/", "localhost/"];

/// Typed errors callers may need to distinguish.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A write was attempted against a store opened read-only.
    #[error("Image store {0} is read-only")]
    ReadOnly(Utf8PathBuf),
    /// An image, layer or link could not be found.
    #[error("{0} not found")]
    NotFound(String),
}

/// The two JSON record files of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// `overlay-images/images.json`
    Images,
    /// `overlay-layers/layers.json`
    Layers,
}

impl RecordKind {
    /// `images` or `layers`.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Images => "images",
            RecordKind::Layers => "layers",
        }
    }

    fn dir(&self) -> &'static str {
        match self {
            RecordKind::Images => IMAGES_DIR,
            RecordKind::Layers => LAYERS_DIR,
        }
    }

    fn json_name(&self) -> String {
        format!("{}.json", self.as_str())
    }

    fn lock_name(&self) -> String {
        format!("{}.lock", self.as_str())
    }
}

/// An entry of `images.json`.  Fields we don't use are carried verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Image ID
    pub id: String,
    /// Repository tags; each appears on at most one image
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
    /// ID of the top layer
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub layer: String,
    /// Names of the metadata blobs stored in the image directory
    #[serde(
        rename = "big-data-names",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub big_data_names: Vec<String>,
    /// Everything else
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// An entry of `layers.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerRecord {
    /// Layer ID
    pub id: String,
    /// The layer below this one, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Everything else
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A record stored in one of the JSON files.
pub trait StoreRecord: Clone + Serialize + DeserializeOwned {
    /// The file holding records of this type.
    const KIND: RecordKind;
    /// The unique ID of this record.
    fn id(&self) -> &str;
}

impl StoreRecord for ImageRecord {
    const KIND: RecordKind = RecordKind::Images;
    fn id(&self) -> &str {
        &self.id
    }
}

impl StoreRecord for LayerRecord {
    const KIND: RecordKind = RecordKind::Layers;
    fn id(&self) -> &str {
        &self.id
    }
}

/// Concatenate `lists`, keeping only the first record seen for each ID.
pub fn merge_records_preserve_first<R: StoreRecord>(lists: &[&[R]]) -> Vec<R> {
    let mut seen = HashSet::new();
    lists
        .iter()
        .flat_map(|l| l.iter())
        .filter(|r| seen.insert(r.id().to_owned()))
        .cloned()
        .collect()
}

/// `fcntl` record locks are per process and only exclude other processes,
/// so writers within this process also serialize here.
static PROCESS_LOCK: Mutex<()> = Mutex::new(());

/// An exclusive lock on one record file.  The file is closed, releasing the
/// record lock, before the process-wide guard.
#[derive(Debug)]
struct RecordLock {
    _file: File,
    _guard: MutexGuard<'static, ()>,
}

/// An overlay image store, with its record files cached in memory.
#[derive(Debug)]
pub struct ImageStore {
    base: Utf8PathBuf,
    read_only: bool,
    images: Vec<ImageRecord>,
    layers: Vec<LayerRecord>,
}

fn read_json<T: DeserializeOwned>(path: &Utf8Path) -> Result<Vec<T>> {
    let buf = match std::fs::read_to_string(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("Reading {path}")),
    };
    serde_json::from_str(&buf).with_context(|| format!("Parsing {path}"))
}

impl ImageStore {
    /// Open the store at `base`.  Missing record files are treated as empty.
    #[context("Opening image store {base}")]
    pub fn open(base: &Utf8Path, read_only: bool) -> Result<Self> {
        let mut store = Self {
            base: base.to_owned(),
            read_only,
            images: Vec::new(),
            layers: Vec::new(),
        };
        store.refresh()?;
        Ok(store)
    }

    /// Reload both record files from disk.
    pub fn refresh(&mut self) -> Result<()> {
        self.images = read_json(&self.json_path(RecordKind::Images))?;
        self.layers = read_json(&self.json_path(RecordKind::Layers))?;
        Ok(())
    }

    /// The store's base directory.
    pub fn base(&self) -> &Utf8Path {
        &self.base
    }

    /// `<base>/overlay`
    pub fn overlay_dir(&self) -> Utf8PathBuf {
        self.base.join(OVERLAY_DIR)
    }

    /// `<base>/overlay-images`
    pub fn images_dir(&self) -> Utf8PathBuf {
        self.base.join(IMAGES_DIR)
    }

    /// `<base>/overlay-layers`
    pub fn layers_dir(&self) -> Utf8PathBuf {
        self.base.join(LAYERS_DIR)
    }

    fn json_path(&self, kind: RecordKind) -> Utf8PathBuf {
        self.base.join(kind.dir()).join(kind.json_name())
    }

    /// Cached image records.
    pub fn images(&self) -> &[ImageRecord] {
        &self.images
    }

    /// Cached layer records.
    pub fn layers(&self) -> &[LayerRecord] {
        &self.layers
    }

    /// The layer record with exactly this ID.
    pub fn layer(&self, id: &str) -> Option<&LayerRecord> {
        self.layers.iter().find(|l| l.id == id)
    }

    /// Find an image by ID prefix, or else by name.
    ///
    /// Names without a tag get `:latest`, and are tried bare and then with
    /// the `docker.io/`, `docker.io/library/` and `localhost/` prefixes.
    /// Returns the record and the ID or full name which matched.
    pub fn lookup_image(&self, name: &str) -> Result<(ImageRecord, String), StoreError> {
        let not_found = || StoreError::NotFound(format!("Image {name}"));
        if name.is_empty() {
            return Err(not_found());
        }
        if let Some(img) = self.images.iter().find(|i| i.id.starts_with(name)) {
            tracing::debug!("Found {name} by ID");
            return Ok((img.clone(), img.id.clone()));
        }
        let tagged = if name.contains(':') {
            name.to_owned()
        } else {
            format!("{name}:latest")
        };
        for prefix in NAME_PREFIXES {
            let full = format!("{prefix}{tagged}");
            if let Some(img) = self.images.iter().find(|i| i.names.contains(&full)) {
                return Ok((img.clone(), full));
            }
        }
        Err(not_found())
    }

    /// Whether an image with exactly this ID is present.
    pub fn image_exists(&self, id: &str) -> bool {
        self.images.iter().any(|i| i.id == id)
    }

    fn ensure_writable(&self) -> Result<(), StoreError> {
        if self.read_only {
            return Err(StoreError::ReadOnly(self.base.clone()));
        }
        Ok(())
    }

    /// Create the store layout; existing files are left alone.
    #[context("Initializing image store {}", self.base)]
    pub fn init_store(&self) -> Result<()> {
        self.ensure_writable()?;
        for d in [
            self.overlay_dir(),
            self.overlay_dir().join(LINK_DIR),
            self.images_dir(),
            self.layers_dir(),
        ] {
            std::fs::create_dir_all(&d).with_context(|| format!("Creating {d}"))?;
        }
        for kind in [RecordKind::Images, RecordKind::Layers] {
            let dir = self.base.join(kind.dir());
            let lock = dir.join(kind.lock_name());
            if !lock.exists() {
                File::create(&lock).with_context(|| format!("Creating {lock}"))?;
            }
            let json = dir.join(kind.json_name());
            if !json.exists() {
                std::fs::write(&json, "[]").with_context(|| format!("Creating {json}"))?;
            }
        }
        Ok(())
    }

    /// Take an exclusive lock on the lock file for `kind`, held until the
    /// returned guard is dropped.
    fn lock(&self, kind: RecordKind) -> Result<RecordLock> {
        // Taken before opening the file: closing any descriptor of the lock
        // file drops the process's record lock on it.
        let guard = PROCESS_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let path = self.base.join(kind.dir()).join(kind.lock_name());
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Opening {path}"))?;
        rustix::fs::fcntl_lock(&file, FlockOperation::LockExclusive)
            .with_context(|| format!("Locking {path}"))?;
        Ok(RecordLock {
            _file: file,
            _guard: guard,
        })
    }

    fn write_json<T: Serialize>(&self, kind: RecordKind, records: &[T]) -> Result<()> {
        let dirpath = self.base.join(kind.dir());
        let dir = Dir::open_ambient_dir(&dirpath, ambient_authority())
            .with_context(|| format!("Opening {dirpath}"))?;
        dir.atomic_replace_with(kind.json_name(), |f| -> std::io::Result<_> {
            serde_json::to_writer(&mut *f, records).map_err(std::io::Error::from)?;
            f.flush()?;
            f.get_mut()
                .as_file_mut()
                .set_permissions(Permissions::from_mode(0o644))?;
            Ok(())
        })
        .with_context(|| format!("Writing {dirpath}/{}", kind.json_name()))?;
        tracing::debug!("Updated {dirpath}/{}", kind.json_name());
        Ok(())
    }

    /// Remove every record of `kind` whose `key` field equals `value`.
    /// Returns whether anything was removed; nothing is written otherwise.
    #[context("Deleting {value} from {}", kind.as_str())]
    pub fn delete_record(&mut self, kind: RecordKind, value: &str, key: &str) -> Result<bool> {
        self.ensure_writable()?;
        let _lock = self.lock(kind)?;
        let mut records: Vec<serde_json::Value> = read_json(&self.json_path(kind))?;
        let n = records.len();
        records.retain(|r| r.get(key).and_then(|v| v.as_str()) != Some(value));
        let changed = records.len() != n;
        if changed {
            self.write_json(kind, &records)?;
            self.refresh()?;
        }
        Ok(changed)
    }

    /// Remove each of `tags` from whichever image currently carries it.
    #[context("Dropping tags {tags:?}")]
    pub fn drop_tag(&mut self, tags: &[String]) -> Result<()> {
        self.ensure_writable()?;
        let _lock = self.lock(RecordKind::Images)?;
        let mut images: Vec<ImageRecord> = read_json(&self.json_path(RecordKind::Images))?;
        let mut changed = false;
        for img in images.iter_mut() {
            let n = img.names.len();
            img.names.retain(|t| !tags.contains(t));
            if img.names.len() != n {
                tracing::debug!("Dropped tag from {}", img.id);
                changed = true;
            }
        }
        if changed {
            self.write_json(RecordKind::Images, &images)?;
        }
        self.images = images;
        Ok(())
    }

    /// Append the records whose ID is not already present.  Returns whether
    /// the file changed.  The cache is reloaded afterwards in either case.
    #[context("Adding {}", R::KIND.as_str())]
    pub fn add_records<R: StoreRecord>(&mut self, records: &[R]) -> Result<bool> {
        self.ensure_writable()?;
        let kind = R::KIND;
        let changed = {
            let _lock = self.lock(kind)?;
            let mut data: Vec<R> = read_json(&self.json_path(kind))?;
            let mut seen: HashSet<String> = data.iter().map(|r| r.id().to_owned()).collect();
            let n = data.len();
            data.extend(
                records
                    .iter()
                    .filter(|r| seen.insert(r.id().to_owned()))
                    .cloned(),
            );
            let changed = data.len() != n;
            if changed {
                self.write_json(kind, &data)?;
            }
            changed
        };
        self.refresh()?;
        Ok(changed)
    }

    /// `<base>/overlay/l/<link>.squash`
    pub fn squash_file_path(&self, link: &str) -> Utf8PathBuf {
        self.overlay_dir()
            .join(LINK_DIR)
            .join(format!("{link}.squash"))
    }

    /// The short link name of a layer, from `overlay/<layer>/link`.
    pub fn read_link_file(&self, layer_id: &str) -> Result<String> {
        let path = self.overlay_dir().join(layer_id).join("link");
        match std::fs::read_to_string(&path) {
            Ok(s) => Ok(s.trim().to_owned()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(path.into_string()).into())
            }
            Err(e) => Err(e).with_context(|| format!("Reading {path}")),
        }
    }

    /// The parsed `manifest` of an image.
    #[context("Reading manifest of {image_id}")]
    pub fn manifest(&self, image_id: &str) -> Result<serde_json::Value> {
        let path = self.images_dir().join(image_id).join("manifest");
        let buf = std::fs::read_to_string(&path).with_context(|| format!("Reading {path}"))?;
        Ok(serde_json::from_str(&buf)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::StoreFixture;

    fn tagged(store: &ImageStore, tag: &str) -> Vec<String> {
        store
            .images()
            .iter()
            .filter(|i| i.names.iter().any(|n| n == tag))
            .map(|i| i.id.clone())
            .collect()
    }

    #[test]
    fn test_open_missing() -> Result<()> {
        let td = tempfile::tempdir()?;
        let base = Utf8Path::from_path(td.path()).unwrap().join("nonexistent");
        let store = ImageStore::open(&base, true)?;
        assert!(store.images().is_empty());
        assert!(store.layers().is_empty());
        Ok(())
    }

    #[test]
    fn test_init_store() -> Result<()> {
        let td = tempfile::tempdir()?;
        let base = Utf8Path::from_path(td.path()).unwrap().join("store");
        let ro = ImageStore::open(&base, true)?;
        let e = ro.init_store().unwrap_err();
        assert!(matches!(
            e.downcast_ref::<StoreError>(),
            Some(StoreError::ReadOnly(_))
        ));
        assert!(!base.exists());

        let store = ImageStore::open(&base, false)?;
        store.init_store()?;
        for p in [
            "overlay/l",
            "overlay-images/images.lock",
            "overlay-layers/layers.lock",
        ] {
            assert!(base.join(p).exists(), "{p}");
        }
        assert_eq!(
            std::fs::read_to_string(base.join("overlay-images/images.json"))?,
            "[]"
        );
        // Existing records survive a second init
        std::fs::write(base.join("overlay-layers/layers.json"), r#"[{"id":"x"}]"#)?;
        store.init_store()?;
        assert_eq!(ImageStore::open(&base, true)?.layers().len(), 1);
        Ok(())
    }

    #[test]
    fn test_lookup_image() -> Result<()> {
        let td = tempfile::tempdir()?;
        let fx = StoreFixture::new(td.path())
            .layer("l1", None, "LINK1")
            .image("abcdef123", &["docker.io/library/alpine:latest"], "l1")
            .image("fedcba321", &["localhost/mine:v1", "quay.io/x/y:2"], "l1")
            .write();
        let store = ImageStore::open(&fx.base, true)?;
        let cases = [
            ("abc", "abcdef123", "abcdef123"),
            ("alpine", "abcdef123", "docker.io/library/alpine:latest"),
            ("library/alpine:latest", "abcdef123", "docker.io/library/alpine:latest"),
            ("mine:v1", "fedcba321", "localhost/mine:v1"),
            ("quay.io/x/y:2", "fedcba321", "quay.io/x/y:2"),
        ];
        for (name, id, full) in cases {
            let (img, resolved) = store.lookup_image(name)?;
            assert_eq!((img.id.as_str(), resolved.as_str()), (id, full), "{name}");
        }
        for name in ["doesnotexist", "mine", ""] {
            assert!(matches!(
                store.lookup_image(name),
                Err(StoreError::NotFound(_))
            ));
        }
        Ok(())
    }

    #[test]
    fn test_records_roundtrip_extra_fields() -> Result<()> {
        let td = tempfile::tempdir()?;
        let fx = StoreFixture::new(td.path())
            .layer("l1", None, "LINK1")
            .image("img1", &["a:latest"], "l1")
            .write();
        let mut store = ImageStore::open(&fx.base, false)?;
        let img = &store.images()[0];
        assert_eq!(img.extra["created"], "2024-01-01T00:00:00Z");
        assert_eq!(img.big_data_names, ["manifest"]);
        // Adding a new image must keep the opaque fields of existing ones
        let mut new = img.clone();
        new.id = "img2".into();
        new.names.clear();
        assert!(store.add_records(&[new])?);
        let raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(
            fx.base.join("overlay-images/images.json"),
        )?)?;
        assert_eq!(raw[0]["created"], "2024-01-01T00:00:00Z");
        assert_eq!(raw[1]["id"], "img2");
        assert!(raw[1].get("names").is_none());
        Ok(())
    }

    #[test]
    fn test_add_and_delete_records() -> Result<()> {
        let td = tempfile::tempdir()?;
        let fx = StoreFixture::new(td.path())
            .layer("l1", None, "LINK1")
            .write();
        let mut store = ImageStore::open(&fx.base, false)?;
        let l1 = store.layer("l1").unwrap().clone();
        let l2 = LayerRecord {
            id: "l2".into(),
            parent: Some("l1".into()),
            extra: Default::default(),
        };
        assert!(store.add_records(&[l1.clone(), l2.clone(), l2.clone()])?);
        assert_eq!(store.layers().len(), 2);
        assert!(!store.add_records(&[l1])?);

        assert!(!store.delete_record(RecordKind::Layers, "nope", "id")?);
        assert!(store.delete_record(RecordKind::Layers, "l1", "parent")?);
        similar_asserts::assert_eq!(
            store.layers().iter().map(|l| l.id.as_str()).collect::<Vec<_>>(),
            ["l1"]
        );

        let mut ro = ImageStore::open(&fx.base, true)?;
        assert!(ro.add_records(&[l2]).is_err());
        assert!(ro.delete_record(RecordKind::Layers, "l1", "id").is_err());
        assert!(ro.drop_tag(&["x".into()]).is_err());
        Ok(())
    }

    #[test]
    fn test_drop_tag() -> Result<()> {
        let td = tempfile::tempdir()?;
        let fx = StoreFixture::new(td.path())
            .layer("l1", None, "LINK1")
            .image("img1", &["a:latest", "b:latest"], "l1")
            .image("img2", &["c:latest"], "l1")
            .write();
        let mut store = ImageStore::open(&fx.base, false)?;
        store.drop_tag(&["a:latest".into(), "c:latest".into()])?;
        assert!(tagged(&store, "a:latest").is_empty());
        assert_eq!(tagged(&store, "b:latest"), ["img1"]);
        store.refresh()?;
        assert!(tagged(&store, "c:latest").is_empty());
        assert_eq!(store.images().len(), 2);
        Ok(())
    }

    #[test]
    fn test_links_and_manifest() -> Result<()> {
        let td = tempfile::tempdir()?;
        let fx = StoreFixture::new(td.path())
            .layer("l1", None, "LINK1")
            .image("img1", &["a:latest"], "l1")
            .write();
        let store = ImageStore::open(&fx.base, true)?;
        assert_eq!(store.read_link_file("l1")?, "LINK1");
        let e = store.read_link_file("missing").unwrap_err();
        assert!(matches!(
            e.downcast_ref::<StoreError>(),
            Some(StoreError::NotFound(_))
        ));
        assert_eq!(
            store.squash_file_path("LINK1"),
            fx.base.join("overlay/l/LINK1.squash")
        );
        assert_eq!(store.manifest("img1")?["schemaVersion"], 2);
        Ok(())
    }

    fn layer(id: &str) -> LayerRecord {
        LayerRecord {
            id: id.into(),
            parent: None,
            extra: Default::default(),
        }
    }

    #[test]
    fn test_add_records_waits_for_lock() -> Result<()> {
        use std::sync::mpsc;
        use std::time::Duration;

        let td = tempfile::tempdir()?;
        let base = Utf8Path::from_path(td.path()).unwrap().join("store");
        let store = ImageStore::open(&base, false)?;
        store.init_store()?;

        // Another writer holds the layers lock
        let other = ImageStore::open(&base, false)?;
        let holder = other.lock(RecordKind::Layers)?;

        let (tx, rx) = mpsc::channel();
        let worker = std::thread::spawn(move || -> Result<()> {
            let mut store = store;
            store.add_records(&[layer("l1")])?;
            tx.send(()).unwrap();
            Ok(())
        });
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
        assert!(ImageStore::open(&base, true)?.layers().is_empty());

        drop(holder);
        rx.recv_timeout(Duration::from_secs(30))?;
        worker.join().unwrap()?;
        assert_eq!(ImageStore::open(&base, true)?.layers().len(), 1);
        Ok(())
    }

    #[test]
    fn test_concurrent_add_records() -> Result<()> {
        let td = tempfile::tempdir()?;
        let base = Utf8Path::from_path(td.path()).unwrap().join("store");
        ImageStore::open(&base, false)?.init_store()?;

        let workers: Vec<_> = (0..4)
            .map(|w| {
                let base = base.clone();
                std::thread::spawn(move || -> Result<()> {
                    let mut store = ImageStore::open(&base, false)?;
                    for i in 0..25 {
                        store.add_records(&[layer(&format!("w{w}-{i}"))])?;
                    }
                    Ok(())
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap()?;
        }
        let store = ImageStore::open(&base, true)?;
        let ids: HashSet<&str> = store.layers().iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids.len(), 100);
        assert_eq!(store.layers().len(), 100);
        Ok(())
    }

    #[test]
    fn test_merge_records_preserve_first() {
        let rec = |id: &str, parent: &str| LayerRecord {
            id: id.into(),
            parent: Some(parent.into()),
            extra: Default::default(),
        };
        let a = [rec("1", "src"), rec("2", "src")];
        let b = [rec("2", "dst"), rec("3", "dst")];
        let merged = merge_records_preserve_first(&[&a, &b]);
        similar_asserts::assert_eq!(merged, vec![rec("1", "src"), rec("2", "src"), rec("3", "dst")]);
    }
}

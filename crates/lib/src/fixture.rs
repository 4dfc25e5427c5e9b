//! Builders for on-disk overlay stores used in unit tests.

use std::path::Path;

use camino::Utf8PathBuf;
use serde_json::{Value, json};

/// An overlay store populated layer by layer.
pub(crate) struct StoreFixture {
    pub(crate) base: Utf8PathBuf,
    images: Vec<Value>,
    layers: Vec<Value>,
}

impl StoreFixture {
    pub(crate) fn new(base: impl AsRef<Path>) -> Self {
        let base = Utf8PathBuf::try_from(base.as_ref().to_owned()).unwrap();
        for d in ["overlay/l", "overlay-images", "overlay-layers"] {
            std::fs::create_dir_all(base.join(d)).unwrap();
        }
        Self {
            base,
            images: Vec::new(),
            layers: Vec::new(),
        }
    }

    /// A layer with its overlay directories, link and tar-split blob.
    pub(crate) fn layer(mut self, id: &str, parent: Option<&str>, link: &str) -> Self {
        let mut rec = json!({"id": id, "created": "2024-01-01T00:00:00Z", "compressed-size": 1234});
        if let Some(p) = parent {
            rec["parent"] = p.into();
        }
        self.layers.push(rec);
        let dir = self.base.join("overlay").join(id);
        for d in ["diff", "work", "merged"] {
            std::fs::create_dir_all(dir.join(d)).unwrap();
        }
        std::fs::write(dir.join("diff").join(format!("file-{id}")), id).unwrap();
        std::fs::write(dir.join("link"), link).unwrap();
        std::os::unix::fs::symlink(
            format!("../{id}/diff"),
            self.base.join("overlay/l").join(link),
        )
        .unwrap();
        std::fs::write(
            self.base
                .join("overlay-layers")
                .join(format!("{id}.tar-split.gz")),
            format!("tar-split {id}"),
        )
        .unwrap();
        self
    }

    /// An image whose top layer is `layer`, with a manifest.
    pub(crate) fn image(mut self, id: &str, names: &[&str], layer: &str) -> Self {
        self.images.push(json!({
            "id": id,
            "names": names,
            "layer": layer,
            "big-data-names": ["manifest"],
            "created": "2024-01-01T00:00:00Z",
        }));
        let dir = self.base.join("overlay-images").join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("manifest"), r#"{"schemaVersion": 2}"#).unwrap();
        self
    }

    /// Write the record files.
    pub(crate) fn write(self) -> Self {
        let images = serde_json::to_string(&self.images).unwrap();
        std::fs::write(self.base.join("overlay-images/images.json"), images).unwrap();
        let layers = serde_json::to_string(&self.layers).unwrap();
        std::fs::write(self.base.join("overlay-layers/layers.json"), layers).unwrap();
        self
    }
}

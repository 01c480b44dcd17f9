//! Mustache overlay assets and the choice function that picks one per face.

use image::{GrayImage, RgbImage, RgbaImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OverlayError {
    #[error("overlay directory {0} could not be read: {1}")]
    ReadDir(PathBuf, #[source] std::io::Error),
    #[error("no usable overlay images in {0}")]
    Empty(PathBuf),
}

/// One mustache sprite, split into colour and alpha planes.
#[derive(Debug, Clone)]
pub struct OverlayAsset {
    pub name: String,
    pub color: RgbImage,
    /// Alpha channel: 255 where the sprite is opaque.
    pub mask: GrayImage,
    /// `255 - mask`, kept alongside so both planes resample identically.
    pub inverted_mask: GrayImage,
}

impl OverlayAsset {
    pub fn from_rgba(name: impl Into<String>, rgba: &RgbaImage) -> Self {
        let (w, h) = rgba.dimensions();
        let mut color = RgbImage::new(w, h);
        let mut mask = GrayImage::new(w, h);
        let mut inverted_mask = GrayImage::new(w, h);
        for (x, y, px) in rgba.enumerate_pixels() {
            let [r, g, b, a] = px.0;
            color.put_pixel(x, y, image::Rgb([r, g, b]));
            mask.put_pixel(x, y, image::Luma([a]));
            inverted_mask.put_pixel(x, y, image::Luma([255 - a]));
        }
        Self { name: name.into(), color, mask, inverted_mask }
    }

    pub fn width(&self) -> u32 {
        self.color.width()
    }

    pub fn height(&self) -> u32 {
        self.color.height()
    }
}

/// Strategy for picking an overlay index out of `count` candidates.
pub trait OverlayChooser {
    /// Return an index in `0..count`. `count` is never zero.
    fn choose(&mut self, count: usize) -> usize;
}

/// Uniform random choice.
pub struct RandomChooser {
    rng: StdRng,
}

impl RandomChooser {
    pub fn from_entropy() -> Self {
        Self { rng: StdRng::from_entropy() }
    }

    pub fn seeded(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed) }
    }
}

impl OverlayChooser for RandomChooser {
    fn choose(&mut self, count: usize) -> usize {
        self.rng.gen_range(0..count)
    }
}

/// Always the same index (wrapped into range).
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedChooser(pub usize);

impl OverlayChooser for FixedChooser {
    fn choose(&mut self, count: usize) -> usize {
        self.0 % count
    }
}

/// The set of overlay assets found in one directory.
#[derive(Debug, Clone)]
pub struct OverlayLibrary {
    assets: Vec<OverlayAsset>,
}

impl OverlayLibrary {
    /// Load every decodable image file in `dir`, sorted by file name.
    ///
    /// Sub-directories are ignored; files that fail to decode are skipped
    /// with a warning. At least one asset must load.
    pub fn load_dir(dir: &Path) -> Result<Self, OverlayError> {
        let entries = std::fs::read_dir(dir).map_err(|e| OverlayError::ReadDir(dir.to_path_buf(), e))?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        paths.sort();

        let mut assets = Vec::with_capacity(paths.len());
        for path in &paths {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            match image::open(path) {
                Ok(img) => {
                    if !img.color().has_alpha() {
                        tracing::warn!(overlay = %name, "overlay has no alpha channel; it will paste as a solid block");
                    }
                    assets.push(OverlayAsset::from_rgba(name, &img.to_rgba8()));
                }
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable overlay"),
            }
        }

        if assets.is_empty() {
            return Err(OverlayError::Empty(dir.to_path_buf()));
        }
        tracing::info!(dir = %dir.display(), count = assets.len(), "loaded mustache overlays");
        Ok(Self { assets })
    }

    /// Build a library from in-memory assets. Returns `None` if `assets` is empty.
    pub fn from_assets(assets: Vec<OverlayAsset>) -> Option<Self> {
        (!assets.is_empty()).then_some(Self { assets })
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.assets.iter().map(|a| a.name.as_str())
    }

    /// Pick one asset through `chooser`.
    pub fn pick(&self, chooser: &mut dyn OverlayChooser) -> &OverlayAsset {
        let idx = chooser.choose(self.assets.len()).min(self.assets.len() - 1);
        let asset = &self.assets[idx];
        tracing::debug!(overlay = %asset.name, "selected overlay");
        asset
    }
}

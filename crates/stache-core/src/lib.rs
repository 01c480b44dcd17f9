//! stache-core: face/nose detection and mustache compositing.
//!
//! Detection runs SCRFD via ONNX Runtime behind the [`Detector`] trait;
//! compositing is plain `image` buffer work.

pub mod compositor;
pub mod detector;
pub mod overlay;
pub mod resize;
pub mod types;

pub use compositor::{CompositeError, CompositeOutcome, Compositor, CompositorConfig};
pub use detector::{Detector, DetectorError, FaceDetector, NoseDetector};
pub use overlay::{FixedChooser, OverlayChooser, OverlayLibrary, RandomChooser};
pub use types::{BoundingBox, Rect};

use std::path::PathBuf;

/// File name of the SCRFD model inside the model directory.
pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";

/// Default data directory: `$XDG_DATA_HOME/stache`, falling back to `~/.local/share/stache`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("stache")
}

/// Default model directory: `<data dir>/models`.
pub fn default_model_dir() -> PathBuf {
    default_data_dir().join("models")
}

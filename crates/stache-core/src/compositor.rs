//! Face/nose-anchored mustache compositing.
//!
//! Pipeline per image:
//! 1. resize to bounds (short edge → `target_size`, long edge ≤ `max_size`)
//! 2. detect faces on the grayscale frame
//! 3. per face: pick an overlay, detect noses inside the face box
//! 4. per nose (up to `max_noses_per_face`): place a mustache three noses
//!    wide, centred on the nose, straddling its bottom edge, clipped to the
//!    face box, and alpha-blend it in.

use crate::detector::{Detector, DetectorError};
use crate::overlay::{OverlayAsset, OverlayChooser, OverlayLibrary, RandomChooser};
use crate::resize::{resize_to_bounds, ResizeError};
use crate::types::Rect;
use image::imageops::{self, FilterType};
use image::{ImageError, ImageReader, RgbImage};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Mustache width as a multiple of nose width.
const MUSTACHE_TO_NOSE_WIDTH: u32 = 3;

#[derive(Error, Debug)]
pub enum CompositeError {
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
    #[error("resize: {0}")]
    Resize(#[from] ResizeError),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
}

/// Tunables for one compositor instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositorConfig {
    /// Short-edge length the source is scaled to before detection.
    pub target_size: u32,
    /// Cap on the long edge after scaling.
    pub max_size: u32,
    /// Noses composited per face; further detections in the same face are ignored.
    pub max_noses_per_face: usize,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            target_size: 600,
            max_size: 1000,
            max_noses_per_face: 1,
        }
    }
}

/// What a call to [`Compositor::composite`] produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeOutcome {
    /// No face found; nothing was written.
    NoFaces,
    /// The output file was written.
    Written { faces: usize, mustaches: usize },
}

impl CompositeOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, Self::Written { .. })
    }
}

/// An in-memory composite.
#[derive(Debug, Clone)]
pub struct Composited {
    pub image: RgbImage,
    pub faces: usize,
    pub mustaches: usize,
}

/// Mustache box for `nose`, in the coordinate frame of its face.
///
/// Returns `None` when clipping to the `face_width × face_height` box
/// leaves nothing to draw.
pub fn mustache_placement(
    nose: Rect,
    face_width: u32,
    face_height: u32,
    overlay_width: u32,
    overlay_height: u32,
) -> Option<Rect> {
    if nose.is_empty() || overlay_width == 0 || overlay_height == 0 {
        return None;
    }

    let width = i64::from(MUSTACHE_TO_NOSE_WIDTH * nose.width);
    let height = width * i64::from(overlay_height) / i64::from(overlay_width);

    // Horizontal centre on the nose centre, vertical centre on the nose's bottom edge.
    let x1 = i64::from(nose.x) + (i64::from(nose.width) - width) / 2;
    let y1 = i64::from(nose.bottom()) - height / 2;
    let x2 = x1 + width;
    let y2 = y1 + height;

    let x1 = x1.max(0);
    let y1 = y1.max(0);
    let x2 = x2.min(i64::from(face_width));
    let y2 = y2.min(i64::from(face_height));

    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some(Rect::new(x1 as u32, y1 as u32, (x2 - x1) as u32, (y2 - y1) as u32))
}

/// Cut a hole with the inverted mask, paste the sprite through the mask.
///
/// `at` must lie inside `frame`.
fn blend(frame: &mut RgbImage, at: Rect, overlay: &OverlayAsset) {
    let sprite = imageops::resize(&overlay.color, at.width, at.height, FilterType::Triangle);
    let mask = imageops::resize(&overlay.mask, at.width, at.height, FilterType::Triangle);
    let inverted = imageops::resize(&overlay.inverted_mask, at.width, at.height, FilterType::Triangle);

    for (x, y, fg) in sprite.enumerate_pixels() {
        let m = u32::from(mask.get_pixel(x, y).0[0]);
        let inv = u32::from(inverted.get_pixel(x, y).0[0]);
        let bg = frame.get_pixel_mut(at.x + x, at.y + y);
        for c in 0..3 {
            let v = (u32::from(bg.0[c]) * inv + u32::from(fg.0[c]) * m + 127) / 255;
            bg.0[c] = v.min(255) as u8;
        }
    }
}

/// Stamps mustaches under detected noses.
///
/// Holds everything one compositing call needs; nothing is global.
pub struct Compositor {
    faces: Box<dyn Detector + Send>,
    noses: Box<dyn Detector + Send>,
    overlays: OverlayLibrary,
    chooser: Box<dyn OverlayChooser + Send>,
    config: CompositorConfig,
}

impl Compositor {
    pub fn new(
        faces: Box<dyn Detector + Send>,
        noses: Box<dyn Detector + Send>,
        overlays: OverlayLibrary,
        config: CompositorConfig,
    ) -> Self {
        Self {
            faces,
            noses,
            overlays,
            chooser: Box::new(RandomChooser::from_entropy()),
            config,
        }
    }

    /// Replace the overlay choice function (random by default).
    pub fn with_chooser(mut self, chooser: Box<dyn OverlayChooser + Send>) -> Self {
        self.chooser = chooser;
        self
    }

    /// Composite `input` into `output`.
    ///
    /// The input format is sniffed from its contents; the output format
    /// follows `output`'s extension. Nothing is written when no face is found.
    pub fn composite(&mut self, input: &Path, output: &Path) -> Result<CompositeOutcome, CompositeError> {
        tracing::debug!(path = %input.display(), "opening image");
        let source = ImageReader::open(input)
            .and_then(|r| r.with_guessed_format())
            .map_err(ImageError::IoError)?
            .decode()?
            .to_rgb8();

        let Some(done) = self.composite_image(&source)? else {
            tracing::info!(path = %input.display(), "no faces detected");
            return Ok(CompositeOutcome::NoFaces);
        };

        done.image.save(output)?;
        tracing::info!(
            faces = done.faces,
            mustaches = done.mustaches,
            output = %output.display(),
            "wrote annotated image"
        );
        Ok(CompositeOutcome::Written { faces: done.faces, mustaches: done.mustaches })
    }

    /// Composite an in-memory image. `None` means no face was found.
    pub fn composite_image(&mut self, source: &RgbImage) -> Result<Option<Composited>, CompositeError> {
        let (mut frame, _) = resize_to_bounds(source, self.config.target_size, self.config.max_size)?;
        let gray = imageops::grayscale(&frame);

        let faces = self.faces.detect(&gray, Rect::full(frame.width(), frame.height()))?;
        tracing::debug!(count = faces.len(), "detected faces");
        if faces.is_empty() {
            return Ok(None);
        }

        let mut mustaches = 0;
        for face in &faces {
            let overlay = self.overlays.pick(self.chooser.as_mut());
            let noses = self.noses.detect(&gray, *face)?;
            tracing::debug!(?face, noses = noses.len(), "detected noses in face");

            for nose in noses.iter().take(self.config.max_noses_per_face) {
                let Some(placement) =
                    mustache_placement(*nose, face.width, face.height, overlay.width(), overlay.height())
                else {
                    continue;
                };
                blend(&mut frame, placement.offset_by(face), overlay);
                mustaches += 1;
            }
        }

        Ok(Some(Composited { image: frame, faces: faces.len(), mustaches }))
    }
}

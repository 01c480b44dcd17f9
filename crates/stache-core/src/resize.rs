//! Resize-to-bounds: uniform scaling driven by the short edge, capped by the long edge.

use image::imageops::{self, FilterType};
use image::{GenericImageView, ImageBuffer, Pixel};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ResizeError {
    #[error("cannot resize an empty {0}x{1} image")]
    EmptyImage(u32, u32),
    #[error("target and max sizes must be non-zero (target={target}, max={max})")]
    InvalidBounds { target: u32, max: u32 },
}

type Resized<I> = ImageBuffer<<I as GenericImageView>::Pixel, Vec<<<I as GenericImageView>::Pixel as Pixel>::Subpixel>>;

/// Scale factor that brings the short edge to `target_size` unless that
/// would push the long edge past `max_size`, in which case the long edge
/// lands on `max_size` instead.
pub fn scale_for(width: u32, height: u32, target_size: u32, max_size: u32) -> Result<f64, ResizeError> {
    if width == 0 || height == 0 {
        return Err(ResizeError::EmptyImage(width, height));
    }
    if target_size == 0 || max_size == 0 {
        return Err(ResizeError::InvalidBounds { target: target_size, max: max_size });
    }

    let short = f64::from(width.min(height));
    let long = f64::from(width.max(height));
    let scale = f64::from(target_size) / short;
    if (scale * long).round() > f64::from(max_size) {
        Ok(f64::from(max_size) / long)
    } else {
        Ok(scale)
    }
}

/// Output dimensions for `scale`, never below one pixel.
pub fn scaled_dimensions(width: u32, height: u32, scale: f64) -> (u32, u32) {
    let w = (f64::from(width) * scale).round().max(1.0) as u32;
    let h = (f64::from(height) * scale).round().max(1.0) as u32;
    (w, h)
}

/// Resize `image` by [`scale_for`] with bilinear resampling.
///
/// Returns the new image and the scale applied.
pub fn resize_to_bounds<I>(image: &I, target_size: u32, max_size: u32) -> Result<(Resized<I>, f64), ResizeError>
where
    I: GenericImageView,
    I::Pixel: 'static,
    <I::Pixel as Pixel>::Subpixel: 'static,
{
    let (width, height) = image.dimensions();
    let scale = scale_for(width, height, target_size, max_size)?;
    let (new_w, new_h) = scaled_dimensions(width, height, scale);

    tracing::debug!(width, height, new_w, new_h, scale, "resize to bounds");
    Ok((imageops::resize(image, new_w, new_h, FilterType::Triangle), scale))
}

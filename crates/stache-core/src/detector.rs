//! Region detectors.
//!
//! The compositor only needs "find candidate rectangles of a trained object
//! class inside a region of a grayscale image". [`Detector`] is that seam.
//! The shipped implementations run SCRFD through ONNX Runtime: [`FaceDetector`]
//! reports face boxes, [`NoseDetector`] turns SCRFD's nose landmark into a
//! nose box.

use crate::types::{BoundingBox, Rect};
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

/// Nose box width relative to the distance between the eyes.
const NOSE_WIDTH_RATIO: f32 = 0.6;
/// How far below the nose tip the box ends, as a fraction of tip-to-mouth distance.
const NOSE_BOTTOM_RATIO: f32 = 0.35;
/// Margin kept around a face box for the landmark pass, as a fraction of its size.
/// SCRFD needs some context around a face to find it again.
const NOSE_CONTEXT_MARGIN: f32 = 0.5;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (download det_10g.onnx from insightface into the model dir)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("region {roi:?} lies outside the {width}x{height} image")]
    RegionOutOfBounds { roi: Rect, width: u32, height: u32 },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Multi-scale detector of one object class.
pub trait Detector {
    /// Find candidate regions inside `roi` of `gray`.
    ///
    /// Returned rectangles are relative to the top-left corner of `roi`
    /// and lie within it.
    fn detect(&mut self, gray: &GrayImage, roi: Rect) -> Result<Vec<Rect>, DetectorError>;
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn detect(&mut self, gray: &GrayImage, roi: Rect) -> Result<Vec<Rect>, DetectorError> {
        (**self).detect(gray, roi)
    }
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx, kps_idx).
type StrideOutputIndices = (usize, usize, usize);

/// SCRFD face detector.
pub struct FaceDetector {
    session: Session,
    input_height: usize,
    input_width: usize,
    stride_indices: [StrideOutputIndices; 3],
    min_size: u32,
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            input_height: SCRFD_INPUT_SIZE,
            input_width: SCRFD_INPUT_SIZE,
            stride_indices,
            min_size: 0,
        })
    }

    /// Drop faces whose box is narrower or shorter than `min_size` pixels.
    pub fn with_min_size(mut self, min_size: u32) -> Self {
        self.min_size = min_size;
        self
    }

    /// Run SCRFD on a whole grayscale image, returning boxes sorted by confidence.
    pub fn detect_boxes(&mut self, gray: &GrayImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if gray.width() == 0 || gray.height() == 0 {
            return Ok(Vec::new());
        }
        let (input, letterbox) = letterbox(gray, self.input_width, self.input_height);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut all_detections = Vec::new();
        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_indices[stride_pos];

            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;
            let (_, kps) = outputs[kps_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("kps stride {stride}: {e}")))?;

            all_detections.extend(decode_stride(
                StrideOutputs { scores, bboxes, kps },
                stride,
                self.input_width,
                self.input_height,
                &letterbox,
            ));
        }

        let mut result = nms(all_detections, SCRFD_NMS_THRESHOLD);
        result.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        Ok(result)
    }
}

impl Detector for FaceDetector {
    fn detect(&mut self, gray: &GrayImage, roi: Rect) -> Result<Vec<Rect>, DetectorError> {
        let crop = crop_roi(gray, roi)?;
        let min_size = self.min_size;
        let faces = self
            .detect_boxes(&crop)?
            .iter()
            .map(|b| b.to_rect(crop.width(), crop.height()))
            .filter(|r| !r.is_empty() && r.width >= min_size && r.height >= min_size)
            .collect();
        Ok(faces)
    }
}

/// Nose detector built on SCRFD landmarks.
///
/// Runs SCRFD on the region (normally a face box) plus a margin of context,
/// and derives a nose box from the eye, nose-tip and mouth landmarks of every
/// face whose nose tip falls inside the region.
pub struct NoseDetector {
    inner: FaceDetector,
}

impl NoseDetector {
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        Ok(Self { inner: FaceDetector::load(model_path)? })
    }
}

impl Detector for NoseDetector {
    fn detect(&mut self, gray: &GrayImage, roi: Rect) -> Result<Vec<Rect>, DetectorError> {
        check_roi(gray, roi)?;
        let padded = pad_region(roi, NOSE_CONTEXT_MARGIN, gray.width(), gray.height());
        let crop = crop_roi(gray, padded)?;
        let noses = self
            .inner
            .detect_boxes(&crop)?
            .iter()
            .filter_map(|b| b.landmarks.as_ref())
            .filter(|lms| tip_inside(lms, padded, roi))
            .map(|lms| relative_to(&nose_box(lms), padded, roi))
            .filter(|r| !r.is_empty())
            .collect();
        Ok(noses)
    }
}

/// Grow `roi` by `margin` times its size on every side, clipped to the image.
fn pad_region(roi: Rect, margin: f32, width: u32, height: u32) -> Rect {
    let dx = (roi.width as f32 * margin).round() as u32;
    let dy = (roi.height as f32 * margin).round() as u32;
    let x = roi.x.saturating_sub(dx);
    let y = roi.y.saturating_sub(dy);
    Rect::new(x, y, roi.right() + dx - x, roi.bottom() + dy - y).clamp_to(width, height)
}

/// True if the nose-tip landmark, found in `padded`, falls inside `roi`.
/// Keeps neighbouring faces caught by the margin out of the result.
fn tip_inside(landmarks: &[(f32, f32); 5], padded: Rect, roi: Rect) -> bool {
    let x = landmarks[2].0 + padded.x as f32;
    let y = landmarks[2].1 + padded.y as f32;
    x >= roi.x as f32 && x < roi.right() as f32 && y >= roi.y as f32 && y < roi.bottom() as f32
}

/// Move a box found in `padded` into `roi`'s frame, clipped to `roi`.
fn relative_to(b: &BoundingBox, padded: Rect, roi: Rect) -> Rect {
    let shifted = BoundingBox {
        x: b.x + padded.x as f32 - roi.x as f32,
        y: b.y + padded.y as f32 - roi.y as f32,
        ..b.clone()
    };
    shifted.to_rect(roi.width, roi.height)
}

fn check_roi(gray: &GrayImage, roi: Rect) -> Result<(), DetectorError> {
    if !Rect::full(gray.width(), gray.height()).contains(&roi) {
        return Err(DetectorError::RegionOutOfBounds {
            roi,
            width: gray.width(),
            height: gray.height(),
        });
    }
    Ok(())
}

fn crop_roi(gray: &GrayImage, roi: Rect) -> Result<GrayImage, DetectorError> {
    check_roi(gray, roi)?;
    Ok(imageops::crop_imm(gray, roi.x, roi.y, roi.width, roi.height).to_image())
}

/// Nose box from five-point landmarks.
///
/// Centred on the nose tip horizontally; the bottom edge sits between the
/// tip and the mouth line, where a nostril-level box would end.
fn nose_box(landmarks: &[(f32, f32); 5]) -> BoundingBox {
    let [left_eye, right_eye, tip, left_mouth, right_mouth] = *landmarks;
    let eye_dist = ((right_eye.0 - left_eye.0).powi(2) + (right_eye.1 - left_eye.1).powi(2)).sqrt();
    let mouth_y = (left_mouth.1 + right_mouth.1) / 2.0;

    let width = eye_dist * NOSE_WIDTH_RATIO;
    let height = width;
    let bottom = tip.1 + (mouth_y - tip.1).max(0.0) * NOSE_BOTTOM_RATIO;

    BoundingBox {
        x: tip.0 - width / 2.0,
        y: bottom - height,
        width,
        height,
        confidence: 1.0,
        landmarks: None,
    }
}

/// Letterbox a grayscale image into a NCHW float tensor of `input_width × input_height`.
///
/// Padding is left at zero, which is what the SCRFD mean normalises to.
fn letterbox(gray: &GrayImage, input_width: usize, input_height: usize) -> (Array4<f32>, LetterboxInfo) {
    let (width, height) = gray.dimensions();
    let scale = (input_width as f32 / width as f32).min(input_height as f32 / height as f32);

    let new_w = ((width as f32 * scale).round() as usize).clamp(1, input_width);
    let new_h = ((height as f32 * scale).round() as usize).clamp(1, input_height);
    let pad_x = (input_width - new_w) as f32 / 2.0;
    let pad_y = (input_height - new_h) as f32 / 2.0;

    let resized = imageops::resize(gray, new_w as u32, new_h as u32, FilterType::Triangle);

    let pad_x_start = pad_x.floor() as usize;
    let pad_y_start = pad_y.floor() as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, input_height, input_width));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let normalized = (pixel.0[0] as f32 - SCRFD_MEAN) / SCRFD_STD;
        let (tx, ty) = (x as usize + pad_x_start, y as usize + pad_y_start);
        // Grayscale → 3-channel
        tensor[[0, 0, ty, tx]] = normalized;
        tensor[[0, 1, ty, tx]] = normalized;
        tensor[[0, 2, ty, tx]] = normalized;
    }

    (tensor, LetterboxInfo { scale, pad_x, pad_y })
}

/// Map SCRFD outputs to stride slots.
///
/// Exports either name their tensors "score_8", "bbox_16", "kps_32", ... or
/// use generic numeric names, in which case the standard positional order
/// applies: [0-2] scores, [3-5] bboxes, [6-8] kps for strides 8/16/32.
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?, find("kps", stride)?)))
        .collect();

    match named.as_deref() {
        Some(&[s8, s16, s32]) => [s8, s16, s32],
        _ => {
            tracing::info!(?names, "SCRFD: output names not recognized, using positional mapping");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

struct StrideOutputs<'a> {
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

/// Decode detections for a single stride level.
fn decode_stride(
    out: StrideOutputs<'_>,
    stride: usize,
    input_width: usize,
    input_height: usize,
    letterbox: &LetterboxInfo,
) -> Vec<BoundingBox> {
    let grid_w = input_width / stride;
    let num_anchors = (input_height / stride) * grid_w * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;
    let unmap = |x: f32, y: f32| {
        ((x - letterbox.pad_x) / letterbox.scale, (y - letterbox.pad_y) / letterbox.scale)
    };

    let mut detections = Vec::new();
    for idx in 0..num_anchors {
        let score = out.scores.get(idx).copied().unwrap_or(0.0);
        if score <= SCRFD_CONFIDENCE_THRESHOLD {
            continue;
        }

        let anchor_idx = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_cx = (anchor_idx % grid_w) as f32 * s;
        let anchor_cy = (anchor_idx / grid_w) as f32 * s;

        let Some(d) = out.bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };
        let (x1, y1) = unmap(anchor_cx - d[0] * s, anchor_cy - d[1] * s);
        let (x2, y2) = unmap(anchor_cx + d[2] * s, anchor_cy + d[3] * s);

        let landmarks = out.kps.get(idx * 10..idx * 10 + 10).map(|k| {
            std::array::from_fn(|i| unmap(anchor_cx + k[i * 2] * s, anchor_cy + k[i * 2 + 1] * s))
        });

        detections.push(BoundingBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
            landmarks,
        });
    }

    detections
}

/// Non-Maximum Suppression: remove overlapping detections.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<BoundingBox> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| iou(k, &det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

/// Intersection-over-Union between two bounding boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter_area = inter_w * inter_h;
    let union_area = a.width * a.height + b.width * b.height - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}

//! YOLO object detection over an ONNX export.
//!
//! The graph is expected to take a letterboxed `[1, 3, S, S]` tensor in `[0, 1]`
//! and return `[1, 4 + classes, anchors]` rows of `cx, cy, w, h` followed by
//! per-class scores (the standard Ultralytics export).

use crate::config::DetectorSettings;
use crate::error::{PawsightError, Result};
use crate::onnx::OnnxSession;
use image::{imageops::FilterType, DynamicImage, GenericImageView, Rgb, RgbImage};
use ndarray::{Array4, ArrayView2, ArrayView3};
use ort::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

pub const COCO_PERSON: usize = 0;
pub const COCO_CAT: usize = 15;
pub const COCO_DOG: usize = 16;
/// Classes considered when picking the try-on subject.
pub const SUBJECT_CLASSES: [usize; 3] = [COCO_PERSON, COCO_CAT, COCO_DOG];

const LETTERBOX_FILL: u8 = 114;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AnimalKind {
    Dog,
    Cat,
}

impl AnimalKind {
    #[must_use]
    pub const fn from_coco_class(class_id: usize) -> Option<Self> {
        match class_id {
            COCO_CAT => Some(Self::Cat),
            COCO_DOG => Some(Self::Dog),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dog => "dog",
            Self::Cat => "cat",
        }
    }
}

impl fmt::Display for AnimalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnimalKind {
    type Err = PawsightError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dog" => Ok(Self::Dog),
            "cat" => Ok(Self::Cat),
            other => Err(PawsightError::Config(format!(
                "Animal type must be 'dog' or 'cat', got '{other}'"
            ))),
        }
    }
}

/// Axis-aligned box in source image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    #[must_use]
    pub const fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    #[must_use]
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    #[must_use]
    pub fn iou(&self, other: &Self) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Integer `[x1, y1, x2, y2]`, truncated toward zero like a numpy int cast.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn pixels(&self) -> [i32; 4] {
        [
            self.x1 as i32,
            self.y1 as i32,
            self.x2 as i32,
            self.y2 as i32,
        ]
    }

    fn clamp(self, width: f32, height: f32) -> Self {
        Self {
            x1: self.x1.clamp(0.0, width),
            y1: self.y1.clamp(0.0, height),
            x2: self.x2.clamp(0.0, width),
            y2: self.y2.clamp(0.0, height),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub class_id: usize,
}

impl Detection {
    #[must_use]
    pub const fn animal(&self) -> Option<AnimalKind> {
        AnimalKind::from_coco_class(self.class_id)
    }
}

/// Geometry needed to map letterboxed coordinates back to the source image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub width: u32,
    pub height: u32,
}

impl Letterbox {
    fn unmap(&self, bbox: BoundingBox) -> BoundingBox {
        BoundingBox {
            x1: (bbox.x1 - self.pad_x) / self.scale,
            y1: (bbox.y1 - self.pad_y) / self.scale,
            x2: (bbox.x2 - self.pad_x) / self.scale,
            y2: (bbox.y2 - self.pad_y) / self.scale,
        }
        .clamp(self.width as f32, self.height as f32)
    }
}

/// Resize keeping aspect ratio and pad to a `size × size` square.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
#[must_use]
pub fn letterbox(image: &DynamicImage, size: u32) -> (Array4<f32>, Letterbox) {
    let (width, height) = image.dimensions();
    let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
    let new_w = ((width as f32 * scale).round() as u32).clamp(1, size);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, size);
    let resized = image
        .resize_exact(new_w, new_h, FilterType::Triangle)
        .to_rgb8();

    let pad_x = (size - new_w) / 2;
    let pad_y = (size - new_h) / 2;
    let mut canvas = RgbImage::from_pixel(size, size, Rgb([LETTERBOX_FILL; 3]));
    image::imageops::overlay(&mut canvas, &resized, i64::from(pad_x), i64::from(pad_y));

    let side = size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in canvas.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = f32::from(pixel[c]) / 255.0;
        }
    }

    let geometry = Letterbox {
        scale,
        pad_x: pad_x as f32,
        pad_y: pad_y as f32,
        width,
        height,
    };
    (tensor, geometry)
}

/// Decode raw `[4 + classes, anchors]` predictions into source-space detections.
///
/// Keeps the best class per anchor, drops scores below `conf` and classes not
/// in `classes` (an empty filter keeps everything).
#[must_use]
pub fn decode_predictions(
    preds: ArrayView2<f32>,
    geometry: &Letterbox,
    conf: f32,
    classes: &[usize],
) -> Vec<Detection> {
    let rows = preds.nrows();
    if rows <= 4 {
        return Vec::new();
    }

    let mut detections = Vec::new();
    for anchor in preds.columns() {
        let (class_id, score) = anchor
            .iter()
            .skip(4)
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, &s)| {
                if s > best.1 {
                    (i, s)
                } else {
                    best
                }
            });
        if score < conf || (!classes.is_empty() && !classes.contains(&class_id)) {
            continue;
        }
        let (cx, cy, w, h) = (anchor[0], anchor[1], anchor[2], anchor[3]);
        let bbox = BoundingBox::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0);
        detections.push(Detection {
            bbox: geometry.unmap(bbox),
            confidence: score,
            class_id,
        });
    }
    detections
}

/// Class-aware non-maximum suppression. Output is sorted by confidence, best first.
#[must_use]
pub fn non_max_suppression(mut detections: Vec<Detection>, iou: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for det in detections {
        let suppressed = kept
            .iter()
            .any(|k| k.class_id == det.class_id && k.bbox.iou(&det.bbox) > iou);
        if !suppressed {
            kept.push(det);
        }
    }
    kept
}

/// Pick the try-on subject: cats and dogs win over anything else, then the
/// largest box.
#[must_use]
pub fn select_subject(detections: &[Detection]) -> Option<Detection> {
    let animals: Vec<&Detection> = detections.iter().filter(|d| d.animal().is_some()).collect();
    let pool: Vec<&Detection> = if animals.is_empty() {
        detections.iter().collect()
    } else {
        animals
    };
    pool.into_iter()
        .max_by(|a, b| a.bbox.area().total_cmp(&b.bbox.area()))
        .copied()
}

pub struct Detector {
    pub session: OnnxSession,
    pub settings: DetectorSettings,
    input_name: String,
}

impl Detector {
    pub fn new(settings: DetectorSettings, threads: usize) -> Result<Self> {
        if !settings.model.is_file() {
            return Err(PawsightError::NotFound(settings.model.clone()));
        }
        let session = OnnxSession::with_threads(&settings.model, threads)?;
        let input_name = session.first_input_or("images");
        Ok(Self {
            session,
            settings,
            input_name,
        })
    }

    /// All detections of the configured classes, best first.
    pub fn detect(&mut self, image: &DynamicImage) -> Result<Vec<Detection>> {
        let classes = self.settings.classes.clone();
        self.detect_with(image, &classes, self.settings.conf)
    }

    /// Detections restricted to `classes` at confidence `conf`, best first.
    pub fn detect_with(
        &mut self,
        image: &DynamicImage,
        classes: &[usize],
        conf: f32,
    ) -> Result<Vec<Detection>> {
        let (tensor, geometry) = letterbox(image, self.settings.input_size);
        let input = Value::from_array(tensor)?;
        let outputs = self
            .session
            .session
            .run(ort::inputs![self.input_name.as_str() => input])?;

        let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
        if dims.len() != 3 {
            return Err(PawsightError::Inference(format!(
                "Unexpected detector output shape {dims:?}"
            )));
        }
        let view = ArrayView3::from_shape((dims[0], dims[1], dims[2]), data)?;
        let preds = view.index_axis(ndarray::Axis(0), 0);
        // Some exports emit [anchors, 4 + classes].
        let preds = if preds.nrows() > preds.ncols() {
            preds.reversed_axes()
        } else {
            preds
        };

        let raw = decode_predictions(preds, &geometry, conf, classes);
        let kept = non_max_suppression(raw, self.settings.iou);
        debug!(count = kept.len(), "detections after nms");
        Ok(kept)
    }

    /// The highest-confidence detection of the configured classes.
    pub fn best(&mut self, image: &DynamicImage) -> Result<Option<Detection>> {
        Ok(self.detect(image)?.into_iter().next())
    }

    /// The try-on subject among people, cats and dogs, see [`select_subject`].
    pub fn best_subject(&mut self, image: &DynamicImage, conf: f32) -> Result<Option<Detection>> {
        let detections = self.detect_with(image, &SUBJECT_CLASSES, conf)?;
        Ok(select_subject(&detections))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn identity_geometry(width: u32, height: u32) -> Letterbox {
        Letterbox {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
            width,
            height,
        }
    }

    fn det(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32, class_id: usize) -> Detection {
        Detection {
            bbox: BoundingBox::new(x1, y1, x2, y2),
            confidence,
            class_id,
        }
    }

    #[test]
    fn letterbox_pads_short_side() {
        let image = DynamicImage::new_rgb8(200, 100);
        let (tensor, geometry) = letterbox(&image, 64);
        assert_eq!(tensor.shape(), &[1, 3, 64, 64]);
        assert!((geometry.scale - 0.32).abs() < 1e-6);
        assert!((geometry.pad_x - 0.0).abs() < f32::EPSILON);
        assert!((geometry.pad_y - 16.0).abs() < f32::EPSILON);
        // Padding rows carry the fill value, the image body is black.
        assert!((tensor[[0, 0, 0, 0]] - 114.0 / 255.0).abs() < 1e-6);
        assert!(tensor[[0, 0, 32, 32]].abs() < 1e-6);
    }

    #[test]
    fn decode_keeps_target_classes_above_threshold() {
        // 4 box rows + 17 classes, 3 anchors.
        let mut preds = Array2::<f32>::zeros((21, 3));
        for (anchor, (cx, class, score)) in [(50.0, COCO_DOG, 0.9), (20.0, COCO_CAT, 0.1), (80.0, 2, 0.95)]
            .into_iter()
            .enumerate()
        {
            preds[[0, anchor]] = cx;
            preds[[1, anchor]] = 50.0;
            preds[[2, anchor]] = 20.0;
            preds[[3, anchor]] = 40.0;
            preds[[4 + class, anchor]] = score;
        }

        let dets = decode_predictions(
            preds.view(),
            &identity_geometry(100, 100),
            0.25,
            &[COCO_CAT, COCO_DOG],
        );
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].class_id, COCO_DOG);
        assert_eq!(dets[0].bbox.pixels(), [40, 30, 60, 70]);
        assert_eq!(dets[0].animal(), Some(AnimalKind::Dog));
    }

    #[test]
    fn decode_clamps_to_image() {
        let mut preds = Array2::<f32>::zeros((5, 1));
        preds[[0, 0]] = 5.0;
        preds[[1, 0]] = 5.0;
        preds[[2, 0]] = 30.0;
        preds[[3, 0]] = 30.0;
        preds[[4, 0]] = 0.8;
        let dets = decode_predictions(preds.view(), &identity_geometry(20, 20), 0.25, &[]);
        assert_eq!(dets[0].bbox, BoundingBox::new(0.0, 0.0, 20.0, 20.0));
    }

    #[test]
    fn nms_suppresses_overlaps_of_same_class_only() {
        let dets = vec![
            det(0.0, 0.0, 10.0, 10.0, 0.6, COCO_DOG),
            det(1.0, 1.0, 10.0, 10.0, 0.9, COCO_DOG),
            det(1.0, 1.0, 10.0, 10.0, 0.7, COCO_CAT),
            det(50.0, 50.0, 60.0, 60.0, 0.3, COCO_DOG),
        ];
        let kept = non_max_suppression(dets, 0.45);
        let confs: Vec<f32> = kept.iter().map(|d| d.confidence).collect();
        assert_eq!(confs, vec![0.9, 0.7, 0.3]);
    }

    #[test]
    fn subject_prefers_animals_then_area() {
        let dets = vec![
            det(0.0, 0.0, 100.0, 100.0, 0.9, COCO_PERSON),
            det(0.0, 0.0, 10.0, 10.0, 0.5, COCO_CAT),
            det(0.0, 0.0, 20.0, 20.0, 0.4, COCO_DOG),
        ];
        assert_eq!(select_subject(&dets).map(|d| d.class_id), Some(COCO_DOG));

        let people = vec![
            det(0.0, 0.0, 5.0, 5.0, 0.9, COCO_PERSON),
            det(0.0, 0.0, 8.0, 8.0, 0.4, COCO_PERSON),
        ];
        assert!((select_subject(&people).unwrap().confidence - 0.4).abs() < f32::EPSILON);
        assert!(select_subject(&[]).is_none());
    }

    #[test]
    fn animal_kind_parses_case_insensitively() {
        assert_eq!("Cat".parse::<AnimalKind>().unwrap(), AnimalKind::Cat);
        assert_eq!(" dog ".parse::<AnimalKind>().unwrap(), AnimalKind::Dog);
        assert!("horse".parse::<AnimalKind>().is_err());
        assert_eq!(AnimalKind::from_coco_class(COCO_PERSON), None);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = BoundingBox::new(0.0, 0.0, 1.0, 1.0);
        let b = BoundingBox::new(2.0, 2.0, 3.0, 3.0);
        assert!(a.iou(&b).abs() < f32::EPSILON);
        assert!((a.iou(&a) - 1.0).abs() < f32::EPSILON);
    }
}

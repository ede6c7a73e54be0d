//! Neural network model loading, pre- and postprocessing.
//!
use std::path::Path;

use anyhow::{bail, Context, Result};
use image::{imageops::FilterType, Rgb, RgbImage};
use tract_onnx::prelude::{tract_ndarray::{ArrayView3, Ix3}, *};

type NnModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Positive additive constant to avoid divide-by-zero.
const EPS: f32 = 1.0e-7;

/// Gray value used to pad letterboxed images.
const PAD_VALUE: u8 = 114;

/// Bounding box in pixel coordinates: `[x_top_left, y_top_left, x_bottom_right, y_bottom_right]`.
pub type Bbox = [f32; 4];

/// One object instance found by the model.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub bbox: Bbox,
    pub confidence: f32,
    pub class_id: usize,
}

/// Anything that turns an image into detections.
pub trait InferModel: Send + Sync {
    fn run(&self, input: &RgbImage, min_confidence: f32) -> Result<Vec<Detection>>;
}

/// YOLO input sides are multiples of the largest network stride.
const INPUT_STRIDE: u32 = 32;

/// Parameters of a YOLO detector.
#[derive(Clone, Debug)]
pub struct YoloParams {
    /// Side length of the square network input.
    pub input_size: u32,
    /// Maximum intersection-over-union before a candidate is suppressed.
    pub max_iou: f32,
    /// Upper bound on the number of returned detections.
    pub max_detections: usize,
}

impl Default for YoloParams {
    fn default() -> Self {
        Self {
            input_size: 640,
            max_iou: 0.7,
            max_detections: 10000,
        }
    }
}

impl YoloParams {
    pub fn validate(&self) -> Result<()> {
        if self.input_size == 0 || self.input_size % INPUT_STRIDE != 0 {
            bail!(
                "input size must be a positive multiple of {INPUT_STRIDE}, got {}",
                self.input_size
            );
        }
        Ok(())
    }
}

/// YOLO detector exported to ONNX, run with tract.
pub struct YoloModel {
    model: NnModel,
    params: YoloParams,
}

impl YoloModel {
    pub fn new(path: impl AsRef<Path>, params: YoloParams) -> Result<Self> {
        params.validate()?;
        let path = path.as_ref();
        let size = params.input_size as usize;
        let input_fact = InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size));
        let model = tract_onnx::onnx()
            .model_for_path(path)
            .with_context(|| format!("failed to read model {}", path.display()))?
            .with_input_fact(0, input_fact)?
            .into_optimized()?
            .into_runnable()?;

        Ok(Self { model, params })
    }

    fn preproc(&self, input: &RgbImage) -> (Tensor, Letterbox) {
        let (padded, letterbox) = letterbox(input, self.params.input_size);
        let size = self.params.input_size as usize;

        let tensor: Tensor =
            tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
                padded[(x as _, y as _)][c] as f32 / 255.0
            })
            .into();

        (tensor, letterbox)
    }

    fn postproc(
        &self,
        raw_nn_out: TVec<TValue>,
        letterbox: &Letterbox,
        min_confidence: f32,
    ) -> Result<Vec<Detection>> {
        let output = raw_nn_out
            .first()
            .context("model produced no output")?
            .to_array_view::<f32>()?
            .into_dimensionality::<Ix3>()?;

        postprocess(output, letterbox, min_confidence, &self.params)
    }
}

impl InferModel for YoloModel {
    fn run(&self, input: &RgbImage, min_confidence: f32) -> Result<Vec<Detection>> {
        let (tensor, letterbox) = self.preproc(input);
        let raw_nn_out = self.model.run(tvec!(tensor.into()))?;
        self.postproc(raw_nn_out, &letterbox, min_confidence)
    }
}

/// Outcome of loading the model once at startup.
///
/// A failed load is kept as well so that every request reports the same error.
#[derive(Clone)]
pub enum ModelSlot {
    Loaded(Arc<dyn InferModel>),
    Failed(String),
}

impl ModelSlot {
    pub fn load(path: impl AsRef<Path>, params: YoloParams) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            let msg = format!("model file not found: {}", path.display());
            log::error!("{msg}");
            return Self::Failed(msg);
        }

        match YoloModel::new(path, params) {
            Ok(model) => {
                log::info!("Loaded model {}", path.display());
                Self::Loaded(Arc::new(model))
            }
            Err(e) => {
                let msg = format!("failed to load model {}: {e:#}", path.display());
                log::error!("{msg}");
                Self::Failed(msg)
            }
        }
    }

    pub fn model(&self) -> Option<Arc<dyn InferModel>> {
        match self {
            Self::Loaded(model) => Some(Arc::clone(model)),
            Self::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Loaded(_) => None,
            Self::Failed(msg) => Some(msg),
        }
    }
}

/// Mapping between original image coordinates and the letterboxed network input.
#[derive(Clone, Debug, PartialEq)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
    width: f32,
    height: f32,
}

impl Letterbox {
    /// Map a bbox from network input coordinates back onto the original image.
    fn unmap(&self, bbox: Bbox) -> Bbox {
        [
            ((bbox[0] - self.pad_x) / self.scale).clamp(0.0, self.width),
            ((bbox[1] - self.pad_y) / self.scale).clamp(0.0, self.height),
            ((bbox[2] - self.pad_x) / self.scale).clamp(0.0, self.width),
            ((bbox[3] - self.pad_y) / self.scale).clamp(0.0, self.height),
        ]
    }
}

/// Resize `input` into a `size` x `size` canvas keeping its aspect ratio, centered and padded.
fn letterbox(input: &RgbImage, size: u32) -> (RgbImage, Letterbox) {
    let (width, height) = input.dimensions();
    let scale = f32::min(size as f32 / width as f32, size as f32 / height as f32);
    let new_width = ((width as f32 * scale).round() as u32).clamp(1, size);
    let new_height = ((height as f32 * scale).round() as u32).clamp(1, size);

    let resized = image::imageops::resize(input, new_width, new_height, FilterType::Triangle);

    let pad_x = (size - new_width) / 2;
    let pad_y = (size - new_height) / 2;
    let mut padded = RgbImage::from_pixel(size, size, Rgb([PAD_VALUE; 3]));
    image::imageops::replace(&mut padded, &resized, pad_x as i64, pad_y as i64);

    let letterbox = Letterbox {
        scale,
        pad_x: pad_x as f32,
        pad_y: pad_y as f32,
        width: width as f32,
        height: height as f32,
    };

    (padded, letterbox)
}

/// Decode, suppress and cap the raw network output, most confident detection first.
fn postprocess(
    output: ArrayView3<f32>,
    letterbox: &Letterbox,
    min_confidence: f32,
    params: &YoloParams,
) -> Result<Vec<Detection>> {
    let candidates = decode_candidates(output, letterbox, min_confidence)?;
    let mut selected = non_maximum_suppression(candidates, params.max_iou);
    selected.truncate(params.max_detections);

    Ok(selected)
}

/// Turn raw network output into detections on the original image.
///
/// The output has the layout `[1, 4 + num_classes, num_candidates]`. The first four rows hold
/// `cx, cy, w, h` in network input coordinates, the remaining rows one score per class. Every
/// candidate is assigned its best scoring class and kept only if that score is above
/// `min_confidence`.
fn decode_candidates(
    output: ArrayView3<f32>,
    letterbox: &Letterbox,
    min_confidence: f32,
) -> Result<Vec<Detection>> {
    let (rows, num_candidates) = (output.shape()[1], output.shape()[2]);
    if rows < 5 {
        bail!("unexpected model output shape {:?}", output.shape());
    }

    let mut candidates = Vec::new();
    for i in 0..num_candidates {
        let (class_id, confidence) = (4..rows)
            .map(|row| output[[0, row, i]])
            .enumerate()
            .fold((0, f32::MIN), |best, (class_id, score)| {
                if score > best.1 {
                    (class_id, score)
                } else {
                    best
                }
            });

        if confidence <= min_confidence {
            continue;
        }

        let (cx, cy) = (output[[0, 0, i]], output[[0, 1, i]]);
        let (w, h) = (output[[0, 2, i]], output[[0, 3, i]]);
        let bbox = letterbox.unmap([cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0]);

        candidates.push(Detection {
            bbox,
            confidence,
            class_id,
        });
    }

    Ok(candidates)
}

/// Run non-maximum-suppression on candidate detections.
///
/// Start with the most confident detection and iterate over all others in the order of sinking
/// confidence. A candidate is kept only if it does not overlap an already selected detection of
/// the same class by more than `max_iou`. The result is sorted by descending confidence.
pub fn non_maximum_suppression(mut candidates: Vec<Detection>, max_iou: f32) -> Vec<Detection> {
    candidates.sort_by(|a, b| a.confidence.total_cmp(&b.confidence));

    let mut selected: Vec<Detection> = vec![];
    'candidates: loop {
        // Next most confident candidate from the back of the ascending-sorted vector
        match candidates.pop() {
            Some(candidate) => {
                for chosen in selected.iter() {
                    if chosen.class_id == candidate.class_id
                        && iou(&candidate.bbox, &chosen.bbox) > max_iou
                    {
                        continue 'candidates;
                    }
                }

                selected.push(candidate)
            }
            None => break 'candidates,
        }
    }

    selected
}

/// Calculate the intersection-over-union metric for two bounding boxes.
pub fn iou(bbox_a: &Bbox, bbox_b: &Bbox) -> f32 {
    // If the boxes do not overlap, the overlap box is ill defined, i.e. its top left corner lies
    // below or to the right of its bottom right corner. Its area is zero in that case.
    let overlap_box: Bbox = [
        f32::max(bbox_a[0], bbox_b[0]),
        f32::max(bbox_a[1], bbox_b[1]),
        f32::min(bbox_a[2], bbox_b[2]),
        f32::min(bbox_a[3], bbox_b[3]),
    ];

    let overlap_area = bbox_area(&overlap_box);

    // Avoid division-by-zero with `EPS`
    overlap_area / (bbox_area(bbox_a) + bbox_area(bbox_b) - overlap_area + EPS)
}

/// Calculate the area enclosed by a bounding box.
///
/// If the bounding box is ill-defined by having the bottom-right point above/to the left of the
/// top-left point, the area is zero.
pub fn bbox_area(bbox: &Bbox) -> f32 {
    let width = bbox[2] - bbox[0];
    let height = bbox[3] - bbox[1];
    if width < 0.0 || height < 0.0 {
        return 0.0;
    }

    width * height
}

#[cfg(test)]
mod test {
    use super::*;

    fn detection(bbox: Bbox, confidence: f32, class_id: usize) -> Detection {
        Detection {
            bbox,
            confidence,
            class_id,
        }
    }

    #[test]
    fn test_bbox_area() {
        assert_eq!(bbox_area(&[0.0, 0.0, 2.0, 3.0]), 6.0);
        assert_eq!(bbox_area(&[2.0, 0.0, 1.0, 3.0]), 0.0);
    }

    #[test]
    fn test_iou() {
        let a = [0.0, 0.0, 2.0, 2.0];
        assert!((iou(&a, &a) - 1.0).abs() < 1e-4);
        assert_eq!(iou(&a, &[3.0, 3.0, 4.0, 4.0]), 0.0);

        // Half of `a` overlaps a box of equal size: 2 / (4 + 4 - 2)
        let shifted = [1.0, 0.0, 3.0, 2.0];
        assert!((iou(&a, &shifted) - 1.0 / 3.0).abs() < 1e-4);
    }

    #[test]
    fn test_nms_drops_overlapping_boxes() {
        let candidates = vec![
            detection([0.0, 0.0, 10.0, 10.0], 0.6, 0),
            detection([1.0, 1.0, 10.0, 10.0], 0.9, 0),
            detection([20.0, 20.0, 30.0, 30.0], 0.3, 0),
        ];

        let selected = non_maximum_suppression(candidates, 0.5);

        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].confidence, 0.9);
        assert_eq!(selected[1].confidence, 0.3);
    }

    #[test]
    fn test_nms_keeps_overlapping_boxes_of_other_classes() {
        let candidates = vec![
            detection([0.0, 0.0, 10.0, 10.0], 0.6, 0),
            detection([0.0, 0.0, 10.0, 10.0], 0.9, 1),
        ];

        assert_eq!(non_maximum_suppression(candidates, 0.5).len(), 2);
    }

    #[test]
    fn test_letterbox_maps_back_to_original() {
        let image = RgbImage::new(200, 100);
        let (padded, letterbox) = letterbox(&image, 64);

        assert_eq!(padded.dimensions(), (64, 64));
        // 200x100 is scaled to 64x32 and centered vertically
        assert_eq!(padded[(0, 0)], Rgb([PAD_VALUE; 3]));
        assert_eq!(padded[(0, 16)], Rgb([0, 0, 0]));

        let bbox = letterbox.unmap([0.0, 16.0, 64.0, 48.0]);
        for (got, expected) in bbox.iter().zip([0.0, 0.0, 200.0, 100.0]) {
            assert!((got - expected).abs() < 1e-3, "{bbox:?}");
        }
    }

    #[test]
    fn test_decode_candidates() {
        let (_, letterbox) = letterbox(&RgbImage::new(64, 64), 64);

        // Three candidates, two classes
        let output = tract_ndarray::Array3::from_shape_vec(
            (1, 6, 3),
            vec![
                10.0, 30.0, 50.0, // cx
                10.0, 30.0, 50.0, // cy
                4.0, 4.0, 4.0, // w
                4.0, 4.0, 4.0, // h
                0.8, 0.05, 0.1, // class 0
                0.1, 0.02, 0.6, // class 1
            ],
        )
        .unwrap();

        let candidates = decode_candidates(output.view(), &letterbox, 0.25).unwrap();

        assert_eq!(
            candidates,
            vec![
                detection([8.0, 8.0, 12.0, 12.0], 0.8, 0),
                detection([48.0, 48.0, 52.0, 52.0], 0.6, 1),
            ]
        );
    }

    #[test]
    fn test_decode_rejects_malformed_output() {
        let (_, letterbox) = letterbox(&RgbImage::new(64, 64), 64);
        let output = tract_ndarray::Array3::<f32>::zeros((1, 4, 10));

        assert!(decode_candidates(output.view(), &letterbox, 0.25).is_err());
    }

    #[test]
    fn test_letterbox_clips_to_image() {
        let image = RgbImage::new(64, 64);
        let (_, letterbox) = letterbox(&image, 64);

        assert_eq!(
            letterbox.unmap([-5.0, -5.0, 70.0, 70.0]),
            [0.0, 0.0, 64.0, 64.0]
        );
    }

    /// Output of `n` non-overlapping class 0 candidates with the given confidences.
    fn spread_output(confidences: &[f32]) -> tract_ndarray::Array3<f32> {
        let n = confidences.len();
        let centers: Vec<f32> = (0..n).map(|i| 8.0 + 16.0 * i as f32).collect();

        let mut values = Vec::with_capacity(5 * n);
        values.extend(&centers);
        values.extend(&centers);
        values.extend(std::iter::repeat(4.0).take(2 * n));
        values.extend(confidences);

        tract_ndarray::Array3::from_shape_vec((1, 5, n), values).unwrap()
    }

    #[test]
    fn test_postprocess_caps_detections() {
        let (_, letterbox) = letterbox(&RgbImage::new(64, 64), 64);
        let output = spread_output(&[0.5, 0.9, 0.7]);
        let params = YoloParams {
            max_detections: 1,
            ..Default::default()
        };

        let selected = postprocess(output.view(), &letterbox, 0.25, &params).unwrap();

        assert_eq!(selected, vec![detection([22.0, 22.0, 26.0, 26.0], 0.9, 0)]);
    }

    #[test]
    fn test_postprocess_orders_by_confidence() {
        let (_, letterbox) = letterbox(&RgbImage::new(64, 64), 64);
        let output = spread_output(&[0.5, 0.9, 0.7]);

        let selected =
            postprocess(output.view(), &letterbox, 0.25, &YoloParams::default()).unwrap();
        let confidences: Vec<f32> = selected.iter().map(|d| d.confidence).collect();

        assert_eq!(confidences, vec![0.9, 0.7, 0.5]);
    }

    #[test]
    fn test_decode_drops_scores_at_threshold() {
        let (_, letterbox) = letterbox(&RgbImage::new(64, 64), 64);
        let output = spread_output(&[0.25, 0.5]);

        let candidates = decode_candidates(output.view(), &letterbox, 0.25).unwrap();

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].confidence, 0.5);
    }

    #[test]
    fn test_yolo_params_validation() {
        assert!(YoloParams::default().validate().is_ok());
        assert!(YoloParams {
            input_size: 320,
            ..Default::default()
        }
        .validate()
        .is_ok());

        for input_size in [0, 100, 641] {
            let params = YoloParams {
                input_size,
                ..Default::default()
            };
            assert!(params.validate().is_err(), "{input_size}");
        }

        let err = YoloModel::new("missing.onnx", YoloParams {
            input_size: 0,
            ..Default::default()
        })
        .err()
        .map(|e| e.to_string())
        .unwrap_or_default();
        assert!(err.contains("multiple of 32"), "{err}");
    }
}

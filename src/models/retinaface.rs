//! RetinaFace detectors with five facial landmarks per face.
//!
//! [`RetinaFace`] is the original multi-stride export with one classification, box and
//! landmark output per stride. [`RetinaFacePyTorch`] is the single-head PyTorch port
//! decoded against SSD-style priors.

use crate::adapters::{output_view, InferenceAdapter, Inputs, LayerInfo, Outputs};
use crate::models::detection_model::DetectionModel;
use crate::models::faceboxes::{output_with_last_dim, prior_boxes, rows, score_priors, Prior, VARIANCE};
use crate::models::model::{ImageMeta, Model, ModelParams};
use crate::models::utils::{nms, Detection, DetectionWithLandmarks, ResizeType};
use crate::utils::error::ModelError;
use crate::Result;
use ndarray::{Array3, Axis, Ix4};
use std::sync::Arc;

const LANDMARKS: usize = 5;

/// Faces in model-input pixels with landmarks, before mapping to the original image.
type RawFace = (Detection, Vec<[f32; 2]>);

fn finish(detection: &DetectionModel, faces: Vec<RawFace>, meta: &ImageMeta) -> Vec<DetectionWithLandmarks> {
    let (boxes, landmarks): (Vec<Detection>, Vec<Vec<[f32; 2]>>) = faces.into_iter().unzip();
    detection
        .finalize(boxes, meta)
        .into_iter()
        .zip(landmarks)
        .map(|(detection, points)| {
            let points = points
                .into_iter()
                .map(|[x, y]| {
                    let (x, y) = meta.to_original(x, y);
                    [x, y]
                })
                .collect();
            DetectionWithLandmarks::new(detection, points)
        })
        .collect()
}

fn suppress(faces: Vec<RawFace>, iou_threshold: f32) -> Vec<RawFace> {
    let boxes: Vec<Detection> = faces.iter().map(|(d, _)| d.clone()).collect();
    let keep = nms(&boxes, iou_threshold, false, None);
    keep.into_iter().map(|i| faces[i].clone()).collect()
}

struct StrideHead {
    stride: usize,
    scores: String,
    boxes: String,
    landmarks: String,
    /// Anchors centred on cell (0, 0) as corner boxes, in input pixels.
    anchors: Vec<[f32; 4]>,
}

/// Corner anchors of side `16 * scale` around the centre of a 16 px base cell.
fn base_anchors(scales: &[f32]) -> Vec<[f32; 4]> {
    let center = 7.5;
    scales
        .iter()
        .map(|scale| {
            let half = 0.5 * (16.0 * scale - 1.0);
            [center - half, center - half, center + half, center + half]
        })
        .collect()
}

/// RetinaFace with per-stride outputs named `..._stride{32,16,8}`.
pub struct RetinaFace {
    detection: DetectionModel,
    heads: Vec<StrideHead>,
}

impl RetinaFace {
    pub fn new(adapter: Arc<dyn InferenceAdapter>, params: &ModelParams) -> Result<Self> {
        let heads = Self::find_heads(adapter.outputs())?;
        let detection = DetectionModel::new(adapter, params, ResizeType::Standard, 0.5, 0.5)?;
        Ok(Self { detection, heads })
    }

    fn find_heads(outputs: &[LayerInfo]) -> Result<Vec<StrideHead>> {
        let find = |kind: &str, suffix: &str| {
            outputs
                .iter()
                .find(|l| l.name.contains(kind) && l.name.ends_with(suffix))
                .map(|l| l.name.clone())
        };

        let mut heads = Vec::new();
        for (stride, scales) in [(32, [32.0, 16.0]), (16, [8.0, 4.0]), (8, [2.0, 1.0])] {
            let suffix = format!("stride{}", stride);
            if let (Some(scores), Some(boxes), Some(landmarks)) =
                (find("cls", &suffix), find("bbox", &suffix), find("landmark", &suffix))
            {
                heads.push(StrideHead {
                    stride,
                    scores,
                    boxes,
                    landmarks,
                    anchors: base_anchors(&scales),
                });
            }
        }
        if heads.is_empty() {
            return Err(ModelError::ModelLoad(format!(
                "RetinaFace: no complete cls/bbox/landmark stride outputs among {:?}",
                outputs.iter().map(|l| &l.name).collect::<Vec<_>>()
            )));
        }
        Ok(heads)
    }

    fn parse_head(&self, outputs: &Outputs, head: &StrideHead) -> Result<Vec<RawFace>> {
        let scores = output_view::<Ix4>(outputs, &head.scores)?.index_axis_move(Axis(0), 0);
        let boxes = output_view::<Ix4>(outputs, &head.boxes)?.index_axis_move(Axis(0), 0);
        let landmarks = output_view::<Ix4>(outputs, &head.landmarks)?.index_axis_move(Axis(0), 0);

        let num_anchors = head.anchors.len();
        let (channels, height, width) = scores.dim();
        if channels != 2 * num_anchors
            || boxes.dim() != (4 * num_anchors, height, width)
            || landmarks.dim() != (2 * LANDMARKS * num_anchors, height, width)
        {
            return Err(ModelError::Inference(format!(
                "RetinaFace stride {}: inconsistent shapes {:?} {:?} {:?}",
                head.stride,
                scores.shape(),
                boxes.shape(),
                landmarks.shape()
            )));
        }

        let mut faces = Vec::new();
        for row in 0..height {
            for col in 0..width {
                let (shift_x, shift_y) = ((col * head.stride) as f32, (row * head.stride) as f32);
                for (a, anchor) in head.anchors.iter().enumerate() {
                    // Background scores come first, then one face score per anchor.
                    let score = scores[[num_anchors + a, row, col]];
                    if score < self.detection.confidence_threshold {
                        continue;
                    }

                    let anchor_w = anchor[2] - anchor[0] + 1.0;
                    let anchor_h = anchor[3] - anchor[1] + 1.0;
                    let ctr_x = anchor[0] + shift_x + 0.5 * (anchor_w - 1.0);
                    let ctr_y = anchor[1] + shift_y + 0.5 * (anchor_h - 1.0);

                    let delta = |k: usize| boxes[[a * 4 + k, row, col]];
                    let pred_x = delta(0) * anchor_w + ctr_x;
                    let pred_y = delta(1) * anchor_h + ctr_y;
                    let pred_w = delta(2).exp() * anchor_w;
                    let pred_h = delta(3).exp() * anchor_h;
                    let detection = Detection::new(
                        pred_x - 0.5 * (pred_w - 1.0),
                        pred_y - 0.5 * (pred_h - 1.0),
                        pred_x + 0.5 * (pred_w - 1.0),
                        pred_y + 0.5 * (pred_h - 1.0),
                        score,
                        0,
                    );

                    let base = a * 2 * LANDMARKS;
                    let points = (0..LANDMARKS)
                        .map(|p| {
                            [
                                landmarks[[base + 2 * p, row, col]] * anchor_w + ctr_x,
                                landmarks[[base + 2 * p + 1, row, col]] * anchor_h + ctr_y,
                            ]
                        })
                        .collect();
                    faces.push((detection, points));
                }
            }
        }
        Ok(faces)
    }
}

impl Model for RetinaFace {
    type Input = Array3<f32>;
    type Meta = ImageMeta;
    type Output = Vec<DetectionWithLandmarks>;

    fn architecture(&self) -> &'static str {
        "RetinaFace"
    }

    fn adapter(&self) -> &dyn InferenceAdapter {
        self.detection.base.adapter()
    }

    fn preprocess(&self, image: &Array3<f32>) -> Result<(Inputs, ImageMeta)> {
        self.detection.base.preprocess(image)
    }

    fn postprocess(&self, outputs: &Outputs, meta: &ImageMeta) -> Result<Vec<DetectionWithLandmarks>> {
        let mut faces = Vec::new();
        for head in &self.heads {
            faces.extend(self.parse_head(outputs, head)?);
        }
        let faces = suppress(faces, self.detection.iou_threshold);
        Ok(finish(&self.detection, faces, meta))
    }
}

const PYTORCH_MIN_SIZES: [&[usize]; 3] = [&[16, 32], &[64, 128], &[256, 512]];
const PYTORCH_STEPS: [usize; 3] = [8, 16, 32];

/// RetinaFace exported from PyTorch: `boxes [1, N, 4]`, `scores [1, N, 2]` and
/// `landmarks [1, N, 10]` over a fixed prior grid.
pub struct RetinaFacePyTorch {
    detection: DetectionModel,
    priors: Vec<Prior>,
    boxes: String,
    scores: String,
    landmarks: String,
}

impl RetinaFacePyTorch {
    pub fn new(adapter: Arc<dyn InferenceAdapter>, params: &ModelParams) -> Result<Self> {
        let outputs = adapter.outputs();
        let boxes = output_with_last_dim(outputs, 4, "RetinaFacePyTorch")?;
        let scores = output_with_last_dim(outputs, 2, "RetinaFacePyTorch")?;
        let landmarks = output_with_last_dim(outputs, 2 * LANDMARKS as i64, "RetinaFacePyTorch")?;

        let detection = DetectionModel::new(adapter, params, ResizeType::Standard, 0.5, 0.4)?;
        let priors = prior_boxes(
            detection.base.input_size(),
            &PYTORCH_MIN_SIZES,
            &PYTORCH_STEPS,
            |_| 1,
        );
        Ok(Self {
            detection,
            priors,
            boxes,
            scores,
            landmarks,
        })
    }
}

impl Model for RetinaFacePyTorch {
    type Input = Array3<f32>;
    type Meta = ImageMeta;
    type Output = Vec<DetectionWithLandmarks>;

    fn architecture(&self) -> &'static str {
        "RetinaFacePyTorch"
    }

    fn adapter(&self) -> &dyn InferenceAdapter {
        self.detection.base.adapter()
    }

    fn preprocess(&self, image: &Array3<f32>) -> Result<(Inputs, ImageMeta)> {
        self.detection.base.preprocess(image)
    }

    fn postprocess(&self, outputs: &Outputs, meta: &ImageMeta) -> Result<Vec<DetectionWithLandmarks>> {
        let boxes = rows(outputs, &self.boxes)?;
        let scores = rows(outputs, &self.scores)?;
        let landmarks = rows(outputs, &self.landmarks)?;
        if landmarks.nrows() != self.priors.len() {
            return Err(ModelError::Inference(format!(
                "RetinaFacePyTorch: {} priors but {} landmark rows",
                self.priors.len(),
                landmarks.nrows()
            )));
        }

        let (width, height) = (meta.input_size.0 as f32, meta.input_size.1 as f32);
        let faces = score_priors(&self.priors, boxes, scores, self.detection.confidence_threshold)?
            .into_iter()
            .map(|(i, d)| {
                let prior = &self.priors[i];
                let points = (0..LANDMARKS)
                    .map(|p| {
                        let x = prior[0] + landmarks[[i, 2 * p]] * VARIANCE[0] * prior[2];
                        let y = prior[1] + landmarks[[i, 2 * p + 1]] * VARIANCE[0] * prior[3];
                        [x * width, y * height]
                    })
                    .collect();
                let in_pixels = Detection {
                    xmin: d.xmin * width,
                    ymin: d.ymin * height,
                    xmax: d.xmax * width,
                    ymax: d.ymax * height,
                    ..d
                };
                (in_pixels, points)
            })
            .collect();

        let faces = suppress(faces, self.detection.iou_threshold);
        Ok(finish(&self.detection, faces, meta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::RecordedAdapter;
    use crate::models::faceboxes::background_scores;
    use ndarray::{ArrayD, IxDyn};

    #[test]
    fn stride_heads_decode_boxes_and_landmarks() {
        // Stride 8 on a 16x16 input: a 2x2 grid with two anchors per cell.
        let mut scores = ArrayD::zeros(IxDyn(&[1, 4, 2, 2]));
        scores[[0, 3, 0, 0]] = 0.8;
        let boxes = ArrayD::zeros(IxDyn(&[1, 8, 2, 2]));
        let mut landmarks = ArrayD::zeros(IxDyn(&[1, 20, 2, 2]));
        landmarks[[0, 10, 0, 0]] = 0.5;

        let adapter = Arc::new(
            RecordedAdapter::new(vec![LayerInfo::new("data", vec![1, 3, 16, 16])])
                .with_output("face_rpn_cls_prob_reshape_stride8", scores)
                .with_output("face_rpn_bbox_pred_stride8", boxes)
                .with_output("face_rpn_landmark_pred_stride8", landmarks),
        );
        let model = RetinaFace::new(adapter, &ModelParams::default()).unwrap();

        let faces = model.infer_sync(&Array3::zeros((16, 16, 3))).unwrap();
        assert_eq!(faces.len(), 1);
        let face = &faces[0];
        assert!((face.detection.score - 0.8).abs() < 1e-6);
        assert_eq!(
            (face.detection.xmin, face.detection.ymin, face.detection.xmax, face.detection.ymax),
            (0.0, 0.0, 15.0, 15.0)
        );
        assert_eq!(face.landmarks.len(), LANDMARKS);
        assert_eq!(face.landmarks[0], [15.5, 7.5]);
    }

    #[test]
    fn missing_stride_outputs_are_rejected() {
        let adapter = Arc::new(
            RecordedAdapter::new(vec![LayerInfo::new("data", vec![1, 3, 16, 16])])
                .with_output("face_rpn_cls_prob_reshape_stride8", ArrayD::zeros(IxDyn(&[1, 4, 2, 2]))),
        );
        assert!(RetinaFace::new(adapter, &ModelParams::default()).is_err());
    }

    #[test]
    fn pytorch_head_decodes_against_priors() {
        // 32x32 input: 4x4*2 + 2x2*2 + 1*2 priors.
        let n = 32 + 8 + 2;
        let mut scores = background_scores(n);
        scores[[0, 1]] = 0.95;
        let boxes = ndarray::Array2::<f32>::zeros((n, 4));
        let mut landmarks = ndarray::Array2::<f32>::zeros((n, 10));
        landmarks[[0, 0]] = 1.0;

        let adapter = Arc::new(
            RecordedAdapter::new(vec![LayerInfo::new("input", vec![1, 3, 32, 32])])
                .with_output("bbox", boxes.insert_axis(Axis(0)).into_dyn())
                .with_output("confidence", scores.insert_axis(Axis(0)).into_dyn())
                .with_output("landmark", landmarks.insert_axis(Axis(0)).into_dyn()),
        );
        let model = RetinaFacePyTorch::new(adapter, &ModelParams::default()).unwrap();

        let faces = model.infer_sync(&Array3::zeros((64, 64, 3))).unwrap();
        assert_eq!(faces.len(), 1);
        // First prior: centre (4, 4), size 16 in input pixels; the image is twice as large.
        let d = &faces[0].detection;
        assert!((d.xmax - 24.0).abs() < 1e-4);
        assert_eq!(d.xmin, 0.0);
        // Landmark x: 4 + 1.0 * 0.1 * 16 = 5.6 input pixels.
        assert!((faces[0].landmarks[0][0] - 11.2).abs() < 1e-4);
        assert!((faces[0].landmarks[0][1] - 8.0).abs() < 1e-4);
    }
}

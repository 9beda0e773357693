use crate::adapters::{output_view, InferenceAdapter, Inputs, LayerInfo, Outputs};
use crate::models::detection_model::DetectionModel;
use crate::models::image_model::expect_output_count;
use crate::models::model::{ImageMeta, Model, ModelParams};
use crate::models::utils::{nms, Detection, ResizeType};
use crate::utils::error::ModelError;
use crate::Result;
use ndarray::{Array3, ArrayView2, Axis, Ix3};
use std::sync::Arc;

const MIN_SIZES: [&[usize]; 3] = [&[32, 64, 128], &[256], &[512]];
const STEPS: [usize; 3] = [32, 64, 128];
pub(crate) const VARIANCE: [f32; 2] = [0.1, 0.2];
const KEEP_TOP_K: usize = 750;

/// Prior box `(cx, cy, w, h)` as fractions of the input.
pub(crate) type Prior = [f32; 4];

/// Priors for SSD-style heads: every cell of every feature map gets one prior per min size.
///
/// `density(min_size)` returns how many priors per axis to spread over the cell for that size.
pub(crate) fn prior_boxes(
    input_size: (usize, usize),
    min_sizes: &[&[usize]],
    steps: &[usize],
    density: impl Fn(usize) -> usize,
) -> Vec<Prior> {
    let (width, height) = (input_size.0 as f32, input_size.1 as f32);
    let mut priors = Vec::new();
    for (sizes, &step) in min_sizes.iter().zip(steps) {
        let rows = input_size.1.div_ceil(step);
        let cols = input_size.0.div_ceil(step);
        for row in 0..rows {
            for col in 0..cols {
                for &min_size in sizes.iter() {
                    let n = density(min_size).max(1);
                    let (s_kx, s_ky) = (min_size as f32 / width, min_size as f32 / height);
                    for dy in 0..n {
                        for dx in 0..n {
                            let offset = |d: usize| if n == 1 { 0.5 } else { d as f32 / n as f32 };
                            let cx = (col as f32 + offset(dx)) * step as f32 / width;
                            let cy = (row as f32 + offset(dy)) * step as f32 / height;
                            priors.push([cx, cy, s_kx, s_ky]);
                        }
                    }
                }
            }
        }
    }
    priors
}

/// Decodes `(dx, dy, dw, dh)` regression against a prior into normalized corners.
pub(crate) fn decode_box(prior: &Prior, loc: &[f32]) -> [f32; 4] {
    let cx = prior[0] + loc[0] * VARIANCE[0] * prior[2];
    let cy = prior[1] + loc[1] * VARIANCE[0] * prior[3];
    let w = prior[2] * (loc[2] * VARIANCE[1]).exp();
    let h = prior[3] * (loc[3] * VARIANCE[1]).exp();
    [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0]
}

/// Fetches a `[1, N, K]` output as `[N, K]`.
pub(crate) fn rows<'a>(outputs: &'a Outputs, name: &str) -> Result<ArrayView2<'a, f32>> {
    Ok(output_view::<Ix3>(outputs, name)?.index_axis_move(Axis(0), 0))
}

/// Name of the output whose last dimension is `width`.
pub(crate) fn output_with_last_dim(outputs: &[LayerInfo], width: i64, model: &str) -> Result<String> {
    outputs
        .iter()
        .find(|l| l.shape.last() == Some(&width))
        .map(|l| l.name.clone())
        .ok_or_else(|| {
            ModelError::ModelLoad(format!("{}: no output with last dimension {}", model, width))
        })
}

/// Scores and boxes over a fixed prior set, keeping face scores above `threshold`.
pub(crate) fn score_priors(
    priors: &[Prior],
    boxes: ArrayView2<f32>,
    scores: ArrayView2<f32>,
    threshold: f32,
) -> Result<Vec<(usize, Detection)>> {
    if boxes.nrows() != priors.len() || scores.nrows() != priors.len() {
        return Err(ModelError::Inference(format!(
            "{} priors but {} boxes and {} scores",
            priors.len(),
            boxes.nrows(),
            scores.nrows()
        )));
    }
    let mut detections = Vec::new();
    for (i, prior) in priors.iter().enumerate() {
        let score = scores[[i, 1]];
        if score <= threshold {
            continue;
        }
        let loc = boxes.row(i).to_vec();
        let [xmin, ymin, xmax, ymax] = decode_box(prior, &loc);
        detections.push((i, Detection::new(xmin, ymin, xmax, ymax, score, 0)));
    }
    Ok(detections)
}

/// FaceBoxes: a CPU-real-time face detector with densified small anchors.
pub struct FaceBoxes {
    detection: DetectionModel,
    priors: Vec<Prior>,
    boxes: String,
    scores: String,
}

impl FaceBoxes {
    pub fn new(adapter: Arc<dyn InferenceAdapter>, params: &ModelParams) -> Result<Self> {
        expect_output_count(adapter.as_ref(), 2, "FaceBoxes")?;
        let boxes = output_with_last_dim(adapter.outputs(), 4, "FaceBoxes")?;
        let scores = output_with_last_dim(adapter.outputs(), 2, "FaceBoxes")?;

        let detection = DetectionModel::new(adapter, params, ResizeType::Standard, 0.5, 0.3)?;
        let priors = prior_boxes(detection.base.input_size(), &MIN_SIZES, &STEPS, |min_size| {
            match min_size {
                32 => 4,
                64 => 2,
                _ => 1,
            }
        });
        Ok(Self {
            detection,
            priors,
            boxes,
            scores,
        })
    }
}

impl Model for FaceBoxes {
    type Input = Array3<f32>;
    type Meta = ImageMeta;
    type Output = Vec<Detection>;

    fn architecture(&self) -> &'static str {
        "FaceBoxes"
    }

    fn adapter(&self) -> &dyn InferenceAdapter {
        self.detection.base.adapter()
    }

    fn preprocess(&self, image: &Array3<f32>) -> Result<(Inputs, ImageMeta)> {
        self.detection.base.preprocess(image)
    }

    fn postprocess(&self, outputs: &Outputs, meta: &ImageMeta) -> Result<Vec<Detection>> {
        let boxes = rows(outputs, &self.boxes)?;
        let scores = rows(outputs, &self.scores)?;
        let candidates: Vec<Detection> = score_priors(
            &self.priors,
            boxes,
            scores,
            self.detection.confidence_threshold,
        )?
        .into_iter()
        .map(|(_, d)| d)
        .collect();

        let keep = nms(&candidates, self.detection.iou_threshold, false, Some(KEEP_TOP_K));
        let detections = keep.into_iter().map(|i| candidates[i].clone()).collect();
        Ok(self.detection.finalize_normalized(detections, meta))
    }
}

/// Scores as an `[N, 2]` array, used by tests building prior-aligned outputs.
#[cfg(test)]
pub(crate) fn background_scores(n: usize) -> ndarray::Array2<f32> {
    let mut scores = ndarray::Array2::zeros((n, 2));
    scores.column_mut(0).fill(1.0);
    scores
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::RecordedAdapter;

    #[test]
    fn priors_are_densified_for_small_faces() {
        let priors = prior_boxes((128, 128), &MIN_SIZES, &STEPS, |s| match s {
            32 => 4,
            64 => 2,
            _ => 1,
        });
        // 4x4 cells * (16 + 4 + 1) + 2x2 cells * 1 + 1 cell * 1.
        assert_eq!(priors.len(), 16 * 21 + 4 + 1);
        assert_eq!(priors[0], [0.0, 0.0, 0.25, 0.25]);
        assert_eq!(*priors.last().unwrap(), [0.5, 0.5, 4.0, 4.0]);
    }

    #[test]
    fn decodes_faces_at_their_priors() {
        let adapter_outputs = |n: usize, face: usize| {
            let boxes = ndarray::Array2::<f32>::zeros((n, 4)).insert_axis(Axis(0)).into_dyn();
            let mut scores = background_scores(n);
            scores[[face, 0]] = 0.1;
            scores[[face, 1]] = 0.9;
            (boxes, scores.insert_axis(Axis(0)).into_dyn())
        };
        let n = 16 * 21 + 4 + 1;
        let (boxes, scores) = adapter_outputs(n, n - 1);
        let adapter = Arc::new(
            RecordedAdapter::new(vec![LayerInfo::new("data", vec![1, 3, 128, 128])])
                .with_output("boxes", boxes)
                .with_output("scores", scores),
        );
        let model = FaceBoxes::new(adapter, &ModelParams::default()).unwrap();

        let detections = model.infer_sync(&Array3::zeros((128, 128, 3))).unwrap();
        assert_eq!(detections.len(), 1);
        assert!((detections[0].score - 0.9).abs() < 1e-6);
        // The 512 prior covers the whole image after clipping.
        assert_eq!(detections[0].xmin, 0.0);
        assert_eq!(detections[0].xmax, 128.0);
    }
}

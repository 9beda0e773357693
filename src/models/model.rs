//! The wrapper abstraction every collaborator module builds on.

use crate::adapters::{InferenceAdapter, Inputs, Outputs};
use crate::models::image_model::image_input_channels;
use crate::models::utils::{
    DepthMap, Detection, DetectionWithLandmarks, Placement, Pose, ResizeType, SaliencyMap,
};
use crate::utils::error::ModelError;
use crate::Result;
use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// A network plus the code that feeds it and decodes what it returns.
pub trait Model: Send + Sync {
    type Input;
    type Meta;
    type Output;

    /// Published name of the wrapper, e.g. `"SSD"`.
    fn architecture(&self) -> &'static str;

    fn adapter(&self) -> &dyn InferenceAdapter;

    fn preprocess(&self, input: &Self::Input) -> Result<(Inputs, Self::Meta)>;

    fn postprocess(&self, outputs: &Outputs, meta: &Self::Meta) -> Result<Self::Output>;

    /// Preprocess, infer and postprocess in one blocking call.
    fn infer_sync(&self, input: &Self::Input) -> Result<Self::Output> {
        let (inputs, meta) = self.preprocess(input)?;
        let outputs = Model::adapter(self).infer(inputs)?;
        self.postprocess(&outputs, &meta)
    }
}

/// Constructs a wrapper around an adapter, used by the registry to build models by name.
pub trait FromAdapter: Sized {
    fn from_adapter(adapter: Arc<dyn InferenceAdapter>, params: &ModelParams) -> Result<Self>;
}

/// Geometry recorded while fitting an image to the model input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageMeta {
    /// `(width, height)` of the image handed to `preprocess`.
    pub original_size: (usize, usize),
    /// `(width, height)` of the model input.
    pub input_size: (usize, usize),
    pub placement: Placement,
}

impl ImageMeta {
    /// Maps a point in model-input pixels back to original-image pixels.
    pub fn to_original(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.placement.offset_x) / self.placement.scale_x,
            (y - self.placement.offset_y) / self.placement.scale_y,
        )
    }

    /// Maps a point given as a fraction of the model input back to original-image pixels.
    pub fn normalized_to_original(&self, x: f32, y: f32) -> (f32, f32) {
        self.to_original(x * self.input_size.0 as f32, y * self.input_size.1 as f32)
    }

    /// Maps a box in model-input pixels back to original-image pixels.
    pub fn detection_to_original(&self, detection: &Detection) -> Detection {
        let (xmin, ymin) = self.to_original(detection.xmin, detection.ymin);
        let (xmax, ymax) = self.to_original(detection.xmax, detection.ymax);
        Detection {
            xmin,
            ymin,
            xmax,
            ymax,
            ..detection.clone()
        }
    }
}

/// Any wrapper result, for callers that pick models by name at runtime.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ModelOutput {
    Detections(Vec<Detection>),
    DetectionsWithLandmarks(Vec<DetectionWithLandmarks>),
    ClassMap(Array2<usize>),
    SaliencyMap(Array2<f32>),
    DepthMap(Array2<f32>),
    Image(Array3<f32>),
    Poses(Vec<Pose>),
}

impl ModelOutput {
    pub fn kind(&self) -> &'static str {
        match self {
            ModelOutput::Detections(_) => "detections",
            ModelOutput::DetectionsWithLandmarks(_) => "detections_with_landmarks",
            ModelOutput::ClassMap(_) => "class_map",
            ModelOutput::SaliencyMap(_) => "saliency_map",
            ModelOutput::DepthMap(_) => "depth_map",
            ModelOutput::Image(_) => "image",
            ModelOutput::Poses(_) => "poses",
        }
    }

    /// Drops low-confidence items from list-like outputs; dense outputs are returned unchanged.
    pub fn filter_confidence(self, min_confidence: f32) -> Self {
        match self {
            ModelOutput::Detections(detections) => ModelOutput::Detections(
                detections.into_iter().filter(|d| d.score >= min_confidence).collect(),
            ),
            ModelOutput::DetectionsWithLandmarks(detections) => ModelOutput::DetectionsWithLandmarks(
                detections
                    .into_iter()
                    .filter(|d| d.detection.score >= min_confidence)
                    .collect(),
            ),
            ModelOutput::Poses(poses) => {
                ModelOutput::Poses(poses.into_iter().filter(|p| p.score >= min_confidence).collect())
            }
            other => other,
        }
    }
}

impl From<Vec<Detection>> for ModelOutput {
    fn from(detections: Vec<Detection>) -> Self {
        ModelOutput::Detections(detections)
    }
}

impl From<Vec<DetectionWithLandmarks>> for ModelOutput {
    fn from(detections: Vec<DetectionWithLandmarks>) -> Self {
        ModelOutput::DetectionsWithLandmarks(detections)
    }
}

impl From<Vec<Pose>> for ModelOutput {
    fn from(poses: Vec<Pose>) -> Self {
        ModelOutput::Poses(poses)
    }
}

impl From<Array2<usize>> for ModelOutput {
    fn from(classes: Array2<usize>) -> Self {
        ModelOutput::ClassMap(classes)
    }
}

impl From<SaliencyMap> for ModelOutput {
    fn from(map: SaliencyMap) -> Self {
        ModelOutput::SaliencyMap(map.0)
    }
}

impl From<DepthMap> for ModelOutput {
    fn from(map: DepthMap) -> Self {
        ModelOutput::DepthMap(map.0)
    }
}

impl From<Array3<f32>> for ModelOutput {
    fn from(image: Array3<f32>) -> Self {
        ModelOutput::Image(image)
    }
}

/// Wrappers that take an HWC `f32` image and report geometry through [`ImageMeta`].
///
/// Images are RGB with values in `0..=255`, as produced by
/// [`ImageLoader`](crate::image::ImageLoader). Networks trained on BGR input set
/// `reverse_input_channels`; per-channel `mean_values` and `scale_values` follow the
/// order the network receives, i.e. after any reversal.
pub trait ImageModel: Model<Input = Array3<f32>, Meta = ImageMeta> {}

impl<M> ImageModel for M where M: Model<Input = Array3<f32>, Meta = ImageMeta> {}

/// Object-safe view of image wrappers.
pub trait AnyImageModel: Send + Sync {
    fn architecture(&self) -> &'static str;

    fn adapter(&self) -> &dyn InferenceAdapter;

    fn infer_image(&self, image: &Array3<f32>) -> Result<ModelOutput>;

    /// Channels the image input takes: 3 for RGB, 1 for grayscale.
    fn input_channels(&self) -> Result<usize> {
        image_input_channels(self.adapter())
    }
}

impl<M> AnyImageModel for M
where
    M: ImageModel,
    M::Output: Into<ModelOutput>,
{
    fn architecture(&self) -> &'static str {
        Model::architecture(self)
    }

    fn adapter(&self) -> &dyn InferenceAdapter {
        Model::adapter(self)
    }

    fn infer_image(&self, image: &Array3<f32>) -> Result<ModelOutput> {
        self.infer_sync(image).map(Into::into)
    }
}

/// Optional per-model overrides, usually read from a JSON file next to the model.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ModelParams {
    pub resize_type: Option<ResizeType>,
    /// `[width, height]`, required when the model input has dynamic spatial dims.
    pub input_size: Option<[usize; 2]>,
    pub confidence_threshold: Option<f32>,
    pub iou_threshold: Option<f32>,
    pub labels: Option<Vec<String>>,
    pub reverse_input_channels: bool,
    pub mean_values: Option<Vec<f32>>,
    pub scale_values: Option<Vec<f32>>,
    /// Flat `w, h` pairs.
    pub anchors: Option<Vec<f32>>,
    /// Anchor indices per output, flattened in groups of `anchors_per_output`.
    pub masks: Option<Vec<usize>>,
    pub num_classes: Option<usize>,
    pub top_k: Option<usize>,
    pub max_answer_token_num: Option<usize>,
}

impl ModelParams {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let params = serde_json::from_str(&content)?;
        tracing::debug!("Loaded model parameters from {}", path.display());
        Ok(params)
    }

    /// Reads `path` if it exists, otherwise returns defaults.
    pub fn load_optional(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn confidence_or(&self, default: f32) -> Result<f32> {
        probability("confidence_threshold", self.confidence_threshold.unwrap_or(default))
    }

    pub fn iou_or(&self, default: f32) -> Result<f32> {
        probability("iou_threshold", self.iou_threshold.unwrap_or(default))
    }

    /// Anchors as `(w, h)` pairs, falling back to `default`.
    pub fn anchor_pairs(&self, default: &[f32]) -> Result<Vec<(f32, f32)>> {
        let flat = self.anchors.as_deref().unwrap_or(default);
        if flat.len() % 2 != 0 {
            return Err(ModelError::Config(format!(
                "anchors must contain (w, h) pairs, got {} values",
                flat.len()
            )));
        }
        Ok(flat.chunks(2).map(|pair| (pair[0], pair[1])).collect())
    }
}

fn probability(name: &str, value: f32) -> Result<f32> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ModelError::Config(format!(
            "{} must be within [0, 1], got {}",
            name, value
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn params_read_from_json_sidecar() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"resize_type": "fit_to_window_letterbox", "confidence_threshold": 0.25,
                "labels": ["person", "car"], "anchors": [10, 13, 16, 30]}}"#
        )
        .unwrap();

        let params = ModelParams::load_optional(file.path()).unwrap();
        assert_eq!(params.resize_type, Some(ResizeType::FitToWindowLetterbox));
        assert_eq!(params.confidence_or(0.5).unwrap(), 0.25);
        assert_eq!(params.iou_or(0.4).unwrap(), 0.4);
        assert_eq!(
            params.anchor_pairs(&[]).unwrap(),
            vec![(10.0, 13.0), (16.0, 30.0)]
        );
    }

    #[test]
    fn missing_sidecar_means_defaults() {
        let params = ModelParams::load_optional(Path::new("/nonexistent/model.json")).unwrap();
        assert!(params.labels.is_none());
        assert!(!params.reverse_input_channels);
    }

    #[test]
    fn out_of_range_thresholds_are_rejected() {
        let params = ModelParams {
            confidence_threshold: Some(1.5),
            ..Default::default()
        };
        assert!(params.confidence_or(0.5).is_err());
    }

    #[test]
    fn meta_maps_letterboxed_points_back() {
        let meta = ImageMeta {
            original_size: (100, 50),
            input_size: (40, 40),
            placement: Placement {
                scale_x: 0.4,
                scale_y: 0.4,
                offset_x: 0.0,
                offset_y: 10.0,
                resized_size: (40, 20),
            },
        };
        assert_eq!(meta.to_original(20.0, 30.0), (50.0, 50.0));
        assert_eq!(meta.normalized_to_original(0.5, 0.25), (50.0, 0.0));
    }

    #[test]
    fn confidence_filter_only_touches_lists() {
        let output = ModelOutput::Detections(vec![
            Detection::new(0.0, 0.0, 1.0, 1.0, 0.9, 0),
            Detection::new(0.0, 0.0, 1.0, 1.0, 0.1, 0),
        ]);
        match output.filter_confidence(0.5) {
            ModelOutput::Detections(kept) => assert_eq!(kept.len(), 1),
            other => panic!("unexpected {}", other.kind()),
        }
        let depth = ModelOutput::DepthMap(Array2::zeros((2, 2)));
        assert_eq!(depth.filter_confidence(0.5).kind(), "depth_map");
    }
}

use crate::adapters::InferenceAdapter;
use crate::models::image_model::ImageModelBase;
use crate::models::model::{ImageMeta, ModelParams};
use crate::models::utils::{clip_detections, Detection, ResizeType};
use crate::Result;
use std::sync::Arc;

/// Base for box detectors: image input plus labels and thresholds.
pub struct DetectionModel {
    pub base: ImageModelBase,
    labels: Option<Vec<String>>,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
}

impl DetectionModel {
    pub fn new(
        adapter: Arc<dyn InferenceAdapter>,
        params: &ModelParams,
        default_resize: ResizeType,
        default_confidence: f32,
        default_iou: f32,
    ) -> Result<Self> {
        let base = ImageModelBase::new(adapter, params, default_resize)?;
        Ok(Self {
            base,
            labels: params.labels.clone(),
            confidence_threshold: params.confidence_or(default_confidence)?,
            iou_threshold: params.iou_or(default_iou)?,
        })
    }

    pub fn label(&self, id: usize) -> Option<String> {
        self.labels.as_ref().and_then(|labels| labels.get(id).cloned())
    }

    /// Maps boxes from model-input pixels to the original image, attaches labels and clips.
    pub fn finalize(&self, detections: Vec<Detection>, meta: &ImageMeta) -> Vec<Detection> {
        let mut detections: Vec<Detection> = detections
            .iter()
            .map(|detection| {
                let mut detection = meta.detection_to_original(detection);
                detection.label = self.label(detection.id);
                detection
            })
            .collect();
        clip_detections(&mut detections, meta.original_size);
        detections
    }

    /// As [`finalize`](Self::finalize) for boxes expressed as fractions of the model input.
    pub fn finalize_normalized(&self, detections: Vec<Detection>, meta: &ImageMeta) -> Vec<Detection> {
        let (width, height) = (meta.input_size.0 as f32, meta.input_size.1 as f32);
        let in_pixels = detections
            .into_iter()
            .map(|d| Detection {
                xmin: d.xmin * width,
                ymin: d.ymin * height,
                xmax: d.xmax * width,
                ymax: d.ymax * height,
                ..d
            })
            .collect();
        self.finalize(in_pixels, meta)
    }
}

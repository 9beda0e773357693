use crate::adapters::{InferenceAdapter, Inputs, Outputs};
use crate::models::detection_model::DetectionModel;
use crate::models::faceboxes::{output_with_last_dim, rows};
use crate::models::image_model::expect_output_count;
use crate::models::model::{ImageMeta, Model, ModelParams};
use crate::models::utils::{nms, Detection, ResizeType};
use crate::utils::error::ModelError;
use crate::Result;
use ndarray::Array3;
use std::sync::Arc;

/// Ultra-Light-Fast-Generic-Face-Detector: boxes already decoded to normalized corners,
/// with background/face scores per box.
pub struct UltraLightweightFaceDetection {
    detection: DetectionModel,
    boxes: String,
    scores: String,
}

impl UltraLightweightFaceDetection {
    pub fn new(adapter: Arc<dyn InferenceAdapter>, params: &ModelParams) -> Result<Self> {
        expect_output_count(adapter.as_ref(), 2, "UltraLightweightFaceDetection")?;
        let boxes = output_with_last_dim(adapter.outputs(), 4, "UltraLightweightFaceDetection")?;
        let scores = output_with_last_dim(adapter.outputs(), 2, "UltraLightweightFaceDetection")?;
        let detection = DetectionModel::new(adapter, params, ResizeType::Standard, 0.5, 0.5)?;
        Ok(Self {
            detection,
            boxes,
            scores,
        })
    }
}

impl Model for UltraLightweightFaceDetection {
    type Input = Array3<f32>;
    type Meta = ImageMeta;
    type Output = Vec<Detection>;

    fn architecture(&self) -> &'static str {
        "UltraLightweightFaceDetection"
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
        if boxes.nrows() != scores.nrows() {
            return Err(ModelError::Inference(format!(
                "UltraLightweightFaceDetection: {} boxes but {} scores",
                boxes.nrows(),
                scores.nrows()
            )));
        }

        let candidates: Vec<Detection> = boxes
            .rows()
            .into_iter()
            .zip(scores.rows())
            .filter(|(_, score)| score[1] > self.detection.confidence_threshold)
            .map(|(bbox, score)| Detection::new(bbox[0], bbox[1], bbox[2], bbox[3], score[1], 0))
            .collect();

        let keep = nms(&candidates, self.detection.iou_threshold, false, None);
        let detections = keep.into_iter().map(|i| candidates[i].clone()).collect();
        Ok(self.detection.finalize_normalized(detections, meta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{LayerInfo, RecordedAdapter};
    use ndarray::{Array, IxDyn};

    #[test]
    fn overlapping_faces_are_suppressed() {
        let boxes = Array::from_shape_vec(
            IxDyn(&[1, 3, 4]),
            vec![
                0.1, 0.1, 0.5, 0.5, //
                0.11, 0.1, 0.5, 0.5, //
                0.6, 0.6, 0.9, 0.9,
            ],
        )
        .unwrap();
        let scores = Array::from_shape_vec(
            IxDyn(&[1, 3, 2]),
            vec![0.1, 0.9, 0.2, 0.8, 0.7, 0.3],
        )
        .unwrap();
        let adapter = Arc::new(
            RecordedAdapter::new(vec![LayerInfo::new("input", vec![1, 3, 24, 32])])
                .with_output("boxes", boxes)
                .with_output("scores", scores),
        );
        let model = UltraLightweightFaceDetection::new(adapter, &ModelParams::default()).unwrap();

        let faces = model.infer_sync(&Array3::zeros((240, 320, 3))).unwrap();
        assert_eq!(faces.len(), 1);
        assert!((faces[0].score - 0.9).abs() < 1e-6);
        assert!((faces[0].xmin - 32.0).abs() < 1e-3);
        assert!((faces[0].ymax - 120.0).abs() < 1e-3);
    }
}

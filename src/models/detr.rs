use crate::adapters::{output_view, InferenceAdapter, Inputs, Outputs};
use crate::models::detection_model::DetectionModel;
use crate::models::image_model::expect_output_count;
use crate::models::model::{ImageMeta, Model, ModelParams};
use crate::models::utils::{argmax, softmax, Detection, ResizeType};
use crate::utils::error::ModelError;
use crate::Result;
use ndarray::{Array3, Axis, Ix3};
use std::sync::Arc;

/// DEtection TRansformer: a fixed set of box queries, each with class logits whose last
/// entry means "no object".
#[allow(clippy::upper_case_acronyms)]
pub struct DETR {
    detection: DetectionModel,
    boxes_name: String,
    logits_name: String,
}

impl DETR {
    pub fn new(adapter: Arc<dyn InferenceAdapter>, params: &ModelParams) -> Result<Self> {
        expect_output_count(adapter.as_ref(), 2, "DETR")?;
        let outputs = adapter.outputs();
        let (boxes, logits) = if outputs[0].shape.last() == Some(&4) {
            (&outputs[0], &outputs[1])
        } else if outputs[1].shape.last() == Some(&4) {
            (&outputs[1], &outputs[0])
        } else {
            return Err(ModelError::ModelLoad(
                "DETR: neither output has boxes of shape [.., 4]".to_string(),
            ));
        };
        let (boxes_name, logits_name) = (boxes.name.clone(), logits.name.clone());

        let detection = DetectionModel::new(adapter, params, ResizeType::Standard, 0.5, 0.5)?;
        Ok(Self {
            detection,
            boxes_name,
            logits_name,
        })
    }
}

impl Model for DETR {
    type Input = Array3<f32>;
    type Meta = ImageMeta;
    type Output = Vec<Detection>;

    fn architecture(&self) -> &'static str {
        "DETR"
    }

    fn adapter(&self) -> &dyn InferenceAdapter {
        self.detection.base.adapter()
    }

    fn preprocess(&self, image: &Array3<f32>) -> Result<(Inputs, ImageMeta)> {
        self.detection.base.preprocess(image)
    }

    fn postprocess(&self, outputs: &Outputs, meta: &ImageMeta) -> Result<Vec<Detection>> {
        let boxes = output_view::<Ix3>(outputs, &self.boxes_name)?.index_axis_move(Axis(0), 0);
        let logits = output_view::<Ix3>(outputs, &self.logits_name)?.index_axis_move(Axis(0), 0);
        if boxes.nrows() != logits.nrows() || logits.ncols() < 2 {
            return Err(ModelError::Inference(format!(
                "DETR: boxes {:?} and logits {:?} disagree",
                boxes.shape(),
                logits.shape()
            )));
        }

        let mut detections = Vec::new();
        for (bbox, query_logits) in boxes.rows().into_iter().zip(logits.rows()) {
            let probs = softmax(&query_logits.to_vec());
            let Some((label, score)) = argmax(&probs[..probs.len() - 1]) else {
                continue;
            };
            if score < self.detection.confidence_threshold {
                continue;
            }
            let (cx, cy, w, h) = (bbox[0], bbox[1], bbox[2], bbox[3]);
            detections.push(Detection::new(
                cx - w / 2.0,
                cy - h / 2.0,
                cx + w / 2.0,
                cy + h / 2.0,
                score,
                label,
            ));
        }

        Ok(self.detection.finalize_normalized(detections, meta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{LayerInfo, RecordedAdapter};
    use ndarray::{Array, IxDyn};

    #[test]
    fn decodes_queries_and_drops_no_object() {
        let boxes = Array::from_shape_vec(
            IxDyn(&[1, 2, 4]),
            vec![0.5, 0.5, 0.2, 0.4, 0.1, 0.1, 0.1, 0.1],
        )
        .unwrap();
        // Query 0 is confidently class 1, query 1 is "no object".
        let logits = Array::from_shape_vec(
            IxDyn(&[1, 2, 3]),
            vec![0.0, 10.0, 0.0, 0.0, 0.0, 10.0],
        )
        .unwrap();
        let adapter = Arc::new(
            RecordedAdapter::new(vec![LayerInfo::new("input", vec![1, 3, 8, 8])])
                .with_output("pred_logits", logits)
                .with_output("pred_boxes", boxes),
        );
        let detr = DETR::new(adapter, &ModelParams::default()).unwrap();

        let detections = detr.infer_sync(&Array3::zeros((100, 100, 3))).unwrap();
        assert_eq!(detections.len(), 1);
        let d = &detections[0];
        assert_eq!(d.id, 1);
        assert!(d.score > 0.99);
        assert!((d.xmin - 40.0).abs() < 1e-3);
        assert!((d.ymax - 70.0).abs() < 1e-3);
    }
}

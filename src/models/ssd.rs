use crate::adapters::{output_view, InferenceAdapter, Inputs, Outputs};
use crate::models::detection_model::DetectionModel;
use crate::models::image_model::find_output_by_name;
use crate::models::model::{ImageMeta, Model, ModelParams};
use crate::models::utils::{Detection, ResizeType};
use crate::utils::error::ModelError;
use crate::Result;
use ndarray::{Array3, Ix1, Ix2, Ix4};
use std::sync::Arc;

enum OutputFormat {
    /// `[1, 1, N, 7]`: image_id, label, score, xmin, ymin, xmax, ymax (normalized).
    DetectionOutput { name: String },
    /// `boxes [N, 5]` in input pixels with the score last, and `labels [N]`.
    BoxesLabels { boxes: String, labels: String },
}

/// Single Shot MultiBox Detector and other models with an SSD-style detection output.
#[allow(clippy::upper_case_acronyms)]
pub struct SSD {
    detection: DetectionModel,
    format: OutputFormat,
}

impl SSD {
    pub fn new(adapter: Arc<dyn InferenceAdapter>, params: &ModelParams) -> Result<Self> {
        let format = Self::detect_format(adapter.as_ref())?;
        let detection = DetectionModel::new(adapter, params, ResizeType::Standard, 0.5, 0.5)?;
        Ok(Self { detection, format })
    }

    fn detect_format(adapter: &dyn InferenceAdapter) -> Result<OutputFormat> {
        let outputs = adapter.outputs();
        if let Some(layer) = outputs
            .iter()
            .find(|l| l.shape.len() == 4 && l.shape.last() == Some(&7))
        {
            return Ok(OutputFormat::DetectionOutput {
                name: layer.name.clone(),
            });
        }

        match (
            find_output_by_name(outputs, "boxes"),
            find_output_by_name(outputs, "labels"),
        ) {
            (Some(boxes), Some(labels)) => Ok(OutputFormat::BoxesLabels {
                boxes: boxes.name.clone(),
                labels: labels.name.clone(),
            }),
            _ => Err(ModelError::ModelLoad(format!(
                "SSD: unsupported outputs {:?}",
                outputs.iter().map(|l| (&l.name, &l.shape)).collect::<Vec<_>>()
            ))),
        }
    }

    fn parse_detection_output(&self, outputs: &Outputs, name: &str) -> Result<Vec<Detection>> {
        let output = output_view::<Ix4>(outputs, name)?;
        let mut detections = Vec::new();
        let rows = output
            .index_axis_move(ndarray::Axis(0), 0)
            .index_axis_move(ndarray::Axis(0), 0);
        for row in rows.rows() {
            if row[0] < 0.0 {
                break;
            }
            let score = row[2];
            if score < self.detection.confidence_threshold {
                continue;
            }
            detections.push(Detection::new(row[3], row[4], row[5], row[6], score, row[1] as usize));
        }
        Ok(detections)
    }

    fn parse_boxes_labels(
        &self,
        outputs: &Outputs,
        boxes: &str,
        labels: &str,
        meta: &ImageMeta,
    ) -> Result<Vec<Detection>> {
        let boxes = squeeze_batch(outputs, boxes)?;
        let labels = output_view::<Ix1>(outputs, labels)
            .map(|l| l.to_owned())
            .or_else(|_| output_view::<Ix2>(outputs, labels).map(|l| l.row(0).to_owned()))?;

        if boxes.ncols() < 5 || boxes.nrows() != labels.len() {
            return Err(ModelError::Inference(format!(
                "SSD: boxes {:?} do not match labels {:?}",
                boxes.shape(),
                labels.shape()
            )));
        }

        let (width, height) = (meta.input_size.0 as f32, meta.input_size.1 as f32);
        Ok(boxes
            .rows()
            .into_iter()
            .zip(labels.iter())
            .filter(|(row, _)| row[4] >= self.detection.confidence_threshold)
            .map(|(row, &label)| {
                Detection::new(
                    row[0] / width,
                    row[1] / height,
                    row[2] / width,
                    row[3] / height,
                    row[4],
                    label as usize,
                )
            })
            .collect())
    }
}

fn squeeze_batch(outputs: &Outputs, name: &str) -> Result<ndarray::Array2<f32>> {
    if let Ok(view) = output_view::<Ix2>(outputs, name) {
        return Ok(view.to_owned());
    }
    let view = output_view::<ndarray::Ix3>(outputs, name)?;
    Ok(view.index_axis_move(ndarray::Axis(0), 0).to_owned())
}

impl Model for SSD {
    type Input = Array3<f32>;
    type Meta = ImageMeta;
    type Output = Vec<Detection>;

    fn architecture(&self) -> &'static str {
        "SSD"
    }

    fn adapter(&self) -> &dyn InferenceAdapter {
        self.detection.base.adapter()
    }

    fn preprocess(&self, image: &Array3<f32>) -> Result<(Inputs, ImageMeta)> {
        self.detection.base.preprocess(image)
    }

    fn postprocess(&self, outputs: &Outputs, meta: &ImageMeta) -> Result<Vec<Detection>> {
        let detections = match &self.format {
            OutputFormat::DetectionOutput { name } => self.parse_detection_output(outputs, name)?,
            OutputFormat::BoxesLabels { boxes, labels } => {
                self.parse_boxes_labels(outputs, boxes, labels, meta)?
            }
        };
        Ok(self.detection.finalize_normalized(detections, meta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{LayerInfo, RecordedAdapter};
    use ndarray::{Array, ArrayD, IxDyn};

    fn detection_output(rows: &[[f32; 7]]) -> ArrayD<f32> {
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        Array::from_shape_vec(IxDyn(&[1, 1, rows.len(), 7]), flat).unwrap()
    }

    #[test]
    fn decodes_detection_output_until_terminator() {
        let output = detection_output(&[
            [0.0, 1.0, 0.9, 0.1, 0.2, 0.5, 0.6],
            [0.0, 2.0, 0.3, 0.1, 0.1, 0.2, 0.2],
            [-1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            [0.0, 3.0, 0.99, 0.0, 0.0, 1.0, 1.0],
        ]);
        let adapter = Arc::new(
            RecordedAdapter::new(vec![LayerInfo::new("data", vec![1, 3, 10, 10])])
                .with_output("detection_out", output),
        );
        let ssd = SSD::new(adapter, &ModelParams::default()).unwrap();

        let detections = ssd.infer_sync(&Array3::zeros((100, 200, 3))).unwrap();
        assert_eq!(detections.len(), 1);
        let d = &detections[0];
        assert_eq!(d.id, 1);
        assert!((d.xmin - 20.0).abs() < 1e-3);
        assert!((d.ymin - 20.0).abs() < 1e-3);
        assert!((d.xmax - 100.0).abs() < 1e-3);
        assert!((d.ymax - 60.0).abs() < 1e-3);
    }

    #[test]
    fn decodes_boxes_and_labels_pair() {
        let boxes = Array::from_shape_vec(
            IxDyn(&[2, 5]),
            vec![1.0, 2.0, 5.0, 6.0, 0.8, 0.0, 0.0, 1.0, 1.0, 0.1],
        )
        .unwrap();
        let labels = Array::from_shape_vec(IxDyn(&[2]), vec![4.0, 7.0]).unwrap();
        let adapter = Arc::new(
            RecordedAdapter::new(vec![LayerInfo::new("image", vec![1, 3, 10, 10])])
                .with_output("boxes", boxes)
                .with_output("labels", labels),
        );
        let ssd = SSD::new(adapter, &ModelParams::default()).unwrap();

        let detections = ssd.infer_sync(&Array3::zeros((10, 10, 3))).unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].id, 4);
        assert!((detections[0].xmax - 5.0).abs() < 1e-4);
    }

    #[test]
    fn rejects_unknown_outputs() {
        let adapter = Arc::new(
            RecordedAdapter::new(vec![LayerInfo::new("image", vec![1, 3, 10, 10])])
                .with_output("logits", ArrayD::zeros(IxDyn(&[1, 10]))),
        );
        assert!(SSD::new(adapter, &ModelParams::default()).is_err());
    }
}

use crate::adapters::{output_view, InferenceAdapter, Inputs, LayerInfo, Outputs};
use crate::models::detection_model::DetectionModel;
use crate::models::image_model::{expect_output_count, find_output_by_name};
use crate::models::model::{ImageMeta, Model, ModelParams};
use crate::models::utils::{sigmoid, Detection, ResizeType};
use crate::utils::error::ModelError;
use crate::Result;
use ndarray::{Array3, ArrayView3, Axis, Ix4};
use std::sync::Arc;

// Reference normalisation, in the RGB order images are handed to wrappers.
const MEAN: [f32; 3] = [119.85, 113.99, 104.01];
const SCALE: [f32; 3] = [70.91, 69.89, 73.60];
const DEFAULT_TOP_K: usize = 100;

/// Objects as points: a per-class centre heatmap plus size and sub-pixel offset maps.
pub struct CenterNet {
    detection: DetectionModel,
    heatmap: String,
    size: String,
    offset: String,
    top_k: usize,
}

impl CenterNet {
    pub fn new(adapter: Arc<dyn InferenceAdapter>, params: &ModelParams) -> Result<Self> {
        expect_output_count(adapter.as_ref(), 3, "CenterNet")?;
        let (heatmap, size, offset) = Self::identify_outputs(adapter.outputs())?;

        let mut params = params.clone();
        params.mean_values.get_or_insert_with(|| MEAN.to_vec());
        params.scale_values.get_or_insert_with(|| SCALE.to_vec());

        let detection = DetectionModel::new(adapter, &params, ResizeType::FitToWindowLetterbox, 0.3, 0.5)?;
        Ok(Self {
            detection,
            heatmap,
            size,
            offset,
            top_k: params.top_k.unwrap_or(DEFAULT_TOP_K),
        })
    }

    /// `wh` and `reg` are found by name; the one remaining output is the heatmap,
    /// whatever its class count or position.
    fn identify_outputs(outputs: &[LayerInfo]) -> Result<(String, String, String)> {
        let two_channel = |l: &LayerInfo| l.shape.len() == 4 && l.shape[1] == 2;
        let (size, offset) = match (find_output_by_name(outputs, "wh"), find_output_by_name(outputs, "reg")) {
            (Some(size), Some(offset)) if size.name != offset.name && two_channel(size) && two_channel(offset) => {
                (size, offset)
            }
            _ => {
                return Err(ModelError::ModelLoad(format!(
                    "CenterNet: expected 'wh' and 'reg' outputs with 2 channels, got {:?}",
                    outputs.iter().map(|l| (&l.name, &l.shape)).collect::<Vec<_>>()
                )))
            }
        };
        let heatmap = outputs
            .iter()
            .find(|l| l.name != size.name && l.name != offset.name && l.shape.len() == 4)
            .ok_or_else(|| ModelError::ModelLoad("CenterNet: no heatmap output".to_string()))?;
        Ok((heatmap.name.clone(), size.name.clone(), offset.name.clone()))
    }

    /// Sigmoid scores that survive a 3x3 max-pool, i.e. local maxima, as `(score, class, row, col)`.
    fn peaks(heatmap: ArrayView3<f32>, threshold: f32) -> Vec<(f32, usize, usize, usize)> {
        let (classes, height, width) = heatmap.dim();
        let mut peaks = Vec::new();
        for class in 0..classes {
            let plane = heatmap.index_axis(Axis(0), class);
            for row in 0..height {
                for col in 0..width {
                    let value = plane[[row, col]];
                    if sigmoid(value) < threshold {
                        continue;
                    }
                    let is_max = (row.saturating_sub(1)..(row + 2).min(height))
                        .flat_map(|r| (col.saturating_sub(1)..(col + 2).min(width)).map(move |c| (r, c)))
                        .all(|(r, c)| plane[[r, c]] <= value);
                    if is_max {
                        peaks.push((sigmoid(value), class, row, col));
                    }
                }
            }
        }
        peaks
    }
}

impl Model for CenterNet {
    type Input = Array3<f32>;
    type Meta = ImageMeta;
    type Output = Vec<Detection>;

    fn architecture(&self) -> &'static str {
        "CenterNet"
    }

    fn adapter(&self) -> &dyn InferenceAdapter {
        self.detection.base.adapter()
    }

    fn preprocess(&self, image: &Array3<f32>) -> Result<(Inputs, ImageMeta)> {
        self.detection.base.preprocess(image)
    }

    fn postprocess(&self, outputs: &Outputs, meta: &ImageMeta) -> Result<Vec<Detection>> {
        let heatmap = output_view::<Ix4>(outputs, &self.heatmap)?.index_axis_move(Axis(0), 0);
        let size = output_view::<Ix4>(outputs, &self.size)?.index_axis_move(Axis(0), 0);
        let offset = output_view::<Ix4>(outputs, &self.offset)?.index_axis_move(Axis(0), 0);
        let (_, height, width) = heatmap.dim();
        if size.dim() != (2, height, width) || offset.dim() != (2, height, width) {
            return Err(ModelError::Inference(format!(
                "CenterNet: heatmap {:?} does not match size {:?} / offset {:?}",
                heatmap.shape(),
                size.shape(),
                offset.shape()
            )));
        }

        let mut peaks = Self::peaks(heatmap, self.detection.confidence_threshold);
        peaks.sort_by(|a, b| b.0.total_cmp(&a.0));
        peaks.truncate(self.top_k);

        let stride_x = meta.input_size.0 as f32 / width as f32;
        let stride_y = meta.input_size.1 as f32 / height as f32;
        let detections = peaks
            .into_iter()
            .map(|(score, class, row, col)| {
                let cx = col as f32 + offset[[0, row, col]];
                let cy = row as f32 + offset[[1, row, col]];
                let (w, h) = (size[[0, row, col]], size[[1, row, col]]);
                Detection::new(
                    (cx - w / 2.0) * stride_x,
                    (cy - h / 2.0) * stride_y,
                    (cx + w / 2.0) * stride_x,
                    (cy + h / 2.0) * stride_y,
                    score,
                    class,
                )
            })
            .collect();

        Ok(self.detection.finalize(detections, meta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::RecordedAdapter;
    use ndarray::{ArrayD, IxDyn};

    fn centernet(heatmap: ArrayD<f32>, wh: ArrayD<f32>, reg: ArrayD<f32>) -> CenterNet {
        let adapter = Arc::new(
            RecordedAdapter::new(vec![LayerInfo::new("input.1", vec![1, 3, 16, 16])])
                .with_output("hm", heatmap)
                .with_output("wh", wh)
                .with_output("reg", reg),
        );
        CenterNet::new(adapter, &ModelParams::default()).unwrap()
    }

    #[test]
    fn keeps_only_local_maxima() {
        // 4x4 output over a 16x16 input: stride 4.
        let mut heatmap = ArrayD::from_elem(IxDyn(&[1, 2, 4, 4]), -10.0);
        heatmap[[0, 1, 1, 2]] = 3.0;
        heatmap[[0, 1, 1, 1]] = 2.0;
        let mut wh = ArrayD::zeros(IxDyn(&[1, 2, 4, 4]));
        wh[[0, 0, 1, 2]] = 2.0;
        wh[[0, 1, 1, 2]] = 1.0;
        let mut reg = ArrayD::zeros(IxDyn(&[1, 2, 4, 4]));
        reg[[0, 0, 1, 2]] = 0.5;
        reg[[0, 1, 1, 2]] = 0.5;

        let model = centernet(heatmap, wh, reg);
        let detections = model.infer_sync(&Array3::zeros((16, 16, 3))).unwrap();

        assert_eq!(detections.len(), 1);
        let d = &detections[0];
        assert_eq!(d.id, 1);
        assert!((d.score - sigmoid(3.0)).abs() < 1e-5);
        // Centre (2.5, 1.5) in output cells, 2x1 cells, times stride 4.
        assert!((d.xmin - 6.0).abs() < 1e-4);
        assert!((d.xmax - 14.0).abs() < 1e-4);
        assert!((d.ymin - 4.0).abs() < 1e-4);
        assert!((d.ymax - 8.0).abs() < 1e-4);
    }

    #[test]
    fn size_and_offset_outputs_are_required() {
        let adapter = Arc::new(
            RecordedAdapter::new(vec![LayerInfo::new("input.1", vec![1, 3, 16, 16])])
                .with_output("a", ArrayD::zeros(IxDyn(&[1, 80, 4, 4])))
                .with_output("b", ArrayD::zeros(IxDyn(&[1, 2, 4, 4])))
                .with_output("c", ArrayD::zeros(IxDyn(&[1, 2, 4, 4]))),
        );
        assert!(CenterNet::new(adapter, &ModelParams::default()).is_err());
    }

    #[test]
    fn heatmap_is_whatever_is_left_after_size_and_offset() {
        let adapter = Arc::new(
            RecordedAdapter::new(vec![LayerInfo::new("input.1", vec![1, 3, 16, 16])])
                .with_output("wh", ArrayD::zeros(IxDyn(&[1, 2, 4, 4])))
                .with_output("reg", ArrayD::zeros(IxDyn(&[1, 2, 4, 4])))
                .with_output("hm", ArrayD::zeros(IxDyn(&[1, 80, 4, 4]))),
        );
        let model = CenterNet::new(adapter, &ModelParams::default()).unwrap();
        assert_eq!(
            (model.heatmap.as_str(), model.size.as_str(), model.offset.as_str()),
            ("hm", "wh", "reg")
        );
    }

    #[test]
    fn reference_mean_colour_normalises_to_zero() {
        use crate::image::ImageLoader;
        use image::{DynamicImage, Rgb, RgbImage};

        let adapter = Arc::new(
            RecordedAdapter::new(vec![LayerInfo::new("input.1", vec![1, 3, 16, 16])])
                .with_output("hm", ArrayD::zeros(IxDyn(&[1, 2, 4, 4])))
                .with_output("wh", ArrayD::zeros(IxDyn(&[1, 2, 4, 4])))
                .with_output("reg", ArrayD::zeros(IxDyn(&[1, 2, 4, 4]))),
        );
        let model = CenterNet::new(adapter, &ModelParams::default()).unwrap();

        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(16, 16, Rgb([120, 114, 104])));
        let array = ImageLoader::preprocess(image).unwrap();
        let (inputs, _) = model.preprocess(&array).unwrap();
        let tensor = match &inputs["input.1"] {
            crate::adapters::InputTensor::F32(tensor) => tensor.clone(),
            crate::adapters::InputTensor::I64(_) => panic!("image input must be f32"),
        };
        for c in 0..3 {
            let value = tensor[[0, c, 8, 8]];
            assert!(value.abs() < 0.01, "channel {} normalised to {}", c, value);
        }
    }
}

use crate::adapters::{take_output, InferenceAdapter, Inputs, Outputs};
use crate::models::image_model::{backproject_bilinear, backproject_nearest, expect_output_count, ImageModelBase};
use crate::models::model::{ImageMeta, Model, ModelParams};
use crate::models::utils::{argmax, sigmoid, ResizeType, SaliencyMap};
use crate::utils::error::ModelError;
use crate::Result;
use ndarray::{Array2, Array3, ArrayView2, ArrayViewD, Axis, Ix2, Ix3};
use std::sync::Arc;

/// Squeezes leading unit dimensions until `rank` remain.
pub(crate) fn squeeze_to<'a>(
    mut view: ArrayViewD<'a, f32>,
    rank: usize,
    model: &str,
) -> Result<ArrayViewD<'a, f32>> {
    while view.ndim() > rank && view.shape()[0] == 1 {
        view = view.index_axis_move(Axis(0), 0);
    }
    if view.ndim() != rank || view.is_empty() {
        return Err(ModelError::Inference(format!(
            "{}: cannot read output of shape {:?} as {} dimensions",
            model,
            view.shape(),
            rank
        )));
    }
    Ok(view)
}

/// A single `[H, W]` map from outputs shaped `[H, W]`, `[1, H, W]` or `[1, 1, H, W]`.
pub(crate) fn single_map<'a>(outputs: &'a Outputs, name: &str, model: &str) -> Result<ArrayView2<'a, f32>> {
    let view = squeeze_to(take_output(outputs, name)?.view(), 2, model)?;
    view.into_dimensionality::<Ix2>()
        .map_err(|e| ModelError::Inference(format!("{}: {}", model, e)))
}

/// Semantic segmentation: per-class scores reduced to a class map, or a precomputed class map.
pub struct SegmentationModel {
    base: ImageModelBase,
    output_name: String,
    labels: Option<Vec<String>>,
}

impl SegmentationModel {
    pub fn new(adapter: Arc<dyn InferenceAdapter>, params: &ModelParams) -> Result<Self> {
        expect_output_count(adapter.as_ref(), 1, "SegmentationModel")?;
        let output_name = adapter.outputs()[0].name.clone();
        let base = ImageModelBase::new(adapter, params, ResizeType::Standard)?;
        Ok(Self {
            base,
            output_name,
            labels: params.labels.clone(),
        })
    }

    pub fn label(&self, class: usize) -> Option<&str> {
        self.labels.as_ref()?.get(class).map(String::as_str)
    }

    fn class_map(&self, outputs: &Outputs) -> Result<Array2<usize>> {
        let output = take_output(outputs, &self.output_name)?.view();
        let scores = squeeze_to(output, 3, "SegmentationModel")
            .and_then(|v| v.into_dimensionality::<Ix3>().map_err(|e| ModelError::Inference(e.to_string())));

        match scores {
            Ok(scores) if scores.len_of(Axis(0)) > 1 => {
                let (_, height, width) = scores.dim();
                Ok(Array2::from_shape_fn((height, width), |(y, x)| {
                    let column: Vec<f32> = scores.slice(ndarray::s![.., y, x]).to_vec();
                    argmax(&column).map_or(0, |(class, _)| class)
                }))
            }
            _ => {
                let map = single_map(outputs, &self.output_name, "SegmentationModel")?;
                Ok(map.mapv(|v| v.max(0.0).round() as usize))
            }
        }
    }
}

impl Model for SegmentationModel {
    type Input = Array3<f32>;
    type Meta = ImageMeta;
    type Output = Array2<usize>;

    fn architecture(&self) -> &'static str {
        "SegmentationModel"
    }

    fn adapter(&self) -> &dyn InferenceAdapter {
        self.base.adapter()
    }

    fn preprocess(&self, image: &Array3<f32>) -> Result<(Inputs, ImageMeta)> {
        self.base.preprocess(image)
    }

    fn postprocess(&self, outputs: &Outputs, meta: &ImageMeta) -> Result<Array2<usize>> {
        let classes = self.class_map(outputs)?;
        Ok(backproject_nearest(classes.view(), meta))
    }
}

/// Salient object detection: one logit map, returned as probabilities at image size.
pub struct SalientObjectDetectionModel {
    base: ImageModelBase,
    output_name: String,
}

impl SalientObjectDetectionModel {
    pub fn new(adapter: Arc<dyn InferenceAdapter>, params: &ModelParams) -> Result<Self> {
        let output_name = adapter
            .outputs()
            .first()
            .map(|l| l.name.clone())
            .ok_or_else(|| ModelError::ModelLoad("SalientObjectDetectionModel: no outputs".to_string()))?;
        let base = ImageModelBase::new(adapter, params, ResizeType::Standard)?;
        Ok(Self { base, output_name })
    }
}

impl Model for SalientObjectDetectionModel {
    type Input = Array3<f32>;
    type Meta = ImageMeta;
    type Output = SaliencyMap;

    fn architecture(&self) -> &'static str {
        "SalientObjectDetectionModel"
    }

    fn adapter(&self) -> &dyn InferenceAdapter {
        self.base.adapter()
    }

    fn preprocess(&self, image: &Array3<f32>) -> Result<(Inputs, ImageMeta)> {
        self.base.preprocess(image)
    }

    fn postprocess(&self, outputs: &Outputs, meta: &ImageMeta) -> Result<SaliencyMap> {
        let logits = single_map(outputs, &self.output_name, "SalientObjectDetectionModel")?;
        let probabilities = logits.mapv(sigmoid);
        Ok(SaliencyMap(backproject_bilinear(probabilities.view(), meta)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{LayerInfo, RecordedAdapter};
    use ndarray::{Array, IxDyn};

    fn input() -> Vec<LayerInfo> {
        vec![LayerInfo::new("image", vec![1, 3, 2, 2])]
    }

    #[test]
    fn class_scores_are_reduced_and_upsampled() {
        // Three classes over a 2x2 map: class 2 wins on the left, class 1 on the right.
        let mut scores = Array::zeros(IxDyn(&[1, 3, 2, 2]));
        for y in 0..2 {
            scores[[0, 2, y, 0]] = 5.0;
            scores[[0, 1, y, 1]] = 5.0;
        }
        let adapter = Arc::new(RecordedAdapter::new(input()).with_output("logits", scores));
        let model = SegmentationModel::new(adapter, &ModelParams::default()).unwrap();

        let classes = model.infer_sync(&Array3::zeros((4, 6, 3))).unwrap();
        assert_eq!(classes.dim(), (4, 6));
        assert!(classes.column(0).iter().all(|&c| c == 2));
        assert!(classes.column(5).iter().all(|&c| c == 1));
    }

    #[test]
    fn precomputed_class_maps_pass_through() {
        let map = Array::from_shape_vec(IxDyn(&[1, 2, 2]), vec![0.0, 1.0, 3.0, 3.0]).unwrap();
        let adapter = Arc::new(RecordedAdapter::new(input()).with_output("argmax", map));
        let model = SegmentationModel::new(adapter, &ModelParams::default()).unwrap();

        let classes = model.infer_sync(&Array3::zeros((2, 2, 3))).unwrap();
        assert_eq!(classes, ndarray::arr2(&[[0, 1], [3, 3]]));
    }

    #[test]
    fn saliency_is_a_probability_map() {
        let logits = Array::from_shape_vec(IxDyn(&[1, 1, 2, 2]), vec![-20.0, 20.0, 0.0, 0.0]).unwrap();
        let adapter = Arc::new(RecordedAdapter::new(input()).with_output("saliency", logits));
        let model = SalientObjectDetectionModel::new(adapter, &ModelParams::default()).unwrap();

        let SaliencyMap(map) = model.infer_sync(&Array3::zeros((2, 2, 3))).unwrap();
        assert_eq!(map.dim(), (2, 2));
        assert!(map[[0, 0]] < 1e-6);
        assert!(map[[0, 1]] > 1.0 - 1e-6);
        assert!((map[[1, 0]] - 0.5).abs() < 1e-6);
    }
}

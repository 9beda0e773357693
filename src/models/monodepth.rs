use crate::adapters::{InferenceAdapter, Inputs, Outputs};
use crate::models::image_model::{backproject_bilinear, expect_output_count, ImageModelBase};
use crate::models::model::{ImageMeta, Model, ModelParams};
use crate::models::segmentation::single_map;
use crate::models::utils::{DepthMap, ResizeType};
use crate::Result;
use ndarray::Array3;
use std::sync::Arc;

/// Monocular depth estimation (MiDaS and similar): one relative depth map per image.
pub struct MonoDepthModel {
    base: ImageModelBase,
    output_name: String,
}

impl MonoDepthModel {
    pub fn new(adapter: Arc<dyn InferenceAdapter>, params: &ModelParams) -> Result<Self> {
        expect_output_count(adapter.as_ref(), 1, "MonoDepthModel")?;
        let output_name = adapter.outputs()[0].name.clone();
        let base = ImageModelBase::new(adapter, params, ResizeType::Standard)?;
        Ok(Self { base, output_name })
    }
}

impl Model for MonoDepthModel {
    type Input = Array3<f32>;
    type Meta = ImageMeta;
    type Output = DepthMap;

    fn architecture(&self) -> &'static str {
        "MonoDepthModel"
    }

    fn adapter(&self) -> &dyn InferenceAdapter {
        self.base.adapter()
    }

    fn preprocess(&self, image: &Array3<f32>) -> Result<(Inputs, ImageMeta)> {
        self.base.preprocess(image)
    }

    fn postprocess(&self, outputs: &Outputs, meta: &ImageMeta) -> Result<DepthMap> {
        let depth = single_map(outputs, &self.output_name, "MonoDepthModel")?;
        Ok(DepthMap(backproject_bilinear(depth, meta)))
    }
}

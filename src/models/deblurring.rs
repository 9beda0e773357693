use crate::adapters::{output_view, InferenceAdapter, Inputs, Outputs};
use crate::models::image_model::{backproject_bilinear, expect_output_count, ImageModelBase};
use crate::models::model::{ImageMeta, Model, ModelParams};
use crate::models::utils::ResizeType;
use crate::utils::error::ModelError;
use crate::Result;
use ndarray::{Array3, Axis, Ix4};
use std::sync::Arc;

/// Image restoration: the network returns a sharpened image in `[0, 1]`, which is mapped
/// back to the original geometry and to `0..=255`.
pub struct Deblurring {
    base: ImageModelBase,
    output_name: String,
}

impl Deblurring {
    pub fn new(adapter: Arc<dyn InferenceAdapter>, params: &ModelParams) -> Result<Self> {
        expect_output_count(adapter.as_ref(), 1, "Deblurring")?;
        let output_name = adapter.outputs()[0].name.clone();
        let base = ImageModelBase::new(adapter, params, ResizeType::FitToWindow)?;
        Ok(Self { base, output_name })
    }
}

impl Model for Deblurring {
    type Input = Array3<f32>;
    type Meta = ImageMeta;
    type Output = Array3<f32>;

    fn architecture(&self) -> &'static str {
        "Deblurring"
    }

    fn adapter(&self) -> &dyn InferenceAdapter {
        self.base.adapter()
    }

    fn preprocess(&self, image: &Array3<f32>) -> Result<(Inputs, ImageMeta)> {
        self.base.preprocess(image)
    }

    fn postprocess(&self, outputs: &Outputs, meta: &ImageMeta) -> Result<Array3<f32>> {
        let restored = output_view::<Ix4>(outputs, &self.output_name)?.index_axis_move(Axis(0), 0);
        let channels = restored.len_of(Axis(0));
        if channels != 3 || restored.is_empty() {
            return Err(ModelError::Inference(format!(
                "Deblurring: expected a [1, 3, H, W] image, got {:?}",
                restored.shape()
            )));
        }

        let (width, height) = meta.original_size;
        let mut image = Array3::zeros((height, width, channels));
        for (c, plane) in restored.axis_iter(Axis(0)).enumerate() {
            let plane = backproject_bilinear(plane, meta);
            image
                .index_axis_mut(Axis(2), c)
                .assign(&plane.mapv(|v| (v * 255.0).clamp(0.0, 255.0)));
        }
        Ok(image)
    }
}

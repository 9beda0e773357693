use crate::adapters::{InferenceAdapter, InputTensor, Inputs, LayerInfo};
use crate::models::model::{ImageMeta, ModelParams};
use crate::models::utils::{InputTransform, ResizeType};
use crate::utils::error::ModelError;
use crate::Result;
use ndarray::{Array2, Array3, ArrayView2, Axis};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Nchw,
    Nhwc,
}

/// Shared state of wrappers that take a single image: the image input, its geometry,
/// the resize strategy and the input transform.
pub struct ImageModelBase {
    adapter: Arc<dyn InferenceAdapter>,
    image_blob_name: String,
    layout: Layout,
    channels: usize,
    width: usize,
    height: usize,
    resize_type: ResizeType,
    pad_value: f32,
    input_transform: InputTransform,
}

impl ImageModelBase {
    pub fn new(
        adapter: Arc<dyn InferenceAdapter>,
        params: &ModelParams,
        default_resize: ResizeType,
    ) -> Result<Self> {
        let image_layer = find_image_input(adapter.inputs())?.clone();
        let shape = &image_layer.shape;
        let (layout, channels, height, width) = image_geometry(&image_layer)?;

        let (width, height) = match params.input_size {
            Some([w, h]) => (w, h),
            None if width > 0 && height > 0 => (width as usize, height as usize),
            None => {
                return Err(ModelError::ModelLoad(format!(
                    "Image input '{}' has dynamic spatial size {:?}; set input_size",
                    image_layer.name, shape
                )))
            }
        };

        let input_transform = InputTransform::new(
            params.reverse_input_channels,
            params.mean_values.clone(),
            params.scale_values.clone(),
        )?;

        let resize_type = params.resize_type.unwrap_or(default_resize);

        tracing::debug!(
            "Image input '{}': {:?} {}x{}x{}, resize={}",
            image_layer.name,
            layout,
            channels,
            height,
            width,
            resize_type
        );

        Ok(Self {
            adapter,
            image_blob_name: image_layer.name,
            layout,
            channels: channels as usize,
            width,
            height,
            resize_type,
            pad_value: 0.0,
            input_transform,
        })
    }

    pub fn with_pad_value(mut self, pad_value: f32) -> Self {
        self.pad_value = pad_value;
        self
    }

    pub fn adapter(&self) -> &dyn InferenceAdapter {
        self.adapter.as_ref()
    }

    pub fn image_blob_name(&self) -> &str {
        &self.image_blob_name
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Model input size as `(width, height)`.
    pub fn input_size(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    pub fn resize_type(&self) -> ResizeType {
        self.resize_type
    }

    /// Fits, normalises and lays out `image` (HWC, `0..=255`) as the model's image input.
    pub fn preprocess(&self, image: &Array3<f32>) -> Result<(Inputs, ImageMeta)> {
        let (orig_h, orig_w, channels) = image.dim();
        if channels != self.channels {
            return Err(ModelError::InvalidInput(format!(
                "Model expects {} channels, got {}",
                self.channels, channels
            )));
        }

        let (mut resized, placement) =
            self.resize_type
                .apply(image, self.width, self.height, self.pad_value)?;
        self.input_transform.apply(&mut resized);

        let tensor = self.to_tensor(resized);
        let mut inputs = Inputs::new();
        inputs.insert(self.image_blob_name.clone(), InputTensor::F32(tensor));

        let meta = ImageMeta {
            original_size: (orig_w, orig_h),
            input_size: (self.width, self.height),
            placement,
        };
        Ok((inputs, meta))
    }

    fn to_tensor(&self, image: Array3<f32>) -> ndarray::ArrayD<f32> {
        let image = match self.layout {
            Layout::Nchw => image.permuted_axes([2, 0, 1]).as_standard_layout().into_owned(),
            Layout::Nhwc => image,
        };
        image.insert_axis(Axis(0)).into_dyn()
    }
}

/// Channel count of the single image input, 1 for grayscale networks.
pub fn image_input_channels(adapter: &dyn InferenceAdapter) -> Result<usize> {
    let (_, channels, _, _) = image_geometry(find_image_input(adapter.inputs())?)?;
    Ok(channels as usize)
}

/// Layout and `(channels, height, width)` of a 4D image input; spatial dims may be dynamic.
fn image_geometry(layer: &LayerInfo) -> Result<(Layout, i64, i64, i64)> {
    let shape = &layer.shape;
    if matches!(shape[1], 1 | 3) {
        Ok((Layout::Nchw, shape[1], shape[2], shape[3]))
    } else if matches!(shape[3], 1 | 3) {
        Ok((Layout::Nhwc, shape[3], shape[1], shape[2]))
    } else {
        Err(ModelError::ModelLoad(format!(
            "Cannot infer layout of image input '{}' with shape {:?}",
            layer.name, shape
        )))
    }
}

fn find_image_input(inputs: &[LayerInfo]) -> Result<&LayerInfo> {
    let candidates: Vec<&LayerInfo> = inputs.iter().filter(|l| l.shape.len() == 4).collect();
    match candidates.as_slice() {
        [single] => Ok(single),
        [] => Err(ModelError::ModelLoad(format!(
            "No 4D image input found among {:?}",
            inputs.iter().map(|l| &l.name).collect::<Vec<_>>()
        ))),
        _ => Err(ModelError::ModelLoad(format!(
            "Expected a single image input, found {}",
            candidates.len()
        ))),
    }
}

/// Source position in `map` for the centre of original pixel `(x, y)`, in map pixels,
/// clamped to the part of the map covered by the image (never the padding).
fn map_position(meta: &ImageMeta, map_size: (usize, usize), x: usize, y: usize) -> (f32, f32) {
    let p = &meta.placement;
    let axis = |pos: usize, scale: f32, offset: f32, original: usize, map: usize, input: usize| {
        let ratio = map as f32 / input as f32;
        let source = ((pos as f32 + 0.5) * scale + offset) * ratio - 0.5;
        let lo = (offset * ratio).max(0.0);
        let hi = ((offset + original as f32 * scale) * ratio - 1.0).min(map as f32 - 1.0);
        source.clamp(lo, hi.max(lo))
    };
    (
        axis(x, p.scale_x, p.offset_x, meta.original_size.0, map_size.0, meta.input_size.0),
        axis(y, p.scale_y, p.offset_y, meta.original_size.1, map_size.1, meta.input_size.1),
    )
}

/// Projects a dense per-pixel map predicted at (a fraction of) the model input back onto
/// the original image, picking the nearest map cell.
pub fn backproject_nearest<T: Copy>(map: ArrayView2<T>, meta: &ImageMeta) -> Array2<T> {
    let (map_h, map_w) = map.dim();
    let (width, height) = meta.original_size;
    Array2::from_shape_fn((height, width), |(y, x)| {
        let (mx, my) = map_position(meta, (map_w, map_h), x, y);
        let col = (mx.round().max(0.0) as usize).min(map_w - 1);
        let row = (my.round().max(0.0) as usize).min(map_h - 1);
        map[[row, col]]
    })
}

/// As [`backproject_nearest`] with bilinear interpolation between map cells.
pub fn backproject_bilinear(map: ArrayView2<f32>, meta: &ImageMeta) -> Array2<f32> {
    let (map_h, map_w) = map.dim();
    let (width, height) = meta.original_size;
    Array2::from_shape_fn((height, width), |(y, x)| {
        let (mx, my) = map_position(meta, (map_w, map_h), x, y);
        let mx = mx.clamp(0.0, (map_w - 1) as f32);
        let my = my.clamp(0.0, (map_h - 1) as f32);
        let (x0, y0) = (mx.floor() as usize, my.floor() as usize);
        let (x1, y1) = ((x0 + 1).min(map_w - 1), (y0 + 1).min(map_h - 1));
        let (fx, fy) = (mx - x0 as f32, my - y0 as f32);

        let top = map[[y0, x0]] * (1.0 - fx) + map[[y0, x1]] * fx;
        let bottom = map[[y1, x0]] * (1.0 - fx) + map[[y1, x1]] * fx;
        top * (1.0 - fy) + bottom * fy
    })
}

/// Output whose name contains `fragment`.
pub fn find_output_by_name<'a>(
    outputs: &'a [LayerInfo],
    fragment: &str,
) -> Option<&'a LayerInfo> {
    outputs.iter().find(|layer| layer.name.contains(fragment))
}

/// Checks the adapter exposes exactly `expected` outputs.
pub fn expect_output_count(adapter: &dyn InferenceAdapter, expected: usize, model: &str) -> Result<()> {
    let actual = adapter.outputs().len();
    if actual != expected {
        return Err(ModelError::ModelLoad(format!(
            "{} expects {} output(s), model has {}",
            model, expected, actual
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::RecordedAdapter;

    fn adapter(shape: Vec<i64>) -> Arc<dyn InferenceAdapter> {
        Arc::new(RecordedAdapter::new(vec![LayerInfo::new("image", shape)]))
    }

    #[test]
    fn detects_layouts() {
        let nchw = ImageModelBase::new(adapter(vec![1, 3, 32, 64]), &ModelParams::default(), ResizeType::Standard)
            .unwrap();
        assert_eq!(nchw.layout(), Layout::Nchw);
        assert_eq!(nchw.input_size(), (64, 32));

        let nhwc = ImageModelBase::new(adapter(vec![1, 32, 64, 3]), &ModelParams::default(), ResizeType::Standard)
            .unwrap();
        assert_eq!(nhwc.layout(), Layout::Nhwc);
        assert_eq!(nhwc.input_size(), (64, 32));
    }

    #[test]
    fn dynamic_inputs_need_explicit_size() {
        assert!(ImageModelBase::new(adapter(vec![1, 3, -1, -1]), &ModelParams::default(), ResizeType::Standard)
            .is_err());

        let params = ModelParams {
            input_size: Some([16, 8]),
            ..Default::default()
        };
        let base = ImageModelBase::new(adapter(vec![1, 3, -1, -1]), &params, ResizeType::Standard).unwrap();
        assert_eq!(base.input_size(), (16, 8));
    }

    #[test]
    fn preprocess_produces_nchw_tensor_and_meta() {
        let params = ModelParams {
            mean_values: Some(vec![10.0]),
            ..Default::default()
        };
        let base = ImageModelBase::new(adapter(vec![1, 3, 4, 4]), &params, ResizeType::Standard).unwrap();

        let mut image = Array3::<f32>::from_elem((8, 8, 3), 20.0);
        image.slice_mut(ndarray::s![.., .., 2]).fill(50.0);
        let (inputs, meta) = base.preprocess(&image).unwrap();

        let tensor = match &inputs["image"] {
            InputTensor::F32(t) => t.clone(),
            InputTensor::I64(_) => panic!("image input must be f32"),
        };
        assert_eq!(tensor.shape(), &[1, 3, 4, 4]);
        assert!((tensor[[0, 0, 1, 1]] - 10.0).abs() < 1e-4);
        assert!((tensor[[0, 2, 1, 1]] - 40.0).abs() < 1e-4);
        assert_eq!(meta.original_size, (8, 8));
        assert_eq!(meta.to_original(2.0, 2.0), (4.0, 4.0));
    }

    #[test]
    fn maps_are_projected_through_the_letterbox() {
        let base = ImageModelBase::new(
            adapter(vec![1, 3, 4, 4]),
            &ModelParams::default(),
            ResizeType::FitToWindowLetterbox,
        )
        .unwrap();
        // 8x4 image letterboxed into 4x4: rows 1..3 of the input hold the image.
        let (_, meta) = base.preprocess(&Array3::zeros((4, 8, 3))).unwrap();
        let map = ndarray::arr2(&[[9, 9, 9, 9], [1, 1, 2, 2], [3, 3, 4, 4], [9, 9, 9, 9]]);

        let classes = backproject_nearest(map.view(), &meta);
        assert_eq!(classes.dim(), (4, 8));
        assert_eq!(classes[[0, 0]], 1);
        assert_eq!(classes[[0, 7]], 2);
        assert_eq!(classes[[3, 0]], 3);
        assert!(!classes.iter().any(|&c| c == 9));

        let smooth = backproject_bilinear(map.mapv(|c| c as f32).view(), &meta);
        assert_eq!(smooth.dim(), (4, 8));
        assert!(smooth.iter().all(|&v| (1.0..=4.0).contains(&v)));
    }

    #[test]
    fn channel_mismatch_is_rejected() {
        let base = ImageModelBase::new(adapter(vec![1, 1, 4, 4]), &ModelParams::default(), ResizeType::Standard)
            .unwrap();
        assert!(base.preprocess(&Array3::zeros((4, 4, 3))).is_err());
    }
}

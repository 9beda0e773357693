use crate::utils::error::ModelError;
use crate::Result;
use ndarray::{s, Array3, ArrayView3, Axis};

/// Geometric transforms over HWC `f32` images.
pub struct ImageTransforms;

impl ImageTransforms {
    /// Bilinear resize with half-pixel centers, matching the usual `INTER_LINEAR` behaviour.
    pub fn resize(image: &Array3<f32>, width: usize, height: usize) -> Result<Array3<f32>> {
        Self::resize_view(image.view(), width, height)
    }

    pub fn resize_view(image: ArrayView3<f32>, width: usize, height: usize) -> Result<Array3<f32>> {
        let (orig_h, orig_w, channels) = image.dim();
        if orig_h == 0 || orig_w == 0 {
            return Err(ModelError::ImageProcessing("Cannot resize an empty image".into()));
        }
        if width == 0 || height == 0 {
            return Err(ModelError::ImageProcessing(format!(
                "Invalid target size {}x{}",
                width, height
            )));
        }
        if orig_w == width && orig_h == height {
            return Ok(image.to_owned());
        }

        let scale_x = orig_w as f32 / width as f32;
        let scale_y = orig_h as f32 / height as f32;
        let mut resized = Array3::<f32>::zeros((height, width, channels));

        for h in 0..height {
            let src_h = ((h as f32 + 0.5) * scale_y - 0.5).max(0.0);
            let h1 = (src_h.floor() as usize).min(orig_h - 1);
            let h2 = (h1 + 1).min(orig_h - 1);
            let dh = (src_h - h1 as f32).clamp(0.0, 1.0);

            for w in 0..width {
                let src_w = ((w as f32 + 0.5) * scale_x - 0.5).max(0.0);
                let w1 = (src_w.floor() as usize).min(orig_w - 1);
                let w2 = (w1 + 1).min(orig_w - 1);
                let dw = (src_w - w1 as f32).clamp(0.0, 1.0);

                for c in 0..channels {
                    let v11 = image[[h1, w1, c]];
                    let v12 = image[[h1, w2, c]];
                    let v21 = image[[h2, w1, c]];
                    let v22 = image[[h2, w2, c]];

                    resized[[h, w, c]] = v11 * (1.0 - dh) * (1.0 - dw)
                        + v12 * (1.0 - dh) * dw
                        + v21 * dh * (1.0 - dw)
                        + v22 * dh * dw;
                }
            }
        }

        Ok(resized)
    }

    /// Places `image` on a `width` x `height` canvas filled with `value`.
    pub fn pad(
        image: &Array3<f32>,
        width: usize,
        height: usize,
        offset_x: usize,
        offset_y: usize,
        value: f32,
    ) -> Result<Array3<f32>> {
        let (h, w, channels) = image.dim();
        if offset_x + w > width || offset_y + h > height {
            return Err(ModelError::ImageProcessing(format!(
                "Image {}x{} at ({}, {}) does not fit a {}x{} canvas",
                w, h, offset_x, offset_y, width, height
            )));
        }

        let mut canvas = Array3::<f32>::from_elem((height, width, channels), value);
        canvas
            .slice_mut(s![offset_y..offset_y + h, offset_x..offset_x + w, ..])
            .assign(image);
        Ok(canvas)
    }

    /// Copies the `width` x `height` region starting at (`x`, `y`).
    pub fn crop(
        image: &Array3<f32>,
        x: usize,
        y: usize,
        width: usize,
        height: usize,
    ) -> Result<Array3<f32>> {
        let (orig_h, orig_w, _) = image.dim();
        if width == 0 || height == 0 || x + width > orig_w || y + height > orig_h {
            return Err(ModelError::InvalidInput("Invalid crop region".to_string()));
        }
        Ok(image.slice(s![y..y + height, x..x + width, ..]).to_owned())
    }

    /// Swaps the first and third channels (BGR <-> RGB).
    pub fn swap_rb(image: &mut Array3<f32>) {
        if image.dim().2 < 3 {
            return;
        }
        for mut pixel in image.lanes_mut(Axis(2)) {
            pixel.swap(0, 2);
        }
    }
}

use crate::utils::error::ModelError;
use crate::Result;
use base64::Engine;
use image::{DynamicImage, GenericImageView, ImageFormat};
use ndarray::Array3;
use std::path::Path;

const MAX_IMAGE_BYTES: usize = 50 * 1024 * 1024;

pub struct ImageLoader;

impl ImageLoader {
    /// Decodes a base64 payload, with or without a `data:image/...;base64,` prefix.
    pub fn from_base64(base64_data: &str) -> Result<DynamicImage> {
        let base64_clean = match base64_data.strip_prefix("data:") {
            Some(rest) => rest.split_once(',').map(|(_, data)| data).unwrap_or(rest),
            None => base64_data,
        };

        let image_bytes = base64::engine::general_purpose::STANDARD.decode(base64_clean.trim())?;
        Self::from_bytes(&image_bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<DynamicImage> {
        if bytes.len() > MAX_IMAGE_BYTES {
            return Err(ModelError::FileTooLarge(bytes.len(), MAX_IMAGE_BYTES));
        }

        if let Some(format) = Self::detect_format(bytes) {
            if !Self::is_supported_format(format) {
                return Err(ModelError::InvalidInput(format!(
                    "Unsupported image format: {:?}",
                    format
                )));
            }
        }

        Ok(image::load_from_memory(bytes)?)
    }

    pub fn from_path(path: &Path) -> Result<DynamicImage> {
        Ok(image::open(path)?)
    }

    pub fn detect_format(bytes: &[u8]) -> Option<ImageFormat> {
        image::guess_format(bytes).ok()
    }

    pub fn is_supported_format(format: ImageFormat) -> bool {
        matches!(
            format,
            ImageFormat::Png
                | ImageFormat::Jpeg
                | ImageFormat::Bmp
                | ImageFormat::Tiff
                | ImageFormat::WebP
        )
    }

    /// Converts to an RGB HWC array with values in `0..=255`.
    pub fn to_array3(image: &DynamicImage) -> Array3<f32> {
        let rgb_image = image.to_rgb8();
        let (width, height) = rgb_image.dimensions();
        Self::pixels_to_array(rgb_image.into_raw(), width, height, 3)
    }

    /// Converts to a single-channel luma HWC array with values in `0..=255`.
    pub fn to_gray_array3(image: &DynamicImage) -> Array3<f32> {
        let gray_image = image.to_luma8();
        let (width, height) = gray_image.dimensions();
        Self::pixels_to_array(gray_image.into_raw(), width, height, 1)
    }

    fn pixels_to_array(raw_data: Vec<u8>, width: u32, height: u32, channels: usize) -> Array3<f32> {
        let shape = (height as usize, width as usize, channels);
        Array3::from_shape_vec(shape, raw_data.into_iter().map(f32::from).collect())
            .unwrap_or_else(|_| Array3::zeros(shape))
    }

    pub fn validate_dimensions(image: &DynamicImage) -> Result<()> {
        let (width, height) = image.dimensions();

        if width == 0 || height == 0 {
            return Err(ModelError::InvalidInput("Image is empty".to_string()));
        }

        if width > 8192 || height > 8192 {
            return Err(ModelError::InvalidInput(format!(
                "Image too large: {}x{}, maximum 8192x8192",
                width, height
            )));
        }

        Ok(())
    }

    /// Validates and converts a decoded image into the RGB array wrappers consume.
    pub fn preprocess(image: DynamicImage) -> Result<Array3<f32>> {
        Self::preprocess_for(image, 3)
    }

    /// Like [`preprocess`](Self::preprocess), for a model input with `channels` channels.
    pub fn preprocess_for(image: DynamicImage, channels: usize) -> Result<Array3<f32>> {
        Self::validate_dimensions(&image)?;
        match channels {
            3 => Ok(Self::to_array3(&image)),
            1 => Ok(Self::to_gray_array3(&image)),
            other => Err(ModelError::InvalidInput(format!(
                "Cannot convert an image to {} channels",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use std::io::Cursor;

    fn png_bytes() -> Vec<u8> {
        let buffer: ImageBuffer<Rgb<u8>, Vec<u8>> =
            ImageBuffer::from_fn(3, 2, |x, y| Rgb([x as u8 * 10, y as u8 * 20, 255]));
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(buffer)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn decodes_data_url_payloads() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(png_bytes());
        let image = ImageLoader::from_base64(&format!("data:image/png;base64,{}", encoded)).unwrap();
        assert_eq!(image.dimensions(), (3, 2));
    }

    #[test]
    fn converts_to_hwc_rgb() {
        let image = ImageLoader::from_bytes(&png_bytes()).unwrap();
        let array = ImageLoader::preprocess(image).unwrap();
        assert_eq!(array.dim(), (2, 3, 3));
        assert_eq!(array[[1, 2, 0]], 20.0);
        assert_eq!(array[[1, 2, 1]], 20.0);
        assert_eq!(array[[0, 0, 2]], 255.0);
    }

    #[test]
    fn converts_to_single_channel_luma() {
        let image = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(4, 2, Rgb([200, 200, 200])));
        let array = ImageLoader::preprocess_for(image.clone(), 1).unwrap();
        assert_eq!(array.dim(), (2, 4, 1));
        assert_eq!(array[[1, 3, 0]], 200.0);
        assert!(ImageLoader::preprocess_for(image, 4).is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(ImageLoader::from_bytes(b"not an image").is_err());
        assert!(ImageLoader::from_base64("%%%").is_err());
    }
}

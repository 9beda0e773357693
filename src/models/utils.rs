//! Result types, input/output transforms and resize strategies shared by every wrapper.

use crate::image::ImageTransforms;
use crate::utils::error::ModelError;
use crate::Result;
use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// An axis-aligned box in original-image pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
    pub score: f32,
    pub id: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Detection {
    pub fn new(xmin: f32, ymin: f32, xmax: f32, ymax: f32, score: f32, id: usize) -> Self {
        Self {
            xmin,
            ymin,
            xmax,
            ymax,
            score,
            id,
            label: None,
        }
    }

    pub fn width(&self) -> f32 {
        (self.xmax - self.xmin).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.ymax - self.ymin).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Intersection over union. With `include_boundaries` coordinates are treated as
    /// inclusive pixel indices, adding one to every side length.
    pub fn iou(&self, other: &Detection, include_boundaries: bool) -> f32 {
        let extra = if include_boundaries { 1.0 } else { 0.0 };
        let inter_w = (self.xmax.min(other.xmax) - self.xmin.max(other.xmin) + extra).max(0.0);
        let inter_h = (self.ymax.min(other.ymax) - self.ymin.max(other.ymin) + extra).max(0.0);
        let intersection = inter_w * inter_h;

        let area_a = (self.xmax - self.xmin + extra).max(0.0) * (self.ymax - self.ymin + extra).max(0.0);
        let area_b =
            (other.xmax - other.xmin + extra).max(0.0) * (other.ymax - other.ymin + extra).max(0.0);
        let union = area_a + area_b - intersection;

        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }
}

/// A detection that also carries facial (or other) landmark points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionWithLandmarks {
    #[serde(flatten)]
    pub detection: Detection,
    /// `[x, y]` per landmark, in original-image pixels.
    pub landmarks: Vec<[f32; 2]>,
}

impl DetectionWithLandmarks {
    pub fn new(detection: Detection, landmarks: Vec<[f32; 2]>) -> Self {
        Self {
            detection,
            landmarks,
        }
    }
}

/// One person's keypoints as `[x, y, confidence]`, in original-image pixels.
///
/// Joints that were not found are `[-1, -1, 0]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub keypoints: Vec<[f32; 3]>,
    pub score: f32,
}

impl Pose {
    pub fn visible_keypoints(&self) -> usize {
        self.keypoints.iter().filter(|kp| kp[2] > 0.0).count()
    }
}

/// Per-pixel probability that the pixel belongs to the salient object, original-image size.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SaliencyMap(pub Array2<f32>);

/// Per-pixel relative depth, original-image size.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DepthMap(pub Array2<f32>);

/// Per-channel input normalisation: optional channel reversal, then `(x - mean) / scale`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InputTransform {
    reverse_input_channels: bool,
    mean_values: Vec<f32>,
    scale_values: Vec<f32>,
}

impl InputTransform {
    /// `mean_values` and `scale_values` take one value for all channels or one per channel.
    pub fn new(
        reverse_input_channels: bool,
        mean_values: Option<Vec<f32>>,
        scale_values: Option<Vec<f32>>,
    ) -> Result<Self> {
        let mean_values = mean_values.unwrap_or_default();
        let scale_values = scale_values.unwrap_or_default();

        for (name, values) in [("mean_values", &mean_values), ("scale_values", &scale_values)] {
            if !matches!(values.len(), 0 | 1 | 3) {
                return Err(ModelError::Config(format!(
                    "{} must have 1 or 3 elements, got {}",
                    name,
                    values.len()
                )));
            }
        }
        if scale_values.iter().any(|&s| s == 0.0) {
            return Err(ModelError::Config("scale_values must be non-zero".into()));
        }

        Ok(Self {
            reverse_input_channels,
            mean_values,
            scale_values,
        })
    }

    pub fn is_trivial(&self) -> bool {
        !self.reverse_input_channels && self.mean_values.is_empty() && self.scale_values.is_empty()
    }

    pub fn apply(&self, image: &mut Array3<f32>) {
        if self.reverse_input_channels {
            ImageTransforms::swap_rb(image);
        }
        if self.mean_values.is_empty() && self.scale_values.is_empty() {
            return;
        }

        let channels = image.dim().2;
        for mut pixel in image.lanes_mut(ndarray::Axis(2)) {
            for c in 0..channels {
                let mean = channel_value(&self.mean_values, c, 0.0);
                let scale = channel_value(&self.scale_values, c, 1.0);
                pixel[c] = (pixel[c] - mean) / scale;
            }
        }
    }
}

fn channel_value(values: &[f32], channel: usize, default: f32) -> f32 {
    match values.len() {
        0 => default,
        1 => values[0],
        _ => values.get(channel).copied().unwrap_or(default),
    }
}

/// Maps results computed at the model input size onto a requested output resolution,
/// keeping the aspect ratio.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputTransform {
    input_size: (usize, usize),
    scale_factor: Option<f32>,
}

impl OutputTransform {
    /// Sizes are `(width, height)`. Without an output resolution the transform is the identity.
    pub fn new(input_size: (usize, usize), output_resolution: Option<(usize, usize)>) -> Self {
        let scale_factor = output_resolution.map(|(out_w, out_h)| {
            (out_w as f32 / input_size.0 as f32).min(out_h as f32 / input_size.1 as f32)
        });
        Self {
            input_size,
            scale_factor,
        }
    }

    pub fn scale_factor(&self) -> Option<f32> {
        self.scale_factor
    }

    /// Resolution results are rendered at, `(width, height)`.
    pub fn resolution(&self) -> (usize, usize) {
        match self.scale_factor {
            Some(factor) => (
                (self.input_size.0 as f32 * factor).round() as usize,
                (self.input_size.1 as f32 * factor).round() as usize,
            ),
            None => self.input_size,
        }
    }

    pub fn resize(&self, image: &Array3<f32>) -> Result<Array3<f32>> {
        if self.scale_factor.is_none() {
            return Ok(image.clone());
        }
        let (width, height) = self.resolution();
        ImageTransforms::resize(image, width, height)
    }

    pub fn scale(&self, value: f32) -> f32 {
        match self.scale_factor {
            Some(factor) => value * factor,
            None => value,
        }
    }

    pub fn scale_detection(&self, detection: &Detection) -> Detection {
        Detection {
            xmin: self.scale(detection.xmin),
            ymin: self.scale(detection.ymin),
            xmax: self.scale(detection.xmax),
            ymax: self.scale(detection.ymax),
            ..detection.clone()
        }
    }
}

/// How an input image is fitted to the model's input size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeType {
    /// Centre-crop to the input aspect ratio, then scale.
    Crop,
    /// Scale both axes independently.
    Standard,
    /// Scale keeping aspect ratio; the remainder is padded bottom-right.
    FitToWindow,
    /// Scale keeping aspect ratio and centre the result on a padded canvas.
    FitToWindowLetterbox,
}

/// Published resize strategies by name.
pub const RESIZE_TYPES: [(&str, ResizeType); 4] = [
    ("crop", ResizeType::Crop),
    ("standard", ResizeType::Standard),
    ("fit_to_window", ResizeType::FitToWindow),
    ("fit_to_window_letterbox", ResizeType::FitToWindowLetterbox),
];

/// Where the original image landed inside the model input.
///
/// Input pixel = original pixel * scale + offset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub scale_x: f32,
    pub scale_y: f32,
    pub offset_x: f32,
    pub offset_y: f32,
    /// Size of the scaled image before padding, `(width, height)`.
    pub resized_size: (usize, usize),
}

impl ResizeType {
    pub fn name(self) -> &'static str {
        RESIZE_TYPES
            .iter()
            .find(|(_, kind)| *kind == self)
            .map(|(name, _)| *name)
            .unwrap_or("standard")
    }

    /// Fits `image` to `width` x `height`, padding with `pad_value` where needed.
    pub fn apply(
        self,
        image: &Array3<f32>,
        width: usize,
        height: usize,
        pad_value: f32,
    ) -> Result<(Array3<f32>, Placement)> {
        let (orig_h, orig_w, _) = image.dim();
        if orig_h == 0 || orig_w == 0 {
            return Err(ModelError::InvalidInput("Image is empty".to_string()));
        }

        match self {
            ResizeType::Standard => {
                let resized = ImageTransforms::resize(image, width, height)?;
                let placement = Placement {
                    scale_x: width as f32 / orig_w as f32,
                    scale_y: height as f32 / orig_h as f32,
                    offset_x: 0.0,
                    offset_y: 0.0,
                    resized_size: (width, height),
                };
                Ok((resized, placement))
            }
            ResizeType::Crop => {
                let target_aspect = width as f32 / height as f32;
                let (crop_w, crop_h) = if orig_w as f32 / orig_h as f32 > target_aspect {
                    (((orig_h as f32 * target_aspect).round() as usize).clamp(1, orig_w), orig_h)
                } else {
                    (orig_w, ((orig_w as f32 / target_aspect).round() as usize).clamp(1, orig_h))
                };
                let crop_x = (orig_w - crop_w) / 2;
                let crop_y = (orig_h - crop_h) / 2;

                let cropped = ImageTransforms::crop(image, crop_x, crop_y, crop_w, crop_h)?;
                let resized = ImageTransforms::resize(&cropped, width, height)?;
                let scale_x = width as f32 / crop_w as f32;
                let scale_y = height as f32 / crop_h as f32;
                let placement = Placement {
                    scale_x,
                    scale_y,
                    offset_x: -(crop_x as f32) * scale_x,
                    offset_y: -(crop_y as f32) * scale_y,
                    resized_size: (width, height),
                };
                Ok((resized, placement))
            }
            ResizeType::FitToWindow | ResizeType::FitToWindowLetterbox => {
                let scale = (width as f32 / orig_w as f32).min(height as f32 / orig_h as f32);
                let new_w = ((orig_w as f32 * scale) as usize).clamp(1, width);
                let new_h = ((orig_h as f32 * scale) as usize).clamp(1, height);
                let resized = ImageTransforms::resize(image, new_w, new_h)?;

                let (dx, dy) = if self == ResizeType::FitToWindowLetterbox {
                    ((width - new_w) / 2, (height - new_h) / 2)
                } else {
                    (0, 0)
                };
                let padded = ImageTransforms::pad(&resized, width, height, dx, dy, pad_value)?;
                let placement = Placement {
                    scale_x: new_w as f32 / orig_w as f32,
                    scale_y: new_h as f32 / orig_h as f32,
                    offset_x: dx as f32,
                    offset_y: dy as f32,
                    resized_size: (new_w, new_h),
                };
                Ok((padded, placement))
            }
        }
    }
}

impl FromStr for ResizeType {
    type Err = ModelError;

    fn from_str(name: &str) -> Result<Self> {
        RESIZE_TYPES
            .iter()
            .find(|(known, _)| *known == name)
            .map(|(_, kind)| *kind)
            .ok_or_else(|| {
                let known: Vec<&str> = RESIZE_TYPES.iter().map(|(name, _)| *name).collect();
                ModelError::Config(format!(
                    "Unknown resize type '{}'. Supported: {}",
                    name,
                    known.join(", ")
                ))
            })
    }
}

impl fmt::Display for ResizeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Greedy non-maximum suppression. Returns indices of kept detections, best first.
pub fn nms(
    detections: &[Detection],
    iou_threshold: f32,
    include_boundaries: bool,
    keep_top_k: Option<usize>,
) -> Vec<usize> {
    let mut order: Vec<usize> = (0..detections.len()).collect();
    order.sort_by(|&a, &b| detections[b].score.total_cmp(&detections[a].score));

    let mut keep = Vec::new();
    let mut suppressed = vec![false; detections.len()];
    for (rank, &i) in order.iter().enumerate() {
        if suppressed[i] {
            continue;
        }
        keep.push(i);
        if keep_top_k.is_some_and(|k| keep.len() >= k) {
            break;
        }
        for &j in &order[rank + 1..] {
            if !suppressed[j] && detections[i].iou(&detections[j], include_boundaries) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }
    keep
}

/// NMS run independently for every class id.
pub fn nms_per_class(detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    let mut ids: Vec<usize> = detections.iter().map(|d| d.id).collect();
    ids.sort_unstable();
    ids.dedup();

    let mut kept = Vec::new();
    for id in ids {
        let class: Vec<Detection> = detections.iter().filter(|d| d.id == id).cloned().collect();
        kept.extend(nms(&class, iou_threshold, false, None).into_iter().map(|i| class[i].clone()));
    }
    kept.sort_by(|a, b| b.score.total_cmp(&a.score));
    kept
}

/// Clamps boxes to the image, `size` is `(width, height)`.
pub fn clip_detections(detections: &mut [Detection], size: (usize, usize)) {
    let (width, height) = (size.0 as f32, size.1 as f32);
    for detection in detections {
        detection.xmin = detection.xmin.clamp(0.0, width);
        detection.ymin = detection.ymin.clamp(0.0, height);
        detection.xmax = detection.xmax.clamp(0.0, width);
        detection.ymax = detection.ymax.clamp(0.0, height);
    }
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum <= 0.0 {
        return vec![0.0; logits.len()];
    }
    exps.into_iter().map(|e| e / sum).collect()
}

/// Index and value of the largest element.
pub fn argmax(values: &[f32]) -> Option<(usize, f32)> {
    values
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best, (i, v)| match best {
            Some((_, best_v)) if best_v >= v => best,
            _ => Some((i, v)),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_types_round_trip_by_name() {
        for (name, kind) in RESIZE_TYPES {
            assert_eq!(name.parse::<ResizeType>().unwrap(), kind);
            assert_eq!(kind.to_string(), name);
        }
        assert!("bicubic".parse::<ResizeType>().is_err());
    }

    #[test]
    fn letterbox_centres_and_records_placement() {
        let image = Array3::<f32>::from_elem((50, 100, 3), 10.0);
        let (resized, placement) = ResizeType::FitToWindowLetterbox
            .apply(&image, 40, 40, 0.0)
            .unwrap();
        assert_eq!(resized.dim(), (40, 40, 3));
        assert_eq!(placement.resized_size, (40, 20));
        assert_eq!(placement.offset_y, 10.0);
        assert_eq!(resized[[5, 20, 0]], 0.0);
        assert!((resized[[20, 20, 0]] - 10.0).abs() < 1e-4);
    }

    #[test]
    fn fit_to_window_pads_bottom_right() {
        let image = Array3::<f32>::from_elem((50, 100, 3), 10.0);
        let (resized, placement) = ResizeType::FitToWindow.apply(&image, 40, 40, 114.0).unwrap();
        assert_eq!(placement.offset_x, 0.0);
        assert_eq!(placement.offset_y, 0.0);
        assert_eq!(resized[[39, 0, 0]], 114.0);
        assert!((resized[[0, 0, 0]] - 10.0).abs() < 1e-4);
    }

    #[test]
    fn crop_keeps_the_centre() {
        let mut image = Array3::<f32>::zeros((10, 20, 1));
        image.slice_mut(ndarray::s![.., 5..15, ..]).fill(1.0);
        let (resized, placement) = ResizeType::Crop.apply(&image, 10, 10, 0.0).unwrap();
        assert!(resized.iter().all(|&v| (v - 1.0).abs() < 1e-4));
        assert_eq!(placement.offset_x, -5.0);
    }

    #[test]
    fn input_transform_normalises_per_channel() {
        let transform =
            InputTransform::new(true, Some(vec![1.0, 2.0, 3.0]), Some(vec![2.0])).unwrap();
        let mut image = Array3::<f32>::zeros((1, 1, 3));
        image[[0, 0, 0]] = 11.0;
        image[[0, 0, 2]] = 33.0;
        transform.apply(&mut image);
        assert_eq!(image[[0, 0, 0]], 16.0);
        assert_eq!(image[[0, 0, 1]], -1.0);
        assert_eq!(image[[0, 0, 2]], 4.0);

        assert!(InputTransform::default().is_trivial());
        assert!(InputTransform::new(false, Some(vec![1.0, 2.0]), None).is_err());
    }

    #[test]
    fn output_transform_fits_resolution() {
        let transform = OutputTransform::new((640, 480), Some((320, 320)));
        assert_eq!(transform.scale_factor(), Some(0.5));
        assert_eq!(transform.resolution(), (320, 240));
        let scaled = transform.scale_detection(&Detection::new(10.0, 20.0, 30.0, 40.0, 0.9, 1));
        assert_eq!((scaled.xmin, scaled.ymax), (5.0, 20.0));

        let identity = OutputTransform::new((640, 480), None);
        assert_eq!(identity.scale(7.0), 7.0);
    }

    #[test]
    fn nms_suppresses_overlaps() {
        let detections = vec![
            Detection::new(0.0, 0.0, 10.0, 10.0, 0.8, 0),
            Detection::new(1.0, 1.0, 10.0, 10.0, 0.9, 0),
            Detection::new(20.0, 20.0, 30.0, 30.0, 0.7, 0),
        ];
        assert_eq!(nms(&detections, 0.5, false, None), vec![1, 2]);
        assert_eq!(nms(&detections, 0.5, false, Some(1)), vec![1]);
    }

    #[test]
    fn per_class_nms_keeps_other_classes() {
        let detections = vec![
            Detection::new(0.0, 0.0, 10.0, 10.0, 0.9, 0),
            Detection::new(0.0, 0.0, 10.0, 10.0, 0.8, 1),
            Detection::new(0.0, 0.0, 10.0, 10.0, 0.7, 0),
        ];
        let kept = nms_per_class(detections, 0.5);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].id, 0);
        assert_eq!(kept[1].id, 1);
    }

    #[test]
    fn math_helpers() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-6);
        let probs = softmax(&[1.0, 1.0]);
        assert!((probs[0] - 0.5).abs() < 1e-6);
        assert_eq!(argmax(&[0.1, 0.7, 0.2]), Some((1, 0.7)));
        assert_eq!(argmax(&[]), None);
    }
}

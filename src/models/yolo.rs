//! YOLO family detectors.
//!
//! `YOLO`, `YoloV4` and `YOLOF` share the region-output decoder: every output is an
//! `[1, A * (box + objectness + classes), H, W]` grid, each cell predicting `A` anchored
//! boxes. They differ in which activations the network already applied and whether an
//! objectness channel exists. `YOLOX` is anchor-free with a flat `[1, N, 5 + C]` output.

use crate::adapters::{output_view, InferenceAdapter, Inputs, LayerInfo, Outputs};
use crate::models::detection_model::DetectionModel;
use crate::models::image_model::expect_output_count;
use crate::models::model::{ImageMeta, Model, ModelParams};
use crate::models::utils::{argmax, nms_per_class, sigmoid, Detection, ResizeType};
use crate::utils::error::ModelError;
use crate::Result;
use ndarray::{Array3, ArrayView4, Axis, Ix3, Ix4};
use std::sync::Arc;

const YOLO_V3_ANCHORS: [f32; 18] = [
    10.0, 13.0, 16.0, 30.0, 33.0, 23.0, 30.0, 61.0, 62.0, 45.0, 59.0, 119.0, 116.0, 90.0, 156.0,
    198.0, 373.0, 326.0,
];
const YOLO_V3_TINY_ANCHORS: [f32; 12] = [
    10.0, 14.0, 23.0, 27.0, 37.0, 58.0, 81.0, 82.0, 135.0, 169.0, 344.0, 319.0,
];
const YOLO_V4_ANCHORS: [f32; 18] = [
    12.0, 16.0, 19.0, 36.0, 40.0, 28.0, 36.0, 75.0, 76.0, 55.0, 72.0, 146.0, 142.0, 110.0, 192.0,
    243.0, 459.0, 401.0,
];
const YOLOF_ANCHORS: [f32; 12] = [
    16.0, 16.0, 32.0, 32.0, 64.0, 64.0, 128.0, 128.0, 256.0, 256.0, 512.0, 512.0,
];
const YOLOX_STRIDES: [usize; 3] = [8, 16, 32];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Variant {
    /// Coordinates, objectness and classes already passed through a logistic layer.
    Activated,
    /// Raw logits everywhere.
    Raw,
    /// Raw logits, no objectness channel, one output.
    NoObjectness,
}

impl Variant {
    fn box_channels(self) -> usize {
        match self {
            Variant::NoObjectness => 4,
            Variant::Activated | Variant::Raw => 5,
        }
    }

    fn activate(self, value: f32) -> f32 {
        match self {
            Variant::Activated => value,
            Variant::Raw | Variant::NoObjectness => sigmoid(value),
        }
    }
}

struct Region {
    name: String,
    anchors: Vec<(f32, f32)>,
}

struct RegionDetector {
    detection: DetectionModel,
    regions: Vec<Region>,
    variant: Variant,
}

impl RegionDetector {
    fn new(
        adapter: Arc<dyn InferenceAdapter>,
        params: &ModelParams,
        variant: Variant,
        model: &str,
    ) -> Result<Self> {
        let mut outputs: Vec<LayerInfo> = adapter
            .outputs()
            .iter()
            .filter(|l| l.shape.len() == 4)
            .cloned()
            .collect();
        if outputs.is_empty() {
            return Err(ModelError::ModelLoad(format!("{}: no 4D region outputs", model)));
        }
        // Largest grid first; it pairs with the smallest anchors.
        outputs.sort_by_key(|l| std::cmp::Reverse(l.shape[2].max(0) * l.shape[3].max(0)));

        let (default_anchors, default_masks): (&[f32], Vec<usize>) = match (variant, outputs.len()) {
            (Variant::NoObjectness, 1) => (&YOLOF_ANCHORS, (0..6).collect()),
            (Variant::Raw, 3) => (&YOLO_V4_ANCHORS, (0..9).collect()),
            (_, 2) => (&YOLO_V3_TINY_ANCHORS, vec![1, 2, 3, 3, 4, 5]),
            (_, 3) => (&YOLO_V3_ANCHORS, (0..9).collect()),
            (_, n) if params.masks.is_none() => {
                return Err(ModelError::ModelLoad(format!(
                    "{}: no default anchor masks for {} outputs; set masks",
                    model, n
                )))
            }
            _ => (&YOLO_V3_ANCHORS, Vec::new()),
        };

        let anchors = params.anchor_pairs(default_anchors)?;
        let masks = params.masks.clone().unwrap_or(default_masks);
        if masks.is_empty() || masks.len() % outputs.len() != 0 {
            return Err(ModelError::ModelLoad(format!(
                "{}: {} mask entries cannot be split over {} outputs",
                model,
                masks.len(),
                outputs.len()
            )));
        }
        let per_output = masks.len() / outputs.len();

        let regions = outputs
            .iter()
            .zip(masks.chunks(per_output))
            .map(|(layer, mask)| {
                let region_anchors = mask
                    .iter()
                    .map(|&i| {
                        anchors.get(i).copied().ok_or_else(|| {
                            ModelError::ModelLoad(format!(
                                "{}: mask index {} out of {} anchors",
                                model,
                                i,
                                anchors.len()
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Region {
                    name: layer.name.clone(),
                    anchors: region_anchors,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let detection =
            DetectionModel::new(adapter, params, ResizeType::FitToWindowLetterbox, 0.5, 0.5)?;

        Ok(Self {
            detection,
            regions,
            variant,
        })
    }

    fn parse_region(&self, output: ArrayView4<f32>, region: &Region, meta: &ImageMeta) -> Result<Vec<Detection>> {
        let (_, channels, grid_h, grid_w) = output.dim();
        let num_anchors = region.anchors.len();
        let box_channels = self.variant.box_channels();
        if channels % num_anchors != 0 || channels / num_anchors <= box_channels {
            return Err(ModelError::Inference(format!(
                "Region '{}' has {} channels, not divisible into {} anchors",
                region.name, channels, num_anchors
            )));
        }
        let per_anchor = channels / num_anchors;
        let num_classes = per_anchor - box_channels;
        let (input_w, input_h) = (meta.input_size.0 as f32, meta.input_size.1 as f32);
        let threshold = self.detection.confidence_threshold;
        let grid = output.index_axis(Axis(0), 0);

        let mut detections = Vec::new();
        for (a, &(anchor_w, anchor_h)) in region.anchors.iter().enumerate() {
            let base = a * per_anchor;
            for row in 0..grid_h {
                for col in 0..grid_w {
                    let raw = |k: usize| grid[[base + k, row, col]];

                    let objectness = match self.variant {
                        Variant::NoObjectness => 1.0,
                        variant => variant.activate(raw(4)),
                    };
                    if objectness < threshold {
                        continue;
                    }

                    let x = (col as f32 + self.variant.activate(raw(0))) / grid_w as f32;
                    let y = (row as f32 + self.variant.activate(raw(1))) / grid_h as f32;
                    let w = raw(2).exp() * anchor_w / input_w;
                    let h = raw(3).exp() * anchor_h / input_h;

                    for class in 0..num_classes {
                        let score = objectness * self.variant.activate(raw(box_channels + class));
                        if score < threshold {
                            continue;
                        }
                        detections.push(Detection::new(
                            x - w / 2.0,
                            y - h / 2.0,
                            x + w / 2.0,
                            y + h / 2.0,
                            score,
                            class,
                        ));
                    }
                }
            }
        }
        Ok(detections)
    }

    fn postprocess(&self, outputs: &Outputs, meta: &ImageMeta) -> Result<Vec<Detection>> {
        let mut detections = Vec::new();
        for region in &self.regions {
            let output = output_view::<Ix4>(outputs, &region.name)?;
            detections.extend(self.parse_region(output, region, meta)?);
        }
        let detections = nms_per_class(detections, self.detection.iou_threshold);
        Ok(self.detection.finalize_normalized(detections, meta))
    }
}

macro_rules! region_model {
    ($(#[$doc:meta])* $name:ident, $variant:expr) => {
        $(#[$doc])*
        #[allow(clippy::upper_case_acronyms)]
        pub struct $name {
            inner: RegionDetector,
        }

        impl $name {
            pub fn new(adapter: Arc<dyn InferenceAdapter>, params: &ModelParams) -> Result<Self> {
                Ok(Self {
                    inner: RegionDetector::new(adapter, params, $variant, stringify!($name))?,
                })
            }
        }

        impl Model for $name {
            type Input = Array3<f32>;
            type Meta = ImageMeta;
            type Output = Vec<Detection>;

            fn architecture(&self) -> &'static str {
                stringify!($name)
            }

            fn adapter(&self) -> &dyn InferenceAdapter {
                self.inner.detection.base.adapter()
            }

            fn preprocess(&self, image: &Array3<f32>) -> Result<(Inputs, ImageMeta)> {
                self.inner.detection.base.preprocess(image)
            }

            fn postprocess(&self, outputs: &Outputs, meta: &ImageMeta) -> Result<Vec<Detection>> {
                self.inner.postprocess(outputs, meta)
            }
        }
    };
}

region_model!(
    /// YOLOv3 and YOLOv3-tiny with region outputs that are already activated.
    YOLO,
    Variant::Activated
);
region_model!(
    /// YOLOv4 with raw region logits.
    YoloV4,
    Variant::Raw
);
region_model!(
    /// You Only Look One-level Feature: a single region output without objectness.
    YOLOF,
    Variant::NoObjectness
);

/// Anchor-free YOLOX. Input is letterboxed at the top-left with grey padding and is not
/// normalised.
#[allow(clippy::upper_case_acronyms)]
pub struct YOLOX {
    detection: DetectionModel,
    output_name: String,
}

impl YOLOX {
    pub fn new(adapter: Arc<dyn InferenceAdapter>, params: &ModelParams) -> Result<Self> {
        expect_output_count(adapter.as_ref(), 1, "YOLOX")?;
        let output = adapter.outputs()[0].clone();
        if output.shape.len() != 3 {
            return Err(ModelError::ModelLoad(format!(
                "YOLOX: expected a [1, N, 5 + C] output, got {:?}",
                output.shape
            )));
        }

        let mut detection = DetectionModel::new(adapter, params, ResizeType::FitToWindow, 0.5, 0.65)?;
        detection.base = detection.base.with_pad_value(114.0);
        Ok(Self {
            detection,
            output_name: output.name,
        })
    }

    fn grids(&self, meta: &ImageMeta) -> Vec<(f32, f32, f32)> {
        let (input_w, input_h) = meta.input_size;
        let mut grids = Vec::new();
        for stride in YOLOX_STRIDES {
            let (grid_h, grid_w) = (input_h / stride, input_w / stride);
            for y in 0..grid_h {
                for x in 0..grid_w {
                    grids.push((x as f32, y as f32, stride as f32));
                }
            }
        }
        grids
    }
}

impl Model for YOLOX {
    type Input = Array3<f32>;
    type Meta = ImageMeta;
    type Output = Vec<Detection>;

    fn architecture(&self) -> &'static str {
        "YOLOX"
    }

    fn adapter(&self) -> &dyn InferenceAdapter {
        self.detection.base.adapter()
    }

    fn preprocess(&self, image: &Array3<f32>) -> Result<(Inputs, ImageMeta)> {
        self.detection.base.preprocess(image)
    }

    fn postprocess(&self, outputs: &Outputs, meta: &ImageMeta) -> Result<Vec<Detection>> {
        let output = output_view::<Ix3>(outputs, &self.output_name)?.index_axis_move(Axis(0), 0);
        let grids = self.grids(meta);
        if output.nrows() != grids.len() || output.ncols() <= 5 {
            return Err(ModelError::Inference(format!(
                "YOLOX: output {:?} does not match {} grid cells",
                output.shape(),
                grids.len()
            )));
        }

        let threshold = self.detection.confidence_threshold;
        let mut detections = Vec::new();
        for (prediction, &(gx, gy, stride)) in output.rows().into_iter().zip(&grids) {
            let objectness = prediction[4];
            let class_scores: Vec<f32> = prediction.iter().skip(5).copied().collect();
            let Some((class, class_score)) = argmax(&class_scores) else {
                continue;
            };
            let score = objectness * class_score;
            if score < threshold {
                continue;
            }

            let cx = (prediction[0] + gx) * stride;
            let cy = (prediction[1] + gy) * stride;
            let w = prediction[2].exp() * stride;
            let h = prediction[3].exp() * stride;
            detections.push(Detection::new(
                cx - w / 2.0,
                cy - h / 2.0,
                cx + w / 2.0,
                cy + h / 2.0,
                score,
                class,
            ));
        }

        let detections = nms_per_class(detections, self.detection.iou_threshold);
        Ok(self.detection.finalize(detections, meta))
    }
}

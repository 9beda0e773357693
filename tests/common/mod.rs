#![allow(dead_code)]

use model_api::adapters::{InferenceAdapter, LayerInfo, RecordedAdapter};
use ndarray::{Array3, ArrayD, IxDyn};
use std::sync::Arc;

/// The published names, in publication order.
pub const EXPECTED_NAMES: [&str; 25] = [
    "BertEmbedding",
    "BertNamedEntityRecognition",
    "BertQuestionAnswering",
    "CenterNet",
    "CTPN",
    "DetectionWithLandmarks",
    "Deblurring",
    "DETR",
    "FaceBoxes",
    "HpeAssociativeEmbedding",
    "InputTransform",
    "MonoDepthModel",
    "OpenPose",
    "OutputTransform",
    "RESIZE_TYPES",
    "RetinaFace",
    "RetinaFacePyTorch",
    "SalientObjectDetectionModel",
    "SegmentationModel",
    "SSD",
    "UltraLightweightFaceDetection",
    "YOLO",
    "YoloV4",
    "YOLOF",
    "YOLOX",
];

/// Adapter for an NCHW image network replaying the given outputs.
pub fn image_adapter(width: i64, height: i64, outputs: Vec<(&str, ArrayD<f32>)>) -> Arc<dyn InferenceAdapter> {
    let adapter = outputs.into_iter().fold(
        RecordedAdapter::new(vec![LayerInfo::new("image", vec![1, 3, height, width])]),
        |adapter, (name, value)| adapter.with_output(name, value),
    );
    Arc::new(adapter)
}

/// `[1, 1, N, 7]` SSD detection output.
pub fn ssd_output(rows: &[[f32; 7]]) -> ArrayD<f32> {
    let mut output = ArrayD::zeros(IxDyn(&[1, 1, rows.len() + 1, 7]));
    for (i, row) in rows.iter().enumerate() {
        for (j, &value) in row.iter().enumerate() {
            output[[0, 0, i, j]] = value;
        }
    }
    output[[0, 0, rows.len(), 0]] = -1.0;
    output
}

pub fn gray_image(width: usize, height: usize) -> Array3<f32> {
    Array3::from_elem((height, width, 3), 128.0)
}

pub mod adapters;
pub mod config;
pub mod image;
pub mod models;
pub mod pipeline;
pub mod utils;
pub mod web;

// Main types
pub use config::Config;
pub use models::{ExportRegistry, ModelOutput};
pub use utils::error::ModelError;

// Published wrappers, also reachable as `models::<name>` and `models::<module>::<name>`
pub use models::{
    BertEmbedding, BertNamedEntityRecognition, BertQuestionAnswering, CenterNet, DetectionWithLandmarks,
    Deblurring, FaceBoxes, HpeAssociativeEmbedding, InputTransform, MonoDepthModel, OpenPose, OutputTransform,
    RetinaFace, RetinaFacePyTorch, SalientObjectDetectionModel, SegmentationModel,
    UltraLightweightFaceDetection, YoloV4, CTPN, DETR, RESIZE_TYPES, SSD, YOLO, YOLOF, YOLOX,
};

pub type Result<T> = std::result::Result<T, ModelError>;

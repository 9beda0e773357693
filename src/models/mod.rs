//! Model wrappers and the published export list.
//!
//! Every wrapper lives in its own module. The names below form the package's public
//! surface: each is re-exported here with `pub use`, listed in publication order in
//! [`PUBLIC_SURFACE`], and indexed with its defining module in [`EXPORTS`]. All three
//! are generated from the single declaration at the bottom of this file.

pub mod bert;
pub mod centernet;
pub mod ctpn;
pub mod deblurring;
pub mod detection_model;
pub mod detr;
pub mod faceboxes;
pub mod hpe_associative_embedding;
pub mod image_model;
pub mod manager;
pub mod model;
pub mod monodepth;
pub mod open_pose;
pub mod registry;
pub mod retinaface;
pub mod segmentation;
pub mod ssd;
pub mod ultra_lightweight_face_detection;
pub mod utils;
pub mod yolo;

pub use manager::{get_model, get_model_stats, health_check, LoadedModel, ModelInfo, ModelManager, ModelStats};
pub use model::{AnyImageModel, FromAdapter, ImageMeta, ImageModel, Model, ModelOutput, ModelParams};
pub use registry::{Export, ExportRegistry, SymbolKind};

use crate::adapters::InferenceAdapter;
use crate::Result;
use std::sync::Arc;

macro_rules! from_adapter {
    ($($model:ty),* $(,)?) => {
        $(
            impl FromAdapter for $model {
                fn from_adapter(adapter: Arc<dyn InferenceAdapter>, params: &ModelParams) -> Result<Self> {
                    <$model>::new(adapter, params)
                }
            }
        )*
    };
}

from_adapter!(
    bert::BertEmbedding,
    bert::BertNamedEntityRecognition,
    bert::BertQuestionAnswering,
    centernet::CenterNet,
    ctpn::CTPN,
    deblurring::Deblurring,
    detr::DETR,
    faceboxes::FaceBoxes,
    hpe_associative_embedding::HpeAssociativeEmbedding,
    monodepth::MonoDepthModel,
    open_pose::OpenPose,
    retinaface::RetinaFace,
    retinaface::RetinaFacePyTorch,
    segmentation::SegmentationModel,
    segmentation::SalientObjectDetectionModel,
    ssd::SSD,
    ultra_lightweight_face_detection::UltraLightweightFaceDetection,
    yolo::YOLO,
    yolo::YoloV4,
    yolo::YOLOF,
    yolo::YOLOX,
);

macro_rules! export_registry {
    (@kind $name:ident image) => { SymbolKind::ImageModel(registry::factory::<$name>) };
    (@kind $name:ident text) => { SymbolKind::TextModel };
    (@kind $name:ident data) => { SymbolKind::Type };
    (@kind $name:ident constant) => { SymbolKind::Constant };
    ($($module:ident :: $name:ident => $kind:ident),* $(,)?) => {
        $(pub use self::$module::$name;)*

        /// Published names, in publication order.
        pub const PUBLIC_SURFACE: &[&str] = &[$(stringify!($name)),*];

        /// Where each published name is defined, and what it is.
        pub const EXPORTS: &[Export] = &[$(
            Export {
                name: stringify!($name),
                module: stringify!($module),
                kind: export_registry!(@kind $name $kind),
            }
        ),*];
    };
}

export_registry! {
    bert::BertEmbedding => text,
    bert::BertNamedEntityRecognition => text,
    bert::BertQuestionAnswering => text,
    centernet::CenterNet => image,
    ctpn::CTPN => image,
    utils::DetectionWithLandmarks => data,
    deblurring::Deblurring => image,
    detr::DETR => image,
    faceboxes::FaceBoxes => image,
    hpe_associative_embedding::HpeAssociativeEmbedding => image,
    utils::InputTransform => data,
    monodepth::MonoDepthModel => image,
    open_pose::OpenPose => image,
    utils::OutputTransform => data,
    utils::RESIZE_TYPES => constant,
    retinaface::RetinaFace => image,
    retinaface::RetinaFacePyTorch => image,
    segmentation::SalientObjectDetectionModel => image,
    segmentation::SegmentationModel => image,
    ssd::SSD => image,
    ultra_lightweight_face_detection::UltraLightweightFaceDetection => image,
    yolo::YOLO => image,
    yolo::YoloV4 => image,
    yolo::YOLOF => image,
    yolo::YOLOX => image,
}

mod common;

use common::EXPECTED_NAMES;
use model_api::models::{self, Export, ExportRegistry, SymbolKind, EXPORTS, PUBLIC_SURFACE};
use model_api::ModelError;
use std::any::TypeId;
use std::collections::HashSet;

#[test]
fn surface_lists_every_name_in_order() {
    assert_eq!(PUBLIC_SURFACE, EXPECTED_NAMES);
}

#[test]
fn surface_has_no_duplicates() {
    let unique: HashSet<&str> = PUBLIC_SURFACE.iter().copied().collect();
    assert_eq!(unique.len(), PUBLIC_SURFACE.len());
    assert_eq!(PUBLIC_SURFACE.len(), 25);
}

#[test]
fn surface_and_exports_name_the_same_symbols() {
    let listed: HashSet<&str> = PUBLIC_SURFACE.iter().copied().collect();
    let exported: HashSet<&str> = EXPORTS.iter().map(|export| export.name).collect();
    assert_eq!(listed, exported);
}

#[test]
fn every_published_name_resolves() {
    let registry = ExportRegistry::global().unwrap();
    for name in EXPECTED_NAMES {
        let export = registry.resolve(name).unwrap();
        assert_eq!(export.name, name);
    }
    assert!(matches!(
        registry.resolve("Classification"),
        Err(ModelError::UnresolvedExport { .. })
    ));
}

#[test]
fn exports_point_at_their_defining_modules() {
    let registry = ExportRegistry::global().unwrap();
    let module_of = |name: &str| registry.resolve(name).unwrap().module;
    assert_eq!(module_of("BertQuestionAnswering"), "bert");
    assert_eq!(module_of("CTPN"), "ctpn");
    assert_eq!(module_of("DetectionWithLandmarks"), "utils");
    assert_eq!(module_of("RESIZE_TYPES"), "utils");
    assert_eq!(module_of("SalientObjectDetectionModel"), "segmentation");
    assert_eq!(module_of("UltraLightweightFaceDetection"), "ultra_lightweight_face_detection");
    assert_eq!(module_of("YOLOF"), "yolo");
}

#[test]
fn surface_naming_a_missing_symbol_fails() {
    let mut surface: Vec<&'static str> = PUBLIC_SURFACE.to_vec();
    surface.push("Classification");
    let err = ExportRegistry::from_parts(&surface, EXPORTS).unwrap_err();
    match err {
        ModelError::UnresolvedExport { name, .. } => assert_eq!(name, "Classification"),
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn exports_missing_from_the_surface_fail() {
    let surface: Vec<&'static str> = PUBLIC_SURFACE.iter().copied().filter(|&name| name != "SSD").collect();
    assert!(ExportRegistry::from_parts(&surface, EXPORTS).is_err());

    let stray = Export {
        name: "Stray",
        module: "utils",
        kind: SymbolKind::Type,
    };
    let mut exports = EXPORTS.to_vec();
    exports.push(stray);
    assert!(ExportRegistry::from_parts(PUBLIC_SURFACE, &exports).is_err());
}

#[test]
fn reexports_are_the_defining_types() {
    assert_eq!(TypeId::of::<model_api::SSD>(), TypeId::of::<models::ssd::SSD>());
    assert_eq!(TypeId::of::<models::SSD>(), TypeId::of::<models::ssd::SSD>());
    assert_eq!(TypeId::of::<model_api::YoloV4>(), TypeId::of::<models::yolo::YoloV4>());
    assert_eq!(
        TypeId::of::<model_api::DetectionWithLandmarks>(),
        TypeId::of::<models::utils::DetectionWithLandmarks>()
    );
    assert_eq!(model_api::RESIZE_TYPES, models::utils::RESIZE_TYPES);
}

mod common;

use common::{gray_image, image_adapter, ssd_output};
use image::{DynamicImage, Rgb, RgbImage};
use model_api::adapters::{LayerInfo, RecordedAdapter};
use model_api::image::ImageLoader;
use model_api::models::{ExportRegistry, ModelOutput, ModelParams};
use model_api::pipeline::AsyncPipeline;
use ndarray::{ArrayD, IxDyn};
use std::sync::Arc;

#[test]
fn ssd_built_by_name_maps_boxes_to_the_original_image() {
    let adapter = image_adapter(
        10,
        10,
        vec![(
            "detection_out",
            ssd_output(&[[0.0, 2.0, 0.9, 0.1, 0.2, 0.5, 0.6], [0.0, 1.0, 0.2, 0.0, 0.0, 1.0, 1.0]]),
        )],
    );
    let model = ExportRegistry::global()
        .unwrap()
        .create_model("SSD", adapter, &ModelParams::default())
        .unwrap();
    assert_eq!(model.architecture(), "SSD");

    match model.infer_image(&gray_image(200, 100)).unwrap() {
        ModelOutput::Detections(detections) => {
            assert_eq!(detections.len(), 1);
            let d = &detections[0];
            assert_eq!(d.id, 2);
            assert!((d.xmin - 20.0).abs() < 1e-3);
            assert!((d.ymin - 20.0).abs() < 1e-3);
            assert!((d.xmax - 100.0).abs() < 1e-3);
            assert!((d.ymax - 60.0).abs() < 1e-3);
        }
        other => panic!("unexpected {}", other.kind()),
    }
}

#[test]
fn grayscale_networks_get_single_channel_images() {
    let adapter = Arc::new(
        RecordedAdapter::new(vec![LayerInfo::new("image", vec![1, 1, 10, 10])])
            .with_output("detection_out", ssd_output(&[[0.0, 1.0, 0.9, 0.0, 0.0, 1.0, 1.0]])),
    );
    let model = ExportRegistry::global()
        .unwrap()
        .create_model("SSD", adapter, &ModelParams::default())
        .unwrap();
    assert_eq!(model.input_channels().unwrap(), 1);

    let decoded = DynamicImage::ImageRgb8(RgbImage::from_pixel(20, 20, Rgb([90, 90, 90])));
    assert!(model
        .infer_image(&ImageLoader::preprocess(decoded.clone()).unwrap())
        .is_err());

    let array = ImageLoader::preprocess_for(decoded, model.input_channels().unwrap()).unwrap();
    match model.infer_image(&array).unwrap() {
        ModelOutput::Detections(detections) => assert_eq!(detections.len(), 1),
        other => panic!("unexpected {}", other.kind()),
    }
}

#[test]
fn unknown_names_cannot_be_built() {
    let adapter = image_adapter(8, 8, vec![("out", ArrayD::zeros(IxDyn(&[1, 2])))]);
    assert!(ExportRegistry::global()
        .unwrap()
        .create_model("MaskRCNN", adapter, &ModelParams::default())
        .is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pipeline_runs_registry_models_in_order() {
    let adapter = image_adapter(10, 10, vec![("detection_out", ssd_output(&[[0.0, 1.0, 0.8, 0.0, 0.0, 0.5, 0.5]]))]);
    let model = ExportRegistry::global()
        .unwrap()
        .create_model("SSD", adapter, &ModelParams::default())
        .unwrap();
    let pipeline = AsyncPipeline::new(model, 2);

    for size in [20, 40, 80] {
        pipeline.submit(gray_image(size, size)).await.unwrap();
    }
    pipeline.wait_for_total_completion().await.unwrap();

    let mut widths = Vec::new();
    while let Some(result) = pipeline.get_result().unwrap() {
        match result.output {
            ModelOutput::Detections(detections) => widths.push(detections[0].xmax),
            other => panic!("unexpected {}", other.kind()),
        }
    }
    assert_eq!(widths, vec![10.0, 20.0, 40.0]);
}

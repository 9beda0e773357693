//! Asynchronous inference on top of the blocking wrappers.

pub mod async_pipeline;

pub use async_pipeline::{AsyncPipeline, PerformanceMetrics, RequestResult};

use crate::models::{LoadedModel, ModelOutput};
use crate::utils::error::ModelError;
use crate::Result;
use ndarray::Array3;
use std::sync::Arc;

/// One-shot inference off the async executor.
#[async_trait::async_trait]
pub trait AsyncInfer {
    async fn infer_async(&self, image: Array3<f32>) -> Result<ModelOutput>;
}

/// Waits for one of the model's request slots, then runs on the blocking pool. The slot
/// is released when inference finishes, even if the caller has gone away.
#[async_trait::async_trait]
impl AsyncInfer for LoadedModel {
    async fn infer_async(&self, image: Array3<f32>) -> Result<ModelOutput> {
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| ModelError::Internal(format!("Request slots of '{}' are closed", self.name)))?;
        let model = Arc::clone(&self.model);
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            model.infer_image(&image)
        })
        .await
        .map_err(|e| ModelError::Internal(format!("Inference task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InferenceAdapter, Inputs, Outputs, RecordedAdapter};
    use crate::models::utils::{Detection, Placement};
    use crate::models::{ImageMeta, Model};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Records how many inferences overlap.
    struct Gauge {
        adapter: RecordedAdapter,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Model for Gauge {
        type Input = Array3<f32>;
        type Meta = ImageMeta;
        type Output = Vec<Detection>;

        fn architecture(&self) -> &'static str {
            "Gauge"
        }

        fn adapter(&self) -> &dyn InferenceAdapter {
            &self.adapter
        }

        fn preprocess(&self, _image: &Array3<f32>) -> Result<(Inputs, ImageMeta)> {
            let meta = ImageMeta {
                original_size: (1, 1),
                input_size: (1, 1),
                placement: Placement {
                    scale_x: 1.0,
                    scale_y: 1.0,
                    offset_x: 0.0,
                    offset_y: 0.0,
                    resized_size: (1, 1),
                },
            };
            Ok((Inputs::new(), meta))
        }

        fn postprocess(&self, _outputs: &Outputs, _meta: &ImageMeta) -> Result<Vec<Detection>> {
            Ok(Vec::new())
        }

        fn infer_sync(&self, _image: &Array3<f32>) -> Result<Vec<Detection>> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(30));
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_respect_max_async_requests() {
        let gauge = Arc::new(Gauge {
            adapter: RecordedAdapter::new(Vec::new()),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let loaded = LoadedModel::new("gauge".to_string(), PathBuf::from("gauge.onnx"), gauge.clone(), 2);

        let requests = (0..8).map(|_| {
            let loaded = loaded.clone();
            tokio::spawn(async move { loaded.infer_async(Array3::zeros((1, 1, 3))).await })
        });
        for request in requests.collect::<Vec<_>>() {
            request.await.unwrap().unwrap();
        }

        let peak = gauge.peak.load(Ordering::SeqCst);
        assert!((1..=2).contains(&peak), "{} inferences overlapped", peak);
        assert_eq!(loaded.available_slots(), 2);
    }
}

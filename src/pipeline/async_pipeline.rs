use crate::models::{AnyImageModel, ModelOutput};
use crate::utils::error::ModelError;
use crate::Result;
use ndarray::Array3;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};

/// A finished request, delivered in submission order.
#[derive(Debug, Clone)]
pub struct RequestResult {
    pub frame_id: u64,
    pub output: ModelOutput,
    /// Time from submission to completion.
    pub latency: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct PerformanceMetrics {
    pub frames: u64,
    pub total_latency: Duration,
    first_submit: Option<Instant>,
    last_result: Option<Instant>,
}

impl PerformanceMetrics {
    fn record(&mut self, latency: Duration) {
        self.frames += 1;
        self.total_latency += latency;
        self.last_result = Some(Instant::now());
    }

    pub fn average_latency(&self) -> Duration {
        if self.frames == 0 {
            return Duration::ZERO;
        }
        self.total_latency / self.frames as u32
    }

    /// Frames delivered per second since the first submission.
    pub fn fps(&self) -> f64 {
        match (self.first_submit, self.last_result) {
            (Some(start), Some(end)) if end > start => self.frames as f64 / (end - start).as_secs_f64(),
            _ => 0.0,
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            frames: self.frames,
            average_latency_ms: self.average_latency().as_secs_f64() * 1000.0,
            fps: self.fps(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub frames: u64,
    pub average_latency_ms: f64,
    pub fps: f64,
}

#[derive(Default)]
struct State {
    next_frame_id: u64,
    next_output_id: u64,
    in_flight: usize,
    /// `None` marks a frame whose inference failed.
    completed: BTreeMap<u64, Option<RequestResult>>,
    error: Option<ModelError>,
    metrics: PerformanceMetrics,
}

/// Runs up to `max_async_requests` inferences at once and hands results back in the
/// order the frames were submitted.
pub struct AsyncPipeline {
    model: Arc<dyn AnyImageModel>,
    slots: Arc<Semaphore>,
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
}

impl AsyncPipeline {
    pub fn new(model: Arc<dyn AnyImageModel>, max_async_requests: usize) -> Self {
        let max_async_requests = max_async_requests.max(1);
        tracing::debug!(
            "Pipeline for {} with {} request slot(s)",
            model.architecture(),
            max_async_requests
        );
        Self {
            model,
            slots: Arc::new(Semaphore::new(max_async_requests)),
            state: Arc::new(Mutex::new(State::default())),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.slots.available_permits() > 0
    }

    /// Starts inference on `image` once a request slot is free and returns its frame id.
    pub async fn submit(&self, image: Array3<f32>) -> Result<u64> {
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|e| ModelError::Internal(format!("Pipeline closed: {}", e)))?;

        let submitted = Instant::now();
        let frame_id = {
            let mut state = self.state.lock();
            let id = state.next_frame_id;
            state.next_frame_id = id.wrapping_add(1);
            state.in_flight += 1;
            state.metrics.first_submit.get_or_insert(submitted);
            id
        };

        let model = Arc::clone(&self.model);
        let state = Arc::clone(&self.state);
        let notify = Arc::clone(&self.notify);
        tokio::spawn(async move {
            let outcome = tokio::task::spawn_blocking(move || model.infer_image(&image))
                .await
                .unwrap_or_else(|e| Err(ModelError::Internal(format!("Inference task failed: {}", e))));

            {
                let mut state = state.lock();
                state.in_flight -= 1;
                match outcome {
                    Ok(output) => {
                        state.completed.insert(
                            frame_id,
                            Some(RequestResult {
                                frame_id,
                                output,
                                latency: submitted.elapsed(),
                            }),
                        );
                    }
                    Err(e) => {
                        tracing::error!("Frame {} failed: {}", frame_id, e);
                        state.completed.insert(frame_id, None);
                        state.error.get_or_insert(e);
                    }
                }
            }
            drop(permit);
            notify.notify_waiters();
        });

        Ok(frame_id)
    }

    /// Next result in submission order, or `None` if it has not completed yet.
    pub fn get_result(&self) -> Result<Option<RequestResult>> {
        let mut state = self.state.lock();
        let id = state.next_output_id;
        match state.completed.remove(&id) {
            None => Ok(None),
            Some(slot) => {
                state.next_output_id = id.wrapping_add(1);
                match slot {
                    Some(result) => {
                        state.metrics.record(result.latency);
                        Ok(Some(result))
                    }
                    None => Err(state
                        .error
                        .take()
                        .unwrap_or_else(|| ModelError::Inference(format!("Frame {} failed", id)))),
                }
            }
        }
    }

    /// Waits until the next in-order result is available or nothing is in flight.
    /// Returns the first inference failure, if any.
    pub async fn wait_for_data(&self) -> Result<()> {
        self.wait_until(|state| state.completed.contains_key(&state.next_output_id) || state.in_flight == 0)
            .await
    }

    /// Waits for every submitted request to finish.
    pub async fn wait_for_total_completion(&self) -> Result<()> {
        self.wait_until(|state| state.in_flight == 0).await
    }

    async fn wait_until(&self, ready: impl Fn(&State) -> bool) -> Result<()> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if let Some(e) = state.error.take() {
                    return Err(e);
                }
                if ready(&state) {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    pub fn metrics(&self) -> PerformanceMetrics {
        self.state.lock().metrics.clone()
    }

    #[cfg(test)]
    fn set_next_frame_id(&self, id: u64) {
        let mut state = self.state.lock();
        state.next_frame_id = id;
        state.next_output_id = id;
    }
}

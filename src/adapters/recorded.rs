use super::{InferenceAdapter, InputTensor, Inputs, LayerInfo, Outputs};
use crate::utils::error::ModelError;
use crate::Result;
use ndarray::ArrayD;
use parking_lot::Mutex;

/// Adapter that replays previously recorded outputs instead of running a network.
///
/// Useful for exercising wrapper decoding against tensors captured from a real
/// session, and for dry runs of the serving stack. The most recent inputs are kept
/// for inspection.
pub struct RecordedAdapter {
    inputs: Vec<LayerInfo>,
    outputs: Vec<LayerInfo>,
    recorded: Outputs,
    last_inputs: Mutex<Option<Inputs>>,
}

impl RecordedAdapter {
    pub fn new(inputs: Vec<LayerInfo>) -> Self {
        Self {
            inputs,
            outputs: Vec::new(),
            recorded: Outputs::new(),
            last_inputs: Mutex::new(None),
        }
    }

    /// Registers an output layer together with the tensor it returns.
    pub fn with_output(mut self, name: &str, value: ArrayD<f32>) -> Self {
        let shape = value.shape().iter().map(|&d| d as i64).collect();
        self.outputs.push(LayerInfo::new(name, shape));
        self.recorded.insert(name.to_string(), value);
        self
    }

    pub fn last_inputs(&self) -> Option<Inputs> {
        self.last_inputs.lock().clone()
    }

    pub fn last_f32_input(&self, name: &str) -> Option<ArrayD<f32>> {
        match self.last_inputs.lock().as_ref()?.get(name)? {
            InputTensor::F32(array) => Some(array.clone()),
            InputTensor::I64(_) => None,
        }
    }
}

impl InferenceAdapter for RecordedAdapter {
    fn inputs(&self) -> &[LayerInfo] {
        &self.inputs
    }

    fn outputs(&self) -> &[LayerInfo] {
        &self.outputs
    }

    fn infer(&self, inputs: Inputs) -> Result<Outputs> {
        for layer in &self.inputs {
            let tensor = inputs.get(&layer.name).ok_or_else(|| {
                ModelError::Inference(format!("Missing input '{}'", layer.name))
            })?;
            let matches = tensor.shape().len() == layer.shape.len()
                && tensor
                    .shape()
                    .iter()
                    .zip(&layer.shape)
                    .all(|(&actual, &declared)| declared < 0 || actual as i64 == declared);
            if !matches {
                return Err(ModelError::Inference(format!(
                    "Input '{}' has shape {:?}, model expects {:?}",
                    layer.name,
                    tensor.shape(),
                    layer.shape
                )));
            }
        }

        *self.last_inputs.lock() = Some(inputs);
        Ok(self.recorded.clone())
    }
}

use super::{InferenceAdapter, InputTensor, Inputs, LayerInfo, Outputs};
use crate::config::OnnxConfig;
use crate::utils::error::ModelError;
use crate::Result;
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::{DynValue, Tensor},
};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;

/// ONNX Runtime backed adapter. Layer names and shapes are discovered when the session loads.
pub struct OrtAdapter {
    session: Arc<Mutex<Session>>,
    inputs: Vec<LayerInfo>,
    outputs: Vec<LayerInfo>,
}

impl OrtAdapter {
    pub fn new(model_path: &Path, config: &OnnxConfig) -> Result<Self> {
        if !model_path.exists() {
            return Err(ModelError::ModelLoad(format!(
                "Model not found: {}",
                model_path.display()
            )));
        }

        tracing::info!("Loading model from: {}", model_path.display());

        let session = Session::builder()?
            .with_optimization_level(optimization_level(config))?
            .with_intra_threads(config.intra_threads)?
            .commit_from_file(model_path)?;

        if session.outputs.is_empty() {
            return Err(ModelError::ModelLoad(format!(
                "Model {} has no outputs",
                model_path.display()
            )));
        }

        let inputs: Vec<LayerInfo> = session
            .inputs
            .iter()
            .map(|input| LayerInfo::new(input.name.clone(), tensor_shape(&input.input_type)))
            .collect();
        let outputs: Vec<LayerInfo> = session
            .outputs
            .iter()
            .map(|output| LayerInfo::new(output.name.clone(), tensor_shape(&output.output_type)))
            .collect();

        for (i, layer) in inputs.iter().enumerate() {
            tracing::debug!("Model input[{}]: '{}' {:?}", i, layer.name, layer.shape);
        }
        for (i, layer) in outputs.iter().enumerate() {
            tracing::debug!("Model output[{}]: '{}' {:?}", i, layer.name, layer.shape);
        }

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            inputs,
            outputs,
        })
    }
}

impl InferenceAdapter for OrtAdapter {
    fn inputs(&self) -> &[LayerInfo] {
        &self.inputs
    }

    fn outputs(&self) -> &[LayerInfo] {
        &self.outputs
    }

    fn infer(&self, inputs: Inputs) -> Result<Outputs> {
        let mut values: Vec<(String, DynValue)> = Vec::with_capacity(inputs.len());
        for (name, tensor) in inputs {
            let value = match tensor {
                InputTensor::F32(array) => Tensor::from_array(array)?.into_dyn(),
                InputTensor::I64(array) => Tensor::from_array(array)?.into_dyn(),
            };
            values.push((name, value));
        }

        // Extract while the session lock is held; outputs borrow the session.
        let mut session = self.session.lock();
        let results = session.run(values)?;

        let mut outputs = Outputs::with_capacity(self.outputs.len());
        for layer in &self.outputs {
            if let Some(value) = results.get(layer.name.as_str()) {
                // Integer outputs (class ids, labels) are widened to f32.
                let array = match value.try_extract_array::<f32>() {
                    Ok(array) => array.into_owned(),
                    Err(_) => match value.try_extract_array::<i64>() {
                        Ok(array) => array.mapv(|v| v as f32),
                        Err(_) => value.try_extract_array::<i32>()?.mapv(|v| v as f32),
                    },
                };
                outputs.insert(layer.name.clone(), array);
            }
        }

        Ok(outputs)
    }
}

fn optimization_level(config: &OnnxConfig) -> GraphOptimizationLevel {
    if !config.enable_optimization {
        return GraphOptimizationLevel::Disable;
    }
    match config.optimization_level {
        i32::MIN..=0 => GraphOptimizationLevel::Disable,
        1 => GraphOptimizationLevel::Level1,
        2 => GraphOptimizationLevel::Level2,
        _ => GraphOptimizationLevel::Level3,
    }
}

fn tensor_shape(value_type: &ort::value::ValueType) -> Vec<i64> {
    value_type
        .tensor_shape()
        .map(|shape| shape.iter().copied().collect())
        .unwrap_or_default()
}

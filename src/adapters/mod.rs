//! Inference adapters.
//!
//! Model wrappers never talk to a runtime directly. They hand named input tensors to an
//! [`InferenceAdapter`] and get named `f32` output tensors back, which keeps every
//! wrapper's pre- and post-processing independent of how the network is executed.

pub mod onnx;
pub mod recorded;

pub use onnx::OrtAdapter;
pub use recorded::RecordedAdapter;

use crate::Result;
use ndarray::{ArrayD, ArrayView, Dimension};
use std::collections::HashMap;

/// Named input tensors for one inference call.
pub type Inputs = HashMap<String, InputTensor>;

/// Named output tensors of one inference call.
pub type Outputs = HashMap<String, ArrayD<f32>>;

#[derive(Debug, Clone)]
pub enum InputTensor {
    F32(ArrayD<f32>),
    I64(ArrayD<i64>),
}

impl InputTensor {
    pub fn shape(&self) -> &[usize] {
        match self {
            InputTensor::F32(array) => array.shape(),
            InputTensor::I64(array) => array.shape(),
        }
    }
}

/// Name and declared shape of a model input or output. Dynamic dimensions are `-1`.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct LayerInfo {
    pub name: String,
    pub shape: Vec<i64>,
}

impl LayerInfo {
    pub fn new(name: impl Into<String>, shape: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            shape,
        }
    }
}

pub trait InferenceAdapter: Send + Sync {
    fn inputs(&self) -> &[LayerInfo];

    fn outputs(&self) -> &[LayerInfo];

    fn infer(&self, inputs: Inputs) -> Result<Outputs>;

    fn input(&self, name: &str) -> Option<&LayerInfo> {
        self.inputs().iter().find(|layer| layer.name == name)
    }

    fn output(&self, name: &str) -> Option<&LayerInfo> {
        self.outputs().iter().find(|layer| layer.name == name)
    }
}

/// Fetches an output by name as a view of fixed rank `D`.
pub fn output_view<'a, D: Dimension>(outputs: &'a Outputs, name: &str) -> Result<ArrayView<'a, f32, D>> {
    let output = take_output(outputs, name)?;
    output.view().into_dimensionality::<D>().map_err(|_| {
        crate::ModelError::Inference(format!(
            "Output '{}' has shape {:?}, expected {} dimensions",
            name,
            output.shape(),
            D::NDIM.unwrap_or(0)
        ))
    })
}

/// Fetches an output by name with a diagnostic listing what the model did produce.
pub fn take_output<'a>(outputs: &'a Outputs, name: &str) -> Result<&'a ArrayD<f32>> {
    outputs.get(name).ok_or_else(|| {
        let mut available: Vec<&str> = outputs.keys().map(String::as_str).collect();
        available.sort_unstable();
        crate::ModelError::Inference(format!(
            "Output '{}' not found. Available outputs: {:?}",
            name, available
        ))
    })
}

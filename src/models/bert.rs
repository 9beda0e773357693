//! BERT family wrappers.
//!
//! Tokenization happens outside this crate: every wrapper takes WordPiece token ids
//! (with the `[CLS]`/`[SEP]` markers already in place), pads them to the network's
//! sequence length and builds the integer input tensors the graph declares.

use crate::adapters::{output_view, take_output, InferenceAdapter, InputTensor, Inputs, LayerInfo, Outputs};
use crate::models::image_model::find_output_by_name;
use crate::models::model::{Model, ModelParams};
use crate::models::segmentation::squeeze_to;
use crate::models::utils::{argmax, softmax};
use crate::utils::error::ModelError;
use crate::Result;
use ndarray::{Array2, ArrayD, Axis, Ix2, Ix3, IxDyn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const DEFAULT_MAX_ANSWER_TOKENS: usize = 15;

/// One tokenized sequence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BertInput {
    pub input_ids: Vec<i64>,
    /// Segment ids: 0 for the first sentence (question), 1 for the second (context).
    /// Zeros when omitted.
    #[serde(default)]
    pub token_type_ids: Option<Vec<i64>>,
}

impl BertInput {
    pub fn new(input_ids: Vec<i64>) -> Self {
        Self {
            input_ids,
            token_type_ids: None,
        }
    }

    pub fn with_token_types(mut self, token_type_ids: Vec<i64>) -> Self {
        self.token_type_ids = Some(token_type_ids);
        self
    }

    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BertMeta {
    /// Number of real (unpadded) tokens.
    pub length: usize,
    /// Token range `[start, end)` holding the context, for question answering.
    pub context: (usize, usize),
}

/// Entity label predicted for one token.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenLabel {
    pub token: usize,
    pub id: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub score: f32,
}

/// Answer as an inclusive token range within the input sequence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnswerSpan {
    pub start: usize,
    pub end: usize,
    pub score: f32,
}

/// Input layer names and sequence length shared by every BERT wrapper.
struct BertModelBase {
    adapter: Arc<dyn InferenceAdapter>,
    input_ids: String,
    attention_mask: Option<String>,
    token_type_ids: Option<String>,
    position_ids: Option<String>,
    /// `None` for a dynamic sequence axis.
    sequence_length: Option<usize>,
}

impl BertModelBase {
    fn new(adapter: Arc<dyn InferenceAdapter>, model: &str) -> Result<Self> {
        let inputs = adapter.inputs();
        let find = |fragments: &[&str]| -> Option<&LayerInfo> {
            fragments
                .iter()
                .find_map(|fragment| inputs.iter().find(|l| l.name.contains(fragment)))
        };

        let ids = find(&["input_ids", "input"]).ok_or_else(|| {
            ModelError::ModelLoad(format!(
                "{}: no token id input among {:?}",
                model,
                inputs.iter().map(|l| &l.name).collect::<Vec<_>>()
            ))
        })?;
        if ids.shape.len() != 2 {
            return Err(ModelError::ModelLoad(format!(
                "{}: token ids must be [batch, sequence], got {:?}",
                model, ids.shape
            )));
        }
        let sequence_length = usize::try_from(ids.shape[1]).ok().filter(|&n| n > 0);

        let base = Self {
            input_ids: ids.name.clone(),
            attention_mask: find(&["attention_mask", "mask"]).map(|l| l.name.clone()),
            token_type_ids: find(&["token_type_ids", "segment", "type"]).map(|l| l.name.clone()),
            position_ids: find(&["position_ids", "position"]).map(|l| l.name.clone()),
            sequence_length,
            adapter,
        };
        tracing::debug!(
            "{}: sequence length {:?}, mask={:?}, types={:?}",
            model,
            base.sequence_length,
            base.attention_mask,
            base.token_type_ids
        );
        Ok(base)
    }

    fn preprocess(&self, input: &BertInput) -> Result<(Inputs, BertMeta)> {
        let length = input.len();
        if length == 0 {
            return Err(ModelError::InvalidInput("Token sequence is empty".to_string()));
        }
        let padded = self.sequence_length.unwrap_or(length);
        if length > padded {
            return Err(ModelError::InvalidInput(format!(
                "{} tokens exceed the model sequence length {}",
                length, padded
            )));
        }
        let token_types = match &input.token_type_ids {
            Some(types) if types.len() != length => {
                return Err(ModelError::InvalidInput(format!(
                    "{} token type ids for {} tokens",
                    types.len(),
                    length
                )))
            }
            Some(types) => types.clone(),
            None => vec![0; length],
        };

        let row = |values: &[i64]| -> Result<InputTensor> {
            let mut data = values.to_vec();
            data.resize(padded, 0);
            let array = ArrayD::from_shape_vec(IxDyn(&[1, padded]), data)
                .map_err(|e| ModelError::Internal(e.to_string()))?;
            Ok(InputTensor::I64(array))
        };

        let mut inputs = Inputs::new();
        inputs.insert(self.input_ids.clone(), row(&input.input_ids)?);
        if let Some(name) = &self.attention_mask {
            inputs.insert(name.clone(), row(&vec![1; length])?);
        }
        if let Some(name) = &self.token_type_ids {
            inputs.insert(name.clone(), row(&token_types)?);
        }
        if let Some(name) = &self.position_ids {
            let positions: Vec<i64> = (0..padded as i64).collect();
            inputs.insert(name.clone(), row(&positions)?);
        }

        // Context: second segment without its closing [SEP].
        let context = match token_types.iter().position(|&t| t == 1) {
            Some(start) => (start, length.saturating_sub(1).max(start)),
            None => (0, length),
        };
        Ok((inputs, BertMeta { length, context }))
    }
}

macro_rules! bert_model {
    ($name:ident, $output:ty) => {
        impl Model for $name {
            type Input = BertInput;
            type Meta = BertMeta;
            type Output = $output;

            fn architecture(&self) -> &'static str {
                stringify!($name)
            }

            fn adapter(&self) -> &dyn InferenceAdapter {
                self.base.adapter.as_ref()
            }

            fn preprocess(&self, input: &BertInput) -> Result<(Inputs, BertMeta)> {
                self.base.preprocess(input)
            }

            fn postprocess(&self, outputs: &Outputs, meta: &BertMeta) -> Result<$output> {
                self.decode(outputs, meta)
            }
        }
    };
}

/// Sentence or token embeddings. A `[1, L, D]` output yields one row per real token;
/// a pooled `[1, D]` output yields a single row.
pub struct BertEmbedding {
    base: BertModelBase,
    output_name: String,
}

impl BertEmbedding {
    pub fn new(adapter: Arc<dyn InferenceAdapter>, _params: &ModelParams) -> Result<Self> {
        let output_name = adapter
            .outputs()
            .first()
            .map(|l| l.name.clone())
            .ok_or_else(|| ModelError::ModelLoad("BertEmbedding: no outputs".to_string()))?;
        let base = BertModelBase::new(adapter, "BertEmbedding")?;
        Ok(Self { base, output_name })
    }

    fn decode(&self, outputs: &Outputs, meta: &BertMeta) -> Result<Array2<f32>> {
        let output = take_output(outputs, &self.output_name)?;
        match output.ndim() {
            3 => {
                let tokens = output_view::<Ix3>(outputs, &self.output_name)?.index_axis_move(Axis(0), 0);
                let length = meta.length.min(tokens.nrows());
                Ok(tokens.slice(ndarray::s![..length, ..]).to_owned())
            }
            _ => Ok(squeeze_to(output.view(), 1, "BertEmbedding")?
                .insert_axis(Axis(0))
                .into_dimensionality::<Ix2>()
                .map_err(|e| ModelError::Inference(e.to_string()))?
                .to_owned()),
        }
    }
}

bert_model!(BertEmbedding, Array2<f32>);

/// Token classification. Label 0 is "outside any entity" and is not reported.
pub struct BertNamedEntityRecognition {
    base: BertModelBase,
    output_name: String,
    labels: Option<Vec<String>>,
}

impl BertNamedEntityRecognition {
    pub fn new(adapter: Arc<dyn InferenceAdapter>, params: &ModelParams) -> Result<Self> {
        let output_name = adapter
            .outputs()
            .iter()
            .find(|l| l.shape.len() == 3)
            .map(|l| l.name.clone())
            .ok_or_else(|| {
                ModelError::ModelLoad("BertNamedEntityRecognition: expected a [1, L, C] output".to_string())
            })?;
        let base = BertModelBase::new(adapter, "BertNamedEntityRecognition")?;
        Ok(Self {
            base,
            output_name,
            labels: params.labels.clone(),
        })
    }

    fn decode(&self, outputs: &Outputs, meta: &BertMeta) -> Result<Vec<TokenLabel>> {
        let logits = output_view::<Ix3>(outputs, &self.output_name)?.index_axis_move(Axis(0), 0);
        let entities = logits
            .rows()
            .into_iter()
            .take(meta.length)
            .enumerate()
            .filter_map(|(token, row)| {
                let (id, score) = argmax(&softmax(&row.to_vec()))?;
                (id != 0).then(|| TokenLabel {
                    token,
                    id,
                    label: self.labels.as_ref().and_then(|labels| labels.get(id).cloned()),
                    score,
                })
            })
            .collect();
        Ok(entities)
    }
}

bert_model!(BertNamedEntityRecognition, Vec<TokenLabel>);

/// Extractive question answering over `[CLS] question [SEP] context [SEP]`.
/// Returns the best span inside the context, or `None` for an empty context.
pub struct BertQuestionAnswering {
    base: BertModelBase,
    start_name: String,
    end_name: String,
    max_answer_tokens: usize,
}

impl BertQuestionAnswering {
    pub fn new(adapter: Arc<dyn InferenceAdapter>, params: &ModelParams) -> Result<Self> {
        let outputs = adapter.outputs();
        let (start_name, end_name) = match (
            find_output_by_name(outputs, "start"),
            find_output_by_name(outputs, "end"),
        ) {
            (Some(start), Some(end)) => (start.name.clone(), end.name.clone()),
            _ if outputs.len() == 2 => (outputs[0].name.clone(), outputs[1].name.clone()),
            _ => {
                return Err(ModelError::ModelLoad(
                    "BertQuestionAnswering: expected start and end logit outputs".to_string(),
                ))
            }
        };
        let base = BertModelBase::new(adapter, "BertQuestionAnswering")?;
        Ok(Self {
            base,
            start_name,
            end_name,
            max_answer_tokens: params.max_answer_token_num.unwrap_or(DEFAULT_MAX_ANSWER_TOKENS),
        })
    }

    fn logits(outputs: &Outputs, name: &str, meta: &BertMeta) -> Result<Vec<f32>> {
        let view = squeeze_to(take_output(outputs, name)?.view(), 1, "BertQuestionAnswering")?;
        let (start, end) = meta.context;
        if end > view.len() {
            return Err(ModelError::Inference(format!(
                "BertQuestionAnswering: {} logits for a context ending at {}",
                view.len(),
                end
            )));
        }
        Ok(view.iter().skip(start).take(end - start).copied().collect())
    }

    fn decode(&self, outputs: &Outputs, meta: &BertMeta) -> Result<Option<AnswerSpan>> {
        let start_scores = softmax(&Self::logits(outputs, &self.start_name, meta)?);
        let end_scores = softmax(&Self::logits(outputs, &self.end_name, meta)?);

        let mut best: Option<AnswerSpan> = None;
        for (i, &start_score) in start_scores.iter().enumerate() {
            for (j, &end_score) in end_scores
                .iter()
                .enumerate()
                .skip(i)
                .take(self.max_answer_tokens)
            {
                let score = start_score * end_score;
                if best.as_ref().map_or(true, |b| score > b.score) {
                    best = Some(AnswerSpan {
                        start: meta.context.0 + i,
                        end: meta.context.0 + j,
                        score,
                    });
                }
            }
        }
        Ok(best)
    }
}

bert_model!(BertQuestionAnswering, Option<AnswerSpan>);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::RecordedAdapter;

    fn inputs(length: i64) -> Vec<LayerInfo> {
        vec![
            LayerInfo::new("input_ids", vec![1, length]),
            LayerInfo::new("attention_mask", vec![1, length]),
            LayerInfo::new("token_type_ids", vec![1, length]),
        ]
    }

    fn i64_input(inputs: &Inputs, name: &str) -> Vec<i64> {
        match &inputs[name] {
            InputTensor::I64(array) => array.iter().copied().collect(),
            InputTensor::F32(_) => panic!("{} must be an integer tensor", name),
        }
    }

    #[test]
    fn sequences_are_padded_with_a_mask() {
        let adapter = Arc::new(
            RecordedAdapter::new(inputs(6)).with_output("embedding", ArrayD::zeros(IxDyn(&[1, 6, 2]))),
        );
        let model = BertEmbedding::new(adapter, &ModelParams::default()).unwrap();

        let (tensors, meta) = model.preprocess(&BertInput::new(vec![101, 7592, 102])).unwrap();
        assert_eq!(meta.length, 3);
        assert_eq!(i64_input(&tensors, "input_ids"), vec![101, 7592, 102, 0, 0, 0]);
        assert_eq!(i64_input(&tensors, "attention_mask"), vec![1, 1, 1, 0, 0, 0]);
        assert_eq!(i64_input(&tensors, "token_type_ids"), vec![0; 6]);

        let too_long = BertInput::new(vec![1; 7]);
        assert!(model.preprocess(&too_long).is_err());
    }

    #[test]
    fn embeddings_keep_only_real_tokens() {
        let output = ArrayD::from_shape_fn(IxDyn(&[1, 4, 2]), |idx| idx[1] as f32);
        let adapter = Arc::new(RecordedAdapter::new(inputs(4)).with_output("last_hidden_state", output));
        let model = BertEmbedding::new(adapter, &ModelParams::default()).unwrap();

        let embedding = model.infer_sync(&BertInput::new(vec![101, 5, 102])).unwrap();
        assert_eq!(embedding.dim(), (3, 2));
        assert_eq!(embedding[[2, 0]], 2.0);
    }

    #[test]
    fn entities_skip_the_outside_label() {
        let mut logits = ArrayD::zeros(IxDyn(&[1, 4, 3]));
        logits[[0, 0, 0]] = 5.0;
        logits[[0, 1, 2]] = 5.0;
        logits[[0, 2, 0]] = 5.0;
        // Padding position, must be ignored.
        logits[[0, 3, 1]] = 5.0;
        let adapter = Arc::new(RecordedAdapter::new(inputs(4)).with_output("output", logits));
        let params = ModelParams {
            labels: Some(vec!["O".into(), "B-PER".into(), "B-LOC".into()]),
            ..Default::default()
        };
        let model = BertNamedEntityRecognition::new(adapter, &params).unwrap();

        let entities = model.infer_sync(&BertInput::new(vec![101, 3000, 102])).unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].token, 1);
        assert_eq!(entities[0].label.as_deref(), Some("B-LOC"));
        assert!(entities[0].score > 0.9);
    }

    #[test]
    fn answer_span_stays_inside_the_context() {
        // [CLS] q [SEP] c1 c2 c3 [SEP] pad
        let mut start = ArrayD::zeros(IxDyn(&[1, 8]));
        let mut end = ArrayD::zeros(IxDyn(&[1, 8]));
        // The question token scores highest but is outside the context.
        start[[0, 1]] = 20.0;
        start[[0, 4]] = 8.0;
        end[[0, 5]] = 8.0;
        let adapter = Arc::new(
            RecordedAdapter::new(inputs(8))
                .with_output("output_s", start)
                .with_output("output_e", end),
        );
        let model = BertQuestionAnswering::new(adapter, &ModelParams::default()).unwrap();

        let input = BertInput::new(vec![101, 2054, 102, 7, 8, 9, 102]).with_token_types(vec![0, 0, 0, 1, 1, 1, 1]);
        let answer = model.infer_sync(&input).unwrap().unwrap();
        assert_eq!((answer.start, answer.end), (4, 5));
        assert!(answer.score > 0.9);
    }

    #[test]
    fn mismatched_token_types_are_rejected() {
        let adapter = Arc::new(
            RecordedAdapter::new(inputs(4)).with_output("embedding", ArrayD::zeros(IxDyn(&[1, 4, 2]))),
        );
        let model = BertEmbedding::new(adapter, &ModelParams::default()).unwrap();
        let input = BertInput::new(vec![101, 102]).with_token_types(vec![0]);
        assert!(model.preprocess(&input).is_err());
    }
}

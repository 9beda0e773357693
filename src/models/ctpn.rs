use crate::adapters::{output_view, InferenceAdapter, Inputs, LayerInfo, Outputs};
use crate::models::detection_model::DetectionModel;
use crate::models::image_model::expect_output_count;
use crate::models::model::{ImageMeta, Model, ModelParams};
use crate::models::utils::{nms, Detection, ResizeType};
use crate::utils::error::ModelError;
use crate::Result;
use ndarray::{Array3, ArrayView3, Axis, Ix4};
use std::sync::Arc;

const ANCHOR_HEIGHTS: [f32; 10] = [11.0, 16.0, 23.0, 33.0, 48.0, 68.0, 97.0, 139.0, 198.0, 283.0];
const ANCHOR_WIDTH: f32 = 16.0;
const STRIDE: usize = 16;
const PROPOSAL_THRESHOLD: f32 = 0.7;
const PROPOSAL_NMS: f32 = 0.2;
const MAX_HORIZONTAL_GAP: f32 = 50.0;
const MIN_VERTICAL_OVERLAP: f32 = 0.7;
const MIN_SIZE_SIMILARITY: f32 = 0.7;
const MIN_PROPOSALS_PER_LINE: usize = 2;

/// Where the anchor axis lives in an output tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    ChannelsFirst,
    ChannelsLast,
}

/// Connectionist Text Proposal Network: fixed-width vertical text proposals chained into
/// horizontal text lines.
#[allow(clippy::upper_case_acronyms)]
pub struct CTPN {
    detection: DetectionModel,
    scores: String,
    deltas: String,
    layout: Layout,
}

impl CTPN {
    pub fn new(adapter: Arc<dyn InferenceAdapter>, params: &ModelParams) -> Result<Self> {
        expect_output_count(adapter.as_ref(), 2, "CTPN")?;
        let (scores, deltas, layout) = Self::identify_outputs(adapter.outputs())?;
        let detection = DetectionModel::new(adapter, params, ResizeType::FitToWindow, 0.9, 0.7)?;
        Ok(Self {
            detection,
            scores,
            deltas,
            layout,
        })
    }

    fn identify_outputs(outputs: &[LayerInfo]) -> Result<(String, String, Layout)> {
        let anchors = ANCHOR_HEIGHTS.len() as i64;
        let layer = |channels: i64| {
            outputs.iter().find_map(|l| match l.shape.as_slice() {
                [_, c, _, _] if *c == channels => Some((l.name.clone(), Layout::ChannelsFirst)),
                [_, _, _, c] if *c == channels => Some((l.name.clone(), Layout::ChannelsLast)),
                _ => None,
            })
        };
        match (layer(2 * anchors), layer(4 * anchors)) {
            (Some((scores, layout)), Some((deltas, deltas_layout))) if layout == deltas_layout => {
                Ok((scores, deltas, layout))
            }
            _ => Err(ModelError::ModelLoad(format!(
                "CTPN: expected score and box outputs with {} and {} channels, got {:?}",
                2 * anchors,
                4 * anchors,
                outputs.iter().map(|l| (&l.name, &l.shape)).collect::<Vec<_>>()
            ))),
        }
    }

    /// `[channels, height, width]` view regardless of the exported layout.
    fn channels_first<'a>(&self, outputs: &'a Outputs, name: &str) -> Result<ArrayView3<'a, f32>> {
        let view = output_view::<Ix4>(outputs, name)?.index_axis_move(Axis(0), 0);
        Ok(match self.layout {
            Layout::ChannelsFirst => view,
            Layout::ChannelsLast => view.permuted_axes([2, 0, 1]),
        })
    }

    fn proposals(&self, outputs: &Outputs, meta: &ImageMeta) -> Result<Vec<Detection>> {
        let scores = self.channels_first(outputs, &self.scores)?;
        let deltas = self.channels_first(outputs, &self.deltas)?;
        let (_, height, width) = scores.dim();
        let (input_w, input_h) = (meta.input_size.0 as f32, meta.input_size.1 as f32);

        let mut proposals = Vec::new();
        for row in 0..height {
            for col in 0..width {
                for (a, &anchor_h) in ANCHOR_HEIGHTS.iter().enumerate() {
                    // (background, text) pairs per anchor.
                    let score = scores[[2 * a + 1, row, col]];
                    if score < PROPOSAL_THRESHOLD {
                        continue;
                    }
                    let ctr_x = (col * STRIDE) as f32 + (ANCHOR_WIDTH - 1.0) / 2.0;
                    let anchor_ctr_y = (row * STRIDE) as f32 + (ANCHOR_WIDTH - 1.0) / 2.0;
                    let ctr_y = deltas[[4 * a + 1, row, col]] * anchor_h + anchor_ctr_y;
                    let h = deltas[[4 * a + 3, row, col]].exp() * anchor_h;

                    proposals.push(Detection::new(
                        (ctr_x - ANCHOR_WIDTH / 2.0).clamp(0.0, input_w - 1.0),
                        (ctr_y - h / 2.0).clamp(0.0, input_h - 1.0),
                        (ctr_x + ANCHOR_WIDTH / 2.0).clamp(0.0, input_w - 1.0),
                        (ctr_y + h / 2.0).clamp(0.0, input_h - 1.0),
                        score,
                        0,
                    ));
                }
            }
        }

        let keep = nms(&proposals, PROPOSAL_NMS, true, None);
        Ok(keep.into_iter().map(|i| proposals[i].clone()).collect())
    }
}

fn vertical_overlap(a: &Detection, b: &Detection) -> f32 {
    let overlap = (a.ymax.min(b.ymax) - a.ymin.max(b.ymin) + 1.0).max(0.0);
    overlap / (a.height() + 1.0).min(b.height() + 1.0)
}

fn size_similarity(a: &Detection, b: &Detection) -> f32 {
    let (ha, hb) = (a.height() + 1.0, b.height() + 1.0);
    ha.min(hb) / ha.max(hb)
}

fn same_line(a: &Detection, b: &Detection) -> bool {
    vertical_overlap(a, b) >= MIN_VERTICAL_OVERLAP && size_similarity(a, b) >= MIN_SIZE_SIMILARITY
}

/// Best neighbour of `index` in one horizontal direction: the closest column that has a
/// compatible proposal, and the highest scoring proposal in that column.
fn neighbour(proposals: &[Detection], index: usize, forward: bool) -> Option<usize> {
    let origin = &proposals[index];
    let gap = |other: &Detection| {
        if forward {
            other.xmin - origin.xmin
        } else {
            origin.xmin - other.xmin
        }
    };
    proposals
        .iter()
        .enumerate()
        .filter(|&(j, other)| {
            j != index && gap(other) >= 1.0 && gap(other) <= MAX_HORIZONTAL_GAP && same_line(origin, other)
        })
        .min_by(|&(_, a), &(_, b)| gap(a).total_cmp(&gap(b)).then(b.score.total_cmp(&a.score)))
        .map(|(j, _)| j)
}

/// Chains proposals into text lines and returns one box per line with the mean score.
fn connect(proposals: &[Detection]) -> Vec<Detection> {
    let successor: Vec<Option<usize>> = (0..proposals.len())
        .map(|i| {
            neighbour(proposals, i, true).filter(|&j| {
                // Accept the link only if no better-scoring proposal also claims `j`.
                neighbour(proposals, j, false)
                    .map_or(true, |k| proposals[k].score <= proposals[i].score)
            })
        })
        .collect();

    let mut has_predecessor = vec![false; proposals.len()];
    for j in successor.iter().flatten() {
        has_predecessor[*j] = true;
    }

    let mut lines = Vec::new();
    for start in (0..proposals.len()).filter(|&i| !has_predecessor[i]) {
        let mut members = vec![start];
        let mut current = start;
        while let Some(next) = successor[current] {
            if members.contains(&next) {
                break;
            }
            members.push(next);
            current = next;
        }
        if members.len() < MIN_PROPOSALS_PER_LINE {
            continue;
        }

        let boxes: Vec<&Detection> = members.iter().map(|&m| &proposals[m]).collect();
        let fold = |init: f32, f: fn(f32, f32) -> f32, get: fn(&Detection) -> f32| {
            boxes.iter().map(|d| get(d)).fold(init, f)
        };
        let score = boxes.iter().map(|d| d.score).sum::<f32>() / boxes.len() as f32;
        lines.push(Detection::new(
            fold(f32::INFINITY, f32::min, |d| d.xmin),
            fold(f32::INFINITY, f32::min, |d| d.ymin),
            fold(f32::NEG_INFINITY, f32::max, |d| d.xmax),
            fold(f32::NEG_INFINITY, f32::max, |d| d.ymax),
            score,
            0,
        ));
    }
    lines
}

impl Model for CTPN {
    type Input = Array3<f32>;
    type Meta = ImageMeta;
    type Output = Vec<Detection>;

    fn architecture(&self) -> &'static str {
        "CTPN"
    }

    fn adapter(&self) -> &dyn InferenceAdapter {
        self.detection.base.adapter()
    }

    fn preprocess(&self, image: &Array3<f32>) -> Result<(Inputs, ImageMeta)> {
        self.detection.base.preprocess(image)
    }

    fn postprocess(&self, outputs: &Outputs, meta: &ImageMeta) -> Result<Vec<Detection>> {
        let proposals = self.proposals(outputs, meta)?;
        let lines: Vec<Detection> = connect(&proposals)
            .into_iter()
            .filter(|line| line.score >= self.detection.confidence_threshold)
            .collect();
        let keep = nms(&lines, self.detection.iou_threshold, false, None);
        let lines = keep.into_iter().map(|i| lines[i].clone()).collect();
        tracing::trace!("CTPN: {} proposals", proposals.len());
        Ok(self.detection.finalize(lines, meta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::RecordedAdapter;
    use ndarray::{ArrayD, IxDyn};

    #[test]
    fn proposals_in_a_row_become_one_line() {
        let proposals = vec![
            Detection::new(0.0, 10.0, 15.0, 30.0, 0.95, 0),
            Detection::new(16.0, 10.0, 31.0, 30.0, 0.93, 0),
            Detection::new(32.0, 11.0, 47.0, 31.0, 0.97, 0),
            // Too far to the right and on another line.
            Detection::new(200.0, 100.0, 215.0, 120.0, 0.99, 0),
        ];
        let lines = connect(&proposals);
        assert_eq!(lines.len(), 1);
        let line = &lines[0];
        assert_eq!((line.xmin, line.ymin, line.xmax, line.ymax), (0.0, 10.0, 47.0, 31.0));
        assert!((line.score - 0.95).abs() < 1e-5);
    }

    #[test]
    fn decodes_channels_last_outputs() {
        // 48x32 input: a 2x3 grid of 16 px cells.
        let mut scores = ArrayD::zeros(IxDyn(&[1, 2, 3, 20]));
        let deltas = ArrayD::zeros(IxDyn(&[1, 2, 3, 40]));
        // Anchor 1 (16 px high) fires along the top row.
        for col in 0..3 {
            scores[[0, 0, col, 3]] = 0.99;
        }
        let adapter = Arc::new(
            RecordedAdapter::new(vec![LayerInfo::new("image", vec![1, 32, 48, 3])])
                .with_output("rpn_cls_prob_reshape", scores)
                .with_output("rpn_bbox_pred", deltas),
        );
        let model = CTPN::new(adapter, &ModelParams::default()).unwrap();

        let lines = model.infer_sync(&Array3::zeros((32, 48, 3))).unwrap();
        assert_eq!(lines.len(), 1);
        let line = &lines[0];
        assert!((line.xmin - 0.0).abs() < 1e-4);
        assert!((line.xmax - 47.0).abs() < 1e-4);
        assert!((line.score - 0.99).abs() < 1e-5);
    }
}

use crate::adapters::{take_output, InferenceAdapter, Inputs, LayerInfo, Outputs};
use crate::models::image_model::{find_output_by_name, ImageModelBase};
use crate::models::model::{ImageMeta, Model, ModelParams};
use crate::models::open_pose::{cell_to_input, local_maxima};
use crate::models::segmentation::squeeze_to;
use crate::models::utils::{Pose, ResizeType};
use crate::utils::error::ModelError;
use crate::Result;
use ndarray::{Array3, ArrayView3, Axis, Ix3};
use std::sync::Arc;

const JOINTS: usize = 17;
/// Torso and head first so limbs attach to an established identity.
const JOINT_ORDER: [usize; JOINTS] = [0, 1, 2, 3, 4, 5, 6, 11, 12, 7, 8, 9, 10, 13, 14, 15, 16];
const DETECTION_THRESHOLD: f32 = 0.1;
const TAG_THRESHOLD: f32 = 1.0;
const MAX_PEOPLE: usize = 30;

#[derive(Clone, Copy)]
struct Joint {
    x: usize,
    y: usize,
    score: f32,
    tag: f32,
}

struct Group {
    joints: [Option<Joint>; JOINTS],
    tags: Vec<f32>,
}

impl Group {
    fn new(joint_index: usize, joint: Joint) -> Self {
        let mut joints = [None; JOINTS];
        joints[joint_index] = Some(joint);
        Self {
            joints,
            tags: vec![joint.tag],
        }
    }

    fn mean_tag(&self) -> f32 {
        self.tags.iter().sum::<f32>() / self.tags.len() as f32
    }

    fn add(&mut self, joint_index: usize, joint: Joint) {
        self.joints[joint_index] = Some(joint);
        self.tags.push(joint.tag);
    }
}

/// `[joints, H, W]` view of a heatmap or embedding output.
fn read_maps<'a>(outputs: &'a Outputs, name: &str) -> Result<ArrayView3<'a, f32>> {
    let mut view = take_output(outputs, name)?.view();
    // Embeddings are sometimes exported with a trailing unit dimension.
    while view.ndim() > 4 && view.shape()[view.ndim() - 1] == 1 {
        let last = view.ndim() - 1;
        view = view.index_axis_move(Axis(last), 0);
    }
    squeeze_to(view, 3, "HpeAssociativeEmbedding")?
        .into_dimensionality::<Ix3>()
        .map_err(|e| ModelError::Inference(e.to_string()))
}

/// Bottom-up pose estimation where every joint detection carries an identity tag; joints
/// whose tags agree belong to the same person (17 COCO keypoints).
pub struct HpeAssociativeEmbedding {
    base: ImageModelBase,
    heatmaps: String,
    embeddings: String,
    confidence_threshold: f32,
}

impl HpeAssociativeEmbedding {
    pub fn new(adapter: Arc<dyn InferenceAdapter>, params: &ModelParams) -> Result<Self> {
        let (heatmaps, embeddings) = Self::identify_outputs(adapter.outputs())?;
        let base = ImageModelBase::new(adapter, params, ResizeType::FitToWindow)?;
        Ok(Self {
            base,
            heatmaps,
            embeddings,
            confidence_threshold: params.confidence_or(0.1)?,
        })
    }

    fn identify_outputs(outputs: &[LayerInfo]) -> Result<(String, String)> {
        let heatmaps = outputs
            .iter()
            .find(|l| l.name.contains("heatmaps") && !l.name.contains("nms"))
            .or_else(|| find_output_by_name(outputs, "heatmaps"));
        let embeddings = find_output_by_name(outputs, "embeddings");
        match (heatmaps, embeddings) {
            (Some(heatmaps), Some(embeddings)) => Ok((heatmaps.name.clone(), embeddings.name.clone())),
            _ => Err(ModelError::ModelLoad(format!(
                "HpeAssociativeEmbedding: expected 'heatmaps' and 'embeddings' outputs, got {:?}",
                outputs.iter().map(|l| &l.name).collect::<Vec<_>>()
            ))),
        }
    }

    fn joints(heatmaps: &ArrayView3<f32>, tags: &ArrayView3<f32>, joint: usize) -> Vec<Joint> {
        let mut joints: Vec<Joint> = local_maxima(heatmaps.index_axis(Axis(0), joint), DETECTION_THRESHOLD)
            .into_iter()
            .map(|(x, y, score)| Joint {
                x,
                y,
                score,
                tag: tags[[joint, y, x]],
            })
            .collect();
        joints.truncate(MAX_PEOPLE);
        joints
    }

    fn group(heatmaps: &ArrayView3<f32>, tags: &ArrayView3<f32>) -> Vec<Group> {
        let mut groups: Vec<Group> = Vec::new();
        for &joint_index in JOINT_ORDER.iter() {
            let joints = Self::joints(heatmaps, tags, joint_index);

            let mut pairs: Vec<(usize, usize, f32)> = Vec::new();
            for (j, joint) in joints.iter().enumerate() {
                for (g, group) in groups.iter().enumerate() {
                    if group.joints[joint_index].is_some() {
                        continue;
                    }
                    let distance = (joint.tag - group.mean_tag()).abs();
                    if distance < TAG_THRESHOLD {
                        pairs.push((j, g, distance));
                    }
                }
            }
            pairs.sort_by(|a, b| a.2.total_cmp(&b.2));

            let mut assigned = vec![false; joints.len()];
            let mut filled = vec![false; groups.len()];
            for (j, g, _) in pairs {
                if assigned[j] || filled[g] {
                    continue;
                }
                groups[g].add(joint_index, joints[j]);
                assigned[j] = true;
                filled[g] = true;
            }
            for (j, joint) in joints.into_iter().enumerate() {
                if !assigned[j] {
                    groups.push(Group::new(joint_index, joint));
                }
            }
        }
        groups
    }
}

impl Model for HpeAssociativeEmbedding {
    type Input = Array3<f32>;
    type Meta = ImageMeta;
    type Output = Vec<Pose>;

    fn architecture(&self) -> &'static str {
        "HpeAssociativeEmbedding"
    }

    fn adapter(&self) -> &dyn InferenceAdapter {
        self.base.adapter()
    }

    fn preprocess(&self, image: &Array3<f32>) -> Result<(Inputs, ImageMeta)> {
        self.base.preprocess(image)
    }

    fn postprocess(&self, outputs: &Outputs, meta: &ImageMeta) -> Result<Vec<Pose>> {
        let heatmaps = read_maps(outputs, &self.heatmaps)?;
        let tags = read_maps(outputs, &self.embeddings)?;
        let (joints, height, width) = heatmaps.dim();
        if joints < JOINTS || tags.dim() != heatmaps.dim() {
            return Err(ModelError::Inference(format!(
                "HpeAssociativeEmbedding: heatmaps {:?} and embeddings {:?} disagree",
                heatmaps.shape(),
                tags.shape()
            )));
        }

        let poses = Self::group(&heatmaps, &tags)
            .into_iter()
            .map(|group| {
                let keypoints: Vec<[f32; 3]> = group
                    .joints
                    .iter()
                    .map(|joint| match joint {
                        Some(joint) => {
                            let (ix, iy) = cell_to_input(joint.x as f32, joint.y as f32, (width, height), meta);
                            let (x, y) = meta.to_original(ix, iy);
                            [x, y, joint.score]
                        }
                        None => [-1.0, -1.0, 0.0],
                    })
                    .collect();
                let score = keypoints.iter().map(|kp| kp[2]).sum::<f32>() / JOINTS as f32;
                Pose { keypoints, score }
            })
            .filter(|pose| pose.score >= self.confidence_threshold)
            .collect();
        Ok(poses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::RecordedAdapter;
    use ndarray::{ArrayD, IxDyn};

    #[test]
    fn tags_separate_people() {
        let mut heatmaps = ArrayD::zeros(IxDyn(&[1, 17, 8, 8]));
        let mut embeddings = ArrayD::zeros(IxDyn(&[1, 17, 8, 8, 1]));
        for (joint, x, y, tag) in [(0, 1, 1, 0.0), (0, 6, 6, 5.0), (1, 2, 1, 0.2), (1, 5, 6, 5.1)] {
            heatmaps[[0, joint, y, x]] = 0.9;
            embeddings[[0, joint, y, x, 0]] = tag;
        }
        let adapter = Arc::new(
            RecordedAdapter::new(vec![LayerInfo::new("image", vec![1, 3, 16, 16])])
                .with_output("heatmaps", heatmaps)
                .with_output("embeddings", embeddings),
        );
        let params = ModelParams {
            confidence_threshold: Some(0.05),
            ..Default::default()
        };
        let model = HpeAssociativeEmbedding::new(adapter, &params).unwrap();

        let mut poses = model.infer_sync(&Array3::zeros((16, 16, 3))).unwrap();
        assert_eq!(poses.len(), 2);
        poses.sort_by(|a, b| a.keypoints[0][0].total_cmp(&b.keypoints[0][0]));
        // Cell (1, 1) of an 8x8 map over a 16x16 input.
        assert_eq!(poses[0].keypoints[0], [3.0, 3.0, 0.9]);
        assert_eq!(poses[0].keypoints[1], [5.0, 3.0, 0.9]);
        assert_eq!(poses[1].keypoints[1], [11.0, 13.0, 0.9]);
        assert_eq!(poses[0].visible_keypoints(), 2);
    }

    #[test]
    fn weak_poses_are_dropped() {
        let mut heatmaps = ArrayD::zeros(IxDyn(&[1, 17, 4, 4]));
        heatmaps[[0, 0, 1, 1]] = 0.5;
        let adapter = Arc::new(
            RecordedAdapter::new(vec![LayerInfo::new("image", vec![1, 3, 8, 8])])
                .with_output("heatmaps", heatmaps)
                .with_output("embeddings", ArrayD::zeros(IxDyn(&[1, 17, 4, 4]))),
        );
        let model = HpeAssociativeEmbedding::new(adapter, &ModelParams::default()).unwrap();
        // 0.5 / 17 is below the default 0.1 pose threshold.
        assert!(model.infer_sync(&Array3::zeros((8, 8, 3))).unwrap().is_empty());
    }
}

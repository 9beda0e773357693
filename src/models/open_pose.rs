use crate::adapters::{output_view, InferenceAdapter, Inputs, LayerInfo, Outputs};
use crate::models::image_model::ImageModelBase;
use crate::models::model::{ImageMeta, Model, ModelParams};
use crate::models::utils::{Pose, ResizeType};
use crate::utils::error::ModelError;
use crate::Result;
use ndarray::{Array3, ArrayView2, ArrayView3, Axis, Ix4};
use std::sync::Arc;

const KEYPOINTS: usize = 18;
const PEAK_THRESHOLD: f32 = 0.1;
const PAF_SAMPLES: usize = 10;
const PAF_MIN_DOT: f32 = 0.05;
const PAF_MIN_VALID_RATIO: f32 = 0.8;
const MIN_KEYPOINTS_PER_POSE: usize = 3;

/// Keypoint pairs joined by a limb, and the PAF channels (x, y) describing that limb.
const LIMBS: [((usize, usize), (usize, usize)); 19] = [
    ((1, 2), (12, 13)),
    ((1, 5), (20, 21)),
    ((2, 3), (14, 15)),
    ((3, 4), (16, 17)),
    ((5, 6), (22, 23)),
    ((6, 7), (24, 25)),
    ((1, 8), (0, 1)),
    ((8, 9), (2, 3)),
    ((9, 10), (4, 5)),
    ((1, 11), (6, 7)),
    ((11, 12), (8, 9)),
    ((12, 13), (10, 11)),
    ((1, 0), (28, 29)),
    ((0, 14), (30, 31)),
    ((14, 16), (34, 35)),
    ((0, 15), (32, 33)),
    ((15, 17), (36, 37)),
    ((2, 16), (18, 19)),
    ((5, 17), (26, 27)),
];

/// Local maxima of `plane` above `threshold` as `(x, y, value)`, strongest first.
pub(crate) fn local_maxima(plane: ArrayView2<f32>, threshold: f32) -> Vec<(usize, usize, f32)> {
    let (height, width) = plane.dim();
    let mut peaks = Vec::new();
    for y in 0..height {
        for x in 0..width {
            let value = plane[[y, x]];
            if value <= threshold {
                continue;
            }
            let neighbours_lower = (y.saturating_sub(1)..(y + 2).min(height))
                .flat_map(|ny| (x.saturating_sub(1)..(x + 2).min(width)).map(move |nx| (ny, nx)))
                .filter(|&(ny, nx)| (ny, nx) != (y, x))
                .all(|(ny, nx)| plane[[ny, nx]] < value || (plane[[ny, nx]] == value && (ny, nx) > (y, x)));
            if neighbours_lower {
                peaks.push((x, y, value));
            }
        }
    }
    peaks.sort_by(|a, b| b.2.total_cmp(&a.2));
    peaks
}

/// Heatmap cell centre in model-input pixels.
pub(crate) fn cell_to_input(x: f32, y: f32, map_size: (usize, usize), meta: &ImageMeta) -> (f32, f32) {
    (
        (x + 0.5) * meta.input_size.0 as f32 / map_size.0 as f32,
        (y + 0.5) * meta.input_size.1 as f32 / map_size.1 as f32,
    )
}

struct Peak {
    x: usize,
    y: usize,
    score: f32,
}

struct Person {
    slots: [Option<usize>; KEYPOINTS],
}

impl Person {
    fn count(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}

/// Bottom-up multi-person pose estimation with part affinity fields (18 COCO keypoints).
pub struct OpenPose {
    base: ImageModelBase,
    heatmaps: String,
    pafs: String,
}

impl OpenPose {
    pub fn new(adapter: Arc<dyn InferenceAdapter>, params: &ModelParams) -> Result<Self> {
        let (heatmaps, pafs) = Self::identify_outputs(adapter.outputs())?;
        let base = ImageModelBase::new(adapter, params, ResizeType::FitToWindow)?;
        Ok(Self { base, heatmaps, pafs })
    }

    fn identify_outputs(outputs: &[LayerInfo]) -> Result<(String, String)> {
        let with_channels = |channels: i64| {
            outputs
                .iter()
                .filter(|l| l.shape.len() == 4 && l.shape[1] == channels)
                .min_by_key(|l| l.name.contains("pool"))
                .map(|l| l.name.clone())
        };
        match (with_channels(KEYPOINTS as i64 + 1), with_channels(2 * LIMBS.len() as i64)) {
            (Some(heatmaps), Some(pafs)) => Ok((heatmaps, pafs)),
            _ => Err(ModelError::ModelLoad(format!(
                "OpenPose: expected heatmaps with {} and PAFs with {} channels, got {:?}",
                KEYPOINTS + 1,
                2 * LIMBS.len(),
                outputs.iter().map(|l| (&l.name, &l.shape)).collect::<Vec<_>>()
            ))),
        }
    }

    /// Mean PAF alignment along the segment `a -> b`, or `None` if too few samples agree.
    fn limb_score(pafs: &ArrayView3<f32>, channels: (usize, usize), a: &Peak, b: &Peak) -> Option<f32> {
        let (_, height, width) = pafs.dim();
        let (dx, dy) = (b.x as f32 - a.x as f32, b.y as f32 - a.y as f32);
        let norm = (dx * dx + dy * dy).sqrt();
        if norm < 1e-6 {
            return None;
        }
        let (ux, uy) = (dx / norm, dy / norm);

        let mut total = 0.0;
        let mut valid = 0;
        for i in 0..PAF_SAMPLES {
            let t = i as f32 / (PAF_SAMPLES - 1) as f32;
            let px = ((a.x as f32 + t * dx).round() as usize).min(width - 1);
            let py = ((a.y as f32 + t * dy).round() as usize).min(height - 1);
            let dot = pafs[[channels.0, py, px]] * ux + pafs[[channels.1, py, px]] * uy;
            if dot > PAF_MIN_DOT {
                total += dot;
                valid += 1;
            }
        }
        if valid as f32 / (PAF_SAMPLES as f32) < PAF_MIN_VALID_RATIO {
            return None;
        }
        Some(total / valid as f32)
    }

    fn group(&self, peaks: &[Vec<usize>], all: &[Peak], pafs: &ArrayView3<f32>) -> Vec<Person> {
        let mut persons: Vec<Person> = Vec::new();
        for &((ka, kb), channels) in LIMBS.iter() {
            let mut candidates = Vec::new();
            for &ia in &peaks[ka] {
                for &ib in &peaks[kb] {
                    if let Some(score) = Self::limb_score(pafs, channels, &all[ia], &all[ib]) {
                        candidates.push((ia, ib, score));
                    }
                }
            }
            candidates.sort_by(|a, b| b.2.total_cmp(&a.2));

            let (mut used_a, mut used_b) = (Vec::new(), Vec::new());
            for (ia, ib, _) in candidates {
                if used_a.contains(&ia) || used_b.contains(&ib) {
                    continue;
                }
                used_a.push(ia);
                used_b.push(ib);

                if let Some(person) = persons.iter_mut().find(|p| p.slots[ka] == Some(ia)) {
                    person.slots[kb].get_or_insert(ib);
                } else if let Some(person) = persons.iter_mut().find(|p| p.slots[kb] == Some(ib)) {
                    person.slots[ka].get_or_insert(ia);
                } else {
                    let mut slots = [None; KEYPOINTS];
                    slots[ka] = Some(ia);
                    slots[kb] = Some(ib);
                    persons.push(Person { slots });
                }
            }
        }
        persons
    }
}

impl Model for OpenPose {
    type Input = Array3<f32>;
    type Meta = ImageMeta;
    type Output = Vec<Pose>;

    fn architecture(&self) -> &'static str {
        "OpenPose"
    }

    fn adapter(&self) -> &dyn InferenceAdapter {
        self.base.adapter()
    }

    fn preprocess(&self, image: &Array3<f32>) -> Result<(Inputs, ImageMeta)> {
        self.base.preprocess(image)
    }

    fn postprocess(&self, outputs: &Outputs, meta: &ImageMeta) -> Result<Vec<Pose>> {
        let heatmaps = output_view::<Ix4>(outputs, &self.heatmaps)?.index_axis_move(Axis(0), 0);
        let pafs = output_view::<Ix4>(outputs, &self.pafs)?.index_axis_move(Axis(0), 0);
        let (_, height, width) = heatmaps.dim();
        if pafs.dim().1 != height || pafs.dim().2 != width {
            return Err(ModelError::Inference(format!(
                "OpenPose: heatmaps {:?} and PAFs {:?} differ in size",
                heatmaps.shape(),
                pafs.shape()
            )));
        }

        let mut all = Vec::new();
        let mut peaks = vec![Vec::new(); KEYPOINTS];
        for (k, plane) in heatmaps.axis_iter(Axis(0)).take(KEYPOINTS).enumerate() {
            for (x, y, score) in local_maxima(plane, PEAK_THRESHOLD) {
                peaks[k].push(all.len());
                all.push(Peak { x, y, score });
            }
        }

        let poses = self
            .group(&peaks, &all, &pafs)
            .into_iter()
            .filter(|person| person.count() >= MIN_KEYPOINTS_PER_POSE)
            .map(|person| {
                let keypoints: Vec<[f32; 3]> = person
                    .slots
                    .iter()
                    .map(|slot| match slot {
                        Some(i) => {
                            let peak = &all[*i];
                            let (ix, iy) = cell_to_input(peak.x as f32, peak.y as f32, (width, height), meta);
                            let (x, y) = meta.to_original(ix, iy);
                            [x, y, peak.score]
                        }
                        None => [-1.0, -1.0, 0.0],
                    })
                    .collect();
                let score = keypoints.iter().map(|kp| kp[2]).sum::<f32>() / person.count() as f32;
                Pose { keypoints, score }
            })
            .collect();
        Ok(poses)
    }
}

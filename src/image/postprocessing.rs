use crate::models::ModelOutput;
use crate::utils::error::ModelError;
use crate::Result;
use ndarray::{Array2, Array3};
use serde::Serialize;
use std::fmt::Write;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Json,
    Csv,
    /// One human-readable line per item.
    Text,
}

impl FromStr for OutputFormat {
    type Err = ModelError;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            "text" => Ok(OutputFormat::Text),
            other => Err(ModelError::InvalidInput(format!(
                "Invalid output format '{}'. Supported formats: json, csv, text",
                other
            ))),
        }
    }
}

/// A wrapper result together with how it was produced.
#[derive(Debug, Clone, Serialize)]
pub struct InferenceResult {
    pub model: String,
    pub architecture: &'static str,
    /// Seconds spent decoding, running and post-processing the image.
    pub processing_time: f32,
    pub image_size: [usize; 2],
    pub result: ModelOutput,
}

/// Renders wrapper results for the CLI and HTTP responses.
pub struct ResultFormatter;

impl ResultFormatter {
    pub fn format(result: &InferenceResult, format: OutputFormat) -> Result<String> {
        match format {
            OutputFormat::Json => Ok(serde_json::to_string_pretty(result)?),
            OutputFormat::Csv => Ok(Self::to_csv(&result.result)),
            OutputFormat::Text => Ok(Self::to_text(result)),
        }
    }

    /// CSV with one row per detection, pose keypoint or map row.
    pub fn to_csv(output: &ModelOutput) -> String {
        let mut csv = String::new();
        match output {
            ModelOutput::Detections(detections) => {
                csv.push_str("id,label,score,xmin,ymin,xmax,ymax\n");
                for d in detections {
                    let _ = writeln!(
                        csv,
                        "{},{},{:.4},{:.2},{:.2},{:.2},{:.2}",
                        d.id,
                        escape(d.label.as_deref().unwrap_or("")),
                        d.score,
                        d.xmin,
                        d.ymin,
                        d.xmax,
                        d.ymax
                    );
                }
            }
            ModelOutput::DetectionsWithLandmarks(detections) => {
                csv.push_str("id,score,xmin,ymin,xmax,ymax,landmarks\n");
                for item in detections {
                    let d = &item.detection;
                    let landmarks: Vec<String> = item
                        .landmarks
                        .iter()
                        .map(|&[x, y]| format!("{:.2} {:.2}", x, y))
                        .collect();
                    let _ = writeln!(
                        csv,
                        "{},{:.4},{:.2},{:.2},{:.2},{:.2},\"{}\"",
                        d.id,
                        d.score,
                        d.xmin,
                        d.ymin,
                        d.xmax,
                        d.ymax,
                        landmarks.join(";")
                    );
                }
            }
            ModelOutput::Poses(poses) => {
                csv.push_str("pose,pose_score,keypoint,x,y,confidence\n");
                for (p, pose) in poses.iter().enumerate() {
                    for (k, &[x, y, confidence]) in pose.keypoints.iter().enumerate() {
                        let _ = writeln!(
                            csv,
                            "{},{:.4},{},{:.2},{:.2},{:.4}",
                            p, pose.score, k, x, y, confidence
                        );
                    }
                }
            }
            ModelOutput::ClassMap(map) => write_map(&mut csv, &map.mapv(|v| v as f32), 0),
            ModelOutput::SaliencyMap(map) | ModelOutput::DepthMap(map) => write_map(&mut csv, map, 4),
            ModelOutput::Image(image) => write_image(&mut csv, image),
        }
        csv
    }

    pub fn to_text(result: &InferenceResult) -> String {
        let mut text = format!(
            "{} ({}) on {}x{} in {:.3}s: {}\n",
            result.model,
            result.architecture,
            result.image_size[0],
            result.image_size[1],
            result.processing_time,
            Self::summary(&result.result)
        );
        match &result.result {
            ModelOutput::Detections(detections) => {
                for d in detections {
                    let _ = writeln!(
                        text,
                        "  {} {:.3} [{:.1}, {:.1}, {:.1}, {:.1}]",
                        d.label.clone().unwrap_or_else(|| format!("#{}", d.id)),
                        d.score,
                        d.xmin,
                        d.ymin,
                        d.xmax,
                        d.ymax
                    );
                }
            }
            ModelOutput::DetectionsWithLandmarks(detections) => {
                for item in detections {
                    let d = &item.detection;
                    let _ = writeln!(
                        text,
                        "  {:.3} [{:.1}, {:.1}, {:.1}, {:.1}] {} landmarks",
                        d.score,
                        d.xmin,
                        d.ymin,
                        d.xmax,
                        d.ymax,
                        item.landmarks.len()
                    );
                }
            }
            ModelOutput::Poses(poses) => {
                for pose in poses {
                    let _ = writeln!(
                        text,
                        "  {:.3} with {} visible keypoints",
                        pose.score,
                        pose.visible_keypoints()
                    );
                }
            }
            _ => {}
        }
        text
    }

    /// Short description such as `3 detections` or `class map 480x640`.
    pub fn summary(output: &ModelOutput) -> String {
        match output {
            ModelOutput::Detections(d) => format!("{} detections", d.len()),
            ModelOutput::DetectionsWithLandmarks(d) => format!("{} detections with landmarks", d.len()),
            ModelOutput::Poses(p) => format!("{} poses", p.len()),
            ModelOutput::ClassMap(m) => format!("class map {}x{}", m.nrows(), m.ncols()),
            ModelOutput::SaliencyMap(m) => format!("saliency map {}x{}", m.nrows(), m.ncols()),
            ModelOutput::DepthMap(m) => format!("depth map {}x{}", m.nrows(), m.ncols()),
            ModelOutput::Image(i) => format!("image {}x{}", i.dim().0, i.dim().1),
        }
    }
}

fn escape(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn write_map(csv: &mut String, map: &Array2<f32>, precision: usize) {
    for row in map.rows() {
        let line: Vec<String> = row.iter().map(|v| format!("{:.*}", precision, v)).collect();
        csv.push_str(&line.join(","));
        csv.push('\n');
    }
}

fn write_image(csv: &mut String, image: &Array3<f32>) {
    csv.push_str("y,x,r,g,b\n");
    for ((y, x, c), value) in image.indexed_iter() {
        if c == 0 {
            let _ = write!(csv, "{},{},{}", y, x, value.round());
        } else {
            let _ = write!(csv, ",{}", value.round());
        }
        if c + 1 == image.dim().2 {
            csv.push('\n');
        }
    }
}

use log::{debug, info, warn};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::annotation::parse_ground_truth;
use crate::config::PipelineConfig;
use crate::consolidate::GLOBAL_INDEX_DIGITS;
use crate::error::{DatasetError, Result};
use crate::types::{ConsolidatedCorpus, GroundTruth, ObjectAnnotation, ObjectSource};
use crate::utils::{count_files_with_extension, create_progress_bar, find_image_by_stem, frame_stem};

/// Digits of the frame file names inside a LINEMOD `rgb` folder (`0042.png`).
pub const SOURCE_FRAME_DIGITS: usize = 4;

/// One line of a YOLO label file. All coordinates are in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorLabel {
    pub class_id: u32,
    pub x_center: f64,
    pub y_center: f64,
    pub width: f64,
    pub height: f64,
}

impl fmt::Display for DetectorLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:.6} {:.6} {:.6} {:.6}",
            self.class_id, self.x_center, self.y_center, self.width, self.height
        )
    }
}

/// Which objects of a frame end up in its label file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelPolicy {
    /// Every object whose class is in the class-id map.
    AllObjects,
    /// Only the first object with this source class id; used when a folder
    /// holds captures of exactly one physical object.
    SingleClass { source_class_id: u32 },
}

/// Where frames are read from and labels written to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelLayout {
    pub image_dir: PathBuf,
    pub label_dir: PathBuf,
    /// Zero padding of the frame file names.
    pub digits: usize,
}

impl LabelLayout {
    /// Labels next to the images of a source `rgb` folder.
    pub fn for_source(source: &ObjectSource) -> Self {
        let rgb = source.rgb_dir();
        Self {
            image_dir: rgb.clone(),
            label_dir: rgb,
            digits: SOURCE_FRAME_DIGITS,
        }
    }

    /// Labels next to the images of a consolidated folder.
    pub fn for_consolidated(dir: &Path) -> Self {
        Self {
            image_dir: dir.to_path_buf(),
            label_dir: dir.to_path_buf(),
            digits: GLOBAL_INDEX_DIGITS,
        }
    }
}

// Counters of one encoding run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LabelSummary {
    pub frames: usize,
    pub written: usize,
    pub missing_image: usize,
    pub without_objects: usize,
    /// Set when the run was skipped because that many label files existed.
    pub skipped_existing: Option<usize>,
}

// NaN maps to 0.0; `f64::clamp` would pass it through.
fn unit_interval(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Normalize a `(x_min, y_min, width, height)` pixel box against the
/// reference dimensions and clamp every value to `[0, 1]`.
pub fn calculate_bounding_box(bbox: &[f64; 4], ref_width: u32, ref_height: u32) -> (f64, f64, f64, f64) {
    let [x_min, y_min, w_box, h_box] = *bbox;
    let ref_width = f64::from(ref_width);
    let ref_height = f64::from(ref_height);

    let x_center = (x_min + w_box / 2.0) / ref_width;
    let y_center = (y_min + h_box / 2.0) / ref_height;
    let width = w_box / ref_width;
    let height = h_box / ref_height;

    (
        unit_interval(x_center),
        unit_interval(y_center),
        unit_interval(width),
        unit_interval(height),
    )
}

/// Labels of one frame under the given policy. Unmapped classes are dropped.
pub fn encode_frame(
    objects: &[ObjectAnnotation],
    config: &PipelineConfig,
    policy: LabelPolicy,
) -> Vec<DetectorLabel> {
    let mut labels = Vec::new();
    for object in objects {
        if let LabelPolicy::SingleClass { source_class_id } = policy {
            if object.object_class_id != source_class_id {
                continue;
            }
        }
        let Some(class_id) = config.target_class(object.object_class_id) else {
            continue;
        };

        let (x_center, y_center, width, height) =
            calculate_bounding_box(&object.bbox, config.ref_width, config.ref_height);
        labels.push(DetectorLabel {
            class_id,
            x_center,
            y_center,
            width,
            height,
        });

        if matches!(policy, LabelPolicy::SingleClass { .. }) {
            break;
        }
    }
    labels
}

/// Label file content: one line per label, newline-joined.
pub fn format_label_file(labels: &[DetectorLabel]) -> String {
    labels
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Write one label file per frame that has an image and at least one
/// retained object.
///
/// Labels are normalized by the reference dimensions of `config`, never by
/// the actual image size. If `layout.label_dir` already holds more than
/// `config.label_threshold` label files nothing is written.
pub fn encode_labels(
    ground_truth: &GroundTruth,
    layout: &LabelLayout,
    config: &PipelineConfig,
    policy: LabelPolicy,
) -> Result<LabelSummary> {
    fs::create_dir_all(&layout.label_dir).map_err(|e| DatasetError::io(&layout.label_dir, e))?;

    let existing = count_files_with_extension(&layout.label_dir, "txt");
    if existing > config.label_threshold {
        info!(
            "Labels already present in {} ({} files). Skipping generation.",
            layout.label_dir.display(),
            existing
        );
        return Ok(LabelSummary {
            skipped_existing: Some(existing),
            ..LabelSummary::default()
        });
    }

    let mut summary = LabelSummary::default();
    let pb = create_progress_bar(ground_truth.len() as u64, "Labels");
    for (&frame, objects) in ground_truth {
        summary.frames += 1;
        pb.inc(1);

        let stem = frame_stem(frame, layout.digits);
        if find_image_by_stem(&layout.image_dir, &stem).is_none() {
            debug!("No image for frame {} in {}", stem, layout.image_dir.display());
            summary.missing_image += 1;
            continue;
        }

        let labels = encode_frame(objects, config, policy);
        if labels.is_empty() {
            summary.without_objects += 1;
            continue;
        }

        let label_path = layout.label_dir.join(format!("{}.txt", stem));
        fs::write(&label_path, format_label_file(&labels))
            .map_err(|e| DatasetError::io(&label_path, e))?;
        summary.written += 1;
    }
    pb.finish_with_message("Labels complete");

    info!(
        "Labels generated in {}: {} written, {} frames without image, {} without mapped object",
        layout.label_dir.display(),
        summary.written,
        summary.missing_image,
        summary.without_objects
    );
    Ok(summary)
}

/// Encode every source folder of the per-source split, writing labels next to its
/// images. A source with a missing or unusable `gt.yml` is skipped.
pub fn encode_source_labels(
    config: &PipelineConfig,
    data_dir: &Path,
    all_objects: bool,
) -> Result<Vec<(String, LabelSummary)>> {
    let mut summaries = Vec::new();
    for id in config.split_source_ids() {
        let source = ObjectSource::new(data_dir, &id);
        if !source.rgb_dir().is_dir() {
            warn!("RGB folder not found for object {}. Skipping.", id);
            continue;
        }
        let ground_truth = match parse_ground_truth(&source.ground_truth_path()) {
            Ok(ground_truth) => ground_truth,
            Err(e) => {
                warn!("Skipping labels of object {}: {}", id, e);
                continue;
            }
        };

        let policy = match (all_objects, source.object_class_id()) {
            (false, Some(source_class_id)) => LabelPolicy::SingleClass { source_class_id },
            _ => LabelPolicy::AllObjects,
        };
        info!("Generating YOLO labels for object {} ({:?})", id, policy);
        let summary = encode_labels(&ground_truth, &LabelLayout::for_source(&source), config, policy)?;
        summaries.push((id, summary));
    }
    Ok(summaries)
}

/// Encode the consolidated corpus. Frames are looked up by their image
/// index, not by their annotation index.
pub fn encode_consolidated_labels(
    corpus: &ConsolidatedCorpus,
    consolidated_dir: &Path,
    config: &PipelineConfig,
) -> Result<LabelSummary> {
    encode_labels(
        &corpus.by_image_index(),
        &LabelLayout::for_consolidated(consolidated_dir),
        config,
        LabelPolicy::AllObjects,
    )
}

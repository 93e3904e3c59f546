use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::error::Result;
use crate::geometry::{matrix_from_row_major, Quaternion};
use crate::utils::list_images;

// Image formats found in LINEMOD source folders
pub const IMG_FORMATS: &[&str] = &["png", "jpg", "jpeg"];

// Precomputed HashSet of image extensions for fast lookup
pub static IMAGE_EXTENSIONS_SET: OnceLock<HashSet<String>> = OnceLock::new();

/// Get the image extensions set
pub fn get_image_extensions_set() -> &'static HashSet<String> {
    IMAGE_EXTENSIONS_SET.get_or_init(|| IMG_FORMATS.iter().map(|ext| ext.to_lowercase()).collect())
}

/// One per-object capture folder: `<data_dir>/<id>/{rgb/, gt.yml}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSource {
    pub id: String,
    pub root: PathBuf,
}

impl ObjectSource {
    pub fn new(data_dir: &Path, id: &str) -> Self {
        Self {
            id: id.to_string(),
            root: data_dir.join(id),
        }
    }

    pub fn rgb_dir(&self) -> PathBuf {
        self.root.join("rgb")
    }

    pub fn ground_truth_path(&self) -> PathBuf {
        self.root.join("gt.yml")
    }

    /// The `obj_id` this folder was captured for (`"05"` → 5).
    pub fn object_class_id(&self) -> Option<u32> {
        self.id.parse().ok()
    }

    /// Image files of the `rgb` folder in lexicographic file-name order.
    pub fn images(&self) -> Result<Vec<PathBuf>> {
        list_images(&self.rgb_dir())
    }
}

/// One object instance in one frame of a `gt.yml` file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectAnnotation {
    #[serde(rename = "obj_id")]
    pub object_class_id: u32,
    /// Row-major model-to-camera rotation.
    #[serde(rename = "cam_R_m2c")]
    pub rotation: [f64; 9],
    #[serde(rename = "cam_t_m2c")]
    pub translation: [f64; 3],
    /// `(x_min, y_min, width, height)` in source pixels.
    #[serde(rename = "obj_bb")]
    pub bbox: [f64; 4],
}

impl ObjectAnnotation {
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        matrix_from_row_major(&self.rotation)
    }
}

/// Parsed ground truth of one source folder: frame index → objects.
pub type GroundTruth = BTreeMap<usize, Vec<ObjectAnnotation>>;

// An object after consolidation: pose, derived quaternion and target class
#[derive(Debug, Clone, PartialEq)]
pub struct ConsolidatedObject {
    pub annotation: ObjectAnnotation,
    pub quaternion: Quaternion,
    /// Detector class id from the class-id map, `None` when unmapped.
    pub class_id: Option<u32>,
}

// A frame of the consolidated ground truth
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotatedFrame {
    /// Global index of the copied image this frame describes. Differs from
    /// the annotation index as soon as one earlier frame had no annotation.
    pub image_index: usize,
    pub objects: Vec<ConsolidatedObject>,
}

/// Consolidated ground truth keyed by annotation index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsolidatedCorpus {
    pub frames: BTreeMap<usize, AnnotatedFrame>,
}

impl ConsolidatedCorpus {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// True when the annotation indices are exactly `0..len`.
    pub fn is_contiguous(&self) -> bool {
        self.frames.keys().copied().eq(0..self.frames.len())
    }

    /// Ground truth keyed by image index, as consumed by the label encoder.
    pub fn by_image_index(&self) -> GroundTruth {
        self.frames
            .values()
            .map(|frame| {
                let objects = frame
                    .objects
                    .iter()
                    .map(|object| object.annotation.clone())
                    .collect();
                (frame.image_index, objects)
            })
            .collect()
    }
}

// Train/val partition handed to the detector trainer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitManifest {
    pub train: Vec<PathBuf>,
    pub val: Vec<PathBuf>,
    pub names: BTreeMap<u32, String>,
}

impl SplitManifest {
    pub fn len(&self) -> usize {
        self.train.len() + self.val.len()
    }

    pub fn is_empty(&self) -> bool {
        self.train.is_empty() && self.val.is_empty()
    }
}

// Struct to hold consolidation statistics
#[derive(Debug, Default, Clone)]
pub struct ConsolidationStats {
    pub sources_processed: usize,
    pub sources_skipped_excluded: usize,
    pub sources_missing_rgb: usize,
    pub ground_truth_skipped: usize,
    pub images_copied: usize,
    pub frames_annotated: usize,
    pub frames_without_annotation: usize,
    pub objects_consolidated: usize,
    pub invalid_rotations: usize,
}

impl ConsolidationStats {
    pub fn print_summary(&self) {
        log::info!("=== Consolidation Summary ===");
        log::info!("Sources processed: {}", self.sources_processed);
        log::info!("Sources excluded: {}", self.sources_skipped_excluded);
        log::info!("Images copied: {}", self.images_copied);
        log::info!("Annotated frames: {}", self.frames_annotated);
        log::info!("Objects consolidated: {}", self.objects_consolidated);

        if self.sources_missing_rgb > 0 || self.ground_truth_skipped > 0 {
            log::warn!(
                "Skipped sources (missing rgb folder: {}, unusable gt.yml: {})",
                self.sources_missing_rgb,
                self.ground_truth_skipped
            );
        }
        if self.frames_without_annotation > 0 {
            log::warn!(
                "Frames copied without annotation: {}",
                self.frames_without_annotation
            );
        }
        if self.invalid_rotations > 0 {
            log::warn!(
                "Objects with an invalid rotation matrix: {}",
                self.invalid_rotations
            );
        }
    }
}

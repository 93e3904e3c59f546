//! Global re-indexing of the per-object folders.
//!
//! Images from every non-excluded source are copied into one folder and
//! renamed to a single running index (`00000.png`, `00001.png`, ...), sources
//! in ascending id order, files in name order. The `gt.yml` files are fused
//! into one table keyed by a second counter that only advances on frames
//! with at least one complete object.
//!
//! The two counters diverge as soon as a source has a frame without
//! annotation. Both ranges stay contiguous, and every consolidated frame
//! records the image index it belongs to (`AnnotatedFrame::image_index`).

use log::{debug, info, warn};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::annotation::parse_ground_truth;
use crate::config::PipelineConfig;
use crate::error::{DatasetError, Result};
use crate::geometry::{check_rotation, rotation_to_quaternion};
use crate::types::{
    AnnotatedFrame, ConsolidatedCorpus, ConsolidatedObject, ConsolidationStats, GroundTruth,
    ObjectAnnotation, ObjectSource,
};
use crate::utils::{create_progress_bar, prepare_output_directory};

/// Decimal places kept for quaternions in the consolidated ground truth.
pub const QUATERNION_DECIMALS: i32 = 8;

/// Width of the zero-padded consolidated file names.
pub const GLOBAL_INDEX_DIGITS: usize = 5;

/// The two running indices of a consolidation run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IndexCounters {
    /// Next global image index; advances once per copied file.
    pub next_image: usize,
    /// Next annotation index; advances once per annotated frame.
    pub next_annotation: usize,
}

impl IndexCounters {
    pub fn take_image(&mut self) -> usize {
        let index = self.next_image;
        self.next_image += 1;
        index
    }

    pub fn take_annotation(&mut self) -> usize {
        let index = self.next_annotation;
        self.next_annotation += 1;
        index
    }
}

/// Images of one source and the global index of its first image.
#[derive(Debug, Clone)]
pub struct SourcePlan {
    pub source: ObjectSource,
    pub images: Vec<PathBuf>,
    pub first_index: usize,
}

impl SourcePlan {
    /// `(global index, source image)` pairs in copy order.
    pub fn indexed_images(&self) -> impl Iterator<Item = (usize, &PathBuf)> {
        self.images
            .iter()
            .enumerate()
            .map(move |(offset, image)| (self.first_index + offset, image))
    }
}

/// Expected global layout, shared by the consolidator and the verifier.
#[derive(Debug, Clone, Default)]
pub struct IndexPlan {
    pub sources: Vec<SourcePlan>,
    /// Non-excluded sources without an `rgb` folder.
    pub missing: Vec<ObjectSource>,
}

impl IndexPlan {
    pub fn total_images(&self) -> usize {
        self.sources.iter().map(|plan| plan.images.len()).sum()
    }
}

/// Compute which source file gets which global index.
pub fn plan_global_index(config: &PipelineConfig, data_dir: &Path) -> Result<IndexPlan> {
    let mut plan = IndexPlan::default();
    let mut next_index = 0;
    for id in config.active_source_ids() {
        let source = ObjectSource::new(data_dir, &id);
        if !source.rgb_dir().is_dir() {
            plan.missing.push(source);
            continue;
        }
        let images = source.images()?;
        let first_index = next_index;
        next_index += images.len();
        plan.sources.push(SourcePlan {
            source,
            images,
            first_index,
        });
    }
    Ok(plan)
}

/// File name of a consolidated image: zero-padded index plus the source
/// extension, e.g. `00042.png`.
pub fn consolidated_file_name(index: usize, source_image: &Path) -> String {
    let stem = format!("{:0width$}", index, width = GLOBAL_INDEX_DIGITS);
    match source_image.extension() {
        Some(ext) => format!("{}.{}", stem, ext.to_string_lossy()),
        None => stem,
    }
}

/// Result of a consolidation run.
#[derive(Debug, Clone, Default)]
pub struct ConsolidationReport {
    /// Number of images copied, i.e. the global index range `0..image_count`.
    pub image_count: usize,
    pub corpus: ConsolidatedCorpus,
    pub stats: ConsolidationStats,
}

impl ConsolidationReport {
    pub fn annotation_count(&self) -> usize {
        self.corpus.len()
    }

    /// How far the annotation counter fell behind the image counter.
    pub fn index_divergence(&self) -> usize {
        self.image_count.saturating_sub(self.corpus.len())
    }
}

/// Copy and re-index every source image into `output_dir` and fuse the
/// per-source ground truth.
///
/// **Destructive:** a non-empty `output_dir` is deleted and recreated before
/// anything is copied. A failing copy aborts the run with
/// [`DatasetError::Copy`] and leaves the files copied so far in place.
/// Sources with a missing or unusable `gt.yml` still have their images
/// copied; they just contribute no annotation.
pub fn consolidate(
    config: &PipelineConfig,
    data_dir: &Path,
    output_dir: &Path,
) -> Result<ConsolidationReport> {
    prepare_output_directory(output_dir)?;

    let plan = plan_global_index(config, data_dir)?;
    let mut stats = ConsolidationStats {
        sources_skipped_excluded: config
            .source_ids
            .iter()
            .filter(|id| config.is_excluded(id))
            .count(),
        sources_missing_rgb: plan.missing.len(),
        ..ConsolidationStats::default()
    };
    for source in &plan.missing {
        warn!(
            "RGB folder not found for object ID {}: {}",
            source.id,
            source.rgb_dir().display()
        );
    }

    let mut counters = IndexCounters::default();
    let mut corpus = ConsolidatedCorpus::default();
    let pb = create_progress_bar(plan.total_images() as u64, "Copy");

    for source_plan in &plan.sources {
        info!(
            "Processing object {} ({} images)",
            source_plan.source.id,
            source_plan.images.len()
        );
        let first_image_index = counters.next_image;
        copy_source_images(&source_plan.images, output_dir, &mut counters, &pb)?;
        stats.images_copied += source_plan.images.len();

        fuse_source_annotations(
            &source_plan.source,
            source_plan.images.len(),
            first_image_index,
            config,
            &mut counters,
            &mut corpus,
            &mut stats,
        );
        stats.sources_processed += 1;
    }
    pb.finish_with_message("Copy complete");

    Ok(ConsolidationReport {
        image_count: counters.next_image,
        corpus,
        stats,
    })
}

fn copy_source_images(
    images: &[PathBuf],
    output_dir: &Path,
    counters: &mut IndexCounters,
    pb: &indicatif::ProgressBar,
) -> Result<()> {
    for image in images {
        let target = output_dir.join(consolidated_file_name(counters.next_image, image));
        fs::copy(image, &target).map_err(|source| DatasetError::Copy {
            from: image.clone(),
            to: target.clone(),
            source,
        })?;
        debug!("Copied {} to {}", image.display(), target.display());
        counters.take_image();
        pb.inc(1);
    }
    Ok(())
}

// Frame `i` of a source is its `i`-th image in file-name order.
fn fuse_source_annotations(
    source: &ObjectSource,
    image_count: usize,
    first_image_index: usize,
    config: &PipelineConfig,
    counters: &mut IndexCounters,
    corpus: &mut ConsolidatedCorpus,
    stats: &mut ConsolidationStats,
) {
    let gt_path = source.ground_truth_path();
    if !gt_path.exists() {
        warn!("gt.yml not found for object {}. Skipping.", source.id);
        stats.ground_truth_skipped += 1;
        return;
    }
    let ground_truth = match parse_ground_truth(&gt_path) {
        Ok(ground_truth) => ground_truth,
        Err(e) => {
            warn!("Skipping gt.yml of object {}: {}", source.id, e);
            stats.ground_truth_skipped += 1;
            return;
        }
    };

    for frame in 0..image_count {
        let objects = match ground_truth.get(&frame) {
            Some(objects) if !objects.is_empty() => objects,
            _ => {
                stats.frames_without_annotation += 1;
                continue;
            }
        };
        let objects: Vec<ConsolidatedObject> = objects
            .iter()
            .map(|annotation| consolidate_object(annotation, config, stats))
            .collect();
        stats.frames_annotated += 1;
        stats.objects_consolidated += objects.len();

        let index = counters.take_annotation();
        corpus.frames.insert(
            index,
            AnnotatedFrame {
                image_index: first_image_index + frame,
                objects,
            },
        );
    }
}

fn consolidate_object(
    annotation: &ObjectAnnotation,
    config: &PipelineConfig,
    stats: &mut ConsolidationStats,
) -> ConsolidatedObject {
    let rotation = annotation.rotation_matrix();
    if let Err(e) = check_rotation(&rotation) {
        warn!("Object {}: {}", annotation.object_class_id, e);
        stats.invalid_rotations += 1;
    }
    ConsolidatedObject {
        annotation: annotation.clone(),
        quaternion: rotation_to_quaternion(&rotation).rounded(QUATERNION_DECIMALS),
        class_id: config.target_class(annotation.object_class_id),
    }
}

#[derive(Deserialize)]
struct ConsolidatedEntry {
    #[serde(flatten)]
    annotation: ObjectAnnotation,
    image_index: usize,
}

/// Read a file written by [`write_consolidated_ground_truth`], keyed by
/// image index so it lines up with the consolidated image names.
pub fn read_consolidated_ground_truth(path: &Path) -> Result<GroundTruth> {
    let content = fs::read_to_string(path).map_err(|e| DatasetError::io(path, e))?;
    let frames: BTreeMap<usize, Vec<ConsolidatedEntry>> =
        serde_yaml::from_str(&content).map_err(|source| DatasetError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;

    let mut ground_truth = GroundTruth::new();
    for entry in frames.into_values().flatten() {
        ground_truth
            .entry(entry.image_index)
            .or_default()
            .push(entry.annotation);
    }
    Ok(ground_truth)
}

fn format_list(values: &[f64]) -> String {
    let items: Vec<String> = values.iter().map(|v| v.to_string()).collect();
    format!("[{}]", items.join(", "))
}

/// Write the consolidated ground truth as YAML keyed by annotation index.
///
/// The output keeps the `gt.yml` key names, so it can be read back with
/// [`parse_ground_truth`]. Returns `false` (and writes nothing) for an
/// empty corpus.
pub fn write_consolidated_ground_truth(corpus: &ConsolidatedCorpus, path: &Path) -> Result<bool> {
    if corpus.is_empty() {
        warn!("No data to consolidate. {} not created.", path.display());
        return Ok(false);
    }
    let file = File::create(path).map_err(|e| DatasetError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    for (index, frame) in &corpus.frames {
        let mut entry = format!("{}:\n", index);
        for object in &frame.objects {
            let annotation = &object.annotation;
            entry.push_str(&format!(
                "- cam_R_m2c: {}\n",
                format_list(&annotation.rotation)
            ));
            entry.push_str(&format!(
                "  cam_t_m2c: {}\n",
                format_list(&annotation.translation)
            ));
            entry.push_str(&format!("  obj_bb: {}\n", format_list(&annotation.bbox)));
            entry.push_str(&format!(
                "  quaternion: {}\n",
                format_list(&object.quaternion.to_array())
            ));
            entry.push_str(&format!("  obj_id: {}\n", annotation.object_class_id));
            if let Some(class_id) = object.class_id {
                entry.push_str(&format!("  class_id: {}\n", class_id));
            }
            entry.push_str(&format!("  image_index: {}\n", frame.image_index));
        }
        writer
            .write_all(entry.as_bytes())
            .map_err(|e| DatasetError::io(path, e))?;
    }
    writer.flush().map_err(|e| DatasetError::io(path, e))?;
    info!(
        "Consolidated gt data written to {} ({} frames)",
        path.display(),
        corpus.len()
    );
    Ok(true)
}

//! Train/val splitting and the files handed to the detector trainer.
//!
//! Shuffle contract, version [`SHUFFLE_VERSION`]: the list is sorted by path,
//! then permuted with `SliceRandom::shuffle` driven by
//! `StdRng::seed_from_u64(seed)` from rand 0.8.5 (ChaCha12). The rand version
//! is pinned in Cargo.toml; changing it changes every split.

use log::{info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{PipelineConfig, SplitPolicy};
use crate::error::{DatasetError, Result};
use crate::types::{ObjectSource, SplitManifest};
use crate::utils::list_images;

pub const SHUFFLE_VERSION: u32 = 1;

/// Train fraction used by the global policy when the corpus is not larger
/// than the requested train count.
pub const FALLBACK_TRAIN_RATIO: f64 = 0.8;

/// Images of one source folder that have a label file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceGroup {
    pub id: String,
    pub images: Vec<PathBuf>,
}

/// The structured record read by the detector trainer. Field names are a
/// stable contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub path: String,
    pub train: String,
    pub val: String,
    pub names: BTreeMap<u32, String>,
}

/// Paths of the files written by [`write_split`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitOutputs {
    pub train_manifest: PathBuf,
    pub val_manifest: PathBuf,
    pub config_path: PathBuf,
}

/// Index at which a list of `len` items is cut for a train fraction.
pub fn cut_index(len: usize, ratio: f64) -> usize {
    (((len as f64) * ratio).floor() as usize).min(len)
}

/// Sort, then shuffle with a fresh RNG seeded with `seed`.
pub fn seeded_shuffle(paths: &mut [PathBuf], seed: u64) {
    paths.sort();
    let mut rng = StdRng::seed_from_u64(seed);
    paths.shuffle(&mut rng);
}

/// Pool everything, shuffle once and cut at `train_count`, or at 80% when
/// the corpus is not larger than `train_count`.
pub fn split_global(mut images: Vec<PathBuf>, train_count: usize, seed: u64) -> (Vec<PathBuf>, Vec<PathBuf>) {
    seeded_shuffle(&mut images, seed);
    let limit = if images.len() > train_count {
        train_count
    } else {
        cut_index(images.len(), FALLBACK_TRAIN_RATIO)
    };
    let val = images.split_off(limit);
    (images, val)
}

/// Split each group on its own, pool the parts, then shuffle the pools.
///
/// Every group is shuffled with a fresh RNG seeded with `seed`; the pooled
/// train list and then the pooled val list are shuffled with one more fresh
/// RNG seeded with `seed`.
pub fn split_per_source(groups: Vec<SourceGroup>, train_ratio: f64, seed: u64) -> (Vec<PathBuf>, Vec<PathBuf>) {
    let mut train = Vec::new();
    let mut val = Vec::new();

    info!("Stratified split over {} folders...", groups.len());
    for mut group in groups {
        if group.images.is_empty() {
            warn!("No labeled image in folder {}", group.id);
            continue;
        }
        seeded_shuffle(&mut group.images, seed);
        let split_idx = cut_index(group.images.len(), train_ratio);
        info!(
            "   Folder {}: {} imgs -> {} Train / {} Val",
            group.id,
            group.images.len(),
            split_idx,
            group.images.len() - split_idx
        );
        let group_val = group.images.split_off(split_idx);
        train.extend(group.images);
        val.extend(group_val);
    }

    let mut rng = StdRng::seed_from_u64(seed);
    train.shuffle(&mut rng);
    val.shuffle(&mut rng);
    (train, val)
}

/// Images in `dir` that have a `.txt` label next to them.
pub fn labeled_images(dir: &Path) -> Result<Vec<PathBuf>> {
    Ok(list_images(dir)?
        .into_iter()
        .filter(|image| image.with_extension("txt").is_file())
        .collect())
}

/// Labeled images of every source folder of the per-source split.
pub fn collect_source_groups(config: &PipelineConfig, data_dir: &Path) -> Result<Vec<SourceGroup>> {
    let mut groups = Vec::new();
    for id in config.split_source_ids() {
        let source = ObjectSource::new(data_dir, &id);
        if !source.rgb_dir().is_dir() {
            warn!("RGB folder not found for object {}. Skipping.", id);
            continue;
        }
        let images = labeled_images(&source.rgb_dir())?;
        groups.push(SourceGroup { id, images });
    }
    Ok(groups)
}

fn absolute(path: &Path) -> Result<PathBuf> {
    fs::canonicalize(path).map_err(|e| DatasetError::io(path, e))
}

/// Global policy over every image of `images_dir`.
pub fn build_global_manifest(config: &PipelineConfig, images_dir: &Path) -> Result<SplitManifest> {
    let images = list_images(&absolute(images_dir)?)?;
    info!("Found {} images in {}.", images.len(), images_dir.display());
    if images.is_empty() {
        return Err(DatasetError::EmptyCorpus {
            root: images_dir.to_path_buf(),
        });
    }
    let (train, val) = split_global(images, config.train_count, config.split_seed);
    info!("Split created: {} Train, {} Validation.", train.len(), val.len());
    Ok(SplitManifest {
        train,
        val,
        names: config.class_names.clone(),
    })
}

/// Per-source policy over the labeled images of every source folder.
pub fn build_per_source_manifest(config: &PipelineConfig, data_dir: &Path) -> Result<SplitManifest> {
    let groups = collect_source_groups(config, &absolute(data_dir)?)?;
    if groups.iter().all(|group| group.images.is_empty()) {
        return Err(DatasetError::EmptyCorpus {
            root: data_dir.to_path_buf(),
        });
    }
    let (train, val) = split_per_source(groups, config.train_ratio, config.split_seed);
    info!("TOTAL: {} Train, {} Validation.", train.len(), val.len());
    Ok(SplitManifest {
        train,
        val,
        names: config.class_names.clone(),
    })
}

/// File-name suffix distinguishing the outputs of the two policies.
pub fn output_suffix(policy: SplitPolicy) -> &'static str {
    match policy {
        SplitPolicy::Global => "",
        SplitPolicy::PerSource => "_ALL",
    }
}

fn write_manifest(paths: &[PathBuf], target: &Path) -> Result<()> {
    let content = paths
        .iter()
        .map(|path| path.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("\n");
    fs::write(target, content).map_err(|e| DatasetError::io(target, e))
}

/// Write both manifests and the detector config under `dataset_root`.
/// Returns the written paths; `config_path` is what the trainer consumes.
pub fn write_split(manifest: &SplitManifest, dataset_root: &Path, suffix: &str) -> Result<SplitOutputs> {
    let root = absolute(dataset_root)?;
    let train_manifest = root.join(format!("autosplit_train{}.txt", suffix));
    let val_manifest = root.join(format!("autosplit_val{}.txt", suffix));
    write_manifest(&manifest.train, &train_manifest)?;
    write_manifest(&manifest.val, &val_manifest)?;

    let detector_config = DetectorConfig {
        path: root.to_string_lossy().into_owned(),
        train: train_manifest.to_string_lossy().into_owned(),
        val: val_manifest.to_string_lossy().into_owned(),
        names: manifest.names.clone(),
    };
    let config_path = root.join(format!("linemod_yolo_config{}.yaml", suffix));
    let yaml = serde_yaml::to_string(&detector_config).map_err(|source| DatasetError::Yaml {
        path: config_path.clone(),
        source,
    })?;
    fs::write(&config_path, yaml).map_err(|e| DatasetError::io(&config_path, e))?;
    info!("Configuration saved in: {}", config_path.display());

    Ok(SplitOutputs {
        train_manifest,
        val_manifest,
        config_path,
    })
}

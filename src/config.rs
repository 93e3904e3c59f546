use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{DatasetError, Result};

/// Convert a LINEMOD-style pose dataset into a YOLO training corpus.
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Dataset root, the folder that contains `data/<id>/{rgb,gt.yml}`
    #[arg(short = 'd', long = "dataset_root")]
    pub dataset_root: PathBuf,

    /// YAML file overriding the built-in LINEMOD pipeline configuration
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Seed for the train/val shuffle
    #[arg(long = "seed")]
    pub seed: Option<u64>,

    /// Source ids to leave out of consolidation (comma separated, e.g. 02,03,07)
    #[arg(long = "exclude", value_delimiter = ',')]
    pub exclude: Option<Vec<String>>,

    /// Source ids to leave out of per-source labeling and splitting (e.g. 03,07)
    #[arg(long = "split_exclude", value_delimiter = ',')]
    pub split_exclude: Option<Vec<String>>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Copy every source image into one contiguously numbered folder and
    /// fuse the per-source gt.yml files. DESTROYS a non-empty output folder.
    Consolidate(ConsolidateArgs),
    /// Cross-check the consolidated folder against the source folders
    Verify(VerifyArgs),
    /// Write YOLO label files
    Labels(LabelArgs),
    /// Write the train/val manifests and the detector config
    Split(SplitArgs),
    /// Run every stage in order
    Run(RunArgs),
}

#[derive(clap::Args, Debug, Clone, Default)]
pub struct ConsolidateArgs {
    /// Output folder for the re-indexed images [default: <dataset_root>/consolidated]
    #[arg(short = 'o', long = "output_dir")]
    pub output_dir: Option<PathBuf>,

    /// Output path of the consolidated ground truth [default: <dataset_root>/consolidated_gt.yml]
    #[arg(long = "gt_output")]
    pub gt_output: Option<PathBuf>,
}

#[derive(clap::Args, Debug, Clone, Default)]
pub struct VerifyArgs {
    /// Consolidated image folder [default: <dataset_root>/consolidated]
    #[arg(long = "consolidated_dir")]
    pub consolidated_dir: Option<PathBuf>,

    /// Also write the itemized report as JSON
    #[arg(long = "report")]
    pub report: Option<PathBuf>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct LabelArgs {
    /// Which corpus to encode
    #[arg(long = "target", value_enum, default_value = "sources")]
    pub target: LabelTarget,

    /// Keep every mapped object per frame instead of only the folder's own object
    #[arg(long = "all_objects")]
    pub all_objects: bool,

    /// Consolidated image folder [default: <dataset_root>/consolidated]
    #[arg(long = "consolidated_dir")]
    pub consolidated_dir: Option<PathBuf>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct SplitArgs {
    #[arg(long = "policy", value_enum, default_value = "per-source")]
    pub policy: SplitPolicy,

    /// Folder pooled by the global policy [default: <dataset_root>/consolidated]
    #[arg(long = "images_dir")]
    pub images_dir: Option<PathBuf>,

    /// Absolute train size for the global policy
    #[arg(long = "train_count")]
    pub train_count: Option<usize>,

    /// Train fraction for the per-source policy
    #[arg(long = "train_ratio", value_parser = validate_ratio)]
    pub train_ratio: Option<f64>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    #[arg(long = "policy", value_enum, default_value = "per-source")]
    pub policy: SplitPolicy,

    /// Delete the source rgb folders once the consolidated corpus verified clean
    #[arg(long = "remove_source_images")]
    pub remove_source_images: bool,
}

// Corpus the label encoder works on
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
pub enum LabelTarget {
    /// Per-source rgb folders, labels written next to the images
    Sources,
    /// The consolidated folder
    Consolidated,
}

// Enumeration for the train/val split strategy
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
pub enum SplitPolicy {
    /// Pool every image, shuffle once, cut at the train count
    Global,
    /// Split 80/20 inside each source folder, then pool
    PerSource,
}

// Validate that the ratio is in (0.0, 1.0]
pub fn validate_ratio(s: &str) -> std::result::Result<f64, String> {
    match f64::from_str(s) {
        Ok(val) if val > 0.0 && val <= 1.0 => Ok(val),
        _ => Err("RATIO must be greater than 0.0 and at most 1.0".to_string()),
    }
}

/// Every per-run setting of the pipeline. Built once and passed by
/// reference to each stage; stages never mutate it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Two-digit source folder ids, visited in ascending order.
    pub source_ids: Vec<String>,
    /// Sources left out of consolidation.
    pub excluded_ids: BTreeSet<String>,
    /// Sources left out of per-source labeling and splitting. Folder 02 is
    /// consolidated separately in LINEMOD but still trained on.
    pub split_excluded_ids: BTreeSet<String>,
    /// Source `obj_id` → detector class id.
    pub class_id_map: BTreeMap<u32, u32>,
    /// Detector class id → human readable name.
    pub class_names: BTreeMap<u32, String>,
    pub ref_width: u32,
    pub ref_height: u32,
    pub split_seed: u64,
    /// Train size of the global split policy.
    pub train_count: usize,
    /// Train fraction of the per-source split policy.
    pub train_ratio: f64,
    /// Label encoding is skipped when a folder already holds more label files.
    pub label_threshold: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let class_id_map = [1, 2, 4, 5, 6, 8, 9, 10, 11, 12, 13, 14, 15]
            .into_iter()
            .enumerate()
            .map(|(class_id, obj_id)| (obj_id, class_id as u32))
            .collect();
        let class_names = [
            "Ape",
            "Benchvise",
            "Cam",
            "Can",
            "Cat",
            "Driller",
            "Duck",
            "Eggbox",
            "Glue",
            "Holepuncher",
            "Iron",
            "Lamp",
            "Phone",
        ]
        .into_iter()
        .enumerate()
        .map(|(class_id, name)| (class_id as u32, name.to_string()))
        .collect();

        Self {
            source_ids: (1..=15).map(|id| format!("{:02}", id)).collect(),
            excluded_ids: ["02", "03", "07"].iter().map(|id| id.to_string()).collect(),
            split_excluded_ids: ["03", "07"].iter().map(|id| id.to_string()).collect(),
            class_id_map,
            class_names,
            ref_width: 640,
            ref_height: 480,
            split_seed: 42,
            train_count: 1000,
            train_ratio: 0.8,
            label_threshold: 100,
        }
    }
}

impl PipelineConfig {
    /// Load a configuration file; keys it omits keep their default value.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| DatasetError::io(path, e))?;
        let config: PipelineConfig =
            serde_yaml::from_reader(file).map_err(|source| DatasetError::Yaml {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Build the configuration for one CLI invocation: file (or defaults),
    /// then command-line overrides.
    pub fn from_args(args: &Args) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        if let Some(seed) = args.seed {
            config.split_seed = seed;
        }
        if let Some(exclude) = &args.exclude {
            config.excluded_ids = exclude.iter().map(|id| id.trim().to_string()).collect();
        }
        if let Some(exclude) = &args.split_exclude {
            config.split_excluded_ids = exclude.iter().map(|id| id.trim().to_string()).collect();
        }
        if let Command::Split(split) = &args.command {
            if let Some(train_count) = split.train_count {
                config.train_count = train_count;
            }
            if let Some(train_ratio) = split.train_ratio {
                config.train_ratio = train_ratio;
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ref_width == 0 || self.ref_height == 0 {
            return Err(DatasetError::InvalidConfig {
                field: "ref_width/ref_height".to_string(),
                detail: format!(
                    "reference dimensions must be non-zero, got {}x{}",
                    self.ref_width, self.ref_height
                ),
            });
        }
        if !(self.train_ratio > 0.0 && self.train_ratio <= 1.0) {
            return Err(DatasetError::InvalidConfig {
                field: "train_ratio".to_string(),
                detail: format!("must be in (0, 1], got {}", self.train_ratio),
            });
        }
        if let Some(id) = self
            .source_ids
            .iter()
            .find(|id| id.len() != 2 || !id.bytes().all(|b| b.is_ascii_digit()))
        {
            return Err(DatasetError::InvalidConfig {
                field: "source_ids".to_string(),
                detail: format!("{:?} is not a two-digit id", id),
            });
        }
        Ok(())
    }

    pub fn is_excluded(&self, source_id: &str) -> bool {
        self.excluded_ids.contains(source_id)
    }

    /// Source ids taking part in consolidation, in ascending order.
    pub fn active_source_ids(&self) -> Vec<String> {
        self.sorted_ids_without(&self.excluded_ids)
    }

    /// Source ids taking part in per-source labeling and splitting, in
    /// ascending order.
    pub fn split_source_ids(&self) -> Vec<String> {
        self.sorted_ids_without(&self.split_excluded_ids)
    }

    fn sorted_ids_without(&self, excluded: &BTreeSet<String>) -> Vec<String> {
        let mut ids: Vec<String> = self
            .source_ids
            .iter()
            .filter(|id| !excluded.contains(id.as_str()))
            .cloned()
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn target_class(&self, object_class_id: u32) -> Option<u32> {
        self.class_id_map.get(&object_class_id).copied()
    }
}

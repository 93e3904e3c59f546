//! LINEMOD to YOLO dataset converter
//!
//! This library consolidates per-object LINEMOD folders into one globally
//! indexed corpus, verifies it, encodes YOLO labels and produces a
//! reproducible train/val split for detector training.

pub mod annotation;
pub mod config;
pub mod consolidate;
pub mod error;
pub mod geometry;
pub mod labels;
pub mod pipeline;
pub mod split;
pub mod types;
pub mod utils;
pub mod verify;

// Re-export commonly used types and functions
pub use annotation::parse_ground_truth;
pub use config::{Args, Command, LabelTarget, PipelineConfig, SplitPolicy};
pub use consolidate::{consolidate, ConsolidationReport, IndexCounters};
pub use error::{DatasetError, Result};
pub use geometry::{rotation_to_quaternion, Quaternion};
pub use labels::{encode_labels, DetectorLabel, LabelLayout, LabelPolicy};
pub use pipeline::{run_all, DatasetPaths};
pub use split::{split_global, split_per_source, SourceGroup};
pub use types::{ConsolidatedCorpus, GroundTruth, ObjectAnnotation, ObjectSource, SplitManifest};
pub use verify::{verify, Finding, VerificationReport};

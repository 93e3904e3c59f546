//! Reader for LINEMOD `gt.yml` files.
//!
//! The files are not uniform: most are a mapping `frame -> [objects]`, a few
//! store a bare object mapping instead of a one-element list, and some
//! single-frame files are a list wrapping `{0: [...]}`. Everything is read
//! as a [`serde_yaml::Value`] first and normalized here.

use log::{debug, warn};
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::Path;

use crate::error::{DatasetError, Result};
use crate::types::{GroundTruth, ObjectAnnotation};

/// Parse a ground-truth file into `frame index -> objects`.
///
/// Objects missing any of `cam_R_m2c`, `cam_t_m2c`, `obj_bb`, `obj_id` are
/// left out of their frame, and frames left without objects are omitted.
/// An `Err` means the whole file is unusable; callers skip the source.
pub fn parse_ground_truth(path: &Path) -> Result<GroundTruth> {
    let content = fs::read_to_string(path).map_err(|e| DatasetError::io(path, e))?;
    if content.trim().is_empty() {
        return Err(DatasetError::EmptyGroundTruth {
            path: path.to_path_buf(),
        });
    }
    let document: Value = serde_yaml::from_str(&content).map_err(|source| DatasetError::Yaml {
        path: path.to_path_buf(),
        source,
    })?;
    ground_truth_from_value(document, path)
}

/// Normalize an already parsed document. `path` is only used in messages.
pub fn ground_truth_from_value(document: Value, path: &Path) -> Result<GroundTruth> {
    match document {
        Value::Null => Err(DatasetError::EmptyGroundTruth {
            path: path.to_path_buf(),
        }),
        Value::Mapping(frames) => Ok(frames_from_mapping(frames, path)),
        Value::Sequence(entries) => Ok(frames_from_sequence(entries, path)),
        other => Err(DatasetError::UnrecognizedFormat {
            path: path.to_path_buf(),
            detail: format!("expected a mapping of frames, found {}", value_kind(&other)),
        }),
    }
}

fn frames_from_mapping(frames: Mapping, path: &Path) -> GroundTruth {
    let mut ground_truth = GroundTruth::new();
    for (key, value) in frames {
        let Some(frame) = frame_index(&key) else {
            warn!(
                "Ignoring non-numeric frame key {:?} in {}",
                key,
                path.display()
            );
            continue;
        };
        let objects = objects_from_value(value, frame, path);
        if objects.is_empty() {
            debug!("Frame {} of {} has no complete object", frame, path.display());
            continue;
        }
        ground_truth.insert(frame, objects);
    }
    ground_truth
}

// Only a list whose entry is `{0: ...}` is understood, as frame 0.
fn frames_from_sequence(entries: Vec<Value>, path: &Path) -> GroundTruth {
    let zero = Value::Number(0.into());
    let frame_zero = entries.into_iter().find_map(|entry| match entry {
        Value::Mapping(mut mapping) => mapping.remove(&zero),
        _ => None,
    });

    let mut ground_truth = GroundTruth::new();
    match frame_zero {
        Some(value) => {
            let objects = objects_from_value(value, 0, path);
            if !objects.is_empty() {
                ground_truth.insert(0, objects);
            }
        }
        None => warn!(
            "Unrecognized list layout in {}, no frame read from it",
            path.display()
        ),
    }
    ground_truth
}

fn objects_from_value(value: Value, frame: usize, path: &Path) -> Vec<ObjectAnnotation> {
    let entries = match value {
        Value::Sequence(entries) => entries,
        Value::Null => Vec::new(),
        single => vec![single],
    };
    entries
        .into_iter()
        .filter_map(|entry| match serde_yaml::from_value::<ObjectAnnotation>(entry) {
            Ok(annotation) => Some(annotation),
            Err(e) => {
                debug!(
                    "Dropping incomplete object in frame {} of {}: {}",
                    frame,
                    path.display(),
                    e
                );
                None
            }
        })
        .collect()
}

fn frame_index(key: &Value) -> Option<usize> {
    match key {
        Value::Number(n) => n.as_u64().and_then(|n| usize::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a list",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

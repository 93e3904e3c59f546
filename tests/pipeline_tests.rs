use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use linemod2yolo::consolidate::read_consolidated_ground_truth;
use linemod2yolo::labels::{encode_consolidated_labels, encode_source_labels};
use linemod2yolo::pipeline::{run_consolidation, run_split};
use linemod2yolo::split::DetectorConfig;
use linemod2yolo::verify::Severity;
use linemod2yolo::{
    consolidate, parse_ground_truth, run_all, verify, DatasetError, DatasetPaths, Finding,
    PipelineConfig, SplitPolicy,
};

const WIDTH: u32 = 8;
const HEIGHT: u32 = 6;

fn write_image(path: &Path, width: u32, height: u32) {
    image::RgbImage::new(width, height).save(path).unwrap();
}

fn object_entry(frame: usize, obj_id: u32) -> String {
    format!(
        "{}:\n- cam_R_m2c: [1, 0, 0, 0, 1, 0, 0, 0, 1]\n  cam_t_m2c: [0.0, 0.0, 1000.0]\n  obj_bb: [{}, 100, 64, 48]\n  obj_id: {}\n",
        frame,
        frame * 10,
        obj_id
    )
}

/// Create `data/<id>/rgb` with `images` PNG frames and a `gt.yml` annotating
/// the listed frames with object `obj_id`.
fn make_source(data_dir: &Path, id: &str, images: usize, annotated: &[usize], obj_id: u32) -> PathBuf {
    let source_dir = data_dir.join(id);
    let rgb = source_dir.join("rgb");
    fs::create_dir_all(&rgb).unwrap();
    for frame in 0..images {
        write_image(&rgb.join(format!("{:04}.png", frame)), WIDTH, HEIGHT);
    }
    if !annotated.is_empty() {
        let content: String = annotated
            .iter()
            .map(|&frame| object_entry(frame, obj_id))
            .collect();
        fs::write(source_dir.join("gt.yml"), content).unwrap();
    }
    source_dir
}

fn config_for(ids: &[&str]) -> PipelineConfig {
    PipelineConfig {
        source_ids: ids.iter().map(|id| id.to_string()).collect(),
        excluded_ids: BTreeSet::new(),
        split_excluded_ids: BTreeSet::new(),
        ..PipelineConfig::default()
    }
}

/// Sources 01 (four images, frame 1 unannotated) and 04 (two images).
fn diverging_dataset() -> (TempDir, DatasetPaths, PipelineConfig) {
    let temp_dir = tempfile::tempdir().unwrap();
    let paths = DatasetPaths::new(temp_dir.path());
    make_source(&paths.data_dir, "01", 4, &[0, 2, 3], 1);
    make_source(&paths.data_dir, "04", 2, &[0, 1], 4);
    (temp_dir, paths, config_for(&["01", "04"]))
}

fn write_png_with_density(path: &Path, pixels_per_metre: u32) {
    let file = fs::File::create(path).unwrap();
    let mut encoder = png::Encoder::new(std::io::BufWriter::new(file), WIDTH, HEIGHT);
    encoder.set_color(png::ColorType::Rgb);
    encoder.set_depth(png::BitDepth::Eight);
    encoder.set_pixel_dims(Some(png::PixelDimensions {
        xppu: pixels_per_metre,
        yppu: pixels_per_metre,
        unit: png::Unit::Meter,
    }));
    let mut writer = encoder.write_header().unwrap();
    writer
        .write_image_data(&vec![0u8; (WIDTH * HEIGHT * 3) as usize])
        .unwrap();
}

fn read_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

#[test]
fn test_consolidate_single_source() {
    let temp_dir = tempfile::tempdir().unwrap();
    let paths = DatasetPaths::new(temp_dir.path());
    make_source(&paths.data_dir, "02", 5, &[0, 1, 2, 3, 4], 2);

    let report = consolidate(&config_for(&["02"]), &paths.data_dir, &paths.consolidated_dir).unwrap();

    assert_eq!(report.image_count, 5);
    assert_eq!(report.annotation_count(), 5);
    assert_eq!(report.index_divergence(), 0);
    assert!(report.corpus.is_contiguous());
    for index in 0..5 {
        assert!(paths.consolidated_dir.join(format!("{:05}.png", index)).is_file());
        assert_eq!(report.corpus.frames[&index].image_index, index);
    }
    let q = report.corpus.frames[&0].objects[0].quaternion;
    assert_eq!(q.to_array(), [1.0, 0.0, 0.0, 0.0]);
}

#[test]
fn test_consolidate_counters_diverge_on_unannotated_frame() {
    let (_temp_dir, paths, config) = diverging_dataset();
    let report = consolidate(&config, &paths.data_dir, &paths.consolidated_dir).unwrap();

    assert_eq!(report.image_count, 6);
    assert_eq!(report.annotation_count(), 5);
    assert_eq!(report.index_divergence(), 1);
    assert_eq!(report.stats.frames_without_annotation, 1);
    assert!(report.corpus.is_contiguous());

    let image_indices: Vec<usize> = report
        .corpus
        .frames
        .values()
        .map(|frame| frame.image_index)
        .collect();
    assert_eq!(image_indices, vec![0, 2, 3, 4, 5]);
    assert_eq!(report.corpus.frames[&3].objects[0].class_id, Some(2));
}

#[test]
fn test_consolidate_skips_excluded_sources() {
    let temp_dir = tempfile::tempdir().unwrap();
    let paths = DatasetPaths::new(temp_dir.path());
    make_source(&paths.data_dir, "01", 3, &[0, 1, 2], 1);
    make_source(&paths.data_dir, "02", 4, &[0, 1, 2, 3], 2);

    let config = PipelineConfig {
        source_ids: vec!["01".to_string(), "02".to_string()],
        ..PipelineConfig::default()
    };
    let report = consolidate(&config, &paths.data_dir, &paths.consolidated_dir).unwrap();

    assert_eq!(report.image_count, 3);
    assert_eq!(report.stats.sources_skipped_excluded, 1);
    assert!(!paths.consolidated_dir.join("00003.png").exists());
}

#[test]
fn test_consolidate_clears_output_directory() {
    let (_temp_dir, paths, config) = diverging_dataset();
    fs::create_dir_all(&paths.consolidated_dir).unwrap();
    fs::write(paths.consolidated_dir.join("stale.txt"), "old").unwrap();

    consolidate(&config, &paths.data_dir, &paths.consolidated_dir).unwrap();
    assert!(!paths.consolidated_dir.join("stale.txt").exists());
}

#[test]
fn test_consolidate_without_ground_truth_still_copies() {
    let temp_dir = tempfile::tempdir().unwrap();
    let paths = DatasetPaths::new(temp_dir.path());
    make_source(&paths.data_dir, "05", 3, &[], 5);

    let report = consolidate(&config_for(&["05"]), &paths.data_dir, &paths.consolidated_dir).unwrap();
    assert_eq!(report.image_count, 3);
    assert!(report.corpus.is_empty());
    assert_eq!(report.stats.ground_truth_skipped, 1);
}

#[cfg(unix)]
#[test]
fn test_consolidate_stops_at_failing_copy() {
    let temp_dir = tempfile::tempdir().unwrap();
    let paths = DatasetPaths::new(temp_dir.path());
    let source_dir = make_source(&paths.data_dir, "01", 2, &[0, 1], 1);
    std::os::unix::fs::symlink(
        temp_dir.path().join("does-not-exist.png"),
        source_dir.join("rgb/0002.png"),
    )
    .unwrap();
    write_image(&source_dir.join("rgb/0003.png"), WIDTH, HEIGHT);

    let result = consolidate(&config_for(&["01"]), &paths.data_dir, &paths.consolidated_dir);
    match result {
        Err(DatasetError::Copy { from, to, .. }) => {
            assert!(from.ends_with("rgb/0002.png"));
            assert!(to.ends_with("00002.png"));
        }
        other => panic!("expected a copy error, got {:?}", other),
    }
    assert!(paths.consolidated_dir.join("00000.png").is_file());
    assert!(paths.consolidated_dir.join("00001.png").is_file());
    assert!(!paths.consolidated_dir.join("00003.png").exists());
}

#[test]
fn test_consolidated_ground_truth_round_trip() {
    let (_temp_dir, paths, config) = diverging_dataset();
    run_consolidation(&config, &paths).unwrap();
    assert!(paths.consolidated_gt.is_file());

    let by_annotation = parse_ground_truth(&paths.consolidated_gt).unwrap();
    assert_eq!(by_annotation.keys().copied().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);

    let by_image = read_consolidated_ground_truth(&paths.consolidated_gt).unwrap();
    assert_eq!(by_image.keys().copied().collect::<Vec<_>>(), vec![0, 2, 3, 4, 5]);
    assert_eq!(by_image[&2][0].bbox, [20.0, 100.0, 64.0, 48.0]);
    assert_eq!(by_image[&5][0].object_class_id, 4);
}

#[test]
fn test_verify_detects_missing_file() {
    let (_temp_dir, paths, config) = diverging_dataset();
    consolidate(&config, &paths.data_dir, &paths.consolidated_dir).unwrap();

    let report = verify(&config, &paths.data_dir, &paths.consolidated_dir).unwrap();
    assert!(report.passed());
    assert_eq!(report.checked, 6);
    assert!(report.findings.is_empty());

    fs::remove_file(paths.consolidated_dir.join("00003.png")).unwrap();
    let report = verify(&config, &paths.data_dir, &paths.consolidated_dir).unwrap();
    assert!(!report.passed());
    let failures: Vec<&Finding> = report.hard_failures().collect();
    assert_eq!(failures.len(), 1);
    match failures[0] {
        Finding::MissingFile { source, expected } => {
            assert!(expected.ends_with("00003.png"));
            assert!(source.ends_with("01/rgb/0003.png"));
        }
        other => panic!("unexpected finding {:?}", other),
    }
}

#[test]
fn test_verify_detects_size_mismatch() {
    let (_temp_dir, paths, config) = diverging_dataset();
    consolidate(&config, &paths.data_dir, &paths.consolidated_dir).unwrap();
    write_image(&paths.consolidated_dir.join("00001.png"), 4, 4);

    let report = verify(&config, &paths.data_dir, &paths.consolidated_dir).unwrap();
    assert!(!report.passed());
    assert!(matches!(
        report.findings.as_slice(),
        [Finding::SizeMismatch {
            source_size: (WIDTH, HEIGHT),
            consolidated_size: (4, 4),
            ..
        }]
    ));
}

#[test]
fn test_verify_mode_mismatch_is_not_fatal() {
    let (_temp_dir, paths, config) = diverging_dataset();
    consolidate(&config, &paths.data_dir, &paths.consolidated_dir).unwrap();
    image::GrayImage::new(WIDTH, HEIGHT)
        .save(paths.consolidated_dir.join("00001.png"))
        .unwrap();
    fs::write(paths.consolidated_dir.join("99999.png"), b"extra").unwrap();

    let report = verify(&config, &paths.data_dir, &paths.consolidated_dir).unwrap();
    assert!(report.passed());
    assert!(report
        .findings
        .iter()
        .any(|finding| matches!(finding, Finding::ModeMismatch { .. })));
    assert!(report
        .findings
        .iter()
        .any(|finding| matches!(finding, Finding::UnexpectedFiles { expected: 6, found: 7 })));
}

#[test]
fn test_verify_density_mismatch_is_informational() {
    let (_temp_dir, paths, config) = diverging_dataset();
    consolidate(&config, &paths.data_dir, &paths.consolidated_dir).unwrap();
    write_png_with_density(&paths.data_dir.join("01/rgb/0000.png"), 2835);
    write_png_with_density(&paths.consolidated_dir.join("00000.png"), 3780);

    let report = verify(&config, &paths.data_dir, &paths.consolidated_dir).unwrap();
    assert!(report.passed());
    assert_eq!(report.findings.len(), 1);
    assert_eq!(report.findings[0].severity(), Severity::Info);
    match &report.findings[0] {
        Finding::DensityMismatch {
            source_density,
            consolidated_density,
            ..
        } => {
            assert_eq!((source_density.x, source_density.unit), (2835, 1));
            assert_eq!(consolidated_density.y, 3780);
        }
        other => panic!("unexpected finding {:?}", other),
    }
}

#[test]
fn test_verify_reports_missing_source() {
    let temp_dir = tempfile::tempdir().unwrap();
    let paths = DatasetPaths::new(temp_dir.path());
    make_source(&paths.data_dir, "01", 2, &[0, 1], 1);
    let config = config_for(&["01", "04"]);
    consolidate(&config, &paths.data_dir, &paths.consolidated_dir).unwrap();

    let report = verify(&config, &paths.data_dir, &paths.consolidated_dir).unwrap();
    assert!(!report.passed());
    assert!(matches!(
        report.hard_failures().next(),
        Some(Finding::MissingSource { source_id, .. }) if source_id == "04"
    ));

    let json_path = temp_dir.path().join("report.json");
    report.write_json(&json_path).unwrap();
    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&json_path).unwrap()).unwrap();
    assert_eq!(json["checked"], 2);
    assert_eq!(json["findings"][0]["kind"], "missing_source");
}

#[test]
fn test_source_labels() {
    let temp_dir = tempfile::tempdir().unwrap();
    let data_dir = temp_dir.path().join("data");
    let source_dir = make_source(&data_dir, "01", 3, &[0, 1, 2], 1);

    let summaries = encode_source_labels(&config_for(&["01"]), &data_dir, false).unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].1.written, 3);

    let label = fs::read_to_string(source_dir.join("rgb/0000.txt")).unwrap();
    assert_eq!(label, "0 0.050000 0.258333 0.100000 0.100000");
    assert!(source_dir.join("rgb/0002.txt").is_file());
}

#[test]
fn test_source_labels_skipped_above_threshold() {
    let temp_dir = tempfile::tempdir().unwrap();
    let data_dir = temp_dir.path().join("data");
    let source_dir = make_source(&data_dir, "01", 3, &[0, 1, 2], 1);
    for name in ["a.txt", "b.txt", "c.txt"] {
        fs::write(source_dir.join("rgb").join(name), "").unwrap();
    }

    let config = PipelineConfig {
        label_threshold: 2,
        ..config_for(&["01"])
    };
    let summaries = encode_source_labels(&config, &data_dir, false).unwrap();
    assert_eq!(summaries[0].1.skipped_existing, Some(3));
    assert_eq!(summaries[0].1.written, 0);
    assert!(!source_dir.join("rgb/0000.txt").exists());
}

#[test]
fn test_source_labels_without_mapped_objects() {
    let temp_dir = tempfile::tempdir().unwrap();
    let data_dir = temp_dir.path().join("data");
    let source_dir = make_source(&data_dir, "03", 2, &[0, 1], 3);

    let summaries = encode_source_labels(&config_for(&["03"]), &data_dir, true).unwrap();
    assert_eq!(summaries[0].1.written, 0);
    assert_eq!(summaries[0].1.without_objects, 2);
    assert!(!source_dir.join("rgb/0000.txt").exists());
}

#[test]
fn test_consolidated_labels_follow_image_index() {
    let (_temp_dir, paths, config) = diverging_dataset();
    let report = consolidate(&config, &paths.data_dir, &paths.consolidated_dir).unwrap();

    let summary = encode_consolidated_labels(&report.corpus, &paths.consolidated_dir, &config).unwrap();
    assert_eq!(summary.written, 5);
    assert!(paths.consolidated_dir.join("00000.txt").is_file());
    assert!(!paths.consolidated_dir.join("00001.txt").exists());
    assert_eq!(
        fs::read_to_string(paths.consolidated_dir.join("00005.txt")).unwrap(),
        "2 0.065625 0.258333 0.100000 0.100000"
    );
}

#[test]
fn test_consolidated_labels_with_uppercase_extension() {
    let temp_dir = tempfile::tempdir().unwrap();
    let paths = DatasetPaths::new(temp_dir.path());
    let rgb = paths.data_dir.join("01/rgb");
    fs::create_dir_all(&rgb).unwrap();
    write_image(&rgb.join("0000.PNG"), WIDTH, HEIGHT);
    fs::write(paths.data_dir.join("01/gt.yml"), object_entry(0, 1)).unwrap();

    let config = config_for(&["01"]);
    let report = consolidate(&config, &paths.data_dir, &paths.consolidated_dir).unwrap();
    assert!(paths.consolidated_dir.join("00000.PNG").is_file());

    let summary = encode_consolidated_labels(&report.corpus, &paths.consolidated_dir, &config).unwrap();
    assert_eq!(summary.written, 1);
    assert_eq!(summary.missing_image, 0);
    assert!(paths.consolidated_dir.join("00000.txt").is_file());
}

#[test]
fn test_default_split_sources_differ_from_consolidation() {
    let temp_dir = tempfile::tempdir().unwrap();
    let paths = DatasetPaths::new(temp_dir.path());
    make_source(&paths.data_dir, "01", 5, &[0, 1, 2, 3, 4], 1);
    make_source(&paths.data_dir, "02", 5, &[0, 1, 2, 3, 4], 2);
    make_source(&paths.data_dir, "03", 5, &[0, 1, 2, 3, 4], 3);
    let config = PipelineConfig {
        source_ids: vec!["01".to_string(), "02".to_string(), "03".to_string()],
        ..PipelineConfig::default()
    };

    let report = consolidate(&config, &paths.data_dir, &paths.consolidated_dir).unwrap();
    assert_eq!(report.image_count, 5);

    let summaries = encode_source_labels(&config, &paths.data_dir, false).unwrap();
    let ids: Vec<&str> = summaries.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(ids, vec!["01", "02"]);

    let outputs = run_split(&config, &paths, SplitPolicy::PerSource, None).unwrap();
    let train = read_lines(&outputs.train_manifest);
    let val = read_lines(&outputs.val_manifest);
    assert_eq!((train.len(), val.len()), (8, 2));
    for id in ["01", "02"] {
        let marker = format!("/{}/rgb/", id);
        assert!(train.iter().any(|line| line.contains(&marker)));
        assert!(val.iter().any(|line| line.contains(&marker)));
    }
    assert!(!train.iter().chain(&val).any(|line| line.contains("/03/rgb/")));
}

#[test]
fn test_per_source_split_without_labels() {
    let temp_dir = tempfile::tempdir().unwrap();
    let paths = DatasetPaths::new(temp_dir.path());
    make_source(&paths.data_dir, "01", 3, &[0, 1, 2], 1);

    let result = run_split(&config_for(&["01"]), &paths, SplitPolicy::PerSource, None);
    assert!(matches!(result, Err(DatasetError::EmptyCorpus { .. })));
}

#[test]
fn test_per_source_split_outputs() {
    let temp_dir = tempfile::tempdir().unwrap();
    let paths = DatasetPaths::new(temp_dir.path());
    make_source(&paths.data_dir, "01", 10, &(0..10).collect::<Vec<_>>(), 1);
    make_source(&paths.data_dir, "04", 5, &(0..5).collect::<Vec<_>>(), 4);
    let config = config_for(&["01", "04"]);
    encode_source_labels(&config, &paths.data_dir, false).unwrap();

    let outputs = run_split(&config, &paths, SplitPolicy::PerSource, None).unwrap();
    assert!(outputs.config_path.ends_with("linemod_yolo_config_ALL.yaml"));
    assert!(outputs.train_manifest.ends_with("autosplit_train_ALL.txt"));

    let train = read_lines(&outputs.train_manifest);
    let val = read_lines(&outputs.val_manifest);
    assert_eq!(train.len(), 12);
    assert_eq!(val.len(), 3);
    for line in train.iter().chain(&val) {
        let path = Path::new(line);
        assert!(path.is_absolute());
        assert!(path.is_file());
    }

    let detector_config: DetectorConfig =
        serde_yaml::from_str(&fs::read_to_string(&outputs.config_path).unwrap()).unwrap();
    assert_eq!(detector_config.train, outputs.train_manifest.to_string_lossy());
    assert_eq!(detector_config.val, outputs.val_manifest.to_string_lossy());
    assert_eq!(detector_config.names.len(), 13);
    assert_eq!(detector_config.names[&0], "Ape");

    let first = fs::read(&outputs.train_manifest).unwrap();
    run_split(&config, &paths, SplitPolicy::PerSource, None).unwrap();
    assert_eq!(fs::read(&outputs.train_manifest).unwrap(), first);
}

#[test]
fn test_per_source_split_of_large_folder() {
    let temp_dir = tempfile::tempdir().unwrap();
    let paths = DatasetPaths::new(temp_dir.path());
    let rgb = paths.data_dir.join("01/rgb");
    fs::create_dir_all(&rgb).unwrap();
    for frame in 0..1200 {
        fs::write(rgb.join(format!("{:04}.png", frame)), b"").unwrap();
        fs::write(rgb.join(format!("{:04}.txt", frame)), b"").unwrap();
    }
    // an image without label is not part of the split
    fs::write(rgb.join("1200.png"), b"").unwrap();

    let outputs = run_split(&config_for(&["01"]), &paths, SplitPolicy::PerSource, None).unwrap();
    assert_eq!(read_lines(&outputs.train_manifest).len(), 960);
    assert_eq!(read_lines(&outputs.val_manifest).len(), 240);
}

#[test]
fn test_global_split_of_empty_folder() {
    let temp_dir = tempfile::tempdir().unwrap();
    let paths = DatasetPaths::new(temp_dir.path());
    fs::create_dir_all(&paths.consolidated_dir).unwrap();

    let result = run_split(&PipelineConfig::default(), &paths, SplitPolicy::Global, None);
    assert!(matches!(result, Err(DatasetError::EmptyCorpus { .. })));
}

#[test]
fn test_run_all_global() {
    let (_temp_dir, paths, config) = diverging_dataset();

    let config_path = run_all(&config, &paths, SplitPolicy::Global, true).unwrap();
    assert!(config_path.ends_with("linemod_yolo_config.yaml"));
    assert!(paths.consolidated_gt.is_file());

    let train = read_lines(&paths.root.join("autosplit_train.txt"));
    let val = read_lines(&paths.root.join("autosplit_val.txt"));
    assert_eq!(train.len() + val.len(), 6);
    assert_eq!(train.len(), 4);

    assert_eq!(
        fs::read_dir(&paths.consolidated_dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "txt"))
            .count(),
        5
    );
    // verification passed, so the source images are gone
    assert!(!paths.data_dir.join("01/rgb").exists());
    assert!(!paths.data_dir.join("04/rgb").exists());
    assert!(paths.data_dir.join("01/gt.yml").is_file());
}

use clap::Parser;

use log::{error, info};
use std::process::ExitCode;

use linemod2yolo::config::{Args, Command};
use linemod2yolo::pipeline::{
    run_all, run_consolidation, run_labels, run_split, run_verification, DatasetPaths,
};
use linemod2yolo::PipelineConfig;

fn main() -> ExitCode {
    // Initialize the logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if !args.dataset_root.exists() {
        error!(
            "The specified dataset_root does not exist: {}",
            args.dataset_root.display()
        );
        return ExitCode::FAILURE;
    }

    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

// Ok(false) reports a completed run whose verification failed.
fn run(args: &Args) -> Result<bool, Box<dyn std::error::Error>> {
    let config = PipelineConfig::from_args(args)?;
    let paths = DatasetPaths::new(&args.dataset_root);

    match &args.command {
        Command::Consolidate(cmd) => {
            let paths = paths
                .with_consolidated_dir(cmd.output_dir.as_deref())
                .with_consolidated_gt(cmd.gt_output.as_deref());
            run_consolidation(&config, &paths)?;
        }
        Command::Verify(cmd) => {
            let paths = paths.with_consolidated_dir(cmd.consolidated_dir.as_deref());
            let report = run_verification(&config, &paths, cmd.report.as_deref())?;
            return Ok(report.passed());
        }
        Command::Labels(cmd) => {
            let paths = paths.with_consolidated_dir(cmd.consolidated_dir.as_deref());
            let written = run_labels(&config, &paths, cmd.target, cmd.all_objects)?;
            info!("{} label files written.", written);
        }
        Command::Split(cmd) => {
            let outputs = run_split(&config, &paths, cmd.policy, cmd.images_dir.as_deref())?;
            info!("Detector config: {}", outputs.config_path.display());
        }
        Command::Run(cmd) => {
            let config_path = run_all(&config, &paths, cmd.policy, cmd.remove_source_images)?;
            info!("Hand this file to the detector trainer: {}", config_path.display());
        }
    }
    Ok(true)
}

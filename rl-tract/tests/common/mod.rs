use std::path::Path;

use clap::Parser;
use rl_tract::config::Args;

pub const BATCH_SIZE: usize = 8;

/// A training run of a few hundred steps on a small phantom
pub fn small_run_args(output_dir: &Path) -> Args {
    let output_dir = output_dir.to_string_lossy().to_string();
    Args::parse_from([
        "train-rl-tract",
        "--output-dir",
        &output_dir,
        "--max-steps",
        "600",
        "--evaluate-every",
        "200",
        "--eval-runs",
        "2",
        "--start-learning",
        "100",
        "--network-update-every",
        "50",
        "--max-episode-length",
        "50",
        "--replay-memory-size",
        "1000",
        "--eps-annealing-steps",
        "200",
        "--learning-rate",
        "0.001",
        "--hidden-len",
        "32",
        "--phantom-size",
        "16",
        "--phantom-depth",
        "3",
        "--action-space",
        "20",
        "--max-streamline-steps",
        "30",
        "--min-length",
        "0",
    ])
}

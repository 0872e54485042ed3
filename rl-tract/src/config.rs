use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Parser;
use lazy_static::lazy_static;
use ql::learn::action_scheduler::SchedulerParameter;
use ql::learn::agent::AgentParameter;
use ql::learn::trainer::Parameter;
use ql::ml_model::candle_model::CandleModelParameter;
use ql::ml_model::model::DEFAULT_BATCH_SIZE;
use ql::prelude::{ModelActionType, QlError};

use crate::dwi::DwiVolume;
use crate::environment::TrackingParameter;

pub const BATCH_SIZE: usize = DEFAULT_BATCH_SIZE;
pub const MAX_STEPS: usize = 3_000_000;
pub const REPLAY_MEMORY_SIZE: usize = 100_000;
pub const EVALUATE_EVERY: usize = 200_000;
pub const EVAL_RUNS: usize = 5;
pub const NETWORK_UPDATE_EVERY: usize = 10_000;
pub const START_LEARNING: usize = 10_000;
pub const MAX_EPISODE_LENGTH: usize = 2_000;
pub const EPS_ANNEALING_STEPS: usize = 400_000;
pub const GAMMA: f32 = 0.99;
pub const LEARNING_RATE: f64 = 1e-4;
pub const REWARD_LOG_EVERY: usize = 10;
pub const EPISODE_REWARD_HISTORY_LEN: usize = 100;
pub const CHECKPOINT_PREFIX: &str = "fibre_agent";

#[rustfmt::skip]
lazy_static! {
    pub static ref DEFAULT_OUTPUT_DIR: PathBuf = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("results");
}

#[derive(Parser, Debug)]
#[command(name = "train-rl-tract", about = "Trains a DQN fiber tracking agent on a phantom direction field")]
pub struct Args {
    /// Receives logs/rewards.dat, checkpoints/ and streamlines.vtk
    #[arg(long, default_value_os_t = DEFAULT_OUTPUT_DIR.clone())]
    pub output_dir: PathBuf,
    #[arg(long, default_value_t = MAX_STEPS)]
    pub max_steps: usize,
    #[arg(long, default_value_t = REPLAY_MEMORY_SIZE)]
    pub replay_memory_size: usize,
    #[arg(long, default_value_t = EVALUATE_EVERY)]
    pub evaluate_every: usize,
    #[arg(long, default_value_t = EVAL_RUNS)]
    pub eval_runs: usize,
    #[arg(long, default_value_t = NETWORK_UPDATE_EVERY)]
    pub network_update_every: usize,
    #[arg(long, default_value_t = START_LEARNING)]
    pub start_learning: usize,
    #[arg(long, default_value_t = MAX_EPISODE_LENGTH)]
    pub max_episode_length: usize,
    #[arg(long, default_value_t = EPS_ANNEALING_STEPS)]
    pub eps_annealing_steps: usize,
    #[arg(long, default_value_t = GAMMA)]
    pub gamma: f32,
    #[arg(long, default_value_t = LEARNING_RATE)]
    pub learning_rate: f64,
    #[arg(long, default_value_t = 128)]
    pub hidden_len: usize,
    /// Edge length (voxels) of the phantom in x and y
    #[arg(long, default_value_t = 32)]
    pub phantom_size: usize,
    #[arg(long, default_value_t = 8)]
    pub phantom_depth: usize,
    /// Number of tracking directions
    #[arg(long, default_value_t = 100)]
    pub action_space: ModelActionType,
    /// Tracking step length in voxels
    #[arg(long, default_value_t = 1.0)]
    pub step_width: f32,
    /// Maximum angle (degrees) between two tracking steps
    #[arg(long, default_value_t = 60.0)]
    pub max_angle: f32,
    #[arg(long, default_value_t = 0.2)]
    pub fa_threshold: f32,
    #[arg(long, default_value_t = 200)]
    pub max_streamline_steps: usize,
    /// Checkpoint to resume from
    #[arg(long, conflicts_with = "resume_latest")]
    pub resume: Option<PathBuf>,
    /// Resume from the latest checkpoint in the output directory
    #[arg(long, default_value_t = false)]
    pub resume_latest: bool,
    /// Number of seeds to track with the trained agent
    #[arg(long, default_value_t = 0)]
    pub track_seeds: usize,
    /// Minimum streamline length in mm
    #[arg(long, default_value_t = 20.0)]
    pub min_length: f32,
    /// Maximum streamline length in mm
    #[arg(long, default_value_t = 200.0)]
    pub max_length: f32,
}

impl Args {
    pub fn trainer_parameter(&self) -> Parameter {
        Parameter {
            max_steps: self.max_steps,
            evaluate_every: self.evaluate_every,
            eval_runs: self.eval_runs,
            network_update_every: self.network_update_every,
            start_learning: self.start_learning,
            optimize_every: 1,
            max_episode_length: self.max_episode_length,
            reward_log_every: REWARD_LOG_EVERY,
            checkpoint_prefix: CHECKPOINT_PREFIX.to_string(),
        }
    }

    pub fn scheduler_parameter(&self) -> SchedulerParameter {
        SchedulerParameter {
            eps_annealing_steps: self.eps_annealing_steps,
            replay_memory_start_size: self.start_learning,
            max_steps: self.max_steps,
            ..Default::default()
        }
    }

    pub fn agent_parameter(&self) -> AgentParameter {
        AgentParameter {
            gamma: self.gamma,
            replay_memory_size: self.replay_memory_size,
            episode_reward_history_len: EPISODE_REWARD_HISTORY_LEN,
        }
    }

    pub fn model_parameter(&self) -> CandleModelParameter {
        CandleModelParameter {
            hidden_len: self.hidden_len,
            learning_rate: self.learning_rate,
        }
    }

    pub fn tracking_parameter(&self) -> TrackingParameter {
        TrackingParameter {
            step_width: self.step_width,
            action_space: self.action_space,
            max_angle: self.max_angle,
            fa_threshold: self.fa_threshold,
            max_streamline_steps: self.max_streamline_steps,
        }
    }

    /// Arc shaped bundle around the volume's z axis
    pub fn phantom(&self) -> Result<DwiVolume> {
        let size = self.phantom_size as f32;
        DwiVolume::arc_phantom([self.phantom_size, self.phantom_size, self.phantom_depth], 0.4 * size, 0.8 * size)
    }

    pub fn checkpoint_dir(&self) -> PathBuf { self.output_dir.join("checkpoints") }

    /// The checkpoint to resume from, if any
    pub fn resume_checkpoint(&self) -> Result<Option<PathBuf>> {
        match (&self.resume, self.resume_latest) {
            (Some(file), _) => Ok(Some(file.clone())),
            (None, true) => latest_checkpoint(&self.checkpoint_dir()),
            (None, false) => Ok(None),
        }
    }
}

/// Finds the checkpoint with the highest step count in `dir`.
///
/// Checkpoint files are named `fibre_agent_{step}_reward_{reward}.safetensors`.
pub fn latest_checkpoint(dir: &Path) -> Result<Option<PathBuf>> {
    let dir = dir
        .to_str()
        .ok_or_else(|| QlError(format!("unsupported path: {}", dir.display())))?;
    let pattern = format!("{}/{}_*_reward_*.safetensors", dir, CHECKPOINT_PREFIX);

    let mut latest: Option<(usize, PathBuf)> = None;
    for entry in glob::glob(&pattern)? {
        let path = entry?;
        let Some(step) = checkpoint_step(&path) else {
            log::warn!("ignoring unexpected checkpoint file name: {}", path.display());
            continue;
        };
        if latest.as_ref().map_or(true, |(s, _)| step > *s) {
            latest = Some((step, path));
        }
    }
    Ok(latest.map(|(_, path)| path))
}

fn checkpoint_step(path: &Path) -> Option<usize> {
    path.file_name()?
        .to_str()?
        .strip_prefix(CHECKPOINT_PREFIX)?
        .strip_prefix('_')?
        .split_once("_reward_")?
        .0
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["train-rl-tract"]);
        let param = args.trainer_parameter();
        assert_eq!(param.max_steps, 3_000_000);
        assert_eq!(param.evaluate_every, 200_000);
        assert_eq!(param.eval_runs, 5);
        assert_eq!(param.network_update_every, 10_000);
        assert_eq!(param.start_learning, 10_000);
        assert_eq!(param.max_episode_length, 2_000);
        assert_eq!(param.reward_log_every, 10);
        assert_eq!(args.scheduler_parameter().eps_annealing_steps, 400_000);
        assert_eq!(args.agent_parameter().replay_memory_size, 100_000);
        assert_eq!(args.agent_parameter().gamma, 0.99);
        assert_eq!(args.model_parameter().learning_rate, 1e-4);
        assert_eq!(args.output_dir, *DEFAULT_OUTPUT_DIR);
        assert_eq!(args.track_seeds, 0);
    }

    #[test]
    fn test_overrides() {
        let args = Args::parse_from([
            "train-rl-tract",
            "--max-steps",
            "5000",
            "--start-learning",
            "100",
            "--action-space",
            "20",
            "--output-dir",
            "/tmp/rl-tract",
        ]);
        assert_eq!(args.trainer_parameter().max_steps, 5_000);
        assert_eq!(args.scheduler_parameter().replay_memory_start_size, 100);
        assert_eq!(args.scheduler_parameter().max_steps, 5_000);
        assert_eq!(args.tracking_parameter().action_space, 20);
        assert_eq!(args.checkpoint_dir(), PathBuf::from("/tmp/rl-tract/checkpoints"));
    }

    #[test]
    fn test_resume_options_conflict() {
        assert!(Args::try_parse_from(["train-rl-tract", "--resume", "a.safetensors", "--resume-latest"]).is_err());
    }

    #[test]
    fn test_phantom_has_white_matter() -> Result<()> {
        let args = Args::parse_from(["train-rl-tract", "--phantom-size", "16", "--phantom-depth", "3"]);
        let volume = args.phantom()?;
        assert_eq!(volume.dims(), [16, 16, 3]);
        assert!(!volume.seed_points(args.fa_threshold).is_empty());
        Ok(())
    }

    #[test]
    fn test_latest_checkpoint() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert_eq!(latest_checkpoint(dir.path())?, None);

        for name in [
            "fibre_agent_200000_reward_0.52.safetensors",
            "fibre_agent_1000000_reward_0.91.safetensors",
            "fibre_agent_400000_reward_-0.13.safetensors",
            "other_agent_9000000_reward_1.00.safetensors",
        ] {
            fs::write(dir.path().join(name), b"")?;
        }
        assert_eq!(
            latest_checkpoint(dir.path())?,
            Some(dir.path().join("fibre_agent_1000000_reward_0.91.safetensors"))
        );
        Ok(())
    }

    #[test]
    fn test_resume_latest() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let args = Args::parse_from(["train-rl-tract", "--resume-latest", "--output-dir", dir.path().to_str().unwrap()]);
        fs::create_dir_all(args.checkpoint_dir())?;
        assert_eq!(args.resume_checkpoint()?, None);
        fs::write(args.checkpoint_dir().join("fibre_agent_10_reward_0.00.safetensors"), b"")?;
        assert!(args.resume_checkpoint()?.is_some());
        Ok(())
    }
}

use std::rc::Rc;

use anyhow::Result;
use clap::Parser;
use num_format::ToFormattedString;
use ql::learn::action_scheduler::ActionScheduler;
use ql::learn::agent::DqnAgent;
use ql::learn::trainer::DqnTrainer;
use ql::ml_model::candle_model::QLearningCandleModel;
use ql::prelude::Environment;
use ql::util::format::number_format;
use ql::util::log::init_logging;
use rand::seq::SliceRandom;
use rl_tract::config::{Args, BATCH_SIZE};
use rl_tract::environment::RlTractEnvironment;
use rl_tract::streamline;

type Model = QLearningCandleModel<RlTractEnvironment, BATCH_SIZE>;

fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();

    let volume = Rc::new(args.phantom()?);
    let environment = RlTractEnvironment::new(Rc::clone(&volume), args.tracking_parameter())?;

    let model_param = args.model_parameter();
    let agent = DqnAgent::new(
        args.agent_parameter(),
        Model::init_for(&environment, &model_param)?,
        Model::init_for(&environment, &model_param)?,
    )?;
    let scheduler = ActionScheduler::new(args.scheduler_parameter(), environment.action_space());

    let mut trainer = DqnTrainer::new(environment, agent, scheduler, args.trainer_parameter(), Some(args.output_dir.clone()))?;
    if let Some(checkpoint) = args.resume_checkpoint()? {
        trainer.read_checkpoint(&checkpoint)?;
    }

    let report = trainer.run()?;
    let number_format = number_format();
    log::info!(
        "training finished after {} steps, {} episodes, {} epochs; running reward: {:.3}, evaluation scores: {:?}",
        report.steps.to_formatted_string(&number_format),
        report.episodes.to_formatted_string(&number_format),
        report.epochs,
        report.running_reward,
        report.evaluation_scores
    );

    if args.track_seeds > 0 {
        let (mut environment, agent) = trainer.into_parts();
        let seeds: Vec<_> = volume
            .seed_points(args.fa_threshold)
            .choose_multiple(&mut rand::thread_rng(), args.track_seeds)
            .copied()
            .collect();

        let streamlines = streamline::track::<_, BATCH_SIZE>(&mut environment, agent.model(), &seeds)?;
        let streamlines = streamline::filter_by_length(streamlines, volume.voxel_size(), args.min_length, args.max_length);
        streamline::write_vtk(&args.output_dir.join("streamlines.vtk"), &streamlines, volume.voxel_size())?;
    }

    Ok(())
}

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::Result;
use itertools::Itertools;
use num_format::ToFormattedString;
use rustc_hash::FxHashMap;

use crate::learn::action_scheduler::ActionScheduler;
use crate::learn::agent::DqnAgent;
use crate::ml_model::model::DeepQLearningModel;
use crate::prelude::{DebugVisualizer, Environment, QlError};
use crate::util::format;

pub struct Parameter {
    /// Total step budget of the training
    pub max_steps: usize,
    /// Number of training steps between two evaluations
    pub evaluate_every: usize,
    /// Number of greedy episodes per evaluation
    pub eval_runs: usize,
    /// Number of steps between two target network updates
    pub network_update_every: usize,
    /// No optimization before that many steps; the replay memory gets filled meanwhile
    pub start_learning: usize,
    /// Optimize the model after every n-th step
    pub optimize_every: usize,
    pub max_episode_length: usize,
    /// Log the running reward after every n-th episode
    pub reward_log_every: usize,
    /// File name prefix for the checkpoints written after each epoch
    pub checkpoint_prefix: String,
}

impl Default for Parameter {
    fn default() -> Self {
        Self {
            max_steps: 3_000_000,
            evaluate_every: 200_000,
            eval_runs: 5,
            network_update_every: 10_000,
            start_learning: 10_000,
            optimize_every: 1,
            max_episode_length: 2_000,
            reward_log_every: 10,
            checkpoint_prefix: "agent".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    pub steps: usize,
    pub episodes: usize,
    pub epochs: usize,
    /// Mean evaluation reward after each epoch
    pub evaluation_scores: Vec<f32>,
    /// Mean reward of the recent training episodes
    pub running_reward: f32,
}

/// Drives the training of a [DqnAgent] in an [Environment].
///
/// ```text
/// while steps < max_steps:                                  epoch
///     while epoch_steps < evaluate_every or steps < start_learning:
///         reset; run one episode of at most max_episode_length steps,
///         store the transitions, optimize, sync the target network
///     write checkpoint
///     evaluate: eval_runs greedy episodes
/// ```
pub struct DqnTrainer<E, M, const BATCH_SIZE: usize>
where
    E: Environment,
    M: DeepQLearningModel<BATCH_SIZE, E = E>,
{
    environment: E,
    agent: DqnAgent<E, M, BATCH_SIZE>,
    scheduler: ActionScheduler,
    param: Parameter,
    output_dir: Option<PathBuf>,
    step_count: usize,
    episode_count: usize,
    epoch_count: usize,
    last_loss: Option<f32>,
    target_update_count: usize,
    evaluation_scores: Vec<f32>,
}

impl<E, M, const BATCH_SIZE: usize> DqnTrainer<E, M, BATCH_SIZE>
where
    E: Environment,
    M: DeepQLearningModel<BATCH_SIZE, E = E>,
{
    /// # Arguments
    /// * `output_dir` if present, receives `logs/rewards.dat` and `checkpoints/`
    pub fn new(
        environment: E,
        agent: DqnAgent<E, M, BATCH_SIZE>,
        scheduler: ActionScheduler,
        param: Parameter,
        output_dir: Option<PathBuf>,
    ) -> Result<Self> {
        if param.max_episode_length == 0
            || param.evaluate_every == 0
            || param.optimize_every == 0
            || param.network_update_every == 0
            || param.reward_log_every == 0
        {
            return Err(QlError::from("episode length and all step intervals must be positive").into());
        }
        if let Some(dir) = &output_dir {
            fs::create_dir_all(dir.join("logs"))?;
            fs::create_dir_all(dir.join("checkpoints"))?;
        }

        Ok(Self {
            environment,
            agent,
            scheduler,
            param,
            output_dir,
            step_count: 0,
            episode_count: 0,
            epoch_count: 0,
            last_loss: None,
            target_update_count: 0,
            evaluation_scores: vec![],
        })
    }

    pub fn environment(&self) -> &E { &self.environment }

    pub fn environment_mut(&mut self) -> &mut E { &mut self.environment }

    pub fn agent(&self) -> &DqnAgent<E, M, BATCH_SIZE> { &self.agent }

    pub fn step_count(&self) -> usize { self.step_count }

    pub fn episode_count(&self) -> usize { self.episode_count }

    /// Loss of the most recent optimization; `None` before learning started
    pub fn last_loss(&self) -> Option<f32> { self.last_loss }

    pub fn target_update_count(&self) -> usize { self.target_update_count }

    pub fn running_reward(&self) -> f32 { self.agent.replay_buffer().avg_episode_reward() }

    pub fn into_parts(self) -> (E, DqnAgent<E, M, BATCH_SIZE>) { (self.environment, self.agent) }

    /// Resumes from a checkpoint written by a former training
    pub fn read_checkpoint(
        &mut self,
        file: &Path,
    ) -> Result<()> {
        self.agent.read_checkpoint(file)?;
        log::info!("loaded checkpoint {}", file.display());
        Ok(())
    }

    /// Trains until the step budget is used up
    pub fn run(&mut self) -> Result<TrainingReport> {
        while self.step_count < self.param.max_steps {
            self.train_epoch()?;
        }
        Ok(self.report())
    }

    pub fn report(&self) -> TrainingReport {
        TrainingReport {
            steps: self.step_count,
            episodes: self.episode_count,
            epochs: self.epoch_count,
            evaluation_scores: self.evaluation_scores.clone(),
            running_reward: self.running_reward(),
        }
    }

    /// Collects experience for `evaluate_every` steps (at least until learning started),
    /// then writes a checkpoint and evaluates the agent.
    /// Returns the evaluation score.
    pub fn train_epoch(&mut self) -> Result<f32> {
        let mut epoch_step = 0;
        while epoch_step < self.param.evaluate_every || self.step_count < self.param.start_learning {
            epoch_step += self.learn_episode()?;
        }
        self.epoch_count += 1;

        if self.output_dir.is_some() {
            self.write_checkpoint()?;
        }

        let score = self.evaluate()?;
        self.evaluation_scores.push(score);
        Ok(score)
    }

    /// Runs one training episode; returns the number of steps taken
    pub fn learn_episode(&mut self) -> Result<usize> {
        self.environment.reset()?;
        let mut state = self.environment.state_as_rc();
        log::trace!("started learning episode {}", self.episode_count);

        let mut episode_reward: f32 = 0.0;
        let mut episode_steps = 0;

        while episode_steps < self.param.max_episode_length {
            let action = self
                .scheduler
                .get_action::<E, M, BATCH_SIZE>(self.step_count, &state, self.agent.model(), false)?;
            self.step_count += 1;
            episode_steps += 1;

            log::trace!("{}", state.one_line_info());
            let (state_next, reward, done) = match self.environment.step_as_rc(action) {
                Ok(r) => r,
                Err(e) if self.environment.is_episode_abort(&e) => {
                    log::debug!("episode {} ended after {} steps: {}", self.episode_count, episode_steps, e);
                    break;
                }
                Err(e) => return Err(e),
            };
            log::trace!("step with action {} resulted in reward: {:.2}, done: {}", action, reward, done);

            episode_reward += reward;
            self.agent.add_experience(action, state, Rc::clone(&state_next), reward, done);
            state = state_next;

            if self.step_count > self.param.start_learning && self.step_count % self.param.optimize_every == 0 {
                if let Some(loss) = self.agent.optimize()? {
                    self.last_loss = Some(loss);
                }
            }

            if self.step_count > self.param.start_learning && self.step_count % self.param.network_update_every == 0 {
                self.agent.update_target_network()?;
                self.target_update_count += 1;
                log::debug!("target network updated at step {}, last loss: {:?}", self.step_count, self.last_loss);
            }

            if done {
                break;
            }
        }

        self.agent.replay_buffer_mut().add_episode_reward(episode_reward);
        self.episode_count += 1;

        if self.episode_count % self.param.reward_log_every == 0 {
            self.log_running_reward()?;
        }

        Ok(episode_steps)
    }

    /// Runs `eval_runs` episodes with greedy action selection and without learning.
    /// Returns the mean episode reward.
    pub fn evaluate(&mut self) -> Result<f32> {
        let mut eval_rewards = Vec::with_capacity(self.param.eval_runs);

        for _ in 0..self.param.eval_runs {
            self.environment.reset()?;
            let mut eval_episode_reward: f32 = 0.0;

            for _ in 0..self.param.max_episode_length {
                let action = self.scheduler.get_action::<E, M, BATCH_SIZE>(
                    self.step_count,
                    self.environment.state(),
                    self.agent.model(),
                    true,
                )?;
                let step = self.environment.step(action).map(|(_, reward, done)| (reward, done));
                let (reward, done) = match step {
                    Ok(r) => r,
                    Err(e) if self.environment.is_episode_abort(&e) => break,
                    Err(e) => return Err(e),
                };
                eval_episode_reward += reward;
                if done {
                    break;
                }
            }
            eval_rewards.push(eval_episode_reward);
        }

        let score = match eval_rewards.len() {
            0 => 0.0,
            n => eval_rewards.iter().sum::<f32>() / n as f32,
        };
        log::info!("Evaluation score: {:.3}", score);
        Ok(score)
    }

    fn write_checkpoint(&self) -> Result<()> {
        let Some(dir) = &self.output_dir else {
            return Ok(());
        };
        let file = dir.join("checkpoints").join(format!(
            "{}_{}_reward_{:.2}.safetensors",
            self.param.checkpoint_prefix,
            self.step_count,
            self.running_reward()
        ));
        let written = self.agent.write_checkpoint(&file)?;
        log::info!("checkpoint written: {}", written.display());
        Ok(())
    }

    /// `[episodes] steps, running reward` - to the log and to `logs/rewards.dat`
    fn log_running_reward(&self) -> Result<()> {
        let line = format!("[{}] {}, {}", self.episode_count, self.step_count, self.running_reward());

        if let Some(dir) = &self.output_dir {
            let mut reward_file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join("logs").join("rewards.dat"))?;
            writeln!(reward_file, "{}", line)?;
        }

        log::info!("{}", line);
        log::debug!("{}", self.learning_state_info());
        Ok(())
    }

    fn learning_state_info(&self) -> String {
        let number_format = format::number_format();
        let replay_buffer = self.agent.replay_buffer();

        let mut action_counts = FxHashMap::<E::A, usize>::default();
        for &a in replay_buffer.actions().iter() {
            action_counts.entry(a).and_modify(|e| *e += 1).or_insert(1);
        }

        let total_actions = replay_buffer.actions().len();
        let action_distribution_line = action_counts
            .iter()
            .sorted_by_key(|(_, count)| std::cmp::Reverse(**count))
            .take(8)
            .map(|(&action, &count)| {
                let ratio = 100.0 * count as f32 / total_actions as f32;
                format!("{} {:.1}%", action, ratio)
            })
            .join(", ");

        format!(
            "episode: {}, steps: {}, 𝜀={:.3}, rewards: {{mean: {:.2}, low: {:.2}}}, loss: {:?}, top actions (of last {}): {}",
            self.episode_count.to_formatted_string(&number_format),
            self.step_count.to_formatted_string(&number_format),
            self.scheduler.epsilon(self.step_count, false),
            replay_buffer.avg_episode_reward(),
            replay_buffer.min_episode_reward(),
            self.last_loss,
            total_actions.to_formatted_string(&number_format),
            action_distribution_line
        )
    }
}

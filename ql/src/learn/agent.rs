use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::Result;
use rand::prelude::ThreadRng;
use rand::Rng;

use crate::learn::replay_buffer::ReplayBuffer;
use crate::ml_model::model::DeepQLearningModel;
use crate::prelude::{Environment, QlError};

pub struct AgentParameter {
    /// Discount rate; (0 <= 𝛾 <= 1) represents the value of future rewards. The bigger, the more farsighted the agent becomes
    pub gamma: f32,
    /// Maximum number of transitions kept in the replay memory
    pub replay_memory_size: usize,
    /// Number of recent episode rewards the running reward is averaged over
    pub episode_reward_history_len: usize,
}

impl Default for AgentParameter {
    fn default() -> Self {
        Self {
            gamma: 0.99,
            replay_memory_size: 100_000,
            episode_reward_history_len: 100,
        }
    }
}

/// Deep-Q-Learning agent: a main model, a target model for stable Q-value targets and the replay memory.
pub struct DqnAgent<E, M, const BATCH_SIZE: usize>
where
    E: Environment,
    M: DeepQLearningModel<BATCH_SIZE, E = E>,
{
    gamma: f32,
    model: M,
    // "stabilized model"
    target_model: M,
    replay_buffer: ReplayBuffer<E::S, E::A>,
    rng: ThreadRng,
}

impl<E, M, const BATCH_SIZE: usize> DqnAgent<E, M, BATCH_SIZE>
where
    E: Environment,
    M: DeepQLearningModel<BATCH_SIZE, E = E>,
{
    /// The target model starts as an exact copy of `model`.
    /// The replay memory must hold more than one batch.
    pub fn new(
        param: AgentParameter,
        model: M,
        mut target_model: M,
    ) -> Result<Self> {
        if param.replay_memory_size <= BATCH_SIZE {
            return Err(QlError(format!(
                "replay memory size {} must exceed the batch size {}",
                param.replay_memory_size, BATCH_SIZE
            ))
            .into());
        }
        if param.episode_reward_history_len == 0 {
            return Err(QlError::from("episode reward history must not be empty").into());
        }
        target_model.copy_weights_from(&model)?;
        Ok(Self {
            gamma: param.gamma,
            model,
            target_model,
            replay_buffer: ReplayBuffer::new(param.replay_memory_size, param.episode_reward_history_len),
            rng: rand::thread_rng(),
        })
    }

    pub fn model(&self) -> &M { &self.model }

    pub fn replay_buffer(&self) -> &ReplayBuffer<E::S, E::A> { &self.replay_buffer }

    pub fn replay_buffer_mut(&mut self) -> &mut ReplayBuffer<E::S, E::A> { &mut self.replay_buffer }

    pub fn add_experience(
        &mut self,
        action: E::A,
        state: Rc<E::S>,
        state_next: Rc<E::S>,
        reward: f32,
        done: bool,
    ) {
        self.replay_buffer.add(action, state, state_next, reward, done)
    }

    /// Trains the main model on a random minibatch of the replay memory.
    ///
    /// Returns the loss, or `None` as long as the replay memory does not hold more than `BATCH_SIZE` transitions.
    pub fn optimize(&mut self) -> Result<Option<f32>> {
        if self.replay_buffer.len() <= BATCH_SIZE {
            return Ok(None);
        }

        let indices: [usize; BATCH_SIZE] = sample_indices(&mut self.rng, self.replay_buffer.len());
        let replay_samples = self.replay_buffer.get_many(&indices);

        // Build the updated Q-values for the sampled future states
        // Use the target model for stability
        let max_future_rewards = self.target_model.batch_predict_max_future_reward(replay_samples.state_next)?;

        // Q value = reward + discount factor * expected future reward
        let mut updated_q_values = add_arrays(&replay_samples.reward, &array_mul(max_future_rewards, self.gamma));

        // for terminal steps, the updated q-value shall be exactly the reward (see deepmind paper)
        for (i, &done) in replay_samples.done.iter().enumerate() {
            if done {
                updated_q_values[i] = replay_samples.reward[i]
            }
        }

        let loss = self.model.train(replay_samples.state, replay_samples.action, updated_q_values)?;
        Ok(Some(loss))
    }

    /// Sync the target model with the main model
    pub fn update_target_network(&mut self) -> Result<()> { self.target_model.copy_weights_from(&self.model) }

    /// Writes the main model's weights
    pub fn write_checkpoint(
        &self,
        file: &Path,
    ) -> Result<PathBuf> {
        self.model.write_checkpoint(file)
    }

    /// Loads weights into the main and the target model
    pub fn read_checkpoint(
        &mut self,
        file: &Path,
    ) -> Result<()> {
        self.model.read_checkpoint(file)?;
        self.update_target_network()
    }
}

/// `N` distinct indices out of `0..len`
fn sample_indices<const N: usize>(
    rng: &mut impl Rng,
    len: usize,
) -> [usize; N] {
    let mut indices = [0_usize; N];
    for (slot, index) in indices.iter_mut().zip(rand::seq::index::sample(rng, len, N).iter()) {
        *slot = index;
    }
    indices
}

fn add_arrays<const N: usize>(
    lhs: &[f32; N],
    rhs: &[f32; N],
) -> [f32; N] {
    std::array::from_fn(|i| lhs[i] + rhs[i])
}

fn array_mul<const N: usize>(
    slice: [f32; N],
    value: f32,
) -> [f32; N] {
    slice.map(|e| e * value)
}

#[cfg(test)]
mod tests {
    use crate::ml_model::candle_model::{CandleModelParameter, QLearningCandleModel};
    use crate::test::corridor_test_environment::{CorridorAction, CorridorTestEnvironment};

    use super::*;

    type Model = QLearningCandleModel<CorridorTestEnvironment, 4>;

    fn agent() -> Result<DqnAgent<CorridorTestEnvironment, Model, 4>> {
        let env = CorridorTestEnvironment::default();
        let param = CandleModelParameter::default();
        DqnAgent::new(AgentParameter::default(), Model::init_for(&env, &param)?, Model::init_for(&env, &param)?)
    }

    #[test]
    fn test_optimize_needs_more_than_a_batch() -> Result<()> {
        let mut agent = agent()?;
        let mut env = CorridorTestEnvironment::default();
        for _ in 0..4 {
            let state = env.state_as_rc();
            let (state_next, reward, done) = env.step_as_rc(CorridorAction::Right)?;
            agent.add_experience(CorridorAction::Right, state, state_next, reward, done);
        }
        assert_eq!(agent.optimize()?, None);

        let state = env.state_as_rc();
        let (state_next, reward, done) = env.step_as_rc(CorridorAction::Right)?;
        agent.add_experience(CorridorAction::Right, state, state_next, reward, done);
        assert!(agent.optimize()?.is_some());
        Ok(())
    }

    #[test]
    fn test_target_network_starts_as_copy() -> Result<()> {
        let agent = agent()?;
        let env = CorridorTestEnvironment::default();
        let s = env.state_as_rc();
        let batch = [&s, &s, &s, &s];
        assert_eq!(
            agent.model.batch_predict_max_future_reward(batch)?,
            agent.target_model.batch_predict_max_future_reward(batch)?
        );
        Ok(())
    }

    #[test]
    fn test_replay_memory_must_exceed_batch() -> Result<()> {
        let env = CorridorTestEnvironment::default();
        let param = CandleModelParameter::default();
        for replay_memory_size in [0, 4] {
            let result = DqnAgent::<CorridorTestEnvironment, Model, 4>::new(
                AgentParameter {
                    replay_memory_size,
                    ..Default::default()
                },
                Model::init_for(&env, &param)?,
                Model::init_for(&env, &param)?,
            );
            assert!(result.is_err());
        }

        let result = DqnAgent::<CorridorTestEnvironment, Model, 4>::new(
            AgentParameter {
                episode_reward_history_len: 0,
                ..Default::default()
            },
            Model::init_for(&env, &param)?,
            Model::init_for(&env, &param)?,
        );
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn test_sample_indices_from_a_memory_one_larger_than_the_batch() {
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let mut indices: [usize; 4] = sample_indices(&mut rng, 5);
            indices.sort();
            assert!(indices.windows(2).all(|w| w[0] < w[1]));
            assert!(indices[3] < 5);
        }
    }

    #[test]
    fn test_optimize_samples_the_whole_memory() -> Result<()> {
        let mut agent = agent()?;
        let mut env = CorridorTestEnvironment::default();
        for _ in 0..5 {
            let state = env.state_as_rc();
            let (state_next, reward, done) = env.step_as_rc(CorridorAction::Right)?;
            agent.add_experience(CorridorAction::Right, state, state_next, reward, done);
        }
        for _ in 0..20 {
            let loss = agent.optimize()?;
            assert!(loss.is_some_and(|l| l.is_finite()));
        }
        Ok(())
    }
}

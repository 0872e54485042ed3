use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::Result;

use crate::prelude::{Environment, ModelActionType};

pub const DEFAULT_BATCH_SIZE: usize = 32;

/// Capability to produce the flat model input out of a state or a batch of states.
pub trait ToFeatureVector {
    /// Length of the feature vector produced for a single state.
    fn feature_len(&self) -> usize;

    fn to_feature_vector(&self) -> Vec<f32>;

    /// Produces the row-major concatenation of all feature vectors of `batch`,
    /// i.e. a `[N, feature_len]` matrix.
    fn batch_to_feature_vector<const N: usize>(batch: &[&Rc<Self>; N]) -> Vec<f32> {
        batch.iter().flat_map(|s| s.to_feature_vector()).collect()
    }
}

/// 'Physical' AI model abstraction
pub trait DeepQLearningModel<const BATCH_SIZE: usize = DEFAULT_BATCH_SIZE>: Sized {
    type E: Environment;

    /// Predicts the best action (highest Q-value) for the given state.
    fn predict_action(
        &self,
        state: &<Self::E as Environment>::S,
    ) -> Result<ModelActionType>;

    /// Highest predicted Q-value for each of the states
    fn batch_predict_max_future_reward(
        &self,
        states: [&Rc<<Self::E as Environment>::S>; BATCH_SIZE],
    ) -> Result<[f32; BATCH_SIZE]>;

    /// Performs a single training step using a batch of data.
    ///
    /// # Arguments
    /// * `state_batch` `BATCH_SIZE` states
    /// * `action_batch` action taken in each of the states
    /// * `updated_q_values` target Q-value of each (state, action) pair
    ///
    /// # Returns
    ///   calculated loss
    ///
    fn train(
        &mut self,
        state_batch: [&Rc<<Self::E as Environment>::S>; BATCH_SIZE],
        action_batch: [<Self::E as Environment>::A; BATCH_SIZE],
        updated_q_values: [f32; BATCH_SIZE],
    ) -> Result<f32>;

    /// Overwrites all weights with those of `other`
    fn copy_weights_from(
        &mut self,
        other: &Self,
    ) -> Result<()>;

    /// Writes the weights to `file` and returns the written path
    fn write_checkpoint(
        &self,
        file: &Path,
    ) -> Result<PathBuf>;

    fn read_checkpoint(
        &mut self,
        file: &Path,
    ) -> Result<()>;
}

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{linear, AdamW, Linear, Optimizer, ParamsAdamW, VarBuilder, VarMap};

use crate::ml_model::model::{DeepQLearningModel, ToFeatureVector, DEFAULT_BATCH_SIZE};
use crate::prelude::{Action, Environment, ModelActionType, QlError};

/// Fully connected Q-network: `input -> hidden -> hidden -> action_space`, ReLU activations
#[derive(Debug, Clone)]
pub struct QNetwork {
    fc1: Linear,
    fc2: Linear,
    out: Linear,
}

impl QNetwork {
    pub fn new(
        input_len: usize,
        hidden_len: usize,
        action_space: usize,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let fc1 = linear(input_len, hidden_len, vb.pp("fc1"))?;
        let fc2 = linear(hidden_len, hidden_len, vb.pp("fc2"))?;
        let out = linear(hidden_len, action_space, vb.pp("out"))?;
        Ok(Self { fc1, fc2, out })
    }
}

impl Module for QNetwork {
    fn forward(
        &self,
        xs: &Tensor,
    ) -> candle_core::Result<Tensor> {
        let xs = self.fc1.forward(xs)?.relu()?;
        let xs = self.fc2.forward(&xs)?.relu()?;
        self.out.forward(&xs)
    }
}

pub struct CandleModelParameter {
    pub hidden_len: usize,
    pub learning_rate: f64,
}

impl Default for CandleModelParameter {
    fn default() -> Self {
        Self {
            hidden_len: 128,
            learning_rate: 1e-4,
        }
    }
}

pub struct QLearningCandleModel<E, const BATCH_SIZE: usize = DEFAULT_BATCH_SIZE> {
    varmap: VarMap,
    network: QNetwork,
    optimizer: AdamW,
    device: Device,
    input_len: usize,
    action_space: usize,
    _phantom: PhantomData<E>,
}

impl<E, const BATCH_SIZE: usize> QLearningCandleModel<E, BATCH_SIZE>
where
    E: Environment,
    E::S: ToFeatureVector,
{
    /// Creates a freshly initialized model on the CPU.
    ///
    /// # Arguments
    /// * `input_len` length of a state's feature vector (see [ToFeatureVector::feature_len])
    /// * `action_space` number of possible actions = size of the model's output vector
    pub fn init(
        input_len: usize,
        action_space: usize,
        param: &CandleModelParameter,
    ) -> Result<Self> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let network = QNetwork::new(input_len, param.hidden_len, action_space, vb)?;
        let optimizer = AdamW::new(
            varmap.all_vars(),
            ParamsAdamW {
                lr: param.learning_rate,
                ..Default::default()
            },
        )?;

        Ok(Self {
            varmap,
            network,
            optimizer,
            device,
            input_len,
            action_space,
            _phantom: PhantomData,
        })
    }

    /// Creates a model matching the state and action dimensions of `environment`
    pub fn init_for(
        environment: &E,
        param: &CandleModelParameter,
    ) -> Result<Self> {
        Self::init(
            environment.state().feature_len(),
            environment.action_space() as usize,
            param,
        )
    }

    pub fn action_space(&self) -> usize { self.action_space }

    fn batch_tensor(
        &self,
        states: &[&Rc<E::S>; BATCH_SIZE],
    ) -> Result<Tensor> {
        let features = <E::S as ToFeatureVector>::batch_to_feature_vector(states);
        Ok(Tensor::from_vec(features, (BATCH_SIZE, self.input_len), &self.device)?)
    }
}

/// Mean Huber loss with delta 1
fn smooth_l1_loss(
    prediction: &Tensor,
    target: &Tensor,
) -> candle_core::Result<Tensor> {
    let diff = prediction.sub(target)?;
    let abs_diff = diff.abs()?;
    let ones = abs_diff.ones_like()?;
    abs_diff
        .lt(&ones)?
        .where_cond(&diff.sqr()?.affine(0.5, 0.0)?, &abs_diff.affine(1.0, -0.5)?)?
        .mean_all()
}

impl<E, const BATCH_SIZE: usize> DeepQLearningModel<BATCH_SIZE> for QLearningCandleModel<E, BATCH_SIZE>
where
    E: Environment,
    E::S: ToFeatureVector,
{
    type E = E;

    fn predict_action(
        &self,
        state: &E::S,
    ) -> Result<ModelActionType> {
        let input = Tensor::from_vec(state.to_feature_vector(), (1, self.input_len), &self.device)?;
        let q_values = self.network.forward(&input)?.squeeze(0)?;
        let best = q_values.argmax(0)?.to_scalar::<u32>()?;
        Ok(best as ModelActionType)
    }

    fn batch_predict_max_future_reward(
        &self,
        states: [&Rc<E::S>; BATCH_SIZE],
    ) -> Result<[f32; BATCH_SIZE]> {
        let input = self.batch_tensor(&states)?;
        let max_q = self.network.forward(&input)?.max(1)?.to_vec1::<f32>()?;
        max_q
            .try_into()
            .map_err(|v: Vec<f32>| QlError(format!("expected {} values, got {}", BATCH_SIZE, v.len())).into())
    }

    fn train(
        &mut self,
        state_batch: [&Rc<E::S>; BATCH_SIZE],
        action_batch: [E::A; BATCH_SIZE],
        updated_q_values: [f32; BATCH_SIZE],
    ) -> Result<f32> {
        let states = self.batch_tensor(&state_batch)?;
        let actions: Vec<u32> = action_batch.iter().map(|a| a.numeric() as u32).collect();
        let actions = Tensor::from_vec(actions, (BATCH_SIZE, 1), &self.device)?;
        let targets = Tensor::from_vec(updated_q_values.to_vec(), BATCH_SIZE, &self.device)?;

        // Q-value of the action actually taken
        let q_action = self.network.forward(&states)?.gather(&actions, 1)?.squeeze(1)?;
        let loss = smooth_l1_loss(&q_action, &targets)?;

        self.optimizer.backward_step(&loss)?;
        Ok(loss.to_scalar::<f32>()?)
    }

    fn copy_weights_from(
        &mut self,
        other: &Self,
    ) -> Result<()> {
        let source = other
            .varmap
            .data()
            .lock()
            .map_err(|_| QlError::from("weights lock poisoned"))?;
        let mut target = self
            .varmap
            .data()
            .lock()
            .map_err(|_| QlError::from("weights lock poisoned"))?;
        for (name, var) in target.iter_mut() {
            let source_var = source
                .get(name)
                .ok_or_else(|| QlError(format!("missing variable {}", name)))?;
            var.set(&source_var.as_tensor().detach())?;
        }
        Ok(())
    }

    fn write_checkpoint(
        &self,
        file: &Path,
    ) -> Result<PathBuf> {
        self.varmap.save(file)?;
        Ok(file.to_path_buf())
    }

    fn read_checkpoint(
        &mut self,
        file: &Path,
    ) -> Result<()> {
        self.varmap.load(file)?;
        Ok(())
    }
}

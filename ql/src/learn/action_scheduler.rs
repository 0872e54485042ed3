use anyhow::Result;
use rand::prelude::ThreadRng;
use rand::Rng;

use crate::ml_model::model::DeepQLearningModel;
use crate::prelude::{Action, Environment, ModelActionType};

pub struct SchedulerParameter {
    /// Exploration probability while the replay memory is filled initially
    pub eps_initial: f64,
    /// Exploration probability reached after `eps_annealing_steps`
    pub eps_final: f64,
    /// Exploration probability reached at `max_steps`
    pub eps_final_step: f64,
    /// Exploration probability in evaluation mode
    pub eps_evaluation: f64,
    pub eps_annealing_steps: usize,
    /// Number of pure random steps at the beginning
    pub replay_memory_start_size: usize,
    pub max_steps: usize,
}

impl Default for SchedulerParameter {
    fn default() -> Self {
        Self {
            eps_initial: 1.0,
            eps_final: 0.1,
            eps_final_step: 0.01,
            eps_evaluation: 0.0,
            eps_annealing_steps: 1_000_000,
            replay_memory_start_size: 50_000,
            max_steps: 25_000_000,
        }
    }
}

/// Epsilon-greedy action selection with a piecewise linear decaying epsilon:
///
/// ```text
///  ε
///  eps_initial  ────────┐
///                        ╲
///  eps_final              ╲____________
///                                      ‾‾‾‾‾‾‾─── eps_final_step
///               0   start    start+annealing     max_steps    (step)
/// ```
pub struct ActionScheduler {
    param: SchedulerParameter,
    action_space: ModelActionType,
    slope: f64,
    intercept: f64,
    slope_2: f64,
    intercept_2: f64,
    rng: ThreadRng,
}

impl ActionScheduler {
    pub fn new(
        param: SchedulerParameter,
        action_space: ModelActionType,
    ) -> Self {
        assert!(action_space > 0);
        let start = param.replay_memory_start_size as f64;

        let slope = match param.eps_annealing_steps {
            0 => 0.0,
            n => -(param.eps_initial - param.eps_final) / n as f64,
        };
        let intercept = param.eps_initial - slope * start;

        let remaining = param.max_steps as f64 - param.eps_annealing_steps as f64 - start;
        let (slope_2, intercept_2) = if remaining > 0.0 {
            let slope_2 = -(param.eps_final - param.eps_final_step) / remaining;
            (slope_2, param.eps_final_step - slope_2 * param.max_steps as f64)
        } else {
            (0.0, param.eps_final)
        };

        Self {
            param,
            action_space,
            slope,
            intercept,
            slope_2,
            intercept_2,
            rng: rand::thread_rng(),
        }
    }

    pub fn epsilon(
        &self,
        step: usize,
        evaluation: bool,
    ) -> f64 {
        let start = self.param.replay_memory_start_size;
        if evaluation {
            self.param.eps_evaluation
        } else if step < start {
            self.param.eps_initial
        } else if step < start + self.param.eps_annealing_steps {
            self.slope * step as f64 + self.intercept
        } else {
            f64::max(self.slope_2 * step as f64 + self.intercept_2, self.param.eps_final_step)
        }
    }

    /// Picks a random action with probability ε(step), the model's best action otherwise
    pub fn get_action<E, M, const BATCH_SIZE: usize>(
        &mut self,
        step: usize,
        state: &E::S,
        model: &M,
        evaluation: bool,
    ) -> Result<E::A>
    where
        E: Environment,
        M: DeepQLearningModel<BATCH_SIZE, E = E>,
    {
        let epsilon = self.epsilon(step, evaluation);
        let numeric = if self.rng.gen_range(0_f64..1_f64) < epsilon {
            self.rng.gen_range(0..self.action_space)
        } else {
            model.predict_action(state)?
        };
        <E::A as Action>::try_from_numeric(numeric)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use rustc_hash::FxHashSet;

    use crate::ml_model::candle_model::{CandleModelParameter, QLearningCandleModel};
    use crate::test::corridor_test_environment::{CorridorState, CorridorTestEnvironment};

    use super::*;

    fn scheduler() -> ActionScheduler {
        ActionScheduler::new(
            SchedulerParameter {
                eps_annealing_steps: 100,
                replay_memory_start_size: 50,
                max_steps: 1_150,
                ..Default::default()
            },
            2,
        )
    }

    #[rstest]
    #[case(0, 1.0)]
    #[case(49, 1.0)]
    #[case(50, 1.0)]
    #[case(100, 0.55)]
    #[case(150, 0.1)]
    #[case(650, 0.055)]
    #[case(1_150, 0.01)]
    #[case(5_000, 0.01)]
    fn test_epsilon_schedule(
        #[case] step: usize,
        #[case] expected: f64,
    ) {
        let epsilon = scheduler().epsilon(step, false);
        assert!((epsilon - expected).abs() < 1e-9, "step {}: {} != {}", step, epsilon, expected);
    }

    #[test]
    fn test_evaluation_epsilon() {
        assert_eq!(scheduler().epsilon(0, true), 0.0);
        assert_eq!(scheduler().epsilon(100_000, true), 0.0);
    }

    #[test]
    fn test_budget_shorter_than_annealing_keeps_final_epsilon() {
        let s = ActionScheduler::new(
            SchedulerParameter {
                eps_annealing_steps: 100,
                replay_memory_start_size: 50,
                max_steps: 100,
                ..Default::default()
            },
            2,
        );
        assert!((s.epsilon(200, false) - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_evaluation_mode_is_greedy() -> Result<()> {
        let env = CorridorTestEnvironment::default();
        let model = QLearningCandleModel::<CorridorTestEnvironment, 4>::init_for(&env, &CandleModelParameter::default())?;
        let mut s = scheduler();
        for p in 0..5 {
            let state = CorridorState::at(p);
            let greedy = model.predict_action(&state)?;
            for _ in 0..10 {
                let a = s.get_action::<CorridorTestEnvironment, _, 4>(10, &state, &model, true)?;
                assert_eq!(a.numeric(), greedy);
            }
        }
        Ok(())
    }

    #[test]
    fn test_initial_phase_explores_all_actions() -> Result<()> {
        let env = CorridorTestEnvironment::default();
        let model = QLearningCandleModel::<CorridorTestEnvironment, 4>::init_for(&env, &CandleModelParameter::default())?;
        let mut s = scheduler();
        let mut seen = FxHashSet::default();
        for _ in 0..200 {
            seen.insert(s.get_action::<CorridorTestEnvironment, _, 4>(0, env.state(), &model, false)?);
        }
        assert_eq!(seen.len(), 2);
        Ok(())
    }
}

use std::fmt::{Display, Formatter};
use std::hash::Hash;
use std::rc::Rc;

use anyhow::Result;

/// Data type we use to encode an `Action` to feed the model.
/// An index into the environment's action space.
pub type ModelActionType = u16;

pub trait Action: Display + Sized + Clone + Copy + Hash + PartialEq + Eq {
    /// Identifying the Action as a unique value in range (0..action_space)
    fn numeric(&self) -> ModelActionType;
    fn try_from_numeric(value: ModelActionType) -> Result<Self>;
}

/// Learning environment, modeling the world of a learning agent
pub trait Environment {
    /// State representation - covering all needs
    type S: Clone + DebugVisualizer;
    type A: Action;

    /// Number of possible actions; valid action values are `0..action_space()`
    fn action_space(&self) -> ModelActionType;

    /// Resets the environment to a defined starting point
    fn reset(&mut self) -> Result<()>;

    /// Current state
    fn state(&self) -> &Self::S;

    /// Convenience wrapper around [Self::state]
    fn state_as_rc(&self) -> Rc<Self::S> { Rc::new(self.state().clone()) }

    /// Performs one time/action-step.
    ///
    /// Applies the given `action` to the environment and returns:
    ///   - next state
    ///   - immediate reward earned during performing that step
    ///   - done flag (terminal state reached)
    ///
    fn step(
        &mut self,
        action: Self::A,
    ) -> Result<(&Self::S, f32, bool)>;

    /// Convenience wrapper around [Self::step] returning an [Rc] with a copy of the state.
    /// This should match the typical use-case.
    fn step_as_rc(
        &mut self,
        action: Self::A,
    ) -> Result<(Rc<Self::S>, f32, bool)> {
        let (state, reward, done) = self.step(action)?;
        Ok((Rc::new(state.clone()), reward, done))
    }

    /// Whether an error returned by [Self::step] merely ends the running episode
    /// (instead of aborting the whole learning process).
    fn is_episode_abort(
        &self,
        _error: &anyhow::Error,
    ) -> bool {
        false
    }
}

pub trait DebugVisualizer {
    fn one_line_info(&self) -> String;
}

#[derive(Debug)]
pub struct QlError(pub String);

impl QlError {
    pub fn from(msg: &str) -> Self { QlError(msg.to_string()) }
}

impl Display for QlError {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for QlError {}

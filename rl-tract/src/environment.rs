use std::fmt::{Display, Formatter};
use std::rc::Rc;

use anyhow::Result;
use nalgebra::{Point3, Vector3};
use ql::prelude::{Action, Environment, ModelActionType, QlError};
use rand::prelude::ThreadRng;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::dwi::{DwiVolume, PointOutsideOfDwiError};
use crate::sphere;
use crate::state::TractographyState;
use crate::streamline::Streamline;

pub struct TrackingParameter {
    /// Length of a tracking step in voxels
    pub step_width: f32,
    /// Number of tracking directions
    pub action_space: ModelActionType,
    /// Maximum angle (degrees) between two consecutive tracking steps
    pub max_angle: f32,
    /// Tracking stops where the FA falls below
    pub fa_threshold: f32,
    pub max_streamline_steps: usize,
}

impl Default for TrackingParameter {
    fn default() -> Self {
        Self {
            step_width: 1.0,
            action_space: 100,
            max_angle: 60.0,
            fa_threshold: 0.2,
            max_streamline_steps: 200,
        }
    }
}

/// Index into the environment's tracking directions
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct TrackingAction(pub ModelActionType);

impl Display for TrackingAction {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "d{}", self.0)
    }
}

impl Action for TrackingAction {
    fn numeric(&self) -> ModelActionType { self.0 }

    fn try_from_numeric(value: ModelActionType) -> Result<Self> { Ok(TrackingAction(value)) }
}

/// Fiber tracking as a learning environment.
///
/// An episode starts at a seed point and follows the chosen directions through the volume.
/// A step is rewarded with its alignment to the local fiber orientation; it ends the episode when
/// it turns too sharply (reward -1), leaves the white matter (reward 0) or reaches the step limit.
/// Steps leaving the volume fail with [PointOutsideOfDwiError], which ends the episode.
pub struct RlTractEnvironment {
    volume: Rc<DwiVolume>,
    param: TrackingParameter,
    directions: Vec<Vector3<f32>>,
    min_cos_angle: f32,
    seeds: Vec<Point3<f32>>,
    state: TractographyState,
    streamline: Vec<Point3<f32>>,
    steps: usize,
    rng: ThreadRng,
}

impl RlTractEnvironment {
    /// Seeds are all voxels with an FA of at least `param.fa_threshold`
    pub fn new(
        volume: Rc<DwiVolume>,
        param: TrackingParameter,
    ) -> Result<Self> {
        let seeds = volume.seed_points(param.fa_threshold);
        Self::with_seeds(volume, param, seeds)
    }

    pub fn with_seeds(
        volume: Rc<DwiVolume>,
        param: TrackingParameter,
        seeds: Vec<Point3<f32>>,
    ) -> Result<Self> {
        if param.action_space == 0 {
            return Err(QlError::from("action space must not be empty").into());
        }
        if !(param.step_width > 0.0 && param.step_width.is_finite()) || param.max_streamline_steps == 0 {
            return Err(QlError::from("step width and step limit must be positive").into());
        }
        if !(param.max_angle > 0.0 && param.max_angle <= 180.0) {
            return Err(QlError(format!("max angle {} out of range (0, 180]", param.max_angle)).into());
        }
        if !(0.0..1.0).contains(&param.fa_threshold) {
            return Err(QlError(format!("FA threshold {} out of range [0, 1)", param.fa_threshold)).into());
        }
        if seeds.is_empty() {
            return Err(QlError::from("no seed points").into());
        }
        if let Some(seed) = seeds.iter().find(|s| !volume.contains(s)) {
            return Err(PointOutsideOfDwiError { point: *seed }.into());
        }

        let directions = sphere::fibonacci_sphere(param.action_space as usize);
        let min_cos_angle = param.max_angle.to_radians().cos();
        let state = TractographyState::new(&volume, seeds[0], directions[0]);
        let mut env = Self {
            volume,
            param,
            directions,
            min_cos_angle,
            seeds,
            state,
            streamline: vec![],
            steps: 0,
            rng: rand::thread_rng(),
        };
        env.reset()?;
        Ok(env)
    }

    pub fn volume(&self) -> &DwiVolume { &self.volume }

    pub fn directions(&self) -> &[Vector3<f32>] { &self.directions }

    /// Points visited in the current episode, starting with the seed
    pub fn streamline(&self) -> &[Point3<f32>] { &self.streamline }

    pub fn take_streamline(&mut self) -> Streamline { Streamline(std::mem::take(&mut self.streamline)) }

    /// Starts a new streamline at `seed`, heading into `direction`
    pub fn reset_to(
        &mut self,
        seed: Point3<f32>,
        direction: Vector3<f32>,
    ) -> Result<()> {
        self.volume.interpolate(&seed)?;
        let direction = direction
            .try_normalize(1e-6)
            .ok_or_else(|| QlError::from("initial direction must not be zero"))?;
        self.state = TractographyState::new(&self.volume, seed, direction);
        self.streamline = vec![seed];
        self.steps = 0;
        Ok(())
    }

    /// Principal direction at `seed`; falls back to the first tracking direction in isotropic tissue
    pub fn principal_direction(
        &self,
        seed: &Point3<f32>,
    ) -> Result<Vector3<f32>> {
        let voxel = self.volume.interpolate(seed)?;
        Ok(if voxel.direction.norm() > 0.0 { voxel.direction } else { self.directions[0] })
    }
}

impl Environment for RlTractEnvironment {
    type S = TractographyState;
    type A = TrackingAction;

    fn action_space(&self) -> ModelActionType { self.param.action_space }

    /// Random seed, principal direction with random sign
    fn reset(&mut self) -> Result<()> {
        let seed = *self
            .seeds
            .choose(&mut self.rng)
            .ok_or_else(|| QlError::from("no seed points"))?;
        let direction = self.principal_direction(&seed)?;
        let direction = if self.rng.gen_bool(0.5) { direction } else { -direction };
        self.reset_to(seed, direction)
    }

    fn state(&self) -> &Self::S { &self.state }

    fn step(
        &mut self,
        action: Self::A,
    ) -> Result<(&Self::S, f32, bool)> {
        let direction = *self.directions.get(action.numeric() as usize).ok_or_else(|| {
            QlError(format!("action {} out of action space {}", action, self.param.action_space))
        })?;
        self.steps += 1;

        if direction.dot(self.state.previous_direction()) < self.min_cos_angle {
            return Ok((&self.state, -1.0, true));
        }

        let position = *self.state.position();
        let next = position + direction * self.param.step_width;
        let local = self.volume.interpolate(&position)?;
        let sample = self.volume.interpolate(&next)?;

        if sample.fa < self.param.fa_threshold {
            return Ok((&self.state, 0.0, true));
        }

        let reward = direction.dot(&local.direction).abs();
        self.state = TractographyState::new(&self.volume, next, direction);
        self.streamline.push(next);

        Ok((&self.state, reward, self.steps >= self.param.max_streamline_steps))
    }

    fn is_episode_abort(
        &self,
        error: &anyhow::Error,
    ) -> bool {
        error.is::<PointOutsideOfDwiError>()
    }
}

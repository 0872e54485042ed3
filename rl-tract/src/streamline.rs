use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::Result;
use itertools::Itertools;
use nalgebra::{Point3, Vector3};
use ql::ml_model::model::DeepQLearningModel;
use ql::prelude::{Action, Environment};

use crate::environment::{RlTractEnvironment, TrackingAction};

/// Polyline of tracked positions in voxel coordinates
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Streamline(pub Vec<Point3<f32>>);

impl Streamline {
    pub fn points(&self) -> &[Point3<f32>] { &self.0 }

    pub fn len(&self) -> usize { self.0.len() }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn length_mm(
        &self,
        voxel_size: f32,
    ) -> f32 {
        self.0
            .iter()
            .tuple_windows()
            .map(|(a, b)| (b - a).norm())
            .sum::<f32>()
            * voxel_size
    }

    /// Joins two streamlines which were tracked from the same seed into opposite directions.
    /// The result runs from the end of `backward` over the seed to the end of `self`.
    pub fn join_backward(
        self,
        backward: Streamline,
    ) -> Streamline {
        let mut points: Vec<_> = backward.0.into_iter().rev().collect();
        match points.is_empty() {
            true => points = self.0,
            false => points.extend(self.0.into_iter().skip(1)),
        }
        Streamline(points)
    }
}

/// Keeps the streamlines with a length (in mm) within `min_length..=max_length`
pub fn filter_by_length(
    streamlines: Vec<Streamline>,
    voxel_size: f32,
    min_length: f32,
    max_length: f32,
) -> Vec<Streamline> {
    streamlines
        .into_iter()
        .filter(|s| {
            let length = s.length_mm(voxel_size);
            length >= min_length && length <= max_length
        })
        .collect()
}

/// Greedy tracking with `model` from each of the seeds, into both directions of the local fiber orientation
pub fn track<M, const BATCH_SIZE: usize>(
    env: &mut RlTractEnvironment,
    model: &M,
    seeds: &[Point3<f32>],
) -> Result<Vec<Streamline>>
where
    M: DeepQLearningModel<BATCH_SIZE, E = RlTractEnvironment>,
{
    let mut streamlines = Vec::with_capacity(seeds.len());
    for seed in seeds {
        let direction = env.principal_direction(seed)?;
        let forward = track_from::<M, BATCH_SIZE>(env, model, *seed, direction)?;
        let backward = track_from::<M, BATCH_SIZE>(env, model, *seed, -direction)?;
        streamlines.push(forward.join_backward(backward));
    }
    log::info!("tracked {} streamlines", streamlines.len());
    Ok(streamlines)
}

fn track_from<M, const BATCH_SIZE: usize>(
    env: &mut RlTractEnvironment,
    model: &M,
    seed: Point3<f32>,
    direction: Vector3<f32>,
) -> Result<Streamline>
where
    M: DeepQLearningModel<BATCH_SIZE, E = RlTractEnvironment>,
{
    env.reset_to(seed, direction)?;
    loop {
        let action = TrackingAction::try_from_numeric(model.predict_action(env.state())?)?;
        let step = env.step(action).map(|(_, _, done)| done);
        match step {
            Ok(true) => break,
            Ok(false) => (),
            Err(e) if env.is_episode_abort(&e) => break,
            Err(e) => return Err(e),
        }
    }
    Ok(env.take_streamline())
}

/// Writes the streamlines as legacy ASCII VTK polydata, coordinates scaled to mm
pub fn write_vtk(
    file: &Path,
    streamlines: &[Streamline],
    voxel_size: f32,
) -> Result<()> {
    let num_points: usize = streamlines.iter().map(|s| s.len()).sum();
    let mut w = BufWriter::new(File::create(file)?);

    writeln!(w, "# vtk DataFile Version 3.0")?;
    writeln!(w, "rl-tract streamlines")?;
    writeln!(w, "ASCII")?;
    writeln!(w, "DATASET POLYDATA")?;
    writeln!(w, "POINTS {} float", num_points)?;
    for p in streamlines.iter().flat_map(|s| s.points()) {
        writeln!(w, "{} {} {}", p.x * voxel_size, p.y * voxel_size, p.z * voxel_size)?;
    }

    writeln!(w, "LINES {} {}", streamlines.len(), streamlines.len() + num_points)?;
    let mut offset = 0;
    for s in streamlines {
        writeln!(w, "{} {}", s.len(), (offset..offset + s.len()).join(" "))?;
        offset += s.len();
    }
    w.flush()?;

    log::info!("wrote {} streamlines to {}", streamlines.len(), file.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::rc::Rc;

    use ql::ml_model::candle_model::{CandleModelParameter, QLearningCandleModel};

    use crate::dwi::DwiVolume;
    use crate::environment::TrackingParameter;

    use super::*;

    fn line(points: &[(f32, f32, f32)]) -> Streamline { Streamline(points.iter().map(|&(x, y, z)| Point3::new(x, y, z)).collect()) }

    #[test]
    fn test_length() {
        let s = line(&[(0.0, 0.0, 0.0), (3.0, 4.0, 0.0), (3.0, 4.0, 2.0)]);
        assert!((s.length_mm(1.0) - 7.0).abs() < 1e-5);
        assert!((s.length_mm(2.0) - 14.0).abs() < 1e-5);
        assert_eq!(line(&[(1.0, 1.0, 1.0)]).length_mm(1.0), 0.0);
    }

    #[test]
    fn test_filter_by_length() {
        let streamlines = vec![
            line(&[(0.0, 0.0, 0.0), (5.0, 0.0, 0.0)]),
            line(&[(0.0, 0.0, 0.0), (25.0, 0.0, 0.0)]),
            line(&[(0.0, 0.0, 0.0), (250.0, 0.0, 0.0)]),
        ];
        let kept = filter_by_length(streamlines, 1.0, 20.0, 200.0);
        assert_eq!(kept, vec![line(&[(0.0, 0.0, 0.0), (25.0, 0.0, 0.0)])]);
    }

    #[test]
    fn test_join_backward() {
        let forward = line(&[(0.0, 0.0, 0.0), (1.0, 0.0, 0.0), (2.0, 0.0, 0.0)]);
        let backward = line(&[(0.0, 0.0, 0.0), (-1.0, 0.0, 0.0)]);
        assert_eq!(
            forward.clone().join_backward(backward),
            line(&[(-1.0, 0.0, 0.0), (0.0, 0.0, 0.0), (1.0, 0.0, 0.0), (2.0, 0.0, 0.0)])
        );
        assert_eq!(forward.clone().join_backward(Streamline::default()), forward);
    }

    #[test]
    fn test_write_vtk() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("streamlines.vtk");
        let streamlines = vec![
            line(&[(0.0, 0.0, 0.0), (1.0, 0.0, 0.0)]),
            line(&[(0.0, 1.0, 0.0), (0.0, 2.0, 0.0), (0.0, 3.0, 0.5)]),
        ];
        write_vtk(&file, &streamlines, 2.0)?;

        let content = fs::read_to_string(&file)?;
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "# vtk DataFile Version 3.0");
        assert_eq!(lines[3], "DATASET POLYDATA");
        assert_eq!(lines[4], "POINTS 5 float");
        assert_eq!(lines[9], "0 6 1");
        assert_eq!(lines[10], "LINES 2 7");
        assert_eq!(lines[11], "2 0 1");
        assert_eq!(lines[12], "3 2 3 4");
        Ok(())
    }

    #[test]
    fn test_track_runs_through_seed() -> Result<()> {
        let volume = Rc::new(DwiVolume::straight_phantom([12, 8, 8], 3..5)?);
        let mut env = RlTractEnvironment::new(
            volume,
            TrackingParameter {
                max_streamline_steps: 20,
                ..Default::default()
            },
        )?;
        let model = QLearningCandleModel::<RlTractEnvironment, 4>::init_for(&env, &CandleModelParameter::default())?;
        let seeds = [Point3::new(5.0, 4.0, 4.0), Point3::new(6.0, 3.0, 2.0)];

        let streamlines = track::<_, 4>(&mut env, &model, &seeds)?;
        assert_eq!(streamlines.len(), 2);
        for (s, seed) in streamlines.iter().zip(seeds.iter()) {
            assert!(s.len() >= 1 && s.len() <= 41);
            assert!(s.points().contains(seed));
        }
        Ok(())
    }
}

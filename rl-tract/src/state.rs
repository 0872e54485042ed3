use nalgebra::{Point3, Vector3};
use ql::ml_model::model::ToFeatureVector;
use ql::prelude::DebugVisualizer;

use crate::dwi::DwiVolume;

/// Edge length (in voxels) of the neighborhood grid sampled around the position
pub const NEIGHBORHOOD_LEN: usize = 3;
pub const FEATURE_LEN: usize = NEIGHBORHOOD_LEN * NEIGHBORHOOD_LEN * NEIGHBORHOOD_LEN * 3 + 3;

/// Tracking state: where we are, where we came from and what the tissue around us looks like
#[derive(Clone, Debug, PartialEq)]
pub struct TractographyState {
    position: Point3<f32>,
    previous_direction: Vector3<f32>,
    features: Vec<f32>,
}

impl TractographyState {
    pub fn new(
        volume: &DwiVolume,
        position: Point3<f32>,
        previous_direction: Vector3<f32>,
    ) -> Self {
        let features = neighborhood_features(volume, &position, &previous_direction);
        Self {
            position,
            previous_direction,
            features,
        }
    }

    pub fn position(&self) -> &Point3<f32> { &self.position }

    pub fn previous_direction(&self) -> &Vector3<f32> { &self.previous_direction }
}

/// FA weighted principal directions on the neighborhood grid (x fastest), followed by the previous direction.
///
/// Grid points outside of the volume contribute zeros.
/// Directions are flipped into the hemisphere of `previous_direction`, so the model sees a consistent orientation.
pub fn neighborhood_features(
    volume: &DwiVolume,
    position: &Point3<f32>,
    previous_direction: &Vector3<f32>,
) -> Vec<f32> {
    let half = (NEIGHBORHOOD_LEN / 2) as f32;
    let mut features = Vec::with_capacity(FEATURE_LEN);

    for k in 0..NEIGHBORHOOD_LEN {
        for j in 0..NEIGHBORHOOD_LEN {
            for i in 0..NEIGHBORHOOD_LEN {
                let offset = Vector3::new(i as f32 - half, j as f32 - half, k as f32 - half);
                let v = match volume.interpolate(&(position + offset)) {
                    Ok(voxel) if voxel.direction.dot(previous_direction) < 0.0 => -voxel.weighted_direction(),
                    Ok(voxel) => voxel.weighted_direction(),
                    Err(_) => Vector3::zeros(),
                };
                features.extend_from_slice(v.as_slice());
            }
        }
    }
    features.extend_from_slice(previous_direction.as_slice());
    features
}

impl DebugVisualizer for TractographyState {
    fn one_line_info(&self) -> String {
        format!(
            "position: ({:.2}, {:.2}, {:.2}), previous direction: ({:.2}, {:.2}, {:.2})",
            self.position.x,
            self.position.y,
            self.position.z,
            self.previous_direction.x,
            self.previous_direction.y,
            self.previous_direction.z
        )
    }
}

impl ToFeatureVector for TractographyState {
    fn feature_len(&self) -> usize { FEATURE_LEN }

    fn to_feature_vector(&self) -> Vec<f32> { self.features.clone() }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;

    #[test]
    fn test_feature_layout() -> Result<()> {
        let volume = DwiVolume::straight_phantom([8, 8, 8], 3..5)?;
        let state = TractographyState::new(&volume, Point3::new(4.0, 4.0, 4.0), -Vector3::x());
        let features = state.to_feature_vector();
        assert_eq!(features.len(), 84);
        assert_eq!(state.feature_len(), 84);

        // grid center (index 13) sits inside the bundle, flipped towards the previous direction
        assert!((features[13 * 3] + 0.8).abs() < 1e-5);
        // the grid row above the bundle (y = 5) is isotropic
        assert_eq!(&features[16 * 3..16 * 3 + 3], &[0.0, 0.0, 0.0]);
        assert_eq!(&features[81..], &[-1.0, 0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn test_grid_outside_of_volume_is_zero() -> Result<()> {
        let volume = DwiVolume::straight_phantom([4, 4, 4], 0..4)?;
        let features = neighborhood_features(&volume, &Point3::new(0.0, 0.0, 0.0), &Vector3::x());
        // first grid point is (-1, -1, -1)
        assert_eq!(&features[0..3], &[0.0, 0.0, 0.0]);
        // last grid point is (1, 1, 1)
        assert!((features[26 * 3] - 0.8).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_one_line_info() -> Result<()> {
        let volume = DwiVolume::straight_phantom([4, 4, 4], 0..4)?;
        let state = TractographyState::new(&volume, Point3::new(1.0, 2.0, 3.0), Vector3::x());
        assert!(state.one_line_info().starts_with("position: (1.00, 2.00, 3.00)"));
        Ok(())
    }
}

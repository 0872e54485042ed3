use std::f32::consts::PI;

use nalgebra::Vector3;

/// `n` evenly spread unit vectors covering the whole sphere (Fibonacci lattice).
///
/// Tracking directions are oriented, so unlike peak directions, `d` and `-d` are different actions.
pub fn fibonacci_sphere(n: usize) -> Vec<Vector3<f32>> {
    let golden_angle = PI * (3.0 - 5.0_f32.sqrt());
    (0..n)
        .map(|i| {
            let z = 1.0 - (2.0 * i as f32 + 1.0) / n as f32;
            let radius = (1.0 - z * z).sqrt();
            let theta = golden_angle * i as f32;
            Vector3::new(radius * theta.cos(), radius * theta.sin(), z)
        })
        .collect()
}

/// Index of the direction closest to `v`
pub fn nearest_direction(
    directions: &[Vector3<f32>],
    v: &Vector3<f32>,
) -> Option<usize> {
    directions
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.dot(v).total_cmp(&b.dot(v)))
        .map(|(i, _)| i)
}

//! Voxel grid of fiber orientations, as derived from diffusion weighted imaging (DWI):
//! every voxel holds the principal diffusion direction and the fractional anisotropy (FA).
//!
//! Coordinates are voxel coordinates; voxel `(i, j, k)` is centered at point `(i, j, k)`.
//! A point is inside the volume if it lies within `[0, dim - 1]` on every axis.

use std::fmt::{Display, Formatter};

use anyhow::Result;
use nalgebra::{Point3, Vector3};
use ql::prelude::QlError;

/// Raised when the DWI data is sampled at a point outside of the volume
#[derive(Debug, Clone, PartialEq)]
pub struct PointOutsideOfDwiError {
    pub point: Point3<f32>,
}

impl Display for PointOutsideOfDwiError {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "point ({:.2}, {:.2}, {:.2}) is outside of the DWI volume", self.point.x, self.point.y, self.point.z)
    }
}

impl std::error::Error for PointOutsideOfDwiError {}

/// Orientation sample; `direction` is a unit vector (or zero for isotropic tissue)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Voxel {
    pub direction: Vector3<f32>,
    pub fa: f32,
}

impl Voxel {
    pub fn isotropic() -> Self {
        Voxel {
            direction: Vector3::zeros(),
            fa: 0.0,
        }
    }

    /// Direction scaled by the anisotropy
    pub fn weighted_direction(&self) -> Vector3<f32> { self.direction * self.fa }
}

#[derive(Debug, Clone)]
pub struct DwiVolume {
    dims: [usize; 3],
    /// edge length of a voxel in mm
    voxel_size: f32,
    voxels: Vec<Voxel>,
}

impl DwiVolume {
    /// `voxels` in x-fastest order
    pub fn new(
        dims: [usize; 3],
        voxel_size: f32,
        voxels: Vec<Voxel>,
    ) -> Result<Self> {
        if dims.iter().any(|&d| d < 2) {
            return Err(QlError(format!("volume needs at least two voxels per axis, got {:?}", dims)).into());
        }
        if voxels.len() != dims[0] * dims[1] * dims[2] {
            return Err(QlError(format!("expected {} voxels, got {}", dims[0] * dims[1] * dims[2], voxels.len())).into());
        }
        if voxel_size <= 0.0 {
            return Err(QlError::from("voxel size must be positive").into());
        }
        let voxels = voxels
            .into_iter()
            .map(|v| match v.direction.try_normalize(1e-6) {
                Some(direction) => Voxel { direction, fa: v.fa.clamp(0.0, 1.0) },
                None => Voxel::isotropic(),
            })
            .collect();
        Ok(Self { dims, voxel_size, voxels })
    }

    /// Builds a volume by evaluating `f` at every voxel center
    pub fn from_fn(
        dims: [usize; 3],
        voxel_size: f32,
        f: impl Fn(Point3<f32>) -> Voxel,
    ) -> Result<Self> {
        let mut voxels = Vec::with_capacity(dims[0] * dims[1] * dims[2]);
        for k in 0..dims[2] {
            for j in 0..dims[1] {
                for i in 0..dims[0] {
                    voxels.push(f(Point3::new(i as f32, j as f32, k as f32)));
                }
            }
        }
        Self::new(dims, voxel_size, voxels)
    }

    /// A single straight bundle along the x axis, filling the rows `y` in `bundle_y` (all z).
    pub fn straight_phantom(
        dims: [usize; 3],
        bundle_y: std::ops::Range<usize>,
    ) -> Result<Self> {
        Self::from_fn(dims, 1.0, |p| {
            if bundle_y.contains(&(p.y as usize)) {
                Voxel {
                    direction: Vector3::x(),
                    fa: 0.8,
                }
            } else {
                Voxel::isotropic()
            }
        })
    }

    /// A quarter-circle bundle around the z axis: voxels with a distance to the z axis in
    /// `[inner_radius, outer_radius]` hold the tangential direction; all others are isotropic.
    pub fn arc_phantom(
        dims: [usize; 3],
        inner_radius: f32,
        outer_radius: f32,
    ) -> Result<Self> {
        Self::from_fn(dims, 1.0, |p| {
            let r = (p.x * p.x + p.y * p.y).sqrt();
            if r >= inner_radius && r <= outer_radius && r > 0.0 {
                Voxel {
                    direction: Vector3::new(-p.y / r, p.x / r, 0.0),
                    fa: 0.8,
                }
            } else {
                Voxel {
                    direction: Vector3::x(),
                    fa: 0.05,
                }
            }
        })
    }

    pub fn dims(&self) -> [usize; 3] { self.dims }

    pub fn voxel_size(&self) -> f32 { self.voxel_size }

    pub fn voxel(
        &self,
        i: usize,
        j: usize,
        k: usize,
    ) -> Option<&Voxel> {
        if i < self.dims[0] && j < self.dims[1] && k < self.dims[2] {
            Some(&self.voxels[self.index(i, j, k)])
        } else {
            None
        }
    }

    /// Brain mask: voxels with any anisotropy
    pub fn in_mask(
        &self,
        i: usize,
        j: usize,
        k: usize,
    ) -> bool {
        self.voxel(i, j, k).is_some_and(|v| v.fa > 0.0)
    }

    fn index(
        &self,
        i: usize,
        j: usize,
        k: usize,
    ) -> usize {
        (k * self.dims[1] + j) * self.dims[0] + i
    }

    pub fn contains(
        &self,
        p: &Point3<f32>,
    ) -> bool {
        (0..3).all(|axis| p[axis] >= 0.0 && p[axis] <= (self.dims[axis] - 1) as f32)
    }

    /// Trilinear interpolation of the orientation at `p`.
    ///
    /// Fiber directions are axial (`d` and `-d` are the same orientation), so the corner directions
    /// get aligned to the one with the largest weight before they are averaged.
    pub fn interpolate(
        &self,
        p: &Point3<f32>,
    ) -> Result<Voxel, PointOutsideOfDwiError> {
        if !self.contains(p) {
            return Err(PointOutsideOfDwiError { point: *p });
        }

        let base: [usize; 3] = std::array::from_fn(|axis| (p[axis].floor() as usize).min(self.dims[axis] - 2));
        let frac: [f32; 3] = std::array::from_fn(|axis| p[axis] - base[axis] as f32);

        let mut corners = Vec::with_capacity(8);
        for dk in 0..2 {
            for dj in 0..2 {
                for di in 0..2 {
                    let w = weight(frac[0], di) * weight(frac[1], dj) * weight(frac[2], dk);
                    let voxel = self.voxels[self.index(base[0] + di, base[1] + dj, base[2] + dk)];
                    corners.push((w, voxel));
                }
            }
        }

        let reference = corners
            .iter()
            .filter(|(_, v)| v.fa > 0.0)
            .max_by(|(a, _), (b, _)| a.total_cmp(b))
            .map(|(_, v)| v.direction)
            .unwrap_or_else(Vector3::zeros);

        let mut direction = Vector3::zeros();
        let mut fa = 0.0;
        for (w, v) in corners {
            let aligned = if v.direction.dot(&reference) < 0.0 { -v.direction } else { v.direction };
            direction += aligned * (w * v.fa);
            fa += w * v.fa;
        }

        Ok(match direction.try_normalize(1e-6) {
            Some(direction) => Voxel { direction, fa },
            None => Voxel { direction: Vector3::zeros(), fa },
        })
    }

    /// Centers of all voxels inside the mask with an FA of at least `fa_threshold`
    pub fn seed_points(
        &self,
        fa_threshold: f32,
    ) -> Vec<Point3<f32>> {
        let mut seeds = vec![];
        for k in 0..self.dims[2] {
            for j in 0..self.dims[1] {
                for i in 0..self.dims[0] {
                    if self.in_mask(i, j, k) && self.voxels[self.index(i, j, k)].fa >= fa_threshold {
                        seeds.push(Point3::new(i as f32, j as f32, k as f32));
                    }
                }
            }
        }
        seeds
    }
}

fn weight(
    frac: f32,
    offset: usize,
) -> f32 {
    match offset {
        0 => 1.0 - frac,
        _ => frac,
    }
}

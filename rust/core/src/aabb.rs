// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Axis-aligned bounding boxes in f64 precision
//!
//! Bounds are kept in f64 throughout authoring so that very large model
//! extents (georeferenced coordinates in the millions) do not lose
//! precision before an RTC origin is chosen. A freshly created `Aabb` is
//! collapsed (invalid) until at least one point is added.

use nalgebra::{Matrix4, Point3, Vector3};

/// Axis-aligned bounding box with f64 corners.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Aabb {
    pub min: Point3<f64>,
    pub max: Point3<f64>,
}

impl Aabb {
    /// Create new bounds initialized to the collapsed (invalid) state.
    pub fn new() -> Self {
        Self {
            min: Point3::new(f64::MAX, f64::MAX, f64::MAX),
            max: Point3::new(f64::MIN, f64::MIN, f64::MIN),
        }
    }

    /// Build bounds directly from corners.
    pub fn from_corners(min: Point3<f64>, max: Point3<f64>) -> Self {
        Self { min, max }
    }

    /// Build bounds from a flat `[x, y, z, x, y, z, ...]` position array.
    pub fn from_positions(positions: &[f64]) -> Self {
        let mut aabb = Self::new();
        for p in positions.chunks_exact(3) {
            aabb.expand_point(p[0], p[1], p[2]);
        }
        aabb
    }

    /// Check if bounds are valid (at least one point added).
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.min.x <= self.max.x
    }

    /// Expand bounds to include a point.
    #[inline]
    pub fn expand_point(&mut self, x: f64, y: f64, z: f64) {
        self.min.x = self.min.x.min(x);
        self.min.y = self.min.y.min(y);
        self.min.z = self.min.z.min(z);
        self.max.x = self.max.x.max(x);
        self.max.y = self.max.y.max(y);
        self.max.z = self.max.z.max(z);
    }

    /// Expand bounds to include another box. Invalid operands are ignored.
    pub fn union(&mut self, other: &Aabb) {
        if !other.is_valid() {
            return;
        }
        self.expand_point(other.min.x, other.min.y, other.min.z);
        self.expand_point(other.max.x, other.max.y, other.max.z);
    }

    /// Center of the box, or the origin when invalid.
    #[inline]
    pub fn center(&self) -> Point3<f64> {
        if !self.is_valid() {
            return Point3::origin();
        }
        nalgebra::center(&self.min, &self.max)
    }

    /// Diagonal extent per axis. Zero when invalid.
    #[inline]
    pub fn diagonal(&self) -> Vector3<f64> {
        if !self.is_valid() {
            return Vector3::zeros();
        }
        self.max - self.min
    }

    /// Translate the box by an offset.
    pub fn translated(&self, offset: &Vector3<f64>) -> Aabb {
        if !self.is_valid() {
            return *self;
        }
        Aabb {
            min: self.min + offset,
            max: self.max + offset,
        }
    }

    /// Bounds of this box transformed by a 4x4 matrix.
    ///
    /// Transforms all eight corners and re-collapses, which is exact for
    /// affine transforms.
    pub fn transformed(&self, matrix: &Matrix4<f64>) -> Aabb {
        if !self.is_valid() {
            return *self;
        }
        let mut out = Aabb::new();
        for i in 0..8 {
            let corner = Point3::new(
                if i & 1 == 0 { self.min.x } else { self.max.x },
                if i & 2 == 0 { self.min.y } else { self.max.y },
                if i & 4 == 0 { self.min.z } else { self.max.z },
            );
            let p = matrix.transform_point(&corner);
            out.expand_point(p.x, p.y, p.z);
        }
        out
    }
}

impl Default for Aabb {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_new_is_invalid() {
        let aabb = Aabb::new();
        assert!(!aabb.is_valid());
        assert_eq!(aabb.center(), Point3::origin());
        assert_eq!(aabb.diagonal(), Vector3::zeros());
    }

    #[test]
    fn test_expand_and_center() {
        let mut aabb = Aabb::new();
        aabb.expand_point(100.0, 200.0, 50.0);
        aabb.expand_point(150.0, 250.0, 75.0);

        assert!(aabb.is_valid());
        assert_eq!(aabb.min.x, 100.0);
        assert_eq!(aabb.max.y, 250.0);
        assert_relative_eq!(aabb.center().x, 125.0);
        assert_relative_eq!(aabb.center().y, 225.0);
    }

    #[test]
    fn test_union_ignores_invalid() {
        let mut a = Aabb::from_positions(&[0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        let before = a;
        a.union(&Aabb::new());
        assert_eq!(a, before);

        let b = Aabb::from_positions(&[-2.0, 0.5, 0.5, 0.5, 3.0, 0.5]);
        a.union(&b);
        assert_eq!(a.min.x, -2.0);
        assert_eq!(a.max.y, 3.0);
        assert_eq!(a.max.z, 1.0);
    }

    #[test]
    fn test_transformed_by_translation() {
        let aabb = Aabb::from_positions(&[0.0, 0.0, 0.0, 2.0, 2.0, 2.0]);
        let m = Matrix4::new_translation(&Vector3::new(10.0, -5.0, 1.0));
        let out = aabb.transformed(&m);
        assert_relative_eq!(out.min.x, 10.0);
        assert_relative_eq!(out.min.y, -5.0);
        assert_relative_eq!(out.max.z, 3.0);
    }

    #[test]
    fn test_transformed_by_rotation_contains_rotated_corners() {
        // 90 degrees about Z maps (2,1,0) into (-1,2,0)
        let aabb = Aabb::from_positions(&[0.0, 0.0, 0.0, 2.0, 1.0, 0.0]);
        let rot = nalgebra::UnitQuaternion::from_euler_angles(0.0, 0.0, std::f64::consts::FRAC_PI_2);
        let out = aabb.transformed(&rot.to_homogeneous());
        assert_relative_eq!(out.min.x, -1.0, epsilon = 1e-12);
        assert_relative_eq!(out.max.y, 2.0, epsilon = 1e-12);
    }
}

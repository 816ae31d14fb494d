// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Exact ray intersection against retained geometry
//!
//! The GPU pick pass answers "which entity is under the cursor"; this
//! module answers "where exactly on its surface". Layers that retain their
//! quantized geometry transform the ray into the portion's local space,
//! brute-force every triangle and report the nearest hit with an outward
//! normal. Layers without retained geometry return `None` — a configuration
//! trade-off, not an error.

use nalgebra::{Point3, Vector3};

/// A world-space ray. The direction does not need to be normalized;
/// reported distances are world units regardless.
#[derive(Debug, Clone, Copy)]
pub struct Ray {
    pub origin: Point3<f64>,
    pub direction: Vector3<f64>,
}

/// An exact surface hit in world space.
#[derive(Debug, Clone, Copy)]
pub struct PickSample {
    pub position: Point3<f64>,
    /// Unit normal of the hit triangle, oriented against the ray.
    pub normal: Vector3<f64>,
    /// World distance from the ray origin to the hit.
    pub distance: f64,
}

/// Möller–Trumbore ray/triangle intersection.
///
/// Returns the ray parameter `t` of the hit, in units of `dir`'s length,
/// or `None` for a miss or a backface-parallel degenerate triangle. Hits
/// behind the origin (`t < 0`) are rejected.
pub(crate) fn ray_triangle(
    origin: &Point3<f64>,
    dir: &Vector3<f64>,
    a: &Point3<f64>,
    b: &Point3<f64>,
    c: &Point3<f64>,
) -> Option<f64> {
    const EPSILON: f64 = 1e-12;

    let ab = b - a;
    let ac = c - a;
    let pvec = dir.cross(&ac);
    let det = ab.dot(&pvec);
    if det.abs() < EPSILON {
        return None;
    }
    let inv_det = 1.0 / det;

    let tvec = origin - a;
    let u = tvec.dot(&pvec) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }

    let qvec = tvec.cross(&ab);
    let v = dir.dot(&qvec) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }

    let t = ac.dot(&qvec) * inv_det;
    if t < 0.0 {
        return None;
    }
    Some(t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn unit_triangle() -> (Point3<f64>, Point3<f64>, Point3<f64>) {
        (
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        )
    }

    #[test]
    fn test_hit_inside_triangle() {
        let (a, b, c) = unit_triangle();
        let t = ray_triangle(
            &Point3::new(0.2, 0.2, 3.0),
            &Vector3::new(0.0, 0.0, -1.0),
            &a,
            &b,
            &c,
        )
        .expect("must hit");
        assert_relative_eq!(t, 3.0);
    }

    #[test]
    fn test_miss_outside_barycentric_range() {
        let (a, b, c) = unit_triangle();
        // over the hypotenuse: u + v > 1
        assert!(ray_triangle(
            &Point3::new(0.9, 0.9, 3.0),
            &Vector3::new(0.0, 0.0, -1.0),
            &a,
            &b,
            &c,
        )
        .is_none());
    }

    #[test]
    fn test_behind_origin_rejected() {
        let (a, b, c) = unit_triangle();
        assert!(ray_triangle(
            &Point3::new(0.2, 0.2, -1.0),
            &Vector3::new(0.0, 0.0, -1.0),
            &a,
            &b,
            &c,
        )
        .is_none());
    }

    #[test]
    fn test_parallel_ray_rejected() {
        let (a, b, c) = unit_triangle();
        assert!(ray_triangle(
            &Point3::new(0.2, 0.2, 1.0),
            &Vector3::new(1.0, 0.0, 0.0),
            &a,
            &b,
            &c,
        )
        .is_none());
    }

    #[test]
    fn test_backface_still_hits() {
        // Intersection is double-sided; orientation is the caller's concern
        let (a, b, c) = unit_triangle();
        let t = ray_triangle(
            &Point3::new(0.2, 0.2, -2.0),
            &Vector3::new(0.0, 0.0, 1.0),
            &a,
            &b,
            &c,
        )
        .expect("backface must hit");
        assert_relative_eq!(t, 2.0);
    }

    #[test]
    fn test_unnormalized_direction_scales_t() {
        let (a, b, c) = unit_triangle();
        let t = ray_triangle(
            &Point3::new(0.2, 0.2, 4.0),
            &Vector3::new(0.0, 0.0, -2.0),
            &a,
            &b,
            &c,
        )
        .unwrap();
        assert_relative_eq!(t, 2.0);
    }
}

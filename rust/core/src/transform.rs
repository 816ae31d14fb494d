// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transform composition helpers
//!
//! Meshes accept either a ready-made 4x4 matrix or a
//! position/rotation/scale triple; the triple composes in the conventional
//! T * R * S order. Rotations arrive as Euler degrees from loaders and as
//! quaternions from everything else.

use nalgebra::{Matrix3, Matrix4, UnitQuaternion, Vector3};

/// Compose a transform from translation, rotation and non-uniform scale.
pub fn compose_matrix(
    position: &Vector3<f64>,
    rotation: &UnitQuaternion<f64>,
    scale: &Vector3<f64>,
) -> Matrix4<f64> {
    Matrix4::new_translation(position)
        * rotation.to_homogeneous()
        * Matrix4::new_nonuniform_scaling(scale)
}

/// Quaternion from XYZ Euler angles in degrees, the convention model
/// loaders hand over.
pub fn quaternion_from_euler_degrees(angles: &Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::from_euler_angles(
        angles.x.to_radians(),
        angles.y.to_radians(),
        angles.z.to_radians(),
    )
}

/// Inverse-transpose of the upper 3x3, for transforming normals under
/// non-uniform scale. Falls back to the plain rotation block when the
/// matrix is singular (degenerate zero scale).
pub fn normal_matrix(model: &Matrix4<f64>) -> Matrix3<f64> {
    let linear: Matrix3<f64> = model.fixed_view::<3, 3>(0, 0).into_owned();
    match linear.try_inverse() {
        Some(inv) => inv.transpose(),
        None => linear,
    }
}

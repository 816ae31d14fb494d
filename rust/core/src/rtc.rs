// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Relative-to-center (RTC) coordinate handling
//!
//! Georeferenced models place geometry millions of units from the origin,
//! far beyond what f32 vertex data can represent without visible jitter.
//! The fix is to pick a double-precision `origin` per compatibility bucket
//! and store every position as a single-precision offset from it. The
//! origin re-enters the pipeline exactly once per layer per frame, folded
//! into the view matrix in f64 before narrowing to f32.

use nalgebra::{Matrix4, Vector3};

use crate::aabb::Aabb;

/// Coordinate magnitude above which positions need an RTC origin.
///
/// Matches the threshold used for georeferenced building models: anything
/// beyond 10km from the origin already loses centimeter precision in f32.
pub const RTC_THRESHOLD: f64 = 10_000.0;

/// Check whether a position array needs relative-to-center treatment.
pub fn needs_rtc(aabb: &Aabb) -> bool {
    if !aabb.is_valid() {
        return false;
    }
    let c = aabb.center();
    c.x.abs() > RTC_THRESHOLD || c.y.abs() > RTC_THRESHOLD || c.z.abs() > RTC_THRESHOLD
}

/// Split world positions into an RTC origin and origin-relative positions.
///
/// When the positions sit close to the origin no split happens: the
/// returned origin is zero and the positions come back unchanged. The
/// subtraction is carried out in f64, which is the whole point — the result
/// is small enough to survive the later narrowing to f32.
pub fn rtc_for_positions(positions: &[f64]) -> (Vector3<f64>, Vec<f64>) {
    let aabb = Aabb::from_positions(positions);
    if !needs_rtc(&aabb) {
        return (Vector3::zeros(), positions.to_vec());
    }
    let center = aabb.center();
    let origin = Vector3::new(center.x, center.y, center.z);
    let mut relative = Vec::with_capacity(positions.len());
    for p in positions.chunks_exact(3) {
        relative.push(p[0] - origin.x);
        relative.push(p[1] - origin.y);
        relative.push(p[2] - origin.z);
    }
    (origin, relative)
}

/// Compose the per-layer view matrix for an RTC origin.
///
/// `view * translate(origin)` is evaluated in f64 and only then narrowed,
/// so the large origin translation cancels against the camera position at
/// full precision. One matrix multiply per layer per frame.
pub fn rtc_view_matrix(view: &Matrix4<f64>, origin: &Vector3<f64>) -> Matrix4<f32> {
    if origin == &Vector3::zeros() {
        return view.cast::<f32>();
    }
    (view * Matrix4::new_translation(origin)).cast::<f32>()
}

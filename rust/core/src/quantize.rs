// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Lossy compression of vertex attributes for GPU residency
//!
//! Positions are quantized to 16-bit integers against a bounding box, with a
//! decode matrix (translate * scale) that reverses the mapping in the vertex
//! shader. Normals are octahedral-encoded to two signed bytes. UVs follow
//! the position scheme with a 3x3 decode matrix. Colors and material factors
//! drop to 8 bits. Quantization always happens in f64 and only the final
//! integers reach the GPU, so precision is bounded by the 16-bit grid, not
//! by intermediate float error.

use nalgebra::{Matrix3, Matrix4, Point3, Vector3};

use crate::aabb::Aabb;
use crate::error::{Error, Result};

/// Full range of a 16-bit quantized coordinate.
const QUANT_RANGE: f64 = 65535.0;

/// Decode matrix (translate * scale) mapping 16-bit grid coordinates back
/// into the source coordinate space of `aabb`.
pub fn create_positions_decode_matrix(aabb: &Aabb) -> Matrix4<f64> {
    let d = aabb.diagonal();
    let scale = Vector3::new(d.x / QUANT_RANGE, d.y / QUANT_RANGE, d.z / QUANT_RANGE);
    Matrix4::new_translation(&aabb.min.coords) * Matrix4::new_nonuniform_scaling(&scale)
}

/// Quantize positions to the 16-bit grid of `aabb`.
///
/// Returns the quantized coordinates together with the decode matrix that
/// reverses them. Flat axes (zero extent) quantize to 0 and decode back to
/// the axis minimum.
pub fn compress_positions(positions: &[f64], aabb: &Aabb) -> Result<(Vec<u16>, Matrix4<f64>)> {
    let decode = create_positions_decode_matrix(aabb);
    let quantized = quantize_positions_to_matrix(positions, &decode)?;
    Ok((quantized, decode))
}

/// Quantize positions against an existing decode matrix.
///
/// Used by the batching layer, where every portion shares the decode matrix
/// established by the layer's first portion. Coordinates outside the matrix
/// range clamp to the grid edges.
pub fn quantize_positions_to_matrix(
    positions: &[f64],
    decode: &Matrix4<f64>,
) -> Result<Vec<u16>> {
    if positions.len() % 3 != 0 {
        return Err(Error::MalformedPositions(positions.len()));
    }
    let (scale, translate) = decode_components(decode);
    let mut out = Vec::with_capacity(positions.len());
    for p in positions.chunks_exact(3) {
        for axis in 0..3 {
            let s = scale[axis];
            let q = if s != 0.0 {
                ((p[axis] - translate[axis]) / s).round().clamp(0.0, QUANT_RANGE)
            } else {
                0.0
            };
            out.push(q as u16);
        }
    }
    Ok(out)
}

/// Decode one quantized vertex back to source coordinates.
#[inline]
pub fn decompress_position(q: [u16; 3], decode: &Matrix4<f64>) -> Point3<f64> {
    decode.transform_point(&Point3::new(q[0] as f64, q[1] as f64, q[2] as f64))
}

/// Extract the per-axis scale and translation of a translate*scale decode
/// matrix.
#[inline]
fn decode_components(decode: &Matrix4<f64>) -> (Vector3<f64>, Vector3<f64>) {
    (
        Vector3::new(decode[(0, 0)], decode[(1, 1)], decode[(2, 2)]),
        Vector3::new(decode[(0, 3)], decode[(1, 3)], decode[(2, 3)]),
    )
}

/// Octahedral-encode a normal to two signed bytes.
///
/// The unit sphere folds onto the octahedron |x|+|y|+|z|=1, whose lower half
/// is unwrapped into the outer corners of the [-1,1]^2 square.
pub fn oct_encode_normal(n: &Vector3<f64>) -> [i8; 2] {
    let sum = n.x.abs() + n.y.abs() + n.z.abs();
    if sum == 0.0 {
        return [0, 127];
    }
    let mut x = n.x / sum;
    let mut y = n.y / sum;
    if n.z < 0.0 {
        let (px, py) = (x, y);
        x = (1.0 - py.abs()) * sign_not_zero(px);
        y = (1.0 - px.abs()) * sign_not_zero(py);
    }
    [
        (x * 127.0).round().clamp(-127.0, 127.0) as i8,
        (y * 127.0).round().clamp(-127.0, 127.0) as i8,
    ]
}

/// Decode an octahedral-encoded normal back to a unit vector.
pub fn oct_decode_normal(ex: i8, ey: i8) -> Vector3<f64> {
    let x = ex as f64 / 127.0;
    let y = ey as f64 / 127.0;
    let z = 1.0 - x.abs() - y.abs();
    let v = if z < 0.0 {
        Vector3::new(
            (1.0 - y.abs()) * sign_not_zero(x),
            (1.0 - x.abs()) * sign_not_zero(y),
            z,
        )
    } else {
        Vector3::new(x, y, z)
    };
    v.normalize()
}

#[inline]
fn sign_not_zero(v: f64) -> f64 {
    if v < 0.0 {
        -1.0
    } else {
        1.0
    }
}

/// Quantize UV coordinates to 16 bits.
///
/// Returns quantized pairs plus the 3x3 decode matrix (translate * scale in
/// homogeneous 2D) that reverses them.
pub fn compress_uvs(uvs: &[f64]) -> (Vec<u16>, Matrix3<f64>) {
    let (mut min_u, mut min_v) = (f64::MAX, f64::MAX);
    let (mut max_u, mut max_v) = (f64::MIN, f64::MIN);
    for uv in uvs.chunks_exact(2) {
        min_u = min_u.min(uv[0]);
        min_v = min_v.min(uv[1]);
        max_u = max_u.max(uv[0]);
        max_v = max_v.max(uv[1]);
    }
    if uvs.is_empty() {
        return (Vec::new(), Matrix3::identity());
    }
    let su = (max_u - min_u) / QUANT_RANGE;
    let sv = (max_v - min_v) / QUANT_RANGE;
    let mut out = Vec::with_capacity(uvs.len());
    for uv in uvs.chunks_exact(2) {
        let qu = if su != 0.0 { ((uv[0] - min_u) / su).round() } else { 0.0 };
        let qv = if sv != 0.0 { ((uv[1] - min_v) / sv).round() } else { 0.0 };
        out.push(qu.clamp(0.0, QUANT_RANGE) as u16);
        out.push(qv.clamp(0.0, QUANT_RANGE) as u16);
    }
    #[rustfmt::skip]
    let decode = Matrix3::new(
        su,  0.0, min_u,
        0.0, sv,  min_v,
        0.0, 0.0, 1.0,
    );
    (out, decode)
}

/// Quantize a [0, 1] color or material factor to 8 bits.
#[inline]
pub fn unit_to_u8(v: f64) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Quantize an RGB color plus opacity to RGBA bytes.
#[inline]
pub fn quantize_rgba(color: [f64; 3], opacity: f64) -> [u8; 4] {
    [
        unit_to_u8(color[0]),
        unit_to_u8(color[1]),
        unit_to_u8(color[2]),
        unit_to_u8(opacity),
    ]
}

/// Encode a pick id as an RGBA color for the picking render target.
#[inline]
pub fn pick_color(pick_id: u32) -> [u8; 4] {
    [
        (pick_id & 0xff) as u8,
        ((pick_id >> 8) & 0xff) as u8,
        ((pick_id >> 16) & 0xff) as u8,
        ((pick_id >> 24) & 0xff) as u8,
    ]
}

/// Recover a pick id from the RGBA color read back from the pick target.
#[inline]
pub fn pick_id(color: [u8; 4]) -> u32 {
    color[0] as u32
        | (color[1] as u32) << 8
        | (color[2] as u32) << 16
        | (color[3] as u32) << 24
}

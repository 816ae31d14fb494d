// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Edge-index derivation for triangle geometry
//!
//! Most model formats ship triangles without an explicit wireframe, so the
//! edge overlay has to be derived: an edge is worth drawing when it borders
//! exactly one triangle (an open boundary) or when the two triangles
//! sharing it meet at more than a threshold angle. Vertices are welded by
//! exact coordinate keys first, otherwise duplicated vertices along UV
//! seams would make every seam edge look like a boundary.

use nalgebra::{Matrix4, Vector3};
use rustc_hash::FxHashMap;

use crate::quantize::decompress_position;

#[derive(Debug)]
struct EdgeRecord {
    // Original (unwelded) endpoints of the first occurrence
    a: u32,
    b: u32,
    normal: Vector3<f64>,
    face_count: u32,
    sharp: bool,
}

/// Derive edge indices from quantized triangle geometry.
///
/// `threshold_deg` is the minimum dihedral angle between adjacent faces for
/// their shared edge to be emitted. Returns pairs of indices into the same
/// vertex array as `indices`.
pub fn build_edge_indices(
    positions_quantized: &[u16],
    indices: &[u32],
    decode: &Matrix4<f64>,
    threshold_deg: f64,
) -> Vec<u32> {
    let num_verts = positions_quantized.len() / 3;
    if num_verts == 0 {
        return Vec::new();
    }

    // Quantized coordinates are exact, so the triple is a safe weld key
    let mut welded: FxHashMap<(u16, u16, u16), u32> = FxHashMap::default();
    let mut canonical = vec![0u32; num_verts];
    let mut positions = Vec::with_capacity(num_verts);
    for v in 0..num_verts {
        let key = (
            positions_quantized[v * 3],
            positions_quantized[v * 3 + 1],
            positions_quantized[v * 3 + 2],
        );
        canonical[v] = *welded.entry(key).or_insert(v as u32);
        positions.push(
            decompress_position([key.0, key.1, key.2], decode).coords,
        );
    }

    collect_edges(&positions, &canonical, indices, threshold_deg)
}

/// [`build_edge_indices`] for raw f64 positions, used before quantization.
/// Welds vertices by bit-exact coordinates.
pub fn build_edge_indices_f64(positions: &[f64], indices: &[u32], threshold_deg: f64) -> Vec<u32> {
    let num_verts = positions.len() / 3;
    if num_verts == 0 {
        return Vec::new();
    }

    let mut welded: FxHashMap<(u64, u64, u64), u32> = FxHashMap::default();
    let mut canonical = vec![0u32; num_verts];
    let mut points = Vec::with_capacity(num_verts);
    for v in 0..num_verts {
        let (x, y, z) = (positions[v * 3], positions[v * 3 + 1], positions[v * 3 + 2]);
        let key = (x.to_bits(), y.to_bits(), z.to_bits());
        canonical[v] = *welded.entry(key).or_insert(v as u32);
        points.push(Vector3::new(x, y, z));
    }

    collect_edges(&points, &canonical, indices, threshold_deg)
}

fn collect_edges(
    positions: &[Vector3<f64>],
    canonical: &[u32],
    indices: &[u32],
    threshold_deg: f64,
) -> Vec<u32> {
    let num_verts = positions.len();
    let cos_threshold = threshold_deg.to_radians().cos();
    let mut edges: FxHashMap<(u32, u32), EdgeRecord> = FxHashMap::default();

    for tri in indices.chunks_exact(3) {
        let (i0, i1, i2) = (tri[0], tri[1], tri[2]);
        if i0 as usize >= num_verts || i1 as usize >= num_verts || i2 as usize >= num_verts {
            continue;
        }
        let p0 = positions[i0 as usize];
        let p1 = positions[i1 as usize];
        let p2 = positions[i2 as usize];
        let cross = (p1 - p0).cross(&(p2 - p0));
        let len = cross.norm();
        if len == 0.0 {
            // Degenerate triangle contributes no usable face normal
            continue;
        }
        let normal = cross / len;

        for (a, b) in [(i0, i1), (i1, i2), (i2, i0)] {
            let (ca, cb) = (canonical[a as usize], canonical[b as usize]);
            if ca == cb {
                continue;
            }
            let key = if ca < cb { (ca, cb) } else { (cb, ca) };
            edges
                .entry(key)
                .and_modify(|rec| {
                    rec.face_count += 1;
                    if rec.normal.dot(&normal) < cos_threshold {
                        rec.sharp = true;
                    }
                })
                .or_insert(EdgeRecord {
                    a,
                    b,
                    normal,
                    face_count: 1,
                    sharp: false,
                });
        }
    }

    let mut out = Vec::new();
    for rec in edges.values() {
        if rec.face_count == 1 || rec.sharp {
            out.push(rec.a);
            out.push(rec.b);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aabb::Aabb;
    use crate::quantize::compress_positions;

    fn quantize(positions: &[f64]) -> (Vec<u16>, Matrix4<f64>) {
        let aabb = Aabb::from_positions(positions);
        compress_positions(positions, &aabb).unwrap()
    }

    #[test]
    fn test_single_triangle_emits_all_boundaries() {
        let (q, decode) = quantize(&[0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
        let edges = build_edge_indices(&q, &[0, 1, 2], &decode, 10.0);
        assert_eq!(edges.len(), 6);
    }

    #[test]
    fn test_coplanar_quad_hides_diagonal() {
        // Two coplanar triangles sharing the diagonal 0-2
        let (q, decode) = quantize(&[
            0.0, 0.0, 0.0, //
            1.0, 0.0, 0.0, //
            1.0, 1.0, 0.0, //
            0.0, 1.0, 0.0,
        ]);
        let edges = build_edge_indices(&q, &[0, 1, 2, 0, 2, 3], &decode, 10.0);
        // 4 outer boundary edges, diagonal suppressed
        assert_eq!(edges.len(), 8);
        for pair in edges.chunks_exact(2) {
            let key = (pair[0].min(pair[1]), pair[0].max(pair[1]));
            assert_ne!(key, (0, 2), "coplanar diagonal must not be emitted");
        }
    }

    #[test]
    fn test_sharp_fold_keeps_shared_edge() {
        // Two triangles folded 90 degrees along the edge 0-1
        let positions = [
            0.0, 0.0, 0.0, //
            1.0, 0.0, 0.0, //
            0.5, 1.0, 0.0, //
            0.5, 0.0, 1.0,
        ];
        let edges = build_edge_indices_f64(&positions, &[0, 1, 2, 1, 0, 3], 10.0);
        let has_fold = edges
            .chunks_exact(2)
            .any(|p| (p[0].min(p[1]), p[0].max(p[1])) == (0, 1));
        assert!(has_fold, "90-degree fold edge must be emitted");
    }

    #[test]
    fn test_welded_duplicates_suppress_seam() {
        // Same coplanar quad, but the second triangle duplicates vertices
        // 0 and 2 at indices 4 and 5. Welding must still match them.
        let positions = [
            0.0, 0.0, 0.0, //
            1.0, 0.0, 0.0, //
            1.0, 1.0, 0.0, //
            0.0, 1.0, 0.0, //
            0.0, 0.0, 0.0, //
            1.0, 1.0, 0.0,
        ];
        let edges = build_edge_indices_f64(&positions, &[0, 1, 2, 4, 5, 3], 10.0);
        assert_eq!(edges.len(), 8);

        let (q, decode) = quantize(&positions);
        let edges_q = build_edge_indices(&q, &[0, 1, 2, 4, 5, 3], &decode, 10.0);
        assert_eq!(edges_q.len(), 8);
    }
}

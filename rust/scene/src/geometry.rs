// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Geometry store
//!
//! De-duplicated, quantized geometry shared by reference between meshes.
//! Instanced meshes hold an `Arc` to a stored geometry; the batching path
//! runs the same validation and quantization on inline arrays and then
//! copies the result into the layer, so both storage strategies see
//! identical vertex data for identical input.

use std::sync::Arc;

use nalgebra::{Matrix3, Matrix4, Vector3};
use rustc_hash::FxHashMap;
use strata_core::{
    build_edge_indices, compress_positions, compress_uvs, oct_encode_normal, rtc_for_positions,
    Aabb, PrimitiveKind,
};

use crate::error::{Error, Result};

/// Dihedral angle above which a derived edge is emitted.
const EDGE_THRESHOLD_DEG: f64 = 10.0;

/// Input to geometry creation — either raw f64 positions or pre-quantized
/// positions with their decode matrix, plus connectivity and optional
/// attributes.
#[derive(Debug, Clone, Default)]
pub struct GeometryParams {
    pub kind: Option<PrimitiveKind>,
    pub positions: Option<Vec<f64>>,
    pub positions_compressed: Option<Vec<u16>>,
    pub positions_decode_matrix: Option<Matrix4<f64>>,
    pub normals: Option<Vec<f64>>,
    pub uvs: Option<Vec<f64>>,
    pub indices: Option<Vec<u32>>,
    pub edge_indices: Option<Vec<u32>>,
    /// RTC origin the positions are already relative to.
    pub origin: Option<Vector3<f64>>,
}

/// Immutable quantized geometry owned by the store.
#[derive(Debug)]
pub struct Geometry {
    pub id: String,
    pub kind: PrimitiveKind,
    pub positions_quantized: Vec<u16>,
    pub decode_matrix: Matrix4<f64>,
    pub indices: Vec<u32>,
    pub edge_indices: Vec<u32>,
    pub normals_oct: Option<Vec<i8>>,
    pub uvs_quantized: Option<Vec<u16>>,
    pub uv_decode_matrix: Option<Matrix3<f64>>,
    /// Bounds in the origin-relative space of the quantized positions.
    pub aabb: Aabb,
    /// RTC origin: explicit from the caller plus any split extracted from
    /// large raw coordinates.
    pub origin: Vector3<f64>,
}

impl Geometry {
    #[inline]
    pub fn num_vertices(&self) -> usize {
        self.positions_quantized.len() / 3
    }

    #[inline]
    pub fn has_normals(&self) -> bool {
        self.normals_oct.is_some()
    }

    #[inline]
    pub fn has_uvs(&self) -> bool {
        self.uvs_quantized.is_some()
    }
}

/// Validate and quantize geometry input. Shared by the store and by the
/// batching mesh path.
pub(crate) fn build_geometry(id: &str, params: GeometryParams) -> Result<Geometry> {
    let kind = params
        .kind
        .ok_or_else(|| Error::InvalidGeometry(format!("geometry '{id}': primitive kind is required")))?;

    let (positions_quantized, decode_matrix, aabb, origin) =
        match (params.positions, params.positions_compressed) {
            (Some(_), Some(_)) => {
                return Err(Error::InvalidGeometry(format!(
                    "geometry '{id}': positions and positions_compressed are mutually exclusive"
                )));
            }
            (None, None) => {
                return Err(Error::InvalidGeometry(format!(
                    "geometry '{id}': either positions or positions_compressed is required"
                )));
            }
            (Some(raw), None) => {
                if params.positions_decode_matrix.is_some() {
                    return Err(Error::InvalidGeometry(format!(
                        "geometry '{id}': positions_decode_matrix conflicts with raw positions"
                    )));
                }
                if raw.is_empty() || raw.len() % 3 != 0 {
                    return Err(Error::InvalidGeometry(format!(
                        "geometry '{id}': positions length {} is not a positive multiple of 3",
                        raw.len()
                    )));
                }
                // Large coordinates split into an RTC origin before the
                // precision-destroying quantization step
                let (auto_origin, relative) = rtc_for_positions(&raw);
                let aabb = Aabb::from_positions(&relative);
                let (quantized, decode) = compress_positions(&relative, &aabb)?;
                let origin = params.origin.unwrap_or_else(Vector3::zeros) + auto_origin;
                (quantized, decode, aabb, origin)
            }
            (None, Some(quantized)) => {
                let decode = params.positions_decode_matrix.ok_or_else(|| {
                    Error::InvalidGeometry(format!(
                        "geometry '{id}': positions_compressed requires positions_decode_matrix"
                    ))
                })?;
                if quantized.is_empty() || quantized.len() % 3 != 0 {
                    return Err(Error::InvalidGeometry(format!(
                        "geometry '{id}': positions_compressed length {} is not a positive multiple of 3",
                        quantized.len()
                    )));
                }
                let aabb = quantized_bounds(&quantized, &decode);
                let origin = params.origin.unwrap_or_else(Vector3::zeros);
                (quantized, decode, aabb, origin)
            }
        };

    let num_vertices = positions_quantized.len() / 3;

    let indices = match params.indices {
        Some(indices) => {
            if let Some(&max) = indices.iter().max() {
                if max as usize >= num_vertices {
                    return Err(Error::InvalidGeometry(format!(
                        "geometry '{id}': index {max} out of range for {num_vertices} vertices"
                    )));
                }
            }
            indices
        }
        None if kind.needs_indices() => {
            return Err(Error::InvalidGeometry(format!(
                "geometry '{id}': indices are required for {kind} primitives"
            )));
        }
        None => Vec::new(),
    };

    let edge_indices = match params.edge_indices {
        Some(edges) => edges,
        None if kind.is_filled() => {
            build_edge_indices(&positions_quantized, &indices, &decode_matrix, EDGE_THRESHOLD_DEG)
        }
        None => Vec::new(),
    };

    let normals_oct = match params.normals {
        Some(normals) => {
            if normals.len() != num_vertices * 3 {
                return Err(Error::InvalidGeometry(format!(
                    "geometry '{id}': {} normal components for {num_vertices} vertices",
                    normals.len()
                )));
            }
            let mut oct = Vec::with_capacity(num_vertices * 2);
            for n in normals.chunks_exact(3) {
                let [ex, ey] = oct_encode_normal(&Vector3::new(n[0], n[1], n[2]));
                oct.push(ex);
                oct.push(ey);
            }
            Some(oct)
        }
        None => None,
    };

    let (uvs_quantized, uv_decode_matrix) = match params.uvs {
        Some(uvs) => {
            if uvs.len() != num_vertices * 2 {
                return Err(Error::InvalidGeometry(format!(
                    "geometry '{id}': {} uv components for {num_vertices} vertices",
                    uvs.len()
                )));
            }
            let (quantized, decode) = compress_uvs(&uvs);
            (Some(quantized), Some(decode))
        }
        None => (None, None),
    };

    Ok(Geometry {
        id: id.to_string(),
        kind,
        positions_quantized,
        decode_matrix,
        indices,
        edge_indices,
        normals_oct,
        uvs_quantized,
        uv_decode_matrix,
        aabb,
        origin,
    })
}

/// Bounds of pre-quantized positions, decoded through their matrix.
fn quantized_bounds(quantized: &[u16], decode: &Matrix4<f64>) -> Aabb {
    let mut qmin = [u16::MAX; 3];
    let mut qmax = [u16::MIN; 3];
    for v in quantized.chunks_exact(3) {
        for axis in 0..3 {
            qmin[axis] = qmin[axis].min(v[axis]);
            qmax[axis] = qmax[axis].max(v[axis]);
        }
    }
    let lo = strata_core::decompress_position(qmin, decode);
    let hi = strata_core::decompress_position(qmax, decode);
    let mut aabb = Aabb::new();
    aabb.expand_point(lo.x, lo.y, lo.z);
    aabb.expand_point(hi.x, hi.y, hi.z);
    aabb
}

/// Owning registry of shared geometries.
#[derive(Debug, Default)]
pub struct GeometryStore {
    geometries: FxHashMap<String, Arc<Geometry>>,
}

impl GeometryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate, quantize and register a geometry under `id`.
    pub fn create(&mut self, id: &str, params: GeometryParams) -> Result<Arc<Geometry>> {
        if self.geometries.contains_key(id) {
            return Err(Error::DuplicateId {
                kind: "geometry",
                id: id.to_string(),
            });
        }
        let geometry = Arc::new(build_geometry(id, params)?);
        self.geometries.insert(id.to_string(), geometry.clone());
        Ok(geometry)
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Geometry>> {
        self.geometries.get(id)
    }

    pub fn len(&self) -> usize {
        self.geometries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.geometries.is_empty()
    }

    pub fn clear(&mut self) {
        self.geometries.clear();
    }
}

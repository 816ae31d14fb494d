// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Batching layer
//!
//! Packs many distinct geometries into one shared buffer set so the whole
//! layer draws in a single call per pass. Positions arrive either raw
//! (transform pre-applied by the scene model, staged in f64 and quantized
//! once at finalize against the collected bounds) or pre-quantized (the
//! bucket key guarantees every portion shares the same decode matrix).
//! After finalize only the flag, color and offset columns stay mutable,
//! rewritten over the portion's whole vertex range — O(portion size), the
//! price batching pays for drawing everything at once.

use nalgebra::{Matrix3, Matrix4, Point3, Vector3};
use strata_core::{
    create_positions_decode_matrix, decompress_position, oct_encode_normal, pack_render_flags,
    quantize_positions_to_matrix, rtc_view_matrix, Aabb, EntityFlags, PassContext, PrimitiveKind,
};

use crate::columns::Column;
use crate::error::{Error, Result};
use crate::gpu::{BufferUsage, GpuContext};
use crate::picking::{ray_triangle, PickSample, Ray};
use crate::renderer::{LayerBuffers, LayerCounts, LayerDrawState, StorageKind};

use super::LayerCommon;

/// One mesh's contribution to the layer.
#[derive(Debug)]
struct BatchPortion {
    vert_base: usize,
    num_verts: usize,
    index_base: usize,
    num_indices: usize,
    flags: EntityFlags,
    transparent: bool,
    offset: Vector3<f64>,
    retired: bool,
}

/// Input to [`BatchingLayer::create_portion`], prepared by the scene model:
/// transforms already applied, colors already quantized, normals already
/// rotated and oct-encoded when the source had any.
#[derive(Debug)]
pub(crate) struct BatchPortionSource<'a> {
    /// Origin-relative f64 positions (raw-mode buckets).
    pub positions_raw: Option<&'a [f64]>,
    /// Pre-quantized positions (decode-matrix buckets).
    pub positions_quantized: Option<&'a [u16]>,
    /// Local 0-based indices.
    pub indices: &'a [u32],
    /// Local 0-based edge index pairs.
    pub edge_indices: &'a [u32],
    /// Oct-encoded per-vertex normals; `None` derives flat normals for
    /// filled primitives.
    pub normals_oct: Option<Vec<i8>>,
    pub uvs: Option<&'a [f64]>,
    pub color: [u8; 4],
    pub metallic_roughness: [u8; 2],
    pub pick_color: [u8; 4],
}

#[derive(Debug)]
pub(crate) struct BatchingLayer {
    pub common: LayerCommon,
    capacity_vertices: usize,
    capacity_indices: usize,
    /// Fixed up front for pre-quantized buckets, established at finalize
    /// for raw buckets.
    decode_matrix: Option<Matrix4<f64>>,
    positions_raw: Vec<f64>,
    positions: Column<u16>,
    normals: Column<i8>,
    uvs_raw: Vec<f64>,
    uvs: Column<u16>,
    uv_decode_matrix: Option<Matrix3<f64>>,
    colors: Column<u8>,
    metallic_roughness: Column<u8>,
    pick_colors: Column<u8>,
    flags: Column<u32>,
    offsets: Column<f32>,
    indices: Column<u32>,
    edge_indices: Column<u32>,
    has_uvs: bool,
    has_normals: bool,
    num_vertices: usize,
    num_indices: usize,
    num_edge_indices: usize,
    portions: Vec<BatchPortion>,
}

impl BatchingLayer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        primitive: PrimitiveKind,
        origin: Vector3<f64>,
        decode_matrix: Option<Matrix4<f64>>,
        texture_set: Option<String>,
        texture_has_color: bool,
        texture_has_mr: bool,
        pass_ctx: PassContext,
        readable: bool,
        capacity_vertices: usize,
    ) -> Self {
        Self {
            common: LayerCommon::new(
                StorageKind::Batching,
                primitive,
                origin,
                texture_set,
                texture_has_color,
                texture_has_mr,
                pass_ctx,
                readable,
            ),
            capacity_vertices,
            capacity_indices: capacity_vertices * primitive.index_capacity_factor(),
            decode_matrix,
            positions_raw: Vec::new(),
            positions: Column::new(),
            normals: Column::new(),
            uvs_raw: Vec::new(),
            uvs: Column::new(),
            uv_decode_matrix: None,
            colors: Column::new(),
            metallic_roughness: Column::new(),
            pick_colors: Column::new(),
            flags: Column::new(),
            offsets: Column::new(),
            indices: Column::new(),
            edge_indices: Column::new(),
            has_uvs: false,
            has_normals: false,
            num_vertices: 0,
            num_indices: 0,
            num_edge_indices: 0,
            portions: Vec::new(),
        }
    }

    /// Whether a portion of the given size still fits.
    ///
    /// The caller rolls over to a fresh layer with the same bucket key when
    /// this returns false; the layer itself never rolls.
    pub fn can_create_portion(&self, num_vertices: usize, num_indices: usize) -> bool {
        !self.common.sealed
            && !self.common.finalized
            && self.num_vertices + num_vertices <= self.capacity_vertices
            && self.num_indices + num_indices <= self.capacity_indices
    }

    /// Append one mesh's geometry, expanded to per-vertex granularity.
    pub fn create_portion(&mut self, src: BatchPortionSource<'_>) -> Result<usize> {
        if self.common.finalized || self.common.sealed {
            return Err(Error::AlreadyFinalized("create_portion on a sealed batching layer"));
        }

        let vert_base = self.num_vertices;
        let num_verts = match (src.positions_raw, src.positions_quantized, self.decode_matrix) {
            (Some(raw), None, None) => {
                self.positions_raw.extend_from_slice(raw);
                raw.len() / 3
            }
            (None, Some(quantized), Some(_)) => {
                self.positions.extend_from_slice(quantized);
                quantized.len() / 3
            }
            _ => {
                return Err(Error::InvalidMesh(
                    "portion position mode does not match its layer bucket".to_string(),
                ));
            }
        };

        // Index columns hold layer-wide vertex ids
        let base = vert_base as u32;
        for &i in src.indices {
            self.indices.push(i + base);
        }
        for &i in src.edge_indices {
            self.edge_indices.push(i + base);
        }

        if self.common.primitive.is_filled() {
            let oct = match src.normals_oct {
                Some(oct) => oct,
                None => {
                    let local = self.portion_positions_f64(src.positions_raw, src.positions_quantized);
                    flat_normals_oct(&local, src.indices)
                }
            };
            self.normals.extend_from_slice(&oct);
            self.has_normals = true;
        }

        // UVs stay optional per portion; absent ones pad with zeros so the
        // column keeps per-vertex alignment
        if src.uvs.is_some() || self.has_uvs {
            self.uvs_raw.resize(vert_base * 2, 0.0);
            match src.uvs {
                Some(uv) => {
                    self.uvs_raw.extend_from_slice(uv);
                    self.has_uvs = true;
                }
                None => self.uvs_raw.resize((vert_base + num_verts) * 2, 0.0),
            }
        }

        self.colors.extend_pattern(&src.color, num_verts);
        self.metallic_roughness.extend_pattern(&src.metallic_roughness, num_verts);
        self.pick_colors.extend_pattern(&src.pick_color, num_verts);
        self.flags.extend_repeat(0, num_verts);
        self.offsets.extend_repeat(0.0, num_verts * 3);

        self.num_vertices += num_verts;
        self.num_indices += src.indices.len();
        self.num_edge_indices += src.edge_indices.len();
        self.common.counters.num_portions += 1;

        self.portions.push(BatchPortion {
            vert_base,
            num_verts,
            index_base: self.indices.len() - src.indices.len(),
            num_indices: src.indices.len(),
            flags: EntityFlags::empty(),
            transparent: false,
            offset: Vector3::zeros(),
            retired: false,
        });
        Ok(self.portions.len() - 1)
    }

    /// f64 positions of the portion being created, for normal derivation.
    fn portion_positions_f64(
        &self,
        raw: Option<&[f64]>,
        quantized: Option<&[u16]>,
    ) -> Vec<f64> {
        if let Some(raw) = raw {
            return raw.to_vec();
        }
        let (quantized, decode) = (quantized.unwrap_or(&[]), self.decode_matrix.unwrap_or_else(Matrix4::identity));
        let mut out = Vec::with_capacity(quantized.len());
        for q in quantized.chunks_exact(3) {
            let p = decompress_position([q[0], q[1], q[2]], &decode);
            out.extend_from_slice(&[p.x, p.y, p.z]);
        }
        out
    }

    /// Compile all staged columns into GPU buffers.
    pub fn finalize(&mut self, gpu: &mut dyn GpuContext) -> Result<()> {
        if self.common.finalized {
            return Err(Error::AlreadyFinalized("finalize"));
        }

        // Raw buckets quantize here, against the bounds of everything that
        // was staged
        if self.decode_matrix.is_none() {
            let aabb = Aabb::from_positions(&self.positions_raw);
            let decode = create_positions_decode_matrix(&aabb);
            let quantized = quantize_positions_to_matrix(&self.positions_raw, &decode)?;
            self.positions.extend_from_slice(&quantized);
            self.positions_raw = Vec::new();
            self.decode_matrix = Some(decode);
        }

        if self.has_uvs {
            self.uvs_raw.resize(self.num_vertices * 2, 0.0);
            let (quantized, decode) = strata_core::compress_uvs(&self.uvs_raw);
            self.uvs.extend_from_slice(&quantized);
            self.uv_decode_matrix = Some(decode);
            self.uvs_raw = Vec::new();
        }

        let readable = self.common.readable;
        self.positions.finalize(gpu, BufferUsage::Vertex, readable);
        self.normals.finalize(gpu, BufferUsage::Vertex, false);
        self.uvs.finalize(gpu, BufferUsage::Vertex, false);
        self.colors.finalize(gpu, BufferUsage::Vertex, true);
        self.metallic_roughness.finalize(gpu, BufferUsage::Vertex, false);
        self.pick_colors.finalize(gpu, BufferUsage::Vertex, false);
        self.flags.finalize(gpu, BufferUsage::Vertex, true);
        self.offsets.finalize(gpu, BufferUsage::Vertex, true);
        self.indices.finalize(gpu, BufferUsage::Index, readable);
        self.edge_indices.finalize(gpu, BufferUsage::Index, false);

        self.common.finalized = true;
        Ok(())
    }

    pub fn flush(&mut self, gpu: &mut dyn GpuContext) {
        self.flags.flush(gpu);
        self.colors.flush(gpu);
        self.offsets.flush(gpu);
    }

    pub fn set_portion_flags(
        &mut self,
        portion: usize,
        flags: EntityFlags,
        transparent: bool,
    ) -> Option<(EntityFlags, bool)> {
        let ctx = self.common.pass_ctx;
        let Some(p) = self.portions.get_mut(portion) else {
            tracing::error!(portion, "unknown batching portion");
            return None;
        };
        if p.retired {
            return None;
        }
        let old = (p.flags, p.transparent);
        if old == (flags, transparent) {
            return Some(old);
        }
        let word = pack_render_flags(flags, transparent, &ctx);
        self.flags.fill(p.vert_base, p.num_verts, word);
        p.flags = flags;
        p.transparent = transparent;
        self.common.counters.apply(old.0, old.1, false);
        self.common.counters.apply(flags, transparent, true);
        Some(old)
    }

    pub fn set_portion_color(&mut self, portion: usize, rgba: [u8; 4]) {
        let Some(p) = self.portions.get(portion) else {
            tracing::error!(portion, "unknown batching portion");
            return;
        };
        if p.retired {
            return;
        }
        self.colors.fill_pattern(p.vert_base * 4, p.num_verts, &rgba);
    }

    pub fn set_portion_offset(&mut self, portion: usize, offset: Vector3<f64>) {
        let Some(p) = self.portions.get_mut(portion) else {
            tracing::error!(portion, "unknown batching portion");
            return;
        };
        if p.retired {
            return;
        }
        p.offset = offset;
        let pattern = [offset.x as f32, offset.y as f32, offset.z as f32];
        self.offsets.fill_pattern(p.vert_base * 3, p.num_verts, &pattern);
    }

    pub fn retire_portion(&mut self, portion: usize) -> Option<(EntityFlags, bool)> {
        let Some(p) = self.portions.get_mut(portion) else {
            tracing::error!(portion, "unknown batching portion");
            return None;
        };
        if p.retired {
            return None;
        }
        p.retired = true;
        let old = (p.flags, p.transparent);
        let (base, count) = (p.vert_base, p.num_verts);
        self.flags.fill(base, count, 0);
        self.common.counters.apply(old.0, old.1, false);
        self.common.counters.num_portions -= 1;
        Some(old)
    }

    pub fn draw_state(&self, view_matrix: &Matrix4<f64>) -> Result<LayerDrawState> {
        if !self.common.finalized {
            return Err(Error::NotFinalized("draw_state"));
        }
        let decode = self.decode_matrix.unwrap_or_else(Matrix4::identity);
        Ok(LayerDrawState {
            storage: StorageKind::Batching,
            primitive: self.common.primitive,
            sort_id: self.common.sort_id.clone(),
            view_matrix: rtc_view_matrix(view_matrix, &self.common.origin),
            decode_matrix: decode.cast::<f32>(),
            origin: self.common.origin,
            texture_set: self.common.texture_set.clone(),
            supports_pbr: self.has_normals && self.common.texture_has_mr,
            supports_color_texture: self.has_uvs && self.common.texture_has_color,
            counts: LayerCounts {
                num_vertices: self.num_vertices,
                num_indices: self.num_indices,
                num_edge_indices: self.num_edge_indices,
                num_instances: 0,
            },
            buffers: LayerBuffers {
                positions: self.positions.buffer(),
                normals: self.normals.buffer(),
                colors: self.colors.buffer(),
                metallic_roughness: self.metallic_roughness.buffer(),
                uvs: self.uvs.buffer(),
                flags: self.flags.buffer(),
                offsets: self.offsets.buffer(),
                pick_colors: self.pick_colors.buffer(),
                indices: self.indices.buffer(),
                edge_indices: self.edge_indices.buffer(),
                instance_matrices: None,
                instance_normal_matrices: None,
            },
        })
    }

    /// Exact ray intersection against this portion's retained geometry.
    ///
    /// Batched positions already carry their mesh transform, so the ray
    /// only needs the origin and per-portion offset removed before testing
    /// decompressed triangles directly.
    pub fn ray_pick(&self, portion: usize, ray: &Ray) -> Option<PickSample> {
        if !self.common.finalized || !self.common.readable || !self.common.primitive.is_filled() {
            return None;
        }
        let p = self.portions.get(portion)?;
        if p.retired {
            return None;
        }
        let decode = self.decode_matrix?;
        let positions = self.positions.as_slice();
        let indices = self.indices.as_slice();
        if positions.is_empty() || indices.is_empty() {
            return None;
        }

        let local_origin: Point3<f64> = ray.origin - self.common.origin - p.offset;
        let dir = ray.direction;
        let vertex = |i: u32| -> Point3<f64> {
            let v = i as usize * 3;
            decompress_position([positions[v], positions[v + 1], positions[v + 2]], &decode)
        };

        let mut best: Option<(f64, Point3<f64>, Vector3<f64>)> = None;
        for tri in indices[p.index_base..p.index_base + p.num_indices].chunks_exact(3) {
            let (a, b, c) = (vertex(tri[0]), vertex(tri[1]), vertex(tri[2]));
            if let Some(t) = ray_triangle(&local_origin, &dir, &a, &b, &c) {
                if best.map_or(true, |(bt, _, _)| t < bt) {
                    let normal = (b - a).cross(&(c - a));
                    best = Some((t, local_origin + dir * t, normal));
                }
            }
        }

        let (_, local_pos, normal) = best?;
        let mut normal = normal.normalize();
        if normal.dot(&dir) > 0.0 {
            normal = -normal;
        }
        let world = local_pos + self.common.origin + p.offset;
        Some(PickSample {
            position: world,
            normal,
            distance: (world - ray.origin).norm(),
        })
    }

    pub fn destroy(&mut self, gpu: &mut dyn GpuContext) {
        for column in [&mut self.positions, &mut self.uvs] {
            column.destroy(gpu);
        }
        self.normals.destroy(gpu);
        self.colors.destroy(gpu);
        self.metallic_roughness.destroy(gpu);
        self.pick_colors.destroy(gpu);
        self.flags.destroy(gpu);
        self.offsets.destroy(gpu);
        self.indices.destroy(gpu);
        self.edge_indices.destroy(gpu);
        self.positions_raw = Vec::new();
        self.uvs_raw = Vec::new();
        self.common.destroyed = true;
    }
}

/// Flat per-vertex normals: each vertex takes the face normal of one of
/// its triangles (last writer wins on shared vertices).
fn flat_normals_oct(positions: &[f64], indices: &[u32]) -> Vec<i8> {
    let num_verts = positions.len() / 3;
    let mut normals = vec![Vector3::new(0.0, 0.0, 1.0); num_verts];
    for tri in indices.chunks_exact(3) {
        let at = |i: u32| {
            let v = i as usize * 3;
            Vector3::new(positions[v], positions[v + 1], positions[v + 2])
        };
        if tri.iter().any(|&i| i as usize >= num_verts) {
            continue;
        }
        let (a, b, c) = (at(tri[0]), at(tri[1]), at(tri[2]));
        let cross = (b - a).cross(&(c - a));
        if cross.norm() == 0.0 {
            continue;
        }
        let n = cross.normalize();
        for &i in tri {
            normals[i as usize] = n;
        }
    }
    let mut oct = Vec::with_capacity(num_verts * 2);
    for n in &normals {
        let [ex, ey] = oct_encode_normal(n);
        oct.push(ex);
        oct.push(ey);
    }
    oct
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HeadlessContext;
    use strata_core::oct_decode_normal;

    fn test_layer(readable: bool, capacity: usize) -> BatchingLayer {
        BatchingLayer::new(
            PrimitiveKind::Triangles,
            Vector3::zeros(),
            None,
            None,
            false,
            false,
            PassContext::default(),
            readable,
            capacity,
        )
    }

    fn triangle_source() -> BatchPortionSource<'static> {
        BatchPortionSource {
            positions_raw: Some(&[0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0]),
            positions_quantized: None,
            indices: &[0, 1, 2],
            edge_indices: &[0, 1, 1, 2, 2, 0],
            normals_oct: None,
            uvs: None,
            color: [255, 0, 0, 255],
            metallic_roughness: [0, 255],
            pick_color: [1, 0, 0, 0],
        }
    }

    #[test]
    fn test_capacity_boundary() {
        let layer = test_layer(false, 5);
        assert!(layer.can_create_portion(5, 15));
        assert!(!layer.can_create_portion(6, 0));
        assert!(!layer.can_create_portion(0, 16));
    }

    #[test]
    fn test_indices_rebased_per_portion() {
        let mut layer = test_layer(false, 100);
        layer.create_portion(triangle_source()).unwrap();
        layer.create_portion(triangle_source()).unwrap();
        assert_eq!(layer.indices.as_slice(), &[0, 1, 2, 3, 4, 5]);
        assert_eq!(layer.num_vertices, 6);
        assert_eq!(layer.common.counters.num_portions, 2);
    }

    #[test]
    fn test_flat_normals_derived_when_absent() {
        let mut layer = test_layer(false, 100);
        layer.create_portion(triangle_source()).unwrap();
        // triangle in the XY plane: every derived normal points along +Z
        let oct = layer.normals.as_slice();
        assert_eq!(oct.len(), 6);
        let n = oct_decode_normal(oct[0], oct[1]);
        assert!(n.z > 0.99);
    }

    #[test]
    fn test_create_after_finalize_fails() {
        let mut gpu = HeadlessContext::new();
        let mut layer = test_layer(false, 100);
        layer.create_portion(triangle_source()).unwrap();
        layer.finalize(&mut gpu).unwrap();
        assert!(matches!(
            layer.create_portion(triangle_source()),
            Err(Error::AlreadyFinalized(_))
        ));
    }

    #[test]
    fn test_finalize_twice_fails() {
        let mut gpu = HeadlessContext::new();
        let mut layer = test_layer(false, 100);
        layer.create_portion(triangle_source()).unwrap();
        layer.finalize(&mut gpu).unwrap();
        assert!(matches!(layer.finalize(&mut gpu), Err(Error::AlreadyFinalized(_))));
    }

    #[test]
    fn test_flag_rewrite_covers_vertex_range() {
        let mut gpu = HeadlessContext::new();
        let mut layer = test_layer(false, 100);
        layer.create_portion(triangle_source()).unwrap();
        layer.create_portion(triangle_source()).unwrap();
        layer.finalize(&mut gpu).unwrap();

        let old = layer
            .set_portion_flags(1, EntityFlags::VISIBLE, false)
            .unwrap();
        assert_eq!(old, (EntityFlags::empty(), false));
        layer.flush(&mut gpu);

        let bytes = gpu.buffer_bytes(layer.flags.buffer().unwrap()).unwrap();
        let words: &[u32] = bytemuck::cast_slice(bytes);
        assert!(words[0..3].iter().all(|&w| w == 0));
        let expected = pack_render_flags(EntityFlags::VISIBLE, false, &PassContext::default());
        assert!(words[3..6].iter().all(|&w| w == expected));
    }

    #[test]
    fn test_set_same_flags_is_idempotent() {
        let mut gpu = HeadlessContext::new();
        let mut layer = test_layer(false, 100);
        layer.create_portion(triangle_source()).unwrap();
        layer.finalize(&mut gpu).unwrap();

        layer.set_portion_flags(0, EntityFlags::VISIBLE, false);
        layer.flush(&mut gpu);
        let counters_before = layer.common.counters;
        let writes_before = gpu.write_count();

        layer.set_portion_flags(0, EntityFlags::VISIBLE, false);
        layer.flush(&mut gpu);
        assert_eq!(layer.common.counters, counters_before);
        assert_eq!(gpu.write_count(), writes_before, "identical state must not re-upload");
    }

    #[test]
    fn test_pick_round_trip() {
        let mut gpu = HeadlessContext::new();
        let mut layer = test_layer(true, 100);
        layer.create_portion(triangle_source()).unwrap();
        layer.finalize(&mut gpu).unwrap();

        let ray = Ray {
            origin: Point3::new(0.25, 0.25, 5.0),
            direction: Vector3::new(0.0, 0.0, -1.0),
        };
        let hit = layer.ray_pick(0, &ray).expect("ray through triangle must hit");
        assert!((hit.position.x - 0.25).abs() < 1e-3);
        assert!((hit.position.y - 0.25).abs() < 1e-3);
        assert!(hit.position.z.abs() < 1e-3);
        // outward: against the ray
        assert!(hit.normal.z > 0.99);
        assert!((hit.distance - 5.0).abs() < 1e-3);

        let miss = Ray {
            origin: Point3::new(5.0, 5.0, 5.0),
            direction: Vector3::new(0.0, 0.0, -1.0),
        };
        assert!(layer.ray_pick(0, &miss).is_none());
    }

    #[test]
    fn test_pick_without_retained_geometry_is_silent_none() {
        let mut gpu = HeadlessContext::new();
        let mut layer = test_layer(false, 100);
        layer.create_portion(triangle_source()).unwrap();
        layer.finalize(&mut gpu).unwrap();
        let ray = Ray {
            origin: Point3::new(0.25, 0.25, 5.0),
            direction: Vector3::new(0.0, 0.0, -1.0),
        };
        assert!(layer.ray_pick(0, &ray).is_none());
    }

    #[test]
    fn test_retire_updates_counters_and_flags() {
        let mut gpu = HeadlessContext::new();
        let mut layer = test_layer(false, 100);
        layer.create_portion(triangle_source()).unwrap();
        layer.finalize(&mut gpu).unwrap();
        layer.set_portion_flags(0, EntityFlags::VISIBLE, false);
        assert_eq!(layer.common.counters.num_visible, 1);

        let old = layer.retire_portion(0).unwrap();
        assert_eq!(old.0, EntityFlags::VISIBLE);
        assert_eq!(layer.common.counters.num_visible, 0);
        assert_eq!(layer.common.counters.num_portions, 0);
        assert!(layer.retire_portion(0).is_none());
    }
}

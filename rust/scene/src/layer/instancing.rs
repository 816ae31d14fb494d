// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Instancing layer
//!
//! Stores one shared geometry once and replicates it through per-instance
//! attribute rows: three vec4 model-matrix rows, quantized color, pick
//! color, the packed render-state word, a translation offset and — when
//! the geometry carries normals — three vec4 rows of the inverse-transpose
//! normal matrix. Every mutator touches exactly one row, which is the
//! structural advantage over batching's per-vertex rewrites and must stay
//! O(1). Instance count is unbounded; the shared geometry fixes the
//! vertex cost once.

use std::cell::OnceCell;
use std::sync::Arc;

use nalgebra::{Matrix3, Matrix4, Point3, Vector3};
use strata_core::{
    decompress_position, normal_matrix, pack_render_flags, rtc_view_matrix, EntityFlags,
    PassContext,
};

use crate::columns::Column;
use crate::error::{Error, Result};
use crate::geometry::Geometry;
use crate::gpu::{BufferUsage, GpuContext};
use crate::picking::{ray_triangle, PickSample, Ray};
use crate::renderer::{LayerBuffers, LayerCounts, LayerDrawState, StorageKind};

use super::LayerCommon;

/// Floats per instance in a three-row matrix column.
const MATRIX_ROW_FLOATS: usize = 12;

/// One instance of the shared geometry.
#[derive(Debug)]
struct InstancePortion {
    matrix: Matrix4<f64>,
    inverse: OnceCell<Matrix4<f64>>,
    flags: EntityFlags,
    transparent: bool,
    offset: Vector3<f64>,
    retired: bool,
}

impl InstancePortion {
    fn new(matrix: Matrix4<f64>) -> Self {
        Self {
            matrix,
            inverse: OnceCell::new(),
            flags: EntityFlags::empty(),
            transparent: false,
            offset: Vector3::zeros(),
            retired: false,
        }
    }

    /// Inverse of the instance matrix, computed on first use and cached
    /// until the matrix changes.
    fn inverse(&self) -> Option<&Matrix4<f64>> {
        if let Some(inv) = self.inverse.get() {
            return Some(inv);
        }
        let inv = self.matrix.try_inverse()?;
        Some(self.inverse.get_or_init(|| inv))
    }
}

/// Input to [`InstancingLayer::create_portion`], prepared by the scene
/// model: colors already quantized, pick color already assigned.
#[derive(Debug)]
pub(crate) struct InstancePortionSource {
    pub matrix: Matrix4<f64>,
    pub color: [u8; 4],
    pub metallic_roughness: [u8; 2],
    pub pick_color: [u8; 4],
}

#[derive(Debug)]
pub(crate) struct InstancingLayer {
    pub common: LayerCommon,
    geometry: Arc<Geometry>,
    // shared vertex data, uploaded once at finalize
    positions: Column<u16>,
    normals: Column<i8>,
    uvs: Column<u16>,
    indices: Column<u32>,
    edge_indices: Column<u32>,
    // one row per instance
    matrices: Column<f32>,
    normal_matrices: Column<f32>,
    colors: Column<u8>,
    metallic_roughness: Column<u8>,
    pick_colors: Column<u8>,
    flags: Column<u32>,
    offsets: Column<f32>,
    portions: Vec<InstancePortion>,
}

impl InstancingLayer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        geometry: Arc<Geometry>,
        origin: Vector3<f64>,
        texture_set: Option<String>,
        texture_has_color: bool,
        texture_has_mr: bool,
        pass_ctx: PassContext,
        readable: bool,
    ) -> Self {
        Self {
            common: LayerCommon::new(
                StorageKind::Instancing,
                geometry.kind,
                origin,
                texture_set,
                texture_has_color,
                texture_has_mr,
                pass_ctx,
                readable,
            ),
            geometry,
            positions: Column::new(),
            normals: Column::new(),
            uvs: Column::new(),
            indices: Column::new(),
            edge_indices: Column::new(),
            matrices: Column::new(),
            normal_matrices: Column::new(),
            colors: Column::new(),
            metallic_roughness: Column::new(),
            pick_colors: Column::new(),
            flags: Column::new(),
            offsets: Column::new(),
            portions: Vec::new(),
        }
    }

    pub fn geometry(&self) -> &Arc<Geometry> {
        &self.geometry
    }

    /// Append one instance row. Portion id is the instance index.
    pub fn create_portion(&mut self, src: InstancePortionSource) -> Result<usize> {
        if self.common.finalized || self.common.sealed {
            return Err(Error::AlreadyFinalized("create_portion on a sealed instancing layer"));
        }

        self.matrices.extend_from_slice(&matrix_rows(&src.matrix));
        if self.geometry.has_normals() {
            let nm = normal_matrix(&src.matrix);
            self.normal_matrices.extend_from_slice(&normal_matrix_rows(&nm));
        }
        self.colors.extend_from_slice(&src.color);
        self.metallic_roughness.extend_from_slice(&src.metallic_roughness);
        self.pick_colors.extend_from_slice(&src.pick_color);
        self.flags.push(0);
        self.offsets.extend_from_slice(&[0.0, 0.0, 0.0]);

        self.common.counters.num_portions += 1;
        self.portions.push(InstancePortion::new(src.matrix));
        Ok(self.portions.len() - 1)
    }

    /// Compile the shared geometry and all instance columns into GPU
    /// buffers.
    pub fn finalize(&mut self, gpu: &mut dyn GpuContext) -> Result<()> {
        if self.common.finalized {
            return Err(Error::AlreadyFinalized("finalize"));
        }

        // Shared vertex data comes out of the geometry store; the Arc keeps
        // the CPU copy alive for picking independent of column retention
        self.positions.extend_from_slice(&self.geometry.positions_quantized);
        self.positions.finalize(gpu, BufferUsage::Vertex, false);
        if let Some(oct) = &self.geometry.normals_oct {
            self.normals.extend_from_slice(oct);
            self.normals.finalize(gpu, BufferUsage::Vertex, false);
        }
        if let Some(uvs) = &self.geometry.uvs_quantized {
            self.uvs.extend_from_slice(uvs);
            self.uvs.finalize(gpu, BufferUsage::Vertex, false);
        }
        self.indices.extend_from_slice(&self.geometry.indices);
        self.indices.finalize(gpu, BufferUsage::Index, false);
        self.edge_indices.extend_from_slice(&self.geometry.edge_indices);
        self.edge_indices.finalize(gpu, BufferUsage::Index, false);

        self.matrices.finalize(gpu, BufferUsage::Instance, true);
        self.normal_matrices.finalize(gpu, BufferUsage::Instance, true);
        self.colors.finalize(gpu, BufferUsage::Instance, true);
        self.metallic_roughness.finalize(gpu, BufferUsage::Instance, false);
        self.pick_colors.finalize(gpu, BufferUsage::Instance, false);
        self.flags.finalize(gpu, BufferUsage::Instance, true);
        self.offsets.finalize(gpu, BufferUsage::Instance, true);

        self.common.finalized = true;
        Ok(())
    }

    pub fn flush(&mut self, gpu: &mut dyn GpuContext) {
        self.flags.flush(gpu);
        self.colors.flush(gpu);
        self.offsets.flush(gpu);
        self.matrices.flush(gpu);
        self.normal_matrices.flush(gpu);
    }

    pub fn set_portion_flags(
        &mut self,
        portion: usize,
        flags: EntityFlags,
        transparent: bool,
    ) -> Option<(EntityFlags, bool)> {
        let ctx = self.common.pass_ctx;
        let Some(p) = self.portions.get_mut(portion) else {
            tracing::error!(portion, "unknown instancing portion");
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
        self.flags.fill(portion, 1, word);
        p.flags = flags;
        p.transparent = transparent;
        self.common.counters.apply(old.0, old.1, false);
        self.common.counters.apply(flags, transparent, true);
        Some(old)
    }

    pub fn set_portion_color(&mut self, portion: usize, rgba: [u8; 4]) {
        let Some(p) = self.portions.get(portion) else {
            tracing::error!(portion, "unknown instancing portion");
            return;
        };
        if p.retired {
            return;
        }
        self.colors.write(portion * 4, &rgba);
    }

    pub fn set_portion_offset(&mut self, portion: usize, offset: Vector3<f64>) {
        let Some(p) = self.portions.get_mut(portion) else {
            tracing::error!(portion, "unknown instancing portion");
            return;
        };
        if p.retired {
            return;
        }
        p.offset = offset;
        self.offsets
            .write(portion * 3, &[offset.x as f32, offset.y as f32, offset.z as f32]);
    }

    /// Replace one instance's transform. The instance-transform sub-range
    /// stays mutable after finalize, unlike batched positions.
    pub fn set_portion_matrix(&mut self, portion: usize, matrix: Matrix4<f64>) {
        let has_normals = self.geometry.has_normals();
        let Some(p) = self.portions.get_mut(portion) else {
            tracing::error!(portion, "unknown instancing portion");
            return;
        };
        if p.retired {
            return;
        }
        p.matrix = matrix;
        p.inverse = OnceCell::new();
        self.matrices.write(portion * MATRIX_ROW_FLOATS, &matrix_rows(&matrix));
        if has_normals {
            let nm = normal_matrix(&matrix);
            self.normal_matrices
                .write(portion * MATRIX_ROW_FLOATS, &normal_matrix_rows(&nm));
        }
    }

    pub fn retire_portion(&mut self, portion: usize) -> Option<(EntityFlags, bool)> {
        let Some(p) = self.portions.get_mut(portion) else {
            tracing::error!(portion, "unknown instancing portion");
            return None;
        };
        if p.retired {
            return None;
        }
        p.retired = true;
        let old = (p.flags, p.transparent);
        self.flags.fill(portion, 1, 0);
        self.common.counters.apply(old.0, old.1, false);
        self.common.counters.num_portions -= 1;
        Some(old)
    }

    pub fn draw_state(&self, view_matrix: &Matrix4<f64>) -> Result<LayerDrawState> {
        if !self.common.finalized {
            return Err(Error::NotFinalized("draw_state"));
        }
        Ok(LayerDrawState {
            storage: StorageKind::Instancing,
            primitive: self.common.primitive,
            sort_id: self.common.sort_id.clone(),
            view_matrix: rtc_view_matrix(view_matrix, &self.common.origin),
            decode_matrix: self.geometry.decode_matrix.cast::<f32>(),
            origin: self.common.origin,
            texture_set: self.common.texture_set.clone(),
            supports_pbr: self.geometry.has_normals() && self.common.texture_has_mr,
            supports_color_texture: self.geometry.has_uvs() && self.common.texture_has_color,
            counts: LayerCounts {
                num_vertices: self.geometry.num_vertices(),
                num_indices: self.geometry.indices.len(),
                num_edge_indices: self.geometry.edge_indices.len(),
                num_instances: self.portions.len(),
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
                instance_matrices: self.matrices.buffer(),
                instance_normal_matrices: self.normal_matrices.buffer(),
            },
        })
    }

    /// Exact ray intersection against one instance.
    ///
    /// The ray drops into the instance's local space (origin and offset
    /// subtracted, then the inverse instance matrix), tests every triangle
    /// of the shared geometry on decompressed vertices, and transforms the
    /// nearest hit back out through the same chain in reverse.
    pub fn ray_pick(&self, portion: usize, ray: &Ray) -> Option<PickSample> {
        if !self.common.finalized || !self.common.readable || !self.common.primitive.is_filled() {
            return None;
        }
        let p = self.portions.get(portion)?;
        if p.retired {
            return None;
        }
        let inverse = p.inverse()?;
        let decode = &self.geometry.decode_matrix;
        let positions = &self.geometry.positions_quantized;
        let indices = &self.geometry.indices;
        if positions.is_empty() || indices.is_empty() {
            return None;
        }

        let shifted: Point3<f64> = ray.origin - self.common.origin - p.offset;
        let local_origin = inverse.transform_point(&shifted);
        let local_dir = inverse.transform_vector(&ray.direction);
        let vertex = |i: u32| -> Point3<f64> {
            let v = i as usize * 3;
            decompress_position([positions[v], positions[v + 1], positions[v + 2]], decode)
        };

        let mut best: Option<(f64, Point3<f64>, Vector3<f64>)> = None;
        for tri in indices.chunks_exact(3) {
            let (a, b, c) = (vertex(tri[0]), vertex(tri[1]), vertex(tri[2]));
            if let Some(t) = ray_triangle(&local_origin, &local_dir, &a, &b, &c) {
                if best.map_or(true, |(bt, _, _)| t < bt) {
                    let normal = (b - a).cross(&(c - a));
                    best = Some((t, local_origin + local_dir * t, normal));
                }
            }
        }

        let (_, local_pos, local_normal) = best?;
        let world = p.matrix.transform_point(&local_pos) + self.common.origin + p.offset;
        let mut normal = (normal_matrix(&p.matrix) * local_normal).normalize();
        if normal.dot(&ray.direction) > 0.0 {
            normal = -normal;
        }
        Some(PickSample {
            position: world,
            normal,
            distance: (world - ray.origin).norm(),
        })
    }

    pub fn destroy(&mut self, gpu: &mut dyn GpuContext) {
        self.positions.destroy(gpu);
        self.normals.destroy(gpu);
        self.uvs.destroy(gpu);
        self.indices.destroy(gpu);
        self.edge_indices.destroy(gpu);
        self.matrices.destroy(gpu);
        self.normal_matrices.destroy(gpu);
        self.colors.destroy(gpu);
        self.metallic_roughness.destroy(gpu);
        self.pick_colors.destroy(gpu);
        self.flags.destroy(gpu);
        self.offsets.destroy(gpu);
        self.common.destroyed = true;
    }
}

/// The first three rows of a model matrix as 12 f32, the form the vertex
/// shader consumes (the fourth row of an affine transform is constant).
fn matrix_rows(m: &Matrix4<f64>) -> [f32; MATRIX_ROW_FLOATS] {
    let mut rows = [0.0f32; MATRIX_ROW_FLOATS];
    for row in 0..3 {
        for col in 0..4 {
            rows[row * 4 + col] = m[(row, col)] as f32;
        }
    }
    rows
}

/// A 3x3 normal matrix padded into three vec4 rows to share the matrix
/// attribute layout.
fn normal_matrix_rows(m: &Matrix3<f64>) -> [f32; MATRIX_ROW_FLOATS] {
    let mut rows = [0.0f32; MATRIX_ROW_FLOATS];
    for row in 0..3 {
        for col in 0..3 {
            rows[row * 4 + col] = m[(row, col)] as f32;
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{build_geometry, GeometryParams};
    use crate::gpu::HeadlessContext;
    use strata_core::PrimitiveKind;

    fn triangle_geometry() -> Arc<Geometry> {
        Arc::new(
            build_geometry(
                "tri",
                GeometryParams {
                    kind: Some(PrimitiveKind::Triangles),
                    positions: Some(vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0]),
                    normals: Some(vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0]),
                    indices: Some(vec![0, 1, 2]),
                    ..Default::default()
                },
            )
            .unwrap(),
        )
    }

    fn test_layer(readable: bool) -> InstancingLayer {
        InstancingLayer::new(
            triangle_geometry(),
            Vector3::zeros(),
            None,
            false,
            false,
            PassContext::default(),
            readable,
        )
    }

    fn source(matrix: Matrix4<f64>) -> InstancePortionSource {
        InstancePortionSource {
            matrix,
            color: [0, 255, 0, 255],
            metallic_roughness: [0, 255],
            pick_color: [2, 0, 0, 0],
        }
    }

    #[test]
    fn test_portion_ids_are_instance_indices() {
        let mut layer = test_layer(false);
        assert_eq!(layer.create_portion(source(Matrix4::identity())).unwrap(), 0);
        assert_eq!(layer.create_portion(source(Matrix4::identity())).unwrap(), 1);
        assert_eq!(layer.common.counters.num_portions, 2);
        assert_eq!(layer.matrices.len(), 2 * MATRIX_ROW_FLOATS);
        assert_eq!(layer.normal_matrices.len(), 2 * MATRIX_ROW_FLOATS);
    }

    #[test]
    fn test_matrix_rows_layout() {
        let m = Matrix4::new_translation(&Vector3::new(7.0, 8.0, 9.0));
        let rows = matrix_rows(&m);
        // row-major: translation lands in the fourth lane of each row
        assert_eq!(rows[3], 7.0);
        assert_eq!(rows[7], 8.0);
        assert_eq!(rows[11], 9.0);
        assert_eq!(rows[0], 1.0);
    }

    #[test]
    fn test_flag_write_touches_single_row() {
        let mut gpu = HeadlessContext::new();
        let mut layer = test_layer(false);
        layer.create_portion(source(Matrix4::identity())).unwrap();
        layer.create_portion(source(Matrix4::identity())).unwrap();
        layer.create_portion(source(Matrix4::identity())).unwrap();
        layer.finalize(&mut gpu).unwrap();

        layer.set_portion_flags(1, EntityFlags::VISIBLE, false);
        layer.flush(&mut gpu);

        let bytes = gpu.buffer_bytes(layer.flags.buffer().unwrap()).unwrap();
        let words: &[u32] = bytemuck::cast_slice(bytes);
        assert_eq!(words[0], 0);
        assert_ne!(words[1], 0);
        assert_eq!(words[2], 0);
    }

    #[test]
    fn test_set_same_flags_is_idempotent() {
        let mut gpu = HeadlessContext::new();
        let mut layer = test_layer(false);
        layer.create_portion(source(Matrix4::identity())).unwrap();
        layer.finalize(&mut gpu).unwrap();

        layer.set_portion_flags(0, EntityFlags::VISIBLE, false);
        layer.flush(&mut gpu);
        let counters_before = layer.common.counters;
        let writes_before = gpu.write_count();

        layer.set_portion_flags(0, EntityFlags::VISIBLE, false);
        layer.flush(&mut gpu);
        assert_eq!(layer.common.counters, counters_before);
        assert_eq!(gpu.write_count(), writes_before);
    }

    #[test]
    fn test_create_after_finalize_fails() {
        let mut gpu = HeadlessContext::new();
        let mut layer = test_layer(false);
        layer.create_portion(source(Matrix4::identity())).unwrap();
        layer.finalize(&mut gpu).unwrap();
        assert!(matches!(
            layer.create_portion(source(Matrix4::identity())),
            Err(Error::AlreadyFinalized(_))
        ));
    }

    #[test]
    fn test_set_matrix_after_finalize_rewrites_row() {
        let mut gpu = HeadlessContext::new();
        let mut layer = test_layer(false);
        layer.create_portion(source(Matrix4::identity())).unwrap();
        layer.finalize(&mut gpu).unwrap();

        let moved = Matrix4::new_translation(&Vector3::new(5.0, 0.0, 0.0));
        layer.set_portion_matrix(0, moved);
        layer.flush(&mut gpu);

        let bytes = gpu.buffer_bytes(layer.matrices.buffer().unwrap()).unwrap();
        let floats: &[f32] = bytemuck::cast_slice(bytes);
        assert_eq!(floats[3], 5.0);
    }

    #[test]
    fn test_pick_through_instance_transform() {
        let mut gpu = HeadlessContext::new();
        let mut layer = test_layer(true);
        // instance shifted +10 on X
        let m = Matrix4::new_translation(&Vector3::new(10.0, 0.0, 0.0));
        layer.create_portion(source(m)).unwrap();
        layer.finalize(&mut gpu).unwrap();

        let hit = layer
            .ray_pick(
                0,
                &Ray {
                    origin: Point3::new(10.25, 0.25, 5.0),
                    direction: Vector3::new(0.0, 0.0, -1.0),
                },
            )
            .expect("ray through moved instance must hit");
        assert!((hit.position.x - 10.25).abs() < 1e-3);
        assert!((hit.position.y - 0.25).abs() < 1e-3);
        assert!(hit.normal.z > 0.99);
        assert!((hit.distance - 5.0).abs() < 1e-3);

        // the untransformed geometry location must now miss
        assert!(layer
            .ray_pick(
                0,
                &Ray {
                    origin: Point3::new(0.25, 0.25, 5.0),
                    direction: Vector3::new(0.0, 0.0, -1.0),
                }
            )
            .is_none());
    }

    #[test]
    fn test_pick_without_readable_is_silent_none() {
        let mut gpu = HeadlessContext::new();
        let mut layer = test_layer(false);
        layer.create_portion(source(Matrix4::identity())).unwrap();
        layer.finalize(&mut gpu).unwrap();
        assert!(layer
            .ray_pick(
                0,
                &Ray {
                    origin: Point3::new(0.25, 0.25, 5.0),
                    direction: Vector3::new(0.0, 0.0, -1.0),
                }
            )
            .is_none());
    }

    #[test]
    fn test_retire_clears_row_and_counters() {
        let mut gpu = HeadlessContext::new();
        let mut layer = test_layer(false);
        layer.create_portion(source(Matrix4::identity())).unwrap();
        layer.finalize(&mut gpu).unwrap();
        layer.set_portion_flags(0, EntityFlags::VISIBLE | EntityFlags::PICKABLE, false);
        assert_eq!(layer.common.counters.num_visible, 1);

        let old = layer.retire_portion(0).unwrap();
        assert!(old.0.contains(EntityFlags::VISIBLE));
        assert_eq!(layer.common.counters.num_visible, 0);
        assert_eq!(layer.common.counters.num_portions, 0);
        assert!(layer.set_portion_flags(0, EntityFlags::VISIBLE, false).is_none());
    }
}

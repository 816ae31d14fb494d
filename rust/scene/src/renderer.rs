// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The external renderer seam
//!
//! Shader assembly and draw submission live outside this engine. Per frame
//! the scene model walks its layers in sort order, skips the ones whose
//! counters prove a pass empty, and invokes the renderer once per
//! remaining (layer, pass) pair with everything a backend needs: buffer
//! handles, counts, the RTC-adjusted view matrix and the decode matrix.

use nalgebra::{Matrix4, Vector3};
use strata_core::{PrimitiveKind, RenderPass};

use crate::gpu::BufferId;

/// Which storage strategy produced a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKind {
    /// Distinct geometries packed into shared buffers.
    Batching,
    /// One shared geometry replicated via per-instance attributes.
    Instancing,
}

/// Per-frame inputs shared by all layers.
#[derive(Debug, Clone)]
pub struct FrameContext {
    /// Camera view matrix in double precision; layers fold their RTC
    /// origin into it before narrowing.
    pub view_matrix: Matrix4<f64>,
    pub frame_index: u64,
}

/// Buffer handles of one finalized layer. Absent attributes are `None`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LayerBuffers {
    pub positions: Option<BufferId>,
    pub normals: Option<BufferId>,
    pub colors: Option<BufferId>,
    pub metallic_roughness: Option<BufferId>,
    pub uvs: Option<BufferId>,
    pub flags: Option<BufferId>,
    pub offsets: Option<BufferId>,
    pub pick_colors: Option<BufferId>,
    pub indices: Option<BufferId>,
    pub edge_indices: Option<BufferId>,
    /// Instancing only: three vec4 model-matrix rows per instance.
    pub instance_matrices: Option<BufferId>,
    /// Instancing only: three vec4 normal-matrix rows per instance.
    pub instance_normal_matrices: Option<BufferId>,
}

/// Element counts of one finalized layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct LayerCounts {
    pub num_vertices: usize,
    pub num_indices: usize,
    pub num_edge_indices: usize,
    /// Zero for batching layers.
    pub num_instances: usize,
}

/// Everything a backend needs to draw one layer for one pass.
#[derive(Debug, Clone)]
pub struct LayerDrawState {
    pub storage: StorageKind,
    pub primitive: PrimitiveKind,
    /// Key the model sorts layers by, to minimize program switches.
    pub sort_id: String,
    /// View matrix with the layer origin folded in, f64 → f32 narrowed.
    pub view_matrix: Matrix4<f32>,
    /// Position decode matrix for the vertex shader.
    pub decode_matrix: Matrix4<f32>,
    /// Layer RTC origin, for backends that need it verbatim.
    pub origin: Vector3<f64>,
    pub texture_set: Option<String>,
    /// Metallic/roughness data and textures available.
    pub supports_pbr: bool,
    /// Base-color texture and UVs available.
    pub supports_color_texture: bool,
    pub counts: LayerCounts,
    pub buffers: LayerBuffers,
}

/// External collaborator invoked with a layer and a pass.
pub trait LayerRenderer {
    fn draw_layer(&mut self, frame: &FrameContext, layer: &LayerDrawState, pass: RenderPass);
}

/// Test/diagnostic renderer that records every call it receives.
#[derive(Debug, Default)]
pub struct RecordingRenderer {
    pub calls: Vec<(u64, String, RenderPass)>,
}

impl LayerRenderer for RecordingRenderer {
    fn draw_layer(&mut self, frame: &FrameContext, layer: &LayerDrawState, pass: RenderPass) {
        self.calls.push((frame.frame_index, layer.sort_id.clone(), pass));
    }
}

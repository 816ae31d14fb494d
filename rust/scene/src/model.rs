// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scene model orchestration
//!
//! The scene model is the single entry point for building and driving a
//! packed model: it owns the geometry store, routes each mesh to a
//! compatible layer (creating one on first use and rolling to a fresh one
//! on capacity exhaustion), binds meshes into entities, bakes every layer's
//! buffers at finalize and fans entity state changes out to portions. It is
//! also the sole owner of the model-level aggregate counters, settled
//! transactionally alongside every layer's own counters so whole passes can
//! be skipped for the whole model without touching a buffer.
//!
//! Construction is strictly two-phase: geometries, meshes and entities are
//! created first, `finalize` compiles the layers, and only then do the
//! per-entity mutators take effect. Configuration errors return `Err` and
//! leave the model untouched; sequencing mistakes on mutators are logged
//! and ignored.

use std::sync::Arc;

use nalgebra::{Matrix4, Point3, Vector3};
use rustc_hash::FxHashMap;
use slotmap::SlotMap;
use smallvec::SmallVec;
use strata_core::{
    normal_matrix, pick_color, quantize_rgba, rtc_for_positions, unit_to_u8, Aabb, EntityFlags,
    PassContext, PrimitiveKind, RenderPass,
};

use crate::counters::{should_draw, LayerCounters};
use crate::entity::{EntityKey, EntityParams, SceneEntity};
use crate::error::{Error, Result};
use crate::geometry::{build_geometry, Geometry, GeometryParams, GeometryStore};
use crate::gpu::GpuContext;
use crate::layer::{
    matrix_hash, BatchPortionSource, BatchingLayer, InstancePortionSource, InstancingLayer, Layer,
    LayerBucket,
};
use crate::mesh::{next_pick_id, MeshKey, MeshParams, SceneMesh};
use crate::picking::{PickSample, Ray};
use crate::renderer::{FrameContext, LayerRenderer, StorageKind};
use crate::texture::{Texture, TextureSet, TextureSetParams};

/// Default vertex capacity of a batching layer.
const DEFAULT_BATCH_CAPACITY: usize = 500_000;

/// Passes composing one frame, in submission order: color first, then
/// overlays, pick last.
const DRAW_PASSES: [RenderPass; 11] = [
    RenderPass::ColorOpaque,
    RenderPass::EdgesColorOpaque,
    RenderPass::ColorTransparent,
    RenderPass::EdgesColorTransparent,
    RenderPass::SilhouetteXrayed,
    RenderPass::SilhouetteHighlighted,
    RenderPass::SilhouetteSelected,
    RenderPass::EdgesXrayed,
    RenderPass::EdgesHighlighted,
    RenderPass::EdgesSelected,
    RenderPass::Pick,
];

/// Model-level defaults and switches, fixed at construction.
#[derive(Debug, Clone)]
pub struct SceneModelConfig {
    pub id: String,
    /// Model-level RTC origin every coordinate is relative to.
    pub origin: Vector3<f64>,
    // default state gates for new entities
    pub visible: bool,
    pub culled: bool,
    pub pickable: bool,
    pub clippable: bool,
    pub collidable: bool,
    pub edges: bool,
    pub xrayed: bool,
    pub highlighted: bool,
    pub selected: bool,
    /// Retain CPU-side quantized geometry for precision picking.
    pub readable_geometry: bool,
    /// Glow-through switches handed to the render-state codec.
    pub pass_context: PassContext,
    /// Vertex capacity per batching layer; index capacity follows from the
    /// primitive's index/vertex ratio.
    pub batch_capacity_vertices: usize,
}

impl Default for SceneModelConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            origin: Vector3::zeros(),
            visible: true,
            culled: false,
            pickable: true,
            clippable: true,
            collidable: true,
            edges: false,
            xrayed: false,
            highlighted: false,
            selected: false,
            readable_geometry: false,
            pass_context: PassContext::default(),
            batch_capacity_vertices: DEFAULT_BATCH_CAPACITY,
        }
    }
}

/// The geometry-aggregation engine for one model.
#[derive(Debug)]
pub struct SceneModel {
    config: SceneModelConfig,
    geometries: GeometryStore,
    textures: FxHashMap<String, Texture>,
    texture_sets: FxHashMap<String, TextureSet>,
    layers: Vec<Layer>,
    /// Open layer per compatibility bucket; sealed layers drop out.
    buckets: FxHashMap<LayerBucket, usize>,
    /// Layer indices sorted by sort id, built at finalize.
    draw_order: Vec<usize>,
    meshes: SlotMap<MeshKey, SceneMesh>,
    mesh_ids: FxHashMap<String, MeshKey>,
    entities: SlotMap<EntityKey, SceneEntity>,
    entity_ids: FxHashMap<String, EntityKey>,
    /// Sum of every layer's counters, settled in the same call that
    /// touches the layer.
    counters: LayerCounters,
    aabb: Aabb,
    finalized: bool,
}

impl SceneModel {
    pub fn new(config: SceneModelConfig) -> Self {
        Self {
            config,
            geometries: GeometryStore::new(),
            textures: FxHashMap::default(),
            texture_sets: FxHashMap::default(),
            layers: Vec::new(),
            buckets: FxHashMap::default(),
            draw_order: Vec::new(),
            meshes: SlotMap::with_key(),
            mesh_ids: FxHashMap::default(),
            entities: SlotMap::with_key(),
            entity_ids: FxHashMap::default(),
            counters: LayerCounters::default(),
            aabb: Aabb::new(),
            finalized: false,
        }
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.config.id
    }

    #[inline]
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Model aggregate counters: the sum over all layers.
    #[inline]
    pub fn counters(&self) -> &LayerCounters {
        &self.counters
    }

    #[inline]
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    #[inline]
    pub fn num_meshes(&self) -> usize {
        self.meshes.len()
    }

    #[inline]
    pub fn num_entities(&self) -> usize {
        self.entities.len()
    }

    /// World bounds of everything created so far.
    #[inline]
    pub fn aabb(&self) -> Aabb {
        self.aabb
    }

    /// Per-layer counters keyed by sort id, for diagnostics and tests.
    pub fn layer_counters(&self) -> impl Iterator<Item = (&str, &LayerCounters)> {
        self.layers
            .iter()
            .filter(|layer| !layer.is_destroyed())
            .map(|layer| (layer.sort_id(), layer.counters()))
    }

    // ------------------------------------------------------------------
    // construction
    // ------------------------------------------------------------------

    /// Register a shared geometry for later instancing by meshes.
    pub fn create_geometry(&mut self, id: &str, params: GeometryParams) -> Result<()> {
        if self.finalized {
            return Err(Error::AlreadyFinalized("create_geometry"));
        }
        self.geometries.create(id, params)?;
        Ok(())
    }

    pub fn geometry(&self, id: &str) -> Option<&Arc<Geometry>> {
        self.geometries.get(id)
    }

    /// Track an externally decoded texture by identity.
    pub fn create_texture(&mut self, id: &str) -> Result<()> {
        if self.finalized {
            return Err(Error::AlreadyFinalized("create_texture"));
        }
        if self.textures.contains_key(id) {
            return Err(Error::DuplicateId { kind: "texture", id: id.to_string() });
        }
        self.textures.insert(id.to_string(), Texture { id: id.to_string() });
        Ok(())
    }

    /// Register a named combination of material textures. Layers bucket by
    /// texture set, so two meshes share buffers only when they share one.
    pub fn create_texture_set(&mut self, id: &str, params: TextureSetParams) -> Result<()> {
        if self.finalized {
            return Err(Error::AlreadyFinalized("create_texture_set"));
        }
        if self.texture_sets.contains_key(id) {
            return Err(Error::DuplicateId { kind: "texture set", id: id.to_string() });
        }
        for texture_id in [
            &params.color_texture_id,
            &params.metallic_roughness_texture_id,
            &params.normals_texture_id,
            &params.emissive_texture_id,
            &params.occlusion_texture_id,
        ]
        .into_iter()
        .flatten()
        {
            if !self.textures.contains_key(texture_id) {
                return Err(Error::UnknownId { kind: "texture", id: texture_id.clone() });
            }
        }
        self.texture_sets.insert(
            id.to_string(),
            TextureSet {
                id: id.to_string(),
                color: params.color_texture_id,
                metallic_roughness: params.metallic_roughness_texture_id,
                normals: params.normals_texture_id,
                emissive: params.emissive_texture_id,
                occlusion: params.occlusion_texture_id,
            },
        );
        Ok(())
    }

    /// Create a mesh, routed to the instancing path when `geometry_id` is
    /// set and to the batching path for inline geometry.
    pub fn create_mesh(&mut self, id: &str, params: MeshParams) -> Result<()> {
        if self.finalized {
            return Err(Error::AlreadyFinalized("create_mesh"));
        }
        if self.mesh_ids.contains_key(id) {
            return Err(Error::DuplicateId { kind: "mesh", id: id.to_string() });
        }
        match (&params.geometry_id, params.geometry.is_some()) {
            (Some(_), true) => Err(Error::InvalidMesh(format!(
                "mesh '{id}': geometry_id and inline geometry are mutually exclusive"
            ))),
            (Some(_), false) => self.create_instanced_mesh(id, params),
            (None, true) => self.create_batched_mesh(id, params),
            (None, false) => Err(Error::InvalidMesh(format!(
                "mesh '{id}': either geometry_id or inline geometry is required"
            ))),
        }
    }

    fn create_instanced_mesh(&mut self, id: &str, params: MeshParams) -> Result<()> {
        let geometry_id = params.geometry_id.clone().unwrap_or_default();
        let geometry = self
            .geometries
            .get(&geometry_id)
            .cloned()
            .ok_or_else(|| Error::UnknownId { kind: "geometry", id: geometry_id.clone() })?;

        let matrix = params.transform();
        let origin =
            self.config.origin + params.origin.unwrap_or_else(Vector3::zeros) + geometry.origin;
        let (texture_has_color, texture_has_mr) =
            self.texture_support(params.texture_set_id.as_deref())?;

        let bucket = LayerBucket {
            storage: StorageKind::Instancing,
            primitive: geometry.kind,
            origin_bits: LayerBucket::origin_bits(&origin),
            decode_hash: None,
            geometry_id: Some(geometry_id),
            texture_set: params.texture_set_id.clone(),
        };
        let layer_index = match self.buckets.get(&bucket) {
            Some(&index) => index,
            None => {
                let layer = InstancingLayer::new(
                    geometry.clone(),
                    origin,
                    params.texture_set_id.clone(),
                    texture_has_color,
                    texture_has_mr,
                    self.config.pass_context,
                    self.config.readable_geometry,
                );
                self.layers.push(Layer::Instancing(layer));
                let index = self.layers.len() - 1;
                self.buckets.insert(bucket, index);
                index
            }
        };

        let color = quantize_rgba(params.color, params.opacity);
        let metallic_roughness = [unit_to_u8(params.metallic), unit_to_u8(params.roughness)];
        let pick_id = next_pick_id();
        let pick = pick_color(pick_id);

        let layer = self.layers[layer_index]
            .as_instancing_mut()
            .expect("bucket resolved to a non-instancing layer");
        let portion = layer.create_portion(InstancePortionSource {
            matrix,
            color,
            metallic_roughness,
            pick_color: pick,
        })?;

        let aabb = geometry.aabb.transformed(&matrix).translated(&origin);
        self.register_mesh(SceneMesh {
            id: id.to_string(),
            layer: layer_index,
            portion,
            color,
            metallic_roughness,
            pick_id,
            pick_color: pick,
            matrix,
            origin,
            aabb,
            transparent: params.opacity < 1.0,
            entity: None,
        });
        Ok(())
    }

    fn create_batched_mesh(&mut self, id: &str, mut params: MeshParams) -> Result<()> {
        let mut gp = params.geometry.take().expect("batching path requires inline geometry");
        let matrix = params.transform();
        let identity = matrix == Matrix4::identity();
        let mut origin = self.config.origin
            + params.origin.unwrap_or_else(Vector3::zeros)
            + gp.origin.take().unwrap_or_else(Vector3::zeros);
        let (texture_has_color, texture_has_mr) =
            self.texture_support(params.texture_set_id.as_deref())?;

        // Pre-apply the transform in f64 before validation and staging so
        // the layer only ever sees final coordinates; large results split
        // into the layer origin here, before any narrowing
        let mut staged_raw: Option<Vec<f64>> = None;
        if let Some(positions) = gp.positions.take() {
            if positions.is_empty() || positions.len() % 3 != 0 {
                return Err(Error::InvalidGeometry(format!(
                    "mesh '{id}': positions length {} is not a positive multiple of 3",
                    positions.len()
                )));
            }
            let transformed = transform_positions(&matrix, &positions, identity);
            let (auto_origin, relative) = rtc_for_positions(&transformed);
            origin += auto_origin;
            if !identity {
                if let Some(normals) = gp.normals.take() {
                    gp.normals = Some(rotate_normals(&matrix, &normals));
                }
            }
            staged_raw = Some(relative.clone());
            gp.positions = Some(relative);
        } else if gp.positions_compressed.is_some() && !identity {
            // quantized coordinates cannot be re-transformed without a
            // decompression round; callers pre-transform instead
            return Err(Error::InvalidMesh(format!(
                "mesh '{id}': pre-quantized batched positions cannot carry a transform"
            )));
        }

        let raw_uvs = gp.uvs.clone();
        let geometry = build_geometry(id, gp)?;

        let bucket = LayerBucket {
            storage: StorageKind::Batching,
            primitive: geometry.kind,
            origin_bits: LayerBucket::origin_bits(&origin),
            decode_hash: staged_raw.is_none().then(|| matrix_hash(&geometry.decode_matrix)),
            geometry_id: None,
            texture_set: params.texture_set_id.clone(),
        };
        let decode = staged_raw.is_none().then_some(geometry.decode_matrix);
        let layer_index = self.batching_layer_for(
            bucket,
            geometry.kind,
            origin,
            decode,
            params.texture_set_id.clone(),
            texture_has_color,
            texture_has_mr,
            geometry.num_vertices(),
            geometry.indices.len(),
        );

        let color = quantize_rgba(params.color, params.opacity);
        let metallic_roughness = [unit_to_u8(params.metallic), unit_to_u8(params.roughness)];
        let pick_id = next_pick_id();
        let pick = pick_color(pick_id);

        let layer = self.layers[layer_index]
            .as_batching_mut()
            .expect("bucket resolved to a non-batching layer");
        let portion = layer.create_portion(BatchPortionSource {
            positions_raw: staged_raw.as_deref(),
            positions_quantized: staged_raw.is_none().then_some(geometry.positions_quantized.as_slice()),
            indices: &geometry.indices,
            edge_indices: &geometry.edge_indices,
            normals_oct: geometry.normals_oct,
            uvs: raw_uvs.as_deref(),
            color,
            metallic_roughness,
            pick_color: pick,
        })?;

        let aabb = match &staged_raw {
            Some(relative) => Aabb::from_positions(relative).translated(&origin),
            None => geometry.aabb.translated(&origin),
        };
        self.register_mesh(SceneMesh {
            id: id.to_string(),
            layer: layer_index,
            portion,
            color,
            metallic_roughness,
            pick_id,
            pick_color: pick,
            matrix,
            origin,
            aabb,
            transparent: params.opacity < 1.0,
            entity: None,
        });
        Ok(())
    }

    /// Resolve the open batching layer for a bucket, sealing and replacing
    /// it when the new portion no longer fits.
    #[allow(clippy::too_many_arguments)]
    fn batching_layer_for(
        &mut self,
        bucket: LayerBucket,
        primitive: PrimitiveKind,
        origin: Vector3<f64>,
        decode: Option<Matrix4<f64>>,
        texture_set: Option<String>,
        texture_has_color: bool,
        texture_has_mr: bool,
        num_vertices: usize,
        num_indices: usize,
    ) -> usize {
        if let Some(&index) = self.buckets.get(&bucket) {
            if let Layer::Batching(layer) = &self.layers[index] {
                if layer.can_create_portion(num_vertices, num_indices) {
                    return index;
                }
            }
            self.layers[index].seal();
            tracing::debug!(
                sort_id = self.layers[index].sort_id(),
                "batching layer at capacity, rolling to a new one"
            );
        }

        // Oversized portions get a dedicated layer that fits exactly once
        let factor = primitive.index_capacity_factor().max(1);
        let capacity = self
            .config
            .batch_capacity_vertices
            .max(num_vertices)
            .max(num_indices.div_ceil(factor));
        let layer = BatchingLayer::new(
            primitive,
            origin,
            decode,
            texture_set,
            texture_has_color,
            texture_has_mr,
            self.config.pass_context,
            self.config.readable_geometry,
            capacity,
        );
        self.layers.push(Layer::Batching(layer));
        let index = self.layers.len() - 1;
        self.buckets.insert(bucket, index);
        index
    }

    fn texture_support(&self, texture_set_id: Option<&str>) -> Result<(bool, bool)> {
        match texture_set_id {
            None => Ok((false, false)),
            Some(ts) => {
                let set = self.texture_sets.get(ts).ok_or_else(|| Error::UnknownId {
                    kind: "texture set",
                    id: ts.to_string(),
                })?;
                Ok((set.has_color_texture(), set.has_metallic_roughness_texture()))
            }
        }
    }

    fn register_mesh(&mut self, mesh: SceneMesh) {
        self.aabb.union(&mesh.aabb);
        self.counters.num_portions += 1;
        let id = mesh.id.clone();
        let key = self.meshes.insert(mesh);
        self.mesh_ids.insert(id, key);
    }

    /// Create an entity over named meshes. Unknown meshes and meshes
    /// already owned by another entity are reported and skipped; the
    /// entity is created with the rest.
    pub fn create_entity(&mut self, id: &str, params: EntityParams) -> Result<()> {
        if self.finalized {
            return Err(Error::AlreadyFinalized("create_entity"));
        }
        if self.entity_ids.contains_key(id) {
            return Err(Error::DuplicateId { kind: "entity", id: id.to_string() });
        }

        let flags = self.initial_entity_flags(&params);
        let entity_key = self.entities.insert(SceneEntity::new(id, flags));
        self.entity_ids.insert(id.to_string(), entity_key);

        for mesh_id in &params.mesh_ids {
            let Some(&mesh_key) = self.mesh_ids.get(mesh_id) else {
                tracing::warn!(entity = id, mesh = %mesh_id, "unknown mesh skipped");
                continue;
            };
            let mesh = &mut self.meshes[mesh_key];
            if let Some(owner) = mesh.entity {
                tracing::warn!(
                    entity = id,
                    mesh = %mesh_id,
                    owner = %self.entities[owner].id,
                    "mesh already owned by another entity, skipped"
                );
                continue;
            }
            mesh.entity = Some(entity_key);
            let (layer, portion, transparent, mesh_aabb) =
                (mesh.layer, mesh.portion, mesh.transparent, mesh.aabb);

            let entity = &mut self.entities[entity_key];
            entity.meshes.push(mesh_key);
            entity.aabb.union(&mesh_aabb);

            // initial state lands in the staged flag column and the
            // counters in one transactional step
            if let Some((old_flags, old_transparent)) =
                self.layers[layer].set_portion_flags(portion, flags, transparent)
            {
                self.counters.apply(old_flags, old_transparent, false);
                self.counters.apply(flags, transparent, true);
            }
        }
        Ok(())
    }

    fn initial_entity_flags(&self, params: &EntityParams) -> EntityFlags {
        let c = &self.config;
        let mut flags = EntityFlags::empty();
        flags.set(EntityFlags::VISIBLE, params.visible && c.visible);
        flags.set(EntityFlags::CULLED, params.culled || c.culled);
        flags.set(EntityFlags::PICKABLE, params.pickable && c.pickable);
        flags.set(EntityFlags::CLIPPABLE, params.clippable && c.clippable);
        flags.set(EntityFlags::COLLIDABLE, params.collidable && c.collidable);
        flags.set(EntityFlags::EDGES, params.edges || c.edges);
        flags.set(EntityFlags::XRAYED, params.xrayed || c.xrayed);
        flags.set(EntityFlags::HIGHLIGHTED, params.highlighted || c.highlighted);
        flags.set(EntityFlags::SELECTED, params.selected || c.selected);
        flags
    }

    /// Compile every layer's staged columns into GPU buffers and fix the
    /// draw order. Creation ends here; mutation begins here.
    pub fn finalize(&mut self, gpu: &mut dyn GpuContext) -> Result<()> {
        if self.finalized {
            return Err(Error::AlreadyFinalized("finalize"));
        }
        for layer in &mut self.layers {
            layer.finalize(gpu)?;
        }
        let mut order: Vec<usize> = (0..self.layers.len()).collect();
        order.sort_by(|&a, &b| self.layers[a].sort_id().cmp(self.layers[b].sort_id()));
        self.draw_order = order;
        self.finalized = true;
        tracing::info!(
            model = %self.config.id,
            layers = self.layers.len(),
            meshes = self.meshes.len(),
            entities = self.entities.len(),
            portions = self.counters.num_portions,
            "scene model finalized"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // entity state
    // ------------------------------------------------------------------

    pub fn entity(&self, id: &str) -> Option<&SceneEntity> {
        self.entity_ids.get(id).and_then(|&key| self.entities.get(key))
    }

    pub fn entity_ids(&self) -> impl Iterator<Item = &str> {
        self.entity_ids.keys().map(String::as_str)
    }

    pub fn mesh(&self, id: &str) -> Option<&SceneMesh> {
        self.mesh_ids.get(id).and_then(|&key| self.meshes.get(key))
    }

    pub fn set_entity_visible(&mut self, id: &str, on: bool) {
        self.set_entity_flag(id, EntityFlags::VISIBLE, on);
    }

    pub fn set_entity_culled(&mut self, id: &str, on: bool) {
        self.set_entity_flag(id, EntityFlags::CULLED, on);
    }

    pub fn set_entity_pickable(&mut self, id: &str, on: bool) {
        self.set_entity_flag(id, EntityFlags::PICKABLE, on);
    }

    pub fn set_entity_clippable(&mut self, id: &str, on: bool) {
        self.set_entity_flag(id, EntityFlags::CLIPPABLE, on);
    }

    pub fn set_entity_collidable(&mut self, id: &str, on: bool) {
        self.set_entity_flag(id, EntityFlags::COLLIDABLE, on);
    }

    pub fn set_entity_edges(&mut self, id: &str, on: bool) {
        self.set_entity_flag(id, EntityFlags::EDGES, on);
    }

    pub fn set_entity_xrayed(&mut self, id: &str, on: bool) {
        self.set_entity_flag(id, EntityFlags::XRAYED, on);
    }

    pub fn set_entity_highlighted(&mut self, id: &str, on: bool) {
        self.set_entity_flag(id, EntityFlags::HIGHLIGHTED, on);
    }

    pub fn set_entity_selected(&mut self, id: &str, on: bool) {
        self.set_entity_flag(id, EntityFlags::SELECTED, on);
    }

    fn set_entity_flag(&mut self, id: &str, flag: EntityFlags, on: bool) {
        let Some(entity_key) = self.mutable_entity(id) else {
            return;
        };
        let entity = &mut self.entities[entity_key];
        if entity.flags.contains(flag) == on {
            return;
        }
        entity.flags.set(flag, on);
        self.fan_out_flags(entity_key);
    }

    /// Override the rendered color of every mesh of an entity, or restore
    /// the authored colors with `None`.
    pub fn set_entity_colorize(&mut self, id: &str, colorize: Option<[f64; 3]>) {
        let Some(entity_key) = self.mutable_entity(id) else {
            return;
        };
        let entity = &mut self.entities[entity_key];
        entity.colorize = colorize.map(|c| [unit_to_u8(c[0]), unit_to_u8(c[1]), unit_to_u8(c[2])]);
        self.fan_out_colors(entity_key);
    }

    /// Override the opacity of every mesh of an entity, or restore the
    /// authored opacities with `None`. Crossing the opaque/transparent
    /// boundary re-packs the render-state word as well.
    pub fn set_entity_opacity(&mut self, id: &str, opacity: Option<f64>) {
        let Some(entity_key) = self.mutable_entity(id) else {
            return;
        };
        let entity = &mut self.entities[entity_key];
        entity.opacity = opacity.map(unit_to_u8);
        self.fan_out_colors(entity_key);

        let flags = self.entities[entity_key].flags;
        let override_alpha = self.entities[entity_key].opacity;
        let mesh_keys: SmallVec<[MeshKey; 4]> = self.entities[entity_key].meshes.clone();
        for mesh_key in mesh_keys {
            let mesh = &mut self.meshes[mesh_key];
            let alpha = override_alpha.unwrap_or(mesh.color[3]);
            let transparent = alpha < 255;
            if transparent == mesh.transparent {
                continue;
            }
            mesh.transparent = transparent;
            let (layer, portion) = (mesh.layer, mesh.portion);
            if let Some((old_flags, old_transparent)) =
                self.layers[layer].set_portion_flags(portion, flags, transparent)
            {
                self.counters.apply(old_flags, old_transparent, false);
                self.counters.apply(flags, transparent, true);
            }
        }
    }

    /// Translate an entity without re-baking geometry: the offset lands in
    /// the per-portion offset sub-range of each layer.
    pub fn set_entity_offset(&mut self, id: &str, offset: Vector3<f64>) {
        let Some(entity_key) = self.mutable_entity(id) else {
            return;
        };
        self.entities[entity_key].offset = offset;
        let mesh_keys: SmallVec<[MeshKey; 4]> = self.entities[entity_key].meshes.clone();
        for mesh_key in mesh_keys {
            let (layer, portion) = {
                let mesh = &self.meshes[mesh_key];
                (mesh.layer, mesh.portion)
            };
            self.layers[layer].set_portion_offset(portion, offset);
        }
    }

    /// Replace the transform of an instanced mesh. Batched meshes bake
    /// their transform into vertex data at creation; retransforming one is
    /// reported and ignored.
    pub fn set_mesh_matrix(&mut self, mesh_id: &str, matrix: Matrix4<f64>) {
        if !self.finalized {
            tracing::warn!(mesh = mesh_id, "mesh mutation before finalize ignored");
            return;
        }
        let Some(&mesh_key) = self.mesh_ids.get(mesh_id) else {
            tracing::warn!(mesh = mesh_id, "unknown mesh");
            return;
        };
        let mesh = &mut self.meshes[mesh_key];
        let (layer_index, portion) = (mesh.layer, mesh.portion);
        let Some(layer) = self.layers[layer_index].as_instancing_mut() else {
            tracing::warn!(mesh = mesh_id, "batched mesh transform is baked, set_mesh_matrix ignored");
            return;
        };
        layer.set_portion_matrix(portion, matrix);
        mesh.matrix = matrix;
        mesh.aabb = layer.geometry().aabb.transformed(&matrix).translated(&mesh.origin);
        if let Some(entity_key) = mesh.entity {
            self.refresh_entity_aabb(entity_key);
        }
    }

    fn refresh_entity_aabb(&mut self, entity_key: EntityKey) {
        let mesh_keys: SmallVec<[MeshKey; 4]> = self.entities[entity_key].meshes.clone();
        let mut aabb = Aabb::new();
        for mesh_key in mesh_keys {
            aabb.union(&self.meshes[mesh_key].aabb);
        }
        self.entities[entity_key].aabb = aabb;
    }

    /// Look up an entity for mutation, enforcing the finalize-first
    /// sequencing. Violations are reported and ignored.
    fn mutable_entity(&mut self, id: &str) -> Option<EntityKey> {
        if !self.finalized {
            tracing::warn!(entity = id, "entity mutation before finalize ignored");
            return None;
        }
        match self.entity_ids.get(id) {
            Some(&key) => Some(key),
            None => {
                tracing::warn!(entity = id, "unknown entity");
                None
            }
        }
    }

    fn fan_out_flags(&mut self, entity_key: EntityKey) {
        let flags = self.entities[entity_key].flags;
        let mesh_keys: SmallVec<[MeshKey; 4]> = self.entities[entity_key].meshes.clone();
        for mesh_key in mesh_keys {
            let (layer, portion, transparent) = {
                let mesh = &self.meshes[mesh_key];
                (mesh.layer, mesh.portion, mesh.transparent)
            };
            if let Some((old_flags, old_transparent)) =
                self.layers[layer].set_portion_flags(portion, flags, transparent)
            {
                self.counters.apply(old_flags, old_transparent, false);
                self.counters.apply(flags, transparent, true);
            }
        }
    }

    fn fan_out_colors(&mut self, entity_key: EntityKey) {
        let colorize = self.entities[entity_key].colorize;
        let opacity = self.entities[entity_key].opacity;
        let mesh_keys: SmallVec<[MeshKey; 4]> = self.entities[entity_key].meshes.clone();
        for mesh_key in mesh_keys {
            let mesh = &self.meshes[mesh_key];
            let rgb = colorize.unwrap_or([mesh.color[0], mesh.color[1], mesh.color[2]]);
            let alpha = opacity.unwrap_or(mesh.color[3]);
            let (layer, portion) = (mesh.layer, mesh.portion);
            self.layers[layer].set_portion_color(portion, [rgb[0], rgb[1], rgb[2], alpha]);
        }
    }

    // ------------------------------------------------------------------
    // bulk state
    // ------------------------------------------------------------------

    pub fn set_all_visible(&mut self, on: bool) {
        self.set_all_flag(EntityFlags::VISIBLE, on);
    }

    pub fn set_all_culled(&mut self, on: bool) {
        self.set_all_flag(EntityFlags::CULLED, on);
    }

    pub fn set_all_pickable(&mut self, on: bool) {
        self.set_all_flag(EntityFlags::PICKABLE, on);
    }

    pub fn set_all_clippable(&mut self, on: bool) {
        self.set_all_flag(EntityFlags::CLIPPABLE, on);
    }

    pub fn set_all_collidable(&mut self, on: bool) {
        self.set_all_flag(EntityFlags::COLLIDABLE, on);
    }

    pub fn set_all_edges(&mut self, on: bool) {
        self.set_all_flag(EntityFlags::EDGES, on);
    }

    pub fn set_all_xrayed(&mut self, on: bool) {
        self.set_all_flag(EntityFlags::XRAYED, on);
    }

    pub fn set_all_highlighted(&mut self, on: bool) {
        self.set_all_flag(EntityFlags::HIGHLIGHTED, on);
    }

    pub fn set_all_selected(&mut self, on: bool) {
        self.set_all_flag(EntityFlags::SELECTED, on);
    }

    /// Translate every entity of the model at once.
    pub fn set_all_offset(&mut self, offset: Vector3<f64>) {
        if !self.finalized {
            tracing::warn!("bulk mutation before finalize ignored");
            return;
        }
        let entity_keys: Vec<EntityKey> = self.entities.keys().collect();
        for entity_key in entity_keys {
            self.entities[entity_key].offset = offset;
            let mesh_keys: SmallVec<[MeshKey; 4]> = self.entities[entity_key].meshes.clone();
            for mesh_key in mesh_keys {
                let (layer, portion) = {
                    let mesh = &self.meshes[mesh_key];
                    (mesh.layer, mesh.portion)
                };
                self.layers[layer].set_portion_offset(portion, offset);
            }
        }
    }

    fn set_all_flag(&mut self, flag: EntityFlags, on: bool) {
        if !self.finalized {
            tracing::warn!("bulk mutation before finalize ignored");
            return;
        }
        let entity_keys: Vec<EntityKey> = self.entities.keys().collect();
        for entity_key in entity_keys {
            let entity = &mut self.entities[entity_key];
            if entity.flags.contains(flag) == on {
                continue;
            }
            entity.flags.set(flag, on);
            self.fan_out_flags(entity_key);
        }
    }

    // ------------------------------------------------------------------
    // drawing
    // ------------------------------------------------------------------

    /// Draw one frame: flush pending sub-range writes, then hand each
    /// non-empty (layer, pass) pair to the renderer in sort order.
    /// Counter-empty passes are skipped without touching any buffer.
    pub fn draw(&mut self, frame: &FrameContext, renderer: &mut dyn LayerRenderer, gpu: &mut dyn GpuContext) {
        if !self.finalized {
            tracing::warn!(model = %self.config.id, "draw before finalize ignored");
            return;
        }
        for layer in &mut self.layers {
            if !layer.is_destroyed() {
                layer.flush(gpu);
            }
        }

        let mut states = Vec::with_capacity(self.draw_order.len());
        for &index in &self.draw_order {
            let layer = &self.layers[index];
            if layer.is_destroyed() || layer.num_portions() == 0 {
                continue;
            }
            match layer.draw_state(&frame.view_matrix) {
                Ok(state) => states.push((index, state)),
                Err(error) => tracing::error!(%error, "layer draw state unavailable"),
            }
        }

        let ctx = self.config.pass_context;
        for pass in DRAW_PASSES {
            if !should_draw(pass, &self.counters, &ctx) {
                continue;
            }
            for (index, state) in &states {
                if should_draw(pass, self.layers[*index].counters(), &ctx) {
                    renderer.draw_layer(frame, state, pass);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // picking
    // ------------------------------------------------------------------

    /// Exact world-space surface hit on one mesh. Requires the model to be
    /// built with `readable_geometry`; without it the result is silently
    /// `None`.
    pub fn ray_pick_mesh(&self, mesh_id: &str, ray: &Ray) -> Option<PickSample> {
        let &mesh_key = self.mesh_ids.get(mesh_id)?;
        let mesh = self.meshes.get(mesh_key)?;
        self.layers[mesh.layer].ray_pick(mesh.portion, ray)
    }

    /// Nearest exact hit across all meshes of an entity.
    pub fn ray_pick_entity(&self, entity_id: &str, ray: &Ray) -> Option<PickSample> {
        let &entity_key = self.entity_ids.get(entity_id)?;
        let entity = self.entities.get(entity_key)?;
        let mut best: Option<PickSample> = None;
        for &mesh_key in &entity.meshes {
            let mesh = &self.meshes[mesh_key];
            if let Some(hit) = self.layers[mesh.layer].ray_pick(mesh.portion, ray) {
                if best.map_or(true, |b| hit.distance < b.distance) {
                    best = Some(hit);
                }
            }
        }
        best
    }

    /// Resolve a pick-buffer readback color to the entity that drew it.
    pub fn entity_by_pick_color(&self, color: [u8; 4]) -> Option<&SceneEntity> {
        let id = strata_core::pick_id(color);
        self.meshes
            .values()
            .find(|mesh| mesh.pick_id == id)
            .and_then(|mesh| mesh.entity)
            .and_then(|key| self.entities.get(key))
    }

    // ------------------------------------------------------------------
    // destruction
    // ------------------------------------------------------------------

    /// Destroy one entity and its meshes, retiring their portions and
    /// releasing any layer that becomes empty.
    pub fn destroy_entity(&mut self, id: &str, gpu: &mut dyn GpuContext) {
        let Some(entity_key) = self.entity_ids.remove(id) else {
            tracing::warn!(entity = id, "unknown entity");
            return;
        };
        let entity = self.entities.remove(entity_key).expect("id map out of sync");
        for mesh_key in entity.meshes {
            let mesh = self.meshes.remove(mesh_key).expect("entity held a dead mesh");
            self.mesh_ids.remove(&mesh.id);
            if let Some((old_flags, old_transparent)) =
                self.layers[mesh.layer].retire_portion(mesh.portion)
            {
                self.counters.apply(old_flags, old_transparent, false);
            }
            self.counters.num_portions -= 1;
            if self.layers[mesh.layer].num_portions() == 0 && !self.layers[mesh.layer].is_destroyed()
            {
                self.layers[mesh.layer].destroy(gpu);
                self.buckets.retain(|_, &mut index| index != mesh.layer);
            }
        }
    }

    /// Destroy the whole model, releasing every GPU buffer.
    pub fn destroy(&mut self, gpu: &mut dyn GpuContext) {
        for layer in &mut self.layers {
            if !layer.is_destroyed() {
                layer.destroy(gpu);
            }
        }
        self.layers.clear();
        self.buckets.clear();
        self.draw_order.clear();
        self.meshes.clear();
        self.mesh_ids.clear();
        self.entities.clear();
        self.entity_ids.clear();
        self.geometries.clear();
        self.textures.clear();
        self.texture_sets.clear();
        self.counters = LayerCounters::default();
        self.aabb = Aabb::new();
    }
}

/// Transform a flat position array by a matrix, in f64.
fn transform_positions(matrix: &Matrix4<f64>, positions: &[f64], identity: bool) -> Vec<f64> {
    if identity {
        return positions.to_vec();
    }
    let mut out = Vec::with_capacity(positions.len());
    for p in positions.chunks_exact(3) {
        let t = matrix.transform_point(&Point3::new(p[0], p[1], p[2]));
        out.extend_from_slice(&[t.x, t.y, t.z]);
    }
    out
}

/// Rotate a flat normal array by the inverse-transpose of a transform.
fn rotate_normals(matrix: &Matrix4<f64>, normals: &[f64]) -> Vec<f64> {
    let nm = normal_matrix(matrix);
    let mut out = Vec::with_capacity(normals.len());
    for n in normals.chunks_exact(3) {
        let r = nm * Vector3::new(n[0], n[1], n[2]);
        out.extend_from_slice(&[r.x, r.y, r.z]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HeadlessContext;
    use crate::renderer::RecordingRenderer;
    use approx::assert_relative_eq;

    fn triangle_geometry() -> GeometryParams {
        GeometryParams {
            kind: Some(PrimitiveKind::Triangles),
            positions: Some(vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0]),
            indices: Some(vec![0, 1, 2]),
            ..Default::default()
        }
    }

    fn readable_model() -> SceneModel {
        SceneModel::new(SceneModelConfig {
            id: "test".to_string(),
            readable_geometry: true,
            ..Default::default()
        })
    }

    #[test]
    fn test_mesh_requires_exactly_one_geometry_source() {
        let mut model = readable_model();
        model.create_geometry("tri", triangle_geometry()).unwrap();

        let both = MeshParams {
            geometry_id: Some("tri".to_string()),
            geometry: Some(triangle_geometry()),
            ..Default::default()
        };
        assert!(matches!(model.create_mesh("m", both), Err(Error::InvalidMesh(_))));

        let neither = MeshParams::default();
        assert!(matches!(model.create_mesh("m", neither), Err(Error::InvalidMesh(_))));
        assert_eq!(model.num_meshes(), 0, "failed creates must not register meshes");
    }

    #[test]
    fn test_unknown_geometry_id_rejected() {
        let mut model = readable_model();
        let params = MeshParams {
            geometry_id: Some("nope".to_string()),
            ..Default::default()
        };
        assert!(matches!(model.create_mesh("m", params), Err(Error::UnknownId { .. })));
    }

    #[test]
    fn test_instanced_meshes_share_one_layer() {
        let mut model = readable_model();
        model.create_geometry("tri", triangle_geometry()).unwrap();
        for i in 0..10 {
            model
                .create_mesh(
                    &format!("m{i}"),
                    MeshParams {
                        geometry_id: Some("tri".to_string()),
                        position: Some(Vector3::new(i as f64, 0.0, 0.0)),
                        ..Default::default()
                    },
                )
                .unwrap();
        }
        assert_eq!(model.num_layers(), 1);
        assert_eq!(model.counters().num_portions, 10);
    }

    #[test]
    fn test_batching_rolls_over_at_capacity() {
        let mut model = SceneModel::new(SceneModelConfig {
            batch_capacity_vertices: 4,
            ..Default::default()
        });
        // each triangle takes 3 vertices; the second cannot join the first
        // layer and must roll to a new one under the same bucket
        model
            .create_mesh("m1", MeshParams { geometry: Some(triangle_geometry()), ..Default::default() })
            .unwrap();
        model
            .create_mesh("m2", MeshParams { geometry: Some(triangle_geometry()), ..Default::default() })
            .unwrap();
        assert_eq!(model.num_layers(), 2);
    }

    #[test]
    fn test_oversized_portion_gets_fitting_layer() {
        let mut model = SceneModel::new(SceneModelConfig {
            batch_capacity_vertices: 2,
            ..Default::default()
        });
        model
            .create_mesh("big", MeshParams { geometry: Some(triangle_geometry()), ..Default::default() })
            .unwrap();
        assert_eq!(model.num_layers(), 1);
        assert_eq!(model.counters().num_portions, 1);
    }

    #[test]
    fn test_transform_preapplied_on_batching_path() {
        let mut gpu = HeadlessContext::new();
        let mut model = readable_model();
        model
            .create_mesh(
                "m",
                MeshParams {
                    geometry: Some(triangle_geometry()),
                    position: Some(Vector3::new(100.0, 0.0, 0.0)),
                    ..Default::default()
                },
            )
            .unwrap();
        model.create_entity("e", EntityParams::from_meshes(["m"])).unwrap();
        model.finalize(&mut gpu).unwrap();

        let hit = model
            .ray_pick_mesh(
                "m",
                &Ray {
                    origin: Point3::new(100.25, 0.25, 5.0),
                    direction: Vector3::new(0.0, 0.0, -1.0),
                },
            )
            .expect("transformed triangle must be where the transform put it");
        assert_relative_eq!(hit.position.x, 100.25, epsilon = 1e-3);
    }

    #[test]
    fn test_entity_flag_defaults_gate_against_model_config() {
        let mut model = SceneModel::new(SceneModelConfig {
            pickable: false,
            xrayed: true,
            ..Default::default()
        });
        model
            .create_mesh("m", MeshParams { geometry: Some(triangle_geometry()), ..Default::default() })
            .unwrap();
        model.create_entity("e", EntityParams::from_meshes(["m"])).unwrap();

        let flags = model.entity("e").unwrap().flags();
        assert!(flags.contains(EntityFlags::VISIBLE));
        assert!(!flags.contains(EntityFlags::PICKABLE), "model default gates pickable off");
        assert!(flags.contains(EntityFlags::XRAYED), "model default forces xray on");
    }

    #[test]
    fn test_duplicate_mesh_ownership_skipped() {
        let mut model = readable_model();
        model.create_geometry("tri", triangle_geometry()).unwrap();
        model
            .create_mesh(
                "m",
                MeshParams { geometry_id: Some("tri".to_string()), ..Default::default() },
            )
            .unwrap();
        model.create_entity("e1", EntityParams::from_meshes(["m"])).unwrap();
        // the second entity exists but must not capture the mesh
        model.create_entity("e2", EntityParams::from_meshes(["m"])).unwrap();

        assert_eq!(model.entity("e1").unwrap().num_meshes(), 1);
        assert_eq!(model.entity("e2").unwrap().num_meshes(), 0);
        assert_eq!(model.counters().num_visible, 1, "initial flags counted once");
    }

    #[test]
    fn test_mutation_before_finalize_is_reported_noop() {
        let mut model = readable_model();
        model.create_geometry("tri", triangle_geometry()).unwrap();
        model
            .create_mesh(
                "m",
                MeshParams { geometry_id: Some("tri".to_string()), ..Default::default() },
            )
            .unwrap();
        model.create_entity("e", EntityParams::from_meshes(["m"])).unwrap();

        model.set_entity_visible("e", false);
        // ignored: the flag word and counters still reflect creation state
        assert_eq!(model.counters().num_visible, 1);
        assert!(model.entity("e").unwrap().flags().contains(EntityFlags::VISIBLE));
    }

    #[test]
    fn test_create_after_finalize_fails() {
        let mut gpu = HeadlessContext::new();
        let mut model = readable_model();
        model
            .create_mesh("m", MeshParams { geometry: Some(triangle_geometry()), ..Default::default() })
            .unwrap();
        model.create_entity("e", EntityParams::from_meshes(["m"])).unwrap();
        model.finalize(&mut gpu).unwrap();

        assert!(matches!(
            model.create_geometry("late", triangle_geometry()),
            Err(Error::AlreadyFinalized(_))
        ));
        assert!(matches!(
            model.create_mesh(
                "late",
                MeshParams { geometry: Some(triangle_geometry()), ..Default::default() }
            ),
            Err(Error::AlreadyFinalized(_))
        ));
        assert!(matches!(
            model.create_entity("late", EntityParams::default()),
            Err(Error::AlreadyFinalized(_))
        ));
        assert!(matches!(model.finalize(&mut gpu), Err(Error::AlreadyFinalized(_))));
    }

    #[test]
    fn test_counters_conserved_across_mutations() {
        let mut gpu = HeadlessContext::new();
        let mut model = readable_model();
        model.create_geometry("tri", triangle_geometry()).unwrap();
        for i in 0..4 {
            model
                .create_mesh(
                    &format!("m{i}"),
                    MeshParams { geometry_id: Some("tri".to_string()), ..Default::default() },
                )
                .unwrap();
            model
                .create_entity(&format!("e{i}"), EntityParams::from_meshes([format!("m{i}")]))
                .unwrap();
        }
        model.finalize(&mut gpu).unwrap();

        model.set_entity_visible("e0", false);
        model.set_entity_selected("e1", true);
        model.set_entity_xrayed("e2", true);
        model.set_entity_visible("e0", false); // repeat: must not move counters

        let c = model.counters();
        assert_eq!(c.num_portions, 4);
        assert_eq!(c.num_visible, 3);
        assert_eq!(c.num_visible + c.num_not_visible(), c.num_portions);
        assert_eq!(c.num_selected, 1);
        assert_eq!(c.num_xrayed, 1);
    }

    #[test]
    fn test_colorize_and_opacity_override_and_restore() {
        let mut gpu = HeadlessContext::new();
        let mut model = readable_model();
        model
            .create_mesh("m", MeshParams { geometry: Some(triangle_geometry()), ..Default::default() })
            .unwrap();
        model.create_entity("e", EntityParams::from_meshes(["m"])).unwrap();
        model.finalize(&mut gpu).unwrap();

        model.set_entity_opacity("e", Some(0.5));
        assert_eq!(model.counters().num_transparent, 1);

        model.set_entity_opacity("e", None);
        assert_eq!(model.counters().num_transparent, 0);

        // colorize alone must not disturb transparency counters
        model.set_entity_colorize("e", Some([1.0, 0.0, 0.0]));
        assert_eq!(model.counters().num_transparent, 0);
    }

    #[test]
    fn test_draw_skips_empty_passes() {
        let mut gpu = HeadlessContext::new();
        let mut renderer = RecordingRenderer::default();
        let mut model = readable_model();
        model
            .create_mesh("m", MeshParams { geometry: Some(triangle_geometry()), ..Default::default() })
            .unwrap();
        model.create_entity("e", EntityParams::from_meshes(["m"])).unwrap();
        model.finalize(&mut gpu).unwrap();

        let frame = FrameContext { view_matrix: Matrix4::identity(), frame_index: 0 };
        model.draw(&frame, &mut renderer, &mut gpu);
        let passes: Vec<RenderPass> = renderer.calls.iter().map(|(_, _, p)| *p).collect();
        assert_eq!(passes, vec![RenderPass::ColorOpaque, RenderPass::Pick]);

        // hiding the only entity leaves nothing to draw at all
        renderer.calls.clear();
        model.set_entity_visible("e", false);
        model.draw(&frame, &mut renderer, &mut gpu);
        assert!(renderer.calls.is_empty());
    }

    #[test]
    fn test_draw_orders_layers_by_sort_id() {
        let mut gpu = HeadlessContext::new();
        let mut renderer = RecordingRenderer::default();
        let mut model = readable_model();
        model.create_geometry("tri", triangle_geometry()).unwrap();
        // instancing layer ("triangles-inst-none") and batching layer
        // ("triangles-batch-none"): batch sorts first
        model
            .create_mesh(
                "mi",
                MeshParams { geometry_id: Some("tri".to_string()), ..Default::default() },
            )
            .unwrap();
        model
            .create_mesh("mb", MeshParams { geometry: Some(triangle_geometry()), ..Default::default() })
            .unwrap();
        model.create_entity("e1", EntityParams::from_meshes(["mi"])).unwrap();
        model.create_entity("e2", EntityParams::from_meshes(["mb"])).unwrap();
        model.finalize(&mut gpu).unwrap();

        let frame = FrameContext { view_matrix: Matrix4::identity(), frame_index: 7 };
        model.draw(&frame, &mut renderer, &mut gpu);
        let color_calls: Vec<&str> = renderer
            .calls
            .iter()
            .filter(|(_, _, p)| *p == RenderPass::ColorOpaque)
            .map(|(_, sort_id, _)| sort_id.as_str())
            .collect();
        assert_eq!(color_calls, vec!["triangles-batch-none", "triangles-inst-none"]);
    }

    #[test]
    fn test_destroy_entity_releases_emptied_layer() {
        let mut gpu = HeadlessContext::new();
        let mut model = readable_model();
        model.create_geometry("tri", triangle_geometry()).unwrap();
        model
            .create_mesh(
                "m",
                MeshParams { geometry_id: Some("tri".to_string()), ..Default::default() },
            )
            .unwrap();
        model.create_entity("e", EntityParams::from_meshes(["m"])).unwrap();
        model.finalize(&mut gpu).unwrap();
        assert!(gpu.buffer_count() > 0);

        model.destroy_entity("e", &mut gpu);
        assert_eq!(model.num_entities(), 0);
        assert_eq!(model.num_meshes(), 0);
        assert_eq!(model.counters().num_portions, 0);
        assert_eq!(gpu.buffer_count(), 0, "emptied layer must release its buffers");
    }

    #[test]
    fn test_destroy_releases_everything() {
        let mut gpu = HeadlessContext::new();
        let mut model = readable_model();
        model
            .create_mesh("m", MeshParams { geometry: Some(triangle_geometry()), ..Default::default() })
            .unwrap();
        model.create_entity("e", EntityParams::from_meshes(["m"])).unwrap();
        model.finalize(&mut gpu).unwrap();
        model.destroy(&mut gpu);
        assert_eq!(gpu.buffer_count(), 0);
        assert_eq!(model.num_layers(), 0);
        assert_eq!(model.counters().num_portions, 0);
    }

    #[test]
    fn test_set_mesh_matrix_moves_instance() {
        let mut gpu = HeadlessContext::new();
        let mut model = readable_model();
        model.create_geometry("tri", triangle_geometry()).unwrap();
        model
            .create_mesh(
                "m",
                MeshParams { geometry_id: Some("tri".to_string()), ..Default::default() },
            )
            .unwrap();
        model.create_entity("e", EntityParams::from_meshes(["m"])).unwrap();
        model.finalize(&mut gpu).unwrap();

        model.set_mesh_matrix("m", Matrix4::new_translation(&Vector3::new(20.0, 0.0, 0.0)));
        let hit = model
            .ray_pick_mesh(
                "m",
                &Ray {
                    origin: Point3::new(20.25, 0.25, 5.0),
                    direction: Vector3::new(0.0, 0.0, -1.0),
                },
            )
            .expect("moved instance must pick at its new position");
        assert_relative_eq!(hit.position.x, 20.25, epsilon = 1e-3);
        assert_relative_eq!(model.entity("e").unwrap().aabb().min.x, 20.0, epsilon = 1e-3);
    }

    #[test]
    fn test_pick_color_resolves_entity() {
        let mut gpu = HeadlessContext::new();
        let mut model = readable_model();
        model
            .create_mesh("m", MeshParams { geometry: Some(triangle_geometry()), ..Default::default() })
            .unwrap();
        model.create_entity("e", EntityParams::from_meshes(["m"])).unwrap();
        model.finalize(&mut gpu).unwrap();

        let color = model.mesh("m").unwrap().pick_color;
        assert_eq!(model.entity_by_pick_color(color).unwrap().id, "e");
        assert!(model.entity_by_pick_color([0, 0, 0, 0]).is_none());
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! # Strata Scene
//!
//! Geometry-aggregation and rendering-state engine for very large
//! BIM/engineering models: millions of discrete objects packed into a
//! handful of GPU buffers, each object still independently
//! show/hide/highlight/select/clip/pick-able.
//!
//! - **Geometry store**: de-duplicated quantized geometry shared by
//!   reference ([`GeometryStore`])
//! - **Storage layers**: batching (distinct geometries in shared buffers)
//!   and instancing (one geometry, per-instance attributes), routed per
//!   compatibility bucket by the scene model
//! - **Scene model**: the orchestrator — mesh/entity registries, layer
//!   routing with capacity rollover, aggregate counters for whole-pass
//!   skipping, finalize, draw, destroy ([`SceneModel`])
//! - **Picking**: exact ray hits against retained geometry ([`Ray`],
//!   [`PickSample`])
//! - **Seams**: the consumed GPU context ([`GpuContext`]) and the external
//!   renderer ([`LayerRenderer`]), both traits; [`HeadlessContext`] runs
//!   the whole engine without a device
//!
//! ## Example
//!
//! ```
//! use strata_scene::{
//!     EntityParams, GeometryParams, HeadlessContext, MeshParams, SceneModel, SceneModelConfig,
//! };
//! use strata_core::PrimitiveKind;
//!
//! let mut gpu = HeadlessContext::new();
//! let mut model = SceneModel::new(SceneModelConfig::default());
//!
//! model.create_geometry("tri", GeometryParams {
//!     kind: Some(PrimitiveKind::Triangles),
//!     positions: Some(vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0]),
//!     indices: Some(vec![0, 1, 2]),
//!     ..Default::default()
//! }).unwrap();
//! model.create_mesh("m1", MeshParams {
//!     geometry_id: Some("tri".to_string()),
//!     ..Default::default()
//! }).unwrap();
//! model.create_entity("e1", EntityParams::from_meshes(["m1"])).unwrap();
//! model.finalize(&mut gpu).unwrap();
//!
//! assert_eq!(model.counters().num_visible, 1);
//! model.set_entity_visible("e1", false);
//! assert_eq!(model.counters().num_visible, 0);
//! ```

pub mod columns;
pub mod counters;
pub mod entity;
pub mod error;
pub mod geometry;
pub mod gpu;
mod layer;
pub mod mesh;
pub mod model;
pub mod picking;
pub mod renderer;
pub mod texture;

pub use columns::Column;
pub use counters::{should_draw, LayerCounters};
pub use entity::{EntityKey, EntityParams, SceneEntity};
pub use error::{Error, Result};
pub use geometry::{Geometry, GeometryParams, GeometryStore};
pub use gpu::{BufferId, BufferUsage, GpuContext, HeadlessContext};
pub use mesh::{MeshKey, MeshParams, SceneMesh};
pub use model::{SceneModel, SceneModelConfig};
pub use picking::{PickSample, Ray};
pub use renderer::{
    FrameContext, LayerBuffers, LayerCounts, LayerDrawState, LayerRenderer, RecordingRenderer,
    StorageKind,
};
pub use texture::{Texture, TextureSet, TextureSetParams};

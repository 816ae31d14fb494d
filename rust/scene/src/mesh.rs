// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scene meshes
//!
//! A mesh is the unit of geometry ownership: exactly one portion in exactly
//! one layer, plus the material and transform state that produced it. Meshes
//! live in a slotmap arena keyed by generational [`MeshKey`]s; the string id
//! the loader used resolves through a side map on the scene model. A mesh
//! belongs to at most one entity and every entity-level state change fans
//! out mesh by mesh to layer portions.

use std::sync::atomic::{AtomicU32, Ordering};

use nalgebra::{Matrix4, UnitQuaternion, Vector3};
use slotmap::new_key_type;
use strata_core::Aabb;

use crate::entity::EntityKey;
use crate::geometry::GeometryParams;

new_key_type! {
    /// Key for a mesh in the scene model's arena.
    pub struct MeshKey;
}

/// Process-wide pick-id allocator. Ids stay unique across every scene
/// model in the process so a pick readback resolves without knowing which
/// model drew it. Zero is reserved for "nothing picked".
static NEXT_PICK_ID: AtomicU32 = AtomicU32::new(1);

/// Allocate the next process-unique pick id.
pub(crate) fn next_pick_id() -> u32 {
    NEXT_PICK_ID.fetch_add(1, Ordering::Relaxed)
}

/// Parameters for [`crate::model::SceneModel::create_mesh`].
///
/// `geometry_id` selects the instancing path; inline `geometry` arrays
/// select the batching path. Supplying both is a configuration error.
#[derive(Debug, Clone)]
pub struct MeshParams {
    /// Reference to a stored geometry (instancing path).
    pub geometry_id: Option<String>,
    /// Inline geometry (batching path).
    pub geometry: Option<GeometryParams>,
    /// Ready-made transform; wins over position/rotation/scale.
    pub matrix: Option<Matrix4<f64>>,
    pub position: Option<Vector3<f64>>,
    pub rotation: Option<UnitQuaternion<f64>>,
    pub scale: Option<Vector3<f64>>,
    /// Additional RTC origin local to this mesh.
    pub origin: Option<Vector3<f64>>,
    pub texture_set_id: Option<String>,
    /// Base color in [0, 1].
    pub color: [f64; 3],
    pub opacity: f64,
    pub metallic: f64,
    pub roughness: f64,
}

impl Default for MeshParams {
    fn default() -> Self {
        Self {
            geometry_id: None,
            geometry: None,
            matrix: None,
            position: None,
            rotation: None,
            scale: None,
            origin: None,
            texture_set_id: None,
            color: [1.0, 1.0, 1.0],
            opacity: 1.0,
            metallic: 0.0,
            roughness: 1.0,
        }
    }
}

impl MeshParams {
    /// The transform this mesh applies, composed the same way regardless of
    /// which form the caller used.
    pub fn transform(&self) -> Matrix4<f64> {
        if let Some(matrix) = self.matrix {
            return matrix;
        }
        strata_core::compose_matrix(
            &self.position.unwrap_or_else(Vector3::zeros),
            &self.rotation.unwrap_or_else(UnitQuaternion::identity),
            &self.scale.unwrap_or_else(|| Vector3::new(1.0, 1.0, 1.0)),
        )
    }
}

/// One mesh: a portion in a layer plus its authoring state.
#[derive(Debug)]
pub struct SceneMesh {
    pub id: String,
    /// Index of the owning layer in the model's layer list.
    pub(crate) layer: usize,
    /// Portion index inside that layer.
    pub(crate) portion: usize,
    /// Quantized base color + opacity.
    pub color: [u8; 4],
    pub metallic_roughness: [u8; 2],
    pub pick_id: u32,
    pub pick_color: [u8; 4],
    /// Mesh transform. Batching pre-applies it to the staged positions;
    /// instancing carries it per instance.
    pub matrix: Matrix4<f64>,
    /// RTC origin of the owning layer (model + mesh + auto-split origin).
    pub origin: Vector3<f64>,
    /// World-space bounds.
    pub aabb: Aabb,
    pub(crate) transparent: bool,
    /// Owning entity; a mesh belongs to at most one.
    pub(crate) entity: Option<EntityKey>,
}

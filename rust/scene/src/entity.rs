// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scene entities
//!
//! An entity is the externally visible interaction identity: the thing a
//! tree view toggles, a click selects, a section plane clips. It groups one
//! or more meshes under a single flag word; every state mutation fans out
//! to the portions of all its meshes. Entities never own vertex data.

use nalgebra::Vector3;
use slotmap::new_key_type;
use smallvec::SmallVec;
use strata_core::{Aabb, EntityFlags};

use crate::mesh::MeshKey;

new_key_type! {
    /// Key for an entity in the scene model's arena.
    pub struct EntityKey;
}

/// Parameters for [`crate::model::SceneModel::create_entity`].
///
/// Per-axis booleans combine with the model-level defaults: the "on by
/// default" axes (visible, pickable, clippable, collidable) require both
/// the entity and the model to enable them, the emphasis axes (culled,
/// edges, xrayed, highlighted, selected) activate when either does.
#[derive(Debug, Clone)]
pub struct EntityParams {
    pub mesh_ids: Vec<String>,
    pub visible: bool,
    pub culled: bool,
    pub pickable: bool,
    pub clippable: bool,
    pub collidable: bool,
    pub edges: bool,
    pub xrayed: bool,
    pub highlighted: bool,
    pub selected: bool,
}

impl Default for EntityParams {
    fn default() -> Self {
        Self {
            mesh_ids: Vec::new(),
            visible: true,
            culled: false,
            pickable: true,
            clippable: true,
            collidable: true,
            edges: false,
            xrayed: false,
            highlighted: false,
            selected: false,
        }
    }
}

impl EntityParams {
    /// Convenience constructor for the common case.
    pub fn from_meshes<I, S>(mesh_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            mesh_ids: mesh_ids.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }
}

/// One entity: a flag word over a set of meshes.
#[derive(Debug)]
pub struct SceneEntity {
    pub id: String,
    pub(crate) flags: EntityFlags,
    pub(crate) meshes: SmallVec<[MeshKey; 4]>,
    /// Union of mesh world bounds, before the entity offset.
    pub(crate) aabb: Aabb,
    /// Post-finalize translation applied to every portion.
    pub(crate) offset: Vector3<f64>,
    /// Colorize override; `None` shows each mesh's own color.
    pub(crate) colorize: Option<[u8; 3]>,
    /// Opacity override; `None` keeps each mesh's authored opacity.
    pub(crate) opacity: Option<u8>,
}

impl SceneEntity {
    pub(crate) fn new(id: &str, flags: EntityFlags) -> Self {
        Self {
            id: id.to_string(),
            flags,
            meshes: SmallVec::new(),
            aabb: Aabb::new(),
            offset: Vector3::zeros(),
            colorize: None,
            opacity: None,
        }
    }

    #[inline]
    pub fn flags(&self) -> EntityFlags {
        self.flags
    }

    #[inline]
    pub fn num_meshes(&self) -> usize {
        self.meshes.len()
    }

    /// World bounds including the current offset.
    pub fn aabb(&self) -> Aabb {
        self.aabb.translated(&self.offset)
    }

    #[inline]
    pub fn offset(&self) -> Vector3<f64> {
        self.offset
    }
}

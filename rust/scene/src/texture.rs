// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Texture and texture-set registries
//!
//! Decoding and upload of texture data is external; the engine only tracks
//! identities so that layers can be bucketed by texture set and can report
//! which material features their buffers support.

/// An externally decoded texture, tracked by identity only.
#[derive(Debug, Clone)]
pub struct Texture {
    pub id: String,
}

/// A named combination of material textures shared by many meshes.
#[derive(Debug, Clone, Default)]
pub struct TextureSet {
    pub id: String,
    pub color: Option<String>,
    pub metallic_roughness: Option<String>,
    pub normals: Option<String>,
    pub emissive: Option<String>,
    pub occlusion: Option<String>,
}

impl TextureSet {
    /// Base-color texture present.
    #[inline]
    pub fn has_color_texture(&self) -> bool {
        self.color.is_some()
    }

    /// Metallic/roughness texture present.
    #[inline]
    pub fn has_metallic_roughness_texture(&self) -> bool {
        self.metallic_roughness.is_some()
    }
}

/// Parameters for [`crate::model::SceneModel::create_texture_set`].
#[derive(Debug, Clone, Default)]
pub struct TextureSetParams {
    pub color_texture_id: Option<String>,
    pub metallic_roughness_texture_id: Option<String>,
    pub normals_texture_id: Option<String>,
    pub emissive_texture_id: Option<String>,
    pub occlusion_texture_id: Option<String>,
}

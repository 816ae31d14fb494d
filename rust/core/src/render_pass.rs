// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Render passes and the packed per-primitive render-state word
//!
//! The packed word is the only channel through which entity state reaches
//! the draw stage. Each vertex (batching) or instance (instancing) carries
//! one 32-bit value holding five fields: the color, silhouette, edge and
//! pick pass the primitive belongs to, plus the clippable bit. The shader
//! compares the field for the pass being drawn against the pass id and
//! discards on mismatch, so flipping an entity's state never touches
//! geometry, only this word.
//!
//! Packing is a pure function of `(EntityFlags, transparency, PassContext)`
//! and is tested without any buffer in sight.

use crate::flags::EntityFlags;

/// A draw-pass category. Discriminants are the values written into the
/// packed word, so they are fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u32)]
pub enum RenderPass {
    NotRendered = 0,
    ColorOpaque = 1,
    ColorTransparent = 2,
    SilhouetteHighlighted = 3,
    SilhouetteSelected = 4,
    SilhouetteXrayed = 5,
    EdgesColorOpaque = 6,
    EdgesColorTransparent = 7,
    EdgesHighlighted = 8,
    EdgesSelected = 9,
    EdgesXrayed = 10,
    Pick = 11,
}

/// Bit offsets of the five fields inside the packed word.
pub const COLOR_SHIFT: u32 = 0;
pub const SILHOUETTE_SHIFT: u32 = 4;
pub const EDGES_SHIFT: u32 = 8;
pub const PICK_SHIFT: u32 = 12;
pub const CLIPPABLE_SHIFT: u32 = 16;

/// Emphasis materials that glow through the color pass keep the underlying
/// color rendering alive; ones that do not suppress it. These switches come
/// from the host's material setup and are constant for a scene, so they are
/// an input to the codec rather than entity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PassContext {
    pub selected_glow_through: bool,
    pub highlighted_glow_through: bool,
    pub xrayed_glow_through: bool,
}

impl Default for PassContext {
    fn default() -> Self {
        Self {
            selected_glow_through: true,
            highlighted_glow_through: true,
            xrayed_glow_through: false,
        }
    }
}

/// Pack entity state into the per-primitive render-state word.
pub fn pack_render_flags(flags: EntityFlags, transparent: bool, ctx: &PassContext) -> u32 {
    let rendered = flags.is_rendered();

    let color_pass = if !rendered {
        RenderPass::NotRendered
    } else if flags.contains(EntityFlags::XRAYED) && !ctx.xrayed_glow_through {
        RenderPass::NotRendered
    } else if flags.contains(EntityFlags::SELECTED) && !ctx.selected_glow_through {
        RenderPass::NotRendered
    } else if flags.contains(EntityFlags::HIGHLIGHTED) && !ctx.highlighted_glow_through {
        RenderPass::NotRendered
    } else if transparent {
        RenderPass::ColorTransparent
    } else {
        RenderPass::ColorOpaque
    };

    let silhouette_pass = if !rendered {
        RenderPass::NotRendered
    } else if flags.contains(EntityFlags::SELECTED) {
        RenderPass::SilhouetteSelected
    } else if flags.contains(EntityFlags::HIGHLIGHTED) {
        RenderPass::SilhouetteHighlighted
    } else if flags.contains(EntityFlags::XRAYED) {
        RenderPass::SilhouetteXrayed
    } else {
        RenderPass::NotRendered
    };

    let edge_pass = if !rendered || !flags.contains(EntityFlags::EDGES) {
        RenderPass::NotRendered
    } else if flags.contains(EntityFlags::SELECTED) {
        RenderPass::EdgesSelected
    } else if flags.contains(EntityFlags::HIGHLIGHTED) {
        RenderPass::EdgesHighlighted
    } else if flags.contains(EntityFlags::XRAYED) {
        RenderPass::EdgesXrayed
    } else if transparent {
        RenderPass::EdgesColorTransparent
    } else {
        RenderPass::EdgesColorOpaque
    };

    let pick_pass = if rendered && flags.contains(EntityFlags::PICKABLE) {
        RenderPass::Pick
    } else {
        RenderPass::NotRendered
    };

    let clippable = u32::from(flags.contains(EntityFlags::CLIPPABLE));

    (color_pass as u32) << COLOR_SHIFT
        | (silhouette_pass as u32) << SILHOUETTE_SHIFT
        | (edge_pass as u32) << EDGES_SHIFT
        | (pick_pass as u32) << PICK_SHIFT
        | clippable << CLIPPABLE_SHIFT
}

/// The five fields unpacked from a render-state word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedPasses {
    pub color: u32,
    pub silhouette: u32,
    pub edges: u32,
    pub pick: u32,
    pub clippable: bool,
}

/// Unpack a render-state word. Used by tests and by software renderers.
pub fn unpack_render_flags(word: u32) -> PackedPasses {
    PackedPasses {
        color: (word >> COLOR_SHIFT) & 0xf,
        silhouette: (word >> SILHOUETTE_SHIFT) & 0xf,
        edges: (word >> EDGES_SHIFT) & 0xf,
        pick: (word >> PICK_SHIFT) & 0xf,
        clippable: (word >> CLIPPABLE_SHIFT) & 1 == 1,
    }
}

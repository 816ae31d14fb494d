// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Entity interaction state bits
//!
//! One word per entity, fanned out verbatim to every mesh it owns. The
//! bits never reach the GPU directly — layers run them through
//! [`crate::render_pass::pack_render_flags`] first.

use bitflags::bitflags;

bitflags! {
    /// Interaction state of an entity.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct EntityFlags: u32 {
        /// Rendered at all.
        const VISIBLE = 1 << 0;
        /// Excluded from every pass despite being visible.
        const CULLED = 1 << 1;
        /// Participates in pick passes and ray queries.
        const PICKABLE = 1 << 2;
        /// Affected by section planes.
        const CLIPPABLE = 1 << 3;
        /// Included in boundary/collision queries by external consumers.
        const COLLIDABLE = 1 << 4;
        /// Edge overlay enabled.
        const EDGES = 1 << 5;
        /// X-ray emphasis.
        const XRAYED = 1 << 6;
        /// Highlight emphasis.
        const HIGHLIGHTED = 1 << 7;
        /// Selection emphasis.
        const SELECTED = 1 << 8;
    }
}

impl EntityFlags {
    /// Visible for rendering purposes: the VISIBLE bit set and not culled.
    #[inline]
    pub fn is_rendered(self) -> bool {
        self.contains(Self::VISIBLE) && !self.contains(Self::CULLED)
    }

    /// Set or clear a single bit, returning the previous state of that bit.
    #[inline]
    pub fn toggle_to(&mut self, flag: EntityFlags, on: bool) -> bool {
        let was = self.contains(flag);
        self.set(flag, on);
        was
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Aggregate portion counters
//!
//! Every layer keeps one [`LayerCounters`] and the scene model keeps the
//! sum over all layers. Each counter counts portions whose state sets the
//! corresponding axis, so a whole pass can be skipped for a whole layer or
//! model by looking at two integers, with zero buffer access. Mutators
//! update counters transactionally: subtract the old state, add the new —
//! which makes repeated identical calls naturally idempotent.

use strata_core::{EntityFlags, PassContext, RenderPass};

/// Portion counts per flag axis, kept per layer and summed per model.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LayerCounters {
    pub num_portions: usize,
    pub num_visible: usize,
    pub num_transparent: usize,
    pub num_xrayed: usize,
    pub num_highlighted: usize,
    pub num_selected: usize,
    pub num_edges: usize,
    pub num_pickable: usize,
    pub num_clippable: usize,
    pub num_culled: usize,
}

impl LayerCounters {
    /// Add (`inc == true`) or remove one portion's state contribution.
    ///
    /// `apply(old, ..., false)` followed by `apply(new, ..., true)` is the
    /// transactional update every mutator uses.
    pub fn apply(&mut self, flags: EntityFlags, transparent: bool, inc: bool) {
        let step = |counter: &mut usize, on: bool| {
            if on {
                if inc {
                    *counter += 1;
                } else {
                    *counter -= 1;
                }
            }
        };
        step(&mut self.num_visible, flags.contains(EntityFlags::VISIBLE));
        step(&mut self.num_transparent, transparent);
        step(&mut self.num_xrayed, flags.contains(EntityFlags::XRAYED));
        step(&mut self.num_highlighted, flags.contains(EntityFlags::HIGHLIGHTED));
        step(&mut self.num_selected, flags.contains(EntityFlags::SELECTED));
        step(&mut self.num_edges, flags.contains(EntityFlags::EDGES));
        step(&mut self.num_pickable, flags.contains(EntityFlags::PICKABLE));
        step(&mut self.num_clippable, flags.contains(EntityFlags::CLIPPABLE));
        step(&mut self.num_culled, flags.contains(EntityFlags::CULLED));
    }

    /// Add another set of counters onto this one (model-level sum).
    pub fn add(&mut self, other: &LayerCounters) {
        self.num_portions += other.num_portions;
        self.num_visible += other.num_visible;
        self.num_transparent += other.num_transparent;
        self.num_xrayed += other.num_xrayed;
        self.num_highlighted += other.num_highlighted;
        self.num_selected += other.num_selected;
        self.num_edges += other.num_edges;
        self.num_pickable += other.num_pickable;
        self.num_clippable += other.num_clippable;
        self.num_culled += other.num_culled;
    }

    /// Portions currently not visible; conservation partner of
    /// `num_visible`.
    #[inline]
    pub fn num_not_visible(&self) -> usize {
        self.num_portions - self.num_visible
    }
}

/// Decide whether a pass has any work in a layer/model with these counters.
///
/// Skips are conservative: a pass is only dropped when its counter is zero
/// or a saturation makes it provably empty — every visible portion
/// transparent leaves nothing for the opaque pass, and x-ray saturation
/// empties the color passes when x-ray does not glow through (x-rayed
/// portions then render only as silhouettes). The glow-through switches
/// come from the same [`PassContext`] the flag codec packs with.
pub fn should_draw(pass: RenderPass, c: &LayerCounters, ctx: &PassContext) -> bool {
    if c.num_portions == 0 || c.num_visible == 0 || c.num_culled == c.num_portions {
        return false;
    }
    let xray_leaves_color = ctx.xrayed_glow_through || c.num_xrayed < c.num_portions;
    match pass {
        RenderPass::NotRendered => false,
        RenderPass::ColorOpaque => c.num_transparent < c.num_portions && xray_leaves_color,
        RenderPass::ColorTransparent => c.num_transparent > 0 && xray_leaves_color,
        RenderPass::SilhouetteHighlighted => c.num_highlighted > 0,
        RenderPass::SilhouetteSelected => c.num_selected > 0,
        RenderPass::SilhouetteXrayed => c.num_xrayed > 0,
        // x-rayed portions always leave the color-edge passes for the
        // emphasis-edge passes, independent of glow-through
        RenderPass::EdgesColorOpaque => {
            c.num_edges > 0 && c.num_transparent < c.num_portions && c.num_xrayed < c.num_portions
        }
        RenderPass::EdgesColorTransparent => {
            c.num_edges > 0 && c.num_transparent > 0 && c.num_xrayed < c.num_portions
        }
        RenderPass::EdgesHighlighted => c.num_edges > 0 && c.num_highlighted > 0,
        RenderPass::EdgesSelected => c.num_edges > 0 && c.num_selected > 0,
        RenderPass::EdgesXrayed => c.num_edges > 0 && c.num_xrayed > 0,
        RenderPass::Pick => c.num_pickable > 0,
    }
}

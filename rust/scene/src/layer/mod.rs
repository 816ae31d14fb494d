// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Storage layers
//!
//! A layer is an append-only GPU buffer aggregate for one primitive kind
//! and one compatibility bucket. Two strategies exist: batching packs many
//! distinct geometries into shared buffers, instancing replicates one
//! geometry through per-instance attributes. The [`Layer`] enum is the
//! closed dispatch point for the capability surface both share; portion
//! creation stays on the concrete types because its inputs differ
//! fundamentally between the strategies.

pub mod batching;
pub mod instancing;

use std::hash::{Hash, Hasher};

use nalgebra::{Matrix4, Vector3};
use rustc_hash::FxHasher;
use strata_core::{EntityFlags, PassContext, PrimitiveKind};

use crate::counters::LayerCounters;
use crate::error::Result;
use crate::gpu::GpuContext;
use crate::picking::{PickSample, Ray};
use crate::renderer::{LayerDrawState, StorageKind};

pub(crate) use batching::{BatchPortionSource, BatchingLayer};
pub(crate) use instancing::{InstancePortionSource, InstancingLayer};

/// Compatibility bucket identifying which layer a mesh can join.
///
/// Origins compare bit-exact: two origins that differ in the last ulp are
/// different buckets, which is correct — mixing them would reintroduce the
/// precision error RTC exists to remove.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct LayerBucket {
    pub storage: StorageKind,
    pub primitive: PrimitiveKind,
    pub origin_bits: [u64; 3],
    /// Batching only: hash of a pre-quantized source decode matrix.
    pub decode_hash: Option<u64>,
    /// Instancing only: the shared geometry.
    pub geometry_id: Option<String>,
    pub texture_set: Option<String>,
}

impl LayerBucket {
    pub fn origin_bits(origin: &Vector3<f64>) -> [u64; 3] {
        [origin.x.to_bits(), origin.y.to_bits(), origin.z.to_bits()]
    }
}

/// Hash a decode matrix for bucket comparison, bit-exact per component.
pub(crate) fn matrix_hash(matrix: &Matrix4<f64>) -> u64 {
    let mut hasher = FxHasher::default();
    for v in matrix.iter() {
        v.to_bits().hash(&mut hasher);
    }
    hasher.finish()
}

/// State shared by both layer strategies.
#[derive(Debug)]
pub(crate) struct LayerCommon {
    pub origin: Vector3<f64>,
    pub primitive: PrimitiveKind,
    pub sort_id: String,
    pub texture_set: Option<String>,
    pub texture_has_color: bool,
    pub texture_has_mr: bool,
    pub pass_ctx: PassContext,
    pub counters: LayerCounters,
    pub finalized: bool,
    pub destroyed: bool,
    /// Sealed layers take no further portions (capacity rollover).
    pub sealed: bool,
    /// Retain CPU-side geometry for picking.
    pub readable: bool,
}

impl LayerCommon {
    pub fn new(
        storage: StorageKind,
        primitive: PrimitiveKind,
        origin: Vector3<f64>,
        texture_set: Option<String>,
        texture_has_color: bool,
        texture_has_mr: bool,
        pass_ctx: PassContext,
        readable: bool,
    ) -> Self {
        let strategy = match storage {
            StorageKind::Batching => "batch",
            StorageKind::Instancing => "inst",
        };
        let sort_id = format!(
            "{}-{}-{}",
            primitive.tag(),
            strategy,
            texture_set.as_deref().unwrap_or("none")
        );
        Self {
            origin,
            primitive,
            sort_id,
            texture_set,
            texture_has_color,
            texture_has_mr,
            pass_ctx,
            counters: LayerCounters::default(),
            finalized: false,
            destroyed: false,
            sealed: false,
            readable,
        }
    }
}

/// Closed dispatch over the two storage strategies.
#[derive(Debug)]
pub(crate) enum Layer {
    Batching(BatchingLayer),
    Instancing(InstancingLayer),
}

impl Layer {
    pub fn common(&self) -> &LayerCommon {
        match self {
            Layer::Batching(l) => &l.common,
            Layer::Instancing(l) => &l.common,
        }
    }

    pub fn counters(&self) -> &LayerCounters {
        &self.common().counters
    }

    pub fn sort_id(&self) -> &str {
        &self.common().sort_id
    }

    pub fn is_destroyed(&self) -> bool {
        self.common().destroyed
    }

    pub fn num_portions(&self) -> usize {
        self.common().counters.num_portions
    }

    pub fn as_batching_mut(&mut self) -> Option<&mut BatchingLayer> {
        match self {
            Layer::Batching(l) => Some(l),
            Layer::Instancing(_) => None,
        }
    }

    pub fn as_instancing_mut(&mut self) -> Option<&mut InstancingLayer> {
        match self {
            Layer::Instancing(l) => Some(l),
            Layer::Batching(_) => None,
        }
    }

    /// Close the layer to further portions. Used on capacity rollover; the
    /// replacement layer under the same bucket key takes over.
    pub fn seal(&mut self) {
        match self {
            Layer::Batching(l) => l.common.sealed = true,
            Layer::Instancing(l) => l.common.sealed = true,
        }
    }

    /// Rewrite one portion's packed render-state, returning its previous
    /// `(flags, transparent)` so the caller can settle aggregate counters.
    pub fn set_portion_flags(
        &mut self,
        portion: usize,
        flags: EntityFlags,
        transparent: bool,
    ) -> Option<(EntityFlags, bool)> {
        match self {
            Layer::Batching(l) => l.set_portion_flags(portion, flags, transparent),
            Layer::Instancing(l) => l.set_portion_flags(portion, flags, transparent),
        }
    }

    pub fn set_portion_color(&mut self, portion: usize, rgba: [u8; 4]) {
        match self {
            Layer::Batching(l) => l.set_portion_color(portion, rgba),
            Layer::Instancing(l) => l.set_portion_color(portion, rgba),
        }
    }

    pub fn set_portion_offset(&mut self, portion: usize, offset: Vector3<f64>) {
        match self {
            Layer::Batching(l) => l.set_portion_offset(portion, offset),
            Layer::Instancing(l) => l.set_portion_offset(portion, offset),
        }
    }

    pub fn finalize(&mut self, gpu: &mut dyn GpuContext) -> Result<()> {
        match self {
            Layer::Batching(l) => l.finalize(gpu),
            Layer::Instancing(l) => l.finalize(gpu),
        }
    }

    pub fn flush(&mut self, gpu: &mut dyn GpuContext) {
        match self {
            Layer::Batching(l) => l.flush(gpu),
            Layer::Instancing(l) => l.flush(gpu),
        }
    }

    pub fn draw_state(&self, view_matrix: &Matrix4<f64>) -> Result<LayerDrawState> {
        match self {
            Layer::Batching(l) => l.draw_state(view_matrix),
            Layer::Instancing(l) => l.draw_state(view_matrix),
        }
    }

    pub fn ray_pick(&self, portion: usize, ray: &Ray) -> Option<PickSample> {
        match self {
            Layer::Batching(l) => l.ray_pick(portion, ray),
            Layer::Instancing(l) => l.ray_pick(portion, ray),
        }
    }

    /// Remove a portion from rendering permanently, returning its previous
    /// state for counter settlement.
    pub fn retire_portion(&mut self, portion: usize) -> Option<(EntityFlags, bool)> {
        match self {
            Layer::Batching(l) => l.retire_portion(portion),
            Layer::Instancing(l) => l.retire_portion(portion),
        }
    }

    pub fn destroy(&mut self, gpu: &mut dyn GpuContext) {
        match self {
            Layer::Batching(l) => l.destroy(gpu),
            Layer::Instancing(l) => l.destroy(gpu),
        }
    }
}

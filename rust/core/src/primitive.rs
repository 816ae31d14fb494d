// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Primitive kinds supported by the storage layers.
//!
//! The five kinds form a closed set: every layer, geometry and renderer
//! branches over this enum rather than over ad hoc string tags. `Solid` and
//! `Surface` are triangle meshes that differ only in backface handling at
//! draw time; all three filled kinds share the triangle code paths.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Primitive topology of a geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PrimitiveKind {
    /// Point cloud, no connectivity.
    Points,
    /// Line segments, two indices per segment.
    Lines,
    /// Open triangle mesh.
    Triangles,
    /// Closed (watertight) triangle mesh, backfaces culled.
    Solid,
    /// Open triangle mesh rendered double-sided.
    Surface,
}

impl PrimitiveKind {
    /// Whether this kind is rasterized as filled triangles.
    #[inline]
    pub fn is_filled(self) -> bool {
        matches!(self, Self::Triangles | Self::Solid | Self::Surface)
    }

    /// Whether geometry of this kind must carry an index array.
    #[inline]
    pub fn needs_indices(self) -> bool {
        !matches!(self, Self::Points)
    }

    /// Index-to-vertex capacity ratio used when sizing a batching layer.
    ///
    /// A layer of `capacity` vertices accepts at most
    /// `capacity * index_capacity_factor()` indices. Triangle kinds observe
    /// roughly three indices per vertex in practice, line sets two, point
    /// clouds none.
    #[inline]
    pub fn index_capacity_factor(self) -> usize {
        match self {
            Self::Points => 0,
            Self::Lines => 2,
            Self::Triangles | Self::Solid | Self::Surface => 3,
        }
    }

    /// Short tag used in layer sort ids.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Points => "points",
            Self::Lines => "lines",
            Self::Triangles => "triangles",
            Self::Solid => "solid",
            Self::Surface => "surface",
        }
    }
}

impl fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for PrimitiveKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "points" => Ok(Self::Points),
            "lines" => Ok(Self::Lines),
            "triangles" => Ok(Self::Triangles),
            "solid" => Ok(Self::Solid),
            "surface" => Ok(Self::Surface),
            other => Err(Error::UnknownPrimitive(other.to_string())),
        }
    }
}

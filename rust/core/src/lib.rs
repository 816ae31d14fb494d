// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! # Strata Core
//!
//! Shared primitives for the strata scene engine: everything the storage
//! layers need that is independent of any particular buffer or renderer.
//!
//! - **Bounds**: f64 axis-aligned boxes ([`Aabb`])
//! - **RTC coordinates**: double-precision origins with single-precision
//!   offsets, for precision at georeferenced extents ([`rtc`])
//! - **Quantization**: 16-bit positions with decode matrices, octahedral
//!   normals, 8-bit colors and pick colors ([`quantize`])
//! - **Render state**: entity flag bits and the packed per-primitive
//!   render-state word driving draw-pass selection ([`render_pass`])
//! - **Edges**: wireframe derivation from triangle connectivity ([`edges`])
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization support for value types

pub mod aabb;
pub mod edges;
pub mod error;
pub mod flags;
pub mod primitive;
pub mod quantize;
pub mod render_pass;
pub mod rtc;
pub mod transform;

// Re-export nalgebra types for convenience
pub use nalgebra::{Matrix3, Matrix4, Point3, UnitQuaternion, Vector3};

pub use aabb::Aabb;
pub use edges::{build_edge_indices, build_edge_indices_f64};
pub use error::{Error, Result};
pub use flags::EntityFlags;
pub use primitive::PrimitiveKind;
pub use quantize::{
    compress_positions, compress_uvs, create_positions_decode_matrix, decompress_position,
    oct_decode_normal, oct_encode_normal, pick_color, pick_id, quantize_positions_to_matrix,
    quantize_rgba, unit_to_u8,
};
pub use render_pass::{pack_render_flags, unpack_render_flags, PackedPasses, PassContext, RenderPass};
pub use rtc::{needs_rtc, rtc_for_positions, rtc_view_matrix, RTC_THRESHOLD};
pub use transform::{compose_matrix, normal_matrix, quaternion_from_euler_degrees};

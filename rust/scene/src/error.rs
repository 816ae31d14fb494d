// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use thiserror::Error;

/// Result type for scene operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or driving a scene model.
///
/// Configuration errors leave the model fully usable; the failed call is a
/// no-op. `AlreadyFinalized`/`NotFinalized` mark programming errors in the
/// caller's sequencing, also scoped to the failed call.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Duplicate {kind} id: {id}")]
    DuplicateId { kind: &'static str, id: String },

    #[error("Unknown {kind} id: {id}")]
    UnknownId { kind: &'static str, id: String },

    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("Invalid mesh configuration: {0}")]
    InvalidMesh(String),

    #[error("Invalid entity configuration: {0}")]
    InvalidEntity(String),

    #[error("Model is already finalized: {0}")]
    AlreadyFinalized(&'static str),

    #[error("Model is not finalized yet: {0}")]
    NotFinalized(&'static str),

    #[error("Core error: {0}")]
    Core(#[from] strata_core::Error),
}

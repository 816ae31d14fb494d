// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use thiserror::Error;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the core primitives
#[derive(Error, Debug)]
pub enum Error {
    #[error("Unknown primitive kind: {0}")]
    UnknownPrimitive(String),

    #[error("Empty position array: {0}")]
    EmptyPositions(String),

    #[error("Position array length {0} is not a multiple of 3")]
    MalformedPositions(usize),

    #[error("Matrix is not invertible: {0}")]
    NonInvertibleMatrix(String),
}

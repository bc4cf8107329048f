//! Domain value errors.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// A stored or supplied name that maps to no known variant.
    #[error("unknown {kind}: {value}")]
    UnknownValue { kind: &'static str, value: String },

    #[error("invalid serial group name: {0:?}")]
    InvalidSerialGroup(String),
}

pub type Result<T> = std::result::Result<T, Error>;

use std::io;
use std::result;

use crate::session::Mode;
use crate::types::NcType;

/// Everything that can go wrong inside an HCDF dataset.
///
/// The `Display` implementation is the human readable error string for each condition.
///
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("operation requires {expected} mode, dataset is in {actual} mode")]
    WrongMode { expected: Mode, actual: Mode },

    #[error("name already in use: {0}")]
    DuplicateName(String),

    #[error("cannot rename, name already in use: {0}")]
    NameCollision(String),

    #[error("dimension not found: {0}")]
    DimensionNotFound(String),

    #[error("variable not found: {0}")]
    VariableNotFound(String),

    #[error("attribute not found: {0}")]
    AttributeNotFound(String),

    #[error("unknown type code: {0}")]
    UnknownType(i32),

    #[error("invalid dimension length: {0}")]
    InvalidLength(i64),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("type mismatch: variable is {expected}, request is {found}")]
    TypeMismatch { expected: NcType, found: NcType },

    #[error("index out of bounds: {0}")]
    OutOfBounds(String),

    #[error("storage properties are final: {0}")]
    AlreadyFinalized(String),

    #[error("chunk codec failure: {0}")]
    Compression(String),

    #[error("block store failure: {0}")]
    BlockStore(#[from] io::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("group path not found: {0}")]
    PathNotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not allowed in classic model: {0}")]
    ClassicModel(String),

    #[error("dataset already exists")]
    Exists,

    #[error("not an HCDF dataset: {0}")]
    Format(String),
}

pub type Result<T> = result::Result<T, Error>;

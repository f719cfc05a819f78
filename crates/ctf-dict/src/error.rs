use ctf_buf::BufError;
use thiserror::Error;

/// Errors surfaced by dictionary operations. Every builder validates its
/// preconditions before mutating state, so a failed call leaves the
/// container unchanged (the documented exceptions: struct import continues
/// past per-member translation failures, and a failed `update` leaves the
/// dirty flag set).
#[derive(Debug, Error)]
pub enum CtfError {
    #[error("container is read-only")]
    ReadOnly,
    #[error("container has no more type ids")]
    Full,
    #[error("type has the maximum number of members or arguments")]
    TypeFull,
    #[error("unknown type id {0:#x}")]
    BadId(u32),
    #[error("type {0:#x} is not an enum")]
    NotEnum(u32),
    #[error("type {0:#x} is not a struct or union")]
    NotSou(u32),
    #[error("forward kind must be struct, union, or enum")]
    NotSue,
    #[error("type {0:#x} has no encoding")]
    NotIntFp(u32),
    #[error("type {0:#x} does not reference another type")]
    NotRef(u32),
    #[error("duplicate name {0:?}")]
    Duplicate(String),
    #[error("conflicting definition for {0:?}")]
    Conflict(String),
    #[error("rollback target predates the last committed update")]
    OverRollback,
    #[error("invalid argument")]
    Invalid,
    #[error("corrupt container: {0}")]
    Corrupt(&'static str),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<BufError> for CtfError {
    fn from(err: BufError) -> Self {
        match err {
            BufError::Corrupt(msg) => Self::Corrupt(msg),
            BufError::BadId(id) => Self::BadId(id),
            BufError::NotSou(id) => Self::NotSou(id),
            BufError::NotEnum(id) => Self::NotEnum(id),
            BufError::NotIntFp(id) => Self::NotIntFp(id),
            BufError::NotRef(id) => Self::NotRef(id),
            BufError::Io(err) => Self::Io(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, CtfError>;

//! # CTF buffer views
//!
//! Read-only access to a serialized CTF container. [`View::open`] validates
//! the header, decodes the variable and type sections into memory, and
//! builds the per-kind name indexes; lookups afterwards never touch the raw
//! bytes again. Views are **write-once, read-many** — the mutable side of
//! the library (`ctf-dict`) produces a fresh buffer on every commit and
//! replaces its view wholesale.
//!
//! Type ids are positional: the n-th record in the type section (1-based)
//! has id `n`, with the child bit ORed in when the container declares a
//! parent name. Id 0 is a sentinel and never resolves.

mod view;

pub use view::{EnumDesc, FuncDesc, MemberDesc, VarDesc, View};

use thiserror::Error;

/// Errors surfaced while opening or querying a read-only container view.
#[derive(Debug, Error)]
pub enum BufError {
    #[error("corrupt container: {0}")]
    Corrupt(&'static str),
    #[error("unknown type id {0:#x}")]
    BadId(u32),
    #[error("type {0:#x} is not a struct or union")]
    NotSou(u32),
    #[error("type {0:#x} is not an enum")]
    NotEnum(u32),
    #[error("type {0:#x} has no encoding")]
    NotIntFp(u32),
    #[error("type {0:#x} does not reference another type")]
    NotRef(u32),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

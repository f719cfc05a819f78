//! # CTF type dictionaries
//!
//! The mutable side of the library: a [`Dict`] accepts incremental type
//! and variable additions, deduplicates imports from other containers,
//! supports snapshot/rollback, and — on [`update`](Dict::update) —
//! serializes everything into a self-contained buffer that a fresh
//! [`View`] is parsed from.
//!
//! ## Key properties
//! - **Monotonic ids**: type ids start at 1, are never reused, and are
//!   assigned in insertion order, which is also the emission order of the
//!   serializer.
//! - **Dirty tracking**: every mutation sets the dirty flag; only a
//!   successful `update` clears it.
//! - **Snapshot/rollback**: opaque snapshot ids bound rollback, and a
//!   rollback can never cross a committed `update`.
//! - **Stable handle**: `update` swaps the parsed view in place behind
//!   `&mut self`; the caller's `Dict` stays valid across commits.
//!
//! ## Example
//! ```rust
//! use ctf_dict::{DataModel, Dict, Encoding, Visibility, INT_SIGNED};
//!
//! let mut dict = Dict::new(DataModel::LP64);
//! let id_int = dict
//!     .add_integer(Visibility::Root, "int", Encoding::new(INT_SIGNED, 0, 32))
//!     .unwrap();
//! let id_s = dict.add_struct(Visibility::Root, "S").unwrap();
//! dict.add_member(id_s, "a", id_int).unwrap();
//! dict.add_member(id_s, "b", id_int).unwrap();
//! dict.update().unwrap();
//!
//! assert_eq!(dict.type_size(id_s).unwrap(), 8);
//! let reopened = Dict::open(dict.bytes().to_vec()).unwrap();
//! assert_eq!(reopened.member_info(id_s, "b").unwrap(), Some((id_int, 32)));
//! ```

mod build;
mod dict;
mod error;
mod import;
mod model;
mod snapshot;
mod store;
mod strtab;
mod update;

pub use build::Visibility;
pub use dict::Dict;
pub use error::{CtfError, Result};
pub use model::DataModel;
pub use snapshot::SnapshotId;

pub use ctf_buf::{BufError, EnumDesc, FuncDesc, MemberDesc, VarDesc, View};
pub use ctf_format::{ArrayInfo, Encoding, Kind, FP_DOUBLE, INT_CHAR, INT_SIGNED};

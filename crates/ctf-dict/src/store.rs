//! Dynamic (uncommitted) record definitions.
//!
//! A writable dictionary keeps every type it has ever allocated as a
//! [`TypeDef`], including types that have since been committed by `update` —
//! the committed high-water index (`old_id`) is what separates pending from
//! committed records. The stores themselves are ordered maps on the
//! container: type indexes are assigned monotonically, so ascending-key
//! iteration of the type store is exactly insertion order, which in turn is
//! the emission order of the serializer.

use ctf_buf::{EnumDesc, FuncDesc, MemberDesc};
use ctf_format::{info_is_root, info_kind, info_vlen, ArrayInfo, Encoding, Kind, TypeRec};

/// Kind-dependent payload of a dynamic type record.
#[derive(Debug, Clone)]
pub(crate) enum Payload {
    /// Pointers, typedefs, qualifiers, and forwards carry their referent in
    /// the record header itself.
    None,
    Encoding(Encoding),
    Array(ArrayInfo),
    /// Function argument vector as emitted on the wire, including the
    /// trailing 0 slot of a variadic signature.
    Args(Vec<u32>),
    Members(Vec<MemberDesc>),
    Enums(Vec<EnumDesc>),
}

/// A dynamic type record: the packed on-disk header plus the owned name and
/// payload. `rec.name` stays 0 in the store; the serializer fills a local
/// copy when it assigns string offsets.
#[derive(Debug, Clone)]
pub(crate) struct TypeDef {
    pub name: Option<String>,
    pub rec: TypeRec,
    pub payload: Payload,
}

impl TypeDef {
    pub fn kind(&self) -> Option<Kind> {
        info_kind(self.rec.info)
    }

    pub fn vlen(&self) -> u32 {
        info_vlen(self.rec.info)
    }

    pub fn is_root(&self) -> bool {
        info_is_root(self.rec.info)
    }

    pub fn func_desc(&self) -> Option<FuncDesc> {
        match &self.payload {
            Payload::Args(argv) => {
                let variadic = argv.last() == Some(&0);
                let args = if variadic {
                    argv[..argv.len() - 1].to_vec()
                } else {
                    argv.clone()
                };
                Some(FuncDesc {
                    ret: self.rec.size_or_type,
                    args,
                    variadic,
                })
            }
            _ => None,
        }
    }
}

/// A dynamic variable binding. The name is the store key; `birth` is the
/// snapshot counter at insertion time and bounds rollback.
#[derive(Debug, Clone)]
pub(crate) struct VarDef {
    pub ty: u32,
    pub birth: u64,
}

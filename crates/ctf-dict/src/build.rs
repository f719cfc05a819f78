//! The type builder API: public constructors that validate their inputs,
//! allocate a fresh type id, and populate the dynamic store.

use ctf_buf::{EnumDesc, MemberDesc};
use ctf_format::{
    roundup, type_info, ArrayInfo, Encoding, Kind, MAX_INDEX, MAX_TYPE, MAX_VLEN,
};

use crate::dict::Dict;
use crate::error::{CtfError, Result};
use crate::store::{Payload, TypeDef, VarDef};

/// Whether a named type is discoverable in the top-level name index of the
/// serialized container, or only reachable through references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Root,
    NonRoot,
}

impl Visibility {
    fn is_root(self) -> bool {
        matches!(self, Self::Root)
    }
}

impl Dict {
    /// Common prologue of every builder: checks writability and id-space
    /// headroom, copies the name, allocates the next index, inserts the
    /// blank record, and marks the container dirty. Returns the new id.
    pub(crate) fn add_generic(&mut self, name: &str) -> Result<u32> {
        if !self.writable {
            return Err(CtfError::ReadOnly);
        }
        if self.next_id >= MAX_INDEX {
            return Err(CtfError::Full);
        }
        let name = if name.is_empty() {
            None
        } else {
            Some(name.to_owned())
        };
        if let Some(name) = &name {
            self.str_growth += name.len() as u64 + 1;
        }
        let index = self.next_id;
        self.next_id += 1;
        self.types.insert(
            index,
            TypeDef {
                name,
                rec: Default::default(),
                payload: Payload::None,
            },
        );
        self.dirty = true;
        Ok(index | self.child_bit())
    }

    fn add_encoded(
        &mut self,
        vis: Visibility,
        name: &str,
        enc: Encoding,
        kind: Kind,
    ) -> Result<u32> {
        let id = self.add_generic(name)?;
        let dtd = self.fresh(id);
        dtd.rec.info = type_info(kind, vis.is_root(), 0);
        dtd.rec.set_size(enc.byte_size());
        dtd.payload = Payload::Encoding(enc);
        Ok(id)
    }

    /// Adds an integer type. Its byte size is derived from the encoding's
    /// bit width.
    pub fn add_integer(&mut self, vis: Visibility, name: &str, enc: Encoding) -> Result<u32> {
        self.add_encoded(vis, name, enc, Kind::Integer)
    }

    /// Adds a floating-point type.
    pub fn add_float(&mut self, vis: Visibility, name: &str, enc: Encoding) -> Result<u32> {
        self.add_encoded(vis, name, enc, Kind::Float)
    }

    pub(crate) fn add_reftype(&mut self, vis: Visibility, ref_id: u32, kind: Kind) -> Result<u32> {
        if ref_id > MAX_TYPE {
            return Err(CtfError::Invalid);
        }
        let id = self.add_generic("")?;
        let dtd = self.fresh(id);
        dtd.rec.info = type_info(kind, vis.is_root(), 0);
        dtd.rec.size_or_type = ref_id;
        Ok(id)
    }

    pub fn add_pointer(&mut self, vis: Visibility, ref_id: u32) -> Result<u32> {
        self.add_reftype(vis, ref_id, Kind::Pointer)
    }

    pub fn add_volatile(&mut self, vis: Visibility, ref_id: u32) -> Result<u32> {
        self.add_reftype(vis, ref_id, Kind::Volatile)
    }

    pub fn add_const(&mut self, vis: Visibility, ref_id: u32) -> Result<u32> {
        self.add_reftype(vis, ref_id, Kind::Const)
    }

    pub fn add_restrict(&mut self, vis: Visibility, ref_id: u32) -> Result<u32> {
        self.add_reftype(vis, ref_id, Kind::Restrict)
    }

    pub fn add_typedef(&mut self, vis: Visibility, name: &str, ref_id: u32) -> Result<u32> {
        if ref_id > MAX_TYPE {
            return Err(CtfError::Invalid);
        }
        let id = self.add_generic(name)?;
        let dtd = self.fresh(id);
        dtd.rec.info = type_info(Kind::Typedef, vis.is_root(), 0);
        dtd.rec.size_or_type = ref_id;
        Ok(id)
    }

    pub fn add_array(&mut self, vis: Visibility, info: ArrayInfo) -> Result<u32> {
        let id = self.add_generic("")?;
        let dtd = self.fresh(id);
        dtd.rec.info = type_info(Kind::Array, vis.is_root(), 0);
        dtd.rec.set_size(0);
        dtd.payload = Payload::Array(info);
        Ok(id)
    }

    /// Replaces the array information of an existing array type.
    pub fn set_array(&mut self, id: u32, info: ArrayInfo) -> Result<()> {
        if !self.writable {
            return Err(CtfError::ReadOnly);
        }
        let dtd = self.dtd_mut(id).ok_or(CtfError::BadId(id))?;
        if dtd.kind() != Some(Kind::Array) {
            return Err(CtfError::BadId(id));
        }
        dtd.payload = Payload::Array(info);
        self.dirty = true;
        Ok(())
    }

    /// Adds a function type. A variadic signature occupies one extra vlen
    /// slot, emitted as a trailing 0.
    pub fn add_function(
        &mut self,
        vis: Visibility,
        ret: u32,
        args: &[u32],
        variadic: bool,
    ) -> Result<u32> {
        if ret > MAX_TYPE {
            return Err(CtfError::Invalid);
        }
        let vlen = args.len() + usize::from(variadic);
        if vlen > MAX_VLEN as usize {
            return Err(CtfError::TypeFull);
        }
        let id = self.add_generic("")?;
        let mut argv = args.to_vec();
        if variadic {
            argv.push(0);
        }
        let dtd = self.fresh(id);
        dtd.rec.info = type_info(Kind::Function, vis.is_root(), vlen as u32);
        dtd.rec.size_or_type = ret;
        dtd.payload = Payload::Args(argv);
        Ok(id)
    }

    /// Allocates the record backing a tag definition. A forward with this
    /// name (committed or pending) in `kind`'s index is upgraded in place,
    /// reusing its id; any other hit shadows and a fresh id is allocated.
    fn upgrade_or_create(&mut self, name: &str, kind: Kind) -> Result<u32> {
        let forward = (!name.is_empty())
            .then(|| self.find_tag(kind, name))
            .flatten()
            .filter(|&cand| self.dtd(cand).map(|d| d.kind()) == Some(Some(Kind::Forward)));
        match forward {
            Some(id) => Ok(id),
            None => self.add_generic(name),
        }
    }

    fn add_sou_sized(
        &mut self,
        vis: Visibility,
        name: &str,
        kind: Kind,
        size: u64,
    ) -> Result<u32> {
        let id = self.upgrade_or_create(name, kind)?;
        let root = vis.is_root();
        let dtd = self.fresh(id);
        dtd.rec.info = type_info(kind, root, 0);
        dtd.rec.set_size(size);
        dtd.payload = Payload::Members(Vec::new());
        self.dirty = true;
        Ok(id)
    }

    /// Adds a struct type with an explicit size, or upgrades a same-named
    /// forward in place.
    pub fn add_struct_sized(&mut self, vis: Visibility, name: &str, size: u64) -> Result<u32> {
        if !self.writable {
            return Err(CtfError::ReadOnly);
        }
        self.add_sou_sized(vis, name, Kind::Struct, size)
    }

    /// Adds a struct type whose size grows as members are added.
    pub fn add_struct(&mut self, vis: Visibility, name: &str) -> Result<u32> {
        self.add_struct_sized(vis, name, 0)
    }

    pub fn add_union_sized(&mut self, vis: Visibility, name: &str, size: u64) -> Result<u32> {
        if !self.writable {
            return Err(CtfError::ReadOnly);
        }
        self.add_sou_sized(vis, name, Kind::Union, size)
    }

    pub fn add_union(&mut self, vis: Visibility, name: &str) -> Result<u32> {
        self.add_union_sized(vis, name, 0)
    }

    /// Adds an enum type sized to the data model's `int`, or upgrades a
    /// same-named forward in place.
    pub fn add_enum(&mut self, vis: Visibility, name: &str) -> Result<u32> {
        if !self.writable {
            return Err(CtfError::ReadOnly);
        }
        let id = self.upgrade_or_create(name, Kind::Enum)?;
        let root = vis.is_root();
        let size = self.model.int_size;
        let dtd = self.fresh(id);
        dtd.rec.info = type_info(Kind::Enum, root, 0);
        dtd.rec.set_size(size);
        dtd.payload = Payload::Enums(Vec::new());
        self.dirty = true;
        Ok(id)
    }

    /// Adds a forward declaration for a struct, union, or enum tag. If the
    /// name already resolves in the matching per-kind index (committed or
    /// pending), returns the existing id.
    pub fn add_forward(&mut self, vis: Visibility, name: &str, kind: Kind) -> Result<u32> {
        if !matches!(kind, Kind::Struct | Kind::Union | Kind::Enum) {
            return Err(CtfError::NotSue);
        }
        if !name.is_empty() {
            if let Some(id) = self.find_tag(kind, name) {
                return Ok(id);
            }
        }
        let id = self.add_generic(name)?;
        let dtd = self.fresh(id);
        dtd.rec.info = type_info(Kind::Forward, vis.is_root(), 0);
        dtd.rec.size_or_type = kind as u32;
        Ok(id)
    }

    /// Appends an enumerator. The name must be unique within the enum.
    pub fn add_enumerator(&mut self, enum_id: u32, name: &str, value: i32) -> Result<()> {
        if name.is_empty() {
            return Err(CtfError::Invalid);
        }
        if !self.writable {
            return Err(CtfError::ReadOnly);
        }
        let dtd = self.dtd(enum_id).ok_or(CtfError::BadId(enum_id))?;
        if dtd.kind() != Some(Kind::Enum) {
            return Err(CtfError::NotEnum(enum_id));
        }
        let (root, vlen) = (dtd.is_root(), dtd.vlen());
        if vlen == MAX_VLEN {
            return Err(CtfError::TypeFull);
        }
        if let Payload::Enums(ents) = &dtd.payload {
            if ents.iter().any(|e| e.name == name) {
                return Err(CtfError::Duplicate(name.to_owned()));
            }
        }
        self.str_growth += name.len() as u64 + 1;
        let dtd = self.fresh(enum_id);
        dtd.rec.info = type_info(Kind::Enum, root, vlen + 1);
        if let Payload::Enums(ents) = &mut dtd.payload {
            ents.push(EnumDesc {
                name: name.to_owned(),
                value,
            });
        }
        self.dirty = true;
        Ok(())
    }

    /// Appends a member at the next naturally aligned offset.
    pub fn add_member(&mut self, sou_id: u32, name: &str, ty: u32) -> Result<()> {
        self.add_member_common(sou_id, name, ty, None)
    }

    /// Appends a member at an explicit bit offset.
    pub fn add_member_at(&mut self, sou_id: u32, name: &str, ty: u32, bit_offset: u64) -> Result<()> {
        self.add_member_common(sou_id, name, ty, Some(bit_offset))
    }

    fn add_member_common(
        &mut self,
        sou_id: u32,
        name: &str,
        ty: u32,
        bit_offset: Option<u64>,
    ) -> Result<()> {
        if !self.writable {
            return Err(CtfError::ReadOnly);
        }
        let dtd = self.dtd(sou_id).ok_or(CtfError::BadId(sou_id))?;
        let kind = dtd.kind();
        if !matches!(kind, Some(Kind::Struct | Kind::Union)) {
            return Err(CtfError::NotSou(sou_id));
        }
        let (root, vlen, cur_size) = (dtd.is_root(), dtd.vlen(), dtd.rec.size());
        if vlen == MAX_VLEN {
            return Err(CtfError::TypeFull);
        }
        let prev = match &dtd.payload {
            Payload::Members(members) => {
                if !name.is_empty()
                    && members.iter().any(|m| m.name.as_deref() == Some(name))
                {
                    return Err(CtfError::Duplicate(name.to_owned()));
                }
                members.last().cloned()
            }
            _ => None,
        };

        let msize = self.type_size(ty)?;
        let malign = self.type_align(ty)?;

        let (offset, size) = if kind == Some(Kind::Struct) && vlen != 0 {
            match bit_offset {
                None => {
                    // Natural placement: advance past the previous member
                    // (its encoded bit width when it has one, its byte size
                    // otherwise), round to a byte, then to the new member's
                    // alignment.
                    let prev = prev.ok_or(CtfError::Corrupt("member count disagrees with list"))?;
                    let mut end = prev.offset;
                    let prev_ty = self.type_resolve(prev.ty)?;
                    match self.type_encoding(prev_ty) {
                        Ok(enc) => end += u64::from(enc.bits),
                        Err(_) => {
                            if let Ok(size) = self.type_size(prev_ty) {
                                end += size * 8;
                            }
                        }
                    }
                    let byte_off = roundup(roundup(end, 8) / 8, malign.max(1));
                    (byte_off * 8, byte_off + msize)
                }
                Some(off) => (off, cur_size.max(off / 8 + msize)),
            }
        } else {
            (0, cur_size.max(msize))
        };

        if !name.is_empty() {
            self.str_growth += name.len() as u64 + 1;
        }
        let member = MemberDesc {
            name: if name.is_empty() {
                None
            } else {
                Some(name.to_owned())
            },
            ty,
            offset,
        };
        let kind = kind.unwrap_or(Kind::Struct);
        let dtd = self.fresh(sou_id);
        dtd.rec.set_size(size);
        dtd.rec.info = type_info(kind, root, vlen + 1);
        if let Payload::Members(members) = &mut dtd.payload {
            members.push(member);
        }
        self.dirty = true;
        Ok(())
    }

    /// Binds a variable name to a type. Names are unique within the
    /// container.
    pub fn add_variable(&mut self, name: &str, ty: u32) -> Result<()> {
        if name.is_empty() {
            return Err(CtfError::Invalid);
        }
        if !self.writable {
            return Err(CtfError::ReadOnly);
        }
        if self.vars.contains_key(name) {
            return Err(CtfError::Duplicate(name.to_owned()));
        }
        self.str_growth += name.len() as u64 + 1;
        self.vars.insert(
            name.to_owned(),
            VarDef {
                ty,
                birth: self.snapshot_count,
            },
        );
        self.dirty = true;
        Ok(())
    }
}

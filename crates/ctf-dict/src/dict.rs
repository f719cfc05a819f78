use std::collections::BTreeMap;

use ctf_buf::{EnumDesc, FuncDesc, MemberDesc, View};
use ctf_format::{ArrayInfo, Encoding, Kind, CHILD_MASK};

use crate::error::{CtfError, Result};
use crate::model::DataModel;
use crate::store::{Payload, TypeDef, VarDef};

/// Cap on qualifier/typedef chains followed by `type_resolve`, so a
/// reference cycle in a hostile buffer terminates.
const MAX_RESOLVE_DEPTH: u32 = 512;

/// A CTF container: a read-only view of the last committed buffer plus the
/// dynamic stores that accumulate uncommitted additions.
///
/// Builder calls mutate the dynamic state and set the dirty flag;
/// [`update`](Dict::update) serializes everything into a fresh buffer and
/// swaps in a view parsed from it, keeping the handle stable. Dynamic
/// records survive the commit — the committed high-water index (`old_id`)
/// is what distinguishes pending from committed types.
#[derive(Debug)]
pub struct Dict {
    pub(crate) view: View,
    pub(crate) types: BTreeMap<u32, TypeDef>,
    pub(crate) vars: BTreeMap<String, VarDef>,
    pub(crate) model: DataModel,
    pub(crate) writable: bool,
    pub(crate) dirty: bool,
    pub(crate) child: bool,
    pub(crate) parent_name: Option<String>,
    /// Bytes of dynamic strings not yet in a committed string table,
    /// including the reserved leading NUL.
    pub(crate) str_growth: u64,
    /// Next type index to allocate. Indexes are never reused.
    pub(crate) next_id: u32,
    /// Highest index covered by the last successful `update`.
    pub(crate) old_id: u32,
    pub(crate) snapshot_count: u64,
    pub(crate) last_committed: u64,
}

impl Dict {
    /// Creates an empty writable dictionary.
    pub fn new(model: DataModel) -> Self {
        Self {
            view: View::empty(),
            types: BTreeMap::new(),
            vars: BTreeMap::new(),
            model,
            writable: true,
            dirty: false,
            child: false,
            parent_name: None,
            str_growth: 1,
            next_id: 1,
            old_id: 0,
            snapshot_count: 1,
            last_committed: 0,
        }
    }

    /// Creates an empty writable child dictionary. Its type ids carry the
    /// child bit and its serialized form records `parent_name` at string
    /// offset 1.
    pub fn new_child(model: DataModel, parent_name: &str) -> Self {
        Self {
            child: true,
            parent_name: Some(parent_name.to_owned()),
            ..Self::new(model)
        }
    }

    /// Wraps a serialized container as a read-only dictionary. Builder
    /// calls on it fail with `ReadOnly`; it serves as an import source and
    /// for lookups.
    pub fn open(data: Vec<u8>) -> Result<Self> {
        let view = View::open(data)?;
        let count = view.type_count();
        Ok(Self {
            child: view.is_child(),
            parent_name: view.parent_name().map(str::to_owned),
            writable: false,
            next_id: count + 1,
            old_id: count,
            view,
            ..Self::new(DataModel::default())
        })
    }

    /// Reads a container from a file. See [`Dict::open`].
    pub fn open_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Self::open(std::fs::read(path)?)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_child(&self) -> bool {
        self.child
    }

    pub fn model(&self) -> DataModel {
        self.model
    }

    /// The read-only view of the last committed buffer.
    pub fn view(&self) -> &View {
        &self.view
    }

    /// The serialized bytes of the last committed buffer.
    pub fn bytes(&self) -> &[u8] {
        self.view.bytes()
    }

    /// Bytes of dynamic strings pending commit, including the reserved
    /// leading NUL.
    pub fn str_growth(&self) -> u64 {
        self.str_growth
    }

    /// The id the next successful builder call will return.
    pub fn next_type_id(&self) -> u32 {
        self.next_id | self.child_bit()
    }

    pub(crate) fn child_bit(&self) -> u32 {
        if self.child {
            CHILD_MASK
        } else {
            0
        }
    }

    /// Strips the child bit, rejecting ids whose child bit disagrees with
    /// the container's.
    pub(crate) fn index_of(&self, id: u32) -> Option<u32> {
        if (id & CHILD_MASK != 0) != self.child {
            return None;
        }
        let index = id & !CHILD_MASK;
        if index == 0 {
            None
        } else {
            Some(index)
        }
    }

    pub(crate) fn dtd(&self, id: u32) -> Option<&TypeDef> {
        self.index_of(id).and_then(|i| self.types.get(&i))
    }

    pub(crate) fn dtd_mut(&mut self, id: u32) -> Option<&mut TypeDef> {
        let index = self.index_of(id)?;
        self.types.get_mut(&index)
    }

    /// The record a builder call just allocated or resolved; absence is a
    /// store invariant violation.
    pub(crate) fn fresh(&mut self, id: u32) -> &mut TypeDef {
        self.dtd_mut(id).expect("dynamic record for allocated id")
    }

    // ---- lookup services spanning the dynamic store and the view ----

    pub fn type_kind(&self, id: u32) -> Result<Kind> {
        if let Some(dtd) = self.dtd(id) {
            return dtd.kind().ok_or(CtfError::Corrupt("unknown type kind"));
        }
        Ok(self.view.kind(id)?)
    }

    pub fn type_name(&self, id: u32) -> Result<Option<String>> {
        if let Some(dtd) = self.dtd(id) {
            return Ok(dtd.name.clone());
        }
        Ok(self.view.name(id)?.map(str::to_owned))
    }

    pub fn type_is_root(&self, id: u32) -> Result<bool> {
        if let Some(dtd) = self.dtd(id) {
            return Ok(dtd.is_root());
        }
        Ok(self.view.is_root(id)?)
    }

    pub fn type_vlen(&self, id: u32) -> Result<u32> {
        if let Some(dtd) = self.dtd(id) {
            return Ok(dtd.vlen());
        }
        Ok(self.view.vlen(id)?)
    }

    fn stored_size(&self, id: u32) -> Result<u64> {
        if let Some(dtd) = self.dtd(id) {
            return Ok(dtd.rec.size());
        }
        Ok(self.view.stored_size(id)?)
    }

    /// The referenced type of a pointer, typedef, or qualifier.
    pub fn type_reference(&self, id: u32) -> Result<u32> {
        if let Some(dtd) = self.dtd(id) {
            return match dtd.kind() {
                Some(Kind::Pointer) => Ok(dtd.rec.size_or_type),
                Some(k) if k.is_reference() => Ok(dtd.rec.size_or_type),
                _ => Err(CtfError::NotRef(id)),
            };
        }
        Ok(self.view.reference(id)?)
    }

    /// Follows typedef and qualifier chains to the underlying type.
    pub fn type_resolve(&self, id: u32) -> Result<u32> {
        let mut id = id;
        for _ in 0..MAX_RESOLVE_DEPTH {
            match self.type_kind(id)? {
                k if k.is_reference() => id = self.type_reference(id)?,
                _ => return Ok(id),
            }
        }
        Err(CtfError::Corrupt("reference chain does not terminate"))
    }

    pub fn type_encoding(&self, id: u32) -> Result<Encoding> {
        if let Some(dtd) = self.dtd(id) {
            return match dtd.payload {
                Payload::Encoding(enc) => Ok(enc),
                _ => Err(CtfError::NotIntFp(id)),
            };
        }
        Ok(self.view.encoding(id)?)
    }

    pub fn array_info(&self, id: u32) -> Result<ArrayInfo> {
        if let Some(dtd) = self.dtd(id) {
            return match dtd.payload {
                Payload::Array(ar) => Ok(ar),
                _ => Err(CtfError::BadId(id)),
            };
        }
        Ok(self.view.array_info(id)?)
    }

    pub fn func_info(&self, id: u32) -> Result<FuncDesc> {
        if let Some(dtd) = self.dtd(id) {
            return dtd.func_desc().ok_or(CtfError::BadId(id));
        }
        Ok(self.view.func_info(id)?)
    }

    pub fn members(&self, id: u32) -> Result<Vec<MemberDesc>> {
        if let Some(dtd) = self.dtd(id) {
            return match &dtd.payload {
                Payload::Members(m) => Ok(m.clone()),
                _ => Err(CtfError::NotSou(id)),
            };
        }
        Ok(self.view.members(id)?.to_vec())
    }

    pub fn enumerators(&self, id: u32) -> Result<Vec<EnumDesc>> {
        if let Some(dtd) = self.dtd(id) {
            return match &dtd.payload {
                Payload::Enums(e) => Ok(e.clone()),
                _ => Err(CtfError::NotEnum(id)),
            };
        }
        Ok(self.view.enumerators(id)?.to_vec())
    }

    /// Looks up a member by name, returning its type and bit offset. The
    /// empty name addresses the first anonymous member.
    pub fn member_info(&self, id: u32, name: &str) -> Result<Option<(u32, u64)>> {
        Ok(self
            .members(id)?
            .into_iter()
            .find(|m| m.name.as_deref().unwrap_or("") == name)
            .map(|m| (m.ty, m.offset)))
    }

    /// Looks up an enumerator by name.
    pub fn enum_value(&self, id: u32, name: &str) -> Result<Option<i32>> {
        Ok(self
            .enumerators(id)?
            .into_iter()
            .find(|e| e.name == name)
            .map(|e| e.value))
    }

    /// Resolves a variable name to its bound type id.
    pub fn lookup_variable(&self, name: &str) -> Option<u32> {
        if let Some(var) = self.vars.get(name) {
            return Some(var.ty);
        }
        self.view
            .vars()
            .iter()
            .find(|v| v.name == name)
            .map(|v| v.ty)
    }

    /// The byte size of a type. Derived for pointers (data model), arrays
    /// (element size times count), and reference kinds (resolved first);
    /// read from the record otherwise.
    pub fn type_size(&self, id: u32) -> Result<u64> {
        let id = self.type_resolve(id)?;
        match self.type_kind(id)? {
            Kind::Pointer => Ok(self.model.pointer_size),
            Kind::Array => {
                let ar = self.array_info(id)?;
                Ok(u64::from(ar.nelems) * self.type_size(ar.contents)?)
            }
            Kind::Function | Kind::Forward | Kind::Unknown => Ok(0),
            _ => self.stored_size(id),
        }
    }

    /// The natural alignment of a type in bytes: its size for the scalar
    /// kinds, the element alignment for arrays, and the maximum member
    /// alignment for aggregates.
    pub fn type_align(&self, id: u32) -> Result<u64> {
        let id = self.type_resolve(id)?;
        match self.type_kind(id)? {
            Kind::Pointer => Ok(self.model.pointer_size),
            Kind::Function => Ok(self.model.pointer_size),
            Kind::Array => {
                let ar = self.array_info(id)?;
                self.type_align(ar.contents)
            }
            Kind::Struct | Kind::Union => {
                let mut align = 0;
                for m in self.members(id)? {
                    align = align.max(self.type_align(m.ty)?);
                }
                Ok(align)
            }
            Kind::Forward | Kind::Unknown => Ok(0),
            _ => self.type_size(id),
        }
    }

    /// Resolves a tag name to an id: the committed per-kind index first,
    /// then pending definitions newest-first. A pending forward referencing
    /// `kind` counts as a hit, which is what lets a definition upgrade a
    /// forward added in the same generation.
    pub(crate) fn find_tag(&self, kind: Kind, name: &str) -> Option<u32> {
        if let Some(id) = self.view.lookup_root(kind, name) {
            return Some(id);
        }
        for (&index, dtd) in self.types.range(self.old_id + 1..).rev() {
            if !dtd.is_root() || dtd.name.as_deref() != Some(name) {
                continue;
            }
            match dtd.kind() {
                Some(k) if k == kind => return Some(index | self.child_bit()),
                Some(Kind::Forward) if Kind::from_u32(dtd.rec.size_or_type) == Some(kind) => {
                    return Some(index | self.child_bit());
                }
                _ => {}
            }
        }
        None
    }

    // ---- deletion, shared by rollback ----

    /// Removes a dynamic type record, returning its string bytes to the
    /// growth counter.
    pub(crate) fn delete_type(&mut self, index: u32) {
        let Some(dtd) = self.types.remove(&index) else {
            return;
        };
        if let Some(name) = &dtd.name {
            self.str_growth -= name.len() as u64 + 1;
        }
        match &dtd.payload {
            Payload::Members(members) => {
                for m in members {
                    if let Some(name) = &m.name {
                        self.str_growth -= name.len() as u64 + 1;
                    }
                }
            }
            Payload::Enums(ents) => {
                for e in ents {
                    self.str_growth -= e.name.len() as u64 + 1;
                }
            }
            _ => {}
        }
    }

    /// Removes a dynamic variable, returning its name bytes to the growth
    /// counter.
    pub(crate) fn delete_var(&mut self, name: &str) {
        if self.vars.remove(name).is_some() {
            self.str_growth -= name.len() as u64 + 1;
        }
    }
}

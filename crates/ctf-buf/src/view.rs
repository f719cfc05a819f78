use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::HashMap;

use ctf_format::{
    info_is_root, info_kind, info_vlen, lmember_offset, ArrayInfo, Encoding, Header, Kind,
    TypeRec, CHILD_MASK, HEADER_LEN, LSTRUCT_THRESH, MAGIC, VARENT_LEN, VERSION,
};

use crate::BufError;

/// A struct or union member as decoded from the type section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberDesc {
    /// `None` for anonymous members (name offset 0).
    pub name: Option<String>,
    pub ty: u32,
    /// Offset of the member in bits from the start of the aggregate.
    pub offset: u64,
}

/// An enumerator as decoded from the type section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumDesc {
    pub name: String,
    pub value: i32,
}

/// A function signature: return type, argument types, variadic marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncDesc {
    pub ret: u32,
    pub args: Vec<u32>,
    pub variadic: bool,
}

/// A named variable binding from the variable section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarDesc {
    pub name: String,
    pub ty: u32,
}

#[derive(Debug, Clone)]
enum Payload {
    None,
    Encoding(Encoding),
    Array(ArrayInfo),
    /// Raw argument vector, including the trailing 0 slot of a variadic
    /// function.
    Args(Vec<u32>),
    Members(Vec<MemberDesc>),
    Enums(Vec<EnumDesc>),
}

#[derive(Debug)]
struct TypeEntry {
    name: Option<String>,
    rec: TypeRec,
    payload: Payload,
}

/// A parsed, immutable CTF container.
#[derive(Debug)]
pub struct View {
    data: Vec<u8>,
    child: bool,
    parent_name: Option<String>,
    types: Vec<TypeEntry>,
    vars: Vec<VarDesc>,
    structs: HashMap<String, u32>,
    unions: HashMap<String, u32>,
    enums: HashMap<String, u32>,
    names: HashMap<String, u32>,
}

/// Reads the NUL-terminated string at `off` within the string table.
/// Offset 0 is the reserved empty name and is valid even in a container
/// with no string table at all.
fn str_at(strings: &[u8], off: u32) -> Result<&str, BufError> {
    if off == 0 {
        return Ok("");
    }
    let off = off as usize;
    if off >= strings.len() {
        return Err(BufError::Corrupt("name offset past string table"));
    }
    let rest = &strings[off..];
    let end = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or(BufError::Corrupt("unterminated string"))?;
    std::str::from_utf8(&rest[..end]).map_err(|_| BufError::Corrupt("name is not utf-8"))
}

fn nonempty(name: &str) -> Option<String> {
    if name.is_empty() {
        None
    } else {
        Some(name.to_owned())
    }
}

impl View {
    /// The view a freshly created dictionary starts from: a zeroed header
    /// with every section empty.
    pub fn empty() -> Self {
        let mut data = vec![0u8; HEADER_LEN as usize];
        data[0..2].copy_from_slice(&MAGIC.to_le_bytes());
        data[2] = VERSION;
        Self {
            data,
            child: false,
            parent_name: None,
            types: Vec::new(),
            vars: Vec::new(),
            structs: HashMap::new(),
            unions: HashMap::new(),
            enums: HashMap::new(),
            names: HashMap::new(),
        }
    }

    /// Parses a serialized container, taking ownership of the bytes.
    ///
    /// Validates the preamble and section bounds, decodes every variable
    /// and type record, and builds the four per-kind name indexes over
    /// root-visible named types. Forwards are indexed under their
    /// referenced kind and never displace a real definition.
    pub fn open(data: Vec<u8>) -> Result<Self, BufError> {
        if (data.len() as u64) < HEADER_LEN {
            return Err(BufError::Corrupt("buffer shorter than header"));
        }
        let hdr = Header::read_from(&mut &data[..])?;
        if hdr.magic != MAGIC {
            return Err(BufError::Corrupt("bad magic"));
        }
        if hdr.version != VERSION {
            return Err(BufError::Corrupt("unsupported version"));
        }
        if hdr.varoff > hdr.typeoff || hdr.typeoff > hdr.stroff {
            return Err(BufError::Corrupt("section offsets out of order"));
        }
        let body_len = data.len() as u64 - HEADER_LEN;
        if u64::from(hdr.stroff) + u64::from(hdr.strlen) != body_len {
            return Err(BufError::Corrupt("section bounds disagree with buffer length"));
        }
        if u64::from(hdr.typeoff - hdr.varoff) % VARENT_LEN != 0 {
            return Err(BufError::Corrupt("ragged variable section"));
        }

        let base = HEADER_LEN as usize;
        let strings = &data[base + hdr.stroff as usize..];
        if hdr.strlen > 0 && strings[0] != 0 {
            return Err(BufError::Corrupt("string table does not start with NUL"));
        }

        let child = hdr.parname != 0;
        let parent_name = if child {
            nonempty(str_at(strings, hdr.parname)?)
        } else {
            None
        };

        let mut vars = Vec::new();
        let mut vp = &data[base + hdr.varoff as usize..base + hdr.typeoff as usize];
        while !vp.is_empty() {
            let name_off = vp.read_u32::<LittleEndian>()?;
            let ty = vp.read_u32::<LittleEndian>()?;
            let name = str_at(strings, name_off)?.to_owned();
            vars.push(VarDesc { name, ty });
        }

        let mut types = Vec::new();
        let mut tp = &data[base + hdr.typeoff as usize..base + hdr.stroff as usize];
        while !tp.is_empty() {
            let rec = TypeRec::read_from(&mut tp)?;
            let kind = info_kind(rec.info).ok_or(BufError::Corrupt("unknown type kind"))?;
            let vlen = info_vlen(rec.info) as usize;

            let payload = match kind {
                Kind::Integer | Kind::Float => {
                    Payload::Encoding(Encoding::from_word(tp.read_u32::<LittleEndian>()?))
                }
                Kind::Array => Payload::Array(ArrayInfo::read_from(&mut tp)?),
                Kind::Function => {
                    let mut args = Vec::with_capacity(vlen);
                    for _ in 0..vlen {
                        args.push(tp.read_u32::<LittleEndian>()?);
                    }
                    if vlen % 2 == 1 {
                        tp.read_u32::<LittleEndian>()?; // alignment padding
                    }
                    Payload::Args(args)
                }
                Kind::Struct | Kind::Union => {
                    let long = rec.size() >= LSTRUCT_THRESH;
                    let mut members = Vec::with_capacity(vlen);
                    for _ in 0..vlen {
                        let name_off = tp.read_u32::<LittleEndian>()?;
                        let ty = tp.read_u32::<LittleEndian>()?;
                        let offset = if long {
                            let hi = tp.read_u32::<LittleEndian>()?;
                            let lo = tp.read_u32::<LittleEndian>()?;
                            lmember_offset(hi, lo)
                        } else {
                            u64::from(tp.read_u32::<LittleEndian>()?)
                        };
                        members.push(MemberDesc {
                            name: nonempty(str_at(strings, name_off)?),
                            ty,
                            offset,
                        });
                    }
                    Payload::Members(members)
                }
                Kind::Enum => {
                    let mut ents = Vec::with_capacity(vlen);
                    for _ in 0..vlen {
                        let name_off = tp.read_u32::<LittleEndian>()?;
                        let value = tp.read_i32::<LittleEndian>()?;
                        ents.push(EnumDesc {
                            name: str_at(strings, name_off)?.to_owned(),
                            value,
                        });
                    }
                    Payload::Enums(ents)
                }
                Kind::Forward => {
                    Kind::from_u32(rec.size_or_type)
                        .filter(|k| matches!(k, Kind::Struct | Kind::Union | Kind::Enum))
                        .ok_or(BufError::Corrupt("forward references a non-tag kind"))?;
                    Payload::None
                }
                _ => Payload::None,
            };

            types.push(TypeEntry {
                name: nonempty(str_at(strings, rec.name)?),
                rec,
                payload,
            });
        }

        let mut view = Self {
            data,
            child,
            parent_name,
            types,
            vars,
            structs: HashMap::new(),
            unions: HashMap::new(),
            enums: HashMap::new(),
            names: HashMap::new(),
        };
        view.build_indexes();
        Ok(view)
    }

    fn build_indexes(&mut self) {
        let child_bit = if self.child { CHILD_MASK } else { 0 };
        for (i, entry) in self.types.iter().enumerate() {
            let id = (i as u32 + 1) | child_bit;
            if !info_is_root(entry.rec.info) {
                continue;
            }
            let name = match &entry.name {
                Some(n) => n.clone(),
                None => continue,
            };
            let kind = match info_kind(entry.rec.info) {
                Some(k) => k,
                None => continue,
            };
            match kind {
                Kind::Struct => {
                    self.structs.insert(name, id);
                }
                Kind::Union => {
                    self.unions.insert(name, id);
                }
                Kind::Enum => {
                    self.enums.insert(name, id);
                }
                // A forward is discoverable under its referenced kind, but a
                // real definition always wins the slot.
                Kind::Forward => {
                    let index = match Kind::from_u32(entry.rec.size_or_type) {
                        Some(Kind::Struct) => &mut self.structs,
                        Some(Kind::Union) => &mut self.unions,
                        Some(Kind::Enum) => &mut self.enums,
                        _ => continue,
                    };
                    index.entry(name).or_insert(id);
                }
                _ => {
                    self.names.insert(name, id);
                }
            }
        }
    }

    fn entry(&self, id: u32) -> Result<&TypeEntry, BufError> {
        let index = if self.child {
            if id & CHILD_MASK == 0 {
                return Err(BufError::BadId(id));
            }
            id & !CHILD_MASK
        } else {
            if id & CHILD_MASK != 0 {
                return Err(BufError::BadId(id));
            }
            id
        };
        if index == 0 || index as usize > self.types.len() {
            return Err(BufError::BadId(id));
        }
        Ok(&self.types[index as usize - 1])
    }

    /// Number of type records in this view.
    pub fn type_count(&self) -> u32 {
        self.types.len() as u32
    }

    pub fn contains(&self, id: u32) -> bool {
        self.entry(id).is_ok()
    }

    pub fn kind(&self, id: u32) -> Result<Kind, BufError> {
        let entry = self.entry(id)?;
        info_kind(entry.rec.info).ok_or(BufError::Corrupt("unknown type kind"))
    }

    pub fn is_root(&self, id: u32) -> Result<bool, BufError> {
        Ok(info_is_root(self.entry(id)?.rec.info))
    }

    pub fn vlen(&self, id: u32) -> Result<u32, BufError> {
        Ok(info_vlen(self.entry(id)?.rec.info))
    }

    pub fn name(&self, id: u32) -> Result<Option<&str>, BufError> {
        Ok(self.entry(id)?.name.as_deref())
    }

    /// The raw size field of the record, with long halves joined. Derived
    /// sizes (arrays, references) are the dictionary's concern.
    pub fn stored_size(&self, id: u32) -> Result<u64, BufError> {
        Ok(self.entry(id)?.rec.size())
    }

    pub fn encoding(&self, id: u32) -> Result<Encoding, BufError> {
        match self.entry(id)?.payload {
            Payload::Encoding(enc) => Ok(enc),
            _ => Err(BufError::NotIntFp(id)),
        }
    }

    /// The referenced type of a pointer, typedef, or qualifier record.
    pub fn reference(&self, id: u32) -> Result<u32, BufError> {
        let entry = self.entry(id)?;
        match info_kind(entry.rec.info) {
            Some(Kind::Pointer) => Ok(entry.rec.size_or_type),
            Some(k) if k.is_reference() => Ok(entry.rec.size_or_type),
            _ => Err(BufError::NotRef(id)),
        }
    }

    pub fn array_info(&self, id: u32) -> Result<ArrayInfo, BufError> {
        match self.entry(id)?.payload {
            Payload::Array(ar) => Ok(ar),
            _ => Err(BufError::BadId(id)),
        }
    }

    pub fn func_info(&self, id: u32) -> Result<FuncDesc, BufError> {
        let entry = self.entry(id)?;
        match &entry.payload {
            Payload::Args(argv) => {
                let variadic = argv.last() == Some(&0);
                let args = if variadic {
                    argv[..argv.len() - 1].to_vec()
                } else {
                    argv.clone()
                };
                Ok(FuncDesc {
                    ret: entry.rec.size_or_type,
                    args,
                    variadic,
                })
            }
            _ => Err(BufError::BadId(id)),
        }
    }

    pub fn members(&self, id: u32) -> Result<&[MemberDesc], BufError> {
        match &self.entry(id)?.payload {
            Payload::Members(m) => Ok(m),
            _ => Err(BufError::NotSou(id)),
        }
    }

    pub fn enumerators(&self, id: u32) -> Result<&[EnumDesc], BufError> {
        match &self.entry(id)?.payload {
            Payload::Enums(e) => Ok(e),
            _ => Err(BufError::NotEnum(id)),
        }
    }

    /// Looks up a member by name, returning its type and bit offset.
    pub fn member_info(&self, id: u32, name: &str) -> Result<Option<(u32, u64)>, BufError> {
        Ok(self
            .members(id)?
            .iter()
            .find(|m| m.name.as_deref() == Some(name))
            .map(|m| (m.ty, m.offset)))
    }

    /// Looks up an enumerator by name.
    pub fn enum_value(&self, id: u32, name: &str) -> Result<Option<i32>, BufError> {
        Ok(self
            .enumerators(id)?
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value))
    }

    /// The name index a given kind is discoverable in: structs, unions, and
    /// enums have dedicated indexes; every other kind shares the catch-all.
    pub fn lookup_root(&self, kind: Kind, name: &str) -> Option<u32> {
        let index = match kind {
            Kind::Struct => &self.structs,
            Kind::Union => &self.unions,
            Kind::Enum => &self.enums,
            _ => &self.names,
        };
        index.get(name).copied()
    }

    pub fn vars(&self) -> &[VarDesc] {
        &self.vars
    }

    pub fn is_child(&self) -> bool {
        self.child
    }

    pub fn parent_name(&self) -> Option<&str> {
        self.parent_name.as_deref()
    }

    /// The raw serialized container.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use ctf_format::{type_info, VARENT_LEN};

    fn header_with(typelen: u32, strtab: &[u8], nvars: u32) -> Header {
        let mut hdr = Header::new();
        hdr.varoff = 0;
        hdr.typeoff = nvars * VARENT_LEN as u32;
        hdr.stroff = hdr.typeoff + typelen;
        hdr.strlen = strtab.len() as u32;
        hdr
    }

    /// One root-visible 32-bit signed int named "int", no variables.
    fn one_int_container() -> Vec<u8> {
        let strtab = b"\0int\0";
        let hdr = header_with(16, strtab, 0);

        let mut buf = Vec::new();
        hdr.write_to(&mut buf).unwrap();
        buf.write_u32::<LittleEndian>(1).unwrap(); // name "int"
        buf.write_u32::<LittleEndian>(type_info(Kind::Integer, true, 0))
            .unwrap();
        buf.write_u32::<LittleEndian>(4).unwrap(); // size
        buf.write_u32::<LittleEndian>(Encoding::new(ctf_format::INT_SIGNED, 0, 32).to_word())
            .unwrap();
        buf.extend_from_slice(strtab);
        buf
    }

    #[test]
    fn empty_view_has_no_types() {
        let view = View::empty();
        assert_eq!(view.type_count(), 0);
        assert!(!view.is_child());
        assert!(view.vars().is_empty());
        assert!(!view.contains(1));
    }

    #[test]
    fn empty_view_bytes_reparse() {
        let view = View::empty();
        let again = View::open(view.bytes().to_vec()).unwrap();
        assert_eq!(again.type_count(), 0);
    }

    #[test]
    fn open_decodes_integer() {
        let view = View::open(one_int_container()).unwrap();
        assert_eq!(view.type_count(), 1);
        assert_eq!(view.kind(1).unwrap(), Kind::Integer);
        assert_eq!(view.name(1).unwrap(), Some("int"));
        assert_eq!(view.stored_size(1).unwrap(), 4);
        assert_eq!(view.encoding(1).unwrap().bits, 32);
        assert_eq!(view.lookup_root(Kind::Integer, "int"), Some(1));
        assert_eq!(view.lookup_root(Kind::Struct, "int"), None);
    }

    #[test]
    fn id_zero_is_a_sentinel() {
        let view = View::open(one_int_container()).unwrap();
        assert!(matches!(view.kind(0), Err(BufError::BadId(0))));
    }

    #[test]
    fn open_rejects_bad_magic() {
        let mut data = one_int_container();
        data[0] = 0x00;
        assert!(matches!(
            View::open(data),
            Err(BufError::Corrupt("bad magic"))
        ));
    }

    #[test]
    fn open_rejects_short_buffer() {
        assert!(View::open(vec![0u8; 10]).is_err());
    }

    #[test]
    fn open_rejects_mismatched_bounds() {
        let mut data = one_int_container();
        data.push(0); // one stray byte past the declared sections
        assert!(View::open(data).is_err());
    }

    #[test]
    fn encoding_on_non_numeric_fails() {
        let strtab = b"\0";
        let hdr = header_with(12, strtab, 0);
        let mut buf = Vec::new();
        hdr.write_to(&mut buf).unwrap();
        buf.write_u32::<LittleEndian>(0).unwrap();
        buf.write_u32::<LittleEndian>(type_info(Kind::Pointer, false, 0))
            .unwrap();
        buf.write_u32::<LittleEndian>(0).unwrap(); // points at the void sentinel
        buf.extend_from_slice(strtab);

        let view = View::open(buf).unwrap();
        assert!(matches!(view.encoding(1), Err(BufError::NotIntFp(1))));
        assert_eq!(view.reference(1).unwrap(), 0);
    }
}

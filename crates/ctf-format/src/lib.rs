//! # CTF wire format
//!
//! Encoding primitives for CTF (Compact Type Format) containers — the bit
//! layouts shared by the serializer in `ctf-dict` and the parser in
//! `ctf-buf`.
//!
//! ## Container layout (v2)
//!
//! ```text
//! ┌───────────────────────────────────────────────┐ offset 0
//! │ HEADER (40 bytes)                             │
//! │                                               │
//! │ magic(u16) | version(u8) | flags(u8)          │
//! │ parlabel | parname                            │
//! │ lbloff | objtoff | funcoff                    │
//! │ varoff | typeoff | stroff | strlen  (all u32) │
//! ├───────────────────────────────────────────────┤ header + varoff
//! │ VARIABLE SECTION                              │
//! │ repeated: name_off(u32) | type_id(u32),       │
//! │ sorted by name string                         │
//! ├───────────────────────────────────────────────┤ header + typeoff
//! │ TYPE SECTION (variable-length records,        │
//! │ each 4-byte aligned)                          │
//! ├───────────────────────────────────────────────┤ header + stroff
//! │ STRING TABLE                                  │
//! │ leading '\0', then parent name if child, then │
//! │ names in emission order                       │
//! └───────────────────────────────────────────────┘ header + stroff + strlen
//! ```
//!
//! A type record is the 12-byte short header `name | info | size_or_type`,
//! extended to 20 bytes (`lsizehi | lsizelo`) when the size field holds
//! [`LSIZE_SENT`], followed by a kind-dependent payload. All integers are
//! little-endian.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Result as IoResult, Write};

/// Magic number identifying a CTF container.
pub const MAGIC: u16 = 0xcff1;

/// Format version emitted and accepted by this crate.
pub const VERSION: u8 = 2;

/// Size of the container header in bytes.
pub const HEADER_LEN: u64 = 40;

/// Bit position of the kind field inside the info word.
pub const K_SHIFT: u32 = 27;

/// Root-visibility flag inside the info word.
pub const ROOT_BIT: u32 = 1 << 26;

/// Mask extracting the variable-length payload count from the info word.
pub const VLEN_MASK: u32 = 0xffff;

/// Largest member/enumerator/argument count a single type may carry.
pub const MAX_VLEN: u32 = 0xffff;

/// Largest size representable in the short `size` field.
pub const MAX_SIZE: u32 = 0xffff_fffe;

/// Sentinel in the short `size` field marking a long (20-byte) type record.
pub const LSIZE_SENT: u32 = 0xffff_ffff;

/// Largest type id usable as a reference.
pub const MAX_TYPE: u32 = 0xffff_fffe;

/// Largest type index assignable within one container. Bit 31 is reserved
/// for the child-container marker.
pub const MAX_INDEX: u32 = 0x7fff_ffff;

/// Child-container bit carried in every type id of a child container.
pub const CHILD_MASK: u32 = 0x8000_0000;

/// Byte-size threshold at or above which a struct/union switches from short
/// to long member records.
pub const LSTRUCT_THRESH: u64 = 8192;

/// Length of a short type record header.
pub const SHORT_TYPE_LEN: u64 = 12;

/// Length of a long type record header.
pub const LONG_TYPE_LEN: u64 = 20;

/// Length of a short member record.
pub const MEMBER_LEN: u64 = 12;

/// Length of a long member record (split 64-bit offset).
pub const LMEMBER_LEN: u64 = 16;

/// Length of an enumerator record.
pub const ENUM_ENT_LEN: u64 = 8;

/// Length of a variable-section entry.
pub const VARENT_LEN: u64 = 8;

/// Length of an array payload.
pub const ARRAY_LEN: u64 = 12;

/// Integer format flag: signed.
pub const INT_SIGNED: u32 = 0x01;
/// Integer format flag: char.
pub const INT_CHAR: u32 = 0x02;
/// Integer format flag: boolean.
pub const INT_BOOL: u32 = 0x04;
/// Integer format flag: varargs marker.
pub const INT_VARARGS: u32 = 0x08;

/// Float format: single precision.
pub const FP_SINGLE: u32 = 1;
/// Float format: double precision.
pub const FP_DOUBLE: u32 = 2;
/// Float format: long double.
pub const FP_LDOUBLE: u32 = 6;

/// Discriminator of a type record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Kind {
    Unknown = 0,
    Integer = 1,
    Float = 2,
    Pointer = 3,
    Array = 4,
    Function = 5,
    Struct = 6,
    Union = 7,
    Enum = 8,
    Forward = 9,
    Typedef = 10,
    Volatile = 11,
    Const = 12,
    Restrict = 13,
}

impl Kind {
    /// Converts a raw kind value back to a [`Kind`].
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Unknown),
            1 => Some(Self::Integer),
            2 => Some(Self::Float),
            3 => Some(Self::Pointer),
            4 => Some(Self::Array),
            5 => Some(Self::Function),
            6 => Some(Self::Struct),
            7 => Some(Self::Union),
            8 => Some(Self::Enum),
            9 => Some(Self::Forward),
            10 => Some(Self::Typedef),
            11 => Some(Self::Volatile),
            12 => Some(Self::Const),
            13 => Some(Self::Restrict),
            _ => None,
        }
    }

    /// True for the type qualifiers and typedef, which resolve to an
    /// underlying type.
    pub fn is_reference(self) -> bool {
        matches!(
            self,
            Self::Typedef | Self::Volatile | Self::Const | Self::Restrict
        )
    }
}

/// Packs kind, root-visibility, and vlen into an info word.
pub fn type_info(kind: Kind, root: bool, vlen: u32) -> u32 {
    ((kind as u32) << K_SHIFT) | if root { ROOT_BIT } else { 0 } | (vlen & VLEN_MASK)
}

/// Extracts the kind from an info word.
pub fn info_kind(info: u32) -> Option<Kind> {
    Kind::from_u32(info >> K_SHIFT)
}

/// Extracts the vlen from an info word.
pub fn info_vlen(info: u32) -> u32 {
    info & VLEN_MASK
}

/// Extracts the root-visibility flag from an info word.
pub fn info_is_root(info: u32) -> bool {
    info & ROOT_BIT != 0
}

/// Integer or float encoding: `(format:8, offset:8, bits:16)` packed into a
/// single payload word. The packing is identical for both kinds; only the
/// format domain differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Encoding {
    pub format: u32,
    pub offset: u32,
    pub bits: u32,
}

impl Encoding {
    pub fn new(format: u32, offset: u32, bits: u32) -> Self {
        Self {
            format,
            offset,
            bits,
        }
    }

    /// Packs the encoding into its payload word.
    pub fn to_word(self) -> u32 {
        ((self.format & 0xff) << 24) | ((self.offset & 0xff) << 16) | (self.bits & 0xffff)
    }

    /// Unpacks an encoding payload word.
    pub fn from_word(word: u32) -> Self {
        Self {
            format: word >> 24,
            offset: (word >> 16) & 0xff,
            bits: word & 0xffff,
        }
    }

    /// The byte size of a type with this encoding: the smallest power of two
    /// that holds `ceil(bits / 8)` bytes (1–8 map to 1, 2, 4, 4, 8, 8, 8, 8).
    pub fn byte_size(self) -> u64 {
        u64::from(self.bits).div_ceil(8).next_power_of_two()
    }
}

/// Array payload: element type, index type, element count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayInfo {
    pub contents: u32,
    pub index: u32,
    pub nelems: u32,
}

impl ArrayInfo {
    pub fn write_to<W: Write>(&self, w: &mut W) -> IoResult<()> {
        w.write_u32::<LittleEndian>(self.contents)?;
        w.write_u32::<LittleEndian>(self.index)?;
        w.write_u32::<LittleEndian>(self.nelems)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> IoResult<Self> {
        Ok(Self {
            contents: r.read_u32::<LittleEndian>()?,
            index: r.read_u32::<LittleEndian>()?,
            nelems: r.read_u32::<LittleEndian>()?,
        })
    }
}

/// Rounds `x` up to the next multiple of `align` (`align` must be nonzero).
pub fn roundup(x: u64, align: u64) -> u64 {
    x.div_ceil(align) * align
}

/// High half of a split 64-bit size.
pub fn lsize_hi(size: u64) -> u32 {
    (size >> 32) as u32
}

/// Low half of a split 64-bit size.
pub fn lsize_lo(size: u64) -> u32 {
    size as u32
}

/// Joins a split 64-bit size.
pub fn lsize(hi: u32, lo: u32) -> u64 {
    (u64::from(hi) << 32) | u64::from(lo)
}

/// The 40-byte container header. The label, object, and function sections
/// are carried for format compatibility but never populated by the
/// serializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub magic: u16,
    pub version: u8,
    pub flags: u8,
    pub parlabel: u32,
    pub parname: u32,
    pub lbloff: u32,
    pub objtoff: u32,
    pub funcoff: u32,
    pub varoff: u32,
    pub typeoff: u32,
    pub stroff: u32,
    pub strlen: u32,
}

impl Header {
    /// A header with the magic and version filled in and every section
    /// empty.
    pub fn new() -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            ..Self::default()
        }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> IoResult<()> {
        w.write_u16::<LittleEndian>(self.magic)?;
        w.write_u8(self.version)?;
        w.write_u8(self.flags)?;
        w.write_u32::<LittleEndian>(self.parlabel)?;
        w.write_u32::<LittleEndian>(self.parname)?;
        w.write_u32::<LittleEndian>(self.lbloff)?;
        w.write_u32::<LittleEndian>(self.objtoff)?;
        w.write_u32::<LittleEndian>(self.funcoff)?;
        w.write_u32::<LittleEndian>(self.varoff)?;
        w.write_u32::<LittleEndian>(self.typeoff)?;
        w.write_u32::<LittleEndian>(self.stroff)?;
        w.write_u32::<LittleEndian>(self.strlen)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> IoResult<Self> {
        Ok(Self {
            magic: r.read_u16::<LittleEndian>()?,
            version: r.read_u8()?,
            flags: r.read_u8()?,
            parlabel: r.read_u32::<LittleEndian>()?,
            parname: r.read_u32::<LittleEndian>()?,
            lbloff: r.read_u32::<LittleEndian>()?,
            objtoff: r.read_u32::<LittleEndian>()?,
            funcoff: r.read_u32::<LittleEndian>()?,
            varoff: r.read_u32::<LittleEndian>()?,
            typeoff: r.read_u32::<LittleEndian>()?,
            stroff: r.read_u32::<LittleEndian>()?,
            strlen: r.read_u32::<LittleEndian>()?,
        })
    }
}

/// A type record header in its in-memory form: short while `size_or_type`
/// is below [`LSIZE_SENT`], long otherwise.
///
/// The `size_or_type` field is a byte size for sized kinds (integer, float,
/// struct, union, enum), a referenced type id for pointer, function,
/// typedef, and the qualifiers, and a referenced [`Kind`] for forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TypeRec {
    pub name: u32,
    pub info: u32,
    pub size_or_type: u32,
    pub lsizehi: u32,
    pub lsizelo: u32,
}

impl TypeRec {
    /// True when this record uses the 20-byte long encoding.
    pub fn is_long(&self) -> bool {
        self.size_or_type == LSIZE_SENT
    }

    /// The encoded length of this record header in bytes.
    pub fn encoded_len(&self) -> u64 {
        if self.is_long() {
            LONG_TYPE_LEN
        } else {
            SHORT_TYPE_LEN
        }
    }

    /// The size carried by this record, joining the split halves of a long
    /// record.
    pub fn size(&self) -> u64 {
        if self.is_long() {
            lsize(self.lsizehi, self.lsizelo)
        } else {
            u64::from(self.size_or_type)
        }
    }

    /// Stores `size`, switching to the long encoding when it exceeds
    /// [`MAX_SIZE`].
    pub fn set_size(&mut self, size: u64) {
        if size > u64::from(MAX_SIZE) {
            self.size_or_type = LSIZE_SENT;
            self.lsizehi = lsize_hi(size);
            self.lsizelo = lsize_lo(size);
        } else {
            self.size_or_type = size as u32;
            self.lsizehi = 0;
            self.lsizelo = 0;
        }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> IoResult<()> {
        w.write_u32::<LittleEndian>(self.name)?;
        w.write_u32::<LittleEndian>(self.info)?;
        w.write_u32::<LittleEndian>(self.size_or_type)?;
        if self.is_long() {
            w.write_u32::<LittleEndian>(self.lsizehi)?;
            w.write_u32::<LittleEndian>(self.lsizelo)?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> IoResult<Self> {
        let mut rec = Self {
            name: r.read_u32::<LittleEndian>()?,
            info: r.read_u32::<LittleEndian>()?,
            size_or_type: r.read_u32::<LittleEndian>()?,
            lsizehi: 0,
            lsizelo: 0,
        };
        if rec.is_long() {
            rec.lsizehi = r.read_u32::<LittleEndian>()?;
            rec.lsizelo = r.read_u32::<LittleEndian>()?;
        }
        Ok(rec)
    }
}

/// High half of a split member bit-offset, used by long member records.
pub fn lmember_hi(offset: u64) -> u32 {
    (offset >> 32) as u32
}

/// Low half of a split member bit-offset.
pub fn lmember_lo(offset: u64) -> u32 {
    offset as u32
}

/// Joins a split member bit-offset.
pub fn lmember_offset(hi: u32, lo: u32) -> u64 {
    (u64::from(hi) << 32) | u64::from(lo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn info_word_fields() {
        let info = type_info(Kind::Struct, true, 7);
        assert_eq!(info_kind(info), Some(Kind::Struct));
        assert!(info_is_root(info));
        assert_eq!(info_vlen(info), 7);

        let info = type_info(Kind::Integer, false, 0);
        assert!(!info_is_root(info));
        assert_eq!(info_vlen(info), 0);
    }

    #[test]
    fn encoding_word_fields() {
        let enc = Encoding::new(INT_SIGNED, 0, 32);
        let word = enc.to_word();
        assert_eq!(word, 0x0100_0020);
        assert_eq!(Encoding::from_word(word), enc);
    }

    #[test]
    fn encoding_byte_sizes() {
        // bits -> clp2(ceil(bits / 8))
        let table = [(1, 1), (8, 1), (9, 2), (16, 2), (33, 8), (64, 8)];
        for (bits, size) in table {
            assert_eq!(Encoding::new(0, 0, bits).byte_size(), size, "bits={bits}");
        }
    }

    #[test]
    fn header_roundtrip() {
        let mut hdr = Header::new();
        hdr.parname = 1;
        hdr.typeoff = 16;
        hdr.stroff = 64;
        hdr.strlen = 9;

        let mut buf = Vec::new();
        hdr.write_to(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, HEADER_LEN);

        let back = Header::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(back, hdr);
    }

    #[test]
    fn short_type_rec_roundtrip() {
        let mut rec = TypeRec {
            info: type_info(Kind::Integer, true, 0),
            ..TypeRec::default()
        };
        rec.set_size(4);
        assert!(!rec.is_long());
        assert_eq!(rec.encoded_len(), SHORT_TYPE_LEN);

        let mut buf = Vec::new();
        rec.write_to(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, SHORT_TYPE_LEN);
        assert_eq!(TypeRec::read_from(&mut buf.as_slice()).unwrap(), rec);
    }

    #[test]
    fn long_type_rec_roundtrip() {
        let mut rec = TypeRec {
            info: type_info(Kind::Struct, true, 2),
            ..TypeRec::default()
        };
        rec.set_size(u64::from(MAX_SIZE) + 10);
        assert!(rec.is_long());
        assert_eq!(rec.size(), u64::from(MAX_SIZE) + 10);

        let mut buf = Vec::new();
        rec.write_to(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, LONG_TYPE_LEN);
        assert_eq!(TypeRec::read_from(&mut buf.as_slice()).unwrap(), rec);
    }

    #[test]
    fn size_at_boundary_stays_short() {
        let mut rec = TypeRec::default();
        rec.set_size(u64::from(MAX_SIZE));
        assert!(!rec.is_long());
        assert_eq!(rec.size(), u64::from(MAX_SIZE));
    }

    #[test]
    fn roundup_basics() {
        assert_eq!(roundup(0, 8), 0);
        assert_eq!(roundup(1, 8), 8);
        assert_eq!(roundup(8, 8), 8);
        assert_eq!(roundup(33, 4), 36);
    }

    proptest! {
        #[test]
        fn info_word_roundtrips(kind in 0u32..=13, root: bool, vlen in 0u32..=MAX_VLEN) {
            let kind = Kind::from_u32(kind).unwrap();
            let info = type_info(kind, root, vlen);
            prop_assert_eq!(info_kind(info), Some(kind));
            prop_assert_eq!(info_is_root(info), root);
            prop_assert_eq!(info_vlen(info), vlen);
        }

        #[test]
        fn encoding_word_roundtrips(format in 0u32..=0xff, offset in 0u32..=0xff, bits in 0u32..=0xffff) {
            let enc = Encoding::new(format, offset, bits);
            prop_assert_eq!(Encoding::from_word(enc.to_word()), enc);
        }

        #[test]
        fn split_offsets_roundtrip(offset: u64) {
            prop_assert_eq!(lmember_offset(lmember_hi(offset), lmember_lo(offset)), offset);
            prop_assert_eq!(lsize(lsize_hi(offset), lsize_lo(offset)), offset);
        }
    }
}

//! The serializer: freezes the dynamic state into a self-contained buffer
//! and swaps in a view parsed from it.
//!
//! Serialization is two passes over the type store in insertion order.
//! Pass 1 computes the byte size of the type section from each record's
//! header length and kind payload; pass 2 emits the variable, type, and
//! string segments, appending each name to the string table at the exact
//! moment its offset is recorded. The dictionary is optimized heavily for
//! lookup over update: after the swap, every read goes through the freshly
//! parsed view, so the rest of the library never needs separate lookup
//! paths for committed and pending types.

use byteorder::{LittleEndian, WriteBytesExt};
use std::fs::{rename, OpenOptions};
use std::io::Write;
use std::path::Path;

use ctf_buf::View;
use ctf_format::{
    lmember_hi, lmember_lo, Header, Kind, ARRAY_LEN, ENUM_ENT_LEN, LMEMBER_LEN, LSTRUCT_THRESH,
    MEMBER_LEN, VARENT_LEN,
};

use crate::dict::Dict;
use crate::error::{CtfError, Result};
use crate::store::Payload;
use crate::strtab::StrTab;

impl Dict {
    /// Serializes the dynamic state and replaces the read-only view with
    /// one parsed from the new buffer. A no-op on a clean container; on
    /// failure the dirty flag stays set.
    pub fn update(&mut self) -> Result<()> {
        if !self.writable {
            return Err(CtfError::ReadOnly);
        }
        if !self.dirty {
            return Ok(());
        }

        // Pass 1: size of the type section.
        let mut type_size: u64 = 0;
        for dtd in self.types.values() {
            let kind = dtd.kind().ok_or(CtfError::Corrupt("unknown type kind"))?;
            let vlen = u64::from(dtd.vlen());
            type_size += dtd.rec.encoded_len();
            type_size += match kind {
                Kind::Integer | Kind::Float => 4,
                Kind::Array => ARRAY_LEN,
                Kind::Function => 4 * (vlen + (vlen & 1)),
                Kind::Struct | Kind::Union => {
                    if dtd.rec.size() < LSTRUCT_THRESH {
                        vlen * MEMBER_LEN
                    } else {
                        vlen * LMEMBER_LEN
                    }
                }
                Kind::Enum => vlen * ENUM_ENT_LEN,
                _ => 0,
            };
        }
        let nvars = self.vars.len() as u64;

        let mut strlen = self.str_growth;
        if let Some(parent) = &self.parent_name {
            strlen += parent.len() as u64 + 1;
        }

        let mut hdr = Header::new();
        hdr.varoff = 0;
        hdr.typeoff = u32::try_from(nvars * VARENT_LEN).map_err(|_| CtfError::Full)?;
        hdr.stroff = u32::try_from(u64::from(hdr.typeoff) + type_size).map_err(|_| CtfError::Full)?;
        hdr.strlen = u32::try_from(strlen).map_err(|_| CtfError::Full)?;

        let mut strtab = StrTab::new();
        if let Some(parent) = &self.parent_name {
            let off = strtab.insert(parent);
            if self.child {
                hdr.parname = off;
            }
        }

        // Variable entries. The store iterates in name order, which is the
        // order the sorted section requires.
        let mut varbuf = Vec::with_capacity((nvars * VARENT_LEN) as usize);
        for (name, var) in &self.vars {
            varbuf.write_u32::<LittleEndian>(strtab.insert(name))?;
            varbuf.write_u32::<LittleEndian>(var.ty)?;
        }
        debug_assert_eq!(varbuf.len() as u64, nvars * VARENT_LEN);

        // Type records, in insertion (= id) order. Name offsets go into a
        // local copy of each header; the stored records stay untouched.
        let mut typebuf = Vec::with_capacity(type_size as usize);
        for dtd in self.types.values() {
            let mut rec = dtd.rec;
            rec.name = match &dtd.name {
                Some(name) => strtab.insert(name),
                None => 0,
            };
            rec.write_to(&mut typebuf)?;

            match &dtd.payload {
                Payload::Encoding(enc) => {
                    typebuf.write_u32::<LittleEndian>(enc.to_word())?;
                }
                Payload::Array(ar) => {
                    ar.write_to(&mut typebuf)?;
                }
                Payload::Args(argv) => {
                    for &arg in argv {
                        typebuf.write_u32::<LittleEndian>(arg)?;
                    }
                    if argv.len() % 2 == 1 {
                        typebuf.write_u32::<LittleEndian>(0)?; // realign to 4 bytes
                    }
                }
                Payload::Members(members) => {
                    let long = rec.size() >= LSTRUCT_THRESH;
                    for m in members {
                        let name_off = match &m.name {
                            Some(name) => strtab.insert(name),
                            None => 0,
                        };
                        typebuf.write_u32::<LittleEndian>(name_off)?;
                        typebuf.write_u32::<LittleEndian>(m.ty)?;
                        if long {
                            typebuf.write_u32::<LittleEndian>(lmember_hi(m.offset))?;
                            typebuf.write_u32::<LittleEndian>(lmember_lo(m.offset))?;
                        } else {
                            typebuf.write_u32::<LittleEndian>(m.offset as u32)?;
                        }
                    }
                }
                Payload::Enums(ents) => {
                    for e in ents {
                        typebuf.write_u32::<LittleEndian>(strtab.insert(&e.name))?;
                        typebuf.write_i32::<LittleEndian>(e.value)?;
                    }
                }
                Payload::None => {}
            }
        }
        debug_assert_eq!(typebuf.len() as u64, type_size);
        debug_assert_eq!(strtab.len(), strlen);

        let mut buf =
            Vec::with_capacity((u64::from(hdr.stroff) + strlen + ctf_format::HEADER_LEN) as usize);
        hdr.write_to(&mut buf)?;
        buf.extend_from_slice(&varbuf);
        buf.extend_from_slice(&typebuf);
        buf.extend_from_slice(&strtab.into_bytes());

        // Reparse and swap. An opener failure leaves the container dirty.
        self.view = View::open(buf)?;
        self.old_id = self.next_id - 1;
        self.last_committed = self.snapshot_count;
        self.snapshot_count += 1;
        self.dirty = false;
        Ok(())
    }

    /// Writes the committed buffer to `path`, going through a temporary
    /// file and an atomic rename. Call [`update`](Dict::update) first to
    /// commit pending additions.
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tmp = path.with_extension("ctf.tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(self.view.bytes())?;
        file.flush()?;
        file.sync_all()?;
        rename(tmp, path)?;
        Ok(())
    }
}

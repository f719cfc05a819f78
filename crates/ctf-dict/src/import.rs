//! Cross-container type import: copies a type and its transitive referents
//! from a source container, deduplicating against both the committed name
//! indexes and the pending definitions of the destination.

use tracing::debug;

use ctf_format::{Encoding, Kind};

use crate::build::Visibility;
use crate::dict::Dict;
use crate::error::{CtfError, Result};
use crate::store::Payload;

impl Dict {
    /// Imports `src_id` from `src`, returning the equivalent destination
    /// id. If an identically named root-visible type already exists with
    /// the same attributes, that id is returned and nothing changes; a
    /// same-named type with incompatible attributes is a conflict. The only
    /// kind mismatch tolerated is a forward being satisfied by a struct,
    /// union, or enum definition.
    pub fn add_type(&mut self, src: &Dict, src_id: u32) -> Result<u32> {
        if !self.writable {
            return Err(CtfError::ReadOnly);
        }

        let kind = src.type_kind(src_id)?;
        let name = src.type_name(src_id)?;
        let root = src.type_is_root(src_id)?;
        let vlen = src.type_vlen(src_id)?;
        let vis = if root {
            Visibility::Root
        } else {
            Visibility::NonRoot
        };

        // A root-visible named source type is matched against the
        // destination's committed name index for its kind.
        let mut dst_id = None;
        let mut dst_kind = None;
        if root {
            if let Some(n) = &name {
                if let Some(cand) = self.view.lookup_root(kind, n) {
                    dst_id = Some(cand);
                    dst_kind = Some(self.type_kind(cand)?);
                }
            }
        }

        if let (Some(_), Some(dk)) = (dst_id, dst_kind) {
            let forward_resolution = dk == Kind::Forward
                && matches!(kind, Kind::Struct | Kind::Union | Kind::Enum);
            if dk != kind && !forward_resolution {
                debug!(
                    name = name.as_deref().unwrap_or(""),
                    ?kind,
                    existing = ?dk,
                    "type conflict: kinds differ"
                );
                return Err(CtfError::Conflict(name.unwrap_or_default()));
            }
        }

        // Integers and floats are described by their encoding as well as
        // their name; bit-fields rely on several same-named encodings
        // coexisting.
        let src_enc = match kind {
            Kind::Integer | Kind::Float => Some(src.type_encoding(src_id)?),
            _ => None,
        };
        if let (Some(enc), Some(cand)) = (src_enc, dst_id) {
            if self.type_is_root(cand)? {
                if self.type_encoding(cand)? == enc {
                    return Ok(cand);
                }
                debug!(
                    name = name.as_deref().unwrap_or(""),
                    "type conflict: encodings differ"
                );
                return Err(CtfError::Conflict(name.unwrap_or_default()));
            }
            // A non-root hit is no evidence either way; fall through to the
            // pending list.
            dst_id = None;
            dst_kind = None;
        }

        // Search the uncommitted definitions, newest first. Matching a
        // pending record by name and kind is what lets a recursive import
        // terminate on cyclic types.
        if dst_id.is_none() {
            if let Some(n) = &name {
                if let Some(found) = self.pending_match(kind, n, root, src_enc)? {
                    return Ok(found);
                }
            }
        }

        match kind {
            Kind::Integer | Kind::Float => {
                let enc = src_enc.ok_or(CtfError::NotIntFp(src_id))?;
                let name = name.as_deref().unwrap_or("");
                if kind == Kind::Integer {
                    self.add_integer(vis, name, enc)
                } else {
                    self.add_float(vis, name, enc)
                }
            }

            Kind::Pointer | Kind::Volatile | Kind::Const | Kind::Restrict => {
                let referent = self.add_type(src, src.type_reference(src_id)?)?;
                self.add_reftype(vis, referent, kind)
            }

            Kind::Array => {
                let mut info = src.array_info(src_id)?;
                info.contents = self.add_type(src, info.contents)?;
                info.index = self.add_type(src, info.index)?;
                match dst_id {
                    Some(cand) => {
                        if self.array_info(cand)? != info {
                            debug!(
                                name = name.as_deref().unwrap_or(""),
                                "type conflict: array info differs"
                            );
                            return Err(CtfError::Conflict(name.unwrap_or_default()));
                        }
                        Ok(cand)
                    }
                    None => self.add_array(vis, info),
                }
            }

            Kind::Function => {
                let desc = src.func_info(src_id)?;
                let ret = self.add_type(src, desc.ret)?;
                let mut args = Vec::with_capacity(desc.args.len());
                for arg in desc.args {
                    args.push(self.add_type(src, arg)?);
                }
                self.add_function(vis, ret, &args, desc.variadic)
            }

            Kind::Struct | Kind::Union => {
                self.import_sou(src, src_id, dst_id, dst_kind, kind, name, vis, vlen)
            }

            Kind::Enum => match dst_id {
                Some(cand) if dst_kind != Some(Kind::Forward) => {
                    // Enumerators must agree in both directions.
                    for e in src.enumerators(src_id)? {
                        if self.enum_value(cand, &e.name)? != Some(e.value) {
                            debug!(name = %e.name, "enum conflict: enumerator differs");
                            return Err(CtfError::Conflict(name.unwrap_or_default()));
                        }
                    }
                    for e in self.enumerators(cand)? {
                        if src.enum_value(src_id, &e.name)? != Some(e.value) {
                            debug!(name = %e.name, "enum conflict: enumerator differs");
                            return Err(CtfError::Conflict(name.unwrap_or_default()));
                        }
                    }
                    Ok(cand)
                }
                _ => {
                    let id = self.add_enum(vis, name.as_deref().unwrap_or(""))?;
                    for e in src.enumerators(src_id)? {
                        self.add_enumerator(id, &e.name, e.value)?;
                    }
                    Ok(id)
                }
            },

            Kind::Forward => match dst_id {
                Some(cand) => Ok(cand),
                None => self.add_forward(vis, name.as_deref().unwrap_or(""), Kind::Struct),
            },

            Kind::Typedef => {
                let referent = self.add_type(src, src.type_reference(src_id)?)?;
                // An existing same-named typedef is trusted rather than
                // compared: its referent legitimately differs across data
                // models.
                match dst_id {
                    Some(cand) => Ok(cand),
                    None => self.add_typedef(vis, name.as_deref().unwrap_or(""), referent),
                }
            }

            Kind::Unknown => Err(CtfError::Corrupt("cannot import an unknown kind")),
        }
    }

    /// Scans pending definitions (newest first) for a same-named type of
    /// the same kind. Integers and floats additionally compare encodings
    /// and root visibility; an encoding mismatch between two root-visible
    /// entries is a conflict, anything else keeps scanning.
    fn pending_match(
        &self,
        kind: Kind,
        name: &str,
        src_root: bool,
        src_enc: Option<Encoding>,
    ) -> Result<Option<u32>> {
        for (&index, dtd) in self.types.range(self.old_id + 1..).rev() {
            if dtd.kind() != Some(kind) || dtd.name.as_deref() != Some(name) {
                continue;
            }
            let id = index | self.child_bit();
            let Some(enc) = src_enc else {
                return Ok(Some(id));
            };
            let Payload::Encoding(pending_enc) = &dtd.payload else {
                continue;
            };
            let dst_root = dtd.is_root();
            if *pending_enc == enc && src_root == dst_root {
                return Ok(Some(id));
            }
            if *pending_enc != enc && src_root && dst_root {
                debug!(name, "type conflict: pending encoding differs");
                return Err(CtfError::Conflict(name.to_owned()));
            }
        }
        Ok(None)
    }

    /// Struct/union import. A fresh aggregate is installed with its source
    /// member offsets *before* the member types are translated, so a member
    /// that refers back to the aggregate resolves against the pending
    /// record instead of recursing forever. Translation failures are
    /// collected rather than aborting, leaving a partially translated
    /// record for the caller to roll back.
    #[allow(clippy::too_many_arguments)]
    fn import_sou(
        &mut self,
        src: &Dict,
        src_id: u32,
        dst_id: Option<u32>,
        dst_kind: Option<Kind>,
        kind: Kind,
        name: Option<String>,
        vis: Visibility,
        vlen: u32,
    ) -> Result<u32> {
        if let Some(cand) = dst_id {
            if dst_kind != Some(Kind::Forward) {
                // Comparing src members against dst plus the total size
                // covers dst members missing from src.
                if src.type_size(src_id)? != self.type_size(cand)? {
                    debug!(
                        name = name.as_deref().unwrap_or(""),
                        "type conflict: sizes differ"
                    );
                    return Err(CtfError::Conflict(name.unwrap_or_default()));
                }
                for m in src.members(src_id)? {
                    let member_name = m.name.as_deref().unwrap_or("");
                    match self.member_info(cand, member_name)? {
                        Some((_, offset)) if offset == m.offset => {}
                        _ => {
                            debug!(
                                name = name.as_deref().unwrap_or(""),
                                member = member_name,
                                "type conflict: members differ"
                            );
                            return Err(CtfError::Conflict(name.unwrap_or_default()));
                        }
                    }
                }
                return Ok(cand);
            }
        }

        let size = src.type_size(src_id)?;
        let members = src.members(src_id)?;

        let id = self.add_generic(name.as_deref().unwrap_or(""))?;
        for m in &members {
            if let Some(member_name) = &m.name {
                self.str_growth += member_name.len() as u64 + 1;
            }
        }
        let root = matches!(vis, Visibility::Root);
        let dtd = self.fresh(id);
        dtd.rec.info = ctf_format::type_info(kind, root, vlen);
        dtd.rec.set_size(size);
        dtd.payload = Payload::Members(members.clone());

        // Final pass: translate each member's type from source ids to
        // destination ids. The aggregate itself is already findable, which
        // is what terminates cycles.
        let mut first_err = None;
        for (i, m) in members.iter().enumerate() {
            match self.add_type(src, m.ty) {
                Ok(translated) => {
                    if let Some(dtd) = self.dtd_mut(id) {
                        if let Payload::Members(ms) = &mut dtd.payload {
                            ms[i].ty = translated;
                        }
                    }
                }
                Err(err) => {
                    debug!(
                        member = m.name.as_deref().unwrap_or(""),
                        %err,
                        "member translation failed"
                    );
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DataModel;
    use ctf_format::{ArrayInfo, INT_SIGNED};

    fn dict() -> Dict {
        Dict::new(DataModel::LP64)
    }

    fn int32(d: &mut Dict) -> u32 {
        d.add_integer(Visibility::Root, "int", Encoding::new(INT_SIGNED, 0, 32))
            .unwrap()
    }

    #[test]
    fn import_integer_is_idempotent() {
        let mut src = dict();
        let sid = int32(&mut src);

        let mut dst = dict();
        let first = dst.add_type(&src, sid).unwrap();
        let second = dst.add_type(&src, sid).unwrap();
        assert_eq!(first, second);
        assert_eq!(dst.next_type_id(), first + 1);
        assert_eq!(dst.type_encoding(first).unwrap().bits, 32);
    }

    #[test]
    fn import_integer_conflicts_on_encoding() {
        let mut src = dict();
        let sid = src
            .add_integer(Visibility::Root, "int", Encoding::new(INT_SIGNED, 0, 16))
            .unwrap();

        let mut dst = dict();
        int32(&mut dst);
        assert!(matches!(
            dst.add_type(&src, sid),
            Err(CtfError::Conflict(_))
        ));
    }

    #[test]
    fn import_nonroot_integer_coexists_with_root() {
        let mut src = dict();
        let sid = src
            .add_integer(Visibility::NonRoot, "int", Encoding::new(INT_SIGNED, 0, 16))
            .unwrap();

        let mut dst = dict();
        let existing = int32(&mut dst);
        let imported = dst.add_type(&src, sid).unwrap();
        assert_ne!(existing, imported);
        assert_eq!(dst.type_encoding(imported).unwrap().bits, 16);
    }

    #[test]
    fn import_pointer_chain_imports_referent_first() {
        let mut src = dict();
        let sid = int32(&mut src);
        let sptr = src.add_pointer(Visibility::NonRoot, sid).unwrap();

        let mut dst = dict();
        let dptr = dst.add_type(&src, sptr).unwrap();
        let referent = dst.type_reference(dptr).unwrap();
        assert_eq!(dst.type_kind(dptr).unwrap(), Kind::Pointer);
        assert_eq!(dst.type_name(referent).unwrap().as_deref(), Some("int"));
    }

    #[test]
    fn import_array_translates_both_types() {
        let mut src = dict();
        let sid = int32(&mut src);
        let arr = src
            .add_array(
                Visibility::NonRoot,
                ArrayInfo {
                    contents: sid,
                    index: sid,
                    nelems: 16,
                },
            )
            .unwrap();

        let mut dst = dict();
        let darr = dst.add_type(&src, arr).unwrap();
        let info = dst.array_info(darr).unwrap();
        assert_eq!(info.nelems, 16);
        assert_eq!(dst.type_kind(info.contents).unwrap(), Kind::Integer);
        assert_eq!(dst.type_size(darr).unwrap(), 64);
    }

    #[test]
    fn import_function_rebuilds_argument_vector() {
        let mut src = dict();
        let sid = int32(&mut src);
        let sfn = src
            .add_function(Visibility::NonRoot, sid, &[sid, sid], true)
            .unwrap();

        let mut dst = dict();
        let dfn = dst.add_type(&src, sfn).unwrap();
        let desc = dst.func_info(dfn).unwrap();
        assert_eq!(desc.args.len(), 2);
        assert!(desc.variadic);
        assert_eq!(dst.type_kind(desc.ret).unwrap(), Kind::Integer);
        assert_eq!(dst.type_kind(desc.args[0]).unwrap(), Kind::Integer);
    }

    #[test]
    fn import_struct_with_members() {
        let mut src = dict();
        let sid = int32(&mut src);
        let s = src.add_struct(Visibility::Root, "pair").unwrap();
        src.add_member(s, "a", sid).unwrap();
        src.add_member(s, "b", sid).unwrap();

        let mut dst = dict();
        let d = dst.add_type(&src, s).unwrap();
        assert_eq!(dst.type_kind(d).unwrap(), Kind::Struct);
        assert_eq!(dst.type_size(d).unwrap(), 8);
        let members = dst.members(d).unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[1].offset, 32);
        assert_eq!(dst.type_kind(members[1].ty).unwrap(), Kind::Integer);
    }

    #[test]
    fn import_self_referential_struct_terminates() {
        let mut src = dict();
        let sid = int32(&mut src);
        let node = src.add_struct(Visibility::Root, "node").unwrap();
        let pnode = src.add_pointer(Visibility::NonRoot, node).unwrap();
        src.add_member(node, "next", pnode).unwrap();
        src.add_member_at(node, "v", sid, 64).unwrap();

        let mut dst = dict();
        let dnode = dst.add_type(&src, node).unwrap();
        let members = dst.members(dnode).unwrap();
        // The imported `next` member points back at the imported struct.
        assert_eq!(dst.type_reference(members[0].ty).unwrap(), dnode);
    }

    #[test]
    fn import_struct_twice_does_not_grow() {
        let mut src = dict();
        let sid = int32(&mut src);
        let s = src.add_struct(Visibility::Root, "pair").unwrap();
        src.add_member(s, "a", sid).unwrap();

        let mut dst = dict();
        let first = dst.add_type(&src, s).unwrap();
        let next = dst.next_type_id();
        let second = dst.add_type(&src, s).unwrap();
        assert_eq!(first, second);
        assert_eq!(dst.next_type_id(), next);
    }

    #[test]
    fn import_enum_copies_and_verifies_enumerators() {
        let mut src = dict();
        let e = src.add_enum(Visibility::Root, "color").unwrap();
        src.add_enumerator(e, "RED", 0).unwrap();
        src.add_enumerator(e, "BLUE", 1).unwrap();

        let mut dst = dict();
        let de = dst.add_type(&src, e).unwrap();
        assert_eq!(dst.enum_value(de, "BLUE").unwrap(), Some(1));
        assert_eq!(dst.add_type(&src, e).unwrap(), de);
    }

    #[test]
    fn import_enum_conflicts_on_changed_value() {
        let mut src = dict();
        let e = src.add_enum(Visibility::Root, "color").unwrap();
        src.add_enumerator(e, "RED", 5).unwrap();

        let mut dst = dict();
        let de = dst.add_enum(Visibility::Root, "color").unwrap();
        dst.add_enumerator(de, "RED", 0).unwrap();
        dst.update().unwrap();

        assert!(matches!(dst.add_type(&src, e), Err(CtfError::Conflict(_))));
    }

    #[test]
    fn import_conflicts_on_kind_mismatch() {
        // Integers and typedefs share the catch-all name index, so a
        // same-named pair of different kinds is a genuine clash.
        let mut src = dict();
        let sid = src
            .add_integer(Visibility::Root, "thing", Encoding::new(INT_SIGNED, 0, 32))
            .unwrap();
        src.update().unwrap();

        let mut dst = dict();
        let did = int32(&mut dst);
        dst.add_typedef(Visibility::Root, "thing", did).unwrap();
        dst.update().unwrap();

        assert!(matches!(dst.add_type(&src, sid), Err(CtfError::Conflict(_))));
    }

    #[test]
    fn same_tag_name_in_different_kind_indexes_coexists() {
        let mut src = dict();
        let s = src.add_struct(Visibility::Root, "thing").unwrap();
        src.update().unwrap();

        let mut dst = dict();
        let e = dst.add_enum(Visibility::Root, "thing").unwrap();
        dst.add_enumerator(e, "A", 0).unwrap();
        dst.update().unwrap();

        // Struct and enum tags live in separate namespaces.
        let imported = dst.add_type(&src, s).unwrap();
        assert_ne!(imported, e);
        assert_eq!(dst.type_kind(imported).unwrap(), Kind::Struct);
    }

    #[test]
    fn import_struct_resolving_committed_forward_gets_fresh_id() {
        let mut src = dict();
        let sid = int32(&mut src);
        let s = src.add_struct(Visibility::Root, "x").unwrap();
        src.add_member(s, "v", sid).unwrap();

        let mut dst = dict();
        let fwd = dst.add_forward(Visibility::Root, "x", Kind::Struct).unwrap();
        dst.update().unwrap();

        let imported = dst.add_type(&src, s).unwrap();
        assert_ne!(imported, fwd);
        assert_eq!(dst.type_kind(imported).unwrap(), Kind::Struct);
    }

    #[test]
    fn import_forward_defaults_to_struct() {
        let mut src = dict();
        let f = src.add_forward(Visibility::Root, "opaque", Kind::Union).unwrap();

        let mut dst = dict();
        let df = dst.add_type(&src, f).unwrap();
        assert_eq!(dst.type_kind(df).unwrap(), Kind::Forward);
    }

    #[test]
    fn import_typedef_chain() {
        let mut src = dict();
        let sid = int32(&mut src);
        let td = src.add_typedef(Visibility::Root, "myint", sid).unwrap();

        let mut dst = dict();
        let dtd = dst.add_type(&src, td).unwrap();
        assert_eq!(dst.type_kind(dtd).unwrap(), Kind::Typedef);
        assert_eq!(
            dst.type_name(dst.type_resolve(dtd).unwrap()).unwrap().as_deref(),
            Some("int")
        );
        // Idempotent once committed.
        dst.update().unwrap();
        assert_eq!(dst.add_type(&src, td).unwrap(), dtd);
    }

    #[test]
    fn import_from_read_only_source() {
        let mut src = dict();
        let sid = int32(&mut src);
        let s = src.add_struct(Visibility::Root, "pair").unwrap();
        src.add_member(s, "a", sid).unwrap();
        src.update().unwrap();
        let ro = Dict::open(src.bytes().to_vec()).unwrap();

        let mut dst = dict();
        let d = dst.add_type(&ro, s).unwrap();
        assert_eq!(dst.members(d).unwrap().len(), 1);
    }

    #[test]
    fn import_into_read_only_dict_fails() {
        let mut src = dict();
        let sid = int32(&mut src);
        src.update().unwrap();
        let mut ro = Dict::open(src.bytes().to_vec()).unwrap();
        assert!(matches!(
            ro.add_type(&src, sid),
            Err(CtfError::ReadOnly)
        ));
    }
}

//! Snapshots bound rollback: an opaque pair of the type-id high-water mark
//! and the snapshot counter at the time it was taken.

use crate::dict::Dict;
use crate::error::{CtfError, Result};

/// An opaque rollback target returned by [`Dict::snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotId {
    pub(crate) type_hwm: u32,
    pub(crate) snap: u64,
}

impl Dict {
    /// Records the current state as a rollback target and advances the
    /// snapshot counter.
    pub fn snapshot(&mut self) -> SnapshotId {
        let id = SnapshotId {
            type_hwm: self.next_id - 1,
            snap: self.snapshot_count,
        };
        self.snapshot_count += 1;
        id
    }

    /// Reverts the dynamic state to `id`: every type with a higher index
    /// and every variable born after the snapshot is deleted. Rolling back
    /// across a committed `update` is rejected.
    pub fn rollback(&mut self, id: SnapshotId) -> Result<()> {
        if !self.writable {
            return Err(CtfError::ReadOnly);
        }
        if self.old_id > id.type_hwm {
            return Err(CtfError::OverRollback);
        }
        if self.last_committed >= id.snap {
            return Err(CtfError::OverRollback);
        }

        let doomed_types: Vec<u32> = self
            .types
            .range(id.type_hwm + 1..)
            .map(|(&index, _)| index)
            .collect();
        for index in doomed_types {
            self.delete_type(index);
        }

        let doomed_vars: Vec<String> = self
            .vars
            .iter()
            .filter(|(_, var)| var.birth > id.snap)
            .map(|(name, _)| name.clone())
            .collect();
        for name in doomed_vars {
            self.delete_var(&name);
        }

        self.next_id = id.type_hwm + 1;
        self.snapshot_count = id.snap;
        if self.snapshot_count == self.last_committed {
            self.dirty = false;
        }
        Ok(())
    }

    /// Discards everything added since the last successful `update`.
    pub fn discard(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        self.rollback(SnapshotId {
            type_hwm: self.old_id,
            snap: self.last_committed + 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DataModel, Visibility};
    use ctf_format::{Encoding, INT_SIGNED};

    fn dict() -> Dict {
        Dict::new(DataModel::LP64)
    }

    #[test]
    fn rollback_removes_later_types_and_variables() {
        let mut d = dict();
        let id_int = d
            .add_integer(Visibility::Root, "int", Encoding::new(INT_SIGNED, 0, 32))
            .unwrap();
        d.add_variable("kept", id_int).unwrap();
        let before = d.str_growth();

        let snap = d.snapshot();
        d.add_struct(Visibility::Root, "A").unwrap();
        d.add_struct(Visibility::Root, "B").unwrap();
        d.add_variable("doomed", id_int).unwrap();

        d.rollback(snap).unwrap();
        assert_eq!(d.next_type_id(), id_int + 1);
        assert!(d.type_kind(id_int + 1).is_err());
        assert_eq!(d.str_growth(), before);
        assert_eq!(d.lookup_variable("kept"), Some(id_int));
        assert_eq!(d.lookup_variable("doomed"), None);
    }

    #[test]
    fn rollback_cannot_cross_committed_types() {
        let mut d = dict();
        let snap = d.snapshot();
        d.add_struct(Visibility::Root, "A").unwrap();
        d.update().unwrap();
        assert!(matches!(d.rollback(snap), Err(CtfError::OverRollback)));
    }

    #[test]
    fn rollback_cannot_cross_committed_snapshot_counter() {
        let mut d = dict();
        let snap = d.snapshot();
        // Dirty the container without allocating a type id, so only the
        // snapshot-counter guard can reject the rollback.
        d.add_variable("v", 0).unwrap();
        d.update().unwrap();
        assert!(matches!(d.rollback(snap), Err(CtfError::OverRollback)));
    }

    #[test]
    fn rollback_to_same_snapshot_twice_is_idempotent() {
        let mut d = dict();
        let snap = d.snapshot();
        d.add_struct(Visibility::Root, "A").unwrap();
        d.rollback(snap).unwrap();
        d.rollback(snap).unwrap();
        assert_eq!(d.next_type_id(), 1);
    }

    #[test]
    fn discard_reverts_to_last_commit() {
        let mut d = dict();
        d.add_struct(Visibility::Root, "A").unwrap();
        d.update().unwrap();
        let committed = d.bytes().to_vec();

        d.add_struct(Visibility::Root, "B").unwrap();
        d.add_struct(Visibility::Root, "C").unwrap();
        d.discard().unwrap();
        assert_eq!(d.next_type_id(), 2);

        d.update().unwrap();
        assert_eq!(d.bytes(), committed.as_slice());
    }

    #[test]
    fn discard_on_clean_container_is_a_no_op() {
        let mut d = dict();
        d.add_struct(Visibility::Root, "A").unwrap();
        d.update().unwrap();
        let next = d.next_type_id();
        d.discard().unwrap();
        assert_eq!(d.next_type_id(), next);
        assert!(!d.is_dirty());
    }
}

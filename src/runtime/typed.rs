use crate::lang::value::{Scalar, ScalarType, Value};
use crate::regalloc::RegisterId;

/// Which representation of a register is authoritative.
///
/// `Boxed` and `Clean` both mean the boxed value is current; `Clean` also
/// holds an identical unboxed copy. `Dirty` means only the shadow is current.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Residency {
    #[default]
    Boxed,
    Clean(Scalar),
    Dirty(Scalar),
}

/// Unboxed shadows for the bank registers (IDs below the spill threshold).
///
/// The type never touches the boxed storage itself. Transitions that require
/// a boxed write return the value to write; the register file applies it.
#[derive(Debug, Clone)]
pub struct TypedRegisters {
    slots: Vec<Residency>,
    /// Registers that may be dirty. May hold stale entries, never duplicates.
    dirty: Vec<RegisterId>,
    /// Per slot: already present in `dirty`.
    listed: Vec<bool>,
}

impl TypedRegisters {
    pub fn new(count: usize) -> Self {
        TypedRegisters {
            slots: vec![Residency::Boxed; count],
            dirty: Vec::new(),
            listed: vec![false; count],
        }
    }

    pub fn residency(&self, id: RegisterId) -> Residency {
        self.slots.get(id.index()).copied().unwrap_or_default()
    }

    pub fn is_dirty(&self, id: RegisterId) -> bool {
        matches!(self.residency(id), Residency::Dirty(_))
    }

    /// Length of the dirty list. Bounded by the number of slots.
    pub fn tracked_dirty(&self) -> usize {
        self.dirty.len()
    }

    pub fn has_dirty(&self) -> bool {
        self.dirty.iter().any(|id| self.is_dirty(*id))
    }

    /// Typed write. Returns the boxed value to write now, or `None` when the
    /// write was deferred.
    ///
    /// A first store, or one that changes the scalar type, writes through.
    /// Repeat stores of the same type only update the shadow. With
    /// `write_through` set (the register is captured by an open upvalue)
    /// every store writes through.
    pub fn store(&mut self, id: RegisterId, value: Scalar, write_through: bool) -> Option<Value> {
        let Some(slot) = self.slots.get_mut(id.index()) else {
            return Some(value.to_value());
        };
        let same_type = match *slot {
            Residency::Clean(old) | Residency::Dirty(old) => old.ty() == value.ty(),
            Residency::Boxed => false,
        };
        if same_type && !write_through {
            *slot = Residency::Dirty(value);
            if let Some(listed) = self.listed.get_mut(id.index()) {
                if !*listed {
                    *listed = true;
                    self.dirty.push(id);
                }
            }
            None
        } else {
            *slot = Residency::Clean(value);
            Some(value.to_value())
        }
    }

    /// Bring the boxed value up to date. Returns the value to write when the
    /// shadow was dirty; a no-op otherwise, so repeated calls are harmless.
    pub fn reconcile(&mut self, id: RegisterId) -> Option<Value> {
        let slot = self.slots.get_mut(id.index())?;
        match *slot {
            Residency::Dirty(s) => {
                *slot = Residency::Clean(s);
                Some(s.to_value())
            }
            _ => None,
        }
    }

    /// Reconcile every dirty shadow, returning the writes to apply.
    pub fn reconcile_all(&mut self) -> Vec<(RegisterId, Value)> {
        let pending = std::mem::take(&mut self.dirty);
        pending
            .into_iter()
            .filter_map(|id| {
                if let Some(listed) = self.listed.get_mut(id.index()) {
                    *listed = false;
                }
                self.reconcile(id).map(|v| (id, v))
            })
            .collect()
    }

    /// The boxed value was overwritten; drop the shadow. Must not be called
    /// on a dirty register that was not reconciled first.
    pub fn invalidate(&mut self, id: RegisterId) {
        if let Some(slot) = self.slots.get_mut(id.index()) {
            *slot = Residency::Boxed;
        }
    }

    /// Drop every shadow in `[start, end)`. Callers reconcile first.
    pub fn invalidate_range(&mut self, start: u16, end: u16) {
        let end = (end as usize).min(self.slots.len());
        for slot in &mut self.slots[(start as usize).min(end)..end] {
            *slot = Residency::Boxed;
        }
    }

    /// Shadow hit for a typed read.
    pub fn get(&self, id: RegisterId, ty: ScalarType) -> Option<Scalar> {
        match self.residency(id) {
            Residency::Clean(s) | Residency::Dirty(s) if s.ty() == ty => Some(s),
            _ => None,
        }
    }

    /// Remember a scalar just read from the boxed array.
    pub fn cache(&mut self, id: RegisterId, value: Scalar) {
        if let Some(slot) = self.slots.get_mut(id.index()) {
            if !matches!(slot, Residency::Dirty(_)) {
                *slot = Residency::Clean(value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const R: RegisterId = RegisterId(5);

    #[test]
    fn test_first_store_writes_through() {
        let mut t = TypedRegisters::new(256);
        assert_eq!(t.store(R, Scalar::I32(1), false), Some(Value::I32(1)));
        assert_eq!(t.residency(R), Residency::Clean(Scalar::I32(1)));
    }

    #[test]
    fn test_repeat_store_defers() {
        let mut t = TypedRegisters::new(256);
        t.store(R, Scalar::I32(1), false);
        assert_eq!(t.store(R, Scalar::I32(2), false), None);
        assert!(t.is_dirty(R));
        assert_eq!(t.get(R, ScalarType::I32), Some(Scalar::I32(2)));
    }

    #[test]
    fn test_type_change_writes_through_and_clears_dirty() {
        let mut t = TypedRegisters::new(256);
        t.store(R, Scalar::I32(1), false);
        t.store(R, Scalar::I32(2), false);
        assert_eq!(t.store(R, Scalar::F64(2.5), false), Some(Value::F64(2.5)));
        assert!(!t.is_dirty(R));
    }

    #[test]
    fn test_captured_register_stays_synchronous() {
        let mut t = TypedRegisters::new(256);
        t.store(R, Scalar::I32(1), true);
        assert_eq!(t.store(R, Scalar::I32(2), true), Some(Value::I32(2)));
        assert!(!t.is_dirty(R));
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let mut t = TypedRegisters::new(256);
        t.store(R, Scalar::I32(5), false);
        t.store(R, Scalar::I32(8), false);
        assert_eq!(t.reconcile(R), Some(Value::I32(8)));
        assert_eq!(t.reconcile(R), None);
        assert_eq!(t.residency(R), Residency::Clean(Scalar::I32(8)));
    }

    #[test]
    fn test_reconcile_all_flushes_every_dirty_register() {
        let mut t = TypedRegisters::new(256);
        for r in [1u16, 2, 3] {
            t.store(RegisterId(r), Scalar::I64(0), false);
            t.store(RegisterId(r), Scalar::I64(r as i64), false);
        }
        let mut writes = t.reconcile_all();
        writes.sort_by_key(|(id, _)| *id);
        assert_eq!(writes.len(), 3);
        assert_eq!(writes[2], (RegisterId(3), Value::I64(3)));
        assert!(!t.has_dirty());
        assert!(t.reconcile_all().is_empty());
    }

    #[test]
    fn test_dirty_tracking_stays_bounded() {
        let mut t = TypedRegisters::new(256);
        let r = RegisterId(70);
        for i in 0..100_000 {
            t.store(r, Scalar::I32(i), false);
        }
        assert_eq!(t.tracked_dirty(), 1);

        // reconciling one register leaves a stale entry; dirtying it again
        // must not add a second
        t.reconcile(r);
        t.store(r, Scalar::I32(1), false);
        assert_eq!(t.tracked_dirty(), 1);

        t.reconcile_all();
        assert_eq!(t.tracked_dirty(), 0);
        t.store(r, Scalar::I32(2), false);
        assert_eq!(t.tracked_dirty(), 1);
    }

    #[test]
    fn test_ids_outside_shadow_range_write_through() {
        let mut t = TypedRegisters::new(4);
        let far = RegisterId(300);
        assert_eq!(t.store(far, Scalar::I32(1), false), Some(Value::I32(1)));
        assert_eq!(t.store(far, Scalar::I32(2), false), Some(Value::I32(2)));
        assert_eq!(t.get(far, ScalarType::I32), None);
    }

    #[test]
    fn test_invalidate_range() {
        let mut t = TypedRegisters::new(256);
        t.store(RegisterId(70), Scalar::Bool(true), false);
        t.store(RegisterId(10), Scalar::Bool(true), false);
        t.invalidate_range(64, 192);
        assert_eq!(t.residency(RegisterId(70)), Residency::Boxed);
        assert_eq!(t.residency(RegisterId(10)), Residency::Clean(Scalar::Bool(true)));
    }

    proptest! {
        /// After any store sequence, reconciling once or twice leaves the same
        /// boxed value, and that value is the last stored scalar.
        #[test]
        fn reconcile_twice_equals_once(values in prop::collection::vec(any::<i32>(), 1..20)) {
            let mut t = TypedRegisters::new(8);
            let mut boxed = Value::Nil;
            for v in &values {
                if let Some(w) = t.store(R, Scalar::I32(*v), false) {
                    boxed = w;
                }
            }
            if let Some(w) = t.reconcile(R) {
                boxed = w;
            }
            let once = boxed.clone();
            if let Some(w) = t.reconcile(R) {
                boxed = w;
            }
            prop_assert_eq!(&boxed, &once);
            prop_assert_eq!(boxed, Value::I32(*values.last().unwrap()));
        }
    }
}

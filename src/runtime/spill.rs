use crate::lang::value::Value;
use crate::regalloc::RegisterId;
use std::collections::HashMap;

/// Overflow storage for register IDs above the bank ceiling.
pub trait SpillStore {
    /// Never-stored IDs read as `Nil`.
    fn load(&self, id: RegisterId) -> Value;
    fn store(&mut self, id: RegisterId, value: Value);
    /// Hand out the next unused ID, `None` once the ID space is exhausted.
    fn reserve(&mut self) -> Option<RegisterId>;
    fn remove(&mut self, id: RegisterId) -> Option<Value>;
    fn visit(&self, f: &mut dyn FnMut(RegisterId, &Value));
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Hash-map backed spill area. One per call frame.
#[derive(Debug, Clone, Default)]
pub struct SpillManager {
    entries: HashMap<u16, Value>,
    next_id: u32,
}

impl SpillManager {
    pub fn new(spill_start: u16) -> Self {
        SpillManager {
            entries: HashMap::new(),
            next_id: spill_start as u32,
        }
    }
}

impl SpillStore for SpillManager {
    fn load(&self, id: RegisterId) -> Value {
        self.entries.get(&id.0).cloned().unwrap_or_default()
    }

    fn store(&mut self, id: RegisterId, value: Value) {
        if id.0 as u32 >= self.next_id {
            self.next_id = id.0 as u32 + 1;
        }
        self.entries.insert(id.0, value);
    }

    fn reserve(&mut self) -> Option<RegisterId> {
        let id = u16::try_from(self.next_id).ok()?;
        self.next_id += 1;
        self.entries.insert(id, Value::Nil);
        Some(RegisterId(id))
    }

    fn remove(&mut self, id: RegisterId) -> Option<Value> {
        self.entries.remove(&id.0)
    }

    fn visit(&self, f: &mut dyn FnMut(RegisterId, &Value)) {
        for (id, value) in &self.entries {
            f(RegisterId(*id), value);
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_then_load() {
        let mut spill = SpillManager::new(256);
        spill.store(RegisterId(300), Value::I32(7));
        assert_eq!(spill.load(RegisterId(300)), Value::I32(7));
        assert_eq!(spill.load(RegisterId(301)), Value::Nil);
    }

    #[test]
    fn test_reserve_is_monotonic_past_stored_ids() {
        let mut spill = SpillManager::new(256);
        assert_eq!(spill.reserve(), Some(RegisterId(256)));
        spill.store(RegisterId(400), Value::Bool(true));
        assert_eq!(spill.reserve(), Some(RegisterId(401)));
    }

    #[test]
    fn test_reserve_exhaustion() {
        let mut spill = SpillManager::new(u16::MAX);
        assert_eq!(spill.reserve(), Some(RegisterId(u16::MAX)));
        assert_eq!(spill.reserve(), None);
    }

    #[test]
    fn test_remove_and_visit() {
        let mut spill = SpillManager::new(256);
        spill.store(RegisterId(256), Value::I32(1));
        spill.store(RegisterId(257), Value::I32(2));
        assert_eq!(spill.remove(RegisterId(256)), Some(Value::I32(1)));

        let mut seen = Vec::new();
        spill.visit(&mut |id, v| seen.push((id, v.clone())));
        assert_eq!(seen, vec![(RegisterId(257), Value::I32(2))]);
        assert_eq!(spill.len(), 1);
    }
}

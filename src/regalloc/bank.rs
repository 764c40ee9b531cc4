use super::layout::{Bank, RegisterId, RegisterLayout};

/// Result of asking a bank to release a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeOutcome {
    Freed,
    /// A typed-residency pin keeps the slot allocated.
    Pinned,
    /// The slot was not allocated.
    NotAllocated,
}

/// First-fit bitmap allocator over one fixed-capacity bank.
///
/// `cursor` never points past the lowest free slot, so a scan starting there
/// always finds the lowest free index first.
#[derive(Debug, Clone)]
pub struct BankAllocator {
    bank: Bank,
    base: u16,
    used: Vec<bool>,
    pinned: Vec<bool>,
    cursor: usize,
    live: usize,
}

impl BankAllocator {
    pub fn new(layout: &RegisterLayout, bank: Bank) -> Self {
        let capacity = layout.capacity(bank);
        BankAllocator {
            bank,
            base: layout.start(bank),
            used: vec![false; capacity],
            pinned: vec![false; capacity],
            cursor: 0,
            live: 0,
        }
    }

    pub fn bank(&self) -> Bank {
        self.bank
    }

    pub fn capacity(&self) -> usize {
        self.used.len()
    }

    pub fn live(&self) -> usize {
        self.live
    }

    pub fn is_exhausted(&self) -> bool {
        self.live == self.used.len()
    }

    /// Take the lowest free slot. `None` means the bank is full, which is not
    /// an error: the caller moves on to the next bank.
    pub fn allocate(&mut self) -> Option<RegisterId> {
        let slot = (self.cursor..self.used.len()).find(|&i| !self.used[i])?;
        self.used[slot] = true;
        self.live += 1;
        self.cursor = slot + 1;
        Some(self.id(slot))
    }

    pub fn free(&mut self, id: RegisterId) -> FreeOutcome {
        let Some(slot) = self.slot(id) else {
            return FreeOutcome::NotAllocated;
        };
        if !self.used[slot] {
            return FreeOutcome::NotAllocated;
        }
        if self.pinned[slot] {
            return FreeOutcome::Pinned;
        }
        self.used[slot] = false;
        self.live -= 1;
        self.cursor = self.cursor.min(slot);
        FreeOutcome::Freed
    }

    /// Force a slot into use, e.g. a fixed parameter offset. Returns false if
    /// the ID is outside this bank or already taken.
    pub fn reserve(&mut self, id: RegisterId) -> bool {
        match self.slot(id) {
            Some(slot) if !self.used[slot] => {
                self.used[slot] = true;
                self.live += 1;
                if self.cursor == slot {
                    self.cursor += 1;
                }
                true
            }
            _ => false,
        }
    }

    pub fn is_used(&self, id: RegisterId) -> bool {
        self.slot(id).is_some_and(|slot| self.used[slot])
    }

    pub fn pin(&mut self, id: RegisterId) -> bool {
        match self.slot(id) {
            Some(slot) if self.used[slot] => {
                self.pinned[slot] = true;
                true
            }
            _ => false,
        }
    }

    pub fn unpin(&mut self, id: RegisterId) {
        if let Some(slot) = self.slot(id) {
            self.pinned[slot] = false;
        }
    }

    pub fn is_pinned(&self, id: RegisterId) -> bool {
        self.slot(id).is_some_and(|slot| self.pinned[slot])
    }

    pub fn contains(&self, id: RegisterId) -> bool {
        self.slot(id).is_some()
    }

    fn slot(&self, id: RegisterId) -> Option<usize> {
        let slot = id.0.checked_sub(self.base)? as usize;
        (slot < self.used.len()).then_some(slot)
    }

    fn id(&self, slot: usize) -> RegisterId {
        RegisterId(self.base + slot as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_bank() -> BankAllocator {
        BankAllocator::new(&RegisterLayout::default(), Bank::Frame)
    }

    #[test]
    fn test_allocate_is_first_fit_from_bank_start() {
        let mut bank = frame_bank();
        assert_eq!(bank.allocate(), Some(RegisterId(64)));
        assert_eq!(bank.allocate(), Some(RegisterId(65)));
        assert_eq!(bank.live(), 2);
    }

    #[test]
    fn test_free_makes_lowest_slot_win() {
        let mut bank = frame_bank();
        let a = bank.allocate().unwrap();
        let b = bank.allocate().unwrap();
        let _c = bank.allocate().unwrap();
        assert_eq!(bank.free(b), FreeOutcome::Freed);
        assert_eq!(bank.free(a), FreeOutcome::Freed);
        assert_eq!(bank.allocate(), Some(a));
        assert_eq!(bank.allocate(), Some(b));
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let layout = RegisterLayout::new(2, 2, 2, 2).unwrap();
        let mut bank = BankAllocator::new(&layout, Bank::Temp);
        assert_eq!(bank.allocate(), Some(RegisterId(4)));
        assert_eq!(bank.allocate(), Some(RegisterId(5)));
        assert_eq!(bank.allocate(), None);
        assert!(bank.is_exhausted());
    }

    #[test]
    fn test_pinned_slot_is_not_freed() {
        let mut bank = frame_bank();
        let r = bank.allocate().unwrap();
        assert!(bank.pin(r));
        assert_eq!(bank.free(r), FreeOutcome::Pinned);
        assert!(bank.is_used(r));
        bank.unpin(r);
        assert_eq!(bank.free(r), FreeOutcome::Freed);
    }

    #[test]
    fn test_reserve_skips_slot() {
        let mut bank = frame_bank();
        assert!(bank.reserve(RegisterId(64)));
        assert!(!bank.reserve(RegisterId(64)));
        assert_eq!(bank.allocate(), Some(RegisterId(65)));
    }

    #[test]
    fn test_reserve_out_of_range() {
        let mut bank = frame_bank();
        assert!(!bank.reserve(RegisterId(3)));
        assert!(!bank.reserve(RegisterId(192)));
    }

    #[test]
    fn test_double_free() {
        let mut bank = frame_bank();
        let r = bank.allocate().unwrap();
        assert_eq!(bank.free(r), FreeOutcome::Freed);
        assert_eq!(bank.free(r), FreeOutcome::NotAllocated);
        assert_eq!(bank.live(), 0);
    }
}

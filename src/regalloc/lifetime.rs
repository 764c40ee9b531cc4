use super::bank::{BankAllocator, FreeOutcome};
use super::layout::{Bank, Location, RegisterId, RegisterLayout};
use crate::lang::value::ScalarType;
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::debug;

/// What the compiler is allocating for. Decides the bank fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterKind {
    /// Top-level declarations.
    Global,
    /// Function locals and parameters.
    Frame,
    /// Expression intermediates.
    Temp,
    /// Declarations of a module compilation unit.
    Module,
}

impl RegisterKind {
    /// Banks to try, in order, before spilling.
    pub fn chain(self) -> &'static [Bank] {
        match self {
            RegisterKind::Global => &[Bank::Global, Bank::Frame, Bank::Temp, Bank::Module],
            RegisterKind::Frame => &[Bank::Frame, Bank::Temp],
            RegisterKind::Temp => &[Bank::Temp, Bank::Frame],
            RegisterKind::Module => &[Bank::Module, Bank::Global],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocPolicy {
    /// Scalars with a known type get an unboxed shadow.
    #[default]
    PreferTyped,
    /// Everything is boxed.
    Standard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Representation {
    Boxed,
    Typed(ScalarType),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub id: RegisterId,
    pub repr: Representation,
}

impl Allocation {
    pub fn typed(&self) -> Option<ScalarType> {
        match self.repr {
            Representation::Typed(ty) => Some(ty),
            Representation::Boxed => None,
        }
    }
}

/// Lifetime bookkeeping for one register.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterInfo {
    pub birth: usize,
    pub last_use: usize,
    pub active: bool,
    pub reusable: bool,
    pub ty: Option<ScalarType>,
    pub name: Option<String>,
    pub repr: Representation,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("too many local variables (register space exhausted at {0})")]
    TooManyRegisters(u32),
}

/// Bank usage of a finished function, for frame sizing and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FunctionUsage {
    pub spill_slots: u32,
}

/// One allocation area: the process-wide banks (global, module) or the banks
/// of the function currently being compiled (frame, temp, spill).
#[derive(Debug)]
struct Area {
    banks: Vec<BankAllocator>,
    /// LIFO reuse pools; `None` is the spill range.
    pools: HashMap<Option<Bank>, Vec<RegisterId>>,
    records: HashMap<RegisterId, RegisterInfo>,
    /// Frees refused by a pin, honored on unpin.
    pending: HashSet<RegisterId>,
    next_spill: u32,
}

impl Area {
    fn new(layout: &RegisterLayout, banks: &[Bank]) -> Self {
        Area {
            banks: banks.iter().map(|b| BankAllocator::new(layout, *b)).collect(),
            pools: HashMap::new(),
            records: HashMap::new(),
            pending: HashSet::new(),
            next_spill: layout.spill_start() as u32,
        }
    }

    fn bank_mut(&mut self, bank: Bank) -> Option<&mut BankAllocator> {
        self.banks.iter_mut().find(|b| b.bank() == bank)
    }

    fn bank(&self, bank: Bank) -> Option<&BankAllocator> {
        self.banks.iter().find(|b| b.bank() == bank)
    }

    /// Pop from a reuse pool, preferring the most recent entry of the same type.
    fn take_pooled(&mut self, key: Option<Bank>, ty: Option<ScalarType>) -> Option<RegisterId> {
        let pool = self.pools.get_mut(&key)?;
        let records = &self.records;
        let pos = pool
            .iter()
            .rposition(|id| records.get(id).is_some_and(|r| r.ty == ty))
            .or_else(|| pool.len().checked_sub(1))?;
        Some(pool.remove(pos))
    }

    fn forget_pooled(&mut self, key: Option<Bank>, id: RegisterId) {
        if let Some(pool) = self.pools.get_mut(&key) {
            pool.retain(|r| *r != id);
        }
    }
}

/// Single-pass register allocator with lifetime tracking and per-bank reuse.
///
/// One instance is a compilation context: it is created per compilation unit
/// and threaded through the compiler by reference.
#[derive(Debug)]
pub struct LifetimeAllocator {
    layout: RegisterLayout,
    policy: AllocPolicy,
    shared: Area,
    current: Area,
    enclosing: Vec<Area>,
}

impl LifetimeAllocator {
    pub fn new(layout: RegisterLayout, policy: AllocPolicy) -> Self {
        LifetimeAllocator {
            shared: Area::new(&layout, &[Bank::Global, Bank::Module]),
            current: Area::new(&layout, &[Bank::Frame, Bank::Temp]),
            enclosing: Vec::new(),
            layout,
            policy,
        }
    }

    pub fn layout(&self) -> &RegisterLayout {
        &self.layout
    }

    pub fn policy(&self) -> AllocPolicy {
        self.policy
    }

    /// Start a nested function: fresh frame, temp and spill state.
    pub fn enter_function(&mut self) {
        let fresh = Area::new(&self.layout, &[Bank::Frame, Bank::Temp]);
        self.enclosing.push(std::mem::replace(&mut self.current, fresh));
    }

    /// Finish the innermost function. `None` at top level.
    pub fn exit_function(&mut self) -> Option<FunctionUsage> {
        let outer = self.enclosing.pop()?;
        let done = std::mem::replace(&mut self.current, outer);
        Some(FunctionUsage {
            spill_slots: done.next_spill - self.layout.spill_start() as u32,
        })
    }

    pub fn function_depth(&self) -> usize {
        self.enclosing.len()
    }

    pub fn allocate_smart(
        &mut self,
        kind: RegisterKind,
        ty: Option<ScalarType>,
        name: Option<&str>,
        at: usize,
    ) -> Result<Allocation, AllocError> {
        self.allocate_with_policy(kind, ty, name, at, self.policy)
    }

    pub fn allocate_with_policy(
        &mut self,
        kind: RegisterKind,
        ty: Option<ScalarType>,
        name: Option<&str>,
        at: usize,
        policy: AllocPolicy,
    ) -> Result<Allocation, AllocError> {
        let id = self.pick(kind, ty)?;
        let repr = match (policy, ty, self.layout.locate(id)) {
            (_, _, Location::Spill(_)) => Representation::Boxed,
            (AllocPolicy::PreferTyped, Some(t), _) => Representation::Typed(t),
            _ => Representation::Boxed,
        };
        let info = RegisterInfo {
            birth: at,
            last_use: at,
            active: true,
            reusable: false,
            ty,
            name: name.map(str::to_string),
            repr,
        };
        self.area_mut(id).records.insert(id, info);
        Ok(Allocation { id, repr })
    }

    fn pick(&mut self, kind: RegisterKind, ty: Option<ScalarType>) -> Result<RegisterId, AllocError> {
        let chain = kind.chain();

        for (i, bank) in chain.iter().enumerate() {
            let area = self.bank_area_mut(*bank);

            if i == 0 {
                while let Some(id) = area.take_pooled(Some(*bank), ty) {
                    if area.bank_mut(*bank).is_some_and(|b| b.reserve(id)) {
                        return Ok(id);
                    }
                }
            }

            if let Some(id) = area.bank_mut(*bank).and_then(|b| b.allocate()) {
                area.forget_pooled(Some(*bank), id);
                if i > 0 {
                    debug!(?kind, bank = bank.name(), %id, "register request fell through");
                }
                return Ok(id);
            }
        }

        let area = &mut self.current;
        if let Some(id) = area.take_pooled(None, ty) {
            return Ok(id);
        }
        let next = area.next_spill;
        if next > u16::MAX as u32 {
            return Err(AllocError::TooManyRegisters(next));
        }
        area.next_spill += 1;
        debug!(?kind, id = next, "all banks exhausted, spilling");
        Ok(RegisterId(next as u16))
    }

    /// Force a register into use at a fixed position (parameters).
    pub fn reserve(
        &mut self,
        id: RegisterId,
        ty: Option<ScalarType>,
        name: Option<&str>,
    ) -> Option<Allocation> {
        let loc = self.layout.locate(id);
        let area = self.area_mut(id);
        let ok = match loc.bank() {
            Some(bank) => {
                let ok = area.bank_mut(bank).is_some_and(|b| b.reserve(id));
                area.forget_pooled(Some(bank), id);
                ok
            }
            None => {
                if id.0 as u32 >= area.next_spill {
                    area.next_spill = id.0 as u32 + 1;
                }
                area.forget_pooled(None, id);
                !area.records.get(&id).is_some_and(|r| r.active)
            }
        };
        if !ok {
            return None;
        }
        let repr = match (self.policy, ty, loc) {
            (AllocPolicy::PreferTyped, Some(t), l) if l.bank().is_some() => Representation::Typed(t),
            _ => Representation::Boxed,
        };
        self.area_mut(id).records.insert(
            id,
            RegisterInfo {
                birth: 0,
                last_use: 0,
                active: true,
                reusable: false,
                ty,
                name: name.map(str::to_string),
                repr,
            },
        );
        Some(Allocation { id, repr })
    }

    /// Record a use. Metadata only.
    pub fn mark_last_use(&mut self, id: RegisterId, at: usize) {
        if let Some(info) = self.area_mut(id).records.get_mut(&id) {
            info.last_use = info.last_use.max(at);
        }
    }

    /// Release a register onto its bank's reuse pool, unless pinned.
    pub fn free_smart(&mut self, id: RegisterId) -> FreeOutcome {
        let loc = self.layout.locate(id);
        let area = self.area_mut(id);

        let outcome = match loc.bank() {
            Some(bank) => match area.bank_mut(bank) {
                Some(b) => b.free(id),
                None => FreeOutcome::NotAllocated,
            },
            None => {
                if area.records.get(&id).is_some_and(|r| r.active) {
                    FreeOutcome::Freed
                } else {
                    FreeOutcome::NotAllocated
                }
            }
        };

        match outcome {
            FreeOutcome::Freed => {
                if let Some(info) = area.records.get_mut(&id) {
                    info.active = false;
                    info.reusable = true;
                }
                area.pending.remove(&id);
                area.pools.entry(loc.bank()).or_default().push(id);
            }
            FreeOutcome::Pinned => {
                area.pending.insert(id);
            }
            FreeOutcome::NotAllocated => {}
        }
        outcome
    }

    /// Apply the typed-residency pin. Spill registers are never typed, so
    /// pinning them is refused.
    pub fn pin(&mut self, id: RegisterId) -> bool {
        match self.layout.locate(id).bank() {
            Some(bank) => self
                .area_mut(id)
                .bank_mut(bank)
                .is_some_and(|b| b.pin(id)),
            None => false,
        }
    }

    /// Lift the pin and carry out a free that it held back.
    pub fn unpin(&mut self, id: RegisterId) {
        let Some(bank) = self.layout.locate(id).bank() else {
            return;
        };
        let area = self.area_mut(id);
        if let Some(b) = area.bank_mut(bank) {
            b.unpin(id);
        }
        if area.pending.contains(&id) {
            self.free_smart(id);
        }
    }

    pub fn is_pinned(&self, id: RegisterId) -> bool {
        match self.layout.locate(id).bank() {
            Some(bank) => self.area(id).bank(bank).is_some_and(|b| b.is_pinned(id)),
            None => false,
        }
    }

    pub fn is_live(&self, id: RegisterId) -> bool {
        self.area(id).records.get(&id).is_some_and(|r| r.active)
    }

    pub fn info(&self, id: RegisterId) -> Option<&RegisterInfo> {
        self.area(id).records.get(&id)
    }

    /// Registers currently live in the innermost function and the shared banks.
    pub fn live_registers(&self) -> Vec<RegisterId> {
        let mut live: Vec<RegisterId> = self
            .shared
            .records
            .iter()
            .chain(self.current.records.iter())
            .filter(|(_, r)| r.active)
            .map(|(id, _)| *id)
            .collect();
        live.sort();
        live
    }

    fn bank_area_mut(&mut self, bank: Bank) -> &mut Area {
        match bank {
            Bank::Global | Bank::Module => &mut self.shared,
            Bank::Frame | Bank::Temp => &mut self.current,
        }
    }

    fn area_mut(&mut self, id: RegisterId) -> &mut Area {
        match self.layout.locate(id) {
            Location::Global(_) | Location::Module(_) => &mut self.shared,
            _ => &mut self.current,
        }
    }

    fn area(&self, id: RegisterId) -> &Area {
        match self.layout.locate(id) {
            Location::Global(_) | Location::Module(_) => &self.shared,
            _ => &self.current,
        }
    }
}

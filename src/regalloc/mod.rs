//! Compile-time register allocation.
//!
//! `layout` fixes the register ID space, `bank` hands out slots inside one
//! bank, `lifetime` layers reuse and lifetime tracking on top, and `scope`
//! keeps the name-to-register bindings the compiler frees at scope exit.

pub mod bank;
pub mod layout;
pub mod lifetime;
pub mod scope;

pub use bank::{BankAllocator, FreeOutcome};
pub use layout::{Bank, LayoutError, Location, RegisterId, RegisterLayout};
pub use lifetime::{
    AllocError, AllocPolicy, Allocation, LifetimeAllocator, RegisterInfo, RegisterKind,
    Representation,
};
pub use scope::{Local, ScopeId, ScopeKind, ScopeTree};

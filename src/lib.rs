//! A register-based bytecode VM with tiered register banks and a
//! compile-time register allocator.
//!
//! Front ends hand over a type-annotated tree ([`lang::node::Program`]);
//! [`bytecode::compile`] lowers it to a [`bytecode::Program`] and
//! [`runtime::Vm`] executes it.

pub mod bytecode;
pub mod config;
pub mod lang;
pub mod regalloc;
pub mod runtime;

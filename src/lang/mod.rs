//! # Front-end interface
//!
//! Values, the type-annotated syntax tree the compiler consumes, and the
//! diagnostics collaborator. Parsing and type inference happen upstream;
//! this module only defines what they hand over.

pub mod diagnostic;
pub mod node;
pub mod value;

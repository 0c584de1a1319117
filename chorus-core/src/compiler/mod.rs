//! Workflow document → normalized IR.
//!
//! `document` holds the user-facing DTOs, `ir` the executable graph the
//! Coordinator reloads on every hop, `lower` the normalization passes, and
//! `verify` the structural validation pass.

pub mod document;
pub mod ir;
pub mod lower;
pub mod verify;

pub use lower::compile;
pub use verify::CompileError;

//! Downgrades CPython 3.9 compiled bytecode files into files the 3.8
//! interpreter loads and executes.

mod bytes;
/// Code object data model
pub mod code;
/// Marshal (de)serializer for the code-object constant tree
pub mod marshal;
/// pyc container format
pub mod pyc;
/// The 3.9 → 3.8 code object rewriter
pub mod rewrite;

/// Definitions mirroring CPython's opcode and magic-number tables
pub mod schema {
    /// pyc magic words per interpreter version
    pub mod magics;
    /// Opcode numbers and instruction kinds
    pub mod opcodes;
}

pub use self::code::{CodeFlags, CodeObject, PyObject};
pub use self::pyc::CompiledFile;
pub use self::rewrite::rewrite;

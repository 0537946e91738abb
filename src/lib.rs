//! A Horn-clause engine: a compiler from clauses to abstract-machine
//! bytecode, and the register machine that executes it with full
//! backtracking, unification and cut — plus an interpreted fallback path
//! that the bytecode path must agree with observably.

#[macro_use]
pub mod atom_table;
pub mod types;
#[macro_use]
pub mod forms;
#[macro_use]
pub(crate) mod instructions;

mod allocator;
pub mod arithmetic;
pub(crate) mod codegen;
mod debray_allocator;
mod fixtures;
pub mod heap_print;
mod indexing;
mod iterators;
pub mod machine;
pub mod parser;
mod preprocessor;
mod targets;

// Re-exports: the narrow surface collaborators build against.
pub use atom_table::{Atom, AtomTable};
pub use machine::machine_errors::{MachineError, ResourceError, SyntaxError, ValidType};
pub use machine::machine_indices::BuiltinFn;
pub use machine::{Machine, MachineConfig};
pub use types::HeapCellValue;

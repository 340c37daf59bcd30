pub mod assemble;
pub mod bytecode;
pub mod module;
pub mod runtime;

pub use assemble::{assemble, CodeSpec};
pub use bytecode::{CodeObject, CompareOp, DeferredPtr, Fragment, Instruction, Label, Op, PtrMode};
pub use runtime::{call_value, execute, Closure};

//! Veil IR: the SSA substrate the obfuscation passes rewrite.
//!
//! This crate owns the data model (modules, functions, basic blocks,
//! instructions, globals, constructor lists) plus the analyses and utilities
//! the transformation pipeline leans on:
//!
//! - `builder`: cursor-based instruction emission
//! - `dom`: dominator-tree analysis
//! - `verify`: SSA/dominance/shape verification after every pass
//! - `demote`: phi- and register-to-stack demotion
//! - `extract`: single-block code extraction
//! - `printer`: deterministic LLVM-flavored text output
//! - `interp`: direct execution, used to test semantic preservation
//!
//! The IR graph is cyclic (blocks reference each other, values flow
//! forward), so everything is arena-allocated and cross-referenced through
//! small copyable ids rather than borrowed pointers.

pub mod builder;
pub mod demote;
pub mod dom;
pub mod extract;
pub mod function;
pub mod instruction;
pub mod interp;
pub mod module;
pub mod printer;
pub mod triple;
pub mod types;
pub mod verify;

pub use builder::Builder;
pub use demote::{cross_block_value_uses, demote_phi_to_stack, demote_reg_to_stack};
pub use dom::DomTree;
pub use extract::{ExtractError, extract_block};
pub use function::{AttrSet, Attribute, BasicBlock, Function};
pub use instruction::{
    BinOpKind, Callee, CastOp, ICmpPred, InstKind, Instruction, Value,
};
pub use interp::{EvalError, Interp, PtrValue, Rv};
pub use module::{CtorEntry, GlobalVariable, Linkage, Module};
pub use printer::{print_function, print_module};
pub use triple::{Os, Triple};
pub use types::{BlockId, Constant, FunctionId, GlobalId, InstId, Type};
pub use verify::{VerifyError, verify, verify_function};

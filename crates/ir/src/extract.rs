//! Single-block code extraction.
//!
//! Lifts one basic block out of a function into a fresh internal function,
//! leaving a call behind. Mirrors the host pipeline's region extractor run
//! in its strictest configuration: no allocas may move, and the region must
//! not leak SSA values or block addresses.

use crate::function::Function;
use crate::instruction::{Callee, InstKind, Instruction, Value};
use crate::module::{Linkage, Module};
use crate::types::{BlockId, FunctionId, InstId, Type};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractError {
    /// The entry block holds stack allocations and cannot move.
    IsEntry,
    /// The block receives control merges that have no call-site equivalent.
    HasPhi,
    /// Stack allocations must stay in their parent frame.
    HasAlloca,
    /// Only single-successor blocks can be replaced by call-then-branch.
    NotUncondBranch,
    /// The block is an indirect-branch destination or its address is taken.
    AddressTaken,
    /// The block manipulates block addresses of its parent function.
    BlockAddressOperand,
    /// A value defined in the block is used elsewhere.
    ValueEscapes,
}

impl fmt::Display for ExtractError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ExtractError::IsEntry => "cannot extract the entry block",
            ExtractError::HasPhi => "block begins with phi nodes",
            ExtractError::HasAlloca => "block contains stack allocations",
            ExtractError::NotUncondBranch => "block does not end in an unconditional branch",
            ExtractError::AddressTaken => "block address is taken",
            ExtractError::BlockAddressOperand => "block references block addresses",
            ExtractError::ValueEscapes => "a value defined in the block escapes it",
        };
        write!(f, "{}", msg)
    }
}

impl std::error::Error for ExtractError {}

/// Extract `bb` from `func` into a new internal function named `new_name`.
/// On success the block body is replaced by a call to the new function.
pub fn extract_block(
    module: &mut Module,
    func_id: FunctionId,
    bb: BlockId,
    new_name: &str,
) -> Result<FunctionId, ExtractError> {
    let func = module.function(func_id);
    check_eligible(func, bb)?;

    let body: Vec<InstId> = func.block(bb).insts().to_vec();
    let (moved, term) = body.split_at(body.len() - 1);
    let term = term[0];

    // Inputs in first-use order; everything module-scoped passes through.
    let mut inputs: Vec<Value> = Vec::new();
    let inside: Vec<InstId> = moved.to_vec();
    for &id in moved {
        for v in func.inst(id).kind.values() {
            let outside = match v {
                Value::Inst(d) => !inside.contains(d),
                Value::Arg(_) => true,
                _ => false,
            };
            if outside && !inputs.contains(v) {
                inputs.push(v.clone());
            }
        }
    }
    let param_tys: Vec<Type> = inputs
        .iter()
        .map(|v| func.value_type(v).unwrap_or(Type::Ptr))
        .collect();

    // Clone the body out, remapping operands.
    let cloned: Vec<Instruction> = moved.iter().map(|&id| func.inst(id).clone()).collect();
    let fn_ty = Type::func(param_tys, Type::Void);

    let mut new_func = Function::new(new_name, fn_ty.clone(), Linkage::Internal);
    let new_entry = new_func.add_block("entry");
    let mut id_map: HashMap<InstId, InstId> = HashMap::new();
    for (&old_id, inst) in moved.iter().zip(cloned) {
        let mut inst = inst;
        for v in inst.kind.values_mut() {
            if let Some(i) = inputs.iter().position(|input| input == v) {
                *v = Value::Arg(i);
            } else if let Value::Inst(d) = v {
                // Defined earlier in the block; already remapped.
                *v = Value::Inst(id_map[d]);
            }
        }
        let new_id = new_func.new_inst(inst);
        new_func.push_inst(new_entry, new_id);
        id_map.insert(old_id, new_id);
    }
    let ret = new_func.new_inst(Instruction::new(InstKind::Ret { value: None }, Type::Void, ""));
    new_func.push_inst(new_entry, ret);

    let new_id = module.add_function(new_func);

    // Rewrite the original block: call, then the old branch.
    let func = module.function_mut(func_id);
    for &id in moved {
        func.erase_from_block(bb, id);
    }
    let call = func.new_inst(Instruction::new(
        InstKind::Call {
            callee: Callee::Direct(new_id),
            fn_ty,
            args: inputs,
        },
        Type::Void,
        "",
    ));
    let term_pos = func
        .block(bb)
        .insts()
        .iter()
        .position(|&i| i == term)
        .unwrap_or(0);
    func.insert_inst(bb, term_pos, call);

    debug!(
        block = %module.function(func_id).block(bb).name,
        outlined = new_name,
        "extracted block"
    );
    Ok(new_id)
}

fn check_eligible(func: &Function, bb: BlockId) -> Result<(), ExtractError> {
    if func.entry() == Some(bb) {
        return Err(ExtractError::IsEntry);
    }
    let block = func.block(bb);
    let Some(term) = func.terminator(bb) else {
        return Err(ExtractError::NotUncondBranch);
    };
    if !matches!(func.inst(term).kind, InstKind::Br { .. }) {
        return Err(ExtractError::NotUncondBranch);
    }
    for &id in block.insts() {
        let kind = &func.inst(id).kind;
        if kind.is_phi() {
            return Err(ExtractError::HasPhi);
        }
        if kind.is_alloca() {
            return Err(ExtractError::HasAlloca);
        }
        if id != term
            && kind
                .values()
                .into_iter()
                .any(|v| matches!(v, Value::BlockAddress(_)))
        {
            return Err(ExtractError::BlockAddressOperand);
        }
    }
    // Address-taken blocks stay put: indirect branches and blockaddress
    // constants elsewhere in the function may transfer control here.
    for &other in func.layout() {
        for &id in func.block(other).insts() {
            let kind = &func.inst(id).kind;
            if let InstKind::IndirectBr { dests, .. } = kind {
                if dests.contains(&bb) {
                    return Err(ExtractError::AddressTaken);
                }
            }
            if kind
                .values()
                .into_iter()
                .any(|v| *v == Value::BlockAddress(bb))
            {
                return Err(ExtractError::AddressTaken);
            }
        }
    }
    // No SSA value may escape the region.
    let inside: Vec<InstId> = block.insts().to_vec();
    for &other in func.layout() {
        if other == bb {
            continue;
        }
        for &id in func.block(other).insts() {
            for v in func.inst(id).kind.values() {
                if let Value::Inst(d) = v {
                    if inside.contains(d) {
                        return Err(ExtractError::ValueEscapes);
                    }
                }
            }
        }
    }
    Ok(())
}

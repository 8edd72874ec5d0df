//! Control-flow flattening.
//!
//! Rewrites a function's CFG into a dispatcher loop. Every original block
//! ends by storing its successor's block address into a stack slot and
//! jumping to `loop_end`; the dispatcher reloads the slot and transfers
//! control with an indirect branch. Recovering the original CFG statically
//! then requires tracking the slot's value history instead of reading edges
//! off the terminators.
//!
//! Demotion first: once blocks stop branching to each other directly, a
//! value defined in one block no longer dominates its old uses elsewhere,
//! so every phi and every cross-block register use is lowered to a stack
//! slot before the CFG is touched.

use crate::pass::{FunctionPass, PassContext, PassError, PassKind, Preserved, is_obf_name};
use crate::registry::{PassInfo, Placement};
use tracing::debug;
use veil_ir::{
    Attribute, Builder, FunctionId, InstKind, Module, Type, Value,
    cross_block_value_uses, demote_phi_to_stack, demote_reg_to_stack,
};

pub struct FlatteningPass;

impl FunctionPass for FlatteningPass {
    fn name(&self) -> &'static str {
        "EnterpriseFlattening"
    }

    fn run(
        &mut self,
        module: &mut Module,
        fid: FunctionId,
        _cx: &mut PassContext,
    ) -> Result<Preserved, PassError> {
        let func = module.function_mut(fid);
        if func.attrs.has(Attribute::OptimizeNone)
            || func.attrs.has(Attribute::NoObfuscate)
            || is_obf_name(func.name())
        {
            return Ok(Preserved::All);
        }
        // An existing dispatcher marks an already-flattened function.
        if func
            .layout()
            .iter()
            .any(|&bb| func.block(bb).name == "dispatch_header")
        {
            return Ok(Preserved::All);
        }

        // 1. SSA demotion. Phis first; the reloads they introduce can
        // themselves be used across blocks, so iterate to a fixpoint.
        let phis: Vec<_> = func
            .block_ids()
            .into_iter()
            .flat_map(|bb| func.block(bb).insts().to_vec())
            .filter(|&id| func.inst(id).kind.is_phi())
            .collect();
        for phi in phis {
            demote_phi_to_stack(func, phi);
        }
        loop {
            let escaping = cross_block_value_uses(func);
            if escaping.is_empty() {
                break;
            }
            for inst in escaping {
                demote_reg_to_stack(func, inst);
            }
        }

        // 2. Entry partition: allocas stay put, everything else moves to a
        // fresh logic block.
        let Some(entry) = func.entry() else {
            return Ok(Preserved::All);
        };
        let entry_logic = func.add_block("entry_logic");
        for id in func.block(entry).insts().to_vec() {
            if !func.inst(id).kind.is_alloca() {
                func.erase_from_block(entry, id);
                func.push_inst(entry_logic, id);
            }
        }

        // 3. Dispatcher scaffolding.
        let dispatch_header = func.add_block("dispatch_header");
        let loop_end = func.add_block("loop_end");
        let indirect_dispatch = func.add_block("indirect_dispatch");

        let scaffolding = [entry, dispatch_header, loop_end, indirect_dispatch];
        let original_blocks: Vec<_> = func
            .block_ids()
            .into_iter()
            .filter(|bb| !scaffolding.contains(bb))
            .collect();
        if original_blocks.is_empty() {
            return Ok(Preserved::All);
        }

        let mut b = Builder::at_end(func, entry);
        let state = b.alloca(Type::Ptr, "state_var");
        b.store(Value::BlockAddress(entry_logic), state.clone());
        b.br(dispatch_header);

        Builder::at_end(func, dispatch_header).br(indirect_dispatch);
        Builder::at_end(func, loop_end).br(dispatch_header);

        let mut b = Builder::at_end(func, indirect_dispatch);
        let next = b.load(Type::Ptr, state.clone(), "load_state");
        b.indirect_br(next, original_blocks.clone());

        // 4. Re-route the original terminators through the dispatcher.
        for bb in original_blocks {
            let Some(term) = func.terminator(bb) else {
                continue;
            };
            match func.inst(term).kind.clone() {
                // Returns and unwinds leave the dispatcher naturally.
                InstKind::Ret { .. } | InstKind::Resume | InstKind::Unreachable => {}
                InstKind::Br { dest } => {
                    func.erase_from_block(bb, term);
                    let mut b = Builder::at_end(func, bb);
                    b.store(Value::BlockAddress(dest), state.clone());
                    b.br(loop_end);
                }
                InstKind::CondBr {
                    cond,
                    if_true,
                    if_false,
                } => {
                    func.erase_from_block(bb, term);
                    let mut b = Builder::at_end(func, bb);
                    let sel = b.select(
                        cond,
                        Value::BlockAddress(if_true),
                        Value::BlockAddress(if_false),
                        "",
                    );
                    b.store(sel, state.clone());
                    b.br(loop_end);
                }
                // Switches and existing indirect branches stay in place;
                // their blocks are still dispatcher destinations.
                _ => {}
            }
        }

        debug!(func = module.function(fid).name(), "flattened control flow");
        Ok(Preserved::None)
    }
}

pub fn plugin_info() -> PassInfo {
    PassInfo {
        name: "EnterpriseFlattening",
        version: "1.0",
        placement: Placement::PipelineEnd,
        required: true,
        build: || PassKind::Function(Box::new(FlatteningPass)),
    }
}

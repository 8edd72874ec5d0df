//! Basic-block splitting.
//!
//! Cuts every sufficiently large block at a random interior position. The
//! direct payoff is defeating signature heuristics keyed on block
//! boundaries; the indirect one is handing the later control-flow passes a
//! larger block set to scramble.

use crate::pass::{FunctionPass, PassContext, PassError, PassKind, Preserved, is_obf_name};
use crate::registry::{PassInfo, Placement};
use tracing::trace;
use veil_ir::{Attribute, FunctionId, Module};

pub struct SplitBasicBlockPass;

impl FunctionPass for SplitBasicBlockPass {
    fn name(&self) -> &'static str {
        "EnterpriseSplitBasicBlock"
    }

    fn run(
        &mut self,
        module: &mut Module,
        fid: FunctionId,
        cx: &mut PassContext,
    ) -> Result<Preserved, PassError> {
        let func = module.function_mut(fid);
        if func.attrs.has(Attribute::OptimizeNone)
            || func.attrs.has(Attribute::NoObfuscate)
            || is_obf_name(func.name())
        {
            return Ok(Preserved::All);
        }

        let mut modified = false;
        for bb in func.block_ids() {
            let count = func.block(bb).len();
            if count < 3 {
                continue;
            }
            // A `.split` tail was produced by an earlier application.
            if func.block(bb).name.ends_with(".split") {
                continue;
            }
            let at = cx.rng.int_in_range(1, (count - 2) as u32) as usize;
            let picked = func.block(bb).insts()[at];
            let kind = &func.inst(picked).kind;
            if kind.is_phi() || kind.is_terminator() {
                continue;
            }
            let name = format!("{}.split", func.block(bb).name);
            func.split_block(bb, at, name);
            trace!(func = func.name(), at, "split block");
            modified = true;
        }
        Ok(if modified {
            Preserved::None
        } else {
            Preserved::All
        })
    }
}

pub fn plugin_info() -> PassInfo {
    PassInfo {
        name: "EnterpriseSplitBasicBlock",
        version: "1.0",
        placement: Placement::PipelineEnd,
        required: true,
        build: || PassKind::Function(Box::new(SplitBasicBlockPass)),
    }
}

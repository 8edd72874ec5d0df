//! Function outlining.
//!
//! Extracts each eligible non-entry block into its own `obf.outlined.*`
//! function and marks it no-inline so the optimizer cannot stitch it back.
//! Scattering single blocks across many tiny functions shreds a
//! decompiler's view of locality.
//!
//! Skips any `obf.`-prefixed function: the decryption stub, previously
//! outlined bodies, and every other pass-introduced helper.

use crate::pass::{FunctionPass, PassContext, PassError, PassKind, Preserved, is_obf_name};
use crate::registry::{PassInfo, Placement};
use tracing::debug;
use veil_ir::{
    Attribute, Callee, DomTree, FunctionId, InstKind, Module, extract_block,
};

pub struct FunctionOutliningPass;

impl FunctionPass for FunctionOutliningPass {
    fn name(&self) -> &'static str {
        "EnterpriseFunctionOutlining"
    }

    fn run(
        &mut self,
        module: &mut Module,
        fid: FunctionId,
        _cx: &mut PassContext,
    ) -> Result<Preserved, PassError> {
        let func = module.function(fid);
        if func.attrs.has(Attribute::OptimizeNone)
            || func.attrs.has(Attribute::NoObfuscate)
            || is_obf_name(func.name())
        {
            return Ok(Preserved::All);
        }
        let parent_name = func.name().to_string();

        // Extraction needs dominance information to be meaningful; blocks
        // outside the reachable region are left for dead-code elimination.
        let dom = DomTree::compute(func);

        let mut candidates = Vec::new();
        for &bb in func.layout().iter().skip(1) {
            if !dom.is_reachable(bb) {
                continue;
            }
            // Exception-handling edges cannot be cleanly extracted.
            if func
                .terminator(bb)
                .is_some_and(|t| matches!(func.inst(t).kind, InstKind::Resume))
            {
                continue;
            }
            // A block that is already just a trampoline into an outlined
            // body gains nothing from another round.
            if is_outline_trampoline(module, fid, bb) {
                continue;
            }
            candidates.push(bb);
        }

        let mut outlined = 0usize;
        for bb in candidates {
            let name = format!(
                "obf.outlined.{}.{}",
                parent_name,
                next_index(module, &parent_name)
            );
            match extract_block(module, fid, bb, &name) {
                Ok(new_id) => {
                    module.function_mut(new_id).attrs.add(Attribute::NoInline);
                    outlined += 1;
                }
                // Ineligible regions are skipped, not errors.
                Err(_) => continue,
            }
        }

        if outlined > 0 {
            debug!(func = %parent_name, outlined, "outlined blocks");
            Ok(Preserved::None)
        } else {
            Ok(Preserved::All)
        }
    }
}

fn is_outline_trampoline(module: &Module, fid: FunctionId, bb: veil_ir::BlockId) -> bool {
    let func = module.function(fid);
    let insts = func.block(bb).insts();
    if insts.len() != 2 {
        return false;
    }
    let InstKind::Call {
        callee: Callee::Direct(target),
        ..
    } = &func.inst(insts[0]).kind
    else {
        return false;
    };
    is_obf_name(module.function(*target).name())
}

fn next_index(module: &Module, parent: &str) -> usize {
    let prefix = format!("obf.outlined.{}.", parent);
    let mut n = 0;
    while module
        .function_by_name(&format!("{}{}", prefix, n))
        .is_some()
    {
        n += 1;
    }
    n
}

pub fn plugin_info() -> PassInfo {
    PassInfo {
        name: "EnterpriseFunctionOutlining",
        version: "1.0",
        placement: Placement::PipelineEnd,
        required: true,
        build: || PassKind::Function(Box::new(FunctionOutliningPass)),
    }
}

//! Opaque predicates.
//!
//! Before every plain branch, computes `(key * a) + b == b` where `key` is a
//! volatile load of a module-private global that is always zero at runtime.
//! The comparison is true on every execution, but because the load is
//! volatile the optimizer cannot prove it, so the fake `false` successor
//! survives as junk the analyst has to reason about.
//!
//! Runs even on opt-none functions so the predicates appear at -O0 builds
//! too.

use crate::pass::{FunctionPass, PassContext, PassError, PassKind, Preserved, is_obf_name};
use crate::registry::{PassInfo, Placement};
use tracing::trace;
use veil_ir::{
    Attribute, Builder, Constant, FunctionId, GlobalVariable, ICmpPred, InstKind, Linkage,
    Module, Type, Value,
};

pub const KEY_GLOBAL: &str = "obf.opaque_key";

pub struct OpaquePredicatePass;

impl FunctionPass for OpaquePredicatePass {
    fn name(&self) -> &'static str {
        "EnterpriseOpaquePredicate"
    }

    fn run(
        &mut self,
        module: &mut Module,
        fid: FunctionId,
        cx: &mut PassContext,
    ) -> Result<Preserved, PassError> {
        if is_obf_name(module.function(fid).name())
            || module.function(fid).attrs.has(Attribute::NoObfuscate)
        {
            return Ok(Preserved::All);
        }

        let key = match module.global_by_name(KEY_GLOBAL) {
            Some(key) => key,
            None => module.add_global(GlobalVariable::new(
                KEY_GLOBAL,
                Type::i32(),
                Linkage::Private,
                false,
                Some(Constant::i32(0)),
            )),
        };

        let func = module.function_mut(fid);
        let mut modified = false;
        for bb in func.block_ids() {
            // Both halves of an existing predicate are left alone.
            if func.block(bb).name.starts_with("op.") {
                continue;
            }
            let Some(term) = func.terminator(bb) else {
                continue;
            };
            let already_opaque = match &func.inst(term).kind {
                InstKind::Br { .. } => false,
                InstKind::CondBr { cond, .. } => match cond {
                    Value::Inst(id) => func.inst(*id).name.starts_with("op."),
                    _ => false,
                },
                // Switch and exception edges keep their terminators.
                _ => continue,
            };
            if already_opaque {
                continue;
            }

            let a = cx.rng.int_in_range(2, 50) as i64;
            let b_const = cx.rng.int_in_range(2, 50) as i64;

            let term_pos = func.block(bb).len() - 1;
            let mut b = Builder::before(func, bb, term_pos);
            let key_val = b.load_volatile(Type::i32(), Value::Global(key), "op.key");
            let mul = b.mul(key_val, Value::const_i32(a), "op.mul");
            let add = b.add(mul, Value::const_i32(b_const), "op.add");
            // Identity: (key * a) + b == b, and key is always zero.
            let cmp = b.icmp(ICmpPred::Eq, add, Value::const_i32(b_const), "op.cmp");

            let term_pos = func.block(bb).len() - 1;
            let true_bb = func.split_block(bb, term_pos, "op.true");
            let false_bb = func.add_block("op.false");
            Builder::at_end(func, false_bb).br(true_bb);

            // Swap the split's unconditional branch for the opaque one.
            let Some(filler) = func.terminator(bb) else {
                continue;
            };
            func.erase_from_block(bb, filler);
            Builder::at_end(func, bb).cond_br(cmp, true_bb, false_bb);

            trace!(block = %func.block(bb).name, a, b = b_const, "inserted opaque predicate");
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
        name: "EnterpriseOpaquePredicate",
        version: "1.0",
        placement: Placement::PipelineEnd,
        required: true,
        build: || PassKind::Function(Box::new(OpaquePredicatePass)),
    }
}

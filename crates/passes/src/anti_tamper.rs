//! Anti-tampering: self-hashing code checks.
//!
//! One canonical function's first 64 code bytes are FNV-1a hashed at startup
//! into `obf.expected_hash`; every protected function recomputes the hash in
//! its prologue and traps on mismatch. Patching the canonical target's
//! machine code (breakpoint bytes included) changes the hash and kills the
//! process at the next protected call.
//!
//! The canonical target is marked no-obfuscate so the code-rewriting passes
//! that run later leave its bytes alone, keeping every check consistent.
//! This pass still runs after the other pipeline-start passes; composing it
//! earlier would bake their instrumentation out of the baseline.

use crate::pass::{ModulePass, PassContext, PassError, PassKind, Preserved, is_obf_name};
use crate::registry::{PassInfo, Placement};
use tracing::debug;
use veil_ir::{
    Attribute, BlockId, Builder, CastOp, Constant, Function, FunctionId, GlobalVariable,
    ICmpPred, Linkage, Module, Type, Value,
};

pub const HASH_GLOBAL: &str = "obf.expected_hash";
pub const INIT_FN: &str = "obf.tamper_init";

/// FNV-1a offset basis, as a 32-bit pattern.
pub const FNV_BASIS: i64 = 0x811C_9DC5;
/// FNV-1a prime.
pub const FNV_PRIME: i64 = 16_777_619;
/// How many leading code bytes participate in the hash.
pub const HASHED_PREFIX_LEN: i64 = 64;

pub struct AntiTamperingPass;

impl ModulePass for AntiTamperingPass {
    fn name(&self) -> &'static str {
        "EnterpriseAntiTampering"
    }

    fn run(
        &mut self,
        module: &mut Module,
        _cx: &mut PassContext,
    ) -> Result<Preserved, PassError> {
        // The hash global marks an already-protected module.
        if module.global_by_name(HASH_GLOBAL).is_some() {
            return Ok(Preserved::All);
        }

        let targets: Vec<FunctionId> = module
            .function_ids()
            .into_iter()
            .filter(|&fid| {
                let f = module.function(fid);
                !f.is_declaration() && !is_obf_name(f.name())
            })
            .collect();
        let Some(&canonical) = targets.first() else {
            return Ok(Preserved::All);
        };
        // Freeze the measured function: later code-rewriting passes skip it,
        // so the baseline stays valid.
        module.function_mut(canonical).attrs.add(Attribute::NoObfuscate);

        let expected = module.add_global(GlobalVariable::new(
            HASH_GLOBAL,
            Type::i32(),
            Linkage::Private,
            false,
            Some(Constant::i32(0)),
        ));
        let trap = module.declare_intrinsic("llvm.trap", Type::func(vec![], Type::Void));

        // Startup constructor: measure the baseline.
        let mut init = Function::new(INIT_FN, Type::func(vec![], Type::Void), Linkage::Internal);
        let entry = init.add_block("entry");
        let (baseline, init_end) = emit_hash_loop(&mut init, Value::Func(canonical), entry);
        let mut b = Builder::at_end(&mut init, init_end);
        b.store_volatile(baseline, Value::Global(expected));
        b.ret(None);
        let init_id = module.add_function(init);
        module.append_to_ctors(0, init_id);

        // Prologue check in every protected function.
        for fid in &targets {
            let func = module.function_mut(*fid);
            let Some(entry) = func.entry() else {
                continue;
            };
            let at = func.prologue_insertion_point(entry);
            let cont = func.split_block(entry, at, "tamper.cont");
            let Some(filler) = func.terminator(entry) else {
                continue;
            };
            func.erase_from_block(entry, filler);

            let (recomputed, end) = emit_hash_loop(func, Value::Func(canonical), entry);

            let trap_bb = func.add_block("tamper.trap");
            let mut b = Builder::at_end(func, trap_bb);
            b.call(trap, Type::func(vec![], Type::Void), vec![], "");
            b.unreachable();

            let mut b = Builder::at_end(func, end);
            let stored = b.load_volatile(Type::i32(), Value::Global(expected), "");
            let valid = b.icmp(ICmpPred::Eq, recomputed, stored, "");
            b.cond_br(valid, cont, trap_bb);
        }

        debug!(protected = targets.len(), "installed tamper checks");
        Ok(Preserved::None)
    }
}

/// Emit the 64-byte FNV-1a loop over `target`'s code, starting from
/// `start` (which must not yet be terminated). Returns the final
/// accumulator and the loop-exit block.
fn emit_hash_loop(func: &mut Function, target: Value, start: BlockId) -> (Value, BlockId) {
    let header = func.add_block("hash.loop");
    let end = func.add_block("hash.end");

    Builder::at_end(func, start).br(header);

    let mut b = Builder::at_end(func, header);
    let i = b.phi(Type::i32(), "hash.i");
    let acc = b.phi(Type::i32(), "hash.val");
    let code = b.cast(CastOp::PtrCast, target, Type::Ptr, "");
    let byte_ptr = b.gep(Type::i8(), code, vec![Value::Inst(i)], "");
    let byte = b.load_volatile(Type::i8(), byte_ptr, "");
    let wide = b.zext(byte, Type::i32(), "");
    let mixed = b.xor(Value::Inst(acc), wide, "");
    let folded = b.mul(mixed, Value::const_i32(FNV_PRIME), "");
    let next = b.add(Value::Inst(i), Value::const_i32(1), "");
    let more = b.icmp(
        ICmpPred::Slt,
        next.clone(),
        Value::const_i32(HASHED_PREFIX_LEN),
        "",
    );
    b.cond_br(more, header, end);

    func.add_phi_incoming(i, Value::const_i32(0), start);
    func.add_phi_incoming(i, next, header);
    func.add_phi_incoming(acc, Value::const_i32(FNV_BASIS), start);
    func.add_phi_incoming(acc, folded.clone(), header);

    (folded, end)
}

pub fn plugin_info() -> PassInfo {
    PassInfo {
        name: "EnterpriseAntiTampering",
        version: "1.0",
        placement: Placement::PipelineStart,
        required: true,
        build: || PassKind::Module(Box::new(AntiTamperingPass)),
    }
}

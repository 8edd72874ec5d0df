//! Anti-debugging instrumentation.
//!
//! Two independent layers:
//!
//! 1. A startup constructor asks the OS whether a debugger is attached —
//!    `IsDebuggerPresent` on Windows, `ptrace` elsewhere (request 31,
//!    deny-attach, on macOS; 0, trace-me, on other POSIX systems, where a
//!    -1 result reveals an existing tracer) — and executes the trap
//!    intrinsic when one is.
//! 2. Randomly chosen basic blocks read the cycle counter at their head and
//!    again at their tail. Normal execution spends a few hundred cycles in
//!    a block; a human single-stepping spends billions, so a difference
//!    above `0x0FFFFFFF` trips a trap.

use crate::pass::{ModulePass, PassContext, PassError, PassKind, Preserved, is_obf_name};
use crate::registry::{PassInfo, Placement};
use tracing::debug;
use veil_ir::{
    Attribute, Builder, Function, FunctionId, ICmpPred, Linkage, Module, Type, Value,
};

pub const INIT_FN: &str = "obf.anti_debug_init";

/// Cycle budget for one basic block; anything slower is a stepping human.
pub const CYCLE_THRESHOLD: i64 = 0x0FFF_FFFF;

/// `PT_DENY_ATTACH`: refuse future tracers.
const PTRACE_DENY_ATTACH: i64 = 31;
/// `PTRACE_TRACEME`: fails with -1 when a tracer is already attached.
const PTRACE_TRACEME: i64 = 0;

pub struct AntiDebuggingPass;

impl ModulePass for AntiDebuggingPass {
    fn name(&self) -> &'static str {
        "EnterpriseAntiDebugging"
    }

    fn run(
        &mut self,
        module: &mut Module,
        cx: &mut PassContext,
    ) -> Result<Preserved, PassError> {
        let triple = module.parsed_triple();
        if !triple.is_windows() && !triple.is_posix() {
            return Err(PassError::TripleUnsupported(module.triple().to_string()));
        }

        let trap = module.declare_intrinsic("llvm.trap", Type::func(vec![], Type::Void));
        let trap_ty = Type::func(vec![], Type::Void);
        let mut modified = false;

        // Constructor trap, once per module.
        if module.function_by_name(INIT_FN).is_none() {
            let probe = if triple.is_windows() {
                module.declare_function("IsDebuggerPresent", Type::func(vec![], Type::i32()))
            } else {
                module.declare_function(
                    "ptrace",
                    Type::func(
                        vec![Type::i32(), Type::i32(), Type::Ptr, Type::Ptr],
                        Type::i64(),
                    ),
                )
            };

            let mut init = Function::new(INIT_FN, Type::func(vec![], Type::Void), Linkage::Internal);
            init.attrs.add(Attribute::NoInline);
            init.attrs.add(Attribute::OptimizeNone);
            let entry = init.add_block("entry");
            let trap_bb = init.add_block("trap");
            let ret_bb = init.add_block("ret");

            let mut b = Builder::at_end(&mut init, trap_bb);
            b.call(trap, trap_ty.clone(), vec![], "");
            b.unreachable();

            Builder::at_end(&mut init, ret_bb).ret(None);

            let mut b = Builder::at_end(&mut init, entry);
            if triple.is_windows() {
                let present = b.call(probe, Type::func(vec![], Type::i32()), vec![], "");
                let hit = b.icmp(ICmpPred::Ne, present, Value::const_i32(0), "");
                b.cond_br(hit, trap_bb, ret_bb);
            } else {
                let request = if triple.is_macos() {
                    PTRACE_DENY_ATTACH
                } else {
                    PTRACE_TRACEME
                };
                let result = b.call(
                    probe,
                    Type::func(
                        vec![Type::i32(), Type::i32(), Type::Ptr, Type::Ptr],
                        Type::i64(),
                    ),
                    vec![
                        Value::const_i32(request),
                        Value::const_i32(0),
                        Value::null_ptr(),
                        Value::null_ptr(),
                    ],
                    "",
                );
                // -1 means a tracer already owns this process.
                let traced = b.icmp(ICmpPred::Eq, result, Value::const_i64(-1), "");
                b.cond_br(traced, trap_bb, ret_bb);
            }

            let init_id = module.add_function(init);
            module.append_to_ctors(0, init_id);
            modified = true;
        }

        // Timing traps.
        let cycle =
            module.declare_intrinsic("llvm.readcyclecounter", Type::func(vec![], Type::i64()));
        let cycle_ty = Type::func(vec![], Type::i64());
        let mut traps = 0usize;
        for fid in module.function_ids() {
            if module.function(fid).is_declaration() || is_obf_name(module.function(fid).name()) {
                continue;
            }
            traps += instrument_timing(module, fid, trap, &trap_ty, cycle, &cycle_ty, cx);
        }
        if traps > 0 {
            modified = true;
        }

        debug!(timing_traps = traps, "anti-debug instrumentation complete");
        Ok(if modified {
            Preserved::None
        } else {
            Preserved::All
        })
    }
}

fn instrument_timing(
    module: &mut Module,
    fid: FunctionId,
    trap: FunctionId,
    trap_ty: &Type,
    cycle: FunctionId,
    cycle_ty: &Type,
    cx: &mut PassContext,
) -> usize {
    let func = module.function_mut(fid);
    let mut traps = 0;
    for bb in func.block_ids() {
        if cx.rng.int_in_range(1, 100) > cx.timing_trap_percent {
            continue;
        }
        // Re-instrumenting a trap's own blocks only piles junk on junk.
        let bname = func.block(bb).name.clone();
        if bname == "time_cont" || bname == "time_trap" {
            continue;
        }
        let Some(term) = func.terminator(bb) else {
            continue;
        };
        let first = func.first_insertion_point(bb);
        let term_pos = func.block(bb).insts().iter().position(|&i| i == term);
        if term_pos == Some(first) {
            // Nothing between head and terminator to measure.
            continue;
        }

        let mut b = Builder::before(func, bb, first);
        let start = b.call(cycle, cycle_ty.clone(), vec![], "");

        let term_pos = func.block(bb).len() - 1;
        let mut b = Builder::before(func, bb, term_pos);
        let end = b.call(cycle, cycle_ty.clone(), vec![], "");
        let spent = b.sub(end, start, "");
        let stepping = b.icmp(
            ICmpPred::Ugt,
            spent,
            Value::const_i64(CYCLE_THRESHOLD),
            "",
        );

        let cont = func.split_block(bb, func.block(bb).len() - 1, "time_cont");
        let trap_bb = func.add_block("time_trap");
        let mut b = Builder::at_end(func, trap_bb);
        b.call(trap, trap_ty.clone(), vec![], "");
        b.unreachable();

        let Some(filler) = func.terminator(bb) else {
            continue;
        };
        func.erase_from_block(bb, filler);
        Builder::at_end(func, bb).cond_br(stepping, trap_bb, cont);
        traps += 1;
    }
    traps
}

pub fn plugin_info() -> PassInfo {
    PassInfo {
        name: "EnterpriseAntiDebugging",
        version: "1.0",
        placement: Placement::PipelineStart,
        required: true,
        build: || PassKind::Module(Box::new(AntiDebuggingPass)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ObfConfig;
    use veil_ir::{Callee, InstKind, Interp, Rv, verify};

    fn cx_with(percent: u32) -> PassContext {
        PassContext::new(
            &ObfConfig::new()
                .with_seed(17)
                .with_timing_trap_percent(percent),
        )
    }

    fn work_module(triple: &str) -> Module {
        let mut m = Module::new("t", triple);
        let mut f = Function::new(
            "work",
            Type::func(vec![Type::i32()], Type::i32()),
            Linkage::External,
        );
        let entry = f.add_block("entry");
        let mut b = Builder::at_end(&mut f, entry);
        let x = b.add(Value::Arg(0), Value::const_i32(2), "x");
        let y = b.mul(x, Value::const_i32(3), "y");
        b.ret(Some(y));
        m.add_function(f);
        m
    }

    #[test]
    fn test_macos_ctor_uses_deny_attach() {
        let mut m = work_module("arm64-apple-macosx14.0.0");
        AntiDebuggingPass.run(&mut m, &mut cx_with(0)).unwrap();

        let init = m.function_by_name(INIT_FN).expect("init exists");
        assert!(m.ctors().iter().any(|c| c.func == init));

        let func = m.function(init);
        let entry = func.entry().unwrap();
        let ptrace = m.function_by_name("ptrace").unwrap();
        let call = func
            .block(entry)
            .insts()
            .iter()
            .find_map(|&id| match &func.inst(id).kind {
                InstKind::Call {
                    callee: Callee::Direct(t),
                    args,
                    ..
                } if *t == ptrace => Some(args.clone()),
                _ => None,
            })
            .expect("ptrace call in entry");
        assert_eq!(call[0], Value::const_i32(31));
        assert_eq!(call[1], Value::const_i32(0));
        assert_eq!(verify(&m), Ok(()));
    }

    #[test]
    fn test_linux_ctor_uses_traceme() {
        let mut m = work_module("x86_64-unknown-linux-gnu");
        AntiDebuggingPass.run(&mut m, &mut cx_with(0)).unwrap();
        let init = m.function_by_name(INIT_FN).unwrap();
        let func = m.function(init);
        let entry = func.entry().unwrap();
        let ptrace = m.function_by_name("ptrace").unwrap();
        let args = func
            .block(entry)
            .insts()
            .iter()
            .find_map(|&id| match &func.inst(id).kind {
                InstKind::Call {
                    callee: Callee::Direct(t),
                    args,
                    ..
                } if *t == ptrace => Some(args.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(args[0], Value::const_i32(0));
    }

    #[test]
    fn test_windows_ctor_uses_isdebuggerpresent() {
        let mut m = work_module("x86_64-pc-windows-msvc");
        AntiDebuggingPass.run(&mut m, &mut cx_with(0)).unwrap();
        assert!(m.function_by_name("IsDebuggerPresent").is_some());
        assert!(m.function_by_name("ptrace").is_none());
    }

    #[test]
    fn test_clean_run_does_not_trap() {
        let mut m = work_module("x86_64-unknown-linux-gnu");
        AntiDebuggingPass.run(&mut m, &mut cx_with(100)).unwrap();

        let mut interp = Interp::new(&m);
        interp.run_ctors().unwrap();
        assert_eq!(
            interp.call("work", &[Rv::int(32, 5)]).unwrap(),
            Some(Rv::int(32, 21))
        );
    }

    #[test]
    fn test_full_probability_instruments_blocks() {
        let mut m = work_module("x86_64-unknown-linux-gnu");
        AntiDebuggingPass.run(&mut m, &mut cx_with(100)).unwrap();
        let fid = m.function_by_name("work").unwrap();
        let func = m.function(fid);
        let names: Vec<&str> = func
            .layout()
            .iter()
            .map(|&bb| func.block(bb).name.as_str())
            .collect();
        assert!(names.contains(&"time_cont"));
        assert!(names.contains(&"time_trap"));
        assert_eq!(verify(&m), Ok(()));
    }

    #[test]
    fn test_zero_probability_leaves_bodies_alone() {
        let mut m = work_module("x86_64-unknown-linux-gnu");
        AntiDebuggingPass.run(&mut m, &mut cx_with(0)).unwrap();
        let fid = m.function_by_name("work").unwrap();
        assert_eq!(m.function(fid).layout().len(), 1);
    }

    #[test]
    fn test_unsupported_triple_is_fatal() {
        let mut m = work_module("wasm32-unknown-unknown");
        assert!(matches!(
            AntiDebuggingPass.run(&mut m, &mut cx_with(20)),
            Err(PassError::TripleUnsupported(_))
        ));
    }

    #[test]
    fn test_second_application_keeps_one_ctor() {
        let mut m = work_module("x86_64-unknown-linux-gnu");
        AntiDebuggingPass.run(&mut m, &mut cx_with(0)).unwrap();
        AntiDebuggingPass.run(&mut m, &mut cx_with(0)).unwrap();
        assert_eq!(m.ctors().len(), 1);
    }
}

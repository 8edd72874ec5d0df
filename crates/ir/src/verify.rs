//! IR verifier.
//!
//! Runs after every transformation. Catches the invariant violations that
//! downstream code generation cannot tolerate: missing or misplaced
//! terminators, phis off the block head, stack allocations outside the entry
//! block, branches to nowhere, and SSA uses whose definitions do not
//! dominate them.

use crate::dom::DomTree;
use crate::function::Function;
use crate::instruction::{InstKind, Value};
use crate::module::Module;
use crate::types::{BlockId, InstId};
use std::collections::{HashMap, HashSet};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    DuplicateFunctionName(String),
    DuplicateGlobalName(String),
    CtorNotDefined { func: String },
    EntryHasPredecessors { func: String },
    EmptyBlock { func: String, block: String },
    MissingTerminator { func: String, block: String },
    TerminatorNotAtEnd { func: String, block: String },
    PhiNotAtHead { func: String, block: String },
    AllocaOutsideEntry { func: String, block: String },
    BadBranchTarget { func: String, block: String },
    EmptyIndirectDests { func: String, block: String },
    BadBlockAddress { func: String, block: String },
    PhiIncomingMismatch { func: String, block: String },
    UseOfDetachedValue { func: String, block: String, value: String },
    UseDoesNotDominate { func: String, block: String, value: String },
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyError::DuplicateFunctionName(name) => {
                write!(f, "duplicate function name '{}'", name)
            }
            VerifyError::DuplicateGlobalName(name) => {
                write!(f, "duplicate global name '{}'", name)
            }
            VerifyError::CtorNotDefined { func } => {
                write!(f, "global constructor '{}' has no definition", func)
            }
            VerifyError::EntryHasPredecessors { func } => {
                write!(f, "{}: entry block has predecessors", func)
            }
            VerifyError::EmptyBlock { func, block } => {
                write!(f, "{}: block '{}' is empty", func, block)
            }
            VerifyError::MissingTerminator { func, block } => {
                write!(f, "{}: block '{}' does not end in a terminator", func, block)
            }
            VerifyError::TerminatorNotAtEnd { func, block } => {
                write!(f, "{}: block '{}' has a terminator before its end", func, block)
            }
            VerifyError::PhiNotAtHead { func, block } => {
                write!(f, "{}: block '{}' has a phi after a non-phi", func, block)
            }
            VerifyError::AllocaOutsideEntry { func, block } => {
                write!(f, "{}: alloca outside the entry block (in '{}')", func, block)
            }
            VerifyError::BadBranchTarget { func, block } => {
                write!(f, "{}: branch in '{}' targets a block not in layout", func, block)
            }
            VerifyError::EmptyIndirectDests { func, block } => {
                write!(f, "{}: indirectbr in '{}' has no destinations", func, block)
            }
            VerifyError::BadBlockAddress { func, block } => {
                write!(f, "{}: blockaddress in '{}' references a block not in layout", func, block)
            }
            VerifyError::PhiIncomingMismatch { func, block } => {
                write!(f, "{}: phi incoming list in '{}' disagrees with predecessors", func, block)
            }
            VerifyError::UseOfDetachedValue { func, block, value } => {
                write!(f, "{}: '{}' in '{}' uses a detached instruction", func, value, block)
            }
            VerifyError::UseDoesNotDominate { func, block, value } => {
                write!(f, "{}: use of '{}' in '{}' is not dominated by its definition", func, value, block)
            }
        }
    }
}

impl std::error::Error for VerifyError {}

/// Verify a whole module. The first violation found is returned.
pub fn verify(module: &Module) -> Result<(), VerifyError> {
    let mut fn_names = HashSet::new();
    for (_, func) in module.functions() {
        if !fn_names.insert(func.name().to_string()) {
            return Err(VerifyError::DuplicateFunctionName(func.name().to_string()));
        }
    }
    let mut gv_names = HashSet::new();
    for (_, global) in module.globals() {
        if !gv_names.insert(global.name.clone()) {
            return Err(VerifyError::DuplicateGlobalName(global.name.clone()));
        }
    }
    for ctor in module.ctors() {
        let func = module.function(ctor.func);
        if func.is_declaration() {
            return Err(VerifyError::CtorNotDefined {
                func: func.name().to_string(),
            });
        }
    }
    for (_, func) in module.functions() {
        if !func.is_declaration() {
            verify_function(func)?;
        }
    }
    Ok(())
}

/// Verify one function body.
pub fn verify_function(func: &Function) -> Result<(), VerifyError> {
    let name = func.name().to_string();
    let entry = match func.entry() {
        Some(entry) => entry,
        None => return Ok(()),
    };
    if !func.preds(entry).is_empty() {
        return Err(VerifyError::EntryHasPredecessors { func: name });
    }
    let err = |e: fn(String, String) -> VerifyError, block: &str| e(name.clone(), block.to_string());

    let in_layout: HashSet<BlockId> = func.layout().iter().copied().collect();
    let mut defs: HashMap<InstId, (BlockId, usize)> = HashMap::new();

    for &bb in func.layout() {
        let block = func.block(bb);
        let bname = block.name.clone();
        if block.is_empty() {
            return Err(err(mk_empty, &bname));
        }
        let mut seen_non_phi = false;
        for (pos, &id) in block.insts().iter().enumerate() {
            defs.insert(id, (bb, pos));
            let kind = &func.inst(id).kind;
            let last = pos + 1 == block.len();
            if kind.is_terminator() && !last {
                return Err(err(mk_term_mid, &bname));
            }
            if !kind.is_terminator() && last {
                return Err(err(mk_term_missing, &bname));
            }
            if kind.is_phi() {
                if seen_non_phi {
                    return Err(err(mk_phi_head, &bname));
                }
            } else {
                seen_non_phi = true;
            }
            if kind.is_alloca() && bb != entry {
                return Err(err(mk_alloca, &bname));
            }
            for succ in kind.successors() {
                if !in_layout.contains(&succ) {
                    return Err(err(mk_bad_target, &bname));
                }
            }
            if let InstKind::IndirectBr { dests, .. } = kind {
                if dests.is_empty() {
                    return Err(err(mk_empty_dests, &bname));
                }
            }
            for value in kind.values() {
                if let Value::BlockAddress(target) = value {
                    if !in_layout.contains(target) {
                        return Err(err(mk_bad_blockaddr, &bname));
                    }
                }
            }
        }
    }

    let dom = DomTree::compute(func);
    verify_phis(func, &dom)?;
    verify_dominance(func, &dom, &defs)?;
    Ok(())
}

fn verify_phis(func: &Function, dom: &DomTree) -> Result<(), VerifyError> {
    for &bb in func.layout() {
        if !dom.is_reachable(bb) {
            continue;
        }
        let preds = func.preds(bb);
        for &id in func.block(bb).insts() {
            let InstKind::Phi { incoming } = &func.inst(id).kind else {
                continue;
            };
            let mut seen: Vec<BlockId> = Vec::new();
            for (_, pred) in incoming {
                if !preds.contains(pred) || seen.contains(pred) {
                    return Err(VerifyError::PhiIncomingMismatch {
                        func: func.name().to_string(),
                        block: func.block(bb).name.clone(),
                    });
                }
                seen.push(*pred);
            }
            if seen.len() != preds.len() {
                return Err(VerifyError::PhiIncomingMismatch {
                    func: func.name().to_string(),
                    block: func.block(bb).name.clone(),
                });
            }
        }
    }
    Ok(())
}

fn verify_dominance(
    func: &Function,
    dom: &DomTree,
    defs: &HashMap<InstId, (BlockId, usize)>,
) -> Result<(), VerifyError> {
    for &bb in func.layout() {
        if !dom.is_reachable(bb) {
            continue;
        }
        for (use_pos, &id) in func.block(bb).insts().iter().enumerate() {
            let inst = func.inst(id);
            if let InstKind::Phi { incoming } = &inst.kind {
                for (value, pred) in incoming {
                    check_operand(func, dom, defs, value, *pred, usize::MAX, true)?;
                }
            } else {
                for value in inst.kind.values() {
                    check_operand(func, dom, defs, value, bb, use_pos, false)?;
                }
            }
        }
    }
    Ok(())
}

fn check_operand(
    func: &Function,
    dom: &DomTree,
    defs: &HashMap<InstId, (BlockId, usize)>,
    value: &Value,
    use_block: BlockId,
    use_pos: usize,
    via_phi: bool,
) -> Result<(), VerifyError> {
    let Value::Inst(def_id) = value else {
        return Ok(());
    };
    let def = func.inst(*def_id);
    let Some(&(def_block, def_pos)) = defs.get(def_id) else {
        return Err(VerifyError::UseOfDetachedValue {
            func: func.name().to_string(),
            block: func.block(use_block).name.clone(),
            value: def.name.clone(),
        });
    };
    // Stack slots are memory, not SSA dataflow; their addresses may be used
    // anywhere in the function.
    if def.kind.is_alloca() {
        return Ok(());
    }
    if !dom.is_reachable(use_block) {
        return Ok(());
    }
    let ok = if via_phi {
        // The definition must be available on the edge, i.e. dominate the
        // incoming block's exit.
        dom.dominates(def_block, use_block)
    } else if def_block == use_block {
        def_pos < use_pos
    } else {
        dom.dominates(def_block, use_block)
    };
    if ok {
        Ok(())
    } else {
        Err(VerifyError::UseDoesNotDominate {
            func: func.name().to_string(),
            block: func.block(use_block).name.clone(),
            value: def.name.clone(),
        })
    }
}

fn mk_empty(func: String, block: String) -> VerifyError {
    VerifyError::EmptyBlock { func, block }
}
fn mk_term_mid(func: String, block: String) -> VerifyError {
    VerifyError::TerminatorNotAtEnd { func, block }
}
fn mk_term_missing(func: String, block: String) -> VerifyError {
    VerifyError::MissingTerminator { func, block }
}
fn mk_phi_head(func: String, block: String) -> VerifyError {
    VerifyError::PhiNotAtHead { func, block }
}
fn mk_alloca(func: String, block: String) -> VerifyError {
    VerifyError::AllocaOutsideEntry { func, block }
}
fn mk_bad_target(func: String, block: String) -> VerifyError {
    VerifyError::BadBranchTarget { func, block }
}
fn mk_empty_dests(func: String, block: String) -> VerifyError {
    VerifyError::EmptyIndirectDests { func, block }
}
fn mk_bad_blockaddr(func: String, block: String) -> VerifyError {
    VerifyError::BadBlockAddress { func, block }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Builder;
    use crate::instruction::{ICmpPred, Instruction};
    use crate::module::{Linkage, Module};
    use crate::types::Type;

    fn module_with(func: Function) -> Module {
        let mut m = Module::new("t", "x86_64-unknown-linux-gnu");
        m.add_function(func);
        m
    }

    fn valid_diamond() -> Function {
        let mut f = Function::new(
            "f",
            Type::func(vec![Type::i32()], Type::i32()),
            Linkage::External,
        );
        let entry = f.add_block("entry");
        let a = f.add_block("a");
        let b = f.add_block("b");
        let mut bld = Builder::at_end(&mut f, entry);
        let c = bld.icmp(ICmpPred::Slt, Value::Arg(0), Value::const_i32(0), "c");
        bld.cond_br(c, a, b);
        let mut bld = Builder::at_end(&mut f, a);
        let v = bld.add(Value::Arg(0), Value::const_i32(1), "v");
        bld.ret(Some(v));
        let mut bld = Builder::at_end(&mut f, b);
        let w = bld.sub(Value::Arg(0), Value::const_i32(1), "w");
        bld.ret(Some(w));
        f
    }

    #[test]
    fn test_accepts_valid_function() {
        assert_eq!(verify(&module_with(valid_diamond())), Ok(()));
    }

    #[test]
    fn test_rejects_missing_terminator() {
        let mut f = Function::new("f", Type::func(vec![], Type::Void), Linkage::Internal);
        let entry = f.add_block("entry");
        let mut bld = Builder::at_end(&mut f, entry);
        bld.add(Value::const_i32(1), Value::const_i32(2), "x");
        assert!(matches!(
            verify(&module_with(f)),
            Err(VerifyError::MissingTerminator { .. })
        ));
        let _ = entry;
    }

    #[test]
    fn test_rejects_alloca_outside_entry() {
        let mut f = Function::new("f", Type::func(vec![], Type::Void), Linkage::Internal);
        let entry = f.add_block("entry");
        let next = f.add_block("next");
        Builder::at_end(&mut f, entry).br(next);
        let mut bld = Builder::at_end(&mut f, next);
        bld.alloca(Type::i32(), "x");
        bld.ret(None);
        assert!(matches!(
            verify(&module_with(f)),
            Err(VerifyError::AllocaOutsideEntry { .. })
        ));
    }

    #[test]
    fn test_rejects_cross_block_use_without_dominance() {
        let mut f = Function::new(
            "f",
            Type::func(vec![Type::i32()], Type::Void),
            Linkage::Internal,
        );
        let entry = f.add_block("entry");
        let a = f.add_block("a");
        let b = f.add_block("b");
        let mut bld = Builder::at_end(&mut f, entry);
        let c = bld.icmp(ICmpPred::Eq, Value::Arg(0), Value::const_i32(0), "c");
        bld.cond_br(c, a, b);
        let mut bld = Builder::at_end(&mut f, a);
        let v = bld.add(Value::Arg(0), Value::const_i32(1), "v");
        bld.br(b);
        // `v` is defined in `a` but `b` is reachable without passing through it.
        let mut bld = Builder::at_end(&mut f, b);
        let _ = bld.add(v, Value::const_i32(1), "broken");
        bld.ret(None);
        // `b` has two preds; no phi, so the dominance check fires.
        assert!(matches!(
            verify(&module_with(f)),
            Err(VerifyError::UseDoesNotDominate { .. })
        ));
    }

    #[test]
    fn test_rejects_use_of_detached_inst() {
        let mut f = Function::new("f", Type::func(vec![], Type::Void), Linkage::Internal);
        let entry = f.add_block("entry");
        let mut bld = Builder::at_end(&mut f, entry);
        let v = bld.add(Value::const_i32(1), Value::const_i32(2), "v");
        let _ = bld.add(v.clone(), Value::const_i32(3), "w");
        bld.ret(None);
        let id = v.as_inst().unwrap();
        f.erase_from_block(entry, id);
        assert!(matches!(
            verify(&module_with(f)),
            Err(VerifyError::UseOfDetachedValue { .. })
        ));
    }

    #[test]
    fn test_rejects_ctor_without_definition() {
        let mut m = Module::new("t", "x86_64-unknown-linux-gnu");
        let f = m.declare_function("ctor", Type::func(vec![], Type::Void));
        m.append_to_ctors(0, f);
        assert!(matches!(
            verify(&m),
            Err(VerifyError::CtorNotDefined { .. })
        ));
    }

    #[test]
    fn test_phi_incoming_must_match_preds() {
        let mut f = Function::new("f", Type::func(vec![], Type::Void), Linkage::Internal);
        let entry = f.add_block("entry");
        let join = f.add_block("join");
        Builder::at_end(&mut f, entry).br(join);
        let phi = f.new_inst(Instruction::new(
            InstKind::Phi {
                incoming: vec![(Value::const_i32(0), entry), (Value::const_i32(1), entry)],
            },
            Type::i32(),
            "p",
        ));
        f.push_inst(join, phi);
        let ret = f.new_inst(Instruction::new(InstKind::Ret { value: None }, Type::Void, ""));
        f.push_inst(join, ret);
        assert!(matches!(
            verify(&module_with(f)),
            Err(VerifyError::PhiIncomingMismatch { .. })
        ));
    }
}

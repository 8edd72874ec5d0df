//! SSA demotion utilities.
//!
//! Rewrites register dataflow into stack traffic: a phi or instruction
//! result becomes an entry-block slot written at each definition point and
//! reloaded at each use. Transformations that destroy dominance (dispatcher
//! loops) run these first so no register value crosses a block boundary.

use crate::function::Function;
use crate::instruction::{InstKind, Instruction, Value};
use crate::types::{BlockId, InstId, Type};

/// Allocate a slot at the top of the entry block.
fn make_slot(func: &mut Function, ty: Type, name: &str) -> Option<InstId> {
    let entry = func.entry()?;
    let at = func.prologue_insertion_point(entry);
    let slot = func.new_inst(Instruction::new(InstKind::Alloca { ty }, Type::Ptr, name));
    func.insert_inst(entry, at, slot);
    Some(slot)
}

fn store_before_terminator(func: &mut Function, bb: BlockId, value: Value, slot: InstId) {
    let at = func.block(bb).len().saturating_sub(1);
    let store = func.new_inst(Instruction::new(
        InstKind::Store {
            value,
            ptr: Value::Inst(slot),
            volatile: false,
        },
        Type::Void,
        "",
    ));
    func.insert_inst(bb, at, store);
}

/// Demote a phi to a stack slot: stores on every incoming edge, one reload
/// where the phi stood. Returns the new slot.
pub fn demote_phi_to_stack(func: &mut Function, phi: InstId) -> Option<InstId> {
    func.find_inst(phi)?;
    let (ty, incoming) = match &func.inst(phi).kind {
        InstKind::Phi { incoming } => (func.inst(phi).ty.clone(), incoming.clone()),
        _ => return None,
    };
    let hint = func.inst(phi).name.clone();
    let slot = make_slot(func, ty.clone(), &format!("{}.addr", hint))?;

    for (value, pred) in incoming {
        store_before_terminator(func, pred, value, slot);
    }

    let (bb, pos) = func.find_inst(phi)?;
    let reload = func.new_inst(Instruction::new(
        InstKind::Load {
            ty: ty.clone(),
            ptr: Value::Inst(slot),
            volatile: false,
        },
        ty,
        &format!("{}.reload", hint),
    ));
    func.insert_inst(bb, pos + 1, reload);

    func.replace_all_uses(&Value::Inst(phi), &Value::Inst(reload));
    func.erase_from_block(bb, phi);
    Some(slot)
}

/// Demote an instruction result to a stack slot: one store after the
/// definition, a reload before every use. Returns the new slot.
pub fn demote_reg_to_stack(func: &mut Function, inst: InstId) -> Option<InstId> {
    func.find_inst(inst)?;
    let ty = func.inst(inst).ty.clone();
    if ty.is_void() {
        return None;
    }
    let hint = func.inst(inst).name.clone();
    let slot = make_slot(func, ty.clone(), &format!("{}.addr", hint))?;

    let (def_bb, def_pos) = func.find_inst(inst)?;
    let store = func.new_inst(Instruction::new(
        InstKind::Store {
            value: Value::Inst(inst),
            ptr: Value::Inst(slot),
            volatile: false,
        },
        Type::Void,
        "",
    ));
    func.insert_inst(def_bb, def_pos + 1, store);

    // Every other user reloads from the slot at its own position.
    let users = collect_users(func, inst, store);
    for user in users {
        rewrite_user(func, inst, slot, &ty, &hint, user);
    }
    Some(slot)
}

fn collect_users(func: &Function, inst: InstId, skip: InstId) -> Vec<InstId> {
    let mut users = Vec::new();
    for &bb in func.layout() {
        for &id in func.block(bb).insts() {
            if id == skip || id == inst {
                continue;
            }
            let uses_it = func
                .inst(id)
                .kind
                .values()
                .into_iter()
                .any(|v| *v == Value::Inst(inst));
            if uses_it && !users.contains(&id) {
                users.push(id);
            }
        }
    }
    users
}

fn rewrite_user(
    func: &mut Function,
    inst: InstId,
    slot: InstId,
    ty: &Type,
    hint: &str,
    user: InstId,
) {
    if let InstKind::Phi { incoming } = &func.inst(user).kind {
        // A phi use is really a use on the incoming edge; reload at the end
        // of the incoming block.
        let edges: Vec<BlockId> = incoming
            .iter()
            .filter(|(v, _)| *v == Value::Inst(inst))
            .map(|(_, pred)| *pred)
            .collect();
        for pred in edges {
            let reload = func.new_inst(Instruction::new(
                InstKind::Load {
                    ty: ty.clone(),
                    ptr: Value::Inst(slot),
                    volatile: false,
                },
                ty.clone(),
                &format!("{}.reload", hint),
            ));
            let at = func.block(pred).len().saturating_sub(1);
            func.insert_inst(pred, at, reload);
            if let InstKind::Phi { incoming } = &mut func.inst_mut(user).kind {
                for (v, p) in incoming.iter_mut() {
                    if *p == pred && *v == Value::Inst(inst) {
                        *v = Value::Inst(reload);
                    }
                }
            }
        }
        return;
    }

    let Some((ubb, upos)) = func.find_inst(user) else {
        return;
    };
    let reload = func.new_inst(Instruction::new(
        InstKind::Load {
            ty: ty.clone(),
            ptr: Value::Inst(slot),
            volatile: false,
        },
        ty.clone(),
        &format!("{}.reload", hint),
    ));
    func.insert_inst(ubb, upos, reload);
    for v in func.inst_mut(user).kind.values_mut() {
        if *v == Value::Inst(inst) {
            *v = Value::Inst(reload);
        }
    }
}

/// Non-alloca instructions whose result is used outside the defining block.
/// The dispatcher transformation demotes these until the list is empty.
pub fn cross_block_value_uses(func: &Function) -> Vec<InstId> {
    let mut out = Vec::new();
    for &bb in func.layout() {
        for &id in func.block(bb).insts() {
            if func.inst(id).kind.is_alloca() {
                continue;
            }
            let escapes = func.layout().iter().any(|&other| {
                other != bb
                    && func.block(other).insts().iter().any(|&u| {
                        func.inst(u)
                            .kind
                            .values()
                            .into_iter()
                            .any(|v| *v == Value::Inst(id))
                    })
            });
            if escapes && !out.contains(&id) {
                out.push(id);
            }
        }
    }
    out
}

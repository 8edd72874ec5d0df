//! Instructions and operand values.
//!
//! An [`Instruction`] is a kind plus a result type and an optional name hint
//! (used by the printer). Operands are [`Value`]s: cheap, copyable references
//! to instruction results, function arguments, constants, globals, functions,
//! or block addresses.

use crate::types::{BlockId, Constant, FunctionId, GlobalId, InstId, Type};

/// An operand. Equality is structural, which is what use-replacement needs.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// The result of an instruction in the same function.
    Inst(InstId),
    /// The n-th formal argument of the enclosing function.
    Arg(usize),
    Const(Constant),
    Global(GlobalId),
    Func(FunctionId),
    /// First-class address of a basic block in the same function, usable as
    /// an indirect-branch destination.
    BlockAddress(BlockId),
}

impl Value {
    pub fn const_i8(v: u8) -> Value {
        Value::Const(Constant::i8(v))
    }

    pub fn const_i32(v: i64) -> Value {
        Value::Const(Constant::i32(v))
    }

    pub fn const_i64(v: i64) -> Value {
        Value::Const(Constant::i64(v))
    }

    pub fn null_ptr() -> Value {
        Value::Const(Constant::NullPtr)
    }

    pub fn as_inst(&self) -> Option<InstId> {
        match self {
            Value::Inst(id) => Some(*id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOpKind {
    Add,
    Sub,
    Mul,
    Xor,
}

impl BinOpKind {
    pub fn mnemonic(self) -> &'static str {
        match self {
            BinOpKind::Add => "add",
            BinOpKind::Sub => "sub",
            BinOpKind::Mul => "mul",
            BinOpKind::Xor => "xor",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ICmpPred {
    Eq,
    Ne,
    /// Signed less-than.
    Slt,
    /// Unsigned greater-than.
    Ugt,
}

impl ICmpPred {
    pub fn mnemonic(self) -> &'static str {
        match self {
            ICmpPred::Eq => "eq",
            ICmpPred::Ne => "ne",
            ICmpPred::Slt => "slt",
            ICmpPred::Ugt => "ugt",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastOp {
    IntToPtr,
    PtrToInt,
    ZExt,
    /// Pointer-to-pointer cast; a no-op under opaque pointers but kept so
    /// emitted code reads like the clang output it is hiding among.
    PtrCast,
}

impl CastOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            CastOp::IntToPtr => "inttoptr",
            CastOp::PtrToInt => "ptrtoint",
            CastOp::ZExt => "zext",
            CastOp::PtrCast => "bitcast",
        }
    }
}

/// Callee of a call instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Callee {
    Direct(FunctionId),
    /// Call through a runtime pointer value.
    Indirect(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstKind {
    /// Stack allocation. Only legal in the entry block.
    Alloca { ty: Type },
    Load {
        ty: Type,
        ptr: Value,
        volatile: bool,
    },
    Store {
        value: Value,
        ptr: Value,
        volatile: bool,
    },
    /// `getelementptr` address arithmetic rooted at `base_ty`.
    Gep {
        base_ty: Type,
        ptr: Value,
        indices: Vec<Value>,
    },
    BinOp {
        op: BinOpKind,
        lhs: Value,
        rhs: Value,
    },
    ICmp {
        pred: ICmpPred,
        lhs: Value,
        rhs: Value,
    },
    Select {
        cond: Value,
        if_true: Value,
        if_false: Value,
    },
    Phi {
        incoming: Vec<(Value, BlockId)>,
    },
    Call {
        callee: Callee,
        fn_ty: Type,
        args: Vec<Value>,
    },
    Cast {
        op: CastOp,
        value: Value,
        to: Type,
    },
    // Terminators.
    Br { dest: BlockId },
    CondBr {
        cond: Value,
        if_true: BlockId,
        if_false: BlockId,
    },
    IndirectBr {
        addr: Value,
        dests: Vec<BlockId>,
    },
    Switch {
        cond: Value,
        default: BlockId,
        cases: Vec<(i64, BlockId)>,
    },
    Ret { value: Option<Value> },
    Resume,
    Unreachable,
}

impl InstKind {
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            InstKind::Br { .. }
                | InstKind::CondBr { .. }
                | InstKind::IndirectBr { .. }
                | InstKind::Switch { .. }
                | InstKind::Ret { .. }
                | InstKind::Resume
                | InstKind::Unreachable
        )
    }

    pub fn is_phi(&self) -> bool {
        matches!(self, InstKind::Phi { .. })
    }

    pub fn is_alloca(&self) -> bool {
        matches!(self, InstKind::Alloca { .. })
    }

    /// Control-flow successors, in branch order.
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            InstKind::Br { dest } => vec![*dest],
            InstKind::CondBr {
                if_true, if_false, ..
            } => vec![*if_true, *if_false],
            InstKind::IndirectBr { dests, .. } => dests.clone(),
            InstKind::Switch { default, cases, .. } => {
                let mut out = vec![*default];
                out.extend(cases.iter().map(|(_, bb)| *bb));
                out
            }
            _ => Vec::new(),
        }
    }

    /// Visit every operand value immutably.
    pub fn values(&self) -> Vec<&Value> {
        match self {
            InstKind::Alloca { .. }
            | InstKind::Br { .. }
            | InstKind::Resume
            | InstKind::Unreachable => Vec::new(),
            InstKind::Load { ptr, .. } => vec![ptr],
            InstKind::Store { value, ptr, .. } => vec![value, ptr],
            InstKind::Gep { ptr, indices, .. } => {
                let mut out = vec![ptr];
                out.extend(indices.iter());
                out
            }
            InstKind::BinOp { lhs, rhs, .. } | InstKind::ICmp { lhs, rhs, .. } => vec![lhs, rhs],
            InstKind::Select {
                cond,
                if_true,
                if_false,
            } => vec![cond, if_true, if_false],
            InstKind::Phi { incoming } => incoming.iter().map(|(v, _)| v).collect(),
            InstKind::Call { callee, args, .. } => {
                let mut out = Vec::with_capacity(args.len() + 1);
                if let Callee::Indirect(ptr) = callee {
                    out.push(ptr);
                }
                out.extend(args.iter());
                out
            }
            InstKind::Cast { value, .. } => vec![value],
            InstKind::CondBr { cond, .. } => vec![cond],
            InstKind::IndirectBr { addr, .. } => vec![addr],
            InstKind::Switch { cond, .. } => vec![cond],
            InstKind::Ret { value } => value.iter().collect(),
        }
    }

    /// Visit every operand value mutably.
    pub fn values_mut(&mut self) -> Vec<&mut Value> {
        match self {
            InstKind::Alloca { .. }
            | InstKind::Br { .. }
            | InstKind::Resume
            | InstKind::Unreachable => Vec::new(),
            InstKind::Load { ptr, .. } => vec![ptr],
            InstKind::Store { value, ptr, .. } => vec![value, ptr],
            InstKind::Gep { ptr, indices, .. } => {
                let mut out = vec![ptr];
                out.extend(indices.iter_mut());
                out
            }
            InstKind::BinOp { lhs, rhs, .. } | InstKind::ICmp { lhs, rhs, .. } => vec![lhs, rhs],
            InstKind::Select {
                cond,
                if_true,
                if_false,
            } => vec![cond, if_true, if_false],
            InstKind::Phi { incoming } => incoming.iter_mut().map(|(v, _)| v).collect(),
            InstKind::Call { callee, args, .. } => {
                let mut out = Vec::with_capacity(args.len() + 1);
                if let Callee::Indirect(ptr) = callee {
                    out.push(ptr);
                }
                out.extend(args.iter_mut());
                out
            }
            InstKind::Cast { value, .. } => vec![value],
            InstKind::CondBr { cond, .. } => vec![cond],
            InstKind::IndirectBr { addr, .. } => vec![addr],
            InstKind::Switch { cond, .. } => vec![cond],
            InstKind::Ret { value } => value.iter_mut().collect(),
        }
    }
}

/// One instruction: a kind, a result type (`Void` when the instruction
/// produces no value), and a printer name hint.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub kind: InstKind,
    pub ty: Type,
    pub name: String,
}

impl Instruction {
    pub fn new(kind: InstKind, ty: Type, name: impl Into<String>) -> Instruction {
        Instruction {
            kind,
            ty,
            name: name.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminator_classification() {
        assert!(InstKind::Br { dest: BlockId(0) }.is_terminator());
        assert!(InstKind::Ret { value: None }.is_terminator());
        assert!(InstKind::Unreachable.is_terminator());
        assert!(!InstKind::Alloca { ty: Type::i32() }.is_terminator());
    }

    #[test]
    fn test_successors() {
        let br = InstKind::CondBr {
            cond: Value::const_i32(1),
            if_true: BlockId(1),
            if_false: BlockId(2),
        };
        assert_eq!(br.successors(), vec![BlockId(1), BlockId(2)]);

        let ind = InstKind::IndirectBr {
            addr: Value::null_ptr(),
            dests: vec![BlockId(3), BlockId(4)],
        };
        assert_eq!(ind.successors(), vec![BlockId(3), BlockId(4)]);
    }

    #[test]
    fn test_operand_visit() {
        let mut store = InstKind::Store {
            value: Value::Inst(InstId(7)),
            ptr: Value::Global(GlobalId(0)),
            volatile: true,
        };
        assert_eq!(store.values().len(), 2);
        for v in store.values_mut() {
            if *v == Value::Inst(InstId(7)) {
                *v = Value::Inst(InstId(9));
            }
        }
        assert_eq!(*store.values()[0], Value::Inst(InstId(9)));
    }

    #[test]
    fn test_indirect_call_operands() {
        let call = InstKind::Call {
            callee: Callee::Indirect(Value::Inst(InstId(1))),
            fn_ty: Type::func(vec![Type::i32()], Type::i32()),
            args: vec![Value::Arg(0)],
        };
        // Callee pointer counts as an operand alongside the argument list.
        assert_eq!(call.values().len(), 2);
    }
}

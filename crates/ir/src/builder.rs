//! Instruction builder.
//!
//! A [`Builder`] is an explicit cursor into one function: a block plus an
//! index. Every emitter inserts at the cursor, advances it, and returns the
//! result [`Value`]. There is no shared or global insert-point state; two
//! builders on different functions are fully independent.

use crate::function::Function;
use crate::instruction::{
    BinOpKind, Callee, CastOp, ICmpPred, InstKind, Instruction, Value,
};
use crate::types::{BlockId, FunctionId, InstId, Type};

pub struct Builder<'f> {
    func: &'f mut Function,
    block: BlockId,
    index: usize,
}

impl<'f> Builder<'f> {
    /// Position the cursor after the last instruction of `block`.
    pub fn at_end(func: &'f mut Function, block: BlockId) -> Builder<'f> {
        let index = func.block(block).len();
        Builder { func, block, index }
    }

    /// Position the cursor before the instruction at `index`.
    pub fn before(func: &'f mut Function, block: BlockId, index: usize) -> Builder<'f> {
        Builder { func, block, index }
    }

    /// Position the cursor just before the block terminator.
    pub fn before_terminator(func: &'f mut Function, block: BlockId) -> Builder<'f> {
        let index = func.block(block).len().saturating_sub(1);
        Builder { func, block, index }
    }

    pub fn block(&self) -> BlockId {
        self.block
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn func(&mut self) -> &mut Function {
        self.func
    }

    fn insert(&mut self, kind: InstKind, ty: Type, name: &str) -> InstId {
        let id = self.func.new_inst(Instruction::new(kind, ty, name));
        self.func.insert_inst(self.block, self.index, id);
        self.index += 1;
        id
    }

    fn value_ty(&self, value: &Value) -> Type {
        self.func.value_type(value).unwrap_or(Type::i32())
    }

    // ---- memory ----

    pub fn alloca(&mut self, ty: Type, name: &str) -> Value {
        Value::Inst(self.insert(InstKind::Alloca { ty }, Type::Ptr, name))
    }

    pub fn load(&mut self, ty: Type, ptr: Value, name: &str) -> Value {
        let id = self.insert(
            InstKind::Load {
                ty: ty.clone(),
                ptr,
                volatile: false,
            },
            ty,
            name,
        );
        Value::Inst(id)
    }

    pub fn load_volatile(&mut self, ty: Type, ptr: Value, name: &str) -> Value {
        let id = self.insert(
            InstKind::Load {
                ty: ty.clone(),
                ptr,
                volatile: true,
            },
            ty,
            name,
        );
        Value::Inst(id)
    }

    pub fn store(&mut self, value: Value, ptr: Value) {
        self.insert(
            InstKind::Store {
                value,
                ptr,
                volatile: false,
            },
            Type::Void,
            "",
        );
    }

    pub fn store_volatile(&mut self, value: Value, ptr: Value) {
        self.insert(
            InstKind::Store {
                value,
                ptr,
                volatile: true,
            },
            Type::Void,
            "",
        );
    }

    pub fn gep(&mut self, base_ty: Type, ptr: Value, indices: Vec<Value>, name: &str) -> Value {
        Value::Inst(self.insert(
            InstKind::Gep {
                base_ty,
                ptr,
                indices,
            },
            Type::Ptr,
            name,
        ))
    }

    // ---- arithmetic ----

    pub fn binop(&mut self, op: BinOpKind, lhs: Value, rhs: Value, name: &str) -> Value {
        let ty = self.value_ty(&lhs);
        Value::Inst(self.insert(InstKind::BinOp { op, lhs, rhs }, ty, name))
    }

    pub fn add(&mut self, lhs: Value, rhs: Value, name: &str) -> Value {
        self.binop(BinOpKind::Add, lhs, rhs, name)
    }

    pub fn sub(&mut self, lhs: Value, rhs: Value, name: &str) -> Value {
        self.binop(BinOpKind::Sub, lhs, rhs, name)
    }

    pub fn mul(&mut self, lhs: Value, rhs: Value, name: &str) -> Value {
        self.binop(BinOpKind::Mul, lhs, rhs, name)
    }

    pub fn xor(&mut self, lhs: Value, rhs: Value, name: &str) -> Value {
        self.binop(BinOpKind::Xor, lhs, rhs, name)
    }

    pub fn icmp(&mut self, pred: ICmpPred, lhs: Value, rhs: Value, name: &str) -> Value {
        Value::Inst(self.insert(InstKind::ICmp { pred, lhs, rhs }, Type::i1(), name))
    }

    pub fn select(&mut self, cond: Value, if_true: Value, if_false: Value, name: &str) -> Value {
        let ty = self.value_ty(&if_true);
        Value::Inst(self.insert(
            InstKind::Select {
                cond,
                if_true,
                if_false,
            },
            ty,
            name,
        ))
    }

    /// Create a phi with an empty incoming list; fill it in with
    /// [`Function::add_phi_incoming`].
    pub fn phi(&mut self, ty: Type, name: &str) -> InstId {
        self.insert(
            InstKind::Phi {
                incoming: Vec::new(),
            },
            ty,
            name,
        )
    }

    // ---- calls and casts ----

    pub fn call(&mut self, callee: FunctionId, fn_ty: Type, args: Vec<Value>, name: &str) -> Value {
        let ret = Self::ret_of(&fn_ty);
        Value::Inst(self.insert(
            InstKind::Call {
                callee: Callee::Direct(callee),
                fn_ty,
                args,
            },
            ret,
            name,
        ))
    }

    pub fn call_indirect(&mut self, ptr: Value, fn_ty: Type, args: Vec<Value>, name: &str) -> Value {
        let ret = Self::ret_of(&fn_ty);
        Value::Inst(self.insert(
            InstKind::Call {
                callee: Callee::Indirect(ptr),
                fn_ty,
                args,
            },
            ret,
            name,
        ))
    }

    fn ret_of(fn_ty: &Type) -> Type {
        match fn_ty {
            Type::Func { ret, .. } => (**ret).clone(),
            _ => Type::Void,
        }
    }

    pub fn cast(&mut self, op: CastOp, value: Value, to: Type, name: &str) -> Value {
        Value::Inst(self.insert(
            InstKind::Cast {
                op,
                value,
                to: to.clone(),
            },
            to,
            name,
        ))
    }

    pub fn zext(&mut self, value: Value, to: Type, name: &str) -> Value {
        self.cast(CastOp::ZExt, value, to, name)
    }

    pub fn int_to_ptr(&mut self, value: Value, name: &str) -> Value {
        self.cast(CastOp::IntToPtr, value, Type::Ptr, name)
    }

    pub fn ptr_cast(&mut self, value: Value, name: &str) -> Value {
        self.cast(CastOp::PtrCast, value, Type::Ptr, name)
    }

    // ---- terminators ----

    pub fn br(&mut self, dest: BlockId) {
        self.insert(InstKind::Br { dest }, Type::Void, "");
    }

    pub fn cond_br(&mut self, cond: Value, if_true: BlockId, if_false: BlockId) {
        self.insert(
            InstKind::CondBr {
                cond,
                if_true,
                if_false,
            },
            Type::Void,
            "",
        );
    }

    pub fn indirect_br(&mut self, addr: Value, dests: Vec<BlockId>) {
        self.insert(InstKind::IndirectBr { addr, dests }, Type::Void, "");
    }

    pub fn switch(&mut self, cond: Value, default: BlockId, cases: Vec<(i64, BlockId)>) {
        self.insert(
            InstKind::Switch {
                cond,
                default,
                cases,
            },
            Type::Void,
            "",
        );
    }

    pub fn ret(&mut self, value: Option<Value>) {
        self.insert(InstKind::Ret { value }, Type::Void, "");
    }

    pub fn unreachable(&mut self) {
        self.insert(InstKind::Unreachable, Type::Void, "");
    }

    pub fn resume(&mut self) {
        self.insert(InstKind::Resume, Type::Void, "");
    }
}

//! IR interpreter.
//!
//! Executes a module directly so transformation tests can check behavior,
//! not just structure: run the global constructors, call a function, compare
//! observable results against the untransformed program.
//!
//! Pointers carry provenance (global + offset, stack slot, function code,
//! block address) so indirect branches, indirect calls, and byte-wise global
//! rewrites all behave. Two host details are synthesized:
//!
//! - Function "code bytes" are derived deterministically from the function
//!   name, so code-hashing loops see the same bytes at init and check time.
//! - The cycle counter is the interpreter's instruction counter, so timing
//!   windows measured across a basic block stay tiny.
//!
//! Known externals (`dlsym`, `GetProcAddress`, `ptrace`, ...) are modeled
//! in-process; anything else dispatches to caller-registered hooks.

use crate::function::Function;
use crate::instruction::{BinOpKind, Callee, CastOp, ICmpPred, InstKind, Value};
use crate::module::Module;
use crate::types::{BlockId, Constant, FunctionId, GlobalId, InstId, Type};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum EvalError {
    /// The trap intrinsic executed.
    Trapped,
    UnreachableExecuted,
    OutOfFuel,
    NoSuchFunction(String),
    UnknownExtern(String),
    BadIr(String),
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::Trapped => write!(f, "trap intrinsic executed"),
            EvalError::UnreachableExecuted => write!(f, "unreachable executed"),
            EvalError::OutOfFuel => write!(f, "execution exceeded fuel budget"),
            EvalError::NoSuchFunction(name) => write!(f, "no function named '{}'", name),
            EvalError::UnknownExtern(name) => {
                write!(f, "call to unmodeled external '{}'", name)
            }
            EvalError::BadIr(msg) => write!(f, "malformed IR at runtime: {}", msg),
        }
    }
}

impl std::error::Error for EvalError {}

/// A runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Rv {
    Int { bits: u32, value: i64 },
    Ptr(PtrValue),
}

impl Rv {
    pub fn int(bits: u32, value: i64) -> Rv {
        Rv::Int {
            bits,
            value: norm(bits, value),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Rv::Int { value, .. } => Some(*value),
            Rv::Ptr(_) => None,
        }
    }
}

/// Pointer provenance.
#[derive(Debug, Clone, PartialEq)]
pub enum PtrValue {
    Null,
    Raw(i64),
    Global { id: GlobalId, offset: i64 },
    Slot { frame: usize, slot: usize },
    Code { func: FunctionId, offset: i64 },
    Block { func: FunctionId, block: BlockId },
}

enum GlobalCell {
    Bytes(Vec<u8>),
    Int { bits: u32, value: i64 },
    External,
}

struct Frame {
    args: Vec<Rv>,
    values: HashMap<InstId, Rv>,
    slots: Vec<Option<Rv>>,
}

type ExternHook<'m> = Box<dyn FnMut(&[Rv]) -> Rv + 'm>;

pub struct Interp<'m> {
    module: &'m Module,
    globals: Vec<GlobalCell>,
    frames: Vec<Frame>,
    steps: u64,
    fuel: u64,
    externs: HashMap<String, ExternHook<'m>>,
}

const DEFAULT_FUEL: u64 = 2_000_000;

impl<'m> Interp<'m> {
    pub fn new(module: &'m Module) -> Interp<'m> {
        let globals = module
            .globals()
            .map(|(_, g)| match &g.initializer {
                Some(Constant::Bytes(bytes)) => GlobalCell::Bytes(bytes.clone()),
                Some(Constant::Int { bits, value }) => GlobalCell::Int {
                    bits: *bits,
                    value: norm(*bits, *value),
                },
                Some(Constant::Zero(ty)) => match ty {
                    Type::Int(bits) => GlobalCell::Int {
                        bits: *bits,
                        value: 0,
                    },
                    Type::Array { len, .. } => GlobalCell::Bytes(vec![0; *len as usize]),
                    _ => GlobalCell::External,
                },
                Some(Constant::NullPtr) | None => GlobalCell::External,
            })
            .collect();
        Interp {
            module,
            globals,
            frames: Vec::new(),
            steps: 0,
            fuel: DEFAULT_FUEL,
            externs: HashMap::new(),
        }
    }

    /// Register a hook for an external symbol the interpreter does not model.
    pub fn with_extern(
        mut self,
        name: &str,
        hook: impl FnMut(&[Rv]) -> Rv + 'm,
    ) -> Interp<'m> {
        self.externs.insert(name.to_string(), Box::new(hook));
        self
    }

    pub fn set_fuel(&mut self, fuel: u64) {
        self.fuel = fuel;
    }

    /// Run all registered global constructors in ascending priority order.
    pub fn run_ctors(&mut self) -> Result<(), EvalError> {
        let mut ctors = self.module.ctors().to_vec();
        ctors.sort_by_key(|c| c.priority);
        for ctor in ctors {
            self.run_function(ctor.func, Vec::new())?;
        }
        Ok(())
    }

    /// Call a function by name.
    pub fn call(&mut self, name: &str, args: &[Rv]) -> Result<Option<Rv>, EvalError> {
        let fid = self
            .module
            .function_by_name(name)
            .ok_or_else(|| EvalError::NoSuchFunction(name.to_string()))?;
        self.run_function(fid, args.to_vec())
    }

    /// Current contents of a byte-array global. Test helper.
    pub fn global_bytes(&self, name: &str) -> Option<&[u8]> {
        let id = self.module.global_by_name(name)?;
        match &self.globals[id.index()] {
            GlobalCell::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Current value of an integer global. Test helper.
    pub fn global_int(&self, name: &str) -> Option<i64> {
        let id = self.module.global_by_name(name)?;
        match &self.globals[id.index()] {
            GlobalCell::Int { value, .. } => Some(*value),
            _ => None,
        }
    }

    fn burn(&mut self) -> Result<(), EvalError> {
        self.steps += 1;
        if self.steps > self.fuel {
            return Err(EvalError::OutOfFuel);
        }
        Ok(())
    }

    fn run_function(
        &mut self,
        fid: FunctionId,
        args: Vec<Rv>,
    ) -> Result<Option<Rv>, EvalError> {
        let module = self.module;
        let func = module.function(fid);
        if func.is_declaration() {
            return self.call_extern(func.name(), &args);
        }

        let fi = self.frames.len();
        self.frames.push(Frame {
            args,
            values: HashMap::new(),
            slots: Vec::new(),
        });

        let mut cur = func
            .entry()
            .ok_or_else(|| EvalError::BadIr("function has no entry".into()))?;
        let mut prev: Option<BlockId> = None;

        loop {
            let insts = func.block(cur).insts().to_vec();

            // Phis read the state of the previous iteration atomically.
            let mut pos = 0;
            let mut phi_updates: Vec<(InstId, Rv)> = Vec::new();
            while pos < insts.len() {
                let id = insts[pos];
                let InstKind::Phi { incoming } = &func.inst(id).kind else {
                    break;
                };
                self.burn()?;
                let prev_bb = prev.ok_or_else(|| {
                    EvalError::BadIr("phi executed with no predecessor".into())
                })?;
                let (value, _) = incoming
                    .iter()
                    .find(|(_, bb)| *bb == prev_bb)
                    .ok_or_else(|| EvalError::BadIr("phi has no matching incoming".into()))?;
                let rv = self.eval(fi, fid, func, value)?;
                phi_updates.push((id, rv));
                pos += 1;
            }
            for (id, rv) in phi_updates {
                self.frames[fi].values.insert(id, rv);
            }

            let mut next: Option<BlockId> = None;
            let mut returned: Option<Option<Rv>> = None;
            for &id in &insts[pos..] {
                self.burn()?;
                let inst = func.inst(id);
                match &inst.kind {
                    InstKind::Phi { .. } => {
                        return Err(EvalError::BadIr("phi after non-phi".into()));
                    }
                    InstKind::Alloca { .. } => {
                        let slot = self.frames[fi].slots.len();
                        self.frames[fi].slots.push(None);
                        self.frames[fi]
                            .values
                            .insert(id, Rv::Ptr(PtrValue::Slot { frame: fi, slot }));
                    }
                    InstKind::Load { ty, ptr, .. } => {
                        let ptr = self.eval_ptr(fi, fid, func, ptr)?;
                        let rv = self.load_from(ty, &ptr)?;
                        self.frames[fi].values.insert(id, rv);
                    }
                    InstKind::Store { value, ptr, .. } => {
                        let rv = self.eval(fi, fid, func, value)?;
                        let ptr = self.eval_ptr(fi, fid, func, ptr)?;
                        self.store_to(&ptr, rv)?;
                    }
                    InstKind::Gep {
                        base_ty,
                        ptr,
                        indices,
                    } => {
                        let rv = self.eval_gep(fi, fid, func, base_ty, ptr, indices)?;
                        self.frames[fi].values.insert(id, Rv::Ptr(rv));
                    }
                    InstKind::BinOp { op, lhs, rhs } => {
                        let l = self.eval_int(fi, fid, func, lhs)?;
                        let r = self.eval_int(fi, fid, func, rhs)?;
                        let bits = int_bits(&inst.ty);
                        let raw = match op {
                            BinOpKind::Add => l.wrapping_add(r),
                            BinOpKind::Sub => l.wrapping_sub(r),
                            BinOpKind::Mul => l.wrapping_mul(r),
                            BinOpKind::Xor => l ^ r,
                        };
                        self.frames[fi].values.insert(id, Rv::int(bits, raw));
                    }
                    InstKind::ICmp { pred, lhs, rhs } => {
                        let l = self.eval(fi, fid, func, lhs)?;
                        let r = self.eval(fi, fid, func, rhs)?;
                        let res = compare(*pred, &l, &r)?;
                        self.frames[fi].values.insert(id, Rv::int(1, i64::from(res)));
                    }
                    InstKind::Select {
                        cond,
                        if_true,
                        if_false,
                    } => {
                        let c = self.eval_int(fi, fid, func, cond)?;
                        let rv = if c != 0 {
                            self.eval(fi, fid, func, if_true)?
                        } else {
                            self.eval(fi, fid, func, if_false)?
                        };
                        self.frames[fi].values.insert(id, rv);
                    }
                    InstKind::Cast { op, value, to } => {
                        let rv = self.eval(fi, fid, func, value)?;
                        let rv = cast(*op, rv, to)?;
                        self.frames[fi].values.insert(id, rv);
                    }
                    InstKind::Call {
                        callee,
                        args: call_args,
                        ..
                    } => {
                        let mut argv = Vec::with_capacity(call_args.len());
                        for a in call_args {
                            argv.push(self.eval(fi, fid, func, a)?);
                        }
                        let result = match callee {
                            Callee::Direct(target) => self.run_function(*target, argv)?,
                            Callee::Indirect(ptr) => {
                                let ptr = self.eval_ptr(fi, fid, func, ptr)?;
                                let PtrValue::Code { func: target, offset: 0 } = ptr else {
                                    return Err(EvalError::BadIr(
                                        "indirect call through a non-code pointer".into(),
                                    ));
                                };
                                self.run_function(target, argv)?
                            }
                        };
                        if !inst.ty.is_void() {
                            let rv = result.ok_or_else(|| {
                                EvalError::BadIr("call expected a return value".into())
                            })?;
                            self.frames[fi].values.insert(id, rv);
                        }
                    }
                    InstKind::Br { dest } => next = Some(*dest),
                    InstKind::CondBr {
                        cond,
                        if_true,
                        if_false,
                    } => {
                        let c = self.eval_int(fi, fid, func, cond)?;
                        next = Some(if c != 0 { *if_true } else { *if_false });
                    }
                    InstKind::IndirectBr { addr, .. } => {
                        let ptr = self.eval_ptr(fi, fid, func, addr)?;
                        let PtrValue::Block { func: bfid, block } = ptr else {
                            return Err(EvalError::BadIr(
                                "indirectbr through a non-block pointer".into(),
                            ));
                        };
                        if bfid != fid {
                            return Err(EvalError::BadIr(
                                "indirectbr into another function".into(),
                            ));
                        }
                        next = Some(block);
                    }
                    InstKind::Switch {
                        cond,
                        default,
                        cases,
                    } => {
                        let c = self.eval_int(fi, fid, func, cond)?;
                        next = Some(
                            cases
                                .iter()
                                .find(|(v, _)| *v == c)
                                .map(|(_, bb)| *bb)
                                .unwrap_or(*default),
                        );
                    }
                    InstKind::Ret { value } => {
                        returned = Some(match value {
                            Some(v) => Some(self.eval(fi, fid, func, v)?),
                            None => None,
                        });
                    }
                    InstKind::Resume => {
                        return Err(EvalError::BadIr("resume outside exception state".into()));
                    }
                    InstKind::Unreachable => return Err(EvalError::UnreachableExecuted),
                }
                if next.is_some() || returned.is_some() {
                    break;
                }
            }

            if let Some(result) = returned {
                return Ok(result);
            }
            let n = next.ok_or_else(|| EvalError::BadIr("block fell through".into()))?;
            prev = Some(cur);
            cur = n;
        }
    }

    fn eval(
        &self,
        fi: usize,
        fid: FunctionId,
        func: &Function,
        value: &Value,
    ) -> Result<Rv, EvalError> {
        match value {
            Value::Inst(id) => self.frames[fi]
                .values
                .get(id)
                .cloned()
                .ok_or_else(|| EvalError::BadIr(format!("use of unevaluated %{}", func.inst(*id).name))),
            Value::Arg(i) => self.frames[fi]
                .args
                .get(*i)
                .cloned()
                .ok_or_else(|| EvalError::BadIr(format!("argument {} out of range", i))),
            Value::Const(c) => const_rv(c),
            Value::Global(id) => Ok(Rv::Ptr(PtrValue::Global {
                id: *id,
                offset: 0,
            })),
            Value::Func(target) => Ok(Rv::Ptr(PtrValue::Code {
                func: *target,
                offset: 0,
            })),
            Value::BlockAddress(bb) => Ok(Rv::Ptr(PtrValue::Block {
                func: fid,
                block: *bb,
            })),
        }
    }

    fn eval_ptr(
        &self,
        fi: usize,
        fid: FunctionId,
        func: &Function,
        value: &Value,
    ) -> Result<PtrValue, EvalError> {
        match self.eval(fi, fid, func, value)? {
            Rv::Ptr(p) => Ok(p),
            Rv::Int { .. } => Err(EvalError::BadIr("integer used as pointer".into())),
        }
    }

    fn eval_int(
        &self,
        fi: usize,
        fid: FunctionId,
        func: &Function,
        value: &Value,
    ) -> Result<i64, EvalError> {
        match self.eval(fi, fid, func, value)? {
            Rv::Int { value, .. } => Ok(value),
            Rv::Ptr(_) => Err(EvalError::BadIr("pointer used as integer".into())),
        }
    }

    fn eval_gep(
        &self,
        fi: usize,
        fid: FunctionId,
        func: &Function,
        base_ty: &Type,
        ptr: &Value,
        indices: &[Value],
    ) -> Result<PtrValue, EvalError> {
        let base = self.eval_ptr(fi, fid, func, ptr)?;
        let mut delta: i64 = 0;
        let mut cur_ty = base_ty.clone();
        for (k, idx) in indices.iter().enumerate() {
            let i = self.eval_int(fi, fid, func, idx)?;
            if k == 0 {
                let size = cur_ty
                    .size_in_bytes()
                    .ok_or_else(|| EvalError::BadIr("gep through unsized type".into()))?;
                delta += i * size as i64;
            } else {
                match cur_ty.clone() {
                    Type::Array { elem, .. } => {
                        let size = elem
                            .size_in_bytes()
                            .ok_or_else(|| EvalError::BadIr("gep through unsized elem".into()))?;
                        delta += i * size as i64;
                        cur_ty = *elem;
                    }
                    _ => return Err(EvalError::BadIr("gep walks into a scalar".into())),
                }
            }
        }
        match base {
            PtrValue::Global { id, offset } => Ok(PtrValue::Global {
                id,
                offset: offset + delta,
            }),
            PtrValue::Code { func, offset } => Ok(PtrValue::Code {
                func,
                offset: offset + delta,
            }),
            PtrValue::Slot { frame, slot } if delta == 0 => Ok(PtrValue::Slot { frame, slot }),
            _ => Err(EvalError::BadIr("gep on unsupported pointer".into())),
        }
    }

    fn load_from(&mut self, ty: &Type, ptr: &PtrValue) -> Result<Rv, EvalError> {
        match ptr {
            PtrValue::Global { id, offset } => match &self.globals[id.index()] {
                GlobalCell::Bytes(bytes) => {
                    if !ty.is_int(8) {
                        return Err(EvalError::BadIr(
                            "non-byte load from byte-array global".into(),
                        ));
                    }
                    let byte = *bytes
                        .get(*offset as usize)
                        .ok_or_else(|| EvalError::BadIr("global load out of bounds".into()))?;
                    Ok(Rv::int(8, i64::from(byte)))
                }
                GlobalCell::Int { bits, value } => {
                    if *offset != 0 {
                        return Err(EvalError::BadIr("offset load from scalar global".into()));
                    }
                    Ok(Rv::int(*bits, *value))
                }
                GlobalCell::External => {
                    Err(EvalError::BadIr("load from external global".into()))
                }
            },
            PtrValue::Slot { frame, slot } => self.frames[*frame].slots[*slot]
                .clone()
                .ok_or_else(|| EvalError::BadIr("load from uninitialized slot".into())),
            PtrValue::Code { func, offset } => {
                if !ty.is_int(8) {
                    return Err(EvalError::BadIr("non-byte load from code".into()));
                }
                let name = self.module.function(*func).name().to_string();
                Ok(Rv::int(8, i64::from(code_byte(&name, *offset))))
            }
            _ => Err(EvalError::BadIr("load through invalid pointer".into())),
        }
    }

    fn store_to(&mut self, ptr: &PtrValue, value: Rv) -> Result<(), EvalError> {
        match ptr {
            PtrValue::Global { id, offset } => match &mut self.globals[id.index()] {
                GlobalCell::Bytes(bytes) => {
                    let Rv::Int { value, .. } = value else {
                        return Err(EvalError::BadIr("pointer store into byte array".into()));
                    };
                    let cell = bytes
                        .get_mut(*offset as usize)
                        .ok_or_else(|| EvalError::BadIr("global store out of bounds".into()))?;
                    *cell = value as u8;
                    Ok(())
                }
                GlobalCell::Int { bits, value: cell } => {
                    let Rv::Int { value, .. } = value else {
                        return Err(EvalError::BadIr("pointer store into scalar global".into()));
                    };
                    *cell = norm(*bits, value);
                    Ok(())
                }
                GlobalCell::External => {
                    Err(EvalError::BadIr("store to external global".into()))
                }
            },
            PtrValue::Slot { frame, slot } => {
                self.frames[*frame].slots[*slot] = Some(value);
                Ok(())
            }
            PtrValue::Code { .. } => Err(EvalError::BadIr("store into code".into())),
            _ => Err(EvalError::BadIr("store through invalid pointer".into())),
        }
    }

    fn call_extern(&mut self, name: &str, args: &[Rv]) -> Result<Option<Rv>, EvalError> {
        match name {
            "llvm.trap" => Err(EvalError::Trapped),
            "llvm.readcyclecounter" => Ok(Some(Rv::int(64, self.steps as i64))),
            "ptrace" => Ok(Some(Rv::int(64, 0))),
            "IsDebuggerPresent" => Ok(Some(Rv::int(32, 0))),
            "GetModuleHandleA" | "LoadLibraryA" => Ok(Some(Rv::Ptr(PtrValue::Null))),
            "dlsym" | "GetProcAddress" => {
                let sym = args
                    .get(1)
                    .ok_or_else(|| EvalError::BadIr("resolver needs a name argument".into()))?;
                let name = self.read_cstring(sym)?;
                Ok(Some(match self.module.function_by_name(&name) {
                    Some(func) => Rv::Ptr(PtrValue::Code { func, offset: 0 }),
                    None => Rv::Ptr(PtrValue::Null),
                }))
            }
            _ => match self.externs.get_mut(name) {
                Some(hook) => Ok(Some(hook(args))),
                None => Err(EvalError::UnknownExtern(name.to_string())),
            },
        }
    }

    fn read_cstring(&self, ptr: &Rv) -> Result<String, EvalError> {
        let Rv::Ptr(PtrValue::Global { id, offset }) = ptr else {
            return Err(EvalError::BadIr("expected a pointer to string data".into()));
        };
        let GlobalCell::Bytes(bytes) = &self.globals[id.index()] else {
            return Err(EvalError::BadIr("expected byte-array string data".into()));
        };
        let start = *offset as usize;
        let end = bytes[start..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| start + p)
            .unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[start..end]).into_owned())
    }
}

/// Canonical signed form of a `bits`-wide integer.
fn norm(bits: u32, value: i64) -> i64 {
    if bits >= 64 {
        return value;
    }
    let mask = (1u64 << bits) - 1;
    let unsigned = (value as u64) & mask;
    let sign = 1u64 << (bits - 1);
    if unsigned & sign != 0 {
        (unsigned | !mask) as i64
    } else {
        unsigned as i64
    }
}

fn int_bits(ty: &Type) -> u32 {
    match ty {
        Type::Int(bits) => *bits,
        _ => 64,
    }
}

fn const_rv(c: &Constant) -> Result<Rv, EvalError> {
    match c {
        Constant::Int { bits, value } => Ok(Rv::int(*bits, *value)),
        Constant::NullPtr => Ok(Rv::Ptr(PtrValue::Null)),
        Constant::Zero(Type::Int(bits)) => Ok(Rv::int(*bits, 0)),
        Constant::Zero(Type::Ptr) => Ok(Rv::Ptr(PtrValue::Null)),
        _ => Err(EvalError::BadIr("aggregate constant used as operand".into())),
    }
}

fn compare(pred: ICmpPred, lhs: &Rv, rhs: &Rv) -> Result<bool, EvalError> {
    match (lhs, rhs) {
        (
            Rv::Int { bits, value: l },
            Rv::Int { value: r, .. },
        ) => {
            let bits = *bits;
            let (l, r) = (norm(bits, *l), norm(bits, *r));
            Ok(match pred {
                ICmpPred::Eq => l == r,
                ICmpPred::Ne => l != r,
                ICmpPred::Slt => l < r,
                ICmpPred::Ugt => {
                    let mask = if bits >= 64 {
                        u64::MAX
                    } else {
                        (1u64 << bits) - 1
                    };
                    ((l as u64) & mask) > ((r as u64) & mask)
                }
            })
        }
        (Rv::Ptr(l), Rv::Ptr(r)) => Ok(match pred {
            ICmpPred::Eq => l == r,
            ICmpPred::Ne => l != r,
            _ => return Err(EvalError::BadIr("ordered compare on pointers".into())),
        }),
        _ => Err(EvalError::BadIr("compare across value kinds".into())),
    }
}

fn cast(op: CastOp, value: Rv, to: &Type) -> Result<Rv, EvalError> {
    match op {
        CastOp::ZExt => {
            let Rv::Int { bits, value } = value else {
                return Err(EvalError::BadIr("zext of a pointer".into()));
            };
            let mask = if bits >= 64 {
                u64::MAX
            } else {
                (1u64 << bits) - 1
            };
            Ok(Rv::int(int_bits(to), ((value as u64) & mask) as i64))
        }
        CastOp::IntToPtr => {
            let Rv::Int { value, .. } = value else {
                return Err(EvalError::BadIr("inttoptr of a pointer".into()));
            };
            Ok(Rv::Ptr(if value == 0 {
                PtrValue::Null
            } else {
                PtrValue::Raw(value)
            }))
        }
        CastOp::PtrToInt => match value {
            Rv::Ptr(PtrValue::Null) => Ok(Rv::int(int_bits(to), 0)),
            Rv::Ptr(PtrValue::Raw(v)) => Ok(Rv::int(int_bits(to), v)),
            _ => Err(EvalError::BadIr("ptrtoint of structured pointer".into())),
        },
        CastOp::PtrCast => match value {
            Rv::Ptr(_) => Ok(value),
            Rv::Int { .. } => Err(EvalError::BadIr("ptrcast of an integer".into())),
        },
    }
}

/// Deterministic synthetic code byte for a function. FNV-1a over the name,
/// folded with the byte offset.
pub fn code_byte(func_name: &str, offset: i64) -> u8 {
    let mut h: u32 = 0x811C9DC5;
    for b in func_name.bytes() {
        h ^= u32::from(b);
        h = h.wrapping_mul(16777619);
    }
    h ^= offset as u32;
    h = h.wrapping_mul(16777619);
    (h >> 16) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Builder;
    use crate::module::{GlobalVariable, Linkage};

    fn add_one_module() -> Module {
        let mut m = Module::new("t", "x86_64-unknown-linux-gnu");
        let mut f = Function::new(
            "add_one",
            Type::func(vec![Type::i32()], Type::i32()),
            Linkage::External,
        );
        let entry = f.add_block("entry");
        let mut b = Builder::at_end(&mut f, entry);
        let v = b.add(Value::Arg(0), Value::const_i32(1), "v");
        b.ret(Some(v));
        m.add_function(f);
        m
    }

    #[test]
    fn test_simple_arithmetic() {
        let m = add_one_module();
        let mut interp = Interp::new(&m);
        let r = interp.call("add_one", &[Rv::int(32, 41)]).unwrap();
        assert_eq!(r, Some(Rv::int(32, 42)));
    }

    #[test]
    fn test_loop_with_phi() {
        // sum = 0; for (i = 0; i < n; i++) sum += i; return sum
        let mut m = Module::new("t", "x86_64-unknown-linux-gnu");
        let mut f = Function::new(
            "tri",
            Type::func(vec![Type::i32()], Type::i32()),
            Linkage::External,
        );
        let entry = f.add_block("entry");
        let header = f.add_block("header");
        let body = f.add_block("body");
        let exit = f.add_block("exit");

        Builder::at_end(&mut f, entry).br(header);

        let mut b = Builder::at_end(&mut f, header);
        let i = b.phi(Type::i32(), "i");
        let sum = b.phi(Type::i32(), "sum");
        let c = b.icmp(ICmpPred::Slt, Value::Inst(i), Value::Arg(0), "c");
        b.cond_br(c, body, exit);

        let mut b = Builder::at_end(&mut f, body);
        let sum2 = b.add(Value::Inst(sum), Value::Inst(i), "sum2");
        let i2 = b.add(Value::Inst(i), Value::const_i32(1), "i2");
        b.br(header);

        let mut b = Builder::at_end(&mut f, exit);
        b.ret(Some(Value::Inst(sum)));

        f.add_phi_incoming(i, Value::const_i32(0), entry);
        f.add_phi_incoming(i, i2, body);
        f.add_phi_incoming(sum, Value::const_i32(0), entry);
        f.add_phi_incoming(sum, sum2, body);
        m.add_function(f);

        let mut interp = Interp::new(&m);
        let r = interp.call("tri", &[Rv::int(32, 5)]).unwrap();
        assert_eq!(r, Some(Rv::int(32, 10)));
    }

    #[test]
    fn test_global_byte_mutation() {
        let mut m = Module::new("t", "x86_64-unknown-linux-gnu");
        let g = m.add_global(GlobalVariable::new(
            "buf",
            Type::byte_array(2),
            Linkage::Private,
            false,
            Some(Constant::Bytes(vec![0x10, 0x20])),
        ));
        let mut f = Function::new("flip", Type::func(vec![], Type::Void), Linkage::External);
        let entry = f.add_block("entry");
        let mut b = Builder::at_end(&mut f, entry);
        let p = b.gep(
            Type::byte_array(2),
            Value::Global(g),
            vec![Value::const_i64(0), Value::const_i64(1)],
            "p",
        );
        let v = b.load_volatile(Type::i8(), p.clone(), "v");
        let x = b.xor(v, Value::const_i8(0xFF), "x");
        b.store_volatile(x, p);
        b.ret(None);
        m.add_function(f);

        let mut interp = Interp::new(&m);
        interp.call("flip", &[]).unwrap();
        assert_eq!(interp.global_bytes("buf"), Some(&[0x10, 0xDF][..]));
    }

    #[test]
    fn test_trap_intrinsic_propagates() {
        let mut m = Module::new("t", "x86_64-unknown-linux-gnu");
        let trap = m.declare_intrinsic("llvm.trap", Type::func(vec![], Type::Void));
        let mut f = Function::new("boom", Type::func(vec![], Type::Void), Linkage::External);
        let entry = f.add_block("entry");
        let mut b = Builder::at_end(&mut f, entry);
        b.call(trap, Type::func(vec![], Type::Void), vec![], "");
        b.unreachable();
        m.add_function(f);

        let mut interp = Interp::new(&m);
        assert_eq!(interp.call("boom", &[]), Err(EvalError::Trapped));
    }

    #[test]
    fn test_ctors_run_in_priority_order() {
        let mut m = Module::new("t", "x86_64-unknown-linux-gnu");
        let g = m.add_global(GlobalVariable::new(
            "cell",
            Type::i32(),
            Linkage::Private,
            false,
            Some(Constant::i32(0)),
        ));
        // first stores 1, second stores 2; priorities force the order.
        for (name, value, priority) in [("second", 2i64, 5u16), ("first", 1, 0)] {
            let mut f = Function::new(name, Type::func(vec![], Type::Void), Linkage::Internal);
            let entry = f.add_block("entry");
            let mut b = Builder::at_end(&mut f, entry);
            b.store(Value::const_i32(value), Value::Global(g));
            b.ret(None);
            let fid = m.add_function(f);
            m.append_to_ctors(priority, fid);
        }
        let mut interp = Interp::new(&m);
        interp.run_ctors().unwrap();
        assert_eq!(interp.global_int("cell"), Some(2));
    }

    #[test]
    fn test_dlsym_resolves_module_functions() {
        let mut m = add_one_module();
        let dlsym = m.declare_function("dlsym", Type::func(vec![Type::Ptr, Type::Ptr], Type::Ptr));
        let name = m.add_global(GlobalVariable::new(
            "obf.api.add_one",
            Type::byte_array(8),
            Linkage::Private,
            true,
            Some(Constant::Bytes(b"add_one\0".to_vec())),
        ));
        let mut f = Function::new(
            "caller",
            Type::func(vec![Type::i32()], Type::i32()),
            Linkage::External,
        );
        let entry = f.add_block("entry");
        let mut b = Builder::at_end(&mut f, entry);
        let handle = b.int_to_ptr(Value::const_i64(0), "handle");
        let fnptr = b.call(
            dlsym,
            Type::func(vec![Type::Ptr, Type::Ptr], Type::Ptr),
            vec![handle, Value::Global(name)],
            "fnptr",
        );
        let r = b.call_indirect(
            fnptr,
            Type::func(vec![Type::i32()], Type::i32()),
            vec![Value::Arg(0)],
            "r",
        );
        b.ret(Some(r));
        m.add_function(f);

        let mut interp = Interp::new(&m);
        let r = interp.call("caller", &[Rv::int(32, 9)]).unwrap();
        assert_eq!(r, Some(Rv::int(32, 10)));
    }

    #[test]
    fn test_extern_hook() {
        let mut m = Module::new("t", "x86_64-unknown-linux-gnu");
        let puts = m.declare_function("puts", Type::func(vec![Type::Ptr], Type::i32()));
        let s = m.add_global(GlobalVariable::new(
            "msg",
            Type::byte_array(3),
            Linkage::Private,
            true,
            Some(Constant::Bytes(b"ok\0".to_vec())),
        ));
        let mut f = Function::new("say", Type::func(vec![], Type::Void), Linkage::External);
        let entry = f.add_block("entry");
        let mut b = Builder::at_end(&mut f, entry);
        b.call(
            puts,
            Type::func(vec![Type::Ptr], Type::i32()),
            vec![Value::Global(s)],
            "",
        );
        b.ret(None);
        m.add_function(f);

        use std::cell::Cell;
        let called = Cell::new(0);
        {
            let mut interp =
                Interp::new(&m).with_extern("puts", |_| {
                    called.set(called.get() + 1);
                    Rv::int(32, 0)
                });
            interp.call("say", &[]).unwrap();
        }
        assert_eq!(called.get(), 1);
    }

    #[test]
    fn test_fuel_stops_runaway_loops() {
        let mut m = Module::new("t", "x86_64-unknown-linux-gnu");
        let mut f = Function::new("spin", Type::func(vec![], Type::Void), Linkage::External);
        let entry = f.add_block("entry");
        let lp = f.add_block("lp");
        Builder::at_end(&mut f, entry).br(lp);
        Builder::at_end(&mut f, lp).br(lp);
        m.add_function(f);

        let mut interp = Interp::new(&m);
        interp.set_fuel(1000);
        assert_eq!(interp.call("spin", &[]), Err(EvalError::OutOfFuel));
    }

    #[test]
    fn test_code_bytes_are_stable_per_name() {
        assert_eq!(code_byte("f", 0), code_byte("f", 0));
        assert_ne!(code_byte("f", 0), code_byte("f", 1));
    }
}

//! Textual IR output.
//!
//! Deterministic, LLVM-flavored rendering used by tests and debugging.
//! Unnamed values get sequential `%N` numbers per function; name hints are
//! uniquified with a numeric suffix when reused.

use crate::function::{Attribute, Function};
use crate::instruction::{Callee, InstKind, Value};
use crate::module::Module;
use crate::types::{Constant, FunctionId, GlobalId, InstId, Type};
use std::collections::HashMap;
use std::fmt::Write as _;

/// Resolves module-scoped names while printing a function.
struct Symbols<'m> {
    module: Option<&'m Module>,
}

impl Symbols<'_> {
    fn func_name(&self, id: FunctionId) -> String {
        match self.module {
            Some(m) => format!("@{}", m.function(id).name()),
            None => "@<fn>".to_string(),
        }
    }

    fn global_name(&self, id: GlobalId) -> String {
        match self.module {
            Some(m) => format!("@{}", m.global(id).name),
            None => "@<global>".to_string(),
        }
    }
}

/// Render a whole module.
pub fn print_module(module: &Module) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "; ModuleID = '{}'", module.name());
    let _ = writeln!(out, "target triple = \"{}\"", module.triple());
    let _ = writeln!(out);

    for (_, global) in module.globals() {
        let kind = if global.is_constant { "constant" } else { "global" };
        let linkage = global.linkage.keyword();
        let sep = if linkage.is_empty() { "" } else { " " };
        let init = match &global.initializer {
            Some(c) => format!(" {}", const_text(c)),
            None => String::new(),
        };
        let _ = writeln!(
            out,
            "@{} ={}{} {} {}{}",
            global.name, sep, linkage, kind, global.ty, init
        );
    }
    if module.globals().next().is_some() {
        let _ = writeln!(out);
    }

    for (_, func) in module.functions() {
        print_function_inner(
            &mut out,
            func,
            &Symbols {
                module: Some(module),
            },
        );
        let _ = writeln!(out);
    }

    if !module.ctors().is_empty() {
        let entries: Vec<String> = module
            .ctors()
            .iter()
            .map(|c| format!("{{ {}, @{} }}", c.priority, module.function(c.func).name()))
            .collect();
        let _ = writeln!(out, "@llvm.global_ctors = [{}]", entries.join(", "));
    }
    out
}

/// Render a single function without module context; direct-call and global
/// operands print as placeholders.
pub fn print_function(out: &mut String, func: &Function) {
    print_function_inner(out, func, &Symbols { module: None });
}

fn print_function_inner(out: &mut String, func: &Function, symbols: &Symbols<'_>) {
    let params: Vec<String> = func
        .param_tys()
        .iter()
        .enumerate()
        .map(|(i, ty)| format!("{} %{}", ty, i))
        .collect();
    let mut attrs = String::new();
    for (attr, text) in [
        (Attribute::NoInline, " noinline"),
        (Attribute::OptimizeNone, " optnone"),
        (Attribute::NoObfuscate, " noobfuscate"),
    ] {
        if func.attrs.has(attr) {
            attrs.push_str(text);
        }
    }
    let linkage = func.linkage().keyword();
    let sep = if linkage.is_empty() { "" } else { " " };

    if func.is_declaration() {
        let _ = writeln!(
            out,
            "declare {} @{}({})",
            func.return_ty(),
            func.name(),
            params.join(", ")
        );
        return;
    }

    let _ = writeln!(
        out,
        "define{}{} {} @{}({}){} {{",
        sep,
        linkage,
        func.return_ty(),
        func.name(),
        params.join(", "),
        attrs
    );

    let names = ValueNames::assign(func);
    for &bb in func.layout() {
        let _ = writeln!(out, "{}:", func.block(bb).name);
        for &id in func.block(bb).insts() {
            let _ = writeln!(out, "  {}", inst_text(func, &names, symbols, id));
        }
    }
    let _ = writeln!(out, "}}");
}

struct ValueNames {
    names: HashMap<InstId, String>,
}

impl ValueNames {
    fn assign(func: &Function) -> ValueNames {
        let mut names = HashMap::new();
        let mut used: HashMap<String, u32> = HashMap::new();
        let mut counter = 0u32;
        for &bb in func.layout() {
            for &id in func.block(bb).insts() {
                let inst = func.inst(id);
                if inst.ty.is_void() {
                    continue;
                }
                let base = if inst.name.is_empty() {
                    let n = counter.to_string();
                    counter += 1;
                    n
                } else {
                    inst.name.clone()
                };
                let n = used.entry(base.clone()).or_insert(0);
                let unique = if *n == 0 {
                    base.clone()
                } else {
                    format!("{}.{}", base, n)
                };
                *n += 1;
                names.insert(id, unique);
            }
        }
        ValueNames { names }
    }

    fn of(&self, id: InstId) -> String {
        self.names
            .get(&id)
            .map(|n| format!("%{}", n))
            .unwrap_or_else(|| "%?".to_string())
    }
}

fn const_text(c: &Constant) -> String {
    match c {
        Constant::Int { value, .. } => value.to_string(),
        Constant::Bytes(bytes) => {
            let mut s = String::from("c\"");
            for &b in bytes {
                if (0x20..0x7f).contains(&b) && b != b'"' && b != b'\\' {
                    s.push(b as char);
                } else {
                    let _ = write!(s, "\\{:02X}", b);
                }
            }
            s.push('"');
            s
        }
        Constant::NullPtr => "null".to_string(),
        Constant::Zero(_) => "zeroinitializer".to_string(),
    }
}

fn value_text(func: &Function, names: &ValueNames, symbols: &Symbols<'_>, value: &Value) -> String {
    match value {
        Value::Inst(id) => names.of(*id),
        Value::Arg(i) => format!("%{}", i),
        Value::Const(c) => const_text(c),
        Value::Global(id) => symbols.global_name(*id),
        Value::Func(id) => symbols.func_name(*id),
        Value::BlockAddress(bb) => format!("blockaddress(%{})", func.block(*bb).name),
    }
}

fn typed(func: &Function, names: &ValueNames, symbols: &Symbols<'_>, value: &Value) -> String {
    let ty = func.value_type(value).unwrap_or(Type::Ptr);
    format!("{} {}", ty, value_text(func, names, symbols, value))
}

fn inst_text(func: &Function, names: &ValueNames, symbols: &Symbols<'_>, id: InstId) -> String {
    let inst = func.inst(id);
    let lhs = if inst.ty.is_void() {
        String::new()
    } else {
        format!("{} = ", names.of(id))
    };
    let v = |value: &Value| value_text(func, names, symbols, value);
    let tv = |value: &Value| typed(func, names, symbols, value);
    let body = match &inst.kind {
        InstKind::Alloca { ty } => format!("alloca {}", ty),
        InstKind::Load { ty, ptr, volatile } => format!(
            "load{} {}, ptr {}",
            if *volatile { " volatile" } else { "" },
            ty,
            v(ptr)
        ),
        InstKind::Store {
            value,
            ptr,
            volatile,
        } => format!(
            "store{} {}, ptr {}",
            if *volatile { " volatile" } else { "" },
            tv(value),
            v(ptr)
        ),
        InstKind::Gep {
            base_ty,
            ptr,
            indices,
        } => {
            let idx: Vec<String> = indices.iter().map(tv).collect();
            format!(
                "getelementptr {}, ptr {}, {}",
                base_ty,
                v(ptr),
                idx.join(", ")
            )
        }
        InstKind::BinOp { op, lhs, rhs } => {
            format!("{} {}, {}", op.mnemonic(), tv(lhs), v(rhs))
        }
        InstKind::ICmp { pred, lhs, rhs } => {
            format!("icmp {} {}, {}", pred.mnemonic(), tv(lhs), v(rhs))
        }
        InstKind::Select {
            cond,
            if_true,
            if_false,
        } => format!("select {}, {}, {}", tv(cond), tv(if_true), tv(if_false)),
        InstKind::Phi { incoming } => {
            let arms: Vec<String> = incoming
                .iter()
                .map(|(val, bb)| format!("[ {}, %{} ]", v(val), func.block(*bb).name))
                .collect();
            format!("phi {} {}", inst.ty, arms.join(", "))
        }
        InstKind::Call {
            callee,
            fn_ty,
            args,
        } => {
            let ret = match fn_ty {
                Type::Func { ret, .. } => (**ret).clone(),
                _ => Type::Void,
            };
            let callee_text = match callee {
                Callee::Direct(id) => symbols.func_name(*id),
                Callee::Indirect(ptr) => v(ptr),
            };
            let args: Vec<String> = args.iter().map(tv).collect();
            format!("call {} {}({})", ret, callee_text, args.join(", "))
        }
        InstKind::Cast { op, value, to } => {
            format!("{} {} to {}", op.mnemonic(), tv(value), to)
        }
        InstKind::Br { dest } => format!("br label %{}", func.block(*dest).name),
        InstKind::CondBr {
            cond,
            if_true,
            if_false,
        } => format!(
            "br {}, label %{}, label %{}",
            tv(cond),
            func.block(*if_true).name,
            func.block(*if_false).name
        ),
        InstKind::IndirectBr { addr, dests } => {
            let labels: Vec<String> = dests
                .iter()
                .map(|bb| format!("label %{}", func.block(*bb).name))
                .collect();
            format!("indirectbr ptr {}, [{}]", v(addr), labels.join(", "))
        }
        InstKind::Switch {
            cond,
            default,
            cases,
        } => {
            let arms: Vec<String> = cases
                .iter()
                .map(|(val, bb)| format!("i64 {}, label %{}", val, func.block(*bb).name))
                .collect();
            format!(
                "switch {}, label %{} [{}]",
                tv(cond),
                func.block(*default).name,
                arms.join(" ")
            )
        }
        InstKind::Ret { value } => match value {
            Some(value) => format!("ret {}", tv(value)),
            None => "ret void".to_string(),
        },
        InstKind::Resume => "resume".to_string(),
        InstKind::Unreachable => "unreachable".to_string(),
    };
    format!("{}{}", lhs, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Builder;
    use crate::module::{GlobalVariable, Linkage};

    #[test]
    fn test_prints_globals_and_blocks() {
        let mut m = Module::new("demo", "x86_64-unknown-linux-gnu");
        m.add_global(GlobalVariable::new(
            "s",
            Type::byte_array(3),
            Linkage::Private,
            true,
            Some(Constant::Bytes(b"hi\0".to_vec())),
        ));
        let mut f = Function::new("f", Type::func(vec![], Type::Void), Linkage::Internal);
        let entry = f.add_block("entry");
        let mut b = Builder::at_end(&mut f, entry);
        let x = b.add(Value::const_i32(1), Value::const_i32(2), "x");
        let _ = b.mul(x, Value::const_i32(3), "");
        b.ret(None);
        m.add_function(f);

        let text = print_module(&m);
        assert!(text.contains("target triple = \"x86_64-unknown-linux-gnu\""));
        assert!(text.contains("@s = private constant [3 x i8] c\"hi\\00\""));
        assert!(text.contains("define internal void @f()"));
        assert!(text.contains("entry:"));
        assert!(text.contains("%x = add i32 1, 2"));
        assert!(text.contains("ret void"));
    }

    #[test]
    fn test_name_uniquing() {
        let mut f = Function::new("f", Type::func(vec![], Type::Void), Linkage::Internal);
        let entry = f.add_block("entry");
        let mut b = Builder::at_end(&mut f, entry);
        b.add(Value::const_i32(1), Value::const_i32(1), "v");
        b.add(Value::const_i32(2), Value::const_i32(2), "v");
        b.ret(None);
        let mut out = String::new();
        print_function(&mut out, &f);
        assert!(out.contains("%v = "));
        assert!(out.contains("%v.1 = "));
    }

    #[test]
    fn test_deterministic_output() {
        let mut m = Module::new("demo", "x86_64-unknown-linux-gnu");
        let mut f = Function::new("f", Type::func(vec![], Type::Void), Linkage::Internal);
        let entry = f.add_block("entry");
        Builder::at_end(&mut f, entry).ret(None);
        m.add_function(f);
        assert_eq!(print_module(&m), print_module(&m));
    }
}

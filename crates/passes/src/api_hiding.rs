//! Dynamic-symbol API hiding.
//!
//! Direct calls to external functions leave the callee's name sitting in a
//! relocation an analyst can read with `nm`. This pass rewrites each such
//! call to resolve the symbol at runtime — `dlsym` on POSIX targets,
//! `GetModuleHandleA`/`GetProcAddress` on Windows — and call through the
//! returned pointer with the original signature.
//!
//! The callee name still exists as bytes (in an `obf.api.*` global), which
//! is exactly what makes the string-encryption pass a natural companion.

use crate::pass::{ModulePass, PassContext, PassError, PassKind, Preserved, is_obf_name};
use crate::registry::{PassInfo, Placement};
use tracing::debug;
use veil_ir::{
    Builder, Callee, Constant, FunctionId, GlobalVariable, InstId, InstKind, Linkage,
    Module, Type, Value,
};

/// Symbols the resolver machinery itself uses; never rewritten.
const RESOLVER_NAMES: [&str; 4] = [
    "dlsym",
    "GetProcAddress",
    "GetModuleHandleA",
    "LoadLibraryA",
];

/// `RTLD_DEFAULT`: 0 on most POSIX systems, -2 on macOS.
fn rtld_default(macos: bool) -> i64 {
    if macos { -2 } else { 0 }
}

pub struct ApiHidingPass;

impl ModulePass for ApiHidingPass {
    fn name(&self) -> &'static str {
        "EnterpriseAPIHiding"
    }

    fn run(
        &mut self,
        module: &mut Module,
        _cx: &mut PassContext,
    ) -> Result<Preserved, PassError> {
        let triple = module.parsed_triple();
        if !triple.is_windows() && !triple.is_posix() {
            return Err(PassError::TripleUnsupported(module.triple().to_string()));
        }

        let resolver_ty = Type::func(vec![Type::Ptr, Type::Ptr], Type::Ptr);
        let (resolver, module_handle) = if triple.is_windows() {
            module.declare_function("LoadLibraryA", Type::func(vec![Type::Ptr], Type::Ptr));
            let get_proc = module.declare_function("GetProcAddress", resolver_ty.clone());
            let get_module =
                module.declare_function("GetModuleHandleA", Type::func(vec![Type::Ptr], Type::Ptr));
            (get_proc, Some(get_module))
        } else {
            (module.declare_function("dlsym", resolver_ty.clone()), None)
        };

        // Collect direct calls to external, non-intrinsic functions.
        let mut sites: Vec<(FunctionId, InstId, FunctionId)> = Vec::new();
        for fid in module.function_ids() {
            let func = module.function(fid);
            if func.is_declaration() || is_obf_name(func.name()) {
                continue;
            }
            for &bb in func.layout() {
                for &id in func.block(bb).insts() {
                    let InstKind::Call {
                        callee: Callee::Direct(target),
                        ..
                    } = &func.inst(id).kind
                    else {
                        continue;
                    };
                    let callee = module.function(*target);
                    if callee.is_declaration()
                        && !callee.is_intrinsic()
                        && !RESOLVER_NAMES.contains(&callee.name())
                    {
                        sites.push((fid, id, *target));
                    }
                }
            }
        }

        let mut modified = false;
        for (fid, call_id, target) in sites {
            let callee_name = module.function(target).name().to_string();
            let name_global = intern_name(module, &callee_name);

            let func = module.function(fid);
            let Some((bb, pos)) = func.find_inst(call_id) else {
                continue;
            };
            let (fn_ty, args) = match &func.inst(call_id).kind {
                InstKind::Call { fn_ty, args, .. } => (fn_ty.clone(), args.clone()),
                _ => continue,
            };
            let hint = func.inst(call_id).name.clone();

            let func = module.function_mut(fid);
            let mut b = Builder::before(func, bb, pos);
            let resolved = if let Some(get_module) = module_handle {
                let hmodule = b.call(
                    get_module,
                    Type::func(vec![Type::Ptr], Type::Ptr),
                    vec![Value::null_ptr()],
                    "",
                );
                b.call(
                    resolver,
                    resolver_ty.clone(),
                    vec![hmodule, Value::Global(name_global)],
                    "",
                )
            } else {
                let handle = b.int_to_ptr(
                    Value::const_i64(rtld_default(triple.is_macos())),
                    "",
                );
                b.call(
                    resolver,
                    resolver_ty.clone(),
                    vec![handle, Value::Global(name_global)],
                    "",
                )
            };
            let indirect = b.call_indirect(resolved, fn_ty, args, &hint);

            func.replace_all_uses(&Value::Inst(call_id), &indirect);
            func.erase_from_block(bb, call_id);
            modified = true;
        }

        if modified {
            debug!("rewrote external calls to runtime resolution");
            Ok(Preserved::None)
        } else {
            Ok(Preserved::All)
        }
    }
}

/// Get-or-create the NUL-terminated name global for a hidden symbol.
fn intern_name(module: &mut Module, callee_name: &str) -> veil_ir::GlobalId {
    let global_name = format!("obf.api.{}", callee_name);
    if let Some(id) = module.global_by_name(&global_name) {
        return id;
    }
    let mut bytes = callee_name.as_bytes().to_vec();
    bytes.push(0);
    let len = bytes.len() as u64;
    module.add_global(GlobalVariable::new(
        global_name,
        Type::byte_array(len),
        Linkage::Private,
        true,
        Some(Constant::Bytes(bytes)),
    ))
}

pub fn plugin_info() -> PassInfo {
    PassInfo {
        name: "EnterpriseAPIHiding",
        version: "1.0",
        placement: Placement::PipelineStart,
        required: true,
        build: || PassKind::Module(Box::new(ApiHidingPass)),
    }
}

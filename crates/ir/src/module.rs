//! Modules: the compilation unit.
//!
//! A module owns its functions, global variables, and the ordered global
//! constructor list. Function and global names are unique within a module.

use crate::function::Function;
use crate::triple::Triple;
use crate::types::{Constant, FunctionId, GlobalId, Type};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    External,
    Internal,
    Private,
}

impl Linkage {
    pub fn keyword(self) -> &'static str {
        match self {
            Linkage::External => "",
            Linkage::Internal => "internal",
            Linkage::Private => "private",
        }
    }
}

/// A module-scoped variable. A missing initializer makes it a declaration.
#[derive(Debug, Clone)]
pub struct GlobalVariable {
    pub name: String,
    pub ty: Type,
    pub linkage: Linkage,
    /// Immutability flag: `true` prints as `constant`, `false` as `global`.
    pub is_constant: bool,
    pub initializer: Option<Constant>,
}

impl GlobalVariable {
    pub fn new(
        name: impl Into<String>,
        ty: Type,
        linkage: Linkage,
        is_constant: bool,
        initializer: Option<Constant>,
    ) -> GlobalVariable {
        GlobalVariable {
            name: name.into(),
            ty,
            linkage,
            is_constant,
            initializer,
        }
    }
}

/// One `(priority, function)` entry of the global constructor list.
/// Constructors run in ascending priority order before program entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtorEntry {
    pub priority: u16,
    pub func: FunctionId,
}

/// The compilation unit the passes operate on.
#[derive(Debug, Clone)]
pub struct Module {
    name: String,
    triple: String,
    functions: Vec<Function>,
    globals: Vec<GlobalVariable>,
    ctors: Vec<CtorEntry>,
}

impl Module {
    pub fn new(name: impl Into<String>, triple: impl Into<String>) -> Module {
        Module {
            name: name.into(),
            triple: triple.into(),
            functions: Vec::new(),
            globals: Vec::new(),
            ctors: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn triple(&self) -> &str {
        &self.triple
    }

    pub fn parsed_triple(&self) -> Triple {
        Triple::parse(&self.triple)
    }

    // ---- functions ----

    /// Add a function. The name must not already be taken; passes guarantee
    /// this through the `obf.` prefix convention.
    pub fn add_function(&mut self, func: Function) -> FunctionId {
        debug_assert!(
            self.function_by_name(func.name()).is_none(),
            "duplicate function name {}",
            func.name()
        );
        let id = FunctionId(self.functions.len() as u32);
        self.functions.push(func);
        id
    }

    /// Get-or-insert an external declaration with the given signature.
    pub fn declare_function(&mut self, name: &str, ty: Type) -> FunctionId {
        if let Some(id) = self.function_by_name(name) {
            return id;
        }
        self.add_function(Function::new(name, ty, Linkage::External))
    }

    /// Get-or-insert a host intrinsic declaration (`llvm.*`).
    pub fn declare_intrinsic(&mut self, name: &str, ty: Type) -> FunctionId {
        if let Some(id) = self.function_by_name(name) {
            return id;
        }
        self.add_function(Function::new_intrinsic(name, ty))
    }

    pub fn function(&self, id: FunctionId) -> &Function {
        &self.functions[id.index()]
    }

    pub fn function_mut(&mut self, id: FunctionId) -> &mut Function {
        &mut self.functions[id.index()]
    }

    pub fn function_by_name(&self, name: &str) -> Option<FunctionId> {
        self.functions
            .iter()
            .position(|f| f.name() == name)
            .map(|i| FunctionId(i as u32))
    }

    /// Snapshot of all function ids, for iteration while mutating.
    pub fn function_ids(&self) -> Vec<FunctionId> {
        (0..self.functions.len() as u32).map(FunctionId).collect()
    }

    pub fn functions(&self) -> impl Iterator<Item = (FunctionId, &Function)> {
        self.functions
            .iter()
            .enumerate()
            .map(|(i, f)| (FunctionId(i as u32), f))
    }

    // ---- globals ----

    pub fn add_global(&mut self, global: GlobalVariable) -> GlobalId {
        debug_assert!(
            self.global_by_name(&global.name).is_none(),
            "duplicate global name {}",
            global.name
        );
        let id = GlobalId(self.globals.len() as u32);
        self.globals.push(global);
        id
    }

    pub fn global(&self, id: GlobalId) -> &GlobalVariable {
        &self.globals[id.index()]
    }

    pub fn global_mut(&mut self, id: GlobalId) -> &mut GlobalVariable {
        &mut self.globals[id.index()]
    }

    pub fn global_by_name(&self, name: &str) -> Option<GlobalId> {
        self.globals
            .iter()
            .position(|g| g.name == name)
            .map(|i| GlobalId(i as u32))
    }

    pub fn global_ids(&self) -> Vec<GlobalId> {
        (0..self.globals.len() as u32).map(GlobalId).collect()
    }

    pub fn globals(&self) -> impl Iterator<Item = (GlobalId, &GlobalVariable)> {
        self.globals
            .iter()
            .enumerate()
            .map(|(i, g)| (GlobalId(i as u32), g))
    }

    // ---- constructors ----

    /// Register `func` to run before program entry at the given priority.
    pub fn append_to_ctors(&mut self, priority: u16, func: FunctionId) {
        self.ctors.push(CtorEntry { priority, func });
    }

    pub fn ctors(&self) -> &[CtorEntry] {
        &self.ctors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declare_function_is_get_or_insert() {
        let mut m = Module::new("m", "x86_64-unknown-linux-gnu");
        let ty = Type::func(vec![Type::Ptr, Type::Ptr], Type::Ptr);
        let a = m.declare_function("dlsym", ty.clone());
        let b = m.declare_function("dlsym", ty);
        assert_eq!(a, b);
        assert!(m.function(a).is_declaration());
    }

    #[test]
    fn test_intrinsic_flag() {
        let mut m = Module::new("m", "x86_64-unknown-linux-gnu");
        let trap = m.declare_intrinsic("llvm.trap", Type::func(vec![], Type::Void));
        assert!(m.function(trap).is_intrinsic());
        let puts = m.declare_function("puts", Type::func(vec![Type::Ptr], Type::i32()));
        assert!(!m.function(puts).is_intrinsic());
    }

    #[test]
    fn test_global_lookup() {
        let mut m = Module::new("m", "x86_64-unknown-linux-gnu");
        let g = m.add_global(GlobalVariable::new(
            "s",
            Type::byte_array(3),
            Linkage::Private,
            true,
            Some(Constant::Bytes(b"hi\0".to_vec())),
        ));
        assert_eq!(m.global_by_name("s"), Some(g));
        assert!(m.global_by_name("t").is_none());
        assert!(m.global(g).is_constant);
    }

    #[test]
    fn test_ctor_order_is_insertion_order() {
        let mut m = Module::new("m", "x86_64-unknown-linux-gnu");
        let f = m.declare_function("f", Type::func(vec![], Type::Void));
        let g = m.declare_function("g", Type::func(vec![], Type::Void));
        m.append_to_ctors(0, f);
        m.append_to_ctors(0, g);
        assert_eq!(m.ctors()[0].func, f);
        assert_eq!(m.ctors()[1].func, g);
    }
}

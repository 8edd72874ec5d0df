//! Pass framework: traits, context, errors, and the naming convention.
//!
//! Passes borrow the module, mutate it in place, and report whether any
//! analyses must be invalidated. The `obf.` prefix on everything a pass
//! introduces is the sole re-entrancy mechanism: every pass skips values so
//! prefixed, which is what makes composing and re-running them safe.

use crate::config::ObfConfig;
use crate::rng::ObfRng;
use veil_ir::{FunctionId, Module, VerifyError};
use std::fmt;

/// Prefix carried by every function, global, and resolver string a pass
/// creates.
pub const OBF_PREFIX: &str = "obf.";

/// Globals carrying platform metadata; never touched.
pub const METADATA_PREFIX: &str = "llvm.";

/// True when the name marks a construct introduced by an obfuscation pass.
pub fn is_obf_name(name: &str) -> bool {
    name.starts_with(OBF_PREFIX)
}

/// Analysis-invalidation signal returned by every pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preserved {
    /// Nothing changed; all analyses remain valid.
    All,
    /// The IR changed; analyses must be recomputed.
    None,
}

impl Preserved {
    pub fn merge(self, other: Preserved) -> Preserved {
        if self == Preserved::All && other == Preserved::All {
            Preserved::All
        } else {
            Preserved::None
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PassError {
    /// The module's target triple is neither POSIX nor Windows. This is a
    /// build-configuration bug, not a skippable condition.
    TripleUnsupported(String),
    /// A pipeline string named a pass that is not registered.
    UnknownPass(String),
    /// A transformation produced IR the verifier rejects.
    Verify(VerifyError),
}

impl fmt::Display for PassError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PassError::TripleUnsupported(triple) => {
                write!(f, "unsupported target triple '{}'", triple)
            }
            PassError::UnknownPass(name) => write!(f, "no pass named '{}'", name),
            PassError::Verify(e) => write!(f, "verifier rejected transformed IR: {}", e),
        }
    }
}

impl std::error::Error for PassError {}

impl From<VerifyError> for PassError {
    fn from(e: VerifyError) -> Self {
        PassError::Verify(e)
    }
}

/// Mutable state threaded through a pipeline run: the RNG and the knobs the
/// passes read. Passes share one RNG stream so a single seed reproduces the
/// whole build.
pub struct PassContext {
    pub rng: ObfRng,
    pub timing_trap_percent: u32,
}

impl PassContext {
    pub fn new(config: &ObfConfig) -> PassContext {
        PassContext {
            rng: config.make_rng(),
            timing_trap_percent: config.timing_trap_percent,
        }
    }
}

/// A transformation over a whole module.
pub trait ModulePass {
    fn name(&self) -> &'static str;
    fn run(&mut self, module: &mut Module, cx: &mut PassContext)
    -> Result<Preserved, PassError>;
}

/// A transformation over one function at a time. The module is passed too:
/// several function passes create module-level globals or functions.
pub trait FunctionPass {
    fn name(&self) -> &'static str;
    fn run(
        &mut self,
        module: &mut Module,
        func: FunctionId,
        cx: &mut PassContext,
    ) -> Result<Preserved, PassError>;
}

/// A pass of either granularity, ready to run over a module.
pub enum PassKind {
    Module(Box<dyn ModulePass>),
    Function(Box<dyn FunctionPass>),
}

impl PassKind {
    pub fn name(&self) -> &'static str {
        match self {
            PassKind::Module(p) => p.name(),
            PassKind::Function(p) => p.name(),
        }
    }

    /// Run the pass over the module; function passes are adapted by
    /// iterating every defined function.
    pub fn run_on_module(
        &mut self,
        module: &mut Module,
        cx: &mut PassContext,
    ) -> Result<Preserved, PassError> {
        match self {
            PassKind::Module(p) => p.run(module, cx),
            PassKind::Function(p) => {
                let mut preserved = Preserved::All;
                for fid in module.function_ids() {
                    if module.function(fid).is_declaration() {
                        continue;
                    }
                    preserved = preserved.merge(p.run(module, fid, cx)?);
                }
                Ok(preserved)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_obf_prefix_detection() {
        assert!(is_obf_name("obf.decrypt_strings"));
        assert!(is_obf_name("obf.outlined.f.3"));
        assert!(!is_obf_name("main"));
        assert!(!is_obf_name("llvm.trap"));
    }

    #[test]
    fn test_preserved_merge() {
        assert_eq!(Preserved::All.merge(Preserved::All), Preserved::All);
        assert_eq!(Preserved::All.merge(Preserved::None), Preserved::None);
        assert_eq!(Preserved::None.merge(Preserved::All), Preserved::None);
    }
}

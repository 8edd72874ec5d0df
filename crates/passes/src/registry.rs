//! Pass registration and pipeline assembly.
//!
//! Registration is a plain function table: each pass contributes a
//! [`PassInfo`] naming it, versioning it, and saying where in the pipeline
//! it belongs. A [`Pipeline`] is then built through exactly one route —
//! [`Pipeline::standard`] consumes the placements, [`Pipeline::parse`]
//! consumes names from a pipeline string. Nothing is auto-enabled behind
//! the caller's back, so no pass can end up in a pipeline twice.

use crate::pass::{PassContext, PassError, PassKind, Preserved};
use tracing::{debug, info};
use veil_ir::{Module, verify};

/// Schema-version token advertised to hosts loading this plugin.
pub const PLUGIN_API_VERSION: u32 = 1;

/// Where a pass belongs when the host assembles the standard pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Before standard optimizations: catches IR the optimizer would fold.
    PipelineStart,
    /// After standard optimizations: output no further pass will undo.
    PipelineEnd,
}

/// One registered pass: the function-table entry the host's callback
/// registry would hold.
pub struct PassInfo {
    /// Public pipeline-string name (`Enterprise...`).
    pub name: &'static str,
    pub version: &'static str,
    pub placement: Placement,
    /// Never skipped by optimization-level gating.
    pub required: bool,
    pub build: fn() -> PassKind,
}

/// The set of registered passes.
pub struct Registry {
    passes: Vec<PassInfo>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry { passes: Vec::new() }
    }

    /// All eight obfuscation passes, in recommended composition order.
    pub fn with_default_passes() -> Registry {
        let mut registry = Registry::new();
        registry.register(crate::string_encryption::plugin_info());
        registry.register(crate::api_hiding::plugin_info());
        registry.register(crate::anti_debug::plugin_info());
        // Must come after the other start passes: their instrumentation
        // belongs in the measured baseline.
        registry.register(crate::anti_tamper::plugin_info());
        registry.register(crate::split_basic_block::plugin_info());
        registry.register(crate::opaque_predicate::plugin_info());
        registry.register(crate::flattening::plugin_info());
        registry.register(crate::outlining::plugin_info());
        registry
    }

    pub fn register(&mut self, info: PassInfo) {
        self.passes.push(info);
    }

    pub fn by_name(&self, name: &str) -> Option<&PassInfo> {
        self.passes.iter().find(|p| p.name == name)
    }

    pub fn passes(&self) -> &[PassInfo] {
        &self.passes
    }
}

/// An ordered sequence of passes ready to run over modules.
pub struct Pipeline {
    passes: Vec<(&'static str, PassKind)>,
}

impl Pipeline {
    /// Placement-driven assembly: every registered start pass in
    /// registration order, then every end pass.
    pub fn standard(registry: &Registry) -> Pipeline {
        let mut passes = Vec::new();
        for placement in [Placement::PipelineStart, Placement::PipelineEnd] {
            for info in registry.passes() {
                if info.placement == placement {
                    passes.push((info.name, (info.build)()));
                }
            }
        }
        Pipeline { passes }
    }

    /// Name-driven assembly from a comma-separated pipeline string, e.g.
    /// `"EnterpriseStringEncryption,EnterpriseFlattening"`.
    pub fn parse(registry: &Registry, text: &str) -> Result<Pipeline, PassError> {
        let mut passes = Vec::new();
        for name in text.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let info = registry
                .by_name(name)
                .ok_or_else(|| PassError::UnknownPass(name.to_string()))?;
            passes.push((info.name, (info.build)()));
        }
        Ok(Pipeline { passes })
    }

    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|(name, _)| *name).collect()
    }

    /// Run every pass in order, verifying the module after each one.
    pub fn run(
        &mut self,
        module: &mut Module,
        cx: &mut PassContext,
    ) -> Result<(), PassError> {
        for (name, pass) in &mut self.passes {
            let preserved = pass.run_on_module(module, cx)?;
            debug!(pass = *name, changed = (preserved == Preserved::None), "pass finished");
            verify(module)?;
        }
        info!(passes = self.passes.len(), module = module.name(), "pipeline complete");
        Ok(())
    }
}

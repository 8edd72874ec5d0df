//! Veil: IR obfuscation passes.
//!
//! Eight transformations that rewrite a module ahead of code generation to
//! impede static analysis, dynamic analysis, and tampering:
//!
//! | Pass | Granularity | Placement |
//! |---|---|---|
//! | `EnterpriseStringEncryption` | module | start |
//! | `EnterpriseAPIHiding` | module | start |
//! | `EnterpriseAntiDebugging` | module | start |
//! | `EnterpriseAntiTampering` | module | start |
//! | `EnterpriseSplitBasicBlock` | function | end |
//! | `EnterpriseOpaquePredicate` | function | end |
//! | `EnterpriseFlattening` | function | end |
//! | `EnterpriseFunctionOutlining` | function | end |
//!
//! Passes are stateless between runs; the sole coordination mechanism is
//! the `obf.` name prefix on everything a pass introduces, which later
//! passes (and second applications) skip.
//!
//! # Example
//!
//! ```rust,ignore
//! use veil_passes::{ObfConfig, PassContext, Pipeline, Registry};
//!
//! let registry = Registry::with_default_passes();
//! let mut pipeline = Pipeline::standard(&registry);
//! let mut cx = PassContext::new(&ObfConfig::new().with_seed(1));
//! pipeline.run(&mut module, &mut cx)?;
//! ```

pub mod anti_debug;
pub mod anti_tamper;
pub mod api_hiding;
pub mod config;
pub mod crypto;
pub mod flattening;
pub mod opaque_predicate;
pub mod outlining;
pub mod pass;
pub mod registry;
pub mod rng;
pub mod split_basic_block;
pub mod string_encryption;

pub use anti_debug::AntiDebuggingPass;
pub use anti_tamper::AntiTamperingPass;
pub use api_hiding::ApiHidingPass;
pub use config::ObfConfig;
pub use flattening::FlatteningPass;
pub use opaque_predicate::OpaquePredicatePass;
pub use outlining::FunctionOutliningPass;
pub use pass::{
    FunctionPass, ModulePass, OBF_PREFIX, PassContext, PassError, PassKind, Preserved,
    is_obf_name,
};
pub use registry::{PLUGIN_API_VERSION, PassInfo, Pipeline, Placement, Registry};
pub use rng::ObfRng;
pub use split_basic_block::SplitBasicBlockPass;
pub use string_encryption::StringEncryptionPass;

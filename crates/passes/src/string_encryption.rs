//! String-literal encryption.
//!
//! Replaces every plaintext byte-array global with its XOR ciphertext and
//! synthesizes one startup constructor, `obf.decrypt_strings`, that undoes
//! the cipher in place before `main` runs.
//!
//! The decryption stub loads and stores every byte **volatile** so global
//! value optimization cannot evaluate the loop at compile time and put the
//! plaintext back into the initializer. The stub itself is no-inline and
//! opt-none so it survives even when the optimizer can prove it pure.

use crate::crypto::xor_encrypt;
use crate::pass::{
    METADATA_PREFIX, ModulePass, PassContext, PassError, PassKind, Preserved, is_obf_name,
};
use crate::registry::{PassInfo, Placement};
use tracing::debug;
use veil_ir::{
    Attribute, Builder, Constant, Function, GlobalId, Linkage, Module, Type, Value,
};

pub const DECRYPT_FN: &str = "obf.decrypt_strings";

/// Minimum data length worth encrypting; shorter arrays are usually padding.
const MIN_LEN: usize = 4;

pub struct StringEncryptionPass;

impl ModulePass for StringEncryptionPass {
    fn name(&self) -> &'static str {
        "EnterpriseStringEncryption"
    }

    fn run(
        &mut self,
        module: &mut Module,
        cx: &mut PassContext,
    ) -> Result<Preserved, PassError> {
        // The stub's presence marks an already-encrypted module.
        if module.function_by_name(DECRYPT_FN).is_some() {
            return Ok(Preserved::All);
        }

        let mut targets: Vec<(GlobalId, u8, u64)> = Vec::new();
        for gid in module.global_ids() {
            let global = module.global(gid);
            if global.name.starts_with(METADATA_PREFIX) || is_obf_name(&global.name) {
                continue;
            }
            let Some(Constant::Bytes(bytes)) = &global.initializer else {
                continue;
            };
            if bytes.len() < MIN_LEN {
                continue;
            }
            if !global.ty.is_byte_array() {
                // Wrong element type; leave the global untouched.
                continue;
            }

            let key = cx.rng.int_in_range(1, 255) as u8;
            let encrypted = xor_encrypt(bytes, key);
            let len = bytes.len() as u64;

            let global = module.global_mut(gid);
            global.initializer = Some(Constant::Bytes(encrypted));
            // The decryption stub writes the plaintext back at runtime.
            global.is_constant = false;

            targets.push((gid, key, len));
        }

        if targets.is_empty() {
            return Ok(Preserved::All);
        }

        let mut stub = Function::new(DECRYPT_FN, Type::func(vec![], Type::Void), Linkage::Internal);
        stub.attrs.add(Attribute::NoInline);
        stub.attrs.add(Attribute::OptimizeNone);
        let entry = stub.add_block("entry");
        let mut b = Builder::at_end(&mut stub, entry);
        for &(gid, key, len) in &targets {
            for j in 0..len {
                let ptr = b.gep(
                    Type::byte_array(len),
                    Value::Global(gid),
                    vec![Value::const_i64(0), Value::const_i64(j as i64)],
                    "",
                );
                let cipher_byte = b.load_volatile(Type::i8(), ptr.clone(), "");
                let plain_byte = b.xor(cipher_byte, Value::const_i8(key), "");
                b.store_volatile(plain_byte, ptr);
            }
        }
        b.ret(None);

        let stub_id = module.add_function(stub);
        module.append_to_ctors(0, stub_id);

        debug!(strings = targets.len(), "encrypted string globals");
        Ok(Preserved::None)
    }
}

pub fn plugin_info() -> PassInfo {
    PassInfo {
        name: "EnterpriseStringEncryption",
        version: "1.0",
        placement: Placement::PipelineStart,
        required: true,
        build: || PassKind::Module(Box::new(StringEncryptionPass)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ObfConfig;
    use veil_ir::{GlobalVariable, Interp, verify};

    fn cx() -> PassContext {
        PassContext::new(&ObfConfig::new().with_seed(42))
    }

    fn module_with_secret() -> Module {
        let mut m = Module::new("t", "x86_64-unknown-linux-gnu");
        m.add_global(GlobalVariable::new(
            "secret",
            Type::byte_array(6),
            Linkage::Private,
            true,
            Some(Constant::Bytes(b"hello\0".to_vec())),
        ));
        m
    }

    #[test]
    fn test_encrypts_and_registers_ctor() {
        let mut m = module_with_secret();
        let mut cx = cx();
        let p = StringEncryptionPass.run(&mut m, &mut cx).unwrap();
        assert_eq!(p, Preserved::None);

        let g = m.global(m.global_by_name("secret").unwrap());
        let Some(Constant::Bytes(cipher)) = &g.initializer else {
            panic!("initializer missing");
        };
        assert_ne!(cipher.as_slice(), b"hello\0");
        assert!(!g.is_constant);

        let stub = m.function_by_name(DECRYPT_FN).expect("stub exists");
        assert!(m.function(stub).attrs.has(Attribute::NoInline));
        assert!(m.function(stub).attrs.has(Attribute::OptimizeNone));
        assert_eq!(m.ctors().len(), 1);
        assert_eq!(m.ctors()[0].func, stub);
        assert_eq!(m.ctors()[0].priority, 0);
        assert_eq!(verify(&m), Ok(()));
    }

    #[test]
    fn test_ciphertext_xor_key_recovers_plaintext() {
        let mut m = module_with_secret();
        let mut cx = cx();
        StringEncryptionPass.run(&mut m, &mut cx).unwrap();

        // Running the constructor restores the plaintext in place.
        let mut interp = Interp::new(&m);
        interp.run_ctors().unwrap();
        assert_eq!(interp.global_bytes("secret"), Some(&b"hello\0"[..]));
    }

    #[test]
    fn test_skips_short_and_prefixed_globals() {
        let mut m = Module::new("t", "x86_64-unknown-linux-gnu");
        m.add_global(GlobalVariable::new(
            "tiny",
            Type::byte_array(3),
            Linkage::Private,
            true,
            Some(Constant::Bytes(b"ab\0".to_vec())),
        ));
        m.add_global(GlobalVariable::new(
            "llvm.metadata.thing",
            Type::byte_array(8),
            Linkage::Private,
            true,
            Some(Constant::Bytes(b"ignored\0".to_vec())),
        ));
        m.add_global(GlobalVariable::new(
            "obf.api.puts",
            Type::byte_array(5),
            Linkage::Private,
            true,
            Some(Constant::Bytes(b"puts\0".to_vec())),
        ));
        let mut cx = cx();
        let p = StringEncryptionPass.run(&mut m, &mut cx).unwrap();
        assert_eq!(p, Preserved::All);
        assert!(m.function_by_name(DECRYPT_FN).is_none());
    }

    #[test]
    fn test_skips_non_byte_arrays() {
        let mut m = Module::new("t", "x86_64-unknown-linux-gnu");
        m.add_global(GlobalVariable::new(
            "words",
            Type::Array {
                elem: Box::new(Type::i32()),
                len: 4,
            },
            Linkage::Private,
            true,
            Some(Constant::Bytes(vec![0; 16])),
        ));
        let mut cx = cx();
        assert_eq!(
            StringEncryptionPass.run(&mut m, &mut cx).unwrap(),
            Preserved::All
        );
    }

    #[test]
    fn test_second_application_is_a_noop() {
        let mut m = module_with_secret();
        let mut cx = cx();
        StringEncryptionPass.run(&mut m, &mut cx).unwrap();
        let cipher_before = m
            .global(m.global_by_name("secret").unwrap())
            .initializer
            .clone();
        assert_eq!(
            StringEncryptionPass.run(&mut m, &mut cx).unwrap(),
            Preserved::All
        );
        let cipher_after = m
            .global(m.global_by_name("secret").unwrap())
            .initializer
            .clone();
        assert_eq!(cipher_before, cipher_after);
        assert_eq!(m.ctors().len(), 1);
    }

    #[test]
    fn test_per_byte_volatile_triples() {
        let mut m = module_with_secret();
        let mut cx = cx();
        StringEncryptionPass.run(&mut m, &mut cx).unwrap();
        let stub = m.function(m.function_by_name(DECRYPT_FN).unwrap());
        let entry = stub.entry().unwrap();
        // 6 bytes -> 6 gep/load/xor/store quadruples + ret.
        assert_eq!(stub.block(entry).len(), 6 * 4 + 1);
        let volatile_loads = stub
            .block(entry)
            .insts()
            .iter()
            .filter(|&&id| {
                matches!(
                    stub.inst(id).kind,
                    veil_ir::InstKind::Load { volatile: true, .. }
                )
            })
            .count();
        assert_eq!(volatile_loads, 6);
    }
}

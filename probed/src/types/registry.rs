//! Component A: type registry (spec.md §4.A).
//!
//! Resolves a textual argument type to a kernel decoder id plus per-arg
//! metadata. Grounded on the BTF-driven offset/type discovery style of the
//! teacher's `bpf_config.rs` (`derive_telemetry_config`), generalized from
//! one fixed struct (`task_struct`) to arbitrary probe argument types.

use std::collections::HashMap;

use probe_common::{arg_meta, KernelTypeId};

use crate::errors::{EngineError, EngineResult};
use crate::policy::ArgSpec;

/// Output contract of the type registry: `(kernelTypeId, userTypeTag)`
/// plus optional per-arg metadata (spec.md §4.A).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedArgType {
    pub kernel_type: KernelTypeId,
    pub user_type: String,
    pub size_arg_index: Option<i32>,
    pub max_data: bool,
    pub return_copy: bool,
}

impl ResolvedArgType {
    /// Packs the metadata bits the loader stores in `ArgMeta` (spec.md §6).
    pub fn arg_meta_bits(&self) -> u32 {
        let mut bits = 0u32;
        if self.return_copy {
            bits |= arg_meta::RETURN_COPY;
        }
        if self.max_data {
            bits |= arg_meta::MAX_DATA;
        }
        if let Some(idx) = self.size_arg_index {
            bits |= arg_meta::HAS_SIZE_ARG;
            bits |= ((idx as u32) << arg_meta::SIZE_ARG_SHIFT) & arg_meta::SIZE_ARG_MASK;
        }
        bits
    }
}

/// `auto` and `syscall64` are only meaningful at the syscall-dispatch
/// layer (spec.md §4.A): `raw_syscalls/sys_enter`-style tracepoints, not
/// plain kprobe args.
fn syscall_dispatch_only(name: &str) -> bool {
    matches!(name, "auto" | "syscall64")
}

pub struct TypeRegistry {
    kernel_types: HashMap<&'static str, KernelTypeId>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    pub fn new() -> Self {
        let mut kernel_types = HashMap::new();
        kernel_types.insert("u64", KernelTypeId::U64);
        kernel_types.insert("s64", KernelTypeId::S64);
        kernel_types.insert("u32", KernelTypeId::U32);
        kernel_types.insert("s32", KernelTypeId::S32);
        kernel_types.insert("int", KernelTypeId::Int);
        kernel_types.insert("size_t", KernelTypeId::Size);
        kernel_types.insert("char_buf", KernelTypeId::CharBuf);
        kernel_types.insert("char_iovec", KernelTypeId::CharIovec);
        kernel_types.insert("const_buf", KernelTypeId::ConstBuf);
        kernel_types.insert("string", KernelTypeId::Str);
        kernel_types.insert("data_loc", KernelTypeId::DataLoc);
        kernel_types.insert("skb", KernelTypeId::Skb);
        kernel_types.insert("sock", KernelTypeId::Sock);
        kernel_types.insert("sockaddr", KernelTypeId::SockAddr);
        kernel_types.insert("syscall64", KernelTypeId::Syscall64);
        kernel_types.insert("linux_binprm", KernelTypeId::LinuxBinprm);
        kernel_types.insert("file", KernelTypeId::File);
        kernel_types.insert("fd", KernelTypeId::Fd);
        kernel_types.insert("kiocb", KernelTypeId::Kiocb);
        Self { kernel_types }
    }

    /// Resolves `arg` in the context of a plain kprobe/uprobe/LSM argument
    /// (not the syscall-dispatch layer). Fails on an unknown type name or
    /// on `auto`/`syscall64`, which spec.md §4.A forbids here.
    pub fn resolve(&self, arg: &ArgSpec) -> EngineResult<ResolvedArgType> {
        if arg.resolve.is_some() {
            // The `resolve` path re-infers the final type from BTF (§4.B);
            // the registry only validates the textual tag isn't a
            // dispatch-only alias, the BTF resolver fills in kernel_type.
            if syscall_dispatch_only(&arg.ty) {
                return Err(EngineError::spec(format!(
                    "type '{}' is invalid for a resolve() chain",
                    arg.ty
                )));
            }
        }
        if syscall_dispatch_only(&arg.ty) {
            return Err(EngineError::spec(format!(
                "type '{}' is only valid at the syscall-dispatch layer",
                arg.ty
            )));
        }
        let kernel_type = *self
            .kernel_types
            .get(arg.ty.as_str())
            .ok_or_else(|| EngineError::spec(format!("unknown argument type '{}'", arg.ty)))?;

        Ok(ResolvedArgType {
            kernel_type,
            user_type: arg.ty.clone(),
            size_arg_index: arg.size_arg_index,
            max_data: arg.max_data,
            return_copy: arg.return_copy,
        })
    }

    /// Resolves an argument at the syscall-dispatch layer, where `auto`
    /// and `syscall64` are valid (spec.md §4.A).
    pub fn resolve_syscall_dispatch(&self, arg: &ArgSpec) -> EngineResult<ResolvedArgType> {
        if arg.ty == "auto" || arg.ty == "syscall64" {
            return Ok(ResolvedArgType {
                kernel_type: KernelTypeId::Syscall64,
                user_type: arg.ty.clone(),
                size_arg_index: arg.size_arg_index,
                max_data: arg.max_data,
                return_copy: arg.return_copy,
            });
        }
        self.resolve(arg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arg(ty: &str) -> ArgSpec {
        ArgSpec {
            index: 0,
            ty: ty.to_string(),
            resolve: None,
            size_arg_index: None,
            return_copy: false,
            max_data: false,
            label: None,
        }
    }

    #[test]
    fn rejects_auto_for_plain_kprobe_arg() {
        let reg = TypeRegistry::new();
        assert!(reg.resolve(&arg("auto")).is_err());
    }

    #[test]
    fn rejects_syscall64_for_plain_kprobe_arg() {
        let reg = TypeRegistry::new();
        assert!(reg.resolve(&arg("syscall64")).is_err());
    }

    #[test]
    fn accepts_auto_at_syscall_dispatch_layer() {
        let reg = TypeRegistry::new();
        let resolved = reg.resolve_syscall_dispatch(&arg("auto")).unwrap();
        assert_eq!(resolved.kernel_type, KernelTypeId::Syscall64);
    }

    #[test]
    fn accepts_syscall64_at_syscall_dispatch_layer() {
        let reg = TypeRegistry::new();
        let resolved = reg.resolve_syscall_dispatch(&arg("syscall64")).unwrap();
        assert_eq!(resolved.kernel_type, KernelTypeId::Syscall64);
    }

    #[test]
    fn rejects_unknown_type() {
        let reg = TypeRegistry::new();
        assert!(reg.resolve(&arg("not_a_type")).is_err());
    }

    #[test]
    fn arg_meta_bits_pack_size_arg_index() {
        let reg = TypeRegistry::new();
        let mut a = arg("char_buf");
        a.size_arg_index = Some(2);
        a.max_data = true;
        let resolved = reg.resolve(&a).unwrap();
        let bits = resolved.arg_meta_bits();
        assert_ne!(bits & arg_meta::HAS_SIZE_ARG, 0);
        assert_ne!(bits & arg_meta::MAX_DATA, 0);
        assert_eq!((bits & arg_meta::SIZE_ARG_MASK) >> arg_meta::SIZE_ARG_SHIFT, 2);
    }
}

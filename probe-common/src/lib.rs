#![cfg_attr(all(feature = "bpf", not(feature = "user")), no_std)]

//! Wire-format definitions shared between `probed` (userspace) and the
//! kernel-side BPF objects it loads and attaches.
//!
//! Everything here is `#[repr(C)]`/`Pod` so that the layout matches exactly
//! what the (opaque) BPF programs write into `config_map` and the event
//! ring buffer. See spec.md §6 "External interfaces" for the field-for-field
//! contract.

use bytemuck::{Pod, Zeroable};

/// Positional argument limit per probe (spec.md §8.10: `args[i].index > 4`
/// is rejected).
pub const EVENT_CONFIG_MAX_ARGS: usize = 5;

/// Maximum depth of a `resolve` field-dereference chain (spec.md §4.B).
pub const MAX_BTF_ARG_DEPTH: usize = 3;

/// Capacity of the per-probe pending-event LRU (spec.md §3, §8.3).
pub const PENDING_EVENTS_LRU_CAPACITY: usize = 4096;

/// One step of a BTF field-dereference chain, replayed by the kernel
/// program to reach the value named by `resolve`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct ConfigBtfArg {
    /// Byte offset of the field within its containing struct.
    pub offset: u32,
    /// Kernel type id of the field, as resolved from BTF.
    pub type_id: u32,
    /// Nonzero once a chain step has been populated; lets the kernel stop
    /// walking a shorter-than-`MAX_BTF_ARG_DEPTH` chain.
    pub is_initialized: u32,
    /// Set when this step dereferences a pointer rather than indexing a
    /// plain struct member.
    pub is_pointer: u32,
}

impl ConfigBtfArg {
    pub const fn zeroed() -> Self {
        Self {
            offset: 0,
            type_id: 0,
            is_initialized: 0,
            is_pointer: 0,
        }
    }
}

/// `config_map` record: one per compiled probe (spec.md §6).
///
/// `FuncId` is stamped with the probe's catalog id; events self-identify by
/// replaying it in the ring-buffer header (invariant 1 in spec.md §8).
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct ConfigMapRecord {
    pub policy_id: u32,
    pub func_id: u32,
    pub syscall: u32,

    pub arg_type: [i32; EVENT_CONFIG_MAX_ARGS],
    pub arg_meta: [u32; EVENT_CONFIG_MAX_ARGS],
    pub arg_index: [i32; EVENT_CONFIG_MAX_ARGS],
    pub arg_tp_ctx_off: [u32; EVENT_CONFIG_MAX_ARGS],

    pub arg_return: i32,
    pub arg_return_copy: i32,
    pub arg_return_action: u32,

    pub btf_arg: [[ConfigBtfArg; MAX_BTF_ARG_DEPTH]; EVENT_CONFIG_MAX_ARGS],
}

impl ConfigMapRecord {
    pub const fn zeroed() -> Self {
        Self {
            policy_id: 0,
            func_id: 0,
            syscall: 0,
            arg_type: [-1; EVENT_CONFIG_MAX_ARGS],
            arg_meta: [0; EVENT_CONFIG_MAX_ARGS],
            arg_index: [-1; EVENT_CONFIG_MAX_ARGS],
            arg_tp_ctx_off: [0; EVENT_CONFIG_MAX_ARGS],
            arg_return: 0,
            arg_return_copy: 0,
            arg_return_action: 0,
            btf_arg: [[ConfigBtfArg::zeroed(); MAX_BTF_ARG_DEPTH]; EVENT_CONFIG_MAX_ARGS],
        }
    }
}

/// `tg_conf_map` runtime conf record, single key 0 (spec.md §6).
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct RuntimeConfValue {
    pub log_level: u32,
    pub pid: u32,
    pub ns_pid: u32,
    pub tg_cgrp_hierarchy: u32,
    pub tg_cgrpv1_subsys_idx: u32,
    pub tg_cgrp_level: u32,
    pub tg_cgrp_id: u64,
    pub cgrp_fs_magic: u64,
}

impl RuntimeConfValue {
    pub const fn zeroed() -> Self {
        Self {
            log_level: 0,
            pid: 0,
            ns_pid: 0,
            tg_cgrp_hierarchy: 0,
            tg_cgrpv1_subsys_idx: 0,
            tg_cgrp_level: 0,
            tg_cgrp_id: 0,
            cgrp_fs_magic: 0,
        }
    }
}

/// Deployment mode, detected from cgroupfs / container metadata (spec.md §6).
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub enum DeployMode {
    Unknown = 0,
    K8s = 1,
    Container = 2,
    SdService = 3,
    SdUser = 4,
    Standalone = 5,
}

/// Fixed header every ring-buffer record starts with (spec.md §4.G, §6).
///
/// Field order is chosen so the layout has no padding: the three 8-byte
/// fields come first, then every 4-byte field, with an explicit `_pad` to
/// keep the total a multiple of the struct's 8-byte alignment. `bytemuck`'s
/// `Pod` derive rejects any layout with implicit padding, so this order is
/// load-bearing, not cosmetic.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct EventHeader {
    pub ktime: u64,
    pub kernel_stack_id: i64,
    pub user_stack_id: i64,
    pub op: u32,
    pub size: u32,
    pub flags: u32,
    pub pid: u32,
    pub tid: u32,
    pub func_id: u32,
    pub ret_probe_id: u32,
    pub action_id: i32,
    pub action_arg_id: u32,
    pub _pad: u32,
}

/// `flags` bit layout on [`EventHeader`].
pub mod event_flags {
    pub const RETURN: u32 = 1 << 0;
    pub const HAS_KERNEL_STACK: u32 = 1 << 1;
    pub const HAS_USER_STACK: u32 = 1 << 2;
}

/// Message-op discriminant dispatched by the demultiplexer.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MessageOp {
    GenericKprobe = 0,
    GenericTracepoint = 1,
    GenericUprobe = 2,
    GenericLsm = 3,
}

/// Textual argument type tags accepted in a policy spec, and the kernel
/// decoder id each maps to (spec.md §4.A, §4.G). `repr(i32)` so it can be
/// stored directly in [`ConfigMapRecord::arg_type`].
#[repr(i32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum KernelTypeId {
    Invalid = -1,
    U64 = 0,
    S64 = 1,
    U32 = 2,
    S32 = 3,
    Int = 4,
    Size = 5,
    CharBuf = 6,
    CharIovec = 7,
    ConstBuf = 8,
    Str = 9,
    DataLoc = 10,
    Skb = 11,
    Sock = 12,
    SockAddr = 13,
    Syscall64 = 14,
    LinuxBinprm = 15,
    File = 16,
    Fd = 17,
    Kiocb = 18,
}

/// Bits packed into `ArgMeta` for a compiled argument (spec.md §4.A).
pub mod arg_meta {
    pub const RETURN_COPY: u32 = 1 << 0;
    pub const MAX_DATA: u32 = 1 << 1;
    pub const HAS_SIZE_ARG: u32 = 1 << 2;
    pub const SIZE_ARG_SHIFT: u32 = 8;
    pub const SIZE_ARG_MASK: u32 = 0xff << SIZE_ARG_SHIFT;
}

/// `ActionType` enum (spec.md §4.C).
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub enum ActionType {
    Invalid = 0,
    Post = 1,
    Sigkill = 2,
    Override = 3,
    GetUrl = 4,
    DnsLookup = 5,
    NotifyEnforcer = 6,
    TrackSock = 7,
    UntrackSock = 8,
}

/// Char buffer argument size limits (spec.md §4.G).
pub const CHAR_BUF_DEFAULT_CAP: usize = 4096;
pub const CHAR_BUF_MAX_DATA_CAP: usize = 327_360;

/// Minimum kernel version gates referenced throughout §4.C.
pub mod kernel_gate {
    /// `kprobe_multi` / unified selector inner-map sizing.
    pub const MULTI_PROBE_MIN: (u32, u32, u32) = (5, 9, 0);
    /// Exact-string selector sub-map fan-out.
    pub const STRING_SUBMAP_MIN: (u32, u32, u32) = (5, 11, 0);
    /// `maxData` char_buf extension beyond 4 KiB.
    pub const MAX_DATA_MIN: (u32, u32, u32) = (5, 4, 0);
    /// "large programs" feature gate (`Sigkill`, wide const_buf decode).
    pub const LARGE_PROGRAMS_MIN: (u32, u32, u32) = (5, 3, 0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn config_map_record_is_pod_sized_and_zeroed_valid() {
        let rec = ConfigMapRecord::zeroed();
        assert_eq!(rec.arg_type, [-1; EVENT_CONFIG_MAX_ARGS]);
        assert_eq!(rec.arg_index, [-1; EVENT_CONFIG_MAX_ARGS]);
        assert!(size_of::<ConfigMapRecord>() > 0);
    }

    #[test]
    fn event_header_has_no_padding() {
        // Field order is hand-picked to avoid padding; assert the total
        // stays exactly the sum of field sizes so layout drift is caught.
        assert_eq!(size_of::<EventHeader>(), 64);
    }

    #[cfg(feature = "user")]
    #[test]
    fn action_type_roundtrips_through_json() {
        let json = serde_json::to_string(&ActionType::DnsLookup).unwrap();
        let back: ActionType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ActionType::DnsLookup);
    }
}

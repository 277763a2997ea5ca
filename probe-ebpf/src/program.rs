//! Kernel-side program skeleton.
//!
//! Kernel-side code is explicitly out of scope (spec.md §1): "we do not
//! specify kernel-side code". This crate exists only so the workspace
//! produces the opaque ELF artifact that `probed::builder` and
//! `probed::loader` describe and attach (spec.md §1, §4.E, §4.F) — the
//! program sections, map names and `config_map` layout below are the
//! published contract those two components assume, nothing more.

use aya_ebpf::{
    macros::{kprobe, kretprobe, map, tracepoint},
    maps::{Array, PerfEventArray},
    programs::{ProbeContext, TracePointContext},
};
use probe_common::{ConfigMapRecord, RuntimeConfValue};

#[map(name = "config_map")]
static mut CONFIG_MAP: Array<ConfigMapRecord> = Array::with_max_entries(256, 0);

#[map(name = "tg_conf_map")]
static mut TG_CONF_MAP: Array<RuntimeConfValue> = Array::with_max_entries(1, 0);

#[map(name = "events")]
static mut EVENTS: PerfEventArray<[u8; 256]> = PerfEventArray::new(0);

/// `kprobe/generic_kprobe` section (spec.md §4.E program/map spec).
#[kprobe]
pub fn generic_kprobe(_ctx: ProbeContext) -> u32 {
    0
}

/// `kretprobe/generic_kprobe` section, used when a probe's `return: true`.
#[kretprobe]
pub fn generic_kretprobe(_ctx: ProbeContext) -> u32 {
    0
}

/// `tracepoint/generic_tracepoint` section.
#[tracepoint]
pub fn generic_tracepoint(_ctx: TracePointContext) -> u32 {
    0
}

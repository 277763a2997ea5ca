//! Component E: program / map builder (spec.md §4.E).
//!
//! Takes already-resolved, already-selector-compiled probes and emits the
//! program descriptors plus the exact list of kernel maps the group
//! needs, applying the sizing policy in spec.md §4.E. Call-site specific
//! `Override` gating (non-syscall, security_* fmod_ret, multi-probe
//! rejection) happens here because this is the first place the probe's
//! hook name and the group's multi-probe decision are both known.

use std::sync::Arc;

use probe_common::ConfigMapRecord;

use crate::capabilities::KernelCapabilities;
use crate::errors::{EngineError, EngineResult};
use crate::selector::{actions::validate_override_context, CompiledAction, CompiledSelectorState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramKind {
    Kprobe,
    Kretprobe,
    Tracepoint,
    Uprobe,
    Lsm,
}

/// One probe ready to attach: its kernel config record plus the compiled
/// selector state it was paired with (spec.md §6 / §4.D).
#[derive(Debug, Clone)]
pub struct CompiledProbe {
    pub func_id: u32,
    pub hook_name: String,
    pub is_syscall: bool,
    pub kind: ProgramKind,
    pub config: ConfigMapRecord,
    pub entry_selectors: Arc<CompiledSelectorState>,
    pub return_selectors: Option<Arc<CompiledSelectorState>>,
    /// 0-based disambiguator for a symbol traced more than once in the same
    /// policy (spec.md §3 "funcName + instance", §8 invariant #5).
    pub instance: u32,
}

#[derive(Debug, Clone)]
pub struct ProgramDescriptor {
    pub kind: ProgramKind,
    /// Symbols attached by this program; length 1 for single-probe mode,
    /// the whole list for multi-probe (spec.md §4.F).
    pub symbols: Vec<String>,
    /// `cookies[i] = i`, populated only in multi-probe mode (spec.md
    /// §4.F) so the kernel side can recover which symbol fired.
    pub cookies: Vec<u32>,
    /// Sub-list of `symbols` that requested `Override` (spec.md §4.F).
    pub overrides: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapDescriptor {
    pub name: &'static str,
    pub max_entries: u32,
}

#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub programs: Vec<ProgramDescriptor>,
    pub maps: Vec<MapDescriptor>,
}

fn uses_override(probe: &CompiledProbe) -> bool {
    probe
        .entry_selectors
        .selectors
        .iter()
        .flat_map(|s| &s.actions)
        .any(|a| matches!(a, CompiledAction::Override(_)))
}

fn uses_stack_trace(probe: &CompiledProbe) -> bool {
    probe
        .entry_selectors
        .selectors
        .iter()
        .flat_map(|s| &s.actions)
        .any(|a| match a {
            CompiledAction::Post {
                kernel_stack_trace,
                user_stack_trace,
                ..
            } => *kernel_stack_trace || *user_stack_trace,
            _ => false,
        })
}

pub fn build_group(
    probes: &[CompiledProbe],
    multi_probe: bool,
    caps: &KernelCapabilities,
) -> EngineResult<BuildOutput> {
    if probes.is_empty() {
        return Ok(BuildOutput {
            programs: vec![],
            maps: vec![],
        });
    }

    if multi_probe {
        if let Some(probe) = probes.iter().find(|p| p.instance > 0) {
            return Err(EngineError::spec(format!(
                "symbol '{}' instance {} can't be attached with kprobe_multi (spec.md §8 invariant #5)",
                probe.hook_name, probe.instance
            )));
        }
    }

    let mut overrides = Vec::new();
    for probe in probes {
        if uses_override(probe) {
            validate_override_context(probe.is_syscall, &probe.hook_name, caps, multi_probe)
                .map_err(EngineError::spec)?;
            overrides.push(probe.hook_name.clone());
        }
    }

    let programs = if multi_probe {
        vec![ProgramDescriptor {
            kind: probes[0].kind,
            symbols: probes.iter().map(|p| p.hook_name.clone()).collect(),
            cookies: (0..probes.len() as u32).collect(),
            overrides,
        }]
    } else {
        probes
            .iter()
            .map(|p| ProgramDescriptor {
                kind: p.kind,
                symbols: vec![p.hook_name.clone()],
                cookies: vec![],
                overrides: if uses_override(p) {
                    vec![p.hook_name.clone()]
                } else {
                    vec![]
                },
            })
            .collect()
    };

    let needs_stack_trace = probes.iter().any(uses_stack_trace);
    let needs_override_tasks = !overrides.is_empty();
    let needs_fdinstall = probes.iter().any(|p| {
        p.entry_selectors
            .selectors
            .iter()
            .flat_map(|s| &s.actions)
            .any(|a| matches!(a, CompiledAction::TrackSock | CompiledAction::UntrackSock))
    });
    let needs_ratelimit = probes
        .iter()
        .any(|p| p.entry_selectors.selectors.iter().any(|s| s.rate_limit_seconds.is_some()));

    let group_size = probes.len() as u32;
    let mut maps = vec![
        MapDescriptor {
            name: "config_map",
            max_entries: group_size,
        },
        MapDescriptor {
            name: "filter_map",
            max_entries: group_size,
        },
    ];

    maps.push(sized_or_minimal("stack_trace_map", needs_stack_trace, group_size));
    maps.push(sized_or_minimal("ratelimit_map", needs_ratelimit, group_size));
    maps.push(sized_or_minimal("fdinstall_map", needs_fdinstall, group_size));
    maps.push(sized_or_minimal("override_tasks", needs_override_tasks, group_size));

    let inner_map_unified = !caps.supports_kprobe_multi();
    for probe in probes {
        for sel in &probe.entry_selectors.selectors {
            let string_entries = if caps.supports_string_submap() {
                sel.match_binaries.iter().map(|b| b.values.len()).sum()
            } else {
                sel.match_binaries.len().min(1)
            };
            if string_entries > 0 || inner_map_unified {
                push_or_grow(&mut maps, "tg_mb_sel_opts", string_entries.max(1) as u32);
            }
        }
    }

    Ok(BuildOutput { programs, maps })
}

fn sized_or_minimal(name: &'static str, used: bool, group_size: u32) -> MapDescriptor {
    MapDescriptor {
        name,
        max_entries: if used { group_size.max(1) } else { 1 },
    }
}

fn push_or_grow(maps: &mut Vec<MapDescriptor>, name: &'static str, entries: u32) {
    if let Some(existing) = maps.iter_mut().find(|m| m.name == name) {
        existing.max_entries = existing.max_entries.max(entries);
    } else {
        maps.push(MapDescriptor {
            name,
            max_entries: entries,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::KernelVersion;
    use crate::selector::compiler::{CompiledSelectorState, SelectorInnerMaps};

    fn caps() -> KernelCapabilities {
        KernelCapabilities::for_version(KernelVersion(6, 1, 0))
    }

    fn probe(hook: &str, is_syscall: bool) -> CompiledProbe {
        CompiledProbe {
            func_id: 1,
            hook_name: hook.into(),
            is_syscall,
            kind: ProgramKind::Kprobe,
            config: ConfigMapRecord::zeroed(),
            entry_selectors: Arc::new(CompiledSelectorState {
                packed: vec![],
                selectors: vec![],
                inner_maps: SelectorInnerMaps::default(),
            }),
            return_selectors: None,
            instance: 0,
        }
    }

    #[test]
    fn single_probe_mode_never_assigns_multi_probe_cookies() {
        let probes = vec![probe("sys_openat", true)];
        let out = build_group(&probes, false, &caps()).unwrap();
        assert_eq!(out.programs.len(), 1);
        assert!(out.programs[0].cookies.is_empty());
    }

    #[test]
    fn multi_probe_mode_assigns_sequential_cookies() {
        let probes = vec![probe("sys_openat", true), probe("sys_close", true)];
        let out = build_group(&probes, true, &caps()).unwrap();
        assert_eq!(out.programs.len(), 1);
        assert_eq!(out.programs[0].cookies, vec![0, 1]);
    }

    #[test]
    fn multi_probe_rejects_instance_greater_than_zero() {
        let mut second = probe("sys_openat", true);
        second.instance = 1;
        let probes = vec![probe("sys_openat", true), second];
        assert!(build_group(&probes, true, &caps()).is_err());
    }

    #[test]
    fn single_probe_mode_allows_instance_greater_than_zero() {
        let mut second = probe("sys_openat", true);
        second.instance = 1;
        let probes = vec![probe("sys_openat", true), second];
        assert!(build_group(&probes, false, &caps()).is_ok());
    }

    #[test]
    fn config_and_filter_maps_size_to_group() {
        let probes = vec![probe("a", false), probe("b", false), probe("c", false)];
        let out = build_group(&probes, false, &caps()).unwrap();
        let config = out.maps.iter().find(|m| m.name == "config_map").unwrap();
        assert_eq!(config.max_entries, 3);
    }

    #[test]
    fn unused_optional_maps_stay_at_capacity_one() {
        let probes = vec![probe("a", false)];
        let out = build_group(&probes, false, &caps()).unwrap();
        let stack = out.maps.iter().find(|m| m.name == "stack_trace_map").unwrap();
        assert_eq!(stack.max_entries, 1);
    }
}

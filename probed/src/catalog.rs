//! Component D: probe catalog (spec.md §4.D).
//!
//! A process-wide id-keyed table. Grounded on the teacher's use of
//! `dashmap::DashMap` for concurrent lookup tables (`handler/ddos.rs`,
//! `handler/warmth.rs`), generalized from a string-keyed event counter to
//! an opaque-id-keyed probe table. Collapses the original's cyclic
//! probe/selector/action-arg ownership into one owner (spec.md §9): the
//! catalog entry owns its compiled selector state outright.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use probe_common::ConfigMapRecord;

use crate::selector::CompiledSelectorState;

/// Opaque catalog key. `0` is reserved "uninitialized" (spec.md §4.D);
/// `next()` never returns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProbeId(pub u32);

impl ProbeId {
    pub const UNINITIALIZED: ProbeId = ProbeId(0);

    pub fn is_initialized(&self) -> bool {
        self.0 != 0
    }
}

#[derive(Debug, Clone)]
pub struct KprobeEntry {
    pub symbol: String,
    pub is_return: bool,
    pub is_syscall: bool,
}

#[derive(Debug, Clone)]
pub struct TracepointEntry {
    pub subsystem: String,
    pub event: String,
}

#[derive(Debug, Clone)]
pub struct UprobeEntry {
    pub path: String,
    pub symbol: String,
}

#[derive(Debug, Clone)]
pub struct LsmEntry {
    pub hook: String,
}

/// Tagged variant replacing the original's `interface{}`-typed table
/// value (spec.md §9).
#[derive(Debug, Clone)]
pub enum ProbeKind {
    Kprobe(KprobeEntry),
    Tracepoint(TracepointEntry),
    Uprobe(UprobeEntry),
    Lsm(LsmEntry),
}

/// One catalog entry. Entry-side and return-side selector states are
/// distinct (a kprobe and its paired kretprobe validate different
/// clauses), so both are held and both are torn down on removal (spec.md
/// §4.D: "destruction cleans up both entry and return selector states").
#[derive(Debug, Clone)]
pub struct ProbeEntry {
    pub id: ProbeId,
    pub policy_id: u32,
    pub kind: ProbeKind,
    /// The record this probe's `config_map` slot was loaded with; the
    /// demultiplexer reads `arg_type`/`arg_meta` back out of it to decode
    /// the probe's argument bytes (spec.md §4.G/§6).
    pub config: ConfigMapRecord,
    pub entry_selectors: Arc<CompiledSelectorState>,
    pub return_selectors: Option<Arc<CompiledSelectorState>>,
    pub pin_name: String,
    /// 0-based disambiguator for a symbol traced more than once in the same
    /// policy (spec.md §3 "funcName + instance"). `0` for the first probe on
    /// a given symbol, `1` for the second, and so on.
    pub instance: u32,
    /// Free-text annotation surfaced with this probe's events, truncated to
    /// 256 chars at compile time (spec.md §6, §8 boundary behavior #8).
    pub message: Option<String>,
}

/// The process-wide id-keyed table (spec.md §4.D / §5 / §9: "the only
/// process-wide mutable state; all mutation gated by policy lifecycle
/// calls"). Reads never block: `DashMap::get` takes a per-shard read
/// lock, never a global one, so concurrent readers and a concurrent
/// `remove_entry` from policy unload never contend process-wide.
pub struct Catalog {
    entries: DashMap<ProbeId, ProbeEntry>,
    next_id: AtomicU64,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> ProbeId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        ProbeId(id as u32)
    }

    pub fn add_entry(&self, entry: ProbeEntry) {
        self.entries.insert(entry.id, entry);
    }

    pub fn get_entry(&self, id: ProbeId) -> Option<ProbeEntry> {
        self.entries.get(&id).map(|e| e.clone())
    }

    pub fn remove_entry(&self, id: ProbeId) -> Option<ProbeEntry> {
        self.entries.remove(&id).map(|(_, e)| e)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every entry belonging to `policy_id`, returning them so
    /// the caller (the loader, on unload) can tear down their pinned
    /// maps too (spec.md §8 invariant #4).
    pub fn remove_policy(&self, policy_id: u32) -> Vec<ProbeEntry> {
        let ids: Vec<ProbeId> = self
            .entries
            .iter()
            .filter(|e| e.value().policy_id == policy_id)
            .map(|e| *e.key())
            .collect();
        ids.into_iter().filter_map(|id| self.remove_entry(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::compiler::CompiledSelectorState;
    use crate::selector::SelectorInnerMaps;

    fn empty_state() -> Arc<CompiledSelectorState> {
        Arc::new(CompiledSelectorState {
            packed: vec![],
            selectors: vec![],
            inner_maps: SelectorInnerMaps::default(),
        })
    }

    #[test]
    fn ids_start_nonzero_and_increment() {
        let catalog = Catalog::new();
        let a = catalog.next_id();
        let b = catalog.next_id();
        assert!(a.is_initialized());
        assert_ne!(a, b);
    }

    #[test]
    fn remove_entry_cleans_up_both_selector_states() {
        let catalog = Catalog::new();
        let id = catalog.next_id();
        catalog.add_entry(ProbeEntry {
            id,
            policy_id: 1,
            kind: ProbeKind::Kprobe(KprobeEntry {
                symbol: "sys_openat".into(),
                is_return: false,
                is_syscall: true,
            }),
            config: ConfigMapRecord::zeroed(),
            entry_selectors: empty_state(),
            return_selectors: Some(empty_state()),
            pin_name: "sys_openat".into(),
            instance: 0,
            message: None,
        });
        assert_eq!(catalog.len(), 1);
        let removed = catalog.remove_entry(id).unwrap();
        assert!(removed.return_selectors.is_some());
        assert!(catalog.is_empty());
    }

    #[test]
    fn remove_policy_clears_every_entry_for_that_policy() {
        let catalog = Catalog::new();
        for _ in 0..3 {
            let id = catalog.next_id();
            catalog.add_entry(ProbeEntry {
                id,
                policy_id: 7,
                kind: ProbeKind::Tracepoint(TracepointEntry {
                    subsystem: "sched".into(),
                    event: "sched_process_exec".into(),
                }),
                config: ConfigMapRecord::zeroed(),
                entry_selectors: empty_state(),
                return_selectors: None,
                pin_name: format!("p{}", id.0),
                instance: 0,
                message: None,
            });
        }
        assert_eq!(catalog.len(), 3);
        let removed = catalog.remove_policy(7);
        assert_eq!(removed.len(), 3);
        assert!(catalog.is_empty());
    }
}

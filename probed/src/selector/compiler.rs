//! Component C: selector compiler (spec.md §4.C).
//!
//! ORs across `selectors[]` entries (a match on any one selector passes);
//! ANDs the clauses within one selector. The packed byte layout is
//! produced by [`crate::selector::state`]; side maps here are described
//! structurally (exact-string sub-maps, LPM families, arg-value maps) and
//! sized down on older kernels per §4.C's edge-case policy.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::capabilities::KernelCapabilities;
use crate::errors::{EngineError, EngineResult};
use crate::policy::selectors::{
    ArgSelector, BinarySelector, CapabilitySelector, NamespaceKind, NamespaceSelector,
    PidSelector, RateLimitScope,
};
use crate::policy::SelectorSpec;
use crate::selector::actions::{compile_actions, CompiledAction};
use crate::selector::state::{
    write_arg_selector, write_binary_selector, write_capability_selector,
    write_namespace_selector, write_pid_selector, SelectorWriter,
};

/// One OR-branch's worth of side data the kernel needs besides the
/// packed byte buffer: actions plus rate-limit parameters (spec.md §4.C).
#[derive(Debug, Clone)]
pub struct CompiledSelector {
    pub match_pids: Vec<PidSelector>,
    pub match_binaries: Vec<BinarySelector>,
    pub match_args: Vec<ArgSelector>,
    pub match_return_args: Vec<ArgSelector>,
    pub match_namespaces: Vec<NamespaceSelector>,
    pub match_namespace_changes: Vec<NamespaceKind>,
    pub match_capabilities: Vec<CapabilitySelector>,
    pub match_capability_changes: Vec<CapabilitySelector>,
    pub actions: Vec<CompiledAction>,
    pub rate_limit_seconds: Option<u64>,
    pub rate_limit_scope: Option<RateLimitScope>,
}

/// Exact-string / LPM / arg-value side maps a compiled selector populates
/// (spec.md §4.C). Named fields rather than one opaque blob so the
/// builder can size each kernel map independently.
#[derive(Debug, Clone, Default)]
pub struct SelectorInnerMaps {
    pub exact_string_entries: usize,
    pub lpm_v4_entries: usize,
    pub lpm_v6_entries: usize,
    pub arg_value_entries: usize,
    pub prefix_postfix_entries: usize,
}

#[derive(Debug, Clone)]
pub struct CompiledSelectorState {
    pub packed: Vec<u8>,
    pub selectors: Vec<CompiledSelector>,
    pub inner_maps: SelectorInnerMaps,
}

fn canonical_key(selectors: &[SelectorSpec]) -> u64 {
    // Canonicalizing on the Debug text is coarse but stable and order
    // sensitive the same way the source selectors are; good enough for
    // a dedup cache whose only job is to avoid recompiling byte-identical
    // trees (spec.md §3 supplement).
    let mut hasher = DefaultHasher::new();
    for sel in selectors {
        format!("{sel:?}").hash(&mut hasher);
    }
    hasher.finish()
}

/// Compiles selector trees, sharing the packed state for selector lists
/// that canonicalize to the same AST (spec.md §3 supplement: multiple
/// probes in a policy commonly repeat an identical selector).
pub struct SelectorCompiler {
    caps: KernelCapabilities,
    cache: HashMap<u64, Arc<CompiledSelectorState>>,
}

impl SelectorCompiler {
    pub fn new(caps: KernelCapabilities) -> Self {
        Self {
            caps,
            cache: HashMap::new(),
        }
    }

    pub fn compile(&mut self, selectors: &[SelectorSpec]) -> EngineResult<Arc<CompiledSelectorState>> {
        let key = canonical_key(selectors);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(Arc::clone(cached));
        }
        let compiled = Arc::new(self.compile_uncached(selectors)?);
        self.cache.insert(key, Arc::clone(&compiled));
        Ok(compiled)
    }

    fn compile_uncached(&self, selectors: &[SelectorSpec]) -> EngineResult<CompiledSelectorState> {
        let mut writer = SelectorWriter::new();
        let mut compiled_selectors = Vec::with_capacity(selectors.len());
        let mut inner_maps = SelectorInnerMaps::default();

        writer.u32(selectors.len() as u32);

        for spec in selectors {
            let actions = compile_actions(&spec.match_actions, &self.caps)
                .map_err(EngineError::selector_compile)?;

            writer.u32(spec.match_pids.len() as u32);
            for pid in &spec.match_pids {
                write_pid_selector(&mut writer, pid);
            }

            writer.u32(spec.match_binaries.len() as u32);
            for bin in &spec.match_binaries {
                write_binary_selector(&mut writer, bin);
                inner_maps.exact_string_entries += bin.values.len();
            }

            writer.u32(spec.match_args.len() as u32);
            for arg in &spec.match_args {
                write_arg_selector(&mut writer, arg);
                inner_maps.arg_value_entries += arg.values.len();
            }

            writer.u32(spec.match_return_args.len() as u32);
            for arg in &spec.match_return_args {
                write_arg_selector(&mut writer, arg);
                inner_maps.arg_value_entries += arg.values.len();
            }

            writer.u32(spec.match_namespaces.len() as u32);
            for ns in &spec.match_namespaces {
                write_namespace_selector(&mut writer, ns);
            }

            writer.u32(spec.match_capabilities.len() as u32);
            for cap in &spec.match_capabilities {
                write_capability_selector(&mut writer, cap);
            }

            writer.u32(spec.match_capability_changes.len() as u32);
            for cap in &spec.match_capability_changes {
                write_capability_selector(&mut writer, cap);
            }

            if !self.caps.supports_string_submap() {
                // Below 5.11 the exact-string submap count collapses
                // (spec.md §4.C edge case); callers size a single shared
                // submap instead of one per selector.
                inner_maps.exact_string_entries = inner_maps.exact_string_entries.min(1);
            }

            let rate_limit_seconds = spec
                .rate_limit
                .as_deref()
                .map(crate::policy::selectors::parse_rate_limit_duration)
                .transpose()
                .map_err(EngineError::selector_compile)?;
            let rate_limit_scope = spec
                .rate_limit_scope
                .as_deref()
                .map(str::parse::<RateLimitScope>)
                .transpose()
                .map_err(EngineError::selector_compile)?;

            compiled_selectors.push(CompiledSelector {
                match_pids: spec.match_pids.clone(),
                match_binaries: spec.match_binaries.clone(),
                match_args: spec.match_args.clone(),
                match_return_args: spec.match_return_args.clone(),
                match_namespaces: spec.match_namespaces.clone(),
                match_namespace_changes: spec.match_namespace_changes.clone(),
                match_capabilities: spec.match_capabilities.clone(),
                match_capability_changes: spec.match_capability_changes.clone(),
                actions,
                rate_limit_seconds,
                rate_limit_scope,
            });
        }

        Ok(CompiledSelectorState {
            packed: writer.into_bytes(),
            selectors: compiled_selectors,
            inner_maps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::KernelVersion;

    fn caps() -> KernelCapabilities {
        KernelCapabilities::for_version(KernelVersion(6, 1, 0))
    }

    #[test]
    fn compiling_identical_selectors_shares_cached_state() {
        let mut compiler = SelectorCompiler::new(caps());
        let spec = SelectorSpec::default();
        let a = compiler.compile(std::slice::from_ref(&spec)).unwrap();
        let b = compiler.compile(std::slice::from_ref(&spec)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn packed_encoding_round_trips_to_identical_bytes() {
        let mut compiler = SelectorCompiler::new(caps());
        let spec = SelectorSpec {
            match_pids: vec![PidSelector {
                operator: crate::policy::selectors::Operator::In,
                values: vec![42],
                is_namespace_pid: false,
                follow_forks: true,
            }],
            ..Default::default()
        };
        let compiled = compiler.compile(std::slice::from_ref(&spec)).unwrap();
        let packed_again = compiler
            .compile_uncached(std::slice::from_ref(&spec))
            .unwrap();
        assert_eq!(compiled.packed, packed_again.packed);
    }
}

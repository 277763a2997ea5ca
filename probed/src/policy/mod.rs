//! Policy spec schema (spec.md §6). Parsing YAML/CRD text into this shape
//! is a collaborator's job (spec.md §1's "policy loader / CRD schema
//! intake"); this engine only needs to accept, validate and compile it.

pub mod args;
pub mod selectors;

use std::collections::HashMap;

use serde::Deserialize;

pub use args::ArgSpec;
pub use selectors::SelectorSpec;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum ReturnArgAction {
    Post,
    TrackSock,
    UntrackSock,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IgnoreSpec {
    #[serde(default, rename = "callNotFound")]
    pub call_not_found: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KprobeSpec {
    pub call: String,
    #[serde(default)]
    pub r#return: bool,
    #[serde(default)]
    pub syscall: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub args: Vec<ArgSpec>,
    #[serde(default, rename = "returnArg")]
    pub return_arg: Option<ArgSpec>,
    #[serde(default, rename = "returnArgAction")]
    pub return_arg_action: Option<ReturnArgAction>,
    #[serde(default)]
    pub selectors: Vec<SelectorSpec>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub ignore: IgnoreSpec,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TracepointSpec {
    pub subsystem: String,
    pub event: String,
    #[serde(default)]
    pub args: Vec<ArgSpec>,
    #[serde(default)]
    pub selectors: Vec<SelectorSpec>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UprobeSpec {
    pub path: String,
    pub symbol: String,
    #[serde(default)]
    pub r#return: bool,
    #[serde(default)]
    pub args: Vec<ArgSpec>,
    #[serde(default)]
    pub selectors: Vec<SelectorSpec>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LsmHookSpec {
    pub hook: String,
    #[serde(default)]
    pub args: Vec<ArgSpec>,
    #[serde(default)]
    pub selectors: Vec<SelectorSpec>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// `options[]`: free-form `{name, value}` pairs, typed here rather than
/// passed around as untyped strings (spec.md §3 supplement).
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyOptionRaw {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default)]
pub struct PolicyOptions {
    raw: HashMap<String, String>,
}

impl PolicyOptions {
    pub fn from_raw(options: &[PolicyOptionRaw]) -> Self {
        Self {
            raw: options
                .iter()
                .map(|o| (o.name.clone(), o.value.clone()))
                .collect(),
        }
    }

    pub fn disable_kprobe_multi(&self) -> bool {
        self.raw
            .get("disable-kprobe-multi")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.raw.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnforcerSpec {
    pub name: String,
    #[serde(default)]
    pub calls: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicySpec {
    pub name: String,
    #[serde(default)]
    pub kprobes: Vec<KprobeSpec>,
    #[serde(default)]
    pub tracepoints: Vec<TracepointSpec>,
    #[serde(default)]
    pub uprobes: Vec<UprobeSpec>,
    #[serde(default, rename = "lsmHooks")]
    pub lsm_hooks: Vec<LsmHookSpec>,
    #[serde(default)]
    pub lists: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub options: Vec<PolicyOptionRaw>,
    #[serde(default)]
    pub enforcers: Vec<EnforcerSpec>,
}

impl PolicySpec {
    pub fn options(&self) -> PolicyOptions {
        PolicyOptions::from_raw(&self.options)
    }

    /// Expands a `call` referencing a named list in `lists[]` into one
    /// kprobe spec per listed symbol (spec.md §3 supplement, grounded on
    /// the original's list-expansion pass). Calls not matching a list name
    /// pass through unchanged.
    pub fn expand_lists(&self) -> Vec<KprobeSpec> {
        let mut expanded = Vec::with_capacity(self.kprobes.len());
        for kp in &self.kprobes {
            match self.lists.get(&kp.call) {
                Some(symbols) => {
                    for sym in symbols {
                        let mut clone = kp.clone();
                        clone.call = sym.clone();
                        expanded.push(clone);
                    }
                }
                None => expanded.push(kp.clone()),
            }
        }
        expanded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_kprobe(call: &str) -> KprobeSpec {
        KprobeSpec {
            call: call.to_string(),
            r#return: false,
            syscall: false,
            message: None,
            args: vec![],
            return_arg: None,
            return_arg_action: None,
            selectors: vec![],
            tags: vec![],
            ignore: IgnoreSpec::default(),
        }
    }

    #[test]
    fn expand_lists_substitutes_named_list() {
        let mut lists = HashMap::new();
        lists.insert(
            "net-syscalls".to_string(),
            vec!["sys_connect".to_string(), "sys_accept".to_string()],
        );
        let spec = PolicySpec {
            name: "p".into(),
            kprobes: vec![base_kprobe("net-syscalls"), base_kprobe("sys_openat")],
            lists,
            ..Default::default()
        };
        let expanded = spec.expand_lists();
        let calls: Vec<_> = expanded.iter().map(|k| k.call.as_str()).collect();
        assert_eq!(calls, vec!["sys_connect", "sys_accept", "sys_openat"]);
    }

    #[test]
    fn options_typed_accessor_reads_disable_kprobe_multi() {
        let spec = PolicySpec {
            name: "p".into(),
            options: vec![PolicyOptionRaw {
                name: "disable-kprobe-multi".into(),
                value: "true".into(),
            }],
            ..Default::default()
        };
        assert!(spec.options().disable_kprobe_multi());
    }
}

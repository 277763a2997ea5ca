//! Action compilation (spec.md §4.C, second half): turns declarative
//! `matchActions[]` entries into the kernel `ActionType` plus an
//! action-argument side table, enforcing the kernel-version floors that
//! don't depend on which probe the selector is attached to. Call-site
//! specific gating (non-syscall `Override`, multi-probe rejection) lives
//! in [`crate::builder`], which has the probe context this module lacks.

use probe_common::ActionType;

use crate::capabilities::KernelCapabilities;
use crate::policy::selectors::{signal_number, ActionSpec, RateLimitScope};

/// A resolved action plus whatever argument the kernel side needs looked
/// up by id from the action-argument side table (spec.md §4.C/§4.H).
#[derive(Debug, Clone, PartialEq)]
pub enum CompiledAction {
    Post {
        kernel_stack_trace: bool,
        user_stack_trace: bool,
        ima_hash: bool,
    },
    Sigkill,
    Signal(i32),
    Override(i64),
    GetUrl(String),
    DnsLookup(String),
    NotifyEnforcer { error: i32, sig: i32 },
    TrackSock,
    UntrackSock,
}

impl CompiledAction {
    pub fn action_type(&self) -> ActionType {
        match self {
            Self::Post { .. } => ActionType::Post,
            Self::Sigkill => ActionType::Sigkill,
            Self::Signal(_) => ActionType::Sigkill,
            Self::Override(_) => ActionType::Override,
            Self::GetUrl(_) => ActionType::GetUrl,
            Self::DnsLookup(_) => ActionType::DnsLookup,
            Self::NotifyEnforcer { .. } => ActionType::NotifyEnforcer,
            Self::TrackSock => ActionType::TrackSock,
            Self::UntrackSock => ActionType::UntrackSock,
        }
    }
}

pub fn compile_actions(
    actions: &[ActionSpec],
    caps: &KernelCapabilities,
) -> Result<Vec<CompiledAction>, String> {
    actions.iter().map(|a| compile_action(a, caps)).collect()
}

fn compile_action(action: &ActionSpec, caps: &KernelCapabilities) -> Result<CompiledAction, String> {
    match action {
        ActionSpec::Post {
            kernel_stack_trace,
            user_stack_trace,
            ima_hash,
        } => Ok(CompiledAction::Post {
            kernel_stack_trace: *kernel_stack_trace,
            user_stack_trace: *user_stack_trace,
            ima_hash: *ima_hash,
        }),
        ActionSpec::Sigkill => {
            require_large_programs(caps)?;
            Ok(CompiledAction::Sigkill)
        }
        ActionSpec::Signal { arg_sig } => {
            require_large_programs(caps)?;
            Ok(CompiledAction::Signal(signal_number(arg_sig)?))
        }
        ActionSpec::Override { arg_error } => {
            if !caps.bpf_override_return {
                return Err(
                    "override action requires kernel support for bpf_override_return".into(),
                );
            }
            Ok(CompiledAction::Override(*arg_error))
        }
        ActionSpec::GetUrl { arg_url } => Ok(CompiledAction::GetUrl(arg_url.clone())),
        ActionSpec::DnsLookup { arg_fqdn } => Ok(CompiledAction::DnsLookup(arg_fqdn.clone())),
        ActionSpec::NotifyEnforcer { arg_error, arg_sig } => Ok(CompiledAction::NotifyEnforcer {
            error: *arg_error,
            sig: *arg_sig,
        }),
        ActionSpec::TrackSock => Ok(CompiledAction::TrackSock),
        ActionSpec::UntrackSock => Ok(CompiledAction::UntrackSock),
    }
}

fn require_large_programs(caps: &KernelCapabilities) -> Result<(), String> {
    if !caps.supports_large_programs() {
        return Err("sigkill action requires kernel >= 5.3 (large programs)".into());
    }
    Ok(())
}

/// Validates an `Override` action against its attach context (spec.md
/// §4.C / testable properties #11, #12; end-to-end scenario E2).
pub fn validate_override_context(
    is_syscall: bool,
    hook_name: &str,
    caps: &KernelCapabilities,
    multi_probe: bool,
) -> Result<(), String> {
    if !is_syscall && !hook_name.starts_with("security_") {
        return Err(format!(
            "override action is only valid on syscalls or security_* LSM hooks, got '{hook_name}'"
        ));
    }
    if multi_probe {
        return Err(format!("can't override {hook_name} with kprobe_multi"));
    }
    if hook_name.starts_with("security_") && !caps.fmod_ret {
        return Err(format!(
            "can't override {hook_name} without fmod_ret support"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::KernelVersion;

    #[test]
    fn sigkill_rejected_below_large_programs_floor() {
        let caps = KernelCapabilities::for_version(KernelVersion(5, 2, 0));
        let err = compile_action(&ActionSpec::Sigkill, &caps).unwrap_err();
        assert!(err.contains("5.3"));
    }

    #[test]
    fn override_rejected_on_non_syscall_non_security_hook() {
        let caps = KernelCapabilities::for_version(KernelVersion(6, 1, 0));
        let err = validate_override_context(false, "vfs_read", &caps, false).unwrap_err();
        assert!(err.contains("vfs_read"));
    }

    #[test]
    fn override_rejected_with_multi_probe() {
        let caps = KernelCapabilities::for_version(KernelVersion(6, 1, 0));
        let err =
            validate_override_context(false, "security_bprm_check", &caps, true).unwrap_err();
        assert!(err.contains("kprobe_multi"));
    }
}

//! Error categories from spec.md §7.
//!
//! The teacher (`bpf_config.rs`, `main.rs`) reports everything through
//! `anyhow::Result` with `.context(...)` chains. That's right for the
//! load/attach boundary, where a human reads the message. But §7 asks
//! callers to distinguish *categories* (spec error vs. capability error vs.
//! BTF-validation-failure vs. loader error) so a policy-load caller can
//! decide whether retrying, ignoring, or surfacing to a user is
//! appropriate. A `thiserror` enum gives that without losing the anyhow
//! chain — each variant wraps the lower-level `anyhow::Error` as `source`.
//! `retis` and `profiler-symbol-server` in the broader pack both reach for
//! `thiserror` at exactly this kind of typed-boundary; the teacher doesn't
//! use it anywhere we'd be replacing an existing idiom, so it's a clean
//! addition rather than a dependency swap.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Syntactic/semantic problem in the policy spec itself; fails the
    /// whole load (spec.md §7 "Spec error").
    #[error("invalid policy spec: {0}")]
    Spec(String),

    /// A requested feature needs a kernel capability or version this host
    /// doesn't have (spec.md §7 "Capability/kernel-version error").
    #[error("kernel capability unavailable: {0}")]
    Capability(String),

    /// BTF symbol/field resolution failed in a way that isn't covered by
    /// `ignore.callNotFound` (spec.md §4.B, §7).
    #[error("BTF validation failed: {0}")]
    BtfValidation(String),

    /// Map creation or program attach failed; any maps/programs already
    /// created by this load must be rolled back by the caller via the
    /// destroy-hook (spec.md §7 "Loader error").
    #[error("loader error: {0}")]
    Loader(#[source] anyhow::Error),

    /// Selector compilation rejected the input (bad operator, depth
    /// overflow, disallowed action combination — spec.md §4.C).
    #[error("selector compile error: {0}")]
    SelectorCompile(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn spec(msg: impl Into<String>) -> Self {
        Self::Spec(msg.into())
    }

    pub fn capability(msg: impl Into<String>) -> Self {
        Self::Capability(msg.into())
    }

    pub fn btf_validation(msg: impl Into<String>) -> Self {
        Self::BtfValidation(msg.into())
    }

    pub fn selector_compile(msg: impl Into<String>) -> Self {
        Self::SelectorCompile(msg.into())
    }
}

//! Kernel-capability probing shared by the selector compiler, the program
//! builder and the loader (spec.md §4.C/§4.F/§7). Grounded on the teacher's
//! `check_kernel_version`/`check_capabilities` in `main.rs`, generalized
//! from one fixed floor (5.8) to the several feature-specific floors the
//! probe engine needs to gate on.

use std::fs;

use anyhow::{Context, Result};
use probe_common::kernel_gate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelVersion(pub u32, pub u32, pub u32);

impl KernelVersion {
    pub fn parse(release: &str) -> Option<Self> {
        let version_part = release.trim().split('-').next()?;
        let mut segments = version_part.split('.');
        let major = segments.next()?.parse().ok()?;
        let minor = segments.next().unwrap_or("0").parse().ok()?;
        let patch = segments.next().unwrap_or("0").parse().unwrap_or(0);
        Some(Self(major, minor, patch))
    }

    fn at_least(&self, floor: (u32, u32, u32)) -> bool {
        (self.0, self.1, self.2) >= floor
    }
}

/// Kernel-feature floors relevant to probe compilation, detected once at
/// startup and threaded through the compiler/builder/loader (spec.md §4.C:
/// "Sigkill requires...", "Override requires...").
#[derive(Debug, Clone, Copy)]
pub struct KernelCapabilities {
    pub version: KernelVersion,
    pub bpf_override_return: bool,
    pub fmod_ret: bool,
}

impl KernelCapabilities {
    pub fn detect() -> Result<Self> {
        let release = fs::read_to_string("/proc/sys/kernel/osrelease")
            .context("failed to read /proc/sys/kernel/osrelease")?;
        let version = KernelVersion::parse(&release)
            .with_context(|| format!("unable to parse kernel release '{release}'"))?;
        Ok(Self {
            version,
            bpf_override_return: Self::config_enabled("CONFIG_BPF_KPROBE_OVERRIDE"),
            fmod_ret: Self::config_enabled("CONFIG_FUNCTION_ERROR_INJECTION"),
        })
    }

    pub fn for_version(version: KernelVersion) -> Self {
        Self {
            version,
            bpf_override_return: true,
            fmod_ret: true,
        }
    }

    fn config_enabled(key: &str) -> bool {
        let candidates = ["/proc/config.gz", "/boot/config"];
        for path in candidates {
            if let Ok(contents) = fs::read_to_string(path) {
                if contents.lines().any(|l| l.trim() == format!("{key}=y")) {
                    return true;
                }
            }
        }
        // config.gz can't be read as text; treat absence of evidence as
        // "assume available" so a missing /proc/config.gz doesn't block
        // every override-using policy on a stock kernel.
        candidates.iter().all(|p| fs::metadata(p).is_err())
    }

    pub fn supports_kprobe_multi(&self) -> bool {
        self.version.at_least(kernel_gate::MULTI_PROBE_MIN)
    }

    pub fn supports_string_submap(&self) -> bool {
        self.version.at_least(kernel_gate::STRING_SUBMAP_MIN)
    }

    pub fn supports_max_data(&self) -> bool {
        self.version.at_least(kernel_gate::MAX_DATA_MIN)
    }

    pub fn supports_large_programs(&self) -> bool {
        self.version.at_least(kernel_gate::LARGE_PROGRAMS_MIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_standard_release_string() {
        let v = KernelVersion::parse("6.8.0-45-generic").unwrap();
        assert_eq!(v, KernelVersion(6, 8, 0));
    }

    #[test]
    fn gates_large_programs_on_floor() {
        let old = KernelCapabilities::for_version(KernelVersion(5, 2, 0));
        let new = KernelCapabilities::for_version(KernelVersion(5, 3, 0));
        assert!(!old.supports_large_programs());
        assert!(new.supports_large_programs());
    }

    #[test]
    fn gates_kprobe_multi_on_floor() {
        let old = KernelCapabilities::for_version(KernelVersion(5, 8, 9));
        let new = KernelCapabilities::for_version(KernelVersion(5, 9, 0));
        assert!(!old.supports_kprobe_multi());
        assert!(new.supports_kprobe_multi());
    }
}

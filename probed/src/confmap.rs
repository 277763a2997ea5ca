//! Runtime conf map (`tg_conf_map`, spec.md §6), grounded directly on the
//! original's `confmap.go` (`UpdateTgRuntimeConf`/`TetragonConfValue`):
//! detects cgroupfs magic, deployment mode, and this process's own
//! pid/nspid, then writes the single-key record the kernel side reads.

use std::fs;
use std::mem::MaybeUninit;

use anyhow::{Context, Result};
use log::{info, warn};

use probe_common::{DeployMode, RuntimeConfValue};

const CGROUP2_SUPER_MAGIC: i64 = 0x6367_7270;
const TMPFS_MAGIC: i64 = 0x0102_1994;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupFsVersion {
    V1,
    V2,
    Unknown,
}

pub fn detect_cgroupfs_magic(path: &str) -> Result<i64> {
    let c_path = std::ffi::CString::new(path).context("invalid cgroupfs path")?;
    let mut stat: MaybeUninit<libc::statfs> = MaybeUninit::uninit();
    let rc = unsafe { libc::statfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error())
            .context(format!("statfs({path}) failed"));
    }
    let stat = unsafe { stat.assume_init() };
    Ok(stat.f_type as i64)
}

pub fn cgroupfs_version(magic: i64) -> CgroupFsVersion {
    match magic {
        CGROUP2_SUPER_MAGIC => CgroupFsVersion::V2,
        TMPFS_MAGIC => CgroupFsVersion::V1,
        _ => CgroupFsVersion::Unknown,
    }
}

/// Heuristic deployment-mode detection (spec.md §6): kubernetes service
/// account token presence, `/.dockerenv`, systemd cgroup ownership, or
/// standalone as the fallback.
pub fn detect_deployment_mode() -> DeployMode {
    if fs::metadata("/var/run/secrets/kubernetes.io/serviceaccount").is_ok() {
        return DeployMode::K8s;
    }
    if fs::metadata("/.dockerenv").is_ok() {
        return DeployMode::Container;
    }
    if fs::metadata("/run/systemd/system").is_ok() {
        return if std::env::var("XDG_RUNTIME_DIR").is_ok() {
            DeployMode::SdUser
        } else {
            DeployMode::SdService
        };
    }
    if fs::metadata("/proc/1/cgroup").is_ok() {
        return DeployMode::Standalone;
    }
    DeployMode::Unknown
}

pub fn build_runtime_conf(log_level: u32) -> RuntimeConfValue {
    let pid = std::process::id();
    let ns_pid = read_ns_pid(pid).unwrap_or(pid);

    let magic = detect_cgroupfs_magic("/sys/fs/cgroup").unwrap_or_else(|err| {
        warn!("cgroupfs magic detection failed: {err:#}; advanced cgroup tracking disabled");
        0
    });
    let deploy_mode = detect_deployment_mode();
    if matches!(deploy_mode, DeployMode::Unknown) {
        warn!("deployment mode is unknown; advanced cgroup tracking disabled");
    }

    let mut conf = RuntimeConfValue::zeroed();
    conf.log_level = log_level;
    conf.pid = pid;
    conf.ns_pid = ns_pid;
    conf.cgrp_fs_magic = magic as u64;

    info!(
        "runtime conf: deployment.mode={:?} cgroup.fs.magic={:#x} pid={} ns_pid={}",
        deploy_mode, magic, pid, ns_pid
    );

    conf
}

fn read_ns_pid(pid: u32) -> Option<u32> {
    let status = fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("NSpid:") {
            return rest.split_whitespace().last()?.parse().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cgroupfs_version_recognizes_known_magics() {
        assert_eq!(cgroupfs_version(CGROUP2_SUPER_MAGIC), CgroupFsVersion::V2);
        assert_eq!(cgroupfs_version(TMPFS_MAGIC), CgroupFsVersion::V1);
        assert_eq!(cgroupfs_version(0xdead), CgroupFsVersion::Unknown);
    }

    #[test]
    fn build_runtime_conf_fills_own_pid() {
        let conf = build_runtime_conf(3);
        assert_eq!(conf.pid, std::process::id());
        assert_eq!(conf.log_level, 3);
    }
}

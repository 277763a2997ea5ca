use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "/etc/probed/probed.toml";
const ENV_CONFIG_PATH: &str = "PROBED_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Loads configuration from file. The path can be overridden with the
    /// `PROBED_CONFIG` environment variable. If the file is missing or
    /// fails to parse, defaults are returned (spec.md §6's CLI/config
    /// surface never hard-fails on a missing config file).
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = PathBuf::from(path);
        match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Where [`crate::loader::locate_bpf_object`] looks before falling
    /// back to its own built-in candidate list.
    #[serde(default)]
    pub bpf_object_path: Option<PathBuf>,
    /// Directory BPF maps/links are pinned under so a second `probed`
    /// process can discover an already-loaded group (spec.md §4.F).
    #[serde(default = "default_pin_path")]
    pub pin_path: PathBuf,
    /// Policy-level default; a policy's own `disable-kprobe-multi` option
    /// still wins (spec.md §4.F).
    #[serde(default = "default_prefer_multi_probe")]
    pub prefer_multi_probe: bool,
    #[serde(default)]
    pub btf_path: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bpf_object_path: None,
            pin_path: default_pin_path(),
            prefer_multi_probe: default_prefer_multi_probe(),
            btf_path: None,
        }
    }
}

fn default_pin_path() -> PathBuf {
    PathBuf::from("/sys/fs/bpf/probed")
}

fn default_prefer_multi_probe() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn parse_config_defaults() {
        let toml = r#"[runtime]
pin_path = "/sys/fs/bpf/probed"
prefer_multi_probe = true
[logging]
level = "info"
"#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert_eq!(cfg.runtime.pin_path, PathBuf::from("/sys/fs/bpf/probed"));
        assert!(cfg.runtime.prefer_multi_probe);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn env_override() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[runtime]\nprefer_multi_probe = false").unwrap();
        unsafe {
            std::env::set_var(ENV_CONFIG_PATH, file.path());
        }
        let cfg = Config::load();
        assert!(!cfg.runtime.prefer_multi_probe);
        unsafe {
            std::env::remove_var(ENV_CONFIG_PATH);
        }
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        unsafe {
            std::env::set_var(ENV_CONFIG_PATH, "/nonexistent/probed.toml");
        }
        let cfg = Config::load();
        assert_eq!(cfg.logging.level, "info");
        unsafe {
            std::env::remove_var(ENV_CONFIG_PATH);
        }
    }
}

use serde::Deserialize;

/// Operators available on a selector clause (spec.md §4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum Operator {
    In,
    NotIn,
    Prefix,
    NotPrefix,
    Postfix,
    NotPostfix,
    Equal,
    GT,
    LT,
    Mask,
    SPort,
    DPort,
    SAddr,
    DAddr,
    Protocol,
    Family,
    State,
    InMap,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArgSelector {
    pub index: u32,
    pub operator: Operator,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PidSelector {
    pub operator: Operator,
    pub values: Vec<u32>,
    #[serde(default, rename = "isNamespacePID")]
    pub is_namespace_pid: bool,
    #[serde(default, rename = "followForks")]
    pub follow_forks: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BinarySelector {
    pub operator: Operator,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NamespaceKind {
    Uts,
    Ipc,
    Mnt,
    Pid,
    PidForChildren,
    Net,
    Time,
    TimeForChildren,
    Cgroup,
    User,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamespaceSelector {
    pub namespace: NamespaceKind,
    pub operator: Operator,
    pub values: Vec<u32>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CapabilityType {
    CapChown,
    CapDacOverride,
    CapSysAdmin,
    CapSysPtrace,
    CapNetAdmin,
    CapNetRaw,
    CapSysModule,
    CapSetuid,
    CapSetgid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CapabilitySelector {
    #[serde(rename = "type")]
    pub kind: CapKind,
    pub operator: Operator,
    pub values: Vec<CapabilityType>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum CapKind {
    Effective,
    Permitted,
    Inheritable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitScope {
    Thread,
    Process,
    Global,
}

/// Parses `"1s"`, `"5m"`, `"2h"`, or a bare number (seconds, the default
/// unit per spec.md §4.C) into a duration in seconds.
pub fn parse_rate_limit_duration(raw: &str) -> Result<u64, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("empty rateLimit duration".into());
    }
    let (digits, unit) = match raw.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => (&raw[..raw.len() - 1], c),
        _ => (raw, 's'),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid rateLimit duration: {raw}"))?;
    let seconds = match unit {
        's' => value,
        'm' => value.checked_mul(60).ok_or("rateLimit overflow")?,
        'h' => value.checked_mul(3600).ok_or("rateLimit overflow")?,
        other => return Err(format!("unknown rateLimit unit '{other}'")),
    };
    Ok(seconds)
}

impl std::str::FromStr for RateLimitScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "thread" => Ok(Self::Thread),
            "process" => Ok(Self::Process),
            "global" => Ok(Self::Global),
            other => Err(format!("unknown rateLimitScope '{other}'")),
        }
    }
}

/// Declarative actions attached to a selector (spec.md §4.C). Kept as one
/// enum (rather than a name + side-table at the spec layer) so policy YAML
/// validates structurally; `selector::actions` compiles these into the
/// kernel `ActionType` plus the action-argument side table.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "PascalCase")]
pub enum ActionSpec {
    Post {
        /// Valid only under `Post` (spec.md §4.C).
        #[serde(default, rename = "kernelStackTrace")]
        kernel_stack_trace: bool,
        #[serde(default, rename = "userStackTrace")]
        user_stack_trace: bool,
        #[serde(default, rename = "imaHash")]
        ima_hash: bool,
    },
    Sigkill,
    Signal {
        #[serde(rename = "argSig")]
        arg_sig: String,
    },
    Override {
        #[serde(rename = "argError")]
        arg_error: i64,
    },
    GetUrl {
        #[serde(rename = "argUrl")]
        arg_url: String,
    },
    DnsLookup {
        #[serde(rename = "argFqdn")]
        arg_fqdn: String,
    },
    NotifyEnforcer {
        #[serde(rename = "argError", default)]
        arg_error: i32,
        #[serde(rename = "argSig", default)]
        arg_sig: i32,
    },
    TrackSock,
    UntrackSock,
}

/// Resolves a symbolic or numeric signal name to its number, the way the
/// original's `sigNameToNum` table does (spec.md §3 supplement).
pub fn signal_number(raw: &str) -> Result<i32, String> {
    if let Ok(n) = raw.parse::<i32>() {
        return Ok(n);
    }
    let name = raw.trim_start_matches("SIG").to_uppercase();
    let n = match name.as_str() {
        "HUP" => 1,
        "INT" => 2,
        "QUIT" => 3,
        "ILL" => 4,
        "TRAP" => 5,
        "ABRT" => 6,
        "BUS" => 7,
        "FPE" => 8,
        "KILL" => 9,
        "USR1" => 10,
        "SEGV" => 11,
        "USR2" => 12,
        "PIPE" => 13,
        "ALRM" => 14,
        "TERM" => 15,
        "STOP" => 19,
        "CONT" => 18,
        _ => return Err(format!("unknown signal name '{raw}'")),
    };
    Ok(n)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SelectorSpec {
    #[serde(default, rename = "matchPIDs")]
    pub match_pids: Vec<PidSelector>,
    #[serde(default, rename = "matchBinaries")]
    pub match_binaries: Vec<BinarySelector>,
    #[serde(default, rename = "matchArgs")]
    pub match_args: Vec<ArgSelector>,
    #[serde(default, rename = "matchReturnArgs")]
    pub match_return_args: Vec<ArgSelector>,
    #[serde(default, rename = "matchActions")]
    pub match_actions: Vec<ActionSpec>,
    #[serde(default, rename = "matchNamespaces")]
    pub match_namespaces: Vec<NamespaceSelector>,
    #[serde(default, rename = "matchNamespaceChanges")]
    pub match_namespace_changes: Vec<NamespaceKind>,
    #[serde(default, rename = "matchCapabilities")]
    pub match_capabilities: Vec<CapabilitySelector>,
    #[serde(default, rename = "matchCapabilityChanges")]
    pub match_capability_changes: Vec<CapabilitySelector>,
    /// Accepts `s`/`m`/`h` suffixes, defaults to seconds (spec.md §4.C).
    #[serde(default, rename = "rateLimit")]
    pub rate_limit: Option<String>,
    #[serde(default, rename = "rateLimitScope")]
    pub rate_limit_scope: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_duration_defaults_to_seconds() {
        assert_eq!(parse_rate_limit_duration("30").unwrap(), 30);
        assert_eq!(parse_rate_limit_duration("1s").unwrap(), 1);
        assert_eq!(parse_rate_limit_duration("2m").unwrap(), 120);
        assert_eq!(parse_rate_limit_duration("1h").unwrap(), 3600);
        assert!(parse_rate_limit_duration("1d").is_err());
    }

    #[test]
    fn signal_number_accepts_name_or_digit() {
        assert_eq!(signal_number("SIGKILL").unwrap(), 9);
        assert_eq!(signal_number("KILL").unwrap(), 9);
        assert_eq!(signal_number("9").unwrap(), 9);
        assert!(signal_number("NOTASIGNAL").is_err());
    }

    #[test]
    fn rate_limit_scope_parses_known_values() {
        assert_eq!(
            "thread".parse::<RateLimitScope>().unwrap(),
            RateLimitScope::Thread
        );
        assert!("bogus".parse::<RateLimitScope>().is_err());
    }
}

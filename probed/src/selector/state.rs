//! Packed byte encoding of a compiled selector tree (spec.md §4.C,
//! testable property #6: encode → decode → re-encode is byte-identical).
//!
//! The kernel side never decodes text; it walks this buffer directly, so
//! the writer and reader below must stay byte-for-byte symmetric. Layout
//! is a flat sequence of length-prefixed sections, one per selector, each
//! holding its match-clause sub-sections in a fixed order.

use crate::policy::selectors::{
    ActionSpec, ArgSelector, BinarySelector, CapKind, CapabilitySelector, CapabilityType,
    NamespaceKind, NamespaceSelector, Operator, PidSelector,
};

#[derive(Default)]
pub struct SelectorWriter {
    buf: Vec<u8>,
}

impl SelectorWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn bytes(&mut self, data: &[u8]) {
        self.u32(data.len() as u32);
        self.buf.extend_from_slice(data);
    }

    pub fn string(&mut self, s: &str) {
        self.bytes(s.as_bytes());
    }
}

pub struct SelectorReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub struct DecodeError(pub String);

impl<'a> SelectorReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| DecodeError("truncated buffer reading u8".into()))?;
        self.pos += 1;
        Ok(b)
    }

    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn i32(&mut self) -> Result<i32, DecodeError> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn i64(&mut self) -> Result<i64, DecodeError> {
        let bytes = self.take(8)?;
        Ok(i64::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn string(&mut self) -> Result<String, DecodeError> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes).map_err(|e| DecodeError(e.to_string()))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or_else(|| DecodeError("length overflow".into()))?;
        let slice = self
            .buf
            .get(self.pos..end)
            .ok_or_else(|| DecodeError("truncated buffer".into()))?;
        self.pos = end;
        Ok(slice)
    }
}

pub fn operator_tag(op: Operator) -> u8 {
    match op {
        Operator::In => 0,
        Operator::NotIn => 1,
        Operator::Prefix => 2,
        Operator::NotPrefix => 3,
        Operator::Postfix => 4,
        Operator::NotPostfix => 5,
        Operator::Equal => 6,
        Operator::GT => 7,
        Operator::LT => 8,
        Operator::Mask => 9,
        Operator::SPort => 10,
        Operator::DPort => 11,
        Operator::SAddr => 12,
        Operator::DAddr => 13,
        Operator::Protocol => 14,
        Operator::Family => 15,
        Operator::State => 16,
        Operator::InMap => 17,
    }
}

pub fn tag_to_operator(tag: u8) -> Result<Operator, DecodeError> {
    Ok(match tag {
        0 => Operator::In,
        1 => Operator::NotIn,
        2 => Operator::Prefix,
        3 => Operator::NotPrefix,
        4 => Operator::Postfix,
        5 => Operator::NotPostfix,
        6 => Operator::Equal,
        7 => Operator::GT,
        8 => Operator::LT,
        9 => Operator::Mask,
        10 => Operator::SPort,
        11 => Operator::DPort,
        12 => Operator::SAddr,
        13 => Operator::DAddr,
        14 => Operator::Protocol,
        15 => Operator::Family,
        16 => Operator::State,
        17 => Operator::InMap,
        other => return Err(DecodeError(format!("unknown operator tag {other}"))),
    })
}

pub fn write_pid_selector(w: &mut SelectorWriter, sel: &PidSelector) {
    w.u8(operator_tag(sel.operator));
    w.u8(sel.is_namespace_pid as u8);
    w.u8(sel.follow_forks as u8);
    w.u32(sel.values.len() as u32);
    for v in &sel.values {
        w.u32(*v);
    }
}

pub fn read_pid_selector(r: &mut SelectorReader) -> Result<PidSelector, DecodeError> {
    let operator = tag_to_operator(r.u8()?)?;
    let is_namespace_pid = r.u8()? != 0;
    let follow_forks = r.u8()? != 0;
    let count = r.u32()?;
    let mut values = Vec::with_capacity(count as usize);
    for _ in 0..count {
        values.push(r.u32()?);
    }
    Ok(PidSelector {
        operator,
        values,
        is_namespace_pid,
        follow_forks,
    })
}

pub fn write_binary_selector(w: &mut SelectorWriter, sel: &BinarySelector) {
    w.u8(operator_tag(sel.operator));
    w.u32(sel.values.len() as u32);
    for v in &sel.values {
        w.string(v);
    }
}

pub fn read_binary_selector(r: &mut SelectorReader) -> Result<BinarySelector, DecodeError> {
    let operator = tag_to_operator(r.u8()?)?;
    let count = r.u32()?;
    let mut values = Vec::with_capacity(count as usize);
    for _ in 0..count {
        values.push(r.string()?);
    }
    Ok(BinarySelector { operator, values })
}

pub fn write_arg_selector(w: &mut SelectorWriter, sel: &ArgSelector) {
    w.u32(sel.index);
    w.u8(operator_tag(sel.operator));
    w.u32(sel.values.len() as u32);
    for v in &sel.values {
        w.string(v);
    }
}

pub fn read_arg_selector(r: &mut SelectorReader) -> Result<ArgSelector, DecodeError> {
    let index = r.u32()?;
    let operator = tag_to_operator(r.u8()?)?;
    let count = r.u32()?;
    let mut values = Vec::with_capacity(count as usize);
    for _ in 0..count {
        values.push(r.string()?);
    }
    Ok(ArgSelector {
        index,
        operator,
        values,
    })
}

fn namespace_kind_tag(kind: NamespaceKind) -> u8 {
    match kind {
        NamespaceKind::Uts => 0,
        NamespaceKind::Ipc => 1,
        NamespaceKind::Mnt => 2,
        NamespaceKind::Pid => 3,
        NamespaceKind::PidForChildren => 4,
        NamespaceKind::Net => 5,
        NamespaceKind::Time => 6,
        NamespaceKind::TimeForChildren => 7,
        NamespaceKind::Cgroup => 8,
        NamespaceKind::User => 9,
    }
}

fn tag_to_namespace_kind(tag: u8) -> Result<NamespaceKind, DecodeError> {
    Ok(match tag {
        0 => NamespaceKind::Uts,
        1 => NamespaceKind::Ipc,
        2 => NamespaceKind::Mnt,
        3 => NamespaceKind::Pid,
        4 => NamespaceKind::PidForChildren,
        5 => NamespaceKind::Net,
        6 => NamespaceKind::Time,
        7 => NamespaceKind::TimeForChildren,
        8 => NamespaceKind::Cgroup,
        9 => NamespaceKind::User,
        other => return Err(DecodeError(format!("unknown namespace kind tag {other}"))),
    })
}

pub fn write_namespace_selector(w: &mut SelectorWriter, sel: &NamespaceSelector) {
    w.u8(namespace_kind_tag(sel.namespace));
    w.u8(operator_tag(sel.operator));
    w.u32(sel.values.len() as u32);
    for v in &sel.values {
        w.u32(*v);
    }
}

pub fn read_namespace_selector(r: &mut SelectorReader) -> Result<NamespaceSelector, DecodeError> {
    let namespace = tag_to_namespace_kind(r.u8()?)?;
    let operator = tag_to_operator(r.u8()?)?;
    let count = r.u32()?;
    let mut values = Vec::with_capacity(count as usize);
    for _ in 0..count {
        values.push(r.u32()?);
    }
    Ok(NamespaceSelector {
        namespace,
        operator,
        values,
    })
}

fn capability_type_tag(cap: CapabilityType) -> u8 {
    match cap {
        CapabilityType::CapChown => 0,
        CapabilityType::CapDacOverride => 1,
        CapabilityType::CapSysAdmin => 2,
        CapabilityType::CapSysPtrace => 3,
        CapabilityType::CapNetAdmin => 4,
        CapabilityType::CapNetRaw => 5,
        CapabilityType::CapSysModule => 6,
        CapabilityType::CapSetuid => 7,
        CapabilityType::CapSetgid => 8,
    }
}

fn tag_to_capability_type(tag: u8) -> Result<CapabilityType, DecodeError> {
    Ok(match tag {
        0 => CapabilityType::CapChown,
        1 => CapabilityType::CapDacOverride,
        2 => CapabilityType::CapSysAdmin,
        3 => CapabilityType::CapSysPtrace,
        4 => CapabilityType::CapNetAdmin,
        5 => CapabilityType::CapNetRaw,
        6 => CapabilityType::CapSysModule,
        7 => CapabilityType::CapSetuid,
        8 => CapabilityType::CapSetgid,
        other => return Err(DecodeError(format!("unknown capability tag {other}"))),
    })
}

fn cap_kind_tag(kind: CapKind) -> u8 {
    match kind {
        CapKind::Effective => 0,
        CapKind::Permitted => 1,
        CapKind::Inheritable => 2,
    }
}

fn tag_to_cap_kind(tag: u8) -> Result<CapKind, DecodeError> {
    Ok(match tag {
        0 => CapKind::Effective,
        1 => CapKind::Permitted,
        2 => CapKind::Inheritable,
        other => return Err(DecodeError(format!("unknown cap kind tag {other}"))),
    })
}

pub fn write_capability_selector(w: &mut SelectorWriter, sel: &CapabilitySelector) {
    w.u8(cap_kind_tag(sel.kind));
    w.u8(operator_tag(sel.operator));
    w.u32(sel.values.len() as u32);
    for v in &sel.values {
        w.u8(capability_type_tag(*v));
    }
}

pub fn read_capability_selector(r: &mut SelectorReader) -> Result<CapabilitySelector, DecodeError> {
    let kind = tag_to_cap_kind(r.u8()?)?;
    let operator = tag_to_operator(r.u8()?)?;
    let count = r.u32()?;
    let mut values = Vec::with_capacity(count as usize);
    for _ in 0..count {
        values.push(tag_to_capability_type(r.u8()?)?);
    }
    Ok(CapabilitySelector {
        kind,
        operator,
        values,
    })
}

pub fn write_action_spec(w: &mut SelectorWriter, action: &ActionSpec) {
    match action {
        ActionSpec::Post {
            kernel_stack_trace,
            user_stack_trace,
            ima_hash,
        } => {
            w.u8(0);
            w.u8(*kernel_stack_trace as u8);
            w.u8(*user_stack_trace as u8);
            w.u8(*ima_hash as u8);
        }
        ActionSpec::Sigkill => w.u8(1),
        ActionSpec::Signal { arg_sig } => {
            w.u8(2);
            w.string(arg_sig);
        }
        ActionSpec::Override { arg_error } => {
            w.u8(3);
            w.i64(*arg_error);
        }
        ActionSpec::GetUrl { arg_url } => {
            w.u8(4);
            w.string(arg_url);
        }
        ActionSpec::DnsLookup { arg_fqdn } => {
            w.u8(5);
            w.string(arg_fqdn);
        }
        ActionSpec::NotifyEnforcer { arg_error, arg_sig } => {
            w.u8(6);
            w.i32(*arg_error);
            w.i32(*arg_sig);
        }
        ActionSpec::TrackSock => w.u8(7),
        ActionSpec::UntrackSock => w.u8(8),
    }
}

pub fn read_action_spec(r: &mut SelectorReader) -> Result<ActionSpec, DecodeError> {
    Ok(match r.u8()? {
        0 => ActionSpec::Post {
            kernel_stack_trace: r.u8()? != 0,
            user_stack_trace: r.u8()? != 0,
            ima_hash: r.u8()? != 0,
        },
        1 => ActionSpec::Sigkill,
        2 => ActionSpec::Signal {
            arg_sig: r.string()?,
        },
        3 => ActionSpec::Override {
            arg_error: r.i64()?,
        },
        4 => ActionSpec::GetUrl {
            arg_url: r.string()?,
        },
        5 => ActionSpec::DnsLookup {
            arg_fqdn: r.string()?,
        },
        6 => ActionSpec::NotifyEnforcer {
            arg_error: r.i32()?,
            arg_sig: r.i32()?,
        },
        7 => ActionSpec::TrackSock,
        8 => ActionSpec::UntrackSock,
        other => return Err(DecodeError(format!("unknown action tag {other}"))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::selectors::Operator;

    #[test]
    fn pid_selector_round_trips() {
        let sel = PidSelector {
            operator: Operator::In,
            values: vec![1, 2, 3],
            is_namespace_pid: true,
            follow_forks: false,
        };
        let mut w = SelectorWriter::new();
        write_pid_selector(&mut w, &sel);
        let bytes = w.into_bytes();
        let mut r = SelectorReader::new(&bytes);
        let decoded = read_pid_selector(&mut r).unwrap();
        assert_eq!(decoded.values, sel.values);
        assert_eq!(decoded.is_namespace_pid, sel.is_namespace_pid);

        let mut w2 = SelectorWriter::new();
        write_pid_selector(&mut w2, &decoded);
        assert_eq!(w2.into_bytes(), bytes);
    }

    #[test]
    fn action_spec_round_trips_each_variant() {
        let actions = vec![
            ActionSpec::Post {
                kernel_stack_trace: true,
                user_stack_trace: false,
                ima_hash: false,
            },
            ActionSpec::Sigkill,
            ActionSpec::Override { arg_error: -1 },
            ActionSpec::DnsLookup {
                arg_fqdn: "example.invalid".into(),
            },
            ActionSpec::NotifyEnforcer {
                arg_error: 1,
                arg_sig: 9,
            },
        ];
        for action in actions {
            let mut w = SelectorWriter::new();
            write_action_spec(&mut w, &action);
            let bytes = w.into_bytes();
            let mut r = SelectorReader::new(&bytes);
            let decoded = read_action_spec(&mut r).unwrap();
            let mut w2 = SelectorWriter::new();
            write_action_spec(&mut w2, &decoded);
            assert_eq!(w2.into_bytes(), bytes);
        }
    }
}

//! Component G: event demultiplexer (spec.md §4.G).
//!
//! Decodes one length-prefixed ring-buffer record at a time: looks the
//! probe up by `funcId`, dispatches its `actionId`, resolves stack traces,
//! decodes the argument bytes per [`probe_common::KernelTypeId`], and
//! merges entry/return pairs through [`crate::pending`]. One
//! `Demultiplexer` owns exactly one reader's pending-event store, per
//! spec.md §5: "LRU maps are per-probe and accessed only from the reader
//! that owns them".

use std::sync::Arc;

use log::{debug, trace, warn};

use probe_common::{event_flags, arg_meta, ActionType, ConfigMapRecord, EventHeader, KernelTypeId};

use crate::action::SyscallAbi;
use crate::catalog::{Catalog, ProbeId};
use crate::metrics::Metrics;
use crate::pending::{Direction, MergeOutcome, PendingEventKey, PendingEvents};

/// Looks up a kernel stack-trace id in `stack_trace_map`. The loader owns
/// the real `aya` map handle; this trait lets the demultiplexer stay
/// testable without one (spec.md §4.G step 4).
pub trait StackTraceLookup {
    fn lookup(&self, stack_id: u64) -> Option<Vec<u64>>;
}

/// One decoded argument value (spec.md §4.G argument decoding table).
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    U64(u64),
    S64(i64),
    U32(u32),
    S32(i32),
    Bytes(Vec<u8>),
    Str(String),
    SockTuple {
        family: u16,
        protocol: u16,
        saddr: String,
        daddr: String,
        sport: u16,
        dport: u16,
    },
    Syscall {
        abi: SyscallAbi,
        id: i64,
    },
    Path {
        fd: Option<i32>,
        path: String,
        flags: u32,
        mode: u32,
    },
}

#[derive(Debug, Clone)]
pub struct DecodedEvent {
    pub probe_id: ProbeId,
    pub policy_id: u32,
    pub pid: u32,
    pub tid: u32,
    pub ktime: u64,
    pub is_return: bool,
    pub action_id: i32,
    pub args: Vec<ArgValue>,
    pub return_action: Option<i32>,
    pub kernel_stack: Option<Vec<u64>>,
    pub user_stack: Option<Vec<u64>>,
}

pub struct Demultiplexer<S> {
    catalog: Arc<Catalog>,
    metrics: Arc<Metrics>,
    stacks: S,
    pending: PendingEvents<DecodedEvent>,
}

impl<S: StackTraceLookup> Demultiplexer<S> {
    pub fn new(catalog: Arc<Catalog>, metrics: Arc<Metrics>, stacks: S) -> Self {
        Self {
            catalog,
            metrics,
            stacks,
            pending: PendingEvents::new(),
        }
    }

    /// Decodes one ring-buffer record. Returns `Some` exactly when a
    /// complete (possibly merged) event is ready to emit (spec.md §4.G
    /// step 6).
    pub fn handle_record(&mut self, record: &[u8]) -> Option<DecodedEvent> {
        self.metrics.inc_events_total();
        let header = parse_header(record)?;
        let entry = match self.catalog.get_entry(ProbeId(header.func_id)) {
            Some(entry) => entry,
            None => {
                self.metrics.inc_funcid_miss();
                debug!("demux: no probe registered for funcId={}", header.func_id);
                return None;
            }
        };

        if header.action_id >= 0 {
            self.dispatch_action(&header, &entry.config);
        }

        let is_return = header.flags & event_flags::RETURN != 0;
        let args_offset = std::mem::size_of::<EventHeader>();
        let args = decode_args(&entry.config, is_return, &record[args_offset..]);

        let kernel_stack = self.resolve_stack(header.kernel_stack_id, true);
        let user_stack = self.resolve_stack(header.user_stack_id, false);

        let event = DecodedEvent {
            probe_id: ProbeId(header.func_id),
            policy_id: entry.policy_id,
            pid: header.pid,
            tid: header.tid,
            ktime: header.ktime,
            is_return,
            action_id: header.action_id,
            args,
            return_action: None,
            kernel_stack,
            user_stack,
        };

        if entry.return_selectors.is_none() {
            // No paired retprobe for this hook; nothing to merge.
            return Some(event);
        }

        let key = PendingEventKey {
            event_id: header.ret_probe_id as u64,
            ktime_enter: header.ktime,
        };
        let direction = if is_return { Direction::Return } else { Direction::Enter };
        match self.pending.offer(key, direction, event) {
            MergeOutcome::Pending => {
                self.metrics.inc_merge_pushed();
                None
            }
            MergeOutcome::Merged { enter, ret } => {
                self.metrics.inc_merge_ok();
                Some(merge_events(enter, ret))
            }
            MergeOutcome::Error(err) => {
                self.metrics.record_merge_error(&err);
                trace!("demux: pending-event merge error for funcId={}", header.func_id);
                None
            }
        }
    }

    fn resolve_stack(&self, stack_id: i64, kernel_side: bool) -> Option<Vec<u64>> {
        if stack_id < 0 {
            if kernel_side {
                warn!("demux: kernel stack lookup failed (id={stack_id})");
            } else {
                debug!("demux: user stack lookup failed (id={stack_id})");
            }
            self.metrics.inc_stack_lookup_failure(kernel_side);
            return None;
        }
        self.stacks.lookup(stack_id as u64)
    }

    /// Dispatches `header.action_id` (spec.md §4.G step 2). `GetUrl` /
    /// `DnsLookup` carry their URL/FQDN in the action-argument side table
    /// populated at load time, not in this wire record, so the caller
    /// that owns that table (the loader) is what actually invokes
    /// [`action::spawn_get_url`] / [`action::spawn_dns_lookup`]; this hook
    /// exists for the one action this component can label on its own —
    /// `NotifyEnforcer` on `raw_syscalls/sys_enter`, whose syscall id
    /// rides in the decoded args.
    fn dispatch_action(&self, header: &EventHeader, config: &ConfigMapRecord) {
        if action_type_from_raw(header.action_id as u32) != Some(ActionType::NotifyEnforcer) {
            return;
        }
        if config.syscall == 0 {
            return;
        }
        trace!("demux: NotifyEnforcer armed for funcId={}", header.func_id);
    }
}

/// Maps a wire `actionId` back to its [`ActionType`] (spec.md §4.C/§4.G).
/// `pub` because the reader loop that owns the action-argument side table
/// needs the same mapping to dispatch `GetUrl`/`DnsLookup`.
pub fn action_type_from_raw(raw: u32) -> Option<ActionType> {
    Some(match raw {
        0 => ActionType::Invalid,
        1 => ActionType::Post,
        2 => ActionType::Sigkill,
        3 => ActionType::Override,
        4 => ActionType::GetUrl,
        5 => ActionType::DnsLookup,
        6 => ActionType::NotifyEnforcer,
        7 => ActionType::TrackSock,
        8 => ActionType::UntrackSock,
        _ => return None,
    })
}

fn parse_header(record: &[u8]) -> Option<EventHeader> {
    if record.len() < std::mem::size_of::<EventHeader>() {
        return None;
    }
    bytemuck::try_from_bytes::<EventHeader>(&record[..std::mem::size_of::<EventHeader>()])
        .ok()
        .copied()
}

/// Decodes the argument bytes following the header, per the wire→structured
/// table in spec.md §4.G. `is_return` selects `arg_return`/`arg_return_copy`
/// semantics for the copy-on-return case.
fn decode_args(config: &ConfigMapRecord, is_return: bool, mut body: &[u8]) -> Vec<ArgValue> {
    let mut out = Vec::new();
    for i in 0..config.arg_type.len() {
        if config.arg_type[i] < 0 {
            continue;
        }
        if is_return && config.arg_return_copy == 0 && i as i32 != config.arg_return {
            continue;
        }
        let meta = config.arg_meta[i];
        let Some(value) = decode_one(config.arg_type[i], meta, &mut body) else {
            break;
        };
        out.push(value);
    }
    out
}

fn decode_one(raw_type: i32, meta: u32, body: &mut &[u8]) -> Option<ArgValue> {
    let kind = kernel_type_from_raw(raw_type)?;
    match kind {
        KernelTypeId::U64 | KernelTypeId::Size => take_u64(body).map(ArgValue::U64),
        KernelTypeId::S64 => take_u64(body).map(|v| ArgValue::S64(v as i64)),
        KernelTypeId::U32 | KernelTypeId::Int => take_u32(body).map(ArgValue::U32),
        KernelTypeId::S32 => take_u32(body).map(|v| ArgValue::S32(v as i32)),
        KernelTypeId::CharBuf | KernelTypeId::CharIovec | KernelTypeId::ConstBuf => {
            let max_data = meta & arg_meta::MAX_DATA != 0;
            let cap = if max_data {
                probe_common::CHAR_BUF_MAX_DATA_CAP
            } else {
                probe_common::CHAR_BUF_DEFAULT_CAP
            };
            take_length_prefixed_bytes(body, cap).map(ArgValue::Bytes)
        }
        KernelTypeId::Str | KernelTypeId::DataLoc => {
            take_length_prefixed_bytes(body, probe_common::CHAR_BUF_MAX_DATA_CAP)
                .map(|b| ArgValue::Str(String::from_utf8_lossy(&b).into_owned()))
        }
        KernelTypeId::Skb | KernelTypeId::Sock | KernelTypeId::SockAddr => decode_sock_tuple(body),
        KernelTypeId::Syscall64 => take_u64(body).map(|raw| {
            // High bit flags a legacy 32-bit compat syscall; clear it to
            // recover the bare id (spec.md §4.G).
            const IS_32BIT_BIT: u64 = 1 << 63;
            let abi = if raw & IS_32BIT_BIT != 0 {
                SyscallAbi::X86
            } else {
                SyscallAbi::X86_64
            };
            ArgValue::Syscall {
                abi,
                id: (raw & !IS_32BIT_BIT) as i64,
            }
        }),
        KernelTypeId::LinuxBinprm => decode_path(body, false),
        KernelTypeId::File | KernelTypeId::Fd | KernelTypeId::Kiocb => decode_path(body, true),
        KernelTypeId::Invalid => None,
    }
}

fn kernel_type_from_raw(raw: i32) -> Option<KernelTypeId> {
    Some(match raw {
        0 => KernelTypeId::U64,
        1 => KernelTypeId::S64,
        2 => KernelTypeId::U32,
        3 => KernelTypeId::S32,
        4 => KernelTypeId::Int,
        5 => KernelTypeId::Size,
        6 => KernelTypeId::CharBuf,
        7 => KernelTypeId::CharIovec,
        8 => KernelTypeId::ConstBuf,
        9 => KernelTypeId::Str,
        10 => KernelTypeId::DataLoc,
        11 => KernelTypeId::Skb,
        12 => KernelTypeId::Sock,
        13 => KernelTypeId::SockAddr,
        14 => KernelTypeId::Syscall64,
        15 => KernelTypeId::LinuxBinprm,
        16 => KernelTypeId::File,
        17 => KernelTypeId::Fd,
        18 => KernelTypeId::Kiocb,
        _ => return None,
    })
}

fn take_u64(body: &mut &[u8]) -> Option<u64> {
    if body.len() < 8 {
        return None;
    }
    let (head, rest) = body.split_at(8);
    *body = rest;
    Some(u64::from_le_bytes(head.try_into().ok()?))
}

fn take_u32(body: &mut &[u8]) -> Option<u32> {
    if body.len() < 4 {
        return None;
    }
    let (head, rest) = body.split_at(4);
    *body = rest;
    Some(u32::from_le_bytes(head.try_into().ok()?))
}

fn take_length_prefixed_bytes(body: &mut &[u8], cap: usize) -> Option<Vec<u8>> {
    let len = take_u32(body)? as usize;
    let len = len.min(cap).min(body.len());
    let (head, rest) = body.split_at(len);
    *body = rest;
    Some(head.to_vec())
}

fn decode_sock_tuple(body: &mut &[u8]) -> Option<ArgValue> {
    if body.len() < 20 {
        return None;
    }
    let family = u16::from_le_bytes(body[0..2].try_into().ok()?);
    let protocol = u16::from_le_bytes(body[2..4].try_into().ok()?);
    let sport = u16::from_le_bytes(body[4..6].try_into().ok()?);
    let dport = u16::from_le_bytes(body[6..8].try_into().ok()?);
    let saddr = std::net::Ipv4Addr::new(body[8], body[9], body[10], body[11]).to_string();
    let daddr = std::net::Ipv4Addr::new(body[12], body[13], body[14], body[15]).to_string();
    *body = &body[20..];
    Some(ArgValue::SockTuple {
        family,
        protocol,
        saddr,
        daddr,
        sport,
        dport,
    })
}

fn decode_path(body: &mut &[u8], has_fd: bool) -> Option<ArgValue> {
    let fd = if has_fd { Some(take_u32(body)? as i32) } else { None };
    let path_bytes = take_length_prefixed_bytes(body, probe_common::CHAR_BUF_DEFAULT_CAP)?;
    let flags = take_u32(body).unwrap_or(0);
    let mode = take_u32(body).unwrap_or(0);
    Some(ArgValue::Path {
        fd,
        path: String::from_utf8_lossy(&path_bytes).into_owned(),
        flags,
        mode,
    })
}

/// Pairs an `Enter`/`Return` event, overlaying return args by index and
/// stamping `returnAction` from the return side (spec.md §4.G step 6).
fn merge_events(enter: DecodedEvent, ret: DecodedEvent) -> DecodedEvent {
    let mut merged = enter;
    for (i, arg) in ret.args.into_iter().enumerate() {
        if let Some(slot) = merged.args.get_mut(i) {
            *slot = arg;
        } else {
            merged.args.push(arg);
        }
    }
    merged.return_action = Some(ret.action_id);
    merged.kernel_stack = merged.kernel_stack.or(ret.kernel_stack);
    merged.user_stack = merged.user_stack.or(ret.user_stack);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoStacks;
    impl StackTraceLookup for NoStacks {
        fn lookup(&self, _stack_id: u64) -> Option<Vec<u64>> {
            None
        }
    }

    fn entry(id: u32, has_return: bool) -> crate::catalog::ProbeEntry {
        use crate::catalog::{KprobeEntry, ProbeEntry, ProbeKind};
        use crate::selector::compiler::{CompiledSelectorState, SelectorInnerMaps};

        let state = || {
            Arc::new(CompiledSelectorState {
                packed: vec![],
                selectors: vec![],
                inner_maps: SelectorInnerMaps::default(),
            })
        };
        ProbeEntry {
            id: ProbeId(id),
            policy_id: 1,
            kind: ProbeKind::Kprobe(KprobeEntry {
                symbol: "sys_openat".into(),
                is_return: false,
                is_syscall: true,
            }),
            config: {
                let mut c = ConfigMapRecord::zeroed();
                c.arg_type[0] = KernelTypeId::U64 as i32;
                c
            },
            entry_selectors: state(),
            return_selectors: if has_return { Some(state()) } else { None },
            pin_name: "sys_openat".into(),
            instance: 0,
            message: None,
        }
    }

    fn record_for(func_id: u32, ret_probe_id: u32, ktime: u64, is_return: bool, payload: u64) -> Vec<u8> {
        let header = EventHeader {
            op: 0,
            size: 0,
            ktime,
            flags: if is_return { event_flags::RETURN } else { 0 },
            pid: 1234,
            tid: 1234,
            func_id,
            ret_probe_id,
            action_id: -1,
            action_arg_id: 0,
            kernel_stack_id: -1,
            user_stack_id: -1,
            _pad: 0,
        };
        let mut buf = bytemuck::bytes_of(&header).to_vec();
        buf.extend_from_slice(&payload.to_le_bytes());
        buf
    }

    #[test]
    fn no_retprobe_pairing_emits_immediately() {
        let catalog = Arc::new(Catalog::new());
        catalog.add_entry(entry(7, false));
        let mut demux = Demultiplexer::new(catalog, Arc::new(Metrics::new()), NoStacks);
        let record = record_for(7, 0, 100, false, 42);
        let decoded = demux.handle_record(&record).unwrap();
        assert_eq!(decoded.args[0], ArgValue::U64(42));
    }

    #[test]
    fn enter_then_return_merges_and_sets_return_action() {
        let catalog = Arc::new(Catalog::new());
        catalog.add_entry(entry(7, true));
        let mut demux = Demultiplexer::new(catalog, Arc::new(Metrics::new()), NoStacks);

        let enter = record_for(7, 99, 100, false, 10);
        assert!(demux.handle_record(&enter).is_none());

        let ret = record_for(7, 99, 100, true, 20);
        let merged = demux.handle_record(&ret).unwrap();
        assert_eq!(merged.args[0], ArgValue::U64(20));
    }

    #[test]
    fn unknown_funcid_is_dropped() {
        let catalog = Arc::new(Catalog::new());
        let mut demux = Demultiplexer::new(catalog, Arc::new(Metrics::new()), NoStacks);
        let record = record_for(404, 0, 1, false, 1);
        assert!(demux.handle_record(&record).is_none());
    }
}

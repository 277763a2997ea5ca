//! Component H: action executor (spec.md §4.H).
//!
//! `GetUrl` and `DnsLookup` are side-signals to third-party infrastructure
//! and must never back-pressure the reader (spec.md §5 "suspension
//! points": both run as spawned tasks, not awaited inline). `DnsLookup`
//! is a hand-rolled A-record query over UDP rather than a resolver crate:
//! nothing in this codebase's dependency stack offers one, and a pinned
//! `1.1.1.1:53` resolver (spec.md §4.H) needs exactly one query type, not
//! a general resolver. `NotifyEnforcer` and the kernel-map counters it
//! touches are represented here only as the per-ABI name resolution the
//! executor needs before incrementing them; the counter write itself is a
//! kernel map update performed by the loader's attached program.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::metrics::Metrics;

const DNS_RESOLVER: &str = "1.1.1.1:53";
const DNS_TIMEOUT: Duration = Duration::from_secs(2);
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Fire-and-forget HTTP GET (spec.md §4.H). Spawned so a slow or
/// unreachable endpoint can never stall the event reader.
pub fn spawn_get_url(client: reqwest::Client, url: String, metrics: Arc<Metrics>) {
    tokio::spawn(async move {
        let result = timeout(HTTP_TIMEOUT, client.get(&url).send()).await;
        match result {
            Ok(Ok(resp)) => debug!("GetUrl {url} -> {}", resp.status()),
            Ok(Err(err)) => {
                warn!("GetUrl {url} failed: {err}");
                metrics.inc_get_url_error();
            }
            Err(_) => {
                warn!("GetUrl {url} timed out after {HTTP_TIMEOUT:?}");
                metrics.inc_get_url_error();
            }
        }
    });
}

/// Fire-and-forget DNS A-record lookup against a pinned resolver
/// (spec.md §4.H). Spawned for the same reason as `GetUrl`.
pub fn spawn_dns_lookup(fqdn: String, metrics: Arc<Metrics>) {
    tokio::spawn(async move {
        match timeout(DNS_TIMEOUT, query_a_record(&fqdn)).await {
            Ok(Ok(addrs)) => debug!("DnsLookup {fqdn} -> {addrs:?}"),
            Ok(Err(err)) => {
                warn!("DnsLookup {fqdn} failed: {err:#}");
                metrics.inc_dns_lookup_error();
            }
            Err(_) => {
                warn!("DnsLookup {fqdn} timed out after {DNS_TIMEOUT:?}");
                metrics.inc_dns_lookup_error();
            }
        }
    });
}

async fn query_a_record(fqdn: &str) -> anyhow::Result<Vec<std::net::Ipv4Addr>> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let resolver: SocketAddr = DNS_RESOLVER.parse()?;
    let query = build_a_query(fqdn);
    socket.send_to(&query, resolver).await?;

    let mut buf = [0u8; 512];
    let (n, _) = socket.recv_from(&mut buf).await?;
    parse_a_response(&buf[..n])
}

/// Builds a minimal recursive A-record query: 12-byte header plus one
/// question section, no EDNS.
fn build_a_query(fqdn: &str) -> Vec<u8> {
    let id: u16 = (std::process::id() & 0xffff) as u16;
    let mut packet = Vec::with_capacity(32);
    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&0x0100u16.to_be_bytes()); // RD=1
    packet.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes()); // ANCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes()); // ARCOUNT

    for label in fqdn.trim_end_matches('.').split('.') {
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0); // root label
    packet.extend_from_slice(&1u16.to_be_bytes()); // QTYPE A
    packet.extend_from_slice(&1u16.to_be_bytes()); // QCLASS IN
    packet
}

fn parse_a_response(buf: &[u8]) -> anyhow::Result<Vec<std::net::Ipv4Addr>> {
    anyhow::ensure!(buf.len() >= 12, "DNS response shorter than header");
    let ancount = u16::from_be_bytes([buf[6], buf[7]]) as usize;
    let mut offset = 12;

    // Skip the question section we sent.
    offset = skip_name(buf, offset)?;
    offset += 4; // QTYPE + QCLASS

    let mut addrs = Vec::new();
    for _ in 0..ancount {
        offset = skip_name(buf, offset)?;
        anyhow::ensure!(buf.len() >= offset + 10, "truncated resource record");
        let rtype = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
        let rdlength = u16::from_be_bytes([buf[offset + 8], buf[offset + 9]]) as usize;
        offset += 10;
        anyhow::ensure!(buf.len() >= offset + rdlength, "truncated rdata");
        if rtype == 1 && rdlength == 4 {
            addrs.push(std::net::Ipv4Addr::new(
                buf[offset],
                buf[offset + 1],
                buf[offset + 2],
                buf[offset + 3],
            ));
        }
        offset += rdlength;
    }
    Ok(addrs)
}

/// Advances past a (possibly compressed) DNS name, returning the offset
/// just after it.
fn skip_name(buf: &[u8], mut offset: usize) -> anyhow::Result<usize> {
    loop {
        anyhow::ensure!(offset < buf.len(), "name runs past end of packet");
        let len = buf[offset];
        if len == 0 {
            return Ok(offset + 1);
        }
        if len & 0xc0 == 0xc0 {
            // Compression pointer: two bytes, doesn't recurse further here.
            anyhow::ensure!(offset + 1 < buf.len(), "truncated compression pointer");
            return Ok(offset + 2);
        }
        offset += 1 + len as usize;
    }
}

/// Resolves a syscall id to its name for the given ABI, for labeling the
/// `NotifyEnforcer` metric on `raw_syscalls/sys_enter` (spec.md §4.H).
/// Falls back to a numeric placeholder for syscalls outside the curated
/// table rather than failing the action.
pub fn syscall_name(abi: SyscallAbi, id: i64) -> String {
    let table: &[(i64, &str)] = match abi {
        SyscallAbi::X86_64 => X86_64_SYSCALLS,
        SyscallAbi::X86 => X86_SYSCALLS,
    };
    table
        .iter()
        .find(|(n, _)| *n == id)
        .map(|(_, name)| name.to_string())
        .unwrap_or_else(|| format!("sys_{id}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallAbi {
    X86_64,
    X86,
}

const X86_64_SYSCALLS: &[(i64, &str)] = &[
    (0, "read"),
    (1, "write"),
    (2, "open"),
    (3, "close"),
    (9, "mmap"),
    (10, "mprotect"),
    (11, "munmap"),
    (21, "access"),
    (41, "socket"),
    (42, "connect"),
    (49, "bind"),
    (56, "clone"),
    (57, "fork"),
    (59, "execve"),
    (60, "exit"),
    (61, "wait4"),
    (62, "kill"),
    (83, "mkdir"),
    (87, "unlink"),
    (101, "ptrace"),
    (257, "openat"),
    (322, "execveat"),
];

const X86_SYSCALLS: &[(i64, &str)] = &[
    (1, "exit"),
    (2, "fork"),
    (3, "read"),
    (4, "write"),
    (5, "open"),
    (6, "close"),
    (11, "execve"),
    (37, "kill"),
    (295, "openat"),
    (358, "execveat"),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscall_name_resolves_known_ids() {
        assert_eq!(syscall_name(SyscallAbi::X86_64, 59), "execve");
        assert_eq!(syscall_name(SyscallAbi::X86, 11), "execve");
    }

    #[test]
    fn syscall_name_falls_back_to_numeric_placeholder() {
        assert_eq!(syscall_name(SyscallAbi::X86_64, 9999), "sys_9999");
    }

    #[test]
    fn a_query_packet_encodes_question_section() {
        let packet = build_a_query("example.com");
        assert_eq!(&packet[0..2], &(std::process::id() as u16 & 0xffff).to_be_bytes());
        assert_eq!(u16::from_be_bytes([packet[4], packet[5]]), 1);
        assert!(packet.ends_with(&[0, 1, 0, 1]));
    }

    #[test]
    fn skip_name_advances_past_root_label() {
        let buf = [7, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 0, 0xaa];
        assert_eq!(skip_name(&buf, 0).unwrap(), 9);
    }
}

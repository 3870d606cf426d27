//! Echo probing. `Pinger` is the seam between the scheduler and the wire;
//! `IcmpPinger` is the raw-socket implementation behind it.

use anyhow::{Context, Result};
use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::time::{Duration, Instant};

use pnet::packet::icmp::echo_reply::EchoReplyPacket;
use pnet::packet::icmp::echo_request::{self as icmp_echo_request, MutableEchoRequestPacket};
use pnet::packet::icmp::{IcmpTypes, MutableIcmpPacket};
use pnet::packet::icmpv6::echo_reply::EchoReplyPacket as EchoReplyV6Packet;
use pnet::packet::icmpv6::echo_request::{
    Icmpv6Codes, MutableEchoRequestPacket as MutableEchoRequestV6Packet,
};
use pnet::packet::icmpv6::{Icmpv6Packet, Icmpv6Types};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::{MutablePacket, Packet};
use pnet::util;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use thiserror::Error;

pub const DEFAULT_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_PAYLOAD_SIZE: usize = 32;
pub const DEFAULT_TTL: u8 = 128;
pub const MAX_PAYLOAD_SIZE: usize = 65500;
pub const MAX_RECORD_ROUTE: u8 = 9;
pub const MAX_TIMESTAMP: u8 = 4;

const ICMP_HEADER_SIZE: usize = 8;
const PAYLOAD_PATTERN: &[u8] = b"SWEEPER_PAYLOAD_";

/// Immutable probe configuration, shared read-only by all workers.
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    pub timeout: Duration,
    pub payload_size: usize,
    pub ttl: u32,
    pub tos: u32,
    pub dont_fragment: bool,
    pub record_route: u8,
    pub timestamp: u8,
    pub loose_source_route: Vec<Ipv4Addr>,
    pub strict_source_route: Vec<Ipv4Addr>,
    pub source: Option<IpAddr>,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            payload_size: DEFAULT_PAYLOAD_SIZE,
            ttl: u32::from(DEFAULT_TTL),
            tos: 0,
            dont_fragment: false,
            record_route: 0,
            timestamp: 0,
            loose_source_route: Vec::new(),
            strict_source_route: Vec::new(),
            source: None,
        }
    }
}

impl ProbeOptions {
    fn wants_ip_header_options(&self) -> bool {
        self.dont_fragment
            || self.record_route > 0
            || self.timestamp > 0
            || !self.loose_source_route.is_empty()
            || !self.strict_source_route.is_empty()
    }
}

/// Result of a single probe, consumed immediately by the scheduler.
#[derive(Debug, Clone, Default)]
pub struct ProbeOutcome {
    pub success: bool,
    pub rtt: Duration,
    pub reply_ttl: u32,
    pub route_hops: Vec<Ipv4Addr>,
    pub timestamps: Vec<u32>,
}

impl ProbeOutcome {
    /// A timeout or unreachable outcome; recorded as a loss, never an error.
    pub fn lost() -> Self {
        Self::default()
    }
}

/// Raised once, up front, when the transport cannot be brought up at all.
/// Maps to its own exit code.
#[derive(Debug, Error)]
#[error("echo transport unavailable: {0}")]
pub struct TransportInitError(String);

pub trait Pinger {
    /// Sends one echo request and waits for the matching reply, bounded by
    /// `opts.timeout`.
    fn probe(&self, addr: IpAddr, opts: &ProbeOptions) -> ProbeOutcome;
}

/// Raw-socket ICMP transport. Each probe opens its own socket, scoped to
/// the call, so cancellation mid-run never leaks a handle. Replies are
/// matched on the process-wide identifier plus a per-probe sequence number.
pub struct IcmpPinger {
    identifier: u16,
    sequence: AtomicU16,
    warned_source: AtomicBool,
}

impl IcmpPinger {
    /// Verifies that a raw socket can be opened for every address family
    /// present in the target list; without privileges this fails here, once,
    /// rather than on every probe.
    pub fn new(targets: &[IpAddr], opts: &ProbeOptions) -> Result<Self, TransportInitError> {
        if targets.iter().any(IpAddr::is_ipv4) {
            open_socket(false).map_err(|e| TransportInitError(format!("ICMPv4 raw socket: {e}")))?;
        }
        if targets.iter().any(IpAddr::is_ipv6) {
            open_socket(true).map_err(|e| TransportInitError(format!("ICMPv6 raw socket: {e}")))?;
        }
        if opts.wants_ip_header_options() {
            eprintln!(
                "warning: IP header options (-f/-r/-s/-j/-k) are not supported by the \
                 raw-socket transport and will be ignored"
            );
        }
        Ok(Self {
            identifier: process::id() as u16,
            sequence: AtomicU16::new(1),
            warned_source: AtomicBool::new(false),
        })
    }

    fn probe_v4(&self, addr: IpAddr, opts: &ProbeOptions) -> Result<ProbeOutcome> {
        let socket = open_socket(false).context("failed to open ICMPv4 socket")?;
        socket.set_ttl(opts.ttl).context("failed to set TTL")?;
        if opts.tos != 0 {
            socket.set_tos(opts.tos).context("failed to set TOS")?;
        }
        self.bind_source(&socket, opts, false);
        socket
            .connect(&SockAddr::from(SocketAddr::new(addr, 0)))
            .context("failed to connect raw socket")?;

        let sequence = self.next_sequence();
        let mut buf = vec![0u8; ICMP_HEADER_SIZE + opts.payload_size];
        {
            let mut icmp = MutableIcmpPacket::new(&mut buf)
                .context("echo request buffer too small")?;
            icmp.set_icmp_type(IcmpTypes::EchoRequest);
            icmp.set_icmp_code(icmp_echo_request::IcmpCodes::NoCode);
            let mut echo = MutableEchoRequestPacket::new(icmp.packet_mut())
                .context("echo request buffer too small")?;
            echo.set_identifier(self.identifier);
            echo.set_sequence_number(sequence);
            fill_payload(echo.payload_mut());
            let checksum = util::checksum(echo.packet(), 1);
            MutableIcmpPacket::new(echo.packet_mut())
                .context("echo request buffer too small")?
                .set_checksum(checksum);
        }

        let sent_at = Instant::now();
        socket.send(&buf).context("failed to send echo request")?;

        let deadline = sent_at + opts.timeout;
        let mut recv_buf = [MaybeUninit::<u8>::uninit(); 65536];
        loop {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Ok(ProbeOutcome::lost());
            };
            socket
                .set_read_timeout(Some(remaining.max(Duration::from_millis(1))))
                .context("failed to set read timeout")?;
            let read = match socket.recv(&mut recv_buf) {
                Ok(n) => n,
                Err(e) if is_timeout(&e) => return Ok(ProbeOutcome::lost()),
                Err(e) => return Err(e).context("failed to receive echo reply"),
            };
            // A raw ICMPv4 socket delivers the full IP packet.
            let data = unsafe {
                std::slice::from_raw_parts(recv_buf.as_ptr() as *const u8, read)
            };
            let Some(ip) = Ipv4Packet::new(data) else { continue };
            let Some(reply) = EchoReplyPacket::new(ip.payload()) else { continue };
            if reply.get_icmp_type() != IcmpTypes::EchoReply
                || reply.get_identifier() != self.identifier
                || reply.get_sequence_number() != sequence
            {
                continue;
            }
            return Ok(ProbeOutcome {
                success: true,
                rtt: sent_at.elapsed(),
                reply_ttl: u32::from(ip.get_ttl()),
                route_hops: Vec::new(),
                timestamps: Vec::new(),
            });
        }
    }

    fn probe_v6(&self, addr: IpAddr, opts: &ProbeOptions) -> Result<ProbeOutcome> {
        let socket = open_socket(true).context("failed to open ICMPv6 socket")?;
        socket
            .set_unicast_hops_v6(opts.ttl)
            .context("failed to set hop limit")?;
        self.bind_source(&socket, opts, true);
        socket
            .connect(&SockAddr::from(SocketAddr::new(addr, 0)))
            .context("failed to connect raw socket")?;

        let sequence = self.next_sequence();
        let mut buf = vec![0u8; ICMP_HEADER_SIZE + opts.payload_size];
        {
            let mut echo = MutableEchoRequestV6Packet::new(&mut buf)
                .context("echo request buffer too small")?;
            echo.set_icmpv6_type(Icmpv6Types::EchoRequest);
            echo.set_icmpv6_code(Icmpv6Codes::NoCode);
            echo.set_identifier(self.identifier);
            echo.set_sequence_number(sequence);
            fill_payload(echo.payload_mut());
            // The kernel fills in the ICMPv6 checksum on raw ICMPv6 sockets.
        }

        let sent_at = Instant::now();
        socket.send(&buf).context("failed to send echo request")?;

        let deadline = sent_at + opts.timeout;
        let mut recv_buf = [MaybeUninit::<u8>::uninit(); 65536];
        loop {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Ok(ProbeOutcome::lost());
            };
            socket
                .set_read_timeout(Some(remaining.max(Duration::from_millis(1))))
                .context("failed to set read timeout")?;
            let read = match socket.recv(&mut recv_buf) {
                Ok(n) => n,
                Err(e) if is_timeout(&e) => return Ok(ProbeOutcome::lost()),
                Err(e) => return Err(e).context("failed to receive echo reply"),
            };
            // Raw ICMPv6 sockets deliver the ICMPv6 header onward, no IP header.
            let data = unsafe {
                std::slice::from_raw_parts(recv_buf.as_ptr() as *const u8, read)
            };
            let Some(icmp) = Icmpv6Packet::new(data) else { continue };
            if icmp.get_icmpv6_type() != Icmpv6Types::EchoReply {
                continue;
            }
            let Some(reply) = EchoReplyV6Packet::new(data) else { continue };
            if reply.get_identifier() != self.identifier
                || reply.get_sequence_number() != sequence
            {
                continue;
            }
            // No hop limit in the reply without ancillary data; report the
            // request's value, as the original tool does.
            return Ok(ProbeOutcome {
                success: true,
                rtt: sent_at.elapsed(),
                reply_ttl: opts.ttl,
                route_hops: Vec::new(),
                timestamps: Vec::new(),
            });
        }
    }

    fn next_sequence(&self) -> u16 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// A source address the socket cannot bind is a one-time warning, not
    /// an error; probing falls back to the system default.
    fn bind_source(&self, socket: &Socket, opts: &ProbeOptions, want_v6: bool) {
        let Some(source) = opts.source else { return };
        let bound = source.is_ipv6() == want_v6
            && socket
                .bind(&SockAddr::from(SocketAddr::new(source, 0)))
                .is_ok();
        if !bound && !self.warned_source.swap(true, Ordering::Relaxed) {
            eprintln!("warning: could not probe from source address {source}; using the system default");
        }
    }
}

impl Pinger for IcmpPinger {
    fn probe(&self, addr: IpAddr, opts: &ProbeOptions) -> ProbeOutcome {
        let result = match addr {
            IpAddr::V4(_) => self.probe_v4(addr, opts),
            IpAddr::V6(_) => self.probe_v6(addr, opts),
        };
        // Socket-level failures on an individual probe count as losses; the
        // sweep keeps going.
        result.unwrap_or_else(|_| ProbeOutcome::lost())
    }
}

fn open_socket(v6: bool) -> io::Result<Socket> {
    if v6 {
        Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6))
    } else {
        Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn fill_payload(buf: &mut [u8]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte = PAYLOAD_PATTERN[i % PAYLOAD_PATTERN.len()];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_repeats_the_pattern() {
        let mut buf = [0u8; 40];
        fill_payload(&mut buf);
        assert_eq!(&buf[..16], PAYLOAD_PATTERN);
        assert_eq!(&buf[16..32], PAYLOAD_PATTERN);
        assert_eq!(&buf[32..40], &PAYLOAD_PATTERN[..8]);
    }

    #[test]
    fn lost_outcome_is_empty() {
        let outcome = ProbeOutcome::lost();
        assert!(!outcome.success);
        assert_eq!(outcome.rtt, Duration::ZERO);
        assert!(outcome.route_hops.is_empty());
        assert!(outcome.timestamps.is_empty());
    }

    #[test]
    fn header_option_detection() {
        let mut opts = ProbeOptions::default();
        assert!(!opts.wants_ip_header_options());
        opts.record_route = 3;
        assert!(opts.wants_ip_header_options());
        opts = ProbeOptions {
            dont_fragment: true,
            ..ProbeOptions::default()
        };
        assert!(opts.wants_ip_header_options());
    }
}

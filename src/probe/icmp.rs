//! Native ICMPv4 echo transport.
//!
//! Uses blocking sockets in spawn_blocking for sub-millisecond timing precision.

use std::collections::{BTreeSet, HashMap};
use std::io::Read;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};

use super::{probe_all, ProbeOptions, ProbeTransport, TransportError};
use crate::models::ProbeSample;

const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_ECHO_REPLY: u8 = 0;
const ECHO_PACKET_LEN: usize = 64;

/// Echo transport over `socket2` ICMP sockets.
///
/// Privileged mode opens RAW sockets (root or CAP_NET_RAW). Unprivileged mode
/// opens DGRAM "ping sockets" (Linux `net.ipv4.ping_group_range`, macOS).
#[derive(Debug, Clone, Copy, Default)]
pub struct IcmpTransport;

#[async_trait]
impl ProbeTransport for IcmpTransport {
    async fn probe(
        &self,
        addresses: &BTreeSet<Ipv4Addr>,
        options: &ProbeOptions,
    ) -> Result<HashMap<Ipv4Addr, ProbeSample>, TransportError> {
        // Dropping this call (target deadline, failed sibling) stops the echo loops
        let cancelled = Arc::new(AtomicBool::new(false));
        let _guard = CancelOnDrop(cancelled.clone());

        probe_all(addresses, options.concurrency, |ip| {
            let options = options.clone();
            let cancelled = cancelled.clone();
            async move {
                tokio::task::spawn_blocking(move || run_echo_sequence(ip, &options, &cancelled))
                    .await
                    .map_err(|e| TransportError::Task(format!("spawn_blocking failed: {}", e)))?
            }
        })
        .await
    }
}

/// Raises its flag when dropped.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Check whether an ICMP socket can be opened in the given mode.
pub fn icmp_available(privileged: bool) -> bool {
    open_socket(privileged).is_ok()
}

fn open_socket(privileged: bool) -> std::io::Result<Socket> {
    let ty = if privileged { Type::RAW } else { Type::DGRAM };
    Socket::new(Domain::IPV4, ty, Some(Protocol::ICMPV4))
}

/// Send `count` echoes to one address and record each RTT.
///
/// Stops early, returning the echoes recorded so far, once `cancelled` is set.
fn run_echo_sequence(
    ip: Ipv4Addr,
    options: &ProbeOptions,
    cancelled: &AtomicBool,
) -> Result<ProbeSample, TransportError> {
    if cancelled.load(Ordering::Relaxed) {
        return Ok(ProbeSample::default());
    }

    let socket = open_socket(options.privileged).map_err(|e| {
        let mode = if options.privileged { "RAW" } else { "DGRAM" };
        TransportError::Socket(format!("failed to create {} ICMP socket: {}", mode, e))
    })?;

    socket
        .set_write_timeout(Some(options.timeout))
        .map_err(|e| TransportError::Socket(format!("failed to set timeout: {}", e)))?;

    let dest = SocketAddr::new(IpAddr::V4(ip), 0);
    socket
        .connect(&dest.into())
        .map_err(|e| TransportError::Socket(format!("failed to connect to {}: {}", ip, e)))?;

    let identifier: u16 = rand::random();
    let mut rtts = Vec::with_capacity(options.count as usize);

    // Sequence numbers never wrap, so a late reply cannot match a newer echo
    let count = u16::try_from(options.count).unwrap_or(u16::MAX);
    for sequence in 0..count {
        if sequence > 0 && !options.interval.is_zero() {
            std::thread::sleep(options.interval);
        }
        if cancelled.load(Ordering::Relaxed) {
            tracing::debug!(%ip, sent = sequence, "echo sequence cancelled");
            break;
        }

        let rtt = echo_once(&socket, identifier, sequence, options)?;
        tracing::trace!(%ip, sequence, rtt_ms = ?rtt, "echo finished");
        rtts.push(rtt);
    }

    Ok(ProbeSample::from_rtts(rtts))
}

/// One echo exchange. `Ok(None)` means the reply did not arrive in time.
fn echo_once(
    socket: &Socket,
    identifier: u16,
    sequence: u16,
    options: &ProbeOptions,
) -> Result<Option<f64>, TransportError> {
    let packet = build_echo_request(identifier, sequence);

    // Start timing just before send
    let start = Instant::now();

    if let Err(e) = socket.send(&packet) {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            return Err(TransportError::Socket(format!("permission denied: {}", e)));
        }
        // Unreachable networks and full buffers count as a lost probe
        tracing::debug!(error = %e, sequence, "echo send failed");
        return Ok(None);
    }

    let mut buf = [0u8; 1500];
    loop {
        let remaining = match options.timeout.checked_sub(start.elapsed()) {
            Some(d) if !d.is_zero() => d,
            _ => return Ok(None),
        };
        socket
            .set_read_timeout(Some(remaining))
            .map_err(|e| TransportError::Socket(format!("failed to set timeout: {}", e)))?;

        let len = match (&*socket).read(&mut buf) {
            Ok(n) => n,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                return Ok(None);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!(error = %e, sequence, "echo receive failed");
                return Ok(None);
            }
        };

        // Stop timing immediately after receive
        let elapsed = start.elapsed();
        if elapsed >= options.timeout {
            return Ok(None);
        }

        // DGRAM sockets get the kernel-assigned identifier, so only RAW checks it
        let expected_id = options.privileged.then_some(identifier);
        if is_matching_reply(&buf[..len], expected_id, sequence) {
            return Ok(Some(elapsed.as_secs_f64() * 1000.0));
        }
        // Someone else's packet, keep waiting
    }
}

/// Check a received datagram against the echo we sent.
///
/// RAW sockets deliver the IPv4 header first; DGRAM sockets deliver bare ICMP.
fn is_matching_reply(buf: &[u8], identifier: Option<u16>, sequence: u16) -> bool {
    let icmp = match buf.first() {
        Some(&b) if b >> 4 == 4 => {
            let ihl = usize::from(b & 0x0F) * 4;
            match buf.get(ihl..) {
                Some(rest) => rest,
                None => return false,
            }
        }
        Some(_) => buf,
        None => return false,
    };

    if icmp.len() < 8 || icmp[0] != ICMP_ECHO_REPLY {
        return false;
    }

    let reply_id = u16::from_be_bytes([icmp[4], icmp[5]]);
    let reply_seq = u16::from_be_bytes([icmp[6], icmp[7]]);

    reply_seq == sequence && identifier.map_or(true, |id| id == reply_id)
}

/// Build an ICMP Echo Request packet (type 8, code 0).
fn build_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; ECHO_PACKET_LEN]; // 8 byte header + 56 byte payload

    packet[0] = ICMP_ECHO_REQUEST;
    packet[1] = 0;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    // Fill payload with timestamp
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    packet[8..16].copy_from_slice(&timestamp.to_be_bytes());

    let checksum = icmp_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());

    packet
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);

    for pair in &mut chunks {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
    }

    // Handle odd byte
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }

    // Fold 32-bit sum to 16 bits
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_reply(identifier: u16, sequence: u16) -> Vec<u8> {
        let mut packet = build_echo_request(identifier, sequence);
        packet[0] = ICMP_ECHO_REPLY;
        packet
    }

    #[test]
    fn test_icmp_checksum_verifies() {
        // A packet carrying its own checksum sums to zero
        let packet = build_echo_request(0x1234, 0x0001);
        assert_eq!(icmp_checksum(&packet), 0);
    }

    #[test]
    fn test_icmp_checksum_odd_and_empty() {
        assert_eq!(icmp_checksum(&[]), 0xFFFF);
        assert_eq!(icmp_checksum(&[0x01]), !0x0100);
    }

    #[test]
    fn test_build_icmp_packet() {
        let packet = build_echo_request(0x1234, 0x0001);
        assert_eq!(packet.len(), ECHO_PACKET_LEN);
        assert_eq!(packet[0], 8); // Type
        assert_eq!(packet[1], 0); // Code
        assert_eq!(packet[4..6], [0x12, 0x34]); // ID
        assert_eq!(packet[6..8], [0x00, 0x01]); // Sequence
    }

    #[test]
    fn test_match_dgram_reply() {
        let reply = echo_reply(0xBEEF, 3);
        assert!(is_matching_reply(&reply, None, 3));
        assert!(!is_matching_reply(&reply, None, 4));
    }

    #[test]
    fn test_match_raw_reply_skips_ip_header() {
        let mut datagram = vec![0u8; 20];
        datagram[0] = 0x45; // IPv4, IHL = 5 words
        datagram.extend(echo_reply(0xBEEF, 7));

        assert!(is_matching_reply(&datagram, Some(0xBEEF), 7));
        assert!(!is_matching_reply(&datagram, Some(0xCAFE), 7));
    }

    #[test]
    fn test_cancel_on_drop() {
        let flag = Arc::new(AtomicBool::new(false));
        let guard = CancelOnDrop(flag.clone());
        assert!(!flag.load(Ordering::Relaxed));
        drop(guard);
        assert!(flag.load(Ordering::Relaxed));
    }

    #[test]
    fn test_cancelled_sequence_sends_nothing() {
        let sample =
            run_echo_sequence(Ipv4Addr::LOCALHOST, &ProbeOptions::default(), &AtomicBool::new(true))
                .unwrap();
        assert_eq!(sample.packets_sent, 0);
        assert!(sample.rtts.is_empty());
    }

    #[test]
    fn test_ignore_non_reply() {
        let request = build_echo_request(1, 1);
        assert!(!is_matching_reply(&request, None, 1));
        assert!(!is_matching_reply(&[], None, 1));
        assert!(!is_matching_reply(&[0x45, 0, 0], None, 1));
    }
}

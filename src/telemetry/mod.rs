//! Telemetry intake
//!
//! One bound UDP socket per enabled source, each owned by its own worker
//! thread. Decoders turn datagrams into zero or more [`SimplePacket`]s and
//! hand them to the [`PacketSink`]; malformed frames are tallied by
//! `(source, reason)` and dropped, never aborting the worker.
//!
//! The intake is the only layer that knows a wire format.

pub(crate) mod cursor;
pub mod mirror;
pub mod netflow;
pub mod sflow;

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;
use tracing::{info, trace, warn};

use crate::core::SimplePacket;

/// Downstream seam: the intake holds one sink per enabled consumer
pub trait PacketSink: Send + Sync {
    fn consume(&self, packet: SimplePacket);
}

/// Why a frame (or record) was dropped
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("datagram too short reading {0}")]
    Truncated(&'static str),

    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),

    #[error("frame parse error: {0}")]
    FrameParse(String),

    #[error("no IP layer in frame")]
    NonIp,

    #[error("unknown template {template_id} from observation domain {domain}")]
    UnknownTemplate { domain: u32, template_id: u16 },

    #[error("implausible length field")]
    BadLength,
}

impl DecodeError {
    /// Stable label used as the error-tally key
    pub fn reason(&self) -> &'static str {
        match self {
            DecodeError::Truncated(_) => "truncated",
            DecodeError::UnsupportedVersion(_) => "unsupported_version",
            DecodeError::FrameParse(_) => "frame_parse",
            DecodeError::NonIp => "non_ip",
            DecodeError::UnknownTemplate { .. } => "unknown_template",
            DecodeError::BadLength => "bad_length",
        }
    }
}

/// Malformed-frame tallies and throughput counters
#[derive(Debug, Default)]
pub struct IntakeStats {
    pub datagrams: AtomicU64,
    pub records: AtomicU64,
    errors: DashMap<(IpAddr, &'static str), u64>,
}

impl IntakeStats {
    pub fn record_error(&self, source: IpAddr, reason: &'static str) {
        *self.errors.entry((source, reason)).or_insert(0) += 1;
    }

    pub fn error_count(&self, source: IpAddr, reason: &'static str) -> u64 {
        self.errors.get(&(source, reason)).map(|v| *v).unwrap_or(0)
    }

    pub fn errors_snapshot(&self) -> Vec<(IpAddr, &'static str, u64)> {
        self.errors
            .iter()
            .map(|entry| (entry.key().0, entry.key().1, *entry.value()))
            .collect()
    }
}

/// A stateful per-source decoder. Template caches and similar state are
/// private to the owning worker; nothing here is shared.
pub trait DatagramDecoder: Send {
    fn name(&self) -> &'static str;

    fn parse(
        &mut self,
        data: &[u8],
        source: IpAddr,
        stats: &IntakeStats,
    ) -> Result<Vec<SimplePacket>, DecodeError>;
}

/// Monotonic nanoseconds since process start, the capture-timestamp base
pub fn monotonic_nanos() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Bind and spawn one intake worker.
///
/// The bind happens on the caller's thread so a failure surfaces before
/// startup completes (and maps to the bind-failure exit code). The worker
/// observes the cancel flag between recvs; the socket timeout bounds the
/// shutdown latency to one second.
pub fn spawn_udp_listener(
    name: &'static str,
    listen: SocketAddr,
    mut decoder: Box<dyn DatagramDecoder>,
    sink: Arc<dyn PacketSink>,
    stats: Arc<IntakeStats>,
    cancel: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    let socket = UdpSocket::bind(listen)?;
    socket.set_read_timeout(Some(Duration::from_secs(1)))?;
    info!("{} intake listening on {}", name, listen);

    std::thread::Builder::new()
        .name(format!("intake-{}", name))
        .spawn(move || {
            let mut buf = vec![0u8; 65_535];

            while !cancel.load(Ordering::Relaxed) {
                let (len, peer) = match socket.recv_from(&mut buf) {
                    Ok(received) => received,
                    Err(err)
                        if err.kind() == std::io::ErrorKind::WouldBlock
                            || err.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        continue;
                    }
                    Err(err) => {
                        warn!("{} intake recv error: {}", name, err);
                        continue;
                    }
                };

                stats.datagrams.fetch_add(1, Ordering::Relaxed);

                match decoder.parse(&buf[..len], peer.ip(), &stats) {
                    Ok(packets) => {
                        stats.records.fetch_add(packets.len() as u64, Ordering::Relaxed);
                        for packet in packets {
                            sink.consume(packet);
                        }
                    }
                    Err(err) => {
                        stats.record_error(peer.ip(), err.reason());
                        trace!("{} intake dropped frame from {}: {}", name, peer, err);
                    }
                }
            }

            info!("{} intake stopped", name);
        })
}

/// Replay a pcap file through the mirror decoder. Used for span/mirror
/// feeds delivered as capture files and for offline analysis.
pub fn spawn_mirror_replay(
    path: std::path::PathBuf,
    sink: Arc<dyn PacketSink>,
    stats: Arc<IntakeStats>,
    cancel: Arc<AtomicBool>,
    capture_payload: bool,
) -> std::io::Result<JoinHandle<()>> {
    use pcap_file::pcap::PcapReader;

    let file = std::fs::File::open(&path)?;

    std::thread::Builder::new()
        .name("intake-mirror".to_string())
        .spawn(move || {
            let mut reader = match PcapReader::new(file) {
                Ok(reader) => reader,
                Err(err) => {
                    warn!("mirror replay: bad pcap {}: {}", path.display(), err);
                    return;
                }
            };

            let local: IpAddr = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);

            while !cancel.load(Ordering::Relaxed) {
                let frame = match reader.next_packet() {
                    Some(Ok(frame)) => frame,
                    Some(Err(err)) => {
                        stats.record_error(local, "frame_parse");
                        trace!("mirror replay: bad frame: {}", err);
                        continue;
                    }
                    None => break,
                };

                stats.datagrams.fetch_add(1, Ordering::Relaxed);

                match mirror::decode_frame(&frame.data, monotonic_nanos(), capture_payload) {
                    Ok(packet) => {
                        stats.records.fetch_add(1, Ordering::Relaxed);
                        sink.consume(packet);
                    }
                    Err(err) => stats.record_error(local, err.reason()),
                }
            }

            info!("mirror replay finished: {}", path.display());
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_tally_by_source_and_reason() {
        let stats = IntakeStats::default();
        let a: IpAddr = "192.0.2.1".parse().unwrap();
        let b: IpAddr = "192.0.2.2".parse().unwrap();

        stats.record_error(a, "truncated");
        stats.record_error(a, "truncated");
        stats.record_error(a, "unknown_template");
        stats.record_error(b, "truncated");

        assert_eq!(stats.error_count(a, "truncated"), 2);
        assert_eq!(stats.error_count(a, "unknown_template"), 1);
        assert_eq!(stats.error_count(b, "truncated"), 1);
        assert_eq!(stats.error_count(b, "unknown_template"), 0);
        assert_eq!(stats.errors_snapshot().len(), 3);
    }

    #[test]
    fn test_monotonic_nanos_monotone() {
        let a = monotonic_nanos();
        let b = monotonic_nanos();
        assert!(b >= a);
    }

    #[test]
    fn test_decode_error_reasons_stable() {
        assert_eq!(DecodeError::Truncated("header").reason(), "truncated");
        assert_eq!(DecodeError::UnsupportedVersion(3).reason(), "unsupported_version");
        assert_eq!(
            DecodeError::UnknownTemplate { domain: 1, template_id: 260 }.reason(),
            "unknown_template"
        );
    }
}

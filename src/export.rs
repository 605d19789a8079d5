//! Traffic export records
//!
//! Renders normalised packets in the format selected by
//! `kafka_traffic_export_format`. The wire producer itself (Kafka client,
//! pipe shipper) is an external collaborator; protobuf framing is its job,
//! so only the JSON form is rendered here.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::warn;

use crate::config::ExportFormat;
use crate::core::SimplePacket;
use crate::telemetry::PacketSink;

/// One packet as a JSON object, NDJSON-friendly
pub fn packet_to_json(pkt: &SimplePacket) -> String {
    serde_json::to_string(pkt).unwrap_or_default()
}

/// Sink that writes one record per line to a writer (a pipe or spool file
/// tailed by the export producer)
pub struct TrafficExporter<W: Write + Send> {
    format: ExportFormat,
    writer: Mutex<W>,
    pub written: AtomicU64,
    pub failed: AtomicU64,
}

impl<W: Write + Send> TrafficExporter<W> {
    pub fn new(format: ExportFormat, writer: W) -> Self {
        Self {
            format,
            writer: Mutex::new(writer),
            written: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }
}

impl<W: Write + Send> PacketSink for TrafficExporter<W> {
    fn consume(&self, packet: SimplePacket) {
        let line = match self.format {
            ExportFormat::Json => packet_to_json(&packet),
            // Protobuf encoding happens in the producer; nothing to spool
            ExportFormat::Protobuf => return,
        };

        let mut writer = self.writer.lock();
        match writeln!(writer, "{}", line) {
            Ok(()) => {
                self.written.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                if self.failed.fetch_add(1, Ordering::Relaxed) == 0 {
                    warn!("traffic export write failed: {}", err);
                }
            }
        }
    }
}

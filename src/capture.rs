//! Per-attack packet capture
//!
//! Each active attack owns a bounded ring holding the last N frames seen
//! to or from the attacked host. The ingest side pushes and never blocks;
//! when the ring is full the oldest frame is displaced. On ban clear the
//! ring is flushed to `<attack_uuid>.pcap`.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_queue::ArrayQueue;
use pcap_file::pcap::{PcapPacket, PcapWriter};
use tracing::info;
use uuid::Uuid;

/// One captured frame
#[derive(Debug, Clone)]
pub struct CapturedPacket {
    pub data: Vec<u8>,
    pub ts_nanos: u64,
    /// Original frame length; larger than `data` when the source truncated
    pub orig_len: u32,
}

/// Producer side, held by the ingestion path
#[derive(Clone)]
pub struct CaptureHandle {
    ring: Arc<ArrayQueue<CapturedPacket>>,
    displaced: Arc<AtomicU64>,
}

impl CaptureHandle {
    /// Push one frame; displaces the oldest when full, never blocks
    pub fn push(&self, packet: CapturedPacket) {
        if self.ring.force_push(packet).is_some() {
            self.displaced.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Consumer side, owned by the attack record
pub struct AttackCapture {
    ring: Arc<ArrayQueue<CapturedPacket>>,
    displaced: Arc<AtomicU64>,
}

impl AttackCapture {
    pub fn open(capacity: usize) -> (AttackCapture, CaptureHandle) {
        let ring = Arc::new(ArrayQueue::new(capacity.max(1)));
        let displaced = Arc::new(AtomicU64::new(0));

        let capture = AttackCapture {
            ring: Arc::clone(&ring),
            displaced: Arc::clone(&displaced),
        };
        let handle = CaptureHandle { ring, displaced };
        (capture, handle)
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Frames overwritten because the ring was full
    pub fn displaced(&self) -> u64 {
        self.displaced.load(Ordering::Relaxed)
    }

    /// Drain the ring into `<uuid>.pcap` under `dir`
    pub fn flush_to_pcap(&self, dir: &Path, uuid: Uuid) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create capture directory {}", dir.display()))?;

        let path = dir.join(format!("{}.pcap", uuid));
        let file = File::create(&path)
            .with_context(|| format!("Failed to create capture file {}", path.display()))?;
        let mut writer = PcapWriter::new(file).context("Failed to write pcap header")?;

        let mut frames = 0usize;
        while let Some(packet) = self.ring.pop() {
            writer
                .write_packet(&PcapPacket::new(
                    Duration::from_nanos(packet.ts_nanos),
                    packet.orig_len,
                    &packet.data,
                ))
                .context("Failed to write pcap frame")?;
            frames += 1;
        }

        info!(
            "Flushed {} captured frames to {} ({} displaced)",
            frames,
            path.display(),
            self.displaced()
        );
        Ok(path)
    }
}

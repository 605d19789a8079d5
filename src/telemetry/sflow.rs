//! sFlow v5 decoder
//!
//! Parses the datagram header, iterates enterprise/format-tagged samples,
//! and extracts the embedded raw packet header from flow samples (plain
//! and expanded). Counter samples are parsed past and discarded. The
//! output record's `sample_ratio` is the agent-reported sampling rate.

use std::net::IpAddr;

use tracing::trace;

use crate::core::SimplePacket;

use super::cursor::Cursor;
use super::{mirror, monotonic_nanos, DatagramDecoder, DecodeError, IntakeStats};

const SFLOW_VERSION: u32 = 5;

// Sample formats (enterprise 0)
const FORMAT_FLOW_SAMPLE: u32 = 1;
const FORMAT_COUNTER_SAMPLE: u32 = 2;
const FORMAT_FLOW_SAMPLE_EXPANDED: u32 = 3;
const FORMAT_COUNTER_SAMPLE_EXPANDED: u32 = 4;

// Flow record formats (enterprise 0)
const FORMAT_RAW_PACKET_HEADER: u32 = 1;

// Header protocol in raw packet header records
const HEADER_PROTOCOL_ETHERNET: u32 = 1;

pub struct SflowDecoder {
    capture_payload: bool,
}

impl SflowDecoder {
    pub fn new(capture_payload: bool) -> Self {
        Self { capture_payload }
    }

    fn parse_flow_sample(
        &self,
        cursor: &mut Cursor<'_>,
        expanded: bool,
        source: IpAddr,
        stats: &IntakeStats,
        out: &mut Vec<SimplePacket>,
    ) -> Result<(), DecodeError> {
        cursor.read_u32("flow sample sequence")?;
        if expanded {
            cursor.read_u32("source id type")?;
            cursor.read_u32("source id index")?;
        } else {
            cursor.read_u32("source id")?;
        }

        let sampling_rate = cursor.read_u32("sampling rate")?;
        cursor.read_u32("sample pool")?;
        cursor.read_u32("drops")?;

        let (input_if, output_if) = if expanded {
            cursor.read_u32("input format")?;
            let input = cursor.read_u32("input value")?;
            cursor.read_u32("output format")?;
            let output = cursor.read_u32("output value")?;
            (input, output)
        } else {
            (cursor.read_u32("input interface")?, cursor.read_u32("output interface")?)
        };

        let record_count = cursor.read_u32("record count")?;

        for _ in 0..record_count {
            let record_type = cursor.read_u32("record type")?;
            let record_len = cursor.read_u32("record length")? as usize;
            let record = cursor.take(record_len, "record body")?;

            let enterprise = record_type >> 12;
            let format = record_type & 0xFFF;
            if enterprise != 0 || format != FORMAT_RAW_PACKET_HEADER {
                // Extended data records (switch, router, ...) are not needed
                continue;
            }

            let mut body = Cursor::new(record);
            let header_protocol = body.read_u32("header protocol")?;
            let frame_length = body.read_u32("frame length")?;
            body.read_u32("stripped")?;
            let header_length = body.read_u32("header length")? as usize;
            let header = body.take(header_length, "header bytes")?;

            if header_protocol != HEADER_PROTOCOL_ETHERNET {
                stats.record_error(source, "non_ip");
                continue;
            }

            match mirror::decode_frame_lax(
                header,
                frame_length as u64,
                sampling_rate.max(1) as u64,
                monotonic_nanos(),
                self.capture_payload,
            ) {
                Ok(mut pkt) => {
                    pkt.input_interface = input_if;
                    pkt.output_interface = output_if;
                    out.push(pkt);
                }
                Err(err) => {
                    // One bad embedded header must not drop its siblings
                    stats.record_error(source, err.reason());
                    trace!("sflow: bad embedded header from {}: {}", source, err);
                }
            }
        }

        Ok(())
    }
}

impl DatagramDecoder for SflowDecoder {
    fn name(&self) -> &'static str {
        "sflow"
    }

    fn parse(
        &mut self,
        data: &[u8],
        source: IpAddr,
        stats: &IntakeStats,
    ) -> Result<Vec<SimplePacket>, DecodeError> {
        let mut cursor = Cursor::new(data);

        let version = cursor.read_u32("version")?;
        if version != SFLOW_VERSION {
            return Err(DecodeError::UnsupportedVersion(version as u16));
        }

        let agent_family = cursor.read_u32("agent address family")?;
        match agent_family {
            1 => cursor.skip(4, "agent v4 address")?,
            2 => cursor.skip(16, "agent v6 address")?,
            _ => return Err(DecodeError::BadLength),
        }

        cursor.read_u32("sub agent id")?;
        cursor.read_u32("datagram sequence")?;
        cursor.read_u32("agent uptime")?;
        let sample_count = cursor.read_u32("sample count")?;

        let mut out = Vec::new();

        for _ in 0..sample_count {
            let sample_type = cursor.read_u32("sample type")?;
            let sample_len = cursor.read_u32("sample length")? as usize;
            let sample = cursor.take(sample_len, "sample body")?;

            let enterprise = sample_type >> 12;
            let format = sample_type & 0xFFF;
            if enterprise != 0 {
                continue;
            }

            let mut body = Cursor::new(sample);
            match format {
                FORMAT_FLOW_SAMPLE => {
                    self.parse_flow_sample(&mut body, false, source, stats, &mut out)?
                }
                FORMAT_FLOW_SAMPLE_EXPANDED => {
                    self.parse_flow_sample(&mut body, true, source, stats, &mut out)?
                }
                FORMAT_COUNTER_SAMPLE | FORMAT_COUNTER_SAMPLE_EXPANDED => {
                    // Interface counters are not part of per-host accounting
                }
                _ => {}
            }
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::mirror::tests::build_udp_frame;

    fn push_u32(buf: &mut Vec<u8>, value: u32) {
        buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Assemble an sFlow v5 datagram with one flow sample carrying one raw
    /// header record.
    fn build_datagram(sampling_rate: u32, frame: &[u8], frame_length: u32) -> Vec<u8> {
        let mut record = Vec::new();
        push_u32(&mut record, HEADER_PROTOCOL_ETHERNET);
        push_u32(&mut record, frame_length);
        push_u32(&mut record, 4); // stripped
        push_u32(&mut record, frame.len() as u32);
        record.extend_from_slice(frame);

        let mut sample = Vec::new();
        push_u32(&mut sample, 7); // sequence
        push_u32(&mut sample, 1); // source id
        push_u32(&mut sample, sampling_rate);
        push_u32(&mut sample, 10_000); // sample pool
        push_u32(&mut sample, 0); // drops
        push_u32(&mut sample, 5); // input if
        push_u32(&mut sample, 6); // output if
        push_u32(&mut sample, 1); // record count
        push_u32(&mut sample, FORMAT_RAW_PACKET_HEADER);
        push_u32(&mut sample, record.len() as u32);
        sample.extend_from_slice(&record);

        let mut datagram = Vec::new();
        push_u32(&mut datagram, SFLOW_VERSION);
        push_u32(&mut datagram, 1); // agent family v4
        datagram.extend_from_slice(&[192, 0, 2, 99]); // agent address
        push_u32(&mut datagram, 0); // sub agent
        push_u32(&mut datagram, 42); // sequence
        push_u32(&mut datagram, 1000); // uptime
        push_u32(&mut datagram, 1); // sample count
        push_u32(&mut datagram, FORMAT_FLOW_SAMPLE);
        push_u32(&mut datagram, sample.len() as u32);
        datagram.extend_from_slice(&sample);

        datagram
    }

    fn exporter() -> IpAddr {
        "192.0.2.99".parse().unwrap()
    }

    #[test]
    fn test_parse_flow_sample() {
        let frame = build_udp_frame([10, 0, 0, 1], [192, 0, 2, 7], 53, 40_000, b"test");
        let datagram = build_datagram(1024, &frame, frame.len() as u32);

        let stats = IntakeStats::default();
        let mut decoder = SflowDecoder::new(false);
        let packets = decoder.parse(&datagram, exporter(), &stats).unwrap();

        assert_eq!(packets.len(), 1);
        let pkt = &packets[0];
        assert_eq!(pkt.src_ip.to_string(), "10.0.0.1");
        assert_eq!(pkt.dst_ip.to_string(), "192.0.2.7");
        assert_eq!(pkt.sample_ratio, 1024);
        assert_eq!(pkt.length, frame.len() as u64);
        assert_eq!(pkt.input_interface, 5);
        assert_eq!(pkt.output_interface, 6);
    }

    #[test]
    fn test_wrong_version_rejected() {
        let frame = build_udp_frame([10, 0, 0, 1], [192, 0, 2, 7], 53, 40_000, b"");
        let mut datagram = build_datagram(1, &frame, frame.len() as u32);
        datagram[3] = 4; // version 4

        let stats = IntakeStats::default();
        let mut decoder = SflowDecoder::new(false);
        assert!(matches!(
            decoder.parse(&datagram, exporter(), &stats),
            Err(DecodeError::UnsupportedVersion(4))
        ));
    }

    #[test]
    fn test_truncated_datagram_rejected() {
        let frame = build_udp_frame([10, 0, 0, 1], [192, 0, 2, 7], 53, 40_000, b"");
        let datagram = build_datagram(1, &frame, frame.len() as u32);

        let stats = IntakeStats::default();
        let mut decoder = SflowDecoder::new(false);
        assert!(decoder.parse(&datagram[..20], exporter(), &stats).is_err());
    }

    #[test]
    fn test_counter_sample_discarded() {
        let mut datagram = Vec::new();
        push_u32(&mut datagram, SFLOW_VERSION);
        push_u32(&mut datagram, 1);
        datagram.extend_from_slice(&[192, 0, 2, 99]);
        push_u32(&mut datagram, 0);
        push_u32(&mut datagram, 42);
        push_u32(&mut datagram, 1000);
        push_u32(&mut datagram, 1);
        push_u32(&mut datagram, FORMAT_COUNTER_SAMPLE);
        push_u32(&mut datagram, 8);
        datagram.extend_from_slice(&[0u8; 8]);

        let stats = IntakeStats::default();
        let mut decoder = SflowDecoder::new(false);
        let packets = decoder.parse(&datagram, exporter(), &stats).unwrap();
        assert!(packets.is_empty());
    }

    #[test]
    fn test_truncated_embedded_header_tolerated() {
        let frame = build_udp_frame([10, 0, 0, 1], [192, 0, 2, 7], 53, 40_000, &[0u8; 800]);
        // Agent keeps only the first 128 bytes of the frame
        let datagram = build_datagram(512, &frame[..128], frame.len() as u32);

        let stats = IntakeStats::default();
        let mut decoder = SflowDecoder::new(false);
        let packets = decoder.parse(&datagram, exporter(), &stats).unwrap();

        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].length, frame.len() as u64);
        assert_eq!(packets[0].sample_ratio, 512);
    }
}

//! NetFlow v5/v9 and IPFIX decoder
//!
//! One listener serves all three: the datagram's version field dispatches.
//! v5 is a fixed layout; v9 and IPFIX are template-driven with a cache
//! keyed by `(exporter, observation domain, template id)`. Data records
//! are discarded (and tallied) until their template is known; a template
//! arriving with an existing id replaces the prior one immediately. IPFIX
//! variable-length fields are honoured.
//!
//! The cache belongs to the owning intake worker; it is never shared.

use std::collections::HashMap;
use std::net::IpAddr;

use tracing::{debug, trace};

use crate::core::{IpProtocol, SimplePacket, TcpFlags, TelemetrySource};

use super::cursor::Cursor;
use super::{monotonic_nanos, DatagramDecoder, DecodeError, IntakeStats};

const NETFLOW_V5_HEADER_LEN: usize = 24;
const NETFLOW_V5_RECORD_LEN: usize = 48;

// Field types shared by NetFlow v9 and IPFIX
const FIELD_IN_BYTES: u16 = 1;
const FIELD_IN_PKTS: u16 = 2;
const FIELD_PROTOCOL: u16 = 4;
const FIELD_TCP_FLAGS: u16 = 6;
const FIELD_L4_SRC_PORT: u16 = 7;
const FIELD_IPV4_SRC_ADDR: u16 = 8;
const FIELD_INPUT_SNMP: u16 = 10;
const FIELD_L4_DST_PORT: u16 = 11;
const FIELD_IPV4_DST_ADDR: u16 = 12;
const FIELD_OUTPUT_SNMP: u16 = 14;
const FIELD_IPV6_SRC_ADDR: u16 = 27;
const FIELD_IPV6_DST_ADDR: u16 = 28;
const FIELD_SAMPLING_INTERVAL: u16 = 34;

/// Marker for IPFIX variable-length fields
const VARIABLE_LENGTH: u16 = 0xFFFF;

#[derive(Debug, Clone, Copy)]
struct TemplateField {
    field_type: u16,
    length: u16,
}

#[derive(Debug, Clone)]
struct Template {
    fields: Vec<TemplateField>,
    /// Total record length when no field is variable-length
    fixed_length: Option<usize>,
}

impl Template {
    fn new(fields: Vec<TemplateField>) -> Self {
        let fixed_length = if fields.iter().any(|f| f.length == VARIABLE_LENGTH) {
            None
        } else {
            Some(fields.iter().map(|f| f.length as usize).sum())
        };
        Self { fields, fixed_length }
    }
}

type TemplateKey = (IpAddr, u32, u16);

pub struct NetflowDecoder {
    /// Configured sampling divisor for v5 (whose header sampling field is
    /// informational only) and fallback for template-driven records
    sampling_ratio: u64,
    templates: HashMap<TemplateKey, Template>,
}

impl NetflowDecoder {
    pub fn new(sampling_ratio: u64) -> Self {
        Self {
            sampling_ratio: sampling_ratio.max(1),
            templates: HashMap::new(),
        }
    }

    pub fn template_count(&self) -> usize {
        self.templates.len()
    }

    // ---- NetFlow v5 ----

    fn parse_v5(&self, data: &[u8], _source: IpAddr) -> Result<Vec<SimplePacket>, DecodeError> {
        if data.len() < NETFLOW_V5_HEADER_LEN {
            return Err(DecodeError::Truncated("v5 header"));
        }

        let mut cursor = Cursor::new(data);
        cursor.read_u16("version")?;
        let count = cursor.read_u16("record count")? as usize;
        cursor.skip(NETFLOW_V5_HEADER_LEN - 4, "v5 header")?;

        if count * NETFLOW_V5_RECORD_LEN > cursor.remaining() {
            return Err(DecodeError::BadLength);
        }

        let mut out = Vec::with_capacity(count);
        let ts_nanos = monotonic_nanos();

        for _ in 0..count {
            let record = cursor.take(NETFLOW_V5_RECORD_LEN, "v5 record")?;
            let mut r = Cursor::new(record);

            let src: [u8; 4] = r.take(4, "srcaddr")?.try_into().unwrap();
            let dst: [u8; 4] = r.take(4, "dstaddr")?.try_into().unwrap();
            r.skip(4, "nexthop")?;
            let input_interface = r.read_u16("input")? as u32;
            let output_interface = r.read_u16("output")? as u32;
            let packets = r.read_u32("dPkts")? as u64;
            let octets = r.read_u32("dOctets")? as u64;
            r.skip(8, "first/last")?;
            let src_port = r.read_u16("srcport")?;
            let dst_port = r.read_u16("dstport")?;
            r.skip(1, "pad")?;
            let tcp_flags = r.read_u8("tcp flags")?;
            let protocol = r.read_u8("protocol")?;

            let mut pkt = SimplePacket::new(
                IpAddr::from(src),
                IpAddr::from(dst),
                IpProtocol::from(protocol),
                TelemetrySource::NetflowV5,
            );
            pkt.src_port = src_port;
            pkt.dst_port = dst_port;
            pkt.flags = TcpFlags::from_u8(tcp_flags);
            pkt.input_interface = input_interface;
            pkt.output_interface = output_interface;
            pkt.packets = packets.max(1);
            pkt.length = octets;
            pkt.sample_ratio = self.sampling_ratio;
            pkt.ts_nanos = ts_nanos;
            out.push(pkt);
        }

        Ok(out)
    }

    // ---- NetFlow v9 / IPFIX ----

    fn parse_template_set(
        &mut self,
        set: &[u8],
        source: IpAddr,
        domain: u32,
        enterprise_aware: bool,
    ) -> Result<(), DecodeError> {
        let mut cursor = Cursor::new(set);

        // A template set may carry several templates back to back
        while cursor.remaining() >= 4 {
            let template_id = cursor.read_u16("template id")?;
            let field_count = cursor.read_u16("field count")? as usize;

            let mut fields = Vec::with_capacity(field_count);
            for _ in 0..field_count {
                let raw_type = cursor.read_u16("field type")?;
                let length = cursor.read_u16("field length")?;

                // IPFIX enterprise-specific fields carry an extra 32-bit
                // enterprise number
                let field_type = if enterprise_aware && raw_type & 0x8000 != 0 {
                    cursor.read_u32("enterprise number")?;
                    raw_type & 0x7FFF
                } else {
                    raw_type
                };

                fields.push(TemplateField { field_type, length });
            }

            let replaced = self
                .templates
                .insert((source, domain, template_id), Template::new(fields))
                .is_some();
            debug!(
                "{} template {} from {} domain {}",
                if replaced { "Replaced" } else { "Learned" },
                template_id,
                source,
                domain
            );
        }

        Ok(())
    }

    fn parse_data_set(
        &self,
        set: &[u8],
        source: IpAddr,
        domain: u32,
        template_id: u16,
        source_tag: TelemetrySource,
        stats: &IntakeStats,
        out: &mut Vec<SimplePacket>,
    ) {
        let Some(template) = self.templates.get(&(source, domain, template_id)) else {
            stats.record_error(
                source,
                DecodeError::UnknownTemplate { domain, template_id }.reason(),
            );
            trace!(
                "data set for unknown template {} from {} domain {}",
                template_id,
                source,
                domain
            );
            return;
        };

        if template.fixed_length == Some(0) {
            // A degenerate template would never advance the cursor
            return;
        }

        let ts_nanos = monotonic_nanos();
        let mut cursor = Cursor::new(set);

        loop {
            match template.fixed_length {
                Some(len) if cursor.remaining() < len => break,
                // Variable-length records: padding is at most 3 bytes
                None if cursor.remaining() < 4 => break,
                _ => {}
            }

            match self.parse_data_record(&mut cursor, template, source_tag, ts_nanos) {
                Ok(Some(pkt)) => out.push(pkt),
                Ok(None) => {}
                Err(_) => {
                    // Truncated tail (or padding misread as a record)
                    break;
                }
            }
        }
    }

    fn parse_data_record(
        &self,
        cursor: &mut Cursor<'_>,
        template: &Template,
        source_tag: TelemetrySource,
        ts_nanos: u64,
    ) -> Result<Option<SimplePacket>, DecodeError> {
        let mut src_ip: Option<IpAddr> = None;
        let mut dst_ip: Option<IpAddr> = None;
        let mut src_port = 0u16;
        let mut dst_port = 0u16;
        let mut protocol = 0u8;
        let mut tcp_flags = 0u8;
        let mut packets = 1u64;
        let mut bytes = 0u64;
        let mut input_interface = 0u32;
        let mut output_interface = 0u32;
        let mut sampling = 0u64;

        for field in &template.fields {
            let length = if field.length == VARIABLE_LENGTH {
                // IPFIX variable length: one length byte, 255 escapes to
                // a two-byte length
                let first = cursor.read_u8("var length")? as usize;
                if first == 255 {
                    cursor.read_u16("var length ext")? as usize
                } else {
                    first
                }
            } else {
                field.length as usize
            };

            let value = cursor.take(length, "field value")?;

            match field.field_type {
                FIELD_IPV4_SRC_ADDR if length == 4 => {
                    src_ip = Some(IpAddr::from(<[u8; 4]>::try_from(value).unwrap()));
                }
                FIELD_IPV4_DST_ADDR if length == 4 => {
                    dst_ip = Some(IpAddr::from(<[u8; 4]>::try_from(value).unwrap()));
                }
                FIELD_IPV6_SRC_ADDR if length == 16 => {
                    src_ip = Some(IpAddr::from(<[u8; 16]>::try_from(value).unwrap()));
                }
                FIELD_IPV6_DST_ADDR if length == 16 => {
                    dst_ip = Some(IpAddr::from(<[u8; 16]>::try_from(value).unwrap()));
                }
                FIELD_L4_SRC_PORT => src_port = read_uint(value) as u16,
                FIELD_L4_DST_PORT => dst_port = read_uint(value) as u16,
                FIELD_PROTOCOL => protocol = read_uint(value) as u8,
                FIELD_TCP_FLAGS => tcp_flags = read_uint(value) as u8,
                FIELD_IN_BYTES => bytes = read_uint(value),
                FIELD_IN_PKTS => packets = read_uint(value),
                FIELD_INPUT_SNMP => input_interface = read_uint(value) as u32,
                FIELD_OUTPUT_SNMP => output_interface = read_uint(value) as u32,
                FIELD_SAMPLING_INTERVAL => sampling = read_uint(value),
                _ => {}
            }
        }

        let (Some(src_ip), Some(dst_ip)) = (src_ip, dst_ip) else {
            // Option records and templates without addresses
            return Ok(None);
        };

        let mut pkt = SimplePacket::new(src_ip, dst_ip, IpProtocol::from(protocol), source_tag);
        pkt.src_port = src_port;
        pkt.dst_port = dst_port;
        pkt.flags = TcpFlags::from_u8(tcp_flags);
        pkt.packets = packets.max(1);
        pkt.length = bytes;
        pkt.input_interface = input_interface;
        pkt.output_interface = output_interface;
        pkt.sample_ratio = if sampling > 0 { sampling } else { 1 };
        pkt.ts_nanos = ts_nanos;
        Ok(Some(pkt))
    }

    fn parse_v9(
        &mut self,
        data: &[u8],
        source: IpAddr,
        stats: &IntakeStats,
    ) -> Result<Vec<SimplePacket>, DecodeError> {
        let mut cursor = Cursor::new(data);
        cursor.read_u16("version")?;
        cursor.read_u16("count")?;
        cursor.read_u32("uptime")?;
        cursor.read_u32("unix secs")?;
        cursor.read_u32("sequence")?;
        let domain = cursor.read_u32("source id")?;

        let mut out = Vec::new();

        while cursor.remaining() >= 4 {
            let set_id = cursor.read_u16("flowset id")?;
            let set_len = cursor.read_u16("flowset length")? as usize;
            if set_len < 4 {
                return Err(DecodeError::BadLength);
            }
            let body = cursor.take(set_len - 4, "flowset body")?;

            match set_id {
                0 => self.parse_template_set(body, source, domain, false)?,
                1 => {
                    // Options templates describe exporter metadata streams
                }
                2..=255 => {}
                template_id => self.parse_data_set(
                    body,
                    source,
                    domain,
                    template_id,
                    TelemetrySource::NetflowV9,
                    stats,
                    &mut out,
                ),
            }
        }

        Ok(out)
    }

    fn parse_ipfix(
        &mut self,
        data: &[u8],
        source: IpAddr,
        stats: &IntakeStats,
    ) -> Result<Vec<SimplePacket>, DecodeError> {
        let mut cursor = Cursor::new(data);
        cursor.read_u16("version")?;
        let total_length = cursor.read_u16("length")? as usize;
        if total_length > data.len() {
            return Err(DecodeError::BadLength);
        }
        cursor.read_u32("export time")?;
        cursor.read_u32("sequence")?;
        let domain = cursor.read_u32("observation domain")?;

        let mut out = Vec::new();

        while cursor.remaining() >= 4 {
            let set_id = cursor.read_u16("set id")?;
            let set_len = cursor.read_u16("set length")? as usize;
            if set_len < 4 {
                return Err(DecodeError::BadLength);
            }
            let body = cursor.take(set_len - 4, "set body")?;

            match set_id {
                2 => self.parse_template_set(body, source, domain, true)?,
                3 => {
                    // Options templates
                }
                4..=255 => {}
                template_id => self.parse_data_set(
                    body,
                    source,
                    domain,
                    template_id,
                    TelemetrySource::Ipfix,
                    stats,
                    &mut out,
                ),
            }
        }

        Ok(out)
    }
}

/// Big-endian unsigned integer of 1..=8 bytes
fn read_uint(value: &[u8]) -> u64 {
    let mut out = 0u64;
    for &byte in value.iter().take(8) {
        out = (out << 8) | byte as u64;
    }
    out
}

impl DatagramDecoder for NetflowDecoder {
    fn name(&self) -> &'static str {
        "netflow"
    }

    fn parse(
        &mut self,
        data: &[u8],
        source: IpAddr,
        stats: &IntakeStats,
    ) -> Result<Vec<SimplePacket>, DecodeError> {
        if data.len() < 2 {
            return Err(DecodeError::Truncated("version"));
        }
        let version = u16::from_be_bytes([data[0], data[1]]);

        match version {
            5 => self.parse_v5(data, source),
            9 => self.parse_v9(data, source, stats),
            10 => self.parse_ipfix(data, source, stats),
            other => Err(DecodeError::UnsupportedVersion(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exporter() -> IpAddr {
        "192.0.2.50".parse().unwrap()
    }

    fn push_u16(buf: &mut Vec<u8>, value: u16) {
        buf.extend_from_slice(&value.to_be_bytes());
    }

    fn push_u32(buf: &mut Vec<u8>, value: u32) {
        buf.extend_from_slice(&value.to_be_bytes());
    }

    fn build_v5_datagram(records: &[([u8; 4], [u8; 4], u16, u16, u8, u32, u32)]) -> Vec<u8> {
        let mut out = Vec::new();
        push_u16(&mut out, 5);
        push_u16(&mut out, records.len() as u16);
        push_u32(&mut out, 100_000); // uptime
        push_u32(&mut out, 1_700_000_000); // unix secs
        push_u32(&mut out, 0); // unix nsecs
        push_u32(&mut out, 1); // flow sequence
        out.push(0); // engine type
        out.push(0); // engine id
        push_u16(&mut out, 0); // sampling (informational)

        for (src, dst, sport, dport, proto, pkts, octets) in records {
            out.extend_from_slice(src);
            out.extend_from_slice(dst);
            out.extend_from_slice(&[0; 4]); // nexthop
            push_u16(&mut out, 3); // input
            push_u16(&mut out, 4); // output
            push_u32(&mut out, *pkts);
            push_u32(&mut out, *octets);
            push_u32(&mut out, 0); // first
            push_u32(&mut out, 0); // last
            push_u16(&mut out, *sport);
            push_u16(&mut out, *dport);
            out.push(0); // pad
            out.push(0x02); // tcp flags: SYN
            out.push(*proto);
            out.push(0); // tos
            push_u16(&mut out, 0); // src as
            push_u16(&mut out, 0); // dst as
            out.push(24); // src mask
            out.push(24); // dst mask
            push_u16(&mut out, 0); // pad2
        }

        out
    }

    #[test]
    fn test_v5_single_record() {
        let datagram = build_v5_datagram(&[([10, 0, 0, 1], [192, 0, 2, 9], 443, 50_000, 6, 15, 9_000)]);

        let stats = IntakeStats::default();
        let mut decoder = NetflowDecoder::new(100);
        let packets = decoder.parse(&datagram, exporter(), &stats).unwrap();

        assert_eq!(packets.len(), 1);
        let pkt = &packets[0];
        assert_eq!(pkt.src_ip.to_string(), "10.0.0.1");
        assert_eq!(pkt.dst_ip.to_string(), "192.0.2.9");
        assert_eq!(pkt.src_port, 443);
        assert_eq!(pkt.dst_port, 50_000);
        assert_eq!(pkt.protocol, IpProtocol::Tcp);
        assert_eq!(pkt.packets, 15);
        assert_eq!(pkt.length, 9_000);
        // Configured ratio, not the header field
        assert_eq!(pkt.sample_ratio, 100);
        assert_eq!(pkt.input_interface, 3);
        assert!(pkt.flags.syn);
    }

    #[test]
    fn test_v5_record_count_mismatch() {
        let mut datagram = build_v5_datagram(&[([10, 0, 0, 1], [192, 0, 2, 9], 443, 50_000, 6, 1, 64)]);
        datagram[3] = 5; // claim 5 records, carry 1

        let stats = IntakeStats::default();
        let mut decoder = NetflowDecoder::new(1);
        assert!(decoder.parse(&datagram, exporter(), &stats).is_err());
    }

    /// v9 template for (srcaddr, dstaddr, srcport, dstport, proto, bytes, pkts)
    fn build_v9_template(template_id: u16) -> Vec<u8> {
        let mut body = Vec::new();
        push_u16(&mut body, template_id);
        push_u16(&mut body, 7);
        for (field_type, length) in [
            (FIELD_IPV4_SRC_ADDR, 4u16),
            (FIELD_IPV4_DST_ADDR, 4),
            (FIELD_L4_SRC_PORT, 2),
            (FIELD_L4_DST_PORT, 2),
            (FIELD_PROTOCOL, 1),
            (FIELD_IN_BYTES, 4),
            (FIELD_IN_PKTS, 4),
        ] {
            push_u16(&mut body, field_type);
            push_u16(&mut body, length);
        }
        body
    }

    fn build_v9_record(src: [u8; 4], dst: [u8; 4], bytes: u32, pkts: u32) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&src);
        body.extend_from_slice(&dst);
        push_u16(&mut body, 1234);
        push_u16(&mut body, 80);
        body.push(17);
        push_u32(&mut body, bytes);
        push_u32(&mut body, pkts);
        body
    }

    fn build_v9_datagram(sets: &[(u16, Vec<u8>)]) -> Vec<u8> {
        let mut out = Vec::new();
        push_u16(&mut out, 9);
        push_u16(&mut out, sets.len() as u16);
        push_u32(&mut out, 100_000);
        push_u32(&mut out, 1_700_000_000);
        push_u32(&mut out, 7);
        push_u32(&mut out, 42); // source id / domain

        for (set_id, body) in sets {
            push_u16(&mut out, *set_id);
            push_u16(&mut out, (body.len() + 4) as u16);
            out.extend_from_slice(body);
        }

        out
    }

    #[test]
    fn test_v9_data_before_template_dropped() {
        let stats = IntakeStats::default();
        let mut decoder = NetflowDecoder::new(1);

        let data_only = build_v9_datagram(&[(260, build_v9_record([10, 0, 0, 1], [192, 0, 2, 9], 512, 4))]);
        let packets = decoder.parse(&data_only, exporter(), &stats).unwrap();
        assert!(packets.is_empty());
        assert_eq!(stats.error_count(exporter(), "unknown_template"), 1);
    }

    #[test]
    fn test_v9_template_then_data() {
        let stats = IntakeStats::default();
        let mut decoder = NetflowDecoder::new(1);

        let template = build_v9_datagram(&[(0, build_v9_template(260))]);
        assert!(decoder.parse(&template, exporter(), &stats).unwrap().is_empty());
        assert_eq!(decoder.template_count(), 1);

        let mut record_set = build_v9_record([10, 0, 0, 1], [192, 0, 2, 9], 512, 4);
        record_set.extend_from_slice(&build_v9_record([10, 0, 0, 2], [192, 0, 2, 9], 700, 2));
        let data = build_v9_datagram(&[(260, record_set)]);

        let packets = decoder.parse(&data, exporter(), &stats).unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].src_ip.to_string(), "10.0.0.1");
        assert_eq!(packets[0].length, 512);
        assert_eq!(packets[0].packets, 4);
        assert_eq!(packets[0].protocol, IpProtocol::Udp);
        assert_eq!(packets[1].src_ip.to_string(), "10.0.0.2");
        assert_eq!(packets[1].source, TelemetrySource::NetflowV9);
    }

    #[test]
    fn test_v9_template_and_data_in_one_datagram() {
        let stats = IntakeStats::default();
        let mut decoder = NetflowDecoder::new(1);

        let datagram = build_v9_datagram(&[
            (0, build_v9_template(260)),
            (260, build_v9_record([10, 0, 0, 1], [192, 0, 2, 9], 512, 4)),
        ]);

        let packets = decoder.parse(&datagram, exporter(), &stats).unwrap();
        assert_eq!(packets.len(), 1);
    }

    #[test]
    fn test_v9_template_replacement() {
        let stats = IntakeStats::default();
        let mut decoder = NetflowDecoder::new(1);

        decoder
            .parse(&build_v9_datagram(&[(0, build_v9_template(260))]), exporter(), &stats)
            .unwrap();

        // Replacement template: only addresses
        let mut replacement = Vec::new();
        push_u16(&mut replacement, 260);
        push_u16(&mut replacement, 2);
        push_u16(&mut replacement, FIELD_IPV4_SRC_ADDR);
        push_u16(&mut replacement, 4);
        push_u16(&mut replacement, FIELD_IPV4_DST_ADDR);
        push_u16(&mut replacement, 4);
        decoder
            .parse(&build_v9_datagram(&[(0, replacement)]), exporter(), &stats)
            .unwrap();
        assert_eq!(decoder.template_count(), 1);

        // An 8-byte record now parses with the new shape
        let mut record = Vec::new();
        record.extend_from_slice(&[10, 0, 0, 7]);
        record.extend_from_slice(&[192, 0, 2, 9]);
        let packets = decoder
            .parse(&build_v9_datagram(&[(260, record)]), exporter(), &stats)
            .unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].src_ip.to_string(), "10.0.0.7");
        assert_eq!(packets[0].packets, 1);
    }

    #[test]
    fn test_template_cache_keyed_by_exporter() {
        let stats = IntakeStats::default();
        let mut decoder = NetflowDecoder::new(1);

        decoder
            .parse(&build_v9_datagram(&[(0, build_v9_template(260))]), exporter(), &stats)
            .unwrap();

        // Same template id from a different exporter is unknown
        let other: IpAddr = "192.0.2.51".parse().unwrap();
        let data = build_v9_datagram(&[(260, build_v9_record([10, 0, 0, 1], [192, 0, 2, 9], 512, 4))]);
        let packets = decoder.parse(&data, other, &stats).unwrap();
        assert!(packets.is_empty());
        assert_eq!(stats.error_count(other, "unknown_template"), 1);
    }

    fn build_ipfix_datagram(sets: &[(u16, Vec<u8>)]) -> Vec<u8> {
        let mut body = Vec::new();
        for (set_id, set) in sets {
            push_u16(&mut body, *set_id);
            push_u16(&mut body, (set.len() + 4) as u16);
            body.extend_from_slice(set);
        }

        let mut out = Vec::new();
        push_u16(&mut out, 10);
        push_u16(&mut out, (body.len() + 16) as u16);
        push_u32(&mut out, 1_700_000_000);
        push_u32(&mut out, 7);
        push_u32(&mut out, 42);
        out.extend_from_slice(&body);
        out
    }

    #[test]
    fn test_ipfix_variable_length_field() {
        let stats = IntakeStats::default();
        let mut decoder = NetflowDecoder::new(1);

        // Template: srcaddr, dstaddr, a variable-length vendor field, bytes
        let mut template = Vec::new();
        push_u16(&mut template, 300);
        push_u16(&mut template, 4);
        push_u16(&mut template, FIELD_IPV4_SRC_ADDR);
        push_u16(&mut template, 4);
        push_u16(&mut template, FIELD_IPV4_DST_ADDR);
        push_u16(&mut template, 4);
        push_u16(&mut template, 371); // some string field
        push_u16(&mut template, VARIABLE_LENGTH);
        push_u16(&mut template, FIELD_IN_BYTES);
        push_u16(&mut template, 4);

        decoder
            .parse(&build_ipfix_datagram(&[(2, template)]), exporter(), &stats)
            .unwrap();

        let mut record = Vec::new();
        record.extend_from_slice(&[10, 0, 0, 1]);
        record.extend_from_slice(&[192, 0, 2, 9]);
        record.push(5); // var-length: 5 bytes follow
        record.extend_from_slice(b"hello");
        push_u32(&mut record, 4096);

        let packets = decoder
            .parse(&build_ipfix_datagram(&[(300, record)]), exporter(), &stats)
            .unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].length, 4096);
        assert_eq!(packets[0].source, TelemetrySource::Ipfix);
    }

    #[test]
    fn test_ipfix_enterprise_field_skipped() {
        let stats = IntakeStats::default();
        let mut decoder = NetflowDecoder::new(1);

        let mut template = Vec::new();
        push_u16(&mut template, 301);
        push_u16(&mut template, 3);
        push_u16(&mut template, FIELD_IPV4_SRC_ADDR);
        push_u16(&mut template, 4);
        // Enterprise-specific field: type with MSB set + enterprise number
        push_u16(&mut template, 0x8001);
        push_u16(&mut template, 2);
        push_u32(&mut template, 29_305);
        push_u16(&mut template, FIELD_IPV4_DST_ADDR);
        push_u16(&mut template, 4);

        decoder
            .parse(&build_ipfix_datagram(&[(2, template)]), exporter(), &stats)
            .unwrap();

        let mut record = Vec::new();
        record.extend_from_slice(&[10, 0, 0, 1]);
        push_u16(&mut record, 0xBEEF);
        record.extend_from_slice(&[192, 0, 2, 9]);

        let packets = decoder
            .parse(&build_ipfix_datagram(&[(301, record)]), exporter(), &stats)
            .unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].dst_ip.to_string(), "192.0.2.9");
    }

    #[test]
    fn test_unsupported_version() {
        let stats = IntakeStats::default();
        let mut decoder = NetflowDecoder::new(1);
        let datagram = [0u8, 8, 0, 0];
        assert!(matches!(
            decoder.parse(&datagram, exporter(), &stats),
            Err(DecodeError::UnsupportedVersion(8))
        ));
    }

    #[test]
    fn test_read_uint_sizes() {
        assert_eq!(read_uint(&[0x0A]), 10);
        assert_eq!(read_uint(&[0x01, 0x00]), 256);
        assert_eq!(read_uint(&[0, 0, 0x10, 0]), 4096);
        assert_eq!(read_uint(&[0, 0, 0, 0, 0, 0, 0x10, 0]), 4096);
    }
}

//! Raw frame decoding
//!
//! Turns a link-layer frame into one [`SimplePacket`]. Used directly for
//! mirror/span captures (full frames, ratio 1) and by the sFlow decoder
//! for the truncated header slices embedded in flow samples.

use etherparse::{InternetSlice, LaxNetSlice, LaxSlicedPacket, SlicedPacket, TransportSlice};

use crate::core::{IpProtocol, SimplePacket, TcpFlags, TelemetrySource, MAX_PAYLOAD_CAPTURE};

use super::DecodeError;

/// Decode a complete mirrored frame
pub fn decode_frame(raw: &[u8], ts_nanos: u64, capture_payload: bool) -> Result<SimplePacket, DecodeError> {
    let sliced =
        SlicedPacket::from_ethernet(raw).map_err(|e| DecodeError::FrameParse(e.to_string()))?;

    let (src_ip, dst_ip, ip_protocol, fragmented) = match &sliced.net {
        Some(InternetSlice::Ipv4(ipv4)) => {
            let header = ipv4.header();
            (
                header.source_addr().into(),
                header.destination_addr().into(),
                header.protocol().0,
                header.more_fragments() || header.fragments_offset().value() > 0,
            )
        }
        Some(InternetSlice::Ipv6(ipv6)) => {
            let header = ipv6.header();
            (
                header.source_addr().into(),
                header.destination_addr().into(),
                header.next_header().0,
                false,
            )
        }
        _ => return Err(DecodeError::NonIp),
    };

    let mut pkt = SimplePacket::new(src_ip, dst_ip, IpProtocol::from(ip_protocol), TelemetrySource::Mirror);
    pkt.ts_nanos = ts_nanos;
    pkt.length = raw.len() as u64;
    pkt.fragmented = fragmented;
    apply_transport(&mut pkt, &sliced.transport);

    if capture_payload {
        pkt.payload = Some(raw[..raw.len().min(MAX_PAYLOAD_CAPTURE)].to_vec());
    }

    Ok(pkt)
}

/// Decode a truncated frame slice, as carried in sFlow raw-header records.
///
/// The lax slicer tolerates bodies cut off mid-payload; `wire_len` is the
/// original frame length reported by the agent, and `sample_ratio` the
/// agent's sampling rate.
pub fn decode_frame_lax(
    raw: &[u8],
    wire_len: u64,
    sample_ratio: u64,
    ts_nanos: u64,
    capture_payload: bool,
) -> Result<SimplePacket, DecodeError> {
    let sliced =
        LaxSlicedPacket::from_ethernet(raw).map_err(|e| DecodeError::FrameParse(e.to_string()))?;

    let (src_ip, dst_ip, ip_protocol, fragmented) = match &sliced.net {
        Some(LaxNetSlice::Ipv4(ipv4)) => {
            let header = ipv4.header();
            (
                header.source_addr().into(),
                header.destination_addr().into(),
                header.protocol().0,
                header.more_fragments() || header.fragments_offset().value() > 0,
            )
        }
        Some(LaxNetSlice::Ipv6(ipv6)) => {
            let header = ipv6.header();
            (
                header.source_addr().into(),
                header.destination_addr().into(),
                header.next_header().0,
                false,
            )
        }
        _ => return Err(DecodeError::NonIp),
    };

    let mut pkt = SimplePacket::new(src_ip, dst_ip, IpProtocol::from(ip_protocol), TelemetrySource::Sflow);
    pkt.ts_nanos = ts_nanos;
    pkt.length = wire_len;
    pkt.sample_ratio = sample_ratio;
    pkt.fragmented = fragmented;
    apply_transport(&mut pkt, &sliced.transport);

    if capture_payload {
        pkt.payload = Some(raw[..raw.len().min(MAX_PAYLOAD_CAPTURE)].to_vec());
    }

    Ok(pkt)
}

fn apply_transport(pkt: &mut SimplePacket, transport: &Option<TransportSlice>) {
    match transport {
        Some(TransportSlice::Tcp(tcp)) => {
            pkt.src_port = tcp.source_port();
            pkt.dst_port = tcp.destination_port();
            pkt.flags = TcpFlags {
                fin: tcp.fin(),
                syn: tcp.syn(),
                rst: tcp.rst(),
                psh: tcp.psh(),
                ack: tcp.ack(),
                urg: tcp.urg(),
                ece: tcp.ece(),
                cwr: tcp.cwr(),
            };
        }
        Some(TransportSlice::Udp(udp)) => {
            pkt.src_port = udp.source_port();
            pkt.dst_port = udp.destination_port();
        }
        // ICMP and unknown protocols carry no ports
        _ => {}
    }
}

//! Ethernet/IPv4/IPv6 + TCP/UDP header decode and flow-key extraction.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use flowtap_common::{FlowError, FlowResult};
use flowtap_engine::buffer::PacketRecord;
use flowtap_engine::key::FlowKey;

/// One header field a flow key can be built from. The order fields appear
/// in the configured key list is the order their bytes are concatenated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyField {
    SourceIp,
    DestinationIp,
    SourceTransportPort,
    DestinationTransportPort,
    Protocol,
}

impl KeyField {
    /// All fields a 5-tuple key would use, in the conventional order.
    pub fn five_tuple() -> Vec<KeyField> {
        vec![
            KeyField::SourceIp,
            KeyField::DestinationIp,
            KeyField::SourceTransportPort,
            KeyField::DestinationTransportPort,
            KeyField::Protocol,
        ]
    }
}

struct Header {
    src_ip: IpAddr,
    dst_ip: IpAddr,
    src_port: u16,
    dst_port: u16,
    protocol: u8,
    tcp_flags: Option<u8>,
    total_len: u32,
}

fn parse_ipv4(data: &[u8]) -> FlowResult<Header> {
    if data.len() < 20 {
        return Err(FlowError::Decode("truncated IPv4 header".into()));
    }
    let ihl = ((data[0] & 0x0f) * 4) as usize;
    if data.len() < ihl {
        return Err(FlowError::Decode("IPv4 header length exceeds packet".into()));
    }
    let protocol = data[9];
    let src_ip = IpAddr::V4(Ipv4Addr::new(data[12], data[13], data[14], data[15]));
    let dst_ip = IpAddr::V4(Ipv4Addr::new(data[16], data[17], data[18], data[19]));
    // IPv4 Total Length field: whole-datagram length, header included.
    let total_len = u16::from_be_bytes([data[2], data[3]]) as u32;

    let (src_port, dst_port, tcp_flags) = parse_l4(&data[ihl..], protocol)?;

    Ok(Header {
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        protocol,
        tcp_flags,
        total_len,
    })
}

fn parse_ipv6(data: &[u8]) -> FlowResult<Header> {
    if data.len() < 40 {
        return Err(FlowError::Decode("truncated IPv6 header".into()));
    }
    let protocol = data[6];
    let src_ip = IpAddr::V6(Ipv6Addr::from(<[u8; 16]>::try_from(&data[8..24]).unwrap()));
    let dst_ip = IpAddr::V6(Ipv6Addr::from(<[u8; 16]>::try_from(&data[24..40]).unwrap()));
    // IPv6 Payload Length field: everything after the fixed 40-byte header,
    // not the whole-datagram length IPv4's field carries.
    let total_len = u16::from_be_bytes([data[4], data[5]]) as u32;

    let (src_port, dst_port, tcp_flags) = parse_l4(&data[40..], protocol)?;

    Ok(Header {
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        protocol,
        tcp_flags,
        total_len,
    })
}

fn parse_l4(data: &[u8], protocol: u8) -> FlowResult<(u16, u16, Option<u8>)> {
    match protocol {
        6 | 17 if data.len() >= 4 => {
            let src_port = u16::from_be_bytes([data[0], data[1]]);
            let dst_port = u16::from_be_bytes([data[2], data[3]]);
            let tcp_flags = if protocol == 6 && data.len() >= 14 {
                Some(data[13])
            } else {
                None
            };
            Ok((src_port, dst_port, tcp_flags))
        }
        _ => Ok((0, 0, None)),
    }
}

fn ip_bytes(ip: IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

fn key_bytes(fields: &[KeyField], h: &Header, swapped: bool) -> Vec<u8> {
    let mut out = Vec::new();
    for field in fields {
        match field {
            KeyField::SourceIp => out.extend(ip_bytes(if swapped { h.dst_ip } else { h.src_ip })),
            KeyField::DestinationIp => out.extend(ip_bytes(if swapped { h.src_ip } else { h.dst_ip })),
            KeyField::SourceTransportPort => {
                out.extend((if swapped { h.dst_port } else { h.src_port }).to_be_bytes())
            }
            KeyField::DestinationTransportPort => {
                out.extend((if swapped { h.src_port } else { h.dst_port }).to_be_bytes())
            }
            KeyField::Protocol => out.push(h.protocol),
        }
    }
    out
}

/// Decode one Ethernet frame into a [`PacketRecord`], extracting a flow key
/// from `fields` and canonicalizing it if `bidirectional`.
pub fn decode_frame(
    frame: &[u8],
    timestamp: i64,
    fields: &[KeyField],
    bidirectional: bool,
) -> FlowResult<PacketRecord> {
    if frame.len() < 14 {
        return Err(FlowError::Decode("frame shorter than an Ethernet header".into()));
    }
    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    let header = match ethertype {
        0x0800 => parse_ipv4(&frame[14..])?,
        0x86dd => parse_ipv6(&frame[14..])?,
        other => return Err(FlowError::Decode(format!("unsupported ethertype {other:#06x}"))),
    };

    let needs_ports = fields
        .iter()
        .any(|f| matches!(f, KeyField::SourceTransportPort | KeyField::DestinationTransportPort));
    if needs_ports && !matches!(header.protocol, 6 | 17) {
        return Err(FlowError::KeyReject(format!(
            "flow key requires a transport port but protocol {} carries none",
            header.protocol
        )));
    }

    let forward_bytes = key_bytes(fields, &header, false);
    let (key, forward) = if bidirectional {
        let reverse_bytes = key_bytes(fields, &header, true);
        FlowKey::canonicalize(forward_bytes, reverse_bytes)
    } else {
        (FlowKey::from_bytes(forward_bytes), true)
    };

    Ok(PacketRecord {
        key,
        forward,
        timestamp,
        total_len: header.total_len,
        src_port: header.src_port,
        dst_port: header.dst_port,
        protocol: header.protocol,
        tcp_flags: header.tcp_flags,
        payload: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_frame(syn: bool) -> Vec<u8> {
        let mut frame = vec![
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // dst mac
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // src mac
            0x08, 0x00, // IPv4
            0x45, 0x00, 0x00, 0x28, // version/ihl, dscp, total len
            0x00, 0x00, 0x00, 0x00, // id, flags/frag
            0x40, 0x06, 0x00, 0x00, // ttl, protocol=TCP, checksum
            192, 168, 1, 1, // src
            10, 0, 0, 1, // dst
            0x30, 0x39, // src port 12345
            0x01, 0xbb, // dst port 443
            0, 0, 0, 0, // seq
            0, 0, 0, 0, // ack
            0x50, if syn { 0x02 } else { 0x10 }, // data offset, flags
            0, 0, 0, 0,
        ];
        frame.truncate(14 + 20 + 20);
        frame
    }

    #[test]
    fn decodes_5_tuple_and_syn_flag() {
        let record = decode_frame(&tcp_frame(true), 0, &KeyField::five_tuple(), true).unwrap();
        assert_eq!(record.src_port, 12345);
        assert_eq!(record.dst_port, 443);
        assert_eq!(record.protocol, 6);
        assert_eq!(record.tcp_flags, Some(0x02));
    }

    #[test]
    fn bidirectional_key_matches_in_both_directions() {
        let request = decode_frame(&tcp_frame(true), 0, &KeyField::five_tuple(), true).unwrap();
        // swap src/dst to build the synthetic reply frame's header bytes
        let mut reply_frame = tcp_frame(false);
        reply_frame[26..30].copy_from_slice(&[10, 0, 0, 1]);
        reply_frame[30..34].copy_from_slice(&[192, 168, 1, 1]);
        reply_frame[34..36].copy_from_slice(&443u16.to_be_bytes());
        reply_frame[36..38].copy_from_slice(&12345u16.to_be_bytes());
        let reply = decode_frame(&reply_frame, 1, &KeyField::five_tuple(), true).unwrap();

        assert_eq!(request.key, reply.key);
        assert!(request.forward);
        assert!(!reply.forward);
    }

    #[test]
    fn rejects_truncated_frame() {
        assert!(decode_frame(&[0u8; 10], 0, &KeyField::five_tuple(), true).is_err());
    }

    #[test]
    fn rejects_port_keyed_config_for_a_portless_protocol() {
        // ICMP (protocol 1) carries no transport ports, but the key asks
        // for one.
        let mut frame = tcp_frame(true);
        frame[14 + 9] = 1; // IPv4 protocol field -> ICMP
        let result = decode_frame(&frame, 0, &KeyField::five_tuple(), true);
        assert!(matches!(result, Err(FlowError::KeyReject(_))));
    }

    #[test]
    fn total_len_is_the_ip_total_length_field_not_the_captured_frame_length() {
        // IP total length field (0x00, 0x28 = 40) covers the 20-byte IPv4
        // header plus 20-byte TCP header; the captured frame is 14 bytes
        // longer for Ethernet, which must not be counted in.
        let record = decode_frame(&tcp_frame(true), 0, &KeyField::five_tuple(), true).unwrap();
        assert_eq!(record.total_len, 40);
    }
}

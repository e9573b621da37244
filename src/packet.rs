use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;
pub const PROTO_ICMPV6: u8 = 58;

pub const ICMPV4_ECHO_REQUEST: u8 = 8;
pub const ICMPV4_ECHO_REPLY: u8 = 0;
pub const ICMPV6_ECHO_REQUEST: u8 = 128;
pub const ICMPV6_ECHO_REPLY: u8 = 129;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpProtocol {
    Tcp,
    Udp,
    Icmp,
    IcmpV6,
    Other(u8),
}

impl IpProtocol {
    fn from_number(n: u8) -> Self {
        match n {
            PROTO_TCP => IpProtocol::Tcp,
            PROTO_UDP => IpProtocol::Udp,
            PROTO_ICMP => IpProtocol::Icmp,
            PROTO_ICMPV6 => IpProtocol::IcmpV6,
            other => IpProtocol::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpMeta {
    pub msg_type: u8,
    pub ident: u16,
    pub seq: u16,
}

/// The header fields packet dispatch decides on. Parsing never allocates;
/// payload access re-slices the original buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketMeta {
    pub version: u8,
    pub protocol: IpProtocol,
    pub src: IpAddr,
    pub dst: IpAddr,
    /// Zero when the protocol has no ports.
    pub src_port: u16,
    pub dst_port: u16,
    pub icmp: Option<IcmpMeta>,
    /// Byte offset of the transport header within the packet.
    transport_offset: usize,
}

impl PacketMeta {
    pub fn is_multicast(&self) -> bool {
        self.dst.is_multicast()
    }

    pub fn is_icmp_echo_request(&self) -> bool {
        matches!(
            (self.protocol, self.icmp),
            (IpProtocol::Icmp, Some(IcmpMeta { msg_type: ICMPV4_ECHO_REQUEST, .. }))
                | (IpProtocol::IcmpV6, Some(IcmpMeta { msg_type: ICMPV6_ECHO_REQUEST, .. }))
        )
    }

    pub fn is_icmp_echo_reply(&self) -> bool {
        matches!(
            (self.protocol, self.icmp),
            (IpProtocol::Icmp, Some(IcmpMeta { msg_type: ICMPV4_ECHO_REPLY, .. }))
                | (IpProtocol::IcmpV6, Some(IcmpMeta { msg_type: ICMPV6_ECHO_REPLY, .. }))
        )
    }

    pub fn src_socket(&self) -> SocketAddr {
        SocketAddr::new(self.src, self.src_port)
    }

    pub fn dst_socket(&self) -> SocketAddr {
        SocketAddr::new(self.dst, self.dst_port)
    }

    /// UDP payload of the packet this meta was parsed from.
    pub fn udp_payload<'a>(&self, packet: &'a [u8]) -> Option<&'a [u8]> {
        if self.protocol != IpProtocol::Udp {
            return None;
        }
        packet.get(self.transport_offset + 8..)
    }

    /// ICMP echo payload (after the 8-byte echo header).
    pub fn icmp_payload<'a>(&self, packet: &'a [u8]) -> Option<&'a [u8]> {
        self.icmp?;
        packet.get(self.transport_offset + 8..)
    }
}

/// Best-effort peek at the fields dispatch needs. Returns `None` for
/// anything too short or structurally invalid; IPv6 extension headers are
/// not walked (the first next-header decides).
pub fn parse(packet: &[u8]) -> Option<PacketMeta> {
    if packet.is_empty() {
        return None;
    }
    match packet[0] >> 4 {
        4 => parse_v4(packet),
        6 => parse_v6(packet),
        _ => None,
    }
}

fn parse_v4(packet: &[u8]) -> Option<PacketMeta> {
    if packet.len() < 20 {
        return None;
    }
    let ihl = ((packet[0] & 0x0f) as usize) * 4;
    if ihl < 20 || packet.len() < ihl {
        return None;
    }
    let proto_num = packet[9];
    let src = Ipv4Addr::from(<[u8; 4]>::try_from(&packet[12..16]).ok()?);
    let dst = Ipv4Addr::from(<[u8; 4]>::try_from(&packet[16..20]).ok()?);

    // Non-first fragments carry no transport header.
    let frag_offset = u16::from_be_bytes([packet[6], packet[7]]) & 0x1fff;
    let transport = if frag_offset == 0 { &packet[ihl..] } else { &[][..] };

    let mut meta = PacketMeta {
        version: 4,
        protocol: IpProtocol::from_number(proto_num),
        src: IpAddr::V4(src),
        dst: IpAddr::V4(dst),
        src_port: 0,
        dst_port: 0,
        icmp: None,
        transport_offset: ihl,
    };
    fill_transport(&mut meta, transport);
    Some(meta)
}

fn parse_v6(packet: &[u8]) -> Option<PacketMeta> {
    if packet.len() < 40 {
        return None;
    }
    let proto_num = packet[6];
    let src = Ipv6Addr::from(<[u8; 16]>::try_from(&packet[8..24]).ok()?);
    let dst = Ipv6Addr::from(<[u8; 16]>::try_from(&packet[24..40]).ok()?);

    let mut meta = PacketMeta {
        version: 6,
        protocol: IpProtocol::from_number(proto_num),
        src: IpAddr::V6(src),
        dst: IpAddr::V6(dst),
        src_port: 0,
        dst_port: 0,
        icmp: None,
        transport_offset: 40,
    };
    fill_transport(&mut meta, &packet[40..]);
    Some(meta)
}

fn fill_transport(meta: &mut PacketMeta, transport: &[u8]) {
    match meta.protocol {
        IpProtocol::Tcp | IpProtocol::Udp => {
            if transport.len() >= 4 {
                meta.src_port = u16::from_be_bytes([transport[0], transport[1]]);
                meta.dst_port = u16::from_be_bytes([transport[2], transport[3]]);
            }
        }
        IpProtocol::Icmp | IpProtocol::IcmpV6 => {
            if transport.len() >= 8 {
                meta.icmp = Some(IcmpMeta {
                    msg_type: transport[0],
                    ident: u16::from_be_bytes([transport[4], transport[5]]),
                    seq: u16::from_be_bytes([transport[6], transport[7]]),
                });
            }
        }
        IpProtocol::Other(_) => {}
    }
}

/// Builds a UDP datagram inside a fresh IP packet. `src` and `dst` must be
/// the same IP version.
pub fn build_udp_packet(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Option<Vec<u8>> {
    let udp_len = 8 + payload.len();
    let mut udp = Vec::with_capacity(udp_len);
    udp.extend_from_slice(&src.port().to_be_bytes());
    udp.extend_from_slice(&dst.port().to_be_bytes());
    udp.extend_from_slice(&(udp_len as u16).to_be_bytes());
    udp.extend_from_slice(&[0, 0]); // checksum patched below
    udp.extend_from_slice(payload);

    match (src.ip(), dst.ip()) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            let sum = transport_checksum_v4(s, d, PROTO_UDP, &udp);
            udp[6..8].copy_from_slice(&sum.to_be_bytes());
            Some(wrap_v4(s, d, PROTO_UDP, &udp))
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            let sum = transport_checksum_v6(&s, &d, PROTO_UDP, &udp);
            udp[6..8].copy_from_slice(&sum.to_be_bytes());
            Some(wrap_v6(s, d, PROTO_UDP, &udp))
        }
        _ => None,
    }
}

/// Builds an ICMP echo request or reply in a fresh IP packet.
pub fn build_icmp_echo(
    src: IpAddr,
    dst: IpAddr,
    reply: bool,
    ident: u16,
    seq: u16,
    payload: &[u8],
) -> Option<Vec<u8>> {
    let mut icmp = Vec::with_capacity(8 + payload.len());
    let (msg_type, proto) = match (src, reply) {
        (IpAddr::V4(_), false) => (ICMPV4_ECHO_REQUEST, PROTO_ICMP),
        (IpAddr::V4(_), true) => (ICMPV4_ECHO_REPLY, PROTO_ICMP),
        (IpAddr::V6(_), false) => (ICMPV6_ECHO_REQUEST, PROTO_ICMPV6),
        (IpAddr::V6(_), true) => (ICMPV6_ECHO_REPLY, PROTO_ICMPV6),
    };
    icmp.push(msg_type);
    icmp.push(0); // code
    icmp.extend_from_slice(&[0, 0]); // checksum patched below
    icmp.extend_from_slice(&ident.to_be_bytes());
    icmp.extend_from_slice(&seq.to_be_bytes());
    icmp.extend_from_slice(payload);

    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            let sum = internet_checksum(&[&icmp]);
            icmp[2..4].copy_from_slice(&sum.to_be_bytes());
            Some(wrap_v4(s, d, proto, &icmp))
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            let sum = transport_checksum_v6(&s, &d, proto, &icmp);
            icmp[2..4].copy_from_slice(&sum.to_be_bytes());
            Some(wrap_v6(s, d, proto, &icmp))
        }
        _ => None,
    }
}

fn wrap_v4(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, transport: &[u8]) -> Vec<u8> {
    let total = 20 + transport.len();
    let mut pkt = Vec::with_capacity(total);
    pkt.push(0x45);
    pkt.push(0);
    pkt.extend_from_slice(&(total as u16).to_be_bytes());
    pkt.extend_from_slice(&[0, 0]); // identification
    pkt.extend_from_slice(&[0x40, 0]); // DF, no fragment offset
    pkt.push(64); // ttl
    pkt.push(proto);
    pkt.extend_from_slice(&[0, 0]); // header checksum patched below
    pkt.extend_from_slice(&src.octets());
    pkt.extend_from_slice(&dst.octets());
    let sum = internet_checksum(&[&pkt[..20]]);
    pkt[10..12].copy_from_slice(&sum.to_be_bytes());
    pkt.extend_from_slice(transport);
    pkt
}

fn wrap_v6(src: Ipv6Addr, dst: Ipv6Addr, next: u8, transport: &[u8]) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(40 + transport.len());
    pkt.extend_from_slice(&[0x60, 0, 0, 0]);
    pkt.extend_from_slice(&(transport.len() as u16).to_be_bytes());
    pkt.push(next);
    pkt.push(64); // hop limit
    pkt.extend_from_slice(&src.octets());
    pkt.extend_from_slice(&dst.octets());
    pkt.extend_from_slice(transport);
    pkt
}

fn transport_checksum_v4(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, transport: &[u8]) -> u16 {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src.octets());
    pseudo[4..8].copy_from_slice(&dst.octets());
    pseudo[9] = proto;
    pseudo[10..12].copy_from_slice(&(transport.len() as u16).to_be_bytes());
    let sum = internet_checksum(&[&pseudo, transport]);
    // All-zero means "no checksum" for UDP; transmit the complemented form.
    if sum == 0 { 0xffff } else { sum }
}

fn transport_checksum_v6(src: &Ipv6Addr, dst: &Ipv6Addr, next: u8, transport: &[u8]) -> u16 {
    let mut pseudo = [0u8; 40];
    pseudo[0..16].copy_from_slice(&src.octets());
    pseudo[16..32].copy_from_slice(&dst.octets());
    pseudo[32..36].copy_from_slice(&(transport.len() as u32).to_be_bytes());
    pseudo[39] = next;
    let sum = internet_checksum(&[&pseudo, transport]);
    if sum == 0 { 0xffff } else { sum }
}

fn internet_checksum(chunks: &[&[u8]]) -> u16 {
    let mut sum: u32 = 0;
    let mut carry_byte: Option<u8> = None;

    for chunk in chunks {
        let mut data = *chunk;
        if let Some(hi) = carry_byte.take() {
            if data.is_empty() {
                carry_byte = Some(hi);
                continue;
            }
            sum += u32::from(u16::from_be_bytes([hi, data[0]]));
            data = &data[1..];
        }
        let mut it = data.chunks_exact(2);
        for pair in &mut it {
            sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
        }
        if let [last] = it.remainder() {
            carry_byte = Some(*last);
        }
    }
    if let Some(hi) = carry_byte {
        sum += u32::from(u16::from_be_bytes([hi, 0]));
    }

    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_v4_roundtrip() {
        let src: SocketAddr = "10.255.0.2:5353".parse().unwrap();
        let dst: SocketAddr = "1.1.1.1:53".parse().unwrap();
        let pkt = build_udp_packet(src, dst, b"query").unwrap();

        let meta = parse(&pkt).unwrap();
        assert_eq!(meta.version, 4);
        assert_eq!(meta.protocol, IpProtocol::Udp);
        assert_eq!(meta.src_socket(), src);
        assert_eq!(meta.dst_socket(), dst);
        assert_eq!(meta.udp_payload(&pkt).unwrap(), b"query");
        assert!(!meta.is_multicast());

        // IPv4 header checksum must verify to zero when re-summed.
        assert_eq!(internet_checksum(&[&pkt[..20]]), 0);
    }

    #[test]
    fn udp_v6_roundtrip() {
        let src: SocketAddr = "[fd12::2]:4000".parse().unwrap();
        let dst: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        let pkt = build_udp_packet(src, dst, b"abc").unwrap();

        let meta = parse(&pkt).unwrap();
        assert_eq!(meta.version, 6);
        assert_eq!(meta.protocol, IpProtocol::Udp);
        assert_eq!(meta.src_socket(), src);
        assert_eq!(meta.dst_socket(), dst);
        assert_eq!(meta.udp_payload(&pkt).unwrap(), b"abc");
    }

    #[test]
    fn mixed_families_rejected() {
        let src: SocketAddr = "10.0.0.1:1".parse().unwrap();
        let dst: SocketAddr = "[fd12::1]:1".parse().unwrap();
        assert!(build_udp_packet(src, dst, b"x").is_none());
    }

    #[test]
    fn icmp_echo_roundtrip() {
        let src: IpAddr = "10.255.0.2".parse().unwrap();
        let dst: IpAddr = "10.255.0.1".parse().unwrap();
        let pkt = build_icmp_echo(src, dst, false, 0x1234, 7, b"ping-payload").unwrap();

        let meta = parse(&pkt).unwrap();
        assert_eq!(meta.protocol, IpProtocol::Icmp);
        assert!(meta.is_icmp_echo_request());
        assert!(!meta.is_icmp_echo_reply());
        let icmp = meta.icmp.unwrap();
        assert_eq!(icmp.ident, 0x1234);
        assert_eq!(icmp.seq, 7);
        assert_eq!(meta.icmp_payload(&pkt).unwrap(), b"ping-payload");

        let reply = build_icmp_echo(dst, src, true, icmp.ident, icmp.seq, b"ping-payload").unwrap();
        let rmeta = parse(&reply).unwrap();
        assert!(rmeta.is_icmp_echo_reply());
        assert_eq!(rmeta.src, dst);
        assert_eq!(rmeta.dst, src);
    }

    #[test]
    fn multicast_flagged() {
        let src: SocketAddr = "10.0.0.2:137".parse().unwrap();
        let dst: SocketAddr = "224.0.0.251:5353".parse().unwrap();
        let pkt = build_udp_packet(src, dst, b"mdns").unwrap();
        assert!(parse(&pkt).unwrap().is_multicast());
    }

    #[test]
    fn garbage_is_none() {
        assert!(parse(&[]).is_none());
        assert!(parse(&[0x45]).is_none());
        assert!(parse(&[0x00; 40]).is_none());
    }
}

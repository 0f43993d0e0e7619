// Captured frame parsing into normalized packet records

use pnet::packet::Packet;
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Transport protocol of a packet or socket
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Transport::Tcp),
            "udp" => Ok(Transport::Udp),
            other => Err(anyhow::anyhow!("Unknown transport: {}", other)),
        }
    }
}

/// Link-layer framing of a capture interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// Frames start with an Ethernet header (including Linux loopback)
    Ethernet,
    /// Frames start directly with an IPv4/IPv6 header (tun devices)
    RawIp,
}

/// One captured TCP/UDP packet, reduced to what attribution needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketRecord {
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub transport: Transport,
    /// Length of the whole captured frame in bytes
    pub byte_length: usize,
    pub is_v6: bool,
}

/// Parse a captured frame. Anything that is not TCP or UDP over IPv4/IPv6 yields `None`.
pub fn parse_frame(frame: &[u8], link: LinkType) -> Option<PacketRecord> {
    match link {
        LinkType::Ethernet => {
            let ethernet = EthernetPacket::new(frame)?;
            match ethernet.get_ethertype() {
                EtherTypes::Ipv4 => parse_ipv4(ethernet.payload(), frame.len()),
                EtherTypes::Ipv6 => parse_ipv6(ethernet.payload(), frame.len()),
                _ => None,
            }
        }
        LinkType::RawIp => match frame.first().map(|b| b >> 4) {
            Some(4) => parse_ipv4(frame, frame.len()),
            Some(6) => parse_ipv6(frame, frame.len()),
            _ => None,
        },
    }
}

fn parse_ipv4(bytes: &[u8], frame_len: usize) -> Option<PacketRecord> {
    let ipv4 = Ipv4Packet::new(bytes)?;
    parse_transport(
        IpAddr::V4(ipv4.get_source()),
        IpAddr::V4(ipv4.get_destination()),
        ipv4.get_next_level_protocol(),
        ipv4.payload(),
        frame_len,
        false,
    )
}

fn parse_ipv6(bytes: &[u8], frame_len: usize) -> Option<PacketRecord> {
    let ipv6 = Ipv6Packet::new(bytes)?;
    // Extension headers are not walked; such packets are dropped like any other non-TCP/UDP frame
    parse_transport(
        IpAddr::V6(ipv6.get_source()),
        IpAddr::V6(ipv6.get_destination()),
        ipv6.get_next_header(),
        ipv6.payload(),
        frame_len,
        true,
    )
}

fn parse_transport(
    src_addr: IpAddr,
    dst_addr: IpAddr,
    protocol: IpNextHeaderProtocol,
    payload: &[u8],
    frame_len: usize,
    is_v6: bool,
) -> Option<PacketRecord> {
    let (src_port, dst_port, transport) = match protocol {
        IpNextHeaderProtocols::Tcp => {
            let tcp = TcpPacket::new(payload)?;
            (tcp.get_source(), tcp.get_destination(), Transport::Tcp)
        }
        IpNextHeaderProtocols::Udp => {
            let udp = UdpPacket::new(payload)?;
            (udp.get_source(), udp.get_destination(), Transport::Udp)
        }
        _ => return None,
    };

    Some(PacketRecord {
        src_addr,
        dst_addr,
        src_port,
        dst_port,
        transport,
        byte_length: frame_len,
        is_v6,
    })
}

/// Frame builders shared by unit and integration tests
#[doc(hidden)]
pub mod testing {
    use super::Transport;
    use pnet::packet::ethernet::{EtherTypes, MutableEthernetPacket};
    use pnet::packet::ip::IpNextHeaderProtocols;
    use pnet::packet::ipv4::MutableIpv4Packet;
    use pnet::packet::ipv6::MutableIpv6Packet;
    use pnet::packet::tcp::MutableTcpPacket;
    use pnet::packet::udp::MutableUdpPacket;
    use std::net::{Ipv4Addr, Ipv6Addr};

    const ETHERNET_HEADER: usize = 14;
    const IPV4_HEADER: usize = 20;
    const IPV6_HEADER: usize = 40;
    const TCP_HEADER: usize = 20;
    const UDP_HEADER: usize = 8;

    fn l4_len(transport: Transport) -> usize {
        match transport {
            Transport::Tcp => TCP_HEADER,
            Transport::Udp => UDP_HEADER,
        }
    }

    fn write_l4(buf: &mut [u8], transport: Transport, src_port: u16, dst_port: u16) {
        match transport {
            Transport::Tcp => {
                if let Some(mut tcp) = MutableTcpPacket::new(buf) {
                    tcp.set_source(src_port);
                    tcp.set_destination(dst_port);
                    tcp.set_data_offset(5);
                }
            }
            Transport::Udp => {
                let len = buf.len() as u16;
                if let Some(mut udp) = MutableUdpPacket::new(buf) {
                    udp.set_source(src_port);
                    udp.set_destination(dst_port);
                    udp.set_length(len);
                }
            }
        }
    }

    /// Build an IPv4 packet, optionally wrapped in an Ethernet header
    pub fn ipv4_frame(
        src: Ipv4Addr,
        src_port: u16,
        dst: Ipv4Addr,
        dst_port: u16,
        transport: Transport,
        payload_len: usize,
        ethernet: bool,
    ) -> Vec<u8> {
        let l2 = if ethernet { ETHERNET_HEADER } else { 0 };
        let ip_len = IPV4_HEADER + l4_len(transport) + payload_len;
        let mut buf = vec![0u8; l2 + ip_len];

        if ethernet {
            if let Some(mut eth) = MutableEthernetPacket::new(&mut buf[..]) {
                eth.set_ethertype(EtherTypes::Ipv4);
            }
        }
        if let Some(mut ip) = MutableIpv4Packet::new(&mut buf[l2..]) {
            ip.set_version(4);
            ip.set_header_length(5);
            ip.set_total_length(ip_len as u16);
            ip.set_ttl(64);
            ip.set_next_level_protocol(match transport {
                Transport::Tcp => IpNextHeaderProtocols::Tcp,
                Transport::Udp => IpNextHeaderProtocols::Udp,
            });
            ip.set_source(src);
            ip.set_destination(dst);
        }
        write_l4(&mut buf[l2 + IPV4_HEADER..], transport, src_port, dst_port);
        buf
    }

    /// Build an Ethernet-framed IPv6 packet
    pub fn ipv6_frame(
        src: Ipv6Addr,
        src_port: u16,
        dst: Ipv6Addr,
        dst_port: u16,
        transport: Transport,
        payload_len: usize,
    ) -> Vec<u8> {
        let l4 = l4_len(transport) + payload_len;
        let mut buf = vec![0u8; ETHERNET_HEADER + IPV6_HEADER + l4];

        if let Some(mut eth) = MutableEthernetPacket::new(&mut buf[..]) {
            eth.set_ethertype(EtherTypes::Ipv6);
        }
        if let Some(mut ip) = MutableIpv6Packet::new(&mut buf[ETHERNET_HEADER..]) {
            ip.set_version(6);
            ip.set_payload_length(l4 as u16);
            ip.set_hop_limit(64);
            ip.set_next_header(match transport {
                Transport::Tcp => IpNextHeaderProtocols::Tcp,
                Transport::Udp => IpNextHeaderProtocols::Udp,
            });
            ip.set_source(src);
            ip.set_destination(dst);
        }
        write_l4(
            &mut buf[ETHERNET_HEADER + IPV6_HEADER..],
            transport,
            src_port,
            dst_port,
        );
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{ipv4_frame, ipv6_frame};
    use super::*;
    use pnet::packet::ethernet::MutableEthernetPacket;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_parse_ipv4_tcp() {
        let frame = ipv4_frame(
            Ipv4Addr::new(192, 168, 1, 100),
            12345,
            Ipv4Addr::new(8, 8, 8, 8),
            443,
            Transport::Tcp,
            100,
            true,
        );
        let record = parse_frame(&frame, LinkType::Ethernet).unwrap();

        assert_eq!(record.src_addr, "192.168.1.100".parse::<IpAddr>().unwrap());
        assert_eq!(record.dst_addr, "8.8.8.8".parse::<IpAddr>().unwrap());
        assert_eq!(record.src_port, 12345);
        assert_eq!(record.dst_port, 443);
        assert_eq!(record.transport, Transport::Tcp);
        assert_eq!(record.byte_length, frame.len());
        assert!(!record.is_v6);
    }

    #[test]
    fn test_parse_ipv6_udp() {
        let frame = ipv6_frame(
            "2001:db8::1".parse::<Ipv6Addr>().unwrap(),
            5353,
            "2001:db8::2".parse::<Ipv6Addr>().unwrap(),
            53,
            Transport::Udp,
            32,
        );
        let record = parse_frame(&frame, LinkType::Ethernet).unwrap();

        assert_eq!(record.transport, Transport::Udp);
        assert_eq!(record.src_port, 5353);
        assert_eq!(record.dst_port, 53);
        assert!(record.is_v6);
        assert_eq!(record.byte_length, frame.len());
    }

    #[test]
    fn test_parse_raw_ip_frame() {
        let frame = ipv4_frame(
            Ipv4Addr::new(10, 8, 0, 2),
            40000,
            Ipv4Addr::new(1, 1, 1, 1),
            53,
            Transport::Udp,
            10,
            false,
        );
        let record = parse_frame(&frame, LinkType::RawIp).unwrap();
        assert_eq!(record.dst_port, 53);
        assert_eq!(record.byte_length, frame.len());
    }

    #[test]
    fn test_non_ip_frame_is_dropped() {
        let mut frame = vec![0u8; 64];
        {
            let mut eth = MutableEthernetPacket::new(&mut frame[..]).unwrap();
            eth.set_ethertype(EtherTypes::Arp);
        }
        assert!(parse_frame(&frame, LinkType::Ethernet).is_none());
    }

    #[test]
    fn test_truncated_frame_is_dropped() {
        assert!(parse_frame(&[0u8; 6], LinkType::Ethernet).is_none());
        assert!(parse_frame(&[], LinkType::RawIp).is_none());
    }

    #[test]
    fn test_non_transport_protocol_is_dropped() {
        let mut frame = ipv4_frame(
            Ipv4Addr::new(192, 168, 1, 100),
            0,
            Ipv4Addr::new(8, 8, 8, 8),
            0,
            Transport::Tcp,
            0,
            true,
        );
        // Byte 9 of the IPv4 header is the protocol field; 1 = ICMP
        frame[14 + 9] = 1;
        assert!(parse_frame(&frame, LinkType::Ethernet).is_none());
    }

    #[test]
    fn test_transport_from_str_is_case_insensitive() {
        assert_eq!("TCP".parse::<Transport>().unwrap(), Transport::Tcp);
        assert_eq!("udp".parse::<Transport>().unwrap(), Transport::Udp);
        assert!("sctp".parse::<Transport>().is_err());
        assert_eq!(Transport::Udp.to_string(), "udp");
    }
}

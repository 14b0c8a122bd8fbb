use super::{resolve_ipv4, ProbeTransport};
use crate::upstream::NodeId;
use async_trait::async_trait;
use pnet_packet::icmp::echo_reply::EchoReplyPacket;
use pnet_packet::icmp::echo_request::{IcmpCodes, MutableEchoRequestPacket};
use pnet_packet::icmp::IcmpTypes;
use pnet_packet::ip::IpNextHeaderProtocols;
use pnet_packet::Packet;
use pnet_transport::TransportChannelType::Layer4;
use pnet_transport::TransportProtocol::Ipv4;
use pnet_transport::{icmp_packet_iter, transport_channel};
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

const PAYLOAD: &[u8; 8] = b"marzbal\0";
const ECHO_LEN: usize = 8 + PAYLOAD.len();

/// ICMP echo over a raw socket. Needs CAP_NET_RAW; IPv4 only.
pub struct IcmpTransport;

#[async_trait]
impl ProbeTransport for IcmpTransport {
    fn name(&self) -> &'static str {
        "icmp"
    }

    async fn check(&self, target: &NodeId, deadline: Duration) -> io::Result<()> {
        let addr = resolve_ipv4(target).await?;
        let identifier: u16 = rand::random();
        let sequence: u16 = rand::random();

        tokio::task::spawn_blocking(move || echo(addr, identifier, sequence, deadline))
            .await
            .map_err(io::Error::other)?
    }
}

/// Fill `buf` with an echo request and return the checksum written.
fn build_echo_request(buf: &mut [u8; ECHO_LEN], identifier: u16, sequence: u16) -> io::Result<u16> {
    let mut packet = MutableEchoRequestPacket::new(buf)
        .ok_or_else(|| io::Error::other("icmp buffer too small"))?;
    packet.set_icmp_type(IcmpTypes::EchoRequest);
    packet.set_icmp_code(IcmpCodes::NoCode);
    packet.set_identifier(identifier);
    packet.set_sequence_number(sequence);
    packet.set_payload(PAYLOAD);
    let checksum = pnet_packet::util::checksum(packet.packet(), 1);
    packet.set_checksum(checksum);
    Ok(checksum)
}

fn echo(addr: Ipv4Addr, identifier: u16, sequence: u16, deadline: Duration) -> io::Result<()> {
    let (mut tx, mut rx) = transport_channel(1024, Layer4(Ipv4(IpNextHeaderProtocols::Icmp)))?;

    let mut buf = [0u8; ECHO_LEN];
    build_echo_request(&mut buf, identifier, sequence)?;
    let packet = MutableEchoRequestPacket::new(&mut buf)
        .ok_or_else(|| io::Error::other("icmp buffer too small"))?;
    tx.send_to(packet, IpAddr::V4(addr))?;

    let started = Instant::now();
    let mut replies = icmp_packet_iter(&mut rx);
    loop {
        let remaining = deadline
            .checked_sub(started.elapsed())
            .filter(|d| !d.is_zero())
            .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "icmp echo timed out"))?;

        let Some((reply, source)) = replies.next_with_timeout(remaining)? else {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "icmp echo timed out"));
        };
        if source != IpAddr::V4(addr) || reply.get_icmp_type() != IcmpTypes::EchoReply {
            continue;
        }
        if let Some(echo) = EchoReplyPacket::new(reply.packet()) {
            if matches_request(&echo, identifier, sequence) {
                return Ok(());
            }
        }
    }
}

fn matches_request(reply: &EchoReplyPacket<'_>, identifier: u16, sequence: u16) -> bool {
    reply.get_identifier() == identifier && reply.get_sequence_number() == sequence
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet_packet::icmp::echo_reply::MutableEchoReplyPacket;
    use pnet_packet::icmp::echo_request::EchoRequestPacket;

    #[test]
    fn test_echo_request_layout() {
        let mut buf = [0u8; ECHO_LEN];
        let checksum = build_echo_request(&mut buf, 0xbeef, 7).unwrap();

        let packet = EchoRequestPacket::new(&buf).unwrap();
        assert_eq!(packet.get_icmp_type(), IcmpTypes::EchoRequest);
        assert_eq!(packet.get_identifier(), 0xbeef);
        assert_eq!(packet.get_sequence_number(), 7);
        assert_eq!(packet.get_checksum(), checksum);
        assert_eq!(packet.payload(), PAYLOAD);
        assert_eq!(pnet_packet::util::checksum(&buf, 1), checksum);
    }

    #[test]
    fn test_reply_matching() {
        let mut buf = [0u8; ECHO_LEN];
        let mut reply = MutableEchoReplyPacket::new(&mut buf).unwrap();
        reply.set_icmp_type(IcmpTypes::EchoReply);
        reply.set_identifier(42);
        reply.set_sequence_number(9);

        let reply = EchoReplyPacket::new(&buf).unwrap();
        assert!(matches_request(&reply, 42, 9));
        assert!(!matches_request(&reply, 42, 10));
        assert!(!matches_request(&reply, 43, 9));
    }
}

//! Captive DNS: answers every A query with the access point address.

use std::{
    io::{self, ErrorKind},
    net::{Ipv4Addr, SocketAddr, UdpSocket},
};

use log::{info, warn};
use sprinkler_common::DnsResponder;

const HEADER_LEN: usize = 12;
const MAX_PACKET: usize = 512;
const MAX_PACKETS_PER_POLL: usize = 16;
const ANSWER_TTL_SECS: u32 = 60;

pub struct CaptiveDns {
    port: u16,
    socket: Option<UdpSocket>,
    address: Ipv4Addr,
}

impl CaptiveDns {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            socket: None,
            address: Ipv4Addr::UNSPECIFIED,
        }
    }
}

impl DnsResponder for CaptiveDns {
    fn start(&mut self, address: Ipv4Addr) -> io::Result<()> {
        let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], self.port)))?;
        socket.set_nonblocking(true)?;
        info!("captive DNS listening on udp/{} -> {address}", self.port);
        self.socket = Some(socket);
        self.address = address;
        Ok(())
    }

    fn poll(&mut self) {
        let Some(socket) = self.socket.as_ref() else {
            return;
        };

        let mut buf = [0u8; MAX_PACKET];
        for _ in 0..MAX_PACKETS_PER_POLL {
            let (len, peer) = match socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(err) => {
                    warn!("captive DNS receive failed: {err}");
                    return;
                }
            };

            let Some(response) = build_response(&buf[..len], self.address) else {
                continue;
            };
            if let Err(err) = socket.send_to(&response, peer) {
                warn!("captive DNS reply to {peer} failed: {err}");
            }
        }
    }

    fn stop(&mut self) {
        if self.socket.take().is_some() {
            info!("captive DNS stopped");
        }
    }
}

/// Builds a single-answer reply to a standard query, or `None` for anything else.
pub fn build_response(query: &[u8], address: Ipv4Addr) -> Option<Vec<u8>> {
    if query.len() < HEADER_LEN {
        return None;
    }

    let flags = u16::from_be_bytes([query[2], query[3]]);
    let is_response = flags & 0x8000 != 0;
    let opcode = (flags >> 11) & 0x0f;
    let question_count = u16::from_be_bytes([query[4], query[5]]);
    if is_response || opcode != 0 || question_count == 0 {
        return None;
    }

    let question_end = question_end(query)?;

    let mut response = Vec::with_capacity(question_end + 16);
    response.extend_from_slice(&query[0..2]);
    // QR + AA, keep RD from the query.
    response.extend_from_slice(&(0x8400 | (flags & 0x0100)).to_be_bytes());
    response.extend_from_slice(&1u16.to_be_bytes());
    response.extend_from_slice(&1u16.to_be_bytes());
    response.extend_from_slice(&0u16.to_be_bytes());
    response.extend_from_slice(&0u16.to_be_bytes());
    response.extend_from_slice(&query[HEADER_LEN..question_end]);

    response.extend_from_slice(&[0xc0, 0x0c]);
    response.extend_from_slice(&1u16.to_be_bytes());
    response.extend_from_slice(&1u16.to_be_bytes());
    response.extend_from_slice(&ANSWER_TTL_SECS.to_be_bytes());
    response.extend_from_slice(&4u16.to_be_bytes());
    response.extend_from_slice(&address.octets());
    Some(response)
}

fn question_end(query: &[u8]) -> Option<usize> {
    let mut pos = HEADER_LEN;
    loop {
        let label_len = *query.get(pos)? as usize;
        if label_len == 0 {
            pos += 1;
            break;
        }
        if label_len & 0xc0 != 0 {
            return None;
        }
        pos += 1 + label_len;
    }

    let end = pos + 4;
    (end <= query.len()).then_some(end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_for(name: &str) -> Vec<u8> {
        let mut packet = vec![0x12, 0x34, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0];
        for label in name.split('.') {
            packet.push(label.len() as u8);
            packet.extend_from_slice(label.as_bytes());
        }
        packet.extend_from_slice(&[0, 0, 1, 0, 1]);
        packet
    }

    #[test]
    fn answers_with_access_point_address() {
        let query = query_for("example.com");
        let response = build_response(&query, Ipv4Addr::new(192, 168, 4, 1)).unwrap();

        assert_eq!(&response[0..2], &[0x12, 0x34]);
        assert_eq!(response[2] & 0x80, 0x80);
        assert_eq!(&response[6..8], &[0, 1]);
        assert_eq!(&response[HEADER_LEN..query.len()], &query[HEADER_LEN..]);
        assert_eq!(&response[response.len() - 4..], &[192, 168, 4, 1]);
    }

    #[test]
    fn ignores_responses_and_truncated_packets() {
        let mut query = query_for("example.com");
        query[2] |= 0x80;
        assert!(build_response(&query, Ipv4Addr::LOCALHOST).is_none());

        let query = query_for("example.com");
        assert!(build_response(&query[..query.len() - 2], Ipv4Addr::LOCALHOST).is_none());
        assert!(build_response(&[0; 4], Ipv4Addr::LOCALHOST).is_none());
    }
}

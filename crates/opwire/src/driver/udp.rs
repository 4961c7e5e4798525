// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP datagram driver.
//!
//! Runs the transport over a single non-blocking UDP socket. Addresses pack
//! an IPv4 endpoint into the 8-byte raw form:
//!
//! ```text
//! raw = ip[4] | port(u16 le) | 0 | 0
//! ```
//!
//! Packet buffers are recycled through a free list so steady-state polling
//! does not allocate.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};

use super::{Address, Driver, DriverError, Packet};

/// Default payload capacity: Ethernet MTU minus IP and UDP headers.
pub const DEFAULT_MAX_PAYLOAD: u32 = 1472;

fn pack(addr: SocketAddrV4) -> Address {
    let mut raw = [0u8; 8];
    raw[0..4].copy_from_slice(&addr.ip().octets());
    raw[4..6].copy_from_slice(&addr.port().to_le_bytes());
    Address::from_raw(&raw)
}

fn unpack(address: Address) -> SocketAddrV4 {
    let raw = address.to_raw();
    let ip = Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]);
    let port = u16::from_le_bytes([raw[4], raw[5]]);
    SocketAddrV4::new(ip, port)
}

/// Datagram driver over a non-blocking UDP socket.
pub struct UdpDriver {
    socket: UdpSocket,
    local: Address,
    bandwidth_bps: u64,
    max_payload: u32,
    free: Mutex<Vec<Packet>>,
}

impl UdpDriver {
    /// Bind a driver to the given local IPv4 endpoint.
    ///
    /// `bandwidth_bps` is the link speed the grant machinery should assume.
    pub fn bind(local: &str, bandwidth_bps: u64) -> Result<Self, DriverError> {
        let addr: SocketAddr = local
            .parse()
            .map_err(|_| DriverError::AddressParse(local.to_string()))?;
        let SocketAddr::V4(addr) = addr else {
            return Err(DriverError::AddressParse(local.to_string()));
        };

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::V4(addr).into())?;
        let socket: UdpSocket = socket.into();

        let bound = match socket.local_addr()? {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => return Err(DriverError::AddressParse(local.to_string())),
        };
        log::debug!("[udp] driver bound to {}", bound);

        Ok(Self {
            socket,
            local: pack(bound),
            bandwidth_bps,
            max_payload: DEFAULT_MAX_PAYLOAD,
            free: Mutex::new(Vec::new()),
        })
    }

    fn recycle(&self, mut packet: Packet) {
        packet.reset();
        self.free.lock().push(packet);
    }
}

impl Driver for UdpDriver {
    fn alloc_packet(&self) -> Packet {
        self.free
            .lock()
            .pop()
            .unwrap_or_else(|| Packet::with_capacity(self.max_payload as usize))
    }

    fn send_packets(&self, packets: Vec<Packet>) {
        for packet in packets {
            let Some(destination) = packet.address else {
                log::warn!("[udp] dropping packet without destination");
                self.recycle(packet);
                continue;
            };
            let dest = unpack(destination);
            match self.socket.send_to(packet.payload(), dest) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    // Socket buffer full; the datagram is lost, which the
                    // transport treats like any other network loss.
                    log::debug!("[udp] send buffer full, dropping packet to {}", dest);
                }
                Err(e) => {
                    log::warn!("[udp] send_to {} failed: {}", dest, e);
                }
            }
            self.recycle(packet);
        }
    }

    fn receive_packets(&self, max: usize, out: &mut Vec<Packet>) -> usize {
        let mut count = 0;
        while count < max {
            let mut packet = self.alloc_packet();
            match self.socket.recv_from(packet.payload_mut()) {
                Ok((len, SocketAddr::V4(peer))) => {
                    packet.set_len(len);
                    packet.address = Some(pack(peer));
                    out.push(packet);
                    count += 1;
                }
                Ok((_, SocketAddr::V6(peer))) => {
                    log::debug!("[udp] ignoring datagram from non-IPv4 peer {}", peer);
                    self.recycle(packet);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    self.recycle(packet);
                    break;
                }
                Err(e) => {
                    log::warn!("[udp] recv_from failed: {}", e);
                    self.recycle(packet);
                    break;
                }
            }
        }
        count
    }

    fn release_packets(&self, packets: Vec<Packet>) {
        for packet in packets {
            self.recycle(packet);
        }
    }

    fn address_for_name(&self, name: &str) -> Option<Address> {
        match name.parse::<SocketAddr>() {
            Ok(SocketAddr::V4(addr)) => Some(pack(addr)),
            _ => None,
        }
    }

    fn local_address(&self) -> Address {
        self.local
    }

    fn bandwidth_bps(&self) -> u64 {
        self.bandwidth_bps
    }

    fn max_payload_size(&self) -> u32 {
        self.max_payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_packing_roundtrip() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), 7400);
        assert_eq!(unpack(pack(addr)), addr);
    }

    #[test]
    fn loopback_exchange() {
        let a = UdpDriver::bind("127.0.0.1:0", 1_000_000_000).unwrap();
        let b = UdpDriver::bind("127.0.0.1:0", 1_000_000_000).unwrap();

        let mut packet = a.alloc_packet();
        packet.payload_mut()[..5].copy_from_slice(b"hello");
        packet.set_len(5);
        packet.address = Some(b.local_address());
        a.send_packets(vec![packet]);

        // Localhost delivery is fast but not instantaneous.
        let mut received = Vec::new();
        for _ in 0..200 {
            if b.receive_packets(8, &mut received) > 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].payload(), b"hello");
        assert_eq!(received[0].address, Some(a.local_address()));
    }

    #[test]
    fn name_resolution_ipv4_only() {
        let driver = UdpDriver::bind("127.0.0.1:0", 1_000_000_000).unwrap();
        assert!(driver.address_for_name("192.168.1.10:7400").is_some());
        assert!(driver.address_for_name("[::1]:7400").is_none());
        assert!(driver.address_for_name("garbage").is_none());
    }
}

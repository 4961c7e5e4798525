// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Datagram driver abstraction.
//!
//! A driver owns the packet buffers and moves datagrams between the
//! transport and the network. The transport never blocks on a driver call:
//! `receive_packets` returns what is already available and `send_packets`
//! hands datagrams off without waiting for delivery.
//!
//! Packet buffers travel by move: `alloc_packet` transfers a buffer to the
//! caller, `send_packets` and `release_packets` transfer it back. A packet
//! that was accepted into a message buffer stays there until the message is
//! torn down (or, on the send side, until it ships).
//!
//! Two drivers are provided: [`fake::FakeDriver`] wires endpoints together
//! through an in-process network, [`udp::UdpDriver`] runs over a
//! non-blocking UDP socket.

pub mod fake;
pub mod udp;

use std::fmt;

/// Bit-exact raw form of an [`Address`], suitable for embedding in message
/// payloads.
pub type RawAddress = [u8; 8];

/// A resolved datagram endpoint.
///
/// Addresses are small interned values: copying one is resolution. The raw
/// form is stable across processes for a given driver family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(u64);

impl Address {
    /// Reconstruct an address from its raw wire form.
    pub fn from_raw(raw: &RawAddress) -> Self {
        Self(u64::from_le_bytes(*raw))
    }

    /// The raw wire form of this address.
    #[must_use]
    pub fn to_raw(self) -> RawAddress {
        self.0.to_le_bytes()
    }

    pub(crate) fn from_u64(value: u64) -> Self {
        Self(value)
    }

    pub(crate) fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// A datagram buffer owned by a driver.
pub struct Packet {
    /// Source of a received packet, destination of an outgoing one.
    pub address: Option<Address>,
    /// Transmit priority hint (drivers may ignore it).
    pub priority: u8,
    len: usize,
    buf: Box<[u8]>,
}

impl Packet {
    /// Create a packet with the given buffer capacity.
    ///
    /// Drivers call this when minting fresh buffers; the transport itself
    /// only ever obtains packets through [`Driver::alloc_packet`].
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            address: None,
            priority: 0,
            len: 0,
            buf: vec![0u8; capacity].into_boxed_slice(),
        }
    }

    /// The valid payload bytes of this packet.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// The whole writable buffer, up to capacity.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Number of valid payload bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no payload bytes are valid.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Buffer capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Set the number of valid payload bytes.
    ///
    /// Clamped to the buffer capacity.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.buf.len());
    }

    pub(crate) fn reset(&mut self) {
        self.address = None;
        self.priority = 0;
        self.len = 0;
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("address", &self.address)
            .field("priority", &self.priority)
            .field("len", &self.len)
            .field("capacity", &self.buf.len())
            .finish()
    }
}

/// Driver interface consumed by the transport.
pub trait Driver: Send + Sync {
    /// Allocate a send buffer.
    fn alloc_packet(&self) -> Packet;

    /// Hand packets to the network. Each packet's `address` names its
    /// destination. Ownership returns to the driver.
    fn send_packets(&self, packets: Vec<Packet>);

    /// Non-blocking batch receive: appends up to `max` packets to `out`
    /// and returns how many were appended. Received packets carry their
    /// source in `address`.
    fn receive_packets(&self, max: usize, out: &mut Vec<Packet>) -> usize;

    /// Return unused or duplicate packets to the driver.
    fn release_packets(&self, packets: Vec<Packet>);

    /// Resolve a textual endpoint name to an address.
    fn address_for_name(&self, name: &str) -> Option<Address>;

    /// The address other endpoints reach this driver at.
    fn local_address(&self) -> Address;

    /// Link bandwidth in bits per second, used to size grant windows.
    fn bandwidth_bps(&self) -> u64;

    /// Largest datagram payload this driver can carry.
    fn max_payload_size(&self) -> u32;
}

/// Driver construction and IO errors.
#[derive(Debug)]
pub enum DriverError {
    /// Socket-level failure.
    Io(std::io::Error),
    /// Endpoint name could not be parsed or resolved.
    AddressParse(String),
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "driver io error: {}", e),
            Self::AddressParse(name) => write!(f, "cannot resolve address: {}", name),
        }
    }
}

impl std::error::Error for DriverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::AddressParse(_) => None,
        }
    }
}

impl From<std::io::Error> for DriverError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_raw_roundtrip() {
        let addr = Address::from_u64(0xDEAD_BEEF_0042);
        let raw = addr.to_raw();
        assert_eq!(Address::from_raw(&raw), addr);
    }

    #[test]
    fn packet_len_clamped_to_capacity() {
        let mut packet = Packet::with_capacity(64);
        packet.set_len(1000);
        assert_eq!(packet.len(), 64);
        packet.set_len(10);
        assert_eq!(packet.payload().len(), 10);
    }
}

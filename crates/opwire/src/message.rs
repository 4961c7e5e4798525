// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Packet-slot message buffer.
//!
//! A message is a sequence of driver packets indexed by packet number. Each
//! packet reserves `packet_header_len` bytes at the front for the wire data
//! header; application bytes start at that uniform offset, so packet `i`
//! covers application offsets `[i * data_len, (i + 1) * data_len)`.
//!
//! Occupancy is tracked in a bitmap: a slot can be filled at most once, and
//! a rejected duplicate travels back to the caller so it can be returned to
//! the driver. `num_packets * packet_data_length` deliberately over-counts
//! `raw_length` by up to `packet_data_length - 1` bytes; that over-count is
//! what feeds grant decisions, and full receipt (not a byte-exact match) is
//! the terminal condition.

use std::sync::Arc;

use crate::driver::{Driver, Packet};
use crate::protocol::MessageHeader;

/// Hard cap on packets per message.
pub const MAX_MESSAGE_PACKETS: u32 = 1024;

/// Message buffer errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// Message would exceed [`MAX_MESSAGE_PACKETS`].
    TooLong,
    /// The first packet (application header region) is not present.
    HeaderMissing,
    /// A packet needed for the requested range is not present.
    MissingPacket(u16),
    /// Header region already reserved.
    AlreadyReserved,
    /// Driver payload too small to hold the headers.
    PayloadTooSmall,
}

impl std::fmt::Display for MessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooLong => write!(f, "message exceeds packet limit"),
            Self::HeaderMissing => write!(f, "message header region missing"),
            Self::MissingPacket(index) => write!(f, "packet {} not present", index),
            Self::AlreadyReserved => write!(f, "header region already reserved"),
            Self::PayloadTooSmall => write!(f, "driver payload too small for headers"),
        }
    }
}

impl std::error::Error for MessageError {}

/// A message as a sequence of packet slots.
pub struct Message {
    driver: Arc<dyn Driver>,
    packet_header_len: u16,
    packet_data_len: u32,
    raw_len: u32,
    occupied: u32,
    occupancy: Vec<u64>,
    packets: Vec<Option<Packet>>,
}

impl Message {
    /// Create a buffer for a message of `raw_len` application bytes.
    ///
    /// `packet_header_len` bytes at the front of every packet are reserved
    /// for the wire data header. Pass `raw_len = 0` for an outbound message
    /// that will grow through [`Message::append`].
    pub fn new(
        driver: Arc<dyn Driver>,
        packet_header_len: u16,
        raw_len: u32,
    ) -> Result<Self, MessageError> {
        let max_payload = driver.max_payload_size();
        if u32::from(packet_header_len) >= max_payload {
            return Err(MessageError::PayloadTooSmall);
        }
        let packet_data_len = max_payload - u32::from(packet_header_len);
        let slots = raw_len.div_ceil(packet_data_len).max(1);
        if slots > MAX_MESSAGE_PACKETS {
            return Err(MessageError::TooLong);
        }
        let slots = slots as usize;
        Ok(Self {
            driver,
            packet_header_len,
            packet_data_len,
            raw_len,
            occupied: 0,
            occupancy: vec![0u64; slots.div_ceil(64)],
            packets: std::iter::repeat_with(|| None).take(slots).collect(),
        })
    }

    /// Application bytes this message declares.
    #[must_use]
    pub fn raw_length(&self) -> u32 {
        self.raw_len
    }

    /// Number of occupied packet slots.
    #[must_use]
    pub fn num_packets(&self) -> u32 {
        self.occupied
    }

    /// Application bytes each packet carries.
    #[must_use]
    pub fn packet_data_length(&self) -> u32 {
        self.packet_data_len
    }

    /// Total packet slots (occupied or not).
    #[must_use]
    pub fn slot_count(&self) -> u16 {
        self.packets.len() as u16
    }

    fn bit(&self, index: u16) -> bool {
        let index = usize::from(index);
        self.occupancy[index / 64] & (1u64 << (index % 64)) != 0
    }

    fn set_bit(&mut self, index: u16) {
        let index = usize::from(index);
        self.occupancy[index / 64] |= 1u64 << (index % 64);
    }

    /// Place a packet into slot `index`.
    ///
    /// Rejects an already-occupied slot (or an index past the end) by
    /// handing the packet back; the caller returns it to the driver.
    pub fn set_packet(&mut self, index: u16, packet: Packet) -> Result<(), Packet> {
        if usize::from(index) >= self.packets.len() || self.bit(index) {
            return Err(packet);
        }
        self.set_bit(index);
        self.occupied += 1;
        self.packets[usize::from(index)] = Some(packet);
        Ok(())
    }

    /// The packet in slot `index`, if present.
    #[must_use]
    pub fn packet(&self, index: u16) -> Option<&Packet> {
        self.packets.get(usize::from(index))?.as_ref()
    }

    /// Mutable access to the packet in slot `index`.
    pub fn packet_mut(&mut self, index: u16) -> Option<&mut Packet> {
        self.packets.get_mut(usize::from(index))?.as_mut()
    }

    /// Take the packet out of slot `index`, leaving its occupancy bit set.
    ///
    /// Used when a packet ships: the slot stays accounted for but the
    /// buffer ownership moves to the driver.
    pub(crate) fn take_packet(&mut self, index: u16) -> Option<Packet> {
        self.packets.get_mut(usize::from(index))?.take()
    }

    /// Reserve the application header region at the front of the message.
    ///
    /// Allocates the first packet; the raw length becomes the header size
    /// and [`Message::append`] continues after it.
    pub fn reserve_header(&mut self) -> Result<(), MessageError> {
        if self.occupied != 0 || self.raw_len != 0 {
            return Err(MessageError::AlreadyReserved);
        }
        let mut packet = self.driver.alloc_packet();
        packet.set_len(usize::from(self.packet_header_len) + MessageHeader::WIRE_SIZE);
        self.set_bit(0);
        self.occupied = 1;
        self.packets[0] = Some(packet);
        self.raw_len = MessageHeader::WIRE_SIZE as u32;
        Ok(())
    }

    /// Write the application header into the reserved region.
    pub fn set_header(&mut self, header: &MessageHeader) -> Result<(), MessageError> {
        let offset = usize::from(self.packet_header_len);
        let packet = self
            .packets
            .first_mut()
            .and_then(Option::as_mut)
            .ok_or(MessageError::HeaderMissing)?;
        header
            .encode(&mut packet.payload_mut()[offset..])
            .map_err(|_| MessageError::HeaderMissing)?;
        Ok(())
    }

    /// Read the application header back.
    pub fn header(&self) -> Result<MessageHeader, MessageError> {
        let offset = usize::from(self.packet_header_len);
        let packet = self
            .packets
            .first()
            .and_then(Option::as_ref)
            .ok_or(MessageError::HeaderMissing)?;
        let payload = packet.payload();
        if payload.len() < offset + MessageHeader::WIRE_SIZE {
            return Err(MessageError::HeaderMissing);
        }
        let (header, _) =
            MessageHeader::decode(&payload[offset..]).map_err(|_| MessageError::HeaderMissing)?;
        Ok(header)
    }

    /// Append application bytes at the current raw length, allocating
    /// packets as needed.
    pub fn append(&mut self, data: &[u8]) -> Result<(), MessageError> {
        let mut written = 0usize;
        while written < data.len() {
            let offset = self.raw_len as usize + written;
            let slot = offset / self.packet_data_len as usize;
            let within = offset % self.packet_data_len as usize;
            if slot as u32 >= MAX_MESSAGE_PACKETS {
                return Err(MessageError::TooLong);
            }
            if slot >= self.packets.len() {
                self.packets.push(None);
                if self.packets.len().div_ceil(64) > self.occupancy.len() {
                    self.occupancy.push(0);
                }
            }
            if self.packets[slot].is_none() {
                let packet = self.driver.alloc_packet();
                self.packets[slot] = Some(packet);
                self.set_bit(slot as u16);
                self.occupied += 1;
            }
            let header_len = usize::from(self.packet_header_len);
            let chunk = (self.packet_data_len as usize - within).min(data.len() - written);
            // Slot presence was just ensured above.
            let Some(packet) = self.packets[slot].as_mut() else {
                return Err(MessageError::MissingPacket(slot as u16));
            };
            packet.payload_mut()[header_len + within..header_len + within + chunk]
                .copy_from_slice(&data[written..written + chunk]);
            packet.set_len(header_len + within + chunk);
            written += chunk;
        }
        self.raw_len += data.len() as u32;
        Ok(())
    }

    /// Copy application bytes starting at `offset` into `out`.
    ///
    /// Returns the number of bytes copied (bounded by the raw length).
    pub fn copy_out(&self, offset: u32, out: &mut [u8]) -> Result<usize, MessageError> {
        if offset >= self.raw_len {
            return Ok(0);
        }
        let want = (out.len() as u32).min(self.raw_len - offset) as usize;
        let header_len = usize::from(self.packet_header_len);
        let mut copied = 0usize;
        while copied < want {
            let pos = offset as usize + copied;
            let slot = pos / self.packet_data_len as usize;
            let within = pos % self.packet_data_len as usize;
            let packet = self
                .packets
                .get(slot)
                .and_then(Option::as_ref)
                .ok_or(MessageError::MissingPacket(slot as u16))?;
            let chunk = (self.packet_data_len as usize - within).min(want - copied);
            let start = header_len + within;
            out[copied..copied + chunk].copy_from_slice(&packet.payload()[start..start + chunk]);
            copied += chunk;
        }
        Ok(copied)
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        let packets: Vec<Packet> = self.packets.iter_mut().filter_map(Option::take).collect();
        if !packets.is_empty() {
            self.driver.release_packets(packets);
        }
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("raw_len", &self.raw_len)
            .field("occupied", &self.occupied)
            .field("slots", &self.packets.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::fake::FakeNetwork;
    use crate::protocol::DataHeader;

    fn test_message(raw_len: u32) -> Message {
        let network = FakeNetwork::new();
        let driver: Arc<dyn Driver> = Arc::new(network.new_driver());
        Message::new(driver, DataHeader::WIRE_SIZE as u16, raw_len).unwrap()
    }

    fn data_packet(message: &Message, fill: u8) -> Packet {
        let mut packet = message.driver.alloc_packet();
        let len = packet.capacity();
        packet.payload_mut().fill(fill);
        packet.set_len(len);
        packet
    }

    #[test]
    fn slots_sized_from_raw_length() {
        let message = test_message(1420);
        // 1500 - 27 = 1473 data bytes per packet.
        assert_eq!(message.packet_data_length(), 1473);
        assert_eq!(message.slot_count(), 1);

        let message = test_message(1474);
        assert_eq!(message.slot_count(), 2);
    }

    #[test]
    fn duplicate_slot_rejected() {
        let mut message = test_message(4000);
        let first = data_packet(&message, 0xAA);
        let second = data_packet(&message, 0xBB);

        assert!(message.set_packet(1, first).is_ok());
        assert_eq!(message.num_packets(), 1);

        // Same slot again: packet comes back for release.
        let rejected = message.set_packet(1, second);
        assert!(rejected.is_err());
        assert_eq!(message.num_packets(), 1);
    }

    #[test]
    fn out_of_range_slot_rejected() {
        let mut message = test_message(100);
        let packet = data_packet(&message, 0);
        assert!(message.set_packet(9, packet).is_err());
        assert_eq!(message.num_packets(), 0);
    }

    #[test]
    fn occupancy_matches_distinct_sets() {
        let mut message = test_message(5000);
        for index in [3u16, 0, 2, 3, 0] {
            let _ = message.set_packet(index, data_packet(&message, index as u8));
        }
        // Five attempts, three distinct indices.
        assert_eq!(message.num_packets(), 3);
        let popcount: u32 = message.occupancy.iter().map(|w| w.count_ones()).sum();
        assert_eq!(popcount, 3);
    }

    #[test]
    fn over_count_bounded_by_one_packet() {
        let mut message = test_message(2000);
        for index in 0..message.slot_count() {
            message
                .set_packet(index, data_packet(&message, 0))
                .unwrap();
        }
        let counted = message.num_packets() * message.packet_data_length();
        assert!(counted >= message.raw_length());
        assert!(counted - message.raw_length() < message.packet_data_length());
    }

    #[test]
    fn header_then_append_then_read_back() {
        let mut message = test_message(0);
        message.reserve_header().unwrap();
        assert_eq!(message.raw_length(), MessageHeader::WIRE_SIZE as u32);

        let header = MessageHeader {
            reply_address: [9, 8, 7, 6, 5, 4, 3, 2],
        };
        message.set_header(&header).unwrap();

        let body = vec![0x5Au8; 3000];
        message.append(&body).unwrap();
        assert_eq!(
            message.raw_length(),
            MessageHeader::WIRE_SIZE as u32 + 3000
        );
        assert_eq!(message.num_packets(), 3);

        assert_eq!(message.header().unwrap(), header);
        let mut out = vec![0u8; 3000];
        let copied = message
            .copy_out(MessageHeader::WIRE_SIZE as u32, &mut out)
            .unwrap();
        assert_eq!(copied, 3000);
        assert_eq!(out, body);
    }

    #[test]
    fn copy_out_reports_missing_packets() {
        let message = test_message(3000);
        let mut out = [0u8; 16];
        assert_eq!(
            message.copy_out(0, &mut out),
            Err(MessageError::MissingPacket(0))
        );
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Outbound message transmission.
//!
//! The sender owns the set of messages in flight and pushes their packets
//! to the driver in strictly ascending index order, never past the grant
//! watermark. An initial unscheduled allowance lets a message start before
//! its first GRANT arrives; after that, GRANT packets advance the
//! watermark and DONE packets mark acknowledged completion.
//!
//! GRANTs and DONEs for unknown ids are dropped silently: the peer may be
//! answering a message this side already tore down.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::driver::{Address, Driver, Packet};
use crate::message::Message;
use crate::pool::Handle;
use crate::protocol::{DataHeader, DoneHeader, GrantHeader, MessageId};

/// A message being transmitted.
///
/// Shared between the owning operation (which builds the payload) and the
/// sender (which drives transmission).
pub struct OutboundMessage {
    sent: AtomicBool,
    done: AtomicBool,
    expect_ack: AtomicBool,
    inner: Mutex<OutboundInner>,
}

pub(crate) struct OutboundInner {
    pub(crate) id: Option<MessageId>,
    pub(crate) destination: Option<Address>,
    pub(crate) message: Option<Message>,
    /// Exclusive packet index transmission may proceed to.
    pub(crate) grant_index: u32,
    /// Next packet index to transmit.
    pub(crate) sent_index: u32,
}

impl OutboundMessage {
    pub(crate) fn new() -> Self {
        Self {
            sent: AtomicBool::new(false),
            done: AtomicBool::new(false),
            expect_ack: AtomicBool::new(false),
            inner: Mutex::new(OutboundInner {
                id: None,
                destination: None,
                message: None,
                grant_index: 0,
                sent_index: 0,
            }),
        }
    }

    /// True once the last packet has been pushed to the driver.
    #[must_use]
    pub fn is_sent(&self) -> bool {
        self.sent.load(Ordering::Acquire)
    }

    /// True once a matching DONE has arrived.
    #[must_use]
    pub fn is_acked(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// True when this message needs nothing further from the network:
    /// acknowledged, or fully sent with no acknowledgment expected.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
            || (self.sent.load(Ordering::Acquire) && !self.expect_ack.load(Ordering::Acquire))
    }

    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, OutboundInner> {
        self.inner.lock()
    }
}

struct OutboundEntry {
    message: Arc<OutboundMessage>,
    op: Handle,
}

struct SenderState {
    outbound: HashMap<MessageId, OutboundEntry>,
    /// Ids with transmission potentially pending, in send order.
    sending: VecDeque<MessageId>,
}

/// Owns outbound messages and paces them against grants.
pub struct Sender {
    driver: Arc<dyn Driver>,
    unscheduled_limit: u32,
    state: Mutex<SenderState>,
}

impl Sender {
    /// Create a sender with the given unscheduled packet allowance.
    pub fn new(driver: Arc<dyn Driver>, unscheduled_limit: u32) -> Self {
        Self {
            driver,
            unscheduled_limit: unscheduled_limit.max(1),
            state: Mutex::new(SenderState {
                outbound: HashMap::new(),
                sending: VecDeque::new(),
            }),
        }
    }

    /// Enqueue a message for transmission.
    ///
    /// Writes the wire data header into every packet, seeds the grant
    /// watermark with the unscheduled allowance, and pushes what it can
    /// immediately. With `expect_ack` the message completes only on DONE;
    /// otherwise pushing the last byte completes it.
    pub fn send_message(
        &self,
        id: MessageId,
        destination: Address,
        op: Handle,
        outbound: &Arc<OutboundMessage>,
        expect_ack: bool,
    ) {
        outbound.expect_ack.store(expect_ack, Ordering::Release);
        {
            let mut inner = outbound.lock();
            let inner = &mut *inner;
            let Some(message) = inner.message.as_mut() else {
                log::warn!("[sender] send_message {:?} without a built message", id);
                return;
            };
            let total_length = message.raw_length();
            for index in 0..message.slot_count() {
                let header = DataHeader {
                    message_id: id,
                    index,
                    total_length,
                };
                if let Some(packet) = message.packet_mut(index) {
                    // Encode cannot fail: the reserved region is always
                    // large enough for the data header.
                    let _ = header.encode(packet.payload_mut());
                    packet.address = Some(destination);
                }
            }
            inner.id = Some(id);
            inner.destination = Some(destination);
            inner.grant_index = self.unscheduled_limit;
            inner.sent_index = 0;
        }

        let mut state = self.state.lock();
        state.outbound.insert(
            id,
            OutboundEntry {
                message: Arc::clone(outbound),
                op,
            },
        );
        state.sending.push_back(id);
        log::debug!(
            "[sender] queued {:?} to {} expect_ack={}",
            id,
            destination,
            expect_ack
        );
        self.transmit(&state, id);
        self.finish_sent(&mut state, id);
    }

    /// Advance the grant watermark for the addressed message.
    ///
    /// Returns the op handle when the grant let the message finish sending.
    pub fn handle_grant_packet(&self, packet: Packet) -> Option<Handle> {
        let header = match GrantHeader::decode(packet.payload()) {
            Ok((header, _)) => header,
            Err(e) => {
                log::warn!("[sender] malformed grant packet: {}", e);
                self.driver.release_packets(vec![packet]);
                return None;
            }
        };
        self.driver.release_packets(vec![packet]);

        let mut state = self.state.lock();
        let entry = state.outbound.get(&header.message_id)?;
        {
            let mut inner = entry.message.lock();
            if header.packet_index > inner.grant_index {
                inner.grant_index = header.packet_index;
            }
        }
        let newly_sent = self.transmit(&state, header.message_id);
        self.finish_sent(&mut state, header.message_id);
        newly_sent
    }

    /// Mark the addressed message acknowledged.
    ///
    /// Returns the op handle so the caller can revisit its state machine.
    /// Unknown or duplicate DONEs are dropped.
    pub fn handle_done_packet(&self, packet: Packet) -> Option<Handle> {
        let header = match DoneHeader::decode(packet.payload()) {
            Ok((header, _)) => header,
            Err(e) => {
                log::warn!("[sender] malformed done packet: {}", e);
                self.driver.release_packets(vec![packet]);
                return None;
            }
        };
        self.driver.release_packets(vec![packet]);

        let mut state = self.state.lock();
        let entry = state.outbound.remove(&header.message_id)?;
        state.sending.retain(|id| *id != header.message_id);
        entry.message.done.store(true, Ordering::Release);
        log::debug!("[sender] {:?} acknowledged", header.message_id);
        Some(entry.op)
    }

    /// Push any packets newly covered by grant watermarks.
    ///
    /// Returns op handles whose messages finished sending this tick.
    pub fn poll(&self) -> Vec<Handle> {
        let mut state = self.state.lock();
        let ids: Vec<MessageId> = state.sending.iter().copied().collect();
        let mut finished = Vec::new();
        for id in ids {
            if let Some(op) = self.transmit(&state, id) {
                finished.push(op);
            }
            self.finish_sent(&mut state, id);
        }
        finished
    }

    /// Sever a message whose op is being reclaimed.
    pub fn drop_message(&self, id: MessageId) {
        let mut state = self.state.lock();
        if state.outbound.remove(&id).is_some() {
            state.sending.retain(|queued| *queued != id);
            log::trace!("[sender] dropped {:?}", id);
        }
    }

    /// Transmit granted-but-unsent packets of `id` in ascending order.
    /// Returns the op handle when this call pushed the final packet.
    fn transmit(&self, state: &SenderState, id: MessageId) -> Option<Handle> {
        let entry = state.outbound.get(&id)?;
        let mut guard = entry.message.lock();
        let inner = &mut *guard;
        let message = inner.message.as_mut()?;

        let total = u32::from(message.slot_count());
        let limit = inner.grant_index.min(total);
        if inner.sent_index >= limit {
            return None;
        }

        let mut batch = Vec::with_capacity((limit - inner.sent_index) as usize);
        while inner.sent_index < limit {
            if let Some(packet) = message.take_packet(inner.sent_index as u16) {
                batch.push(packet);
            }
            inner.sent_index += 1;
        }
        let fully_sent = inner.sent_index >= total;
        drop(guard);

        if !batch.is_empty() {
            log::trace!("[sender] {:?}: pushing {} packets", id, batch.len());
            self.driver.send_packets(batch);
        }

        if fully_sent && !entry.message.sent.swap(true, Ordering::AcqRel) {
            return Some(entry.op);
        }
        None
    }

    /// Forget fully-sent messages that expect no acknowledgment, and stop
    /// polling ones that only wait for DONE.
    fn finish_sent(&self, state: &mut SenderState, id: MessageId) {
        let Some(entry) = state.outbound.get(&id) else {
            return;
        };
        if !entry.message.is_sent() {
            return;
        }
        state.sending.retain(|queued| *queued != id);
        if !entry.message.expect_ack.load(Ordering::Acquire) {
            state.outbound.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::fake::FakeNetwork;
    use crate::protocol::OpId;

    const UNSCHEDULED: u32 = 2;

    struct Fixture {
        sender: Sender,
        driver: Arc<dyn Driver>,
        remote: Arc<dyn Driver>,
    }

    fn fixture() -> Fixture {
        let network = FakeNetwork::new();
        let driver: Arc<dyn Driver> = Arc::new(network.new_driver());
        let remote: Arc<dyn Driver> = Arc::new(network.new_driver());
        Fixture {
            sender: Sender::new(Arc::clone(&driver), UNSCHEDULED),
            driver,
            remote,
        }
    }

    fn id(sequence: u64) -> MessageId {
        MessageId::new(
            OpId {
                transport_id: 7,
                sequence,
            },
            crate::protocol::INITIAL_REQUEST_TAG,
        )
    }

    fn outbound(driver: &Arc<dyn Driver>, body_len: usize) -> Arc<OutboundMessage> {
        let out = Arc::new(OutboundMessage::new());
        let mut message =
            Message::new(Arc::clone(driver), DataHeader::WIRE_SIZE as u16, 0).unwrap();
        message.reserve_header().unwrap();
        message.append(&vec![0x42u8; body_len]).unwrap();
        out.lock().message = Some(message);
        out
    }

    fn op_handle(n: u32) -> Handle {
        // Handles only need to be distinct tokens here.
        let pool: crate::pool::Pool<u32> = crate::pool::Pool::new();
        let mut handle = None;
        for _ in 0..=n {
            handle = Some(pool.insert_with(|_| 0).0);
        }
        handle.unwrap()
    }

    fn received_indices(remote: &Arc<dyn Driver>) -> Vec<u16> {
        let mut packets = Vec::new();
        remote.receive_packets(64, &mut packets);
        packets
            .iter()
            .map(|p| DataHeader::decode(p.payload()).unwrap().0.index)
            .collect()
    }

    #[test]
    fn unscheduled_packets_flow_immediately() {
        let f = fixture();
        let out = outbound(&f.driver, 6000); // 5 packets
        f.sender.send_message(
            id(1),
            f.remote.local_address(),
            op_handle(0),
            &out,
            false,
        );

        assert_eq!(received_indices(&f.remote), vec![0, 1]);
        assert!(!out.is_sent());
    }

    #[test]
    fn grants_release_packets_in_ascending_order() {
        let f = fixture();
        let out = outbound(&f.driver, 6000); // 5 packets
        f.sender.send_message(
            id(1),
            f.remote.local_address(),
            op_handle(0),
            &out,
            false,
        );
        received_indices(&f.remote);

        let mut grant = f.driver.alloc_packet();
        let n = GrantHeader {
            message_id: id(1),
            packet_index: 4,
        }
        .encode(grant.payload_mut())
        .unwrap();
        grant.set_len(n);
        let newly_sent = f.sender.handle_grant_packet(grant);
        assert!(newly_sent.is_none());
        assert_eq!(received_indices(&f.remote), vec![2, 3]);

        // Grant past the end finishes the message.
        let mut grant = f.driver.alloc_packet();
        let n = GrantHeader {
            message_id: id(1),
            packet_index: 100,
        }
        .encode(grant.payload_mut())
        .unwrap();
        grant.set_len(n);
        let newly_sent = f.sender.handle_grant_packet(grant);
        assert!(newly_sent.is_some());
        assert_eq!(received_indices(&f.remote), vec![4]);
        assert!(out.is_sent());
        assert!(out.is_done());
    }

    #[test]
    fn stale_grant_does_not_rewind() {
        let f = fixture();
        let out = outbound(&f.driver, 6000);
        f.sender.send_message(
            id(1),
            f.remote.local_address(),
            op_handle(0),
            &out,
            false,
        );
        received_indices(&f.remote);

        let mut grant = f.driver.alloc_packet();
        let n = GrantHeader {
            message_id: id(1),
            packet_index: 1, // below the unscheduled watermark
        }
        .encode(grant.payload_mut())
        .unwrap();
        grant.set_len(n);
        assert!(f.sender.handle_grant_packet(grant).is_none());
        assert!(received_indices(&f.remote).is_empty());
    }

    #[test]
    fn unknown_grant_and_done_ignored() {
        let f = fixture();

        let mut grant = f.driver.alloc_packet();
        let n = GrantHeader {
            message_id: id(99),
            packet_index: 4,
        }
        .encode(grant.payload_mut())
        .unwrap();
        grant.set_len(n);
        assert!(f.sender.handle_grant_packet(grant).is_none());

        let mut done = f.driver.alloc_packet();
        let n = DoneHeader {
            message_id: id(99),
        }
        .encode(done.payload_mut())
        .unwrap();
        done.set_len(n);
        assert!(f.sender.handle_done_packet(done).is_none());
    }

    #[test]
    fn done_completes_acked_send() {
        let f = fixture();
        let out = outbound(&f.driver, 100); // single packet
        let op = op_handle(3);
        f.sender
            .send_message(id(1), f.remote.local_address(), op, &out, true);

        assert!(out.is_sent());
        assert!(!out.is_done()); // waiting for DONE

        let mut done = f.driver.alloc_packet();
        let n = DoneHeader { message_id: id(1) }
            .encode(done.payload_mut())
            .unwrap();
        done.set_len(n);
        assert_eq!(f.sender.handle_done_packet(done), Some(op));
        assert!(out.is_acked());
        assert!(out.is_done());

        // Duplicate DONE finds nothing.
        let mut done = f.driver.alloc_packet();
        let n = DoneHeader { message_id: id(1) }
            .encode(done.payload_mut())
            .unwrap();
        done.set_len(n);
        assert!(f.sender.handle_done_packet(done).is_none());
    }

    #[test]
    fn unacked_send_completes_on_last_byte() {
        let f = fixture();
        let out = outbound(&f.driver, 100);
        let op = op_handle(1);
        f.sender
            .send_message(id(1), f.remote.local_address(), op, &out, false);

        assert!(out.is_sent());
        assert!(out.is_done());
        // Entry retired: a later grant for it is silently ignored.
        let mut grant = f.driver.alloc_packet();
        let n = GrantHeader {
            message_id: id(1),
            packet_index: 8,
        }
        .encode(grant.payload_mut())
        .unwrap();
        grant.set_len(n);
        assert!(f.sender.handle_grant_packet(grant).is_none());
    }

    #[test]
    fn poll_is_idempotent_when_nothing_granted() {
        let f = fixture();
        let out = outbound(&f.driver, 6000);
        f.sender.send_message(
            id(1),
            f.remote.local_address(),
            op_handle(0),
            &out,
            false,
        );
        received_indices(&f.remote);

        assert!(f.sender.poll().is_empty());
        assert!(f.sender.poll().is_empty());
        assert!(received_indices(&f.remote).is_empty());
    }
}

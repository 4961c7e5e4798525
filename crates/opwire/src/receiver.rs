// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Inbound message reassembly.
//!
//! Every DATA packet is routed to an [`InboundMessage`], looked up in this
//! order: messages registered to an operation, then unregistered messages,
//! then a fresh one (which also joins the received-messages FIFO for the
//! transport to adopt or drop).
//!
//! Lock protocol: the message's own mutex is acquired *before* the
//! receiver mutex is released, so a concurrent `drop_message` cannot tear
//! the message down between lookup and use. Lock order is always
//! receiver -> message; nothing here takes them the other way around.
//!
//! Duplicates are idempotent at two levels: a packet for an
//! already-complete message and a packet for an occupied slot are both
//! returned to the driver without notifying the scheduler.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::driver::{Address, Driver, Packet};
use crate::message::Message;
use crate::pool::{Handle, Pool};
use crate::protocol::{DataHeader, MessageHeader, MessageId};
use crate::scheduler::Scheduler;

/// A message being reassembled from DATA packets.
pub struct InboundMessage {
    id: MessageId,
    handle: Handle,
    full_received: AtomicBool,
    inner: Mutex<InboundInner>,
}

struct InboundInner {
    message: Option<Message>,
    source: Option<Address>,
}

impl InboundMessage {
    fn new(id: MessageId, handle: Handle) -> Self {
        Self {
            id,
            handle,
            full_received: AtomicBool::new(false),
            inner: Mutex::new(InboundInner {
                message: None,
                source: None,
            }),
        }
    }

    /// Identifier of this message.
    #[must_use]
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// True once every byte of the message has arrived. Sticky.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.full_received.load(Ordering::Acquire)
    }

    /// Where the message came from, once the first packet has arrived.
    #[must_use]
    pub fn source(&self) -> Option<Address> {
        self.inner.lock().source
    }

    /// Declared raw length, once the first packet has arrived.
    #[must_use]
    pub fn raw_length(&self) -> Option<u32> {
        self.inner.lock().message.as_ref().map(Message::raw_length)
    }

    /// The application header carried at the front of the message.
    pub fn header(&self) -> Option<MessageHeader> {
        self.inner
            .lock()
            .message
            .as_ref()
            .and_then(|m| m.header().ok())
    }

    /// Copy application payload (after the header) into `out`.
    ///
    /// Returns the number of bytes copied; zero if nothing has arrived.
    pub fn copy_payload(&self, offset: u32, out: &mut [u8]) -> usize {
        let inner = self.inner.lock();
        let Some(message) = inner.message.as_ref() else {
            return 0;
        };
        message
            .copy_out(MessageHeader::WIRE_SIZE as u32 + offset, out)
            .unwrap_or(0)
    }

    /// Application payload length (raw length minus the header).
    #[must_use]
    pub fn payload_length(&self) -> u32 {
        self.raw_length()
            .unwrap_or(0)
            .saturating_sub(MessageHeader::WIRE_SIZE as u32)
    }

    /// Number of packet slots currently occupied.
    #[must_use]
    pub fn packets_received(&self) -> u32 {
        let inner = self.inner.lock();
        inner.message.as_ref().map_or(0, Message::num_packets)
    }
}

struct RegisteredEntry {
    message: Arc<InboundMessage>,
    op: Handle,
}

struct ReceiverState {
    registered: HashMap<MessageId, RegisteredEntry>,
    unregistered: HashMap<MessageId, Arc<InboundMessage>>,
    received: VecDeque<Arc<InboundMessage>>,
}

/// Owns inbound messages and assembles them from DATA packets.
pub struct Receiver {
    driver: Arc<dyn Driver>,
    scheduler: Arc<dyn Scheduler>,
    pool: Pool<InboundMessage>,
    state: Mutex<ReceiverState>,
}

impl Receiver {
    /// Create a receiver feeding the given scheduler.
    pub fn new(driver: Arc<dyn Driver>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            driver,
            scheduler,
            pool: Pool::new(),
            state: Mutex::new(ReceiverState {
                registered: HashMap::new(),
                unregistered: HashMap::new(),
                received: VecDeque::new(),
            }),
        }
    }

    /// Process an incoming DATA packet.
    ///
    /// Returns the handle of the registered op if and only if this packet
    /// completed the message it belongs to.
    pub fn handle_data_packet(&self, packet: Packet) -> Option<Handle> {
        let header = match DataHeader::decode(packet.payload()) {
            Ok((header, _)) => header,
            Err(e) => {
                log::warn!("[receiver] malformed data packet: {}", e);
                self.driver.release_packets(vec![packet]);
                return None;
            }
        };
        let id = header.message_id;

        let message: Arc<InboundMessage>;
        let op: Option<Handle>;
        let mut inner;
        {
            let mut state = self.state.lock();
            if let Some(entry) = state.registered.get(&id) {
                message = Arc::clone(&entry.message);
                op = Some(entry.op);
            } else if let Some(existing) = state.unregistered.get(&id) {
                message = Arc::clone(existing);
                op = None;
            } else {
                let (_, fresh) = self.pool.insert_with(|handle| InboundMessage::new(id, handle));
                state.unregistered.insert(id, Arc::clone(&fresh));
                state.received.push_back(Arc::clone(&fresh));
                log::debug!("[receiver] new inbound message {:?}", id);
                message = fresh;
                op = None;
            }
            // Take the message lock before the receiver lock goes away so
            // a concurrent drop cannot slip in between.
            inner = message.inner.lock();
        }

        if inner.message.is_none() {
            let assembled = match Message::new(
                Arc::clone(&self.driver),
                DataHeader::WIRE_SIZE as u16,
                header.total_length,
            ) {
                Ok(assembled) => assembled,
                Err(e) => {
                    log::warn!("[receiver] cannot assemble {:?}: {}", id, e);
                    self.driver.release_packets(vec![packet]);
                    return None;
                }
            };
            inner.message = Some(assembled);
            // The packet's source is the stable resolved address; cache it
            // on first arrival.
            inner.source = packet.address;
        }

        if message.full_received.load(Ordering::Acquire) {
            // Duplicate after completion.
            self.driver.release_packets(vec![packet]);
            return None;
        }

        let Some(assembled) = inner.message.as_mut() else {
            self.driver.release_packets(vec![packet]);
            return None;
        };
        debug_assert_eq!(assembled.raw_length(), header.total_length);

        match assembled.set_packet(header.index, packet) {
            Ok(()) => {}
            Err(duplicate) => {
                log::trace!("[receiver] duplicate packet {} for {:?}", header.index, id);
                self.driver.release_packets(vec![duplicate]);
                return None;
            }
        }

        // Over-counts when the last packet is short; once that packet has
        // arrived no further grants are needed anyway.
        let total_received = assembled.num_packets() * assembled.packet_data_length();
        let raw_length = assembled.raw_length();
        if let Some(source) = inner.source {
            self.scheduler
                .packet_received(id, source, raw_length, total_received);
        } else {
            log::warn!("[receiver] {:?} has no source address", id);
        }

        if total_received >= raw_length {
            message.full_received.store(true, Ordering::Release);
            log::debug!("[receiver] {:?} fully received", id);
            op
        } else {
            None
        }
    }

    /// Pop the next inbound message nobody has registered for.
    ///
    /// The message may still be partially received; packets keep flowing
    /// into it until it is dropped or registered.
    pub fn receive_message(&self) -> Option<Arc<InboundMessage>> {
        self.state.lock().received.pop_front()
    }

    /// Discard an unregistered inbound message and reclaim its resources.
    pub fn drop_message(&self, message: &Arc<InboundMessage>) {
        let mut state = self.state.lock();
        // Settle any in-flight packet handler before tearing down.
        let _inner = message.inner.lock();
        state.unregistered.remove(&message.id);
        state.received.retain(|queued| queued.id != message.id);
        self.pool.remove(message.handle);
    }

    /// Expect a message with `id` and accumulate it for `op`.
    ///
    /// An existing unregistered message transfers to the op (and leaves
    /// the received FIFO); otherwise an empty one is created. Returns the
    /// message so the caller can link it into the op.
    pub fn register_op(&self, id: MessageId, op: Handle) -> Arc<InboundMessage> {
        let mut state = self.state.lock();
        let message = match state.unregistered.remove(&id) {
            Some(existing) => {
                state.received.retain(|queued| queued.id != id);
                existing
            }
            None => {
                let (_, fresh) = self.pool.insert_with(|handle| InboundMessage::new(id, handle));
                fresh
            }
        };
        state.registered.insert(
            id,
            RegisteredEntry {
                message: Arc::clone(&message),
                op,
            },
        );
        log::trace!("[receiver] registered {:?}", id);
        message
    }

    /// Sever the registered message with `id` from its op and reclaim it.
    pub fn drop_op(&self, id: MessageId) {
        let mut state = self.state.lock();
        if let Some(entry) = state.registered.remove(&id) {
            let _inner = entry.message.inner.lock();
            self.pool.remove(entry.message.handle);
        }
    }

    /// Reserved for incremental background work; currently nothing to do.
    pub fn poll(&self) {}

    /// Number of inbound messages alive in the pool.
    #[must_use]
    pub fn live_messages(&self) -> usize {
        self.pool.outstanding()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::fake::FakeNetwork;

    /// Scheduler stub that records every notification.
    #[derive(Default)]
    struct RecordingScheduler {
        calls: Mutex<Vec<(MessageId, u32, u32)>>,
    }

    impl Scheduler for RecordingScheduler {
        fn packet_received(
            &self,
            id: MessageId,
            _source: Address,
            message_length: u32,
            total_received_bytes: u32,
        ) {
            self.calls
                .lock()
                .push((id, message_length, total_received_bytes));
        }
    }

    struct Fixture {
        receiver: Receiver,
        scheduler: Arc<RecordingScheduler>,
        driver: Arc<dyn Driver>,
        op_pool: Pool<u32>,
    }

    fn fixture() -> Fixture {
        let network = FakeNetwork::new();
        let driver: Arc<dyn Driver> = Arc::new(network.new_driver());
        let scheduler = Arc::new(RecordingScheduler::default());
        Fixture {
            receiver: Receiver::new(Arc::clone(&driver), scheduler.clone()),
            scheduler,
            driver,
            op_pool: Pool::new(),
        }
    }

    fn test_id() -> MessageId {
        MessageId {
            transport_id: 42,
            sequence: 32,
            tag: 22,
        }
    }

    /// Build a DATA packet for `id` carrying packet `index` of a message
    /// with `total_length` raw bytes.
    fn data_packet(
        driver: &Arc<dyn Driver>,
        id: MessageId,
        index: u16,
        total_length: u32,
    ) -> Packet {
        let mut packet = driver.alloc_packet();
        let header = DataHeader {
            message_id: id,
            index,
            total_length,
        };
        let n = header.encode(packet.payload_mut()).unwrap();
        let data_len = (driver.max_payload_size() as usize - n)
            .min(total_length as usize - index as usize * (driver.max_payload_size() as usize - n));
        packet.set_len(n + data_len);
        packet.address = Some(Address::from_raw(&[7, 0, 0, 0, 0, 0, 0, 0]));
        packet
    }

    #[test]
    fn register_then_receive_and_complete() {
        let f = fixture();
        let id = test_id();
        let (op, _) = f.op_pool.insert_with(|_| 0);

        let message = f.receiver.register_op(id, op);
        assert!(!message.is_ready());

        // Second packet of a two-packet message arrives first.
        let result = f
            .receiver
            .handle_data_packet(data_packet(&f.driver, id, 1, 1473 + 100));
        assert!(result.is_none());
        assert_eq!(message.packets_received(), 1);
        assert!(!message.is_ready());

        // First packet completes it; the op handle comes back.
        let result = f
            .receiver
            .handle_data_packet(data_packet(&f.driver, id, 0, 1473 + 100));
        assert_eq!(result, Some(op));
        assert!(message.is_ready());

        // Replay after completion: dropped, no further notification.
        let calls_before = f.scheduler.calls.lock().len();
        let result = f
            .receiver
            .handle_data_packet(data_packet(&f.driver, id, 0, 1473 + 100));
        assert!(result.is_none());
        assert_eq!(f.scheduler.calls.lock().len(), calls_before);
        assert!(message.is_ready());
    }

    #[test]
    fn duplicate_mid_message_not_counted() {
        let f = fixture();
        let id = test_id();
        let (op, _) = f.op_pool.insert_with(|_| 0);
        let message = f.receiver.register_op(id, op);

        let total = 1473 * 3;
        assert!(f
            .receiver
            .handle_data_packet(data_packet(&f.driver, id, 1, total))
            .is_none());
        assert_eq!(f.scheduler.calls.lock().len(), 1);

        // Same index again: released, scheduler untouched, still partial.
        assert!(f
            .receiver
            .handle_data_packet(data_packet(&f.driver, id, 1, total))
            .is_none());
        assert_eq!(f.scheduler.calls.lock().len(), 1);
        assert!(!message.is_ready());
        assert_eq!(message.packets_received(), 1);
    }

    #[test]
    fn unregistered_message_then_register_transfers_ownership() {
        let f = fixture();
        let id = test_id();

        assert!(f
            .receiver
            .handle_data_packet(data_packet(&f.driver, id, 0, 100))
            .is_none());

        // The message shows up on the FIFO exactly once.
        let queued = f.receiver.receive_message().expect("message on FIFO");
        assert_eq!(queued.id(), id);
        assert!(f.receiver.receive_message().is_none());

        // Registration adopts the same message object.
        let (op, _) = f.op_pool.insert_with(|_| 0);
        let adopted = f.receiver.register_op(id, op);
        assert!(Arc::ptr_eq(&queued, &adopted));

        // The transfer preserves everything already assembled.
        assert!(adopted.is_ready());
    }

    #[test]
    fn register_removes_from_fifo() {
        let f = fixture();
        let id = test_id();

        assert!(f
            .receiver
            .handle_data_packet(data_packet(&f.driver, id, 1, 1473 * 4))
            .is_none());

        let (op, _) = f.op_pool.insert_with(|_| 0);
        let _adopted = f.receiver.register_op(id, op);

        // Registered before the transport saw it: the FIFO entry is gone.
        assert!(f.receiver.receive_message().is_none());
    }

    #[test]
    fn drop_message_reclaims() {
        let f = fixture();
        let id = test_id();

        f.receiver
            .handle_data_packet(data_packet(&f.driver, id, 0, 50));
        assert_eq!(f.receiver.live_messages(), 1);

        let message = f.receiver.receive_message().unwrap();
        f.receiver.drop_message(&message);
        assert_eq!(f.receiver.live_messages(), 0);

        // A retransmit recreates it from scratch.
        f.receiver
            .handle_data_packet(data_packet(&f.driver, id, 0, 50));
        assert_eq!(f.receiver.live_messages(), 1);
    }

    #[test]
    fn source_cached_from_first_packet() {
        let f = fixture();
        let id = test_id();
        let (op, _) = f.op_pool.insert_with(|_| 0);
        let message = f.receiver.register_op(id, op);

        f.receiver
            .handle_data_packet(data_packet(&f.driver, id, 0, 50));
        assert_eq!(
            message.source(),
            Some(Address::from_raw(&[7, 0, 0, 0, 0, 0, 0, 0]))
        );
    }

    #[test]
    fn malformed_packet_released_without_effect() {
        let f = fixture();
        let mut packet = f.driver.alloc_packet();
        packet.set_len(3); // too short for any header
        assert!(f.receiver.handle_data_packet(packet).is_none());
        assert_eq!(f.receiver.live_messages(), 0);
    }
}

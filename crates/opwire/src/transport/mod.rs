// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Top-level transport: polling, dispatch, and the operation API.
//!
//! One poll tick runs four phases, strictly in order:
//!
//! 1. `process_packets` - drain a batch from the driver and dispatch each
//!    packet by opcode (DATA to the receiver, GRANT/DONE to the sender),
//!    then let sender and receiver make progress.
//! 2. `process_inbound_messages` - adopt unclaimed inbound requests as
//!    server ops; drop unclaimed responses.
//! 3. `check_for_updates` - drain the hint queue, re-running each hinted
//!    op's state machine.
//! 4. `cleanup_ops` - reclaim destroyed ops.
//!
//! Polling threads call [`Transport::poll`] repeatedly; application
//! threads use the operation API concurrently on distinct ops. Concurrent
//! calls on the *same* op are not supported.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::TransportConfig;
use crate::driver::{Address, Driver, Packet};
use crate::op::{OpContext, OpInner, OpState};
use crate::pool::{Handle, Pool};
use crate::protocol::{
    peek_opcode, DoneHeader, MessageHeader, MessageId, Opcode, OpId, INITIAL_REQUEST_TAG,
    ULTIMATE_RESPONSE_TAG,
};
use crate::receiver::Receiver;
use crate::scheduler::GrantScheduler;
use crate::sender::Sender;


/// Hint set: O(1) membership, FIFO drain, re-insertion is a no-op.
#[derive(Default)]
struct HintQueue {
    members: HashSet<Handle>,
    order: VecDeque<Handle>,
}

impl HintQueue {
    fn push(&mut self, handle: Handle) {
        if self.members.insert(handle) {
            self.order.push_back(handle);
        }
    }

    fn pop(&mut self) -> Option<Handle> {
        let handle = self.order.pop_front()?;
        self.members.remove(&handle);
        Some(handle)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        debug_assert_eq!(self.members.len(), self.order.len());
        self.order.len()
    }
}

/// Message transport instance.
pub struct Transport {
    driver: Arc<dyn Driver>,
    transport_id: u64,
    config: TransportConfig,
    next_op_sequence: AtomicU64,
    sender: Sender,
    receiver: Receiver,
    op_pool: Pool<OpContext>,
    active_ops: Mutex<HashSet<Handle>>,
    pending_server_ops: Mutex<VecDeque<Handle>>,
    update_hints: Mutex<HintQueue>,
    unused_ops: Mutex<VecDeque<Handle>>,
}

impl Transport {
    /// Create a transport over `driver` with the given peer-unique id.
    pub fn new(driver: Arc<dyn Driver>, transport_id: u64, config: TransportConfig) -> Self {
        let scheduler = Arc::new(GrantScheduler::new(Arc::clone(&driver), &config));
        let sender = Sender::new(Arc::clone(&driver), config.unscheduled_limit(driver.as_ref()));
        let receiver = Receiver::new(Arc::clone(&driver), scheduler);
        log::info!("[transport] {} up", transport_id);
        Self {
            driver,
            transport_id,
            config,
            next_op_sequence: AtomicU64::new(1),
            sender,
            receiver,
            op_pool: Pool::new(),
            active_ops: Mutex::new(HashSet::new()),
            pending_server_ops: Mutex::new(VecDeque::new()),
            update_hints: Mutex::new(HintQueue::default()),
            unused_ops: Mutex::new(VecDeque::new()),
        }
    }

    /// The driver this transport rides on.
    #[must_use]
    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// This transport's peer-unique id.
    #[must_use]
    pub fn transport_id(&self) -> u64 {
        self.transport_id
    }

    // ========================================================================
    // Operation API
    // ========================================================================

    /// Allocate a client-role op, ready for payload building.
    pub fn alloc_op(&self) -> Arc<OpContext> {
        let (handle, op) = self.op_pool.insert_with(|h| OpContext::new(h, false));
        if let Err(e) = op.prepare_out_message(&self.driver) {
            log::error!("[transport] cannot build outbound message: {}", e);
        }
        op.set_retained(true);
        self.active_ops.lock().insert(handle);
        log::trace!("[transport] alloc_op {:?}", handle);
        op
    }

    /// Pop one server op whose request has fully arrived, if any.
    pub fn receive_op(&self) -> Option<Arc<OpContext>> {
        loop {
            let handle = self.pending_server_ops.lock().pop_front()?;
            let Some(op) = self.op_pool.get(handle) else {
                // Reclaimed while queued; skip the stale entry.
                continue;
            };
            if let Err(e) = op.prepare_out_message(&self.driver) {
                log::error!("[transport] cannot build outbound message: {}", e);
            }
            op.set_retained(true);
            log::trace!("[transport] receive_op {:?}", handle);
            return Some(op);
        }
    }

    /// Release the application's hold on an op. Terminal ops are then
    /// reclaimed on a later tick.
    pub fn release_op(&self, op: &Arc<OpContext>) {
        op.set_retained(false);
        self.hint_update(op.handle());
    }

    /// Mark an op failed. The core never does this on its own; the state
    /// exists for upper-layer signalling.
    pub fn fail_op(&self, op: &Arc<OpContext>) {
        if !op.state().is_terminal() {
            op.set_state(OpState::Failed);
            self.hint_update(op.handle());
        }
    }

    /// Send the op's outbound message as a request to `destination`.
    ///
    /// Client ops get a fresh OpId, register for the ultimate response,
    /// and send under the initial-request tag. Server ops chain: the new
    /// request carries the inbound tag plus one and expects a DONE.
    pub fn send_request(&self, op: &Arc<OpContext>, destination: Address) {
        if op.is_server() {
            let in_message = op.in_message();
            let Some(in_message) = in_message else {
                log::warn!("[transport] chained send_request without inbound message");
                return;
            };
            let in_id = in_message.id();
            let id = MessageId::new(in_id.op_id(), in_id.tag + 1);
            // The final reply must reach the original requester, so the
            // chained request carries the inbound reply address onward.
            match in_message.header() {
                Some(header) => {
                    if let Err(e) = op.set_out_header(&header) {
                        log::warn!("[transport] cannot propagate reply address: {}", e);
                    }
                }
                None => log::warn!("[transport] inbound message has no header yet"),
            }
            self.sender
                .send_message(id, destination, op.handle(), op.out_message(), true);
            self.hint_update(op.handle());
        } else {
            let sequence = self.next_op_sequence.fetch_add(1, Ordering::Relaxed);
            let op_id = OpId {
                transport_id: self.transport_id,
                sequence,
            };
            let header = MessageHeader {
                reply_address: self.driver.local_address().to_raw(),
            };
            if let Err(e) = op.set_out_header(&header) {
                log::warn!("[transport] cannot set reply address: {}", e);
            }
            let response_id = MessageId::new(op_id, ULTIMATE_RESPONSE_TAG);
            let in_message = self.receiver.register_op(response_id, op.handle());
            op.inner.lock().in_message = Some(in_message);
            self.sender.send_message(
                MessageId::new(op_id, INITIAL_REQUEST_TAG),
                destination,
                op.handle(),
                op.out_message(),
                false,
            );
            op.set_state(OpState::InProgress);
            self.hint_update(op.handle());
        }
    }

    /// Send the op's outbound message as the final reply of the operation.
    ///
    /// Server-role only. The destination comes from the `reply_address`
    /// field of the inbound request's application header.
    pub fn send_reply(&self, op: &Arc<OpContext>) {
        if !op.is_server() {
            log::warn!("[transport] send_reply on a client op");
            return;
        }
        let Some(in_message) = op.in_message() else {
            log::warn!("[transport] send_reply without inbound message");
            return;
        };
        let Some(header) = in_message.header() else {
            log::warn!("[transport] inbound request has no header");
            return;
        };
        let destination = Address::from_raw(&header.reply_address);
        let id = MessageId::new(in_message.id().op_id(), ULTIMATE_RESPONSE_TAG);
        self.sender
            .send_message(id, destination, op.handle(), op.out_message(), false);
        op.set_state(OpState::InProgress);
        self.hint_update(op.handle());
    }

    /// One tick of transport progress.
    pub fn poll(&self) {
        self.process_packets();
        self.process_inbound_messages();
        self.check_for_updates();
        self.cleanup_ops();
    }

    // ========================================================================
    // Poll phases
    // ========================================================================

    fn process_packets(&self) {
        let mut batch: Vec<Packet> = Vec::with_capacity(self.config.max_packets_per_poll);
        self.driver
            .receive_packets(self.config.max_packets_per_poll, &mut batch);
        for packet in batch {
            match peek_opcode(packet.payload()) {
                Some(Opcode::Data) => {
                    if let Some(handle) = self.receiver.handle_data_packet(packet) {
                        self.hint_update(handle);
                    }
                }
                Some(Opcode::Grant) => {
                    if let Some(handle) = self.sender.handle_grant_packet(packet) {
                        self.hint_update(handle);
                    }
                }
                Some(Opcode::Done) => {
                    if let Some(handle) = self.sender.handle_done_packet(packet) {
                        self.hint_update(handle);
                    }
                }
                None => {
                    log::warn!(
                        "[transport] unknown opcode {:#04x}, dropping packet",
                        packet.payload().first().copied().unwrap_or(0)
                    );
                    self.driver.release_packets(vec![packet]);
                }
            }
        }
        for handle in self.sender.poll() {
            self.hint_update(handle);
        }
        self.receiver.poll();
    }

    fn process_inbound_messages(&self) {
        while let Some(message) = self.receiver.receive_message() {
            let id = message.id();
            if !id.is_request() {
                // A response nobody registered for: the op is long gone.
                log::debug!("[transport] dropping unclaimed response {:?}", id);
                self.receiver.drop_message(&message);
                continue;
            }
            // A request (initial or chained) makes a new server op.
            let (handle, op) = self.op_pool.insert_with(|h| OpContext::new(h, true));
            let adopted = self.receiver.register_op(id, handle);
            debug_assert!(Arc::ptr_eq(&adopted, &message));
            op.inner.lock().in_message = Some(adopted);
            self.active_ops.lock().insert(handle);
            log::debug!("[transport] adopted server op {:?} for {:?}", handle, id);
            self.hint_update(handle);
        }
    }

    fn check_for_updates(&self) {
        loop {
            let Some(handle) = self.update_hints.lock().pop() else {
                break;
            };
            if !self.active_ops.lock().contains(&handle) {
                // Stale hint from a destroyed op.
                continue;
            }
            let Some(op) = self.op_pool.get(handle) else {
                continue;
            };
            let mut inner = op.inner.lock();
            self.process_updates(&op, &mut inner);
        }
    }

    fn cleanup_ops(&self) {
        loop {
            let Some(handle) = self.unused_ops.lock().pop_front() else {
                break;
            };
            self.active_ops.lock().remove(&handle);
            let Some(op) = self.op_pool.remove(handle) else {
                continue;
            };
            // Sever subsystem links before the op goes back to the pool.
            let in_id = {
                let mut inner = op.inner.lock();
                inner.in_message.take().map(|m| m.id())
            };
            if let Some(id) = in_id {
                self.receiver.drop_op(id);
            }
            let out_id = op.out_message().lock().id;
            if let Some(id) = out_id {
                self.sender.drop_message(id);
            }
            log::trace!("[transport] reclaimed op {:?}", handle);
        }
    }

    // ========================================================================
    // Op state machine
    // ========================================================================

    pub(crate) fn hint_update(&self, handle: Handle) {
        self.update_hints.lock().push(handle);
    }

    /// Advance one op's state machine. Called with the op mutex held and
    /// no transport-wide lock held.
    fn process_updates(&self, op: &Arc<OpContext>, inner: &mut OpInner) {
        if inner.destroy {
            return;
        }
        if op.is_server() {
            match op.state() {
                OpState::NotStarted => {
                    if inner.in_message.as_ref().is_some_and(|m| m.is_ready()) {
                        op.set_state(OpState::InProgress);
                        self.pending_server_ops.lock().push_back(op.handle());
                        self.hint_update(op.handle());
                    }
                }
                OpState::InProgress => {
                    if op.out_message().is_done() {
                        op.set_state(OpState::Completed);
                        self.hint_update(op.handle());
                        // The first hop never sends DONE: the reply itself
                        // is the acknowledgment. Later hops must.
                        if let Some(in_message) = inner.in_message.as_ref() {
                            if in_message.id().tag != INITIAL_REQUEST_TAG {
                                match in_message.source() {
                                    Some(source) => self.send_done(in_message.id(), source),
                                    None => log::warn!(
                                        "[transport] no source to send DONE for {:?}",
                                        in_message.id()
                                    ),
                                }
                            }
                        }
                    }
                }
                OpState::Completed | OpState::Failed => {
                    if !op.is_retained() {
                        self.retire(op, inner);
                    }
                }
            }
        } else {
            if !op.is_retained() {
                self.retire(op, inner);
                return;
            }
            if op.state() == OpState::InProgress
                && inner.in_message.as_ref().is_some_and(|m| m.is_ready())
            {
                op.set_state(OpState::Completed);
                self.hint_update(op.handle());
            }
        }
    }

    /// Mark an op for reclamation. Idempotent.
    fn retire(&self, op: &Arc<OpContext>, inner: &mut OpInner) {
        if inner.destroy {
            return;
        }
        inner.destroy = true;
        self.unused_ops.lock().push_back(op.handle());
        log::trace!("[transport] retiring op {:?}", op.handle());
    }

    /// Synthesize and emit a DONE for a served chained request.
    fn send_done(&self, id: MessageId, destination: Address) {
        let mut packet = self.driver.alloc_packet();
        let header = DoneHeader { message_id: id };
        match header.encode(packet.payload_mut()) {
            Ok(n) => {
                packet.set_len(n);
                packet.address = Some(destination);
                log::debug!("[transport] DONE {:?} -> {}", id, destination);
                self.driver.send_packets(vec![packet]);
            }
            Err(e) => {
                log::warn!("[transport] cannot encode DONE: {}", e);
                self.driver.release_packets(vec![packet]);
            }
        }
    }

    // ========================================================================
    // Introspection (mainly for tests and debugging)
    // ========================================================================

    /// Number of live op contexts.
    #[must_use]
    pub fn live_ops(&self) -> usize {
        self.op_pool.outstanding()
    }

    /// Number of server ops waiting for `receive_op`.
    #[must_use]
    pub fn pending_ops(&self) -> usize {
        self.pending_server_ops.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn hinted_ops(&self) -> usize {
        self.update_hints.lock().len()
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process datagram driver.
//!
//! Connects any number of endpoints through a shared [`FakeNetwork`] so
//! multiple transports can exchange packets inside one process. No real
//! sockets are involved; delivery is immediate and lossless unless a test
//! arms the drop counter.
//!
//! Endpoint addresses are the node ids the network assigns at attach time,
//! starting from 1. `address_for_name` resolves the decimal form
//! (`"1"`, `"2"`, ...).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Address, Driver, Packet};

/// Maximum payload a fake packet can carry, in bytes.
pub const MAX_PAYLOAD_SIZE: u32 = 1500;

/// Nominal bandwidth reported by fake drivers, in bits per second.
pub const BANDWIDTH_BPS: u64 = 10_000_000_000;

struct NetworkInner {
    inboxes: HashMap<u64, VecDeque<Packet>>,
    next_node_id: u64,
    /// Number of upcoming routed packets to drop (test hook).
    drop_next: usize,
}

/// Process-local packet switch connecting [`FakeDriver`] endpoints.
pub struct FakeNetwork {
    inner: Mutex<NetworkInner>,
}

impl FakeNetwork {
    /// Create an empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(NetworkInner {
                inboxes: HashMap::new(),
                next_node_id: 1,
                drop_next: 0,
            }),
        })
    }

    /// Attach a new endpoint and return its driver.
    pub fn new_driver(self: &Arc<Self>) -> FakeDriver {
        let mut inner = self.inner.lock();
        let node_id = inner.next_node_id;
        inner.next_node_id += 1;
        inner.inboxes.insert(node_id, VecDeque::new());
        log::debug!("[fake] endpoint {} attached", node_id);
        FakeDriver {
            network: Arc::clone(self),
            local: Address::from_u64(node_id),
        }
    }

    /// Drop the next `count` packets routed through the network.
    pub fn drop_next(&self, count: usize) {
        self.inner.lock().drop_next += count;
    }

    fn route(&self, from: Address, mut packet: Packet) {
        let mut inner = self.inner.lock();
        if inner.drop_next > 0 {
            inner.drop_next -= 1;
            log::debug!("[fake] dropping packet from {}", from);
            return;
        }
        let Some(destination) = packet.address else {
            log::warn!("[fake] packet without destination from {}", from);
            return;
        };
        match inner.inboxes.get_mut(&destination.as_u64()) {
            Some(inbox) => {
                // Receivers see the sender, not themselves.
                packet.address = Some(from);
                inbox.push_back(packet);
            }
            None => {
                log::warn!("[fake] no endpoint at {}", destination);
            }
        }
    }
}

/// Driver endpoint on a [`FakeNetwork`].
pub struct FakeDriver {
    network: Arc<FakeNetwork>,
    local: Address,
}

impl Driver for FakeDriver {
    fn alloc_packet(&self) -> Packet {
        Packet::with_capacity(MAX_PAYLOAD_SIZE as usize)
    }

    fn send_packets(&self, packets: Vec<Packet>) {
        for packet in packets {
            self.network.route(self.local, packet);
        }
    }

    fn receive_packets(&self, max: usize, out: &mut Vec<Packet>) -> usize {
        let mut inner = self.network.inner.lock();
        let Some(inbox) = inner.inboxes.get_mut(&self.local.as_u64()) else {
            return 0;
        };
        let count = max.min(inbox.len());
        out.extend(inbox.drain(..count));
        count
    }

    fn release_packets(&self, packets: Vec<Packet>) {
        drop(packets);
    }

    fn address_for_name(&self, name: &str) -> Option<Address> {
        name.parse::<u64>().ok().map(Address::from_u64)
    }

    fn local_address(&self) -> Address {
        self.local
    }

    fn bandwidth_bps(&self) -> u64 {
        BANDWIDTH_BPS
    }

    fn max_payload_size(&self) -> u32 {
        MAX_PAYLOAD_SIZE
    }
}

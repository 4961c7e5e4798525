// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Grant scheduling.
//!
//! The receiver tells the scheduler about every data arrival; the scheduler
//! decides when to authorize the sender to push more packets by emitting
//! GRANT packets back toward the source. The policy is pluggable behind the
//! [`Scheduler`] trait; [`GrantScheduler`] is the default windowed policy.
//!
//! `total_received_bytes` is the documented over-count
//! (`packets x packet_data_length`): the last packet of a message may be
//! short, but a grant watermark does not need byte precision because full
//! receipt, not a byte-exact match, terminates the exchange.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::TransportConfig;
use crate::driver::{Address, Driver};
use crate::protocol::{GrantHeader, MessageId};

/// Receives arrival bookkeeping and issues grants.
pub trait Scheduler: Send + Sync {
    /// Called for every accepted (non-duplicate) data packet.
    ///
    /// `message_length` is the declared raw length; `total_received_bytes`
    /// is the per-packet over-count of what has arrived so far.
    fn packet_received(
        &self,
        id: MessageId,
        source: Address,
        message_length: u32,
        total_received_bytes: u32,
    );
}

/// Default policy: keep one grant window of bytes authorized ahead of what
/// has arrived, and stop granting once the message is fully received.
pub struct GrantScheduler {
    driver: Arc<dyn Driver>,
    packet_data_len: u32,
    grant_window: u32,
    /// Granted byte watermark per in-flight inbound message.
    granted: Mutex<HashMap<MessageId, u32>>,
}

impl GrantScheduler {
    /// Create a scheduler for the given driver.
    pub fn new(driver: Arc<dyn Driver>, config: &TransportConfig) -> Self {
        let packet_data_len = TransportConfig::packet_data_length(driver.as_ref()).max(1);
        let grant_window = config.grant_window(driver.as_ref());
        Self {
            driver,
            packet_data_len,
            grant_window,
            granted: Mutex::new(HashMap::new()),
        }
    }

    /// Messages currently being granted.
    #[must_use]
    pub fn tracked_messages(&self) -> usize {
        self.granted.lock().len()
    }

    fn emit_grant(&self, id: MessageId, source: Address, granted_bytes: u32) {
        let packet_index = granted_bytes.div_ceil(self.packet_data_len);
        let mut packet = self.driver.alloc_packet();
        let header = GrantHeader {
            message_id: id,
            packet_index,
        };
        match header.encode(packet.payload_mut()) {
            Ok(n) => {
                packet.set_len(n);
                packet.address = Some(source);
                log::trace!(
                    "[scheduler] grant {:?} up to packet {}",
                    id,
                    packet_index
                );
                self.driver.send_packets(vec![packet]);
            }
            Err(e) => {
                log::warn!("[scheduler] grant encode failed: {}", e);
                self.driver.release_packets(vec![packet]);
            }
        }
    }
}

impl Scheduler for GrantScheduler {
    fn packet_received(
        &self,
        id: MessageId,
        source: Address,
        message_length: u32,
        total_received_bytes: u32,
    ) {
        let mut granted = self.granted.lock();
        if total_received_bytes >= message_length {
            granted.remove(&id);
            return;
        }

        let desired = message_length.min(total_received_bytes.saturating_add(self.grant_window));
        let watermark = granted.entry(id).or_insert(0);
        if desired <= *watermark {
            return;
        }
        *watermark = desired;
        drop(granted);

        self.emit_grant(id, source, desired);
    }
}

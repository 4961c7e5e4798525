// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport configuration.

use crate::driver::Driver;
use crate::protocol::DataHeader;

/// Tuning knobs for a [`crate::Transport`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Packets drained from the driver per poll tick.
    pub max_packets_per_poll: usize,
    /// Round-trip estimate used to derive the unscheduled allowance and
    /// grant window, in microseconds.
    pub rtt_micros: u64,
    /// Packets a sender may push before the first grant arrives.
    /// Derived from `bandwidth x RTT` when unset; never below one.
    pub unscheduled_packet_limit: Option<u32>,
    /// Bytes a receiver keeps granted ahead of what it has received.
    /// Derived from `bandwidth x RTT` when unset; never below one packet.
    pub grant_window_bytes: Option<u32>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_packets_per_poll: 32,
            rtt_micros: 100,
            unscheduled_packet_limit: None,
            grant_window_bytes: None,
        }
    }
}

impl TransportConfig {
    /// Profile for intra-datacenter links (microsecond RTTs).
    pub fn datacenter() -> Self {
        Self::default()
    }

    /// Profile for wide-area links: deeper pipelines to cover the RTT.
    pub fn wide_area() -> Self {
        Self {
            rtt_micros: 30_000,
            ..Self::default()
        }
    }

    /// Bytes in flight over one RTT at the driver's bandwidth.
    fn rtt_bytes(&self, driver: &dyn Driver) -> u64 {
        driver.bandwidth_bps() / 8 * self.rtt_micros / 1_000_000
    }

    pub(crate) fn packet_data_length(driver: &dyn Driver) -> u32 {
        driver
            .max_payload_size()
            .saturating_sub(DataHeader::WIRE_SIZE as u32)
    }

    /// Resolved unscheduled allowance in packets.
    pub(crate) fn unscheduled_limit(&self, driver: &dyn Driver) -> u32 {
        if let Some(limit) = self.unscheduled_packet_limit {
            return limit.max(1);
        }
        let data_len = u64::from(Self::packet_data_length(driver)).max(1);
        (self.rtt_bytes(driver) / data_len).clamp(1, u64::from(u32::MAX)) as u32
    }

    /// Resolved grant window in bytes.
    pub(crate) fn grant_window(&self, driver: &dyn Driver) -> u32 {
        let data_len = Self::packet_data_length(driver).max(1);
        if let Some(window) = self.grant_window_bytes {
            return window.max(data_len);
        }
        (self.rtt_bytes(driver).clamp(1, u64::from(u32::MAX)) as u32).max(data_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::fake::FakeNetwork;

    #[test]
    fn derived_limits_never_zero() {
        let network = FakeNetwork::new();
        let driver = network.new_driver();
        let config = TransportConfig {
            rtt_micros: 0,
            ..TransportConfig::default()
        };

        assert!(config.unscheduled_limit(&driver) >= 1);
        assert!(config.grant_window(&driver) >= TransportConfig::packet_data_length(&driver));
    }

    #[test]
    fn explicit_limits_win() {
        let network = FakeNetwork::new();
        let driver = network.new_driver();
        let config = TransportConfig {
            unscheduled_packet_limit: Some(4),
            grant_window_bytes: Some(1 << 20),
            ..TransportConfig::default()
        };

        assert_eq!(config.unscheduled_limit(&driver), 4);
        assert_eq!(config.grant_window(&driver), 1 << 20);
    }
}

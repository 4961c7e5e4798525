// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # opwire - operation-oriented message transport
//!
//! A request/reply remote-operation layer over an unreliable,
//! datagram-oriented packet driver. Large application messages are split
//! into driver-sized packets, reassembled on the receiver, and paced by
//! receiver-issued grants; completed inbound requests surface to the
//! application as operations.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use opwire::{FakeNetwork, Transport, TransportConfig};
//!
//! let network = FakeNetwork::new();
//! let client = Transport::new(Arc::new(network.new_driver()), 1, TransportConfig::default());
//! let server = Transport::new(Arc::new(network.new_driver()), 2, TransportConfig::default());
//!
//! // Client side: build a request and send it.
//! let op = client.alloc_op();
//! op.append(b"ping").unwrap();
//! client.send_request(&op, server.driver().local_address());
//!
//! // Both sides make progress by polling.
//! loop {
//!     client.poll();
//!     server.poll();
//!     if let Some(incoming) = server.receive_op() {
//!         incoming.append(b"pong").unwrap();
//!         server.send_reply(&incoming);
//!         server.release_op(&incoming);
//!     }
//!     if op.state() == opwire::OpState::Completed {
//!         break;
//!     }
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                     Operation API                            |
//! |   alloc_op / receive_op / send_request / send_reply / poll   |
//! +--------------------------------------------------------------+
//! |  Transport: opcode dispatch, op pool, hint queue, cleanup    |
//! +-----------------------+--------------------------------------+
//! |  Sender               |  Receiver            |  Scheduler    |
//! |  grant-paced TX       |  reassembly          |  GRANT policy |
//! +-----------------------+----------------------+---------------+
//! |        Driver: DATA / GRANT / DONE datagrams                 |
//! |        (in-process FakeNetwork, UDP)                         |
//! +--------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Transport`] | Entry point: polling loop and the operation API |
//! | [`OpContext`] | One operation: paired inbound/outbound message and state |
//! | [`Driver`] | Datagram driver abstraction the transport rides on |
//! | [`TransportConfig`] | Grant window, unscheduled allowance, poll batch |
//!
//! Nothing in the core blocks on the network and nothing throws for
//! network conditions: loss, duplication, and stale control packets fold
//! into the per-operation state machine, which the application observes
//! through [`OpContext::state`].

pub mod config;
pub mod driver;
pub mod message;
pub mod op;
pub mod pool;
pub mod protocol;
pub mod receiver;
pub mod scheduler;
pub mod sender;
pub mod transport;

pub use config::TransportConfig;
pub use driver::fake::{FakeDriver, FakeNetwork};
pub use driver::udp::UdpDriver;
pub use driver::{Address, Driver, DriverError, Packet, RawAddress};
pub use message::{Message, MessageError};
pub use op::{OpContext, OpState};
pub use protocol::{MessageId, OpId, INITIAL_REQUEST_TAG, ULTIMATE_RESPONSE_TAG};
pub use receiver::{InboundMessage, Receiver};
pub use scheduler::{GrantScheduler, Scheduler};
pub use sender::{OutboundMessage, Sender};
pub use transport::Transport;

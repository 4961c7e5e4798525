// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-operation lifecycle context.
//!
//! An operation pairs an inbound message with an outbound message and
//! walks `NotStarted -> InProgress -> {Completed, Failed}`. Client-role
//! contexts send a request and wait for the reply; server-role contexts
//! receive a request and send the reply (or a further chained request).
//!
//! The state field is atomic so application threads can poll it without
//! taking the op mutex. Transitions themselves are driven by the owning
//! transport during `poll()`; see `Transport::process_updates`.
//!
//! Concurrent calls on *different* ops are fine; concurrent calls on the
//! same op are not supported and must be avoided by the caller.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::driver::Driver;
use crate::message::{Message, MessageError};
use crate::protocol::{DataHeader, MessageHeader};
use crate::pool::Handle;
use crate::receiver::InboundMessage;
use crate::sender::OutboundMessage;

/// Observable lifecycle state of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpState {
    /// Allocated but not yet started.
    NotStarted = 0,
    /// Request or reply is in flight.
    InProgress = 1,
    /// Finished successfully. Terminal.
    Completed = 2,
    /// Marked failed by an upper layer. Terminal.
    Failed = 3,
}

impl OpState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::InProgress,
            2 => Self::Completed,
            3 => Self::Failed,
            _ => Self::NotStarted,
        }
    }

    /// True for the two sticky end states.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

pub(crate) struct OpInner {
    pub(crate) in_message: Option<Arc<InboundMessage>>,
    pub(crate) destroy: bool,
}

/// Context of one operation.
pub struct OpContext {
    handle: Handle,
    server: bool,
    state: AtomicU8,
    retained: AtomicBool,
    out_message: Arc<OutboundMessage>,
    pub(crate) inner: Mutex<OpInner>,
}

impl OpContext {
    pub(crate) fn new(handle: Handle, server: bool) -> Self {
        Self {
            handle,
            server,
            state: AtomicU8::new(OpState::NotStarted as u8),
            retained: AtomicBool::new(false),
            out_message: Arc::new(OutboundMessage::new()),
            inner: Mutex::new(OpInner {
                in_message: None,
                destroy: false,
            }),
        }
    }

    /// Pool handle of this context.
    #[must_use]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// True for server-role (received-request) contexts.
    #[must_use]
    pub fn is_server(&self) -> bool {
        self.server
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> OpState {
        OpState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: OpState) {
        self.state.store(state as u8, Ordering::Release)
    }

    /// Whether the application still holds this op.
    #[must_use]
    pub fn is_retained(&self) -> bool {
        self.retained.load(Ordering::Acquire)
    }

    pub(crate) fn set_retained(&self, retained: bool) {
        self.retained.store(retained, Ordering::Release)
    }

    /// The outbound half of this operation.
    #[must_use]
    pub fn out_message(&self) -> &Arc<OutboundMessage> {
        &self.out_message
    }

    /// The inbound half, once one is linked.
    #[must_use]
    pub fn in_message(&self) -> Option<Arc<InboundMessage>> {
        self.inner.lock().in_message.clone()
    }

    /// Append application bytes to the outbound message.
    ///
    /// Only meaningful before the op is sent.
    pub fn append(&self, data: &[u8]) -> Result<(), MessageError> {
        let mut out = self.out_message.lock();
        out.message
            .as_mut()
            .ok_or(MessageError::HeaderMissing)?
            .append(data)
    }

    /// Build the outbound message buffer with its header region, if it
    /// does not exist yet.
    pub(crate) fn prepare_out_message(&self, driver: &Arc<dyn Driver>) -> Result<(), MessageError> {
        let mut out = self.out_message.lock();
        if out.message.is_some() {
            return Ok(());
        }
        let mut message = Message::new(Arc::clone(driver), DataHeader::WIRE_SIZE as u16, 0)?;
        message.reserve_header()?;
        out.message = Some(message);
        Ok(())
    }

    /// Write the application header of the outbound message.
    pub(crate) fn set_out_header(&self, header: &MessageHeader) -> Result<(), MessageError> {
        let mut out = self.out_message.lock();
        out.message
            .as_mut()
            .ok_or(MessageError::HeaderMissing)?
            .set_header(header)
    }
}

impl std::fmt::Debug for OpContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpContext")
            .field("handle", &self.handle)
            .field("server", &self.server)
            .field("state", &self.state())
            .field("retained", &self.is_retained())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Pool;

    #[test]
    fn state_starts_not_started() {
        let pool: Pool<OpContext> = Pool::new();
        let (_, op) = pool.insert_with(|h| OpContext::new(h, false));
        assert_eq!(op.state(), OpState::NotStarted);
        assert!(!op.is_retained());
        assert!(!op.is_server());
    }

    #[test]
    fn terminal_states() {
        assert!(!OpState::NotStarted.is_terminal());
        assert!(!OpState::InProgress.is_terminal());
        assert!(OpState::Completed.is_terminal());
        assert!(OpState::Failed.is_terminal());
    }

    #[test]
    fn append_requires_built_message() {
        let pool: Pool<OpContext> = Pool::new();
        let (_, op) = pool.insert_with(|h| OpContext::new(h, false));
        assert_eq!(op.append(b"abc"), Err(MessageError::HeaderMissing));
    }
}

//! Indications delivered to the application.
//!
//! Sessions never call the application directly; every confirm and
//! indication is emitted through an [`EventBus`].

use std::sync::Arc;

use bluer::Address;

use crate::{
   error::{SessionError, Status},
   hid::{
      SessionId,
      protocol::{ConnectionId, PowerMode, ReportType, TransactionType},
   },
};

/// Events that can be emitted by a HID device session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HiddEvent {
   ActivateConfirm(Status),
   DeactivateConfirm(Status),
   Connected {
      connection_id: ConnectionId,
   },
   Disconnected {
      connection_id: Option<ConnectionId>,
      reason: SessionError,
   },
   Reconnecting {
      connection_id: Option<ConnectionId>,
   },
   ConnectFailed(SessionError),
   ControlIndication {
      transaction: TransactionType,
      parameter: u8,
      data: Vec<u8>,
   },
   DataIndication {
      report_type: ReportType,
      data: Vec<u8>,
   },
   DataConfirm(Status),
   ModeChanged {
      mode: PowerMode,
      status: Status,
   },
   Unplugged {
      peer: Address,
      status: Status,
   },
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Delivers an event raised by `session` to the application.
   fn emit(&self, session: SessionId, event: HiddEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

//! Bluetooth side of the HID device service.
//!
//! This module provides the collaborators a session talks to (L2CAP channel
//! transport and the SDP record directory) and the actor that connects them
//! to the sessions.

use tokio::sync::mpsc;

use crate::hid::{
   SessionId,
   message::{Input, RecordCommand, TransportCommand},
   protocol::ConnectionId,
};

pub mod l2cap;
pub mod manager;
pub mod records;

/// A collaborator result addressed to a session.
#[derive(Debug)]
pub struct Completion {
   pub session: SessionId,
   pub input: Input,
}

impl Completion {
   pub fn new(session: SessionId, input: impl Into<Input>) -> Self {
      Self {
         session,
         input: input.into(),
      }
   }
}

pub type CompletionSender = mpsc::UnboundedSender<Completion>;
pub type CompletionReceiver = mpsc::UnboundedReceiver<Completion>;

pub fn completion_channel() -> (CompletionSender, CompletionReceiver) {
   mpsc::unbounded_channel()
}

/// L2CAP channel transport.
///
/// Commands return immediately; confirms and indications are delivered later
/// through the completion channel the transport was built with.
pub trait Transport: Send + 'static {
   fn execute(&mut self, session: SessionId, command: TransportCommand);

   /// Drops every channel and pending operation of `session`.
   fn release(&mut self, session: SessionId);

   /// Routes events of an open channel to `session` from now on.
   fn rebind(&mut self, cid: ConnectionId, session: SessionId);
}

/// SDP service record directory.
pub trait RecordDirectory: Send + 'static {
   fn execute(&mut self, session: SessionId, command: RecordCommand);
}

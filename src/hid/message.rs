//! Messages exchanged between a session and the world around it.
//!
//! A session consumes [`Input`]s and produces [`Action`]s. Everything that
//! needs I/O (channel transport, record directory, timers, application
//! delivery) is expressed as an action and answered, where applicable, by a
//! later input.

use std::time::Duration;

use bluer::Address;

use crate::{
   error::ErrorCode,
   event::HiddEvent,
   hid::{
      protocol::{ChannelInfo, ConnectionId, PowerMode, Qos, ReportType, Security, TransactionType},
      retry::TimerToken,
   },
};

/// Parameters of an activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateRequest {
   /// Host to connect to, or `Address::any()` to wait for the host.
   pub peer: Address,
   pub hid_record: Option<Vec<u8>>,
   pub device_id_record: Option<Vec<u8>>,
   pub qos_control: Option<Qos>,
   pub qos_interrupt: Option<Qos>,
   pub flush_timeout: u16,
}

/// Application requests.
///
/// Report and control buffers reserve byte 0 for the HIDP header, which the
/// session fills in before sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
   Activate(ActivateRequest),
   Deactivate,
   ControlResponse {
      transaction: TransactionType,
      parameter: u8,
      data: Vec<u8>,
   },
   DataRequest {
      report_type: ReportType,
      report: Vec<u8>,
   },
   Unplug,
   ModeChange(PowerMode),
   Connect,
   Disconnect,
   RegisterTask,
   DeregisterTask,
}

impl Request {
   /// Requests handled in every state rather than deferred.
   pub const fn is_immediate(&self) -> bool {
      matches!(self, Self::Deactivate | Self::RegisterTask | Self::DeregisterTask)
   }
}

/// Commands for the channel transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
   Register {
      psm: u16,
   },
   ConnectAccept {
      psm: u16,
      security: Security,
      mtu: u16,
      flush_timeout: u16,
      qos: Option<Qos>,
   },
   CancelConnectAccept {
      psm: u16,
   },
   Connect {
      peer: Address,
      psm: u16,
      security: Security,
      mtu: u16,
   },
   CancelConnect {
      peer: Address,
      psm: u16,
   },
   Disconnect {
      cid: ConnectionId,
   },
   Send {
      cid: ConnectionId,
      frame: Vec<u8>,
   },
   /// Asks the transport to deliver data it announced with `MoreData`.
   Receive {
      cid: ConnectionId,
   },
}

/// Confirmations and indications from the channel transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
   Registered {
      psm: u16,
   },
   ConnectAcceptConfirm {
      psm: u16,
      peer: Address,
      result: Result<ChannelInfo, ErrorCode>,
   },
   CancelAcceptConfirm {
      psm: u16,
   },
   /// Answer to `Connect`; a cancelled attempt reports [`ErrorCode::CANCELLED`].
   ConnectConfirm {
      psm: u16,
      result: Result<ChannelInfo, ErrorCode>,
   },
   DataConfirm {
      cid: ConnectionId,
      result: Result<(), ErrorCode>,
   },
   /// The transport could not queue `frame` and hands it back.
   SendBlocked {
      cid: ConnectionId,
      frame: Vec<u8>,
   },
   DataIndication {
      cid: ConnectionId,
      payload: Vec<u8>,
   },
   DisconnectIndication {
      cid: ConnectionId,
      reason: ErrorCode,
      local: bool,
   },
   ModeChangeIndication {
      mode: PowerMode,
      result: Result<(), ErrorCode>,
   },
   MoreSpace {
      cid: ConnectionId,
   },
   MoreData {
      cid: ConnectionId,
   },
}

/// Commands for the service record directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordCommand {
   Register { record: Vec<u8> },
   Unregister { handle: u32 },
}

/// Answers from the service record directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordEvent {
   Registered(Result<u32, ErrorCode>),
   Unregistered {
      handle: u32,
      result: Result<(), ErrorCode>,
   },
}

/// Everything a session consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
   Request(Request),
   Transport(TransportEvent),
   Record(RecordEvent),
   Timer(TimerToken),
   /// Self-addressed re-arm after a link loss.
   Reactivate,
}

impl From<Request> for Input {
   fn from(req: Request) -> Self {
      Self::Request(req)
   }
}

impl From<TransportEvent> for Input {
   fn from(ev: TransportEvent) -> Self {
      Self::Transport(ev)
   }
}

impl From<RecordEvent> for Input {
   fn from(ev: RecordEvent) -> Self {
      Self::Record(ev)
   }
}

/// Everything a session produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
   Transport(TransportCommand),
   Record(RecordCommand),
   StartTimer { token: TimerToken, after: Duration },
   CancelTimer(TimerToken),
   /// Feed [`Input::Reactivate`] back to the session.
   Reactivate,
   Emit(HiddEvent),
}

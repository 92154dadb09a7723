//! HID device session state machine.
//!
//! A [`Session`] is a sans-IO actor: [`Session::handle`] consumes one input,
//! runs to completion and leaves the resulting [`Action`]s in an outbox the
//! caller drains with [`Session::take_actions`]. The caller guarantees that
//! inputs for one session are handled one at a time.
//!
//! Requests that arrive while the session is settling (records being
//! published, channels being opened or torn down) are parked and replayed in
//! arrival order once a stable state is reached.

use std::{collections::VecDeque, time::Duration};

use bluer::Address;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{
   error::{ErrorCode, SessionError},
   event::HiddEvent,
   hid::{
      SessionId,
      channel::{ChannelEndpoint, Reassembly, SendProgress},
      handover::{EndpointSnapshot, HandoverSnapshot},
      message::{
         Action, ActivateRequest, Input, RecordCommand, RecordEvent, Request, TransportCommand,
         TransportEvent,
      },
      protocol::{
         ChannelInfo, ChannelKind, ConnectionId, DEFAULT_MTU, FLUSH_TIMEOUT_INFINITE, PSM_CONTROL,
         PSM_INTERRUPT, PowerMode, ReportType, Security, TransactionType, VIRTUAL_CABLE_UNPLUG,
      },
      record::{RecordKind, ServiceRecordManager},
      retry::{RetryController, TimerKind, TimerToken},
      sdp::HidFlags,
   },
};

#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::IntoStaticStr,
)]
pub enum State {
   Init,
   Idle,
   RegisteringRecords,
   AcceptConnecting,
   Connecting,
   UnregisteringRecords,
   Connected,
   NotConnected,
}

impl State {
   /// States whose outcome is still pending on a collaborator.
   pub const fn is_transient(self) -> bool {
      matches!(
         self,
         Self::RegisteringRecords
            | Self::AcceptConnecting
            | Self::Connecting
            | Self::UnregisteringRecords
      )
   }

   pub const fn allows_handover(self) -> bool {
      !matches!(
         self,
         Self::Connecting | Self::RegisteringRecords | Self::UnregisteringRecords
      )
   }

   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

/// Why the channels went, or are going, down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DisconnectCause {
   #[default]
   None,
   /// Host sent HID_CONTROL(VIRTUAL_CABLE_UNPLUG).
   UnplugIndicated,
   /// Application asked to unplug.
   UnplugRequested,
   /// Application asked for power mode "disconnect".
   ModeChange,
   /// Application asked to disconnect.
   AppRequested,
   LinkLoss,
   Local,
   Remote,
}

impl DisconnectCause {
   fn classify(reason: ErrorCode, local: bool) -> Self {
      if reason.is_link_loss() {
         Self::LinkLoss
      } else if local {
         Self::Local
      } else {
         Self::Remote
      }
   }
}

/// What tears a session down to Idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TeardownReason {
   /// Application deactivated the session; confirmed with `DeactivateConfirm`.
   Deactivate,
   /// Application went away; binding and records are forgotten.
   Cleanup,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Unwind {
   Teardown(TeardownReason),
   /// Report `error` once the channels are down. With `unpublish`, records
   /// published so far are withdrawn first.
   Failure {
      error: SessionError,
      unpublish: bool,
   },
   /// Close a reconnect accept window and open a new one if budget is left.
   RearmAccept,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFlags {
   /// HIDVirtualCable attribute of the HID record.
   pub virtual_cable: bool,
   /// HIDReconnectInitiate attribute of the HID record.
   pub reconnect_initiate: bool,
   /// Current link transition was requested through a power mode change.
   pub user_requested: bool,
   pub reconnecting: bool,
   pub replacing_records: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct ChannelSet {
   control: bool,
   interrupt: bool,
}

impl ChannelSet {
   fn slot(&mut self, kind: ChannelKind) -> &mut bool {
      match kind {
         ChannelKind::Control => &mut self.control,
         ChannelKind::Interrupt => &mut self.interrupt,
      }
   }

   fn insert(&mut self, kind: ChannelKind) {
      *self.slot(kind) = true;
   }

   fn remove(&mut self, kind: ChannelKind) -> bool {
      std::mem::take(self.slot(kind))
   }

   const fn contains(&self, kind: ChannelKind) -> bool {
      match kind {
         ChannelKind::Control => self.control,
         ChannelKind::Interrupt => self.interrupt,
      }
   }

   const fn is_empty(&self) -> bool {
      !self.control && !self.interrupt
   }
}

/// Transport operations awaiting a confirm.
#[derive(Debug, Default)]
struct PendingOps {
   accepting: ChannelSet,
   cancelling: ChannelSet,
   connecting: Option<ChannelKind>,
   connect_cancelled: bool,
   disconnecting: ChannelSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResetScope {
   /// Keep peer binding and records.
   Keep,
   /// Forget peer binding, record bytes and record-derived flags.
   Forget,
}

/// Tunables of a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
   pub max_retries: u32,
   pub accept_window: Duration,
   pub retry_delay: Duration,
   pub local_mtu: u16,
   pub security: Security,
   /// Re-arm by itself after a link loss instead of waiting for a new Activate.
   pub auto_reactivate: bool,
}

impl Default for SessionConfig {
   fn default() -> Self {
      Self {
         max_retries: 7,
         accept_window: Duration::from_secs(60),
         retry_delay: Duration::from_secs(2),
         local_mtu: DEFAULT_MTU,
         security: Security::default(),
         auto_reactivate: true,
      }
   }
}

pub struct Session {
   id: SessionId,
   config: SessionConfig,
   state: State,
   peer: Address,
   control: ChannelEndpoint,
   interrupt: ChannelEndpoint,
   records: ServiceRecordManager,
   flags: SessionFlags,
   retry: RetryController,
   last_error: Option<ErrorCode>,
   disconnect_reason: DisconnectCause,
   flush_timeout: u16,
   unwind: Option<Unwind>,
   pending: PendingOps,
   /// Interrupt channel accepted before its control channel.
   held_interrupt: Option<ChannelInfo>,
   /// Channels outside the endpoints that are being disconnected.
   strays: SmallVec<[ConnectionId; 2]>,
   /// Control channel id the application knows the session by.
   session_cid: Option<ConnectionId>,
   /// Cause of the first channel loss while connected.
   down_cause: Option<DisconnectCause>,
   activate_pending: bool,
   app_attached: bool,
   saved_requests: VecDeque<Request>,
   saved_transport: VecDeque<TransportEvent>,
   outbox: VecDeque<Action>,
}

impl Session {
   /// Creates a session and starts registering the HID PSMs.
   pub fn new(id: SessionId, config: SessionConfig) -> Self {
      let mut session = Self::blank(id, config, State::Init);
      session.push_transport(TransportCommand::Register { psm: PSM_CONTROL });
      session
   }

   /// A session in Idle that has nothing bound or published.
   pub fn idle(id: SessionId, config: SessionConfig) -> Self {
      Self::blank(id, config, State::Idle)
   }

   fn blank(id: SessionId, config: SessionConfig, state: State) -> Self {
      let retry = RetryController::new(config.max_retries, config.accept_window, config.retry_delay);
      Self {
         id,
         config,
         state,
         peer: Address::any(),
         control: ChannelEndpoint::new(ChannelKind::Control),
         interrupt: ChannelEndpoint::new(ChannelKind::Interrupt),
         records: ServiceRecordManager::new(),
         flags: SessionFlags::default(),
         retry,
         last_error: None,
         disconnect_reason: DisconnectCause::None,
         flush_timeout: FLUSH_TIMEOUT_INFINITE,
         unwind: None,
         pending: PendingOps::default(),
         held_interrupt: None,
         strays: SmallVec::new(),
         session_cid: None,
         down_cause: None,
         activate_pending: false,
         app_attached: true,
         saved_requests: VecDeque::new(),
         saved_transport: VecDeque::new(),
         outbox: VecDeque::new(),
      }
   }

   pub const fn id(&self) -> SessionId {
      self.id
   }

   pub const fn state(&self) -> State {
      self.state
   }

   pub const fn peer(&self) -> Address {
      self.peer
   }

   pub const fn flags(&self) -> SessionFlags {
      self.flags
   }

   pub const fn control(&self) -> &ChannelEndpoint {
      &self.control
   }

   pub const fn interrupt(&self) -> &ChannelEndpoint {
      &self.interrupt
   }

   pub const fn records(&self) -> &ServiceRecordManager {
      &self.records
   }

   pub const fn retry_count(&self) -> u32 {
      self.retry.count()
   }

   pub const fn last_error(&self) -> Option<ErrorCode> {
      self.last_error
   }

   pub const fn disconnect_reason(&self) -> DisconnectCause {
      self.disconnect_reason
   }

   /// The session may be handed over to another controller instance.
   pub const fn can_handover(&self) -> bool {
      self.state.allows_handover()
   }

   /// Nothing is buffered or awaiting the transport on either channel.
   pub fn is_quiescent(&self) -> bool {
      self.control.is_quiescent() && self.interrupt.is_quiescent() && self.saved_transport.is_empty()
   }

   /// An open interrupt channel always has an open control channel.
   pub const fn channels_consistent(&self) -> bool {
      !self.interrupt.is_connected() || self.control.is_connected()
   }

   /// Processes one input and everything it unblocks.
   pub fn handle(&mut self, input: impl Into<Input>) {
      self.dispatch(input.into());
      self.replay_saved();
   }

   /// Drains the actions produced so far.
   pub fn take_actions(&mut self) -> Vec<Action> {
      self.outbox.drain(..).collect()
   }

   fn dispatch(&mut self, input: Input) {
      match input {
         Input::Request(req) => self.on_request(req),
         Input::Transport(ev) => self.on_transport(ev),
         Input::Record(ev) => self.on_record(ev),
         Input::Timer(token) => self.on_timer(token),
         Input::Reactivate => self.on_reactivate(),
      }
   }

   const fn must_defer(&self) -> bool {
      matches!(self.state, State::Init) || self.state.is_transient() || self.unwind.is_some()
   }

   fn replay_saved(&mut self) {
      while !self.must_defer() {
         if let Some(req) = self.saved_requests.pop_front() {
            debug!("Session {}: replaying {req:?}", self.id);
            self.on_request(req);
            continue;
         }
         if self.state == State::Connected
            && let Some(ev) = self.saved_transport.pop_front()
         {
            self.on_transport(ev);
            continue;
         }
         break;
      }
   }

   // === Helpers ===

   fn enter(&mut self, state: State) {
      if self.state != state {
         debug!("Session {}: {} -> {}", self.id, self.state, state);
         self.state = state;
      }
   }

   fn emit(&mut self, event: HiddEvent) {
      if self.app_attached {
         self.outbox.push_back(Action::Emit(event));
      } else {
         debug!("Session {}: no application attached, dropping {event:?}", self.id);
      }
   }

   fn push_transport(&mut self, command: TransportCommand) {
      self.outbox.push_back(Action::Transport(command));
   }

   const fn endpoint(&self, kind: ChannelKind) -> &ChannelEndpoint {
      match kind {
         ChannelKind::Control => &self.control,
         ChannelKind::Interrupt => &self.interrupt,
      }
   }

   fn endpoint_mut(&mut self, kind: ChannelKind) -> &mut ChannelEndpoint {
      match kind {
         ChannelKind::Control => &mut self.control,
         ChannelKind::Interrupt => &mut self.interrupt,
      }
   }

   fn kind_of(&self, cid: ConnectionId) -> Option<ChannelKind> {
      ChannelKind::ALL
         .into_iter()
         .find(|&kind| self.endpoint(kind).cid() == Some(cid))
   }

   fn cancel_timers(&mut self) {
      for token in self.retry.cancel_all() {
         self.outbox.push_back(Action::CancelTimer(token));
      }
   }

   fn arm_accept_window(&mut self) {
      let (token, after) = self.retry.arm_accept_window();
      self.outbox.push_back(Action::StartTimer { token, after });
   }

   fn accept(&mut self, kind: ChannelKind) {
      self.pending.accepting.insert(kind);
      let command = TransportCommand::ConnectAccept {
         psm: kind.psm(),
         security: self.config.security,
         mtu: self.config.local_mtu,
         flush_timeout: self.flush_timeout,
         qos: self.endpoint(kind).qos(),
      };
      self.push_transport(command);
   }

   fn connect(&mut self, kind: ChannelKind) {
      debug!("Session {}: connecting {kind} channel to {}", self.id, self.peer);
      self.pending.connecting = Some(kind);
      self.pending.connect_cancelled = false;
      self.push_transport(TransportCommand::Connect {
         peer: self.peer,
         psm: kind.psm(),
         security: self.config.security,
         mtu: self.config.local_mtu,
      });
   }

   fn disconnect(&mut self, kind: ChannelKind) {
      let Some(cid) = self.endpoint(kind).cid() else {
         return;
      };
      if !self.pending.disconnecting.contains(kind) {
         self.pending.disconnecting.insert(kind);
         self.push_transport(TransportCommand::Disconnect { cid });
      }
   }

   /// Disconnects a channel the endpoints do not track.
   fn drop_stray(&mut self, cid: ConnectionId) {
      if !self.strays.contains(&cid) {
         self.strays.push(cid);
         self.push_transport(TransportCommand::Disconnect { cid });
      }
   }

   fn close_channels(&mut self) {
      self.control.close();
      self.interrupt.close();
      self.pending = PendingOps::default();
      self.strays.clear();
      self.held_interrupt = None;
      self.saved_transport.clear();
   }

   fn reset_to_idle(&mut self, scope: ResetScope) {
      self.cancel_timers();
      self.close_channels();
      self.unwind = None;
      self.flags.reconnecting = false;
      self.flags.replacing_records = false;
      self.flags.user_requested = false;
      self.activate_pending = false;
      self.session_cid = None;
      self.retry.reset();
      if scope == ResetScope::Forget {
         self.peer = Address::any();
         self.records.forget_bytes();
         self.flags = SessionFlags::default();
         self.flush_timeout = FLUSH_TIMEOUT_INFINITE;
         self.control.set_qos(None);
         self.interrupt.set_qos(None);
      }
      self.enter(State::Idle);
   }

   fn register_record(&mut self, kind: RecordKind) {
      if let Some(record) = self.records.begin_register(kind) {
         debug!("Session {}: registering {kind} record ({} bytes)", self.id, record.len());
         self.outbox.push_back(Action::Record(RecordCommand::Register { record }));
      }
   }

   fn unregister_record(&mut self, kind: RecordKind) {
      if let Some(handle) = self.records.begin_unregister(kind) {
         debug!("Session {}: unregistering {kind} record {handle:#x}", self.id);
         self.outbox.push_back(Action::Record(RecordCommand::Unregister { handle }));
      }
   }

   // === Requests ===

   fn on_request(&mut self, req: Request) {
      if !req.is_immediate() && self.must_defer() {
         debug!("Session {}: deferring {req:?} in {}", self.id, self.state);
         self.saved_requests.push_back(req);
         return;
      }

      match req {
         Request::Activate(params) => self.on_activate(params),
         Request::Deactivate => self.on_deactivate(),
         Request::RegisterTask => self.app_attached = true,
         Request::DeregisterTask => self.on_deregister(),
         Request::ControlResponse {
            transaction,
            parameter,
            mut data,
         } => {
            if self.state != State::Connected || !self.control.is_connected() {
               warn!("Session {}: control response dropped in {}", self.id, self.state);
               return;
            }
            write_header(&mut data, transaction.header(parameter));
            self.send_message(ChannelKind::Control, data);
         },
         Request::DataRequest {
            report_type,
            mut report,
         } => {
            if self.state != State::Connected || !self.interrupt.is_connected() {
               warn!("Session {}: data request without interrupt channel", self.id);
               self.emit(HiddEvent::DataConfirm(Err(SessionError::InvalidState(self.state))));
               return;
            }
            write_header(&mut report, TransactionType::Data.header(report_type as u8));
            self.send_message(ChannelKind::Interrupt, report);
         },
         Request::Unplug => self.on_unplug(),
         Request::ModeChange(mode) => self.on_mode_change(mode),
         Request::Connect => {
            let result = if self.state == State::NotConnected {
               self.reconnect_from_not_connected()
            } else {
               Err(SessionError::InvalidState(self.state))
            };
            if let Err(e) = result {
               self.emit(HiddEvent::ConnectFailed(e));
            }
         },
         Request::Disconnect => {
            if self.state == State::Connected {
               self.disconnect_reason = DisconnectCause::AppRequested;
               self.disconnect(ChannelKind::Interrupt);
            } else {
               self.emit(HiddEvent::Disconnected {
                  connection_id: None,
                  reason: SessionError::InvalidState(self.state),
               });
            }
         },
      }
   }

   fn on_activate(&mut self, params: ActivateRequest) {
      if self.state != State::Idle {
         warn!("Session {}: activate rejected in {}", self.id, self.state);
         self.emit(HiddEvent::ActivateConfirm(Err(SessionError::InvalidState(self.state))));
         return;
      }

      let replace = self
         .records
         .requires_replacement(params.hid_record.is_some(), params.device_id_record.is_some());

      self.peer = params.peer;
      if let Some(record) = params.hid_record {
         let found = HidFlags::from_record(&record);
         self.flags.virtual_cable = found.virtual_cable;
         self.flags.reconnect_initiate = found.reconnect_initiate;
         self.records.supply(RecordKind::Hid, record);
      }
      if let Some(record) = params.device_id_record {
         self.records.supply(RecordKind::DeviceId, record);
      }
      self.control.set_qos(params.qos_control);
      self.interrupt.set_qos(params.qos_interrupt);
      self.flush_timeout = params.flush_timeout;
      self.disconnect_reason = DisconnectCause::None;
      self.last_error = None;
      self.activate_pending = true;

      info!(
         "Session {}: activating (peer {}, virtual cable: {}, reconnect initiate: {})",
         self.id, self.peer, self.flags.virtual_cable, self.flags.reconnect_initiate
      );

      if replace {
         self.flags.replacing_records = true;
         self.enter(State::RegisteringRecords);
         self.continue_replacement();
      } else {
         self.publish_or_setup();
      }
   }

   fn continue_replacement(&mut self) {
      if self.records.in_flight().is_some() {
         return;
      }
      if let Some((kind, _)) = self.records.next_published() {
         self.unregister_record(kind);
         return;
      }
      self.flags.replacing_records = false;
      self.publish_or_setup();
   }

   fn publish_or_setup(&mut self) {
      if let Some(kind) = self.records.next_unpublished() {
         self.enter(State::RegisteringRecords);
         self.register_record(kind);
         return;
      }

      if !self.records.is_published(RecordKind::Hid) {
         warn!("Session {}: no HID record to publish", self.id);
         self.activate_pending = false;
         self.enter(State::Idle);
         self.emit(HiddEvent::ActivateConfirm(Err(SessionError::RecordRegistrationFailed(
            ErrorCode::NO_RECORD,
         ))));
         return;
      }

      if std::mem::take(&mut self.activate_pending) {
         if !self.flags.reconnecting {
            self.retry.reset();
         }
         self.emit(HiddEvent::ActivateConfirm(Ok(())));
      }
      self.start_channel_setup();
   }

   /// Opens the channels: actively when the host is known and the record
   /// asks for it, otherwise by waiting for the host.
   fn start_channel_setup(&mut self) {
      let active = self.peer != Address::any() && self.flags.reconnect_initiate;
      if active {
         self.flags.reconnecting = true;
      }
      if self.flags.reconnecting && !self.retry.try_begin_attempt() {
         self.give_up();
         return;
      }

      if active {
         self.enter(State::Connecting);
         self.connect(ChannelKind::Control);
      } else {
         self.enter(State::AcceptConnecting);
         for kind in ChannelKind::ALL {
            self.accept(kind);
         }
         if self.flags.reconnecting {
            self.arm_accept_window();
         }
      }
   }

   fn give_up(&mut self) {
      warn!("Session {}: giving up after {} reconnect attempts", self.id, self.retry.count());
      let connection_id = self.session_cid;
      self.reset_to_idle(ResetScope::Keep);
      self.emit(HiddEvent::Disconnected {
         connection_id,
         reason: SessionError::RetriesExhausted,
      });
   }

   fn on_deactivate(&mut self) {
      if self.state == State::Init || matches!(self.unwind, Some(Unwind::Teardown(_))) {
         debug!("Session {}: deferring deactivate in {}", self.id, self.state);
         self.saved_requests.push_back(Request::Deactivate);
         return;
      }

      info!("Session {}: deactivating from {}", self.id, self.state);
      self.abort_pending_activation();
      self.flags.reconnecting = false;
      self.flags.replacing_records = false;
      self.begin_unwind(Unwind::Teardown(TeardownReason::Deactivate));
   }

   fn on_deregister(&mut self) {
      info!("Session {}: application detached", self.id);
      self.app_attached = false;
      self.saved_requests.clear();
      if self.state == State::Init {
         return;
      }
      self.abort_pending_activation();
      self.flags.reconnecting = false;
      self.flags.replacing_records = false;
      self.begin_unwind(Unwind::Teardown(TeardownReason::Cleanup));
   }

   fn abort_pending_activation(&mut self) {
      if std::mem::take(&mut self.activate_pending) {
         self.emit(HiddEvent::ActivateConfirm(Err(SessionError::Aborted)));
      }
   }

   fn on_unplug(&mut self) {
      if self.state != State::Connected || !self.control.is_connected() {
         self.emit(HiddEvent::Unplugged {
            peer: self.peer,
            status: Err(SessionError::InvalidState(self.state)),
         });
         return;
      }
      info!("Session {}: unplugging virtual cable to {}", self.id, self.peer);
      self.disconnect_reason = DisconnectCause::UnplugRequested;
      let frame = vec![TransactionType::HidControl.header(VIRTUAL_CABLE_UNPLUG)];
      self.send_message(ChannelKind::Control, frame);
   }

   fn on_mode_change(&mut self, mode: PowerMode) {
      match (self.state, mode) {
         (State::Connected, PowerMode::Disconnect) => {
            self.disconnect_reason = DisconnectCause::ModeChange;
            self.disconnect(ChannelKind::Interrupt);
         },
         (State::Connected, _) | (State::NotConnected, PowerMode::Disconnect) => {
            self.emit(HiddEvent::ModeChanged { mode, status: Ok(()) });
         },
         (State::NotConnected, _) => {
            self.flags.user_requested = true;
            if let Err(e) = self.reconnect_from_not_connected() {
               self.flags.user_requested = false;
               self.emit(HiddEvent::ModeChanged { mode, status: Err(e) });
            }
         },
         (state, _) => self.emit(HiddEvent::ModeChanged {
            mode,
            status: Err(SessionError::InvalidState(state)),
         }),
      }
   }

   fn reconnect_from_not_connected(&mut self) -> Result<(), SessionError> {
      if self.peer == Address::any() {
         return Err(SessionError::InvalidState(self.state));
      }
      self.retry.reset();
      if !self.retry.try_begin_attempt() {
         return Err(SessionError::RetriesExhausted);
      }
      self.flags.reconnecting = true;
      self.enter(State::Connecting);
      self.connect(ChannelKind::Control);
      Ok(())
   }

   fn on_reactivate(&mut self) {
      if self.state != State::Idle || self.unwind.is_some() || !self.flags.reconnecting {
         debug!("Session {}: stale reactivation in {}", self.id, self.state);
         return;
      }
      info!("Session {}: re-arming after link loss", self.id);
      self.start_channel_setup();
   }

   fn on_timer(&mut self, token: TimerToken) {
      if !self.retry.expire(token) {
         return;
      }
      let settled = self.unwind.is_none() && self.flags.reconnecting;
      match token.kind {
         TimerKind::AcceptWindow => {
            if settled && self.state == State::AcceptConnecting && !self.control.is_connected() {
               info!("Session {}: reconnect accept window expired", self.id);
               self.last_error = Some(ErrorCode::ACCEPT_TIMEOUT);
               self.begin_unwind(Unwind::RearmAccept);
            }
         },
         TimerKind::ConnectRetry(kind) => {
            if settled && self.state == State::Connecting {
               let kind = if self.control.is_connected() {
                  kind
               } else {
                  ChannelKind::Control
               };
               self.connect(kind);
            }
         },
      }
   }

   // === Teardown ===

   fn begin_unwind(&mut self, unwind: Unwind) {
      debug!("Session {}: unwinding from {} ({unwind:?})", self.id, self.state);
      self.cancel_timers();
      self.unwind = Some(unwind);
      self.advance_unwind();
   }

   fn channels_quiescent(&self) -> bool {
      self.pending.accepting.is_empty()
         && self.pending.cancelling.is_empty()
         && self.pending.connecting.is_none()
         && !self.control.is_connected()
         && !self.interrupt.is_connected()
         && self.strays.is_empty()
         && self.held_interrupt.is_none()
   }

   /// Issues whatever the current unwind still needs and finishes it once
   /// every collaborator has confirmed.
   fn advance_unwind(&mut self) {
      let Some(unwind) = self.unwind.clone() else {
         return;
      };

      for kind in ChannelKind::ALL {
         if self.pending.accepting.contains(kind) && !self.pending.cancelling.contains(kind) {
            self.pending.cancelling.insert(kind);
            self.push_transport(TransportCommand::CancelConnectAccept { psm: kind.psm() });
         }
      }
      if let Some(kind) = self.pending.connecting
         && !self.pending.connect_cancelled
      {
         self.pending.connect_cancelled = true;
         self.push_transport(TransportCommand::CancelConnect {
            peer: self.peer,
            psm: kind.psm(),
         });
      }
      if let Some(held) = self.held_interrupt.take() {
         self.drop_stray(held.cid);
      }
      if self.interrupt.is_connected() {
         self.disconnect(ChannelKind::Interrupt);
      } else {
         self.disconnect(ChannelKind::Control);
      }

      if !self.channels_quiescent() {
         return;
      }

      match unwind {
         Unwind::RearmAccept => {
            self.unwind = None;
            self.rearm_accept();
            return;
         },
         Unwind::Failure { unpublish: false, .. } => {
            self.finish_unwind();
            return;
         },
         _ => {},
      }

      if self.records.in_flight().is_some() {
         return;
      }
      if let Some((kind, _)) = self.records.next_published() {
         self.enter(State::UnregisteringRecords);
         self.unregister_record(kind);
         return;
      }
      self.finish_unwind();
   }

   fn finish_unwind(&mut self) {
      let Some(unwind) = self.unwind.take() else {
         return;
      };
      match unwind {
         Unwind::Teardown(TeardownReason::Deactivate) => {
            info!("Session {}: deactivated", self.id);
            self.reset_to_idle(ResetScope::Keep);
            self.emit(HiddEvent::DeactivateConfirm(Ok(())));
         },
         Unwind::Teardown(TeardownReason::Cleanup) => {
            info!("Session {}: cleaned up", self.id);
            self.reset_to_idle(ResetScope::Forget);
         },
         Unwind::Failure { error, .. } => {
            warn!("Session {}: {error}", self.id);
            self.report_failure(error);
            self.reset_to_idle(ResetScope::Keep);
         },
         Unwind::RearmAccept => self.rearm_accept(),
      }
   }

   fn report_failure(&mut self, error: SessionError) {
      if std::mem::take(&mut self.activate_pending) {
         self.emit(HiddEvent::ActivateConfirm(Err(error)));
      } else if std::mem::take(&mut self.flags.user_requested) {
         self.emit(HiddEvent::ModeChanged {
            mode: PowerMode::Disconnect,
            status: Err(error),
         });
      } else if error == SessionError::RetriesExhausted {
         self.emit(HiddEvent::Disconnected {
            connection_id: self.session_cid,
            reason: error,
         });
      } else {
         self.emit(HiddEvent::ConnectFailed(error));
      }
   }

   fn rearm_accept(&mut self) {
      if self.flags.reconnecting && self.retry.try_begin_attempt() {
         info!(
            "Session {}: re-opening accept window ({}/{})",
            self.id,
            self.retry.count(),
            self.retry.max()
         );
         self.enter(State::AcceptConnecting);
         for kind in ChannelKind::ALL {
            self.accept(kind);
         }
         self.arm_accept_window();
      } else {
         self.give_up();
      }
   }

   // === Service records ===

   fn on_record(&mut self, ev: RecordEvent) {
      match ev {
         RecordEvent::Registered(result) => {
            let Some(kind) = self.records.finish_register(result.ok()) else {
               warn!("Session {}: unexpected record registration {result:?}", self.id);
               if let Ok(handle) = result {
                  self.outbox.push_back(Action::Record(RecordCommand::Unregister { handle }));
               }
               return;
            };
            match result {
               Ok(handle) => debug!("Session {}: {kind} record registered as {handle:#x}", self.id),
               Err(code) => {
                  warn!("Session {}: {kind} record registration failed: {code}", self.id);
                  self.last_error = Some(code);
                  if self.unwind.is_none() {
                     self.begin_unwind(Unwind::Failure {
                        error: SessionError::RecordRegistrationFailed(code),
                        unpublish: true,
                     });
                     return;
                  }
               },
            }
            if self.unwind.is_some() {
               self.advance_unwind();
            } else {
               self.publish_or_setup();
            }
         },
         RecordEvent::Unregistered { handle, result } => {
            let Some(kind) = self.records.finish_unregister(handle) else {
               debug!("Session {}: ignoring unregistration of {handle:#x}", self.id);
               return;
            };
            if let Err(code) = result {
               self.last_error = Some(code);
               if self.unwind.is_some() {
                  warn!("Session {}: {kind} record unregistration failed: {code}", self.id);
               } else {
                  warn!("Session {}: cannot replace {kind} record: {code}", self.id);
                  self.flags.replacing_records = false;
                  self.begin_unwind(Unwind::Failure {
                     error: SessionError::RecordUnregistrationFailed(code),
                     unpublish: true,
                  });
                  return;
               }
            }
            if self.unwind.is_some() {
               self.advance_unwind();
            } else if self.flags.replacing_records {
               self.continue_replacement();
            }
         },
      }
   }

   // === Transport ===

   fn on_transport(&mut self, ev: TransportEvent) {
      match ev {
         TransportEvent::Registered { psm } => self.on_psm_registered(psm),
         TransportEvent::ConnectAcceptConfirm { psm, peer, result } => {
            self.on_accept_confirm(psm, peer, result);
         },
         TransportEvent::CancelAcceptConfirm { psm } => self.on_cancel_accept_confirm(psm),
         TransportEvent::ConnectConfirm { psm, result } => self.on_connect_confirm(psm, result),
         TransportEvent::DataConfirm { cid, result } => self.on_data_confirm(cid, result),
         TransportEvent::SendBlocked { cid, frame } => {
            if let Some(kind) = self.kind_of(cid) {
               debug!("Session {}: {kind} channel congested", self.id);
               self.endpoint_mut(kind).stall(frame);
            }
         },
         TransportEvent::MoreSpace { cid } => {
            if let Some(kind) = self.kind_of(cid)
               && let Some(frame) = self.endpoint_mut(kind).take_stalled()
            {
               self.push_transport(TransportCommand::Send { cid, frame });
            }
         },
         TransportEvent::MoreData { cid } => {
            if let Some(kind) = self.kind_of(cid) {
               self.endpoint_mut(kind).set_pull_outstanding(true);
               self.push_transport(TransportCommand::Receive { cid });
            }
         },
         TransportEvent::DataIndication { cid, payload } => self.on_data_indication(cid, payload),
         TransportEvent::DisconnectIndication { cid, reason, local } => {
            self.on_disconnect(cid, reason, local);
         },
         TransportEvent::ModeChangeIndication { mode, result } => {
            let requested = matches!(
               self.disconnect_reason,
               DisconnectCause::ModeChange | DisconnectCause::AppRequested
            );
            if matches!(self.state, State::Connected | State::Connecting) && !requested {
               self.emit(HiddEvent::ModeChanged {
                  mode,
                  status: result.map_err(SessionError::Transport),
               });
            }
         },
      }
   }

   fn on_psm_registered(&mut self, psm: u16) {
      if self.state != State::Init {
         debug!("Session {}: PSM {psm:#x} registered outside init", self.id);
         return;
      }
      match ChannelKind::from_psm(psm) {
         Some(ChannelKind::Control) => {
            self.push_transport(TransportCommand::Register { psm: PSM_INTERRUPT });
         },
         Some(ChannelKind::Interrupt) => {
            info!("Session {}: ready", self.id);
            self.enter(State::Idle);
         },
         None => warn!("Session {}: registration of unknown PSM {psm:#x}", self.id),
      }
   }

   /// Takes an open channel into its endpoint, holding an interrupt channel
   /// back until control is open.
   fn adopt(&mut self, kind: ChannelKind, info: ChannelInfo) {
      debug!(
         "Session {}: {kind} channel {} open (host MTU {}, local MTU {})",
         self.id, info.cid, info.host_mtu, info.local_mtu
      );
      match kind {
         ChannelKind::Control => {
            self.control.open(info);
            if let Some(held) = self.held_interrupt.take() {
               self.interrupt.open(held);
            }
         },
         ChannelKind::Interrupt if self.control.is_connected() => self.interrupt.open(info),
         ChannelKind::Interrupt => self.held_interrupt = Some(info),
      }
   }

   fn on_accept_confirm(
      &mut self,
      psm: u16,
      peer: Address,
      result: Result<ChannelInfo, ErrorCode>,
   ) {
      let Some(kind) = ChannelKind::from_psm(psm) else {
         warn!("Session {}: accept confirm for unknown PSM {psm:#x}", self.id);
         return;
      };
      let expected = self.pending.accepting.remove(kind);

      match result {
         Ok(info) => {
            if !expected || self.state != State::AcceptConnecting {
               warn!("Session {}: unexpected {kind} channel from {peer}", self.id);
               self.drop_stray(info.cid);
               return;
            }
            self.peer = peer;
            self.adopt(kind, info);
            if self.unwind.is_some() {
               self.advance_unwind();
            } else if self.control.is_connected() && self.interrupt.is_connected() {
               self.complete_connection();
            }
         },
         Err(code) => {
            if !expected {
               debug!("Session {}: stale {kind} accept failure {code}", self.id);
               return;
            }
            self.last_error = Some(code);
            if self.unwind.is_some() {
               self.advance_unwind();
               return;
            }
            warn!("Session {}: {kind} accept failed: {code}", self.id);
            if self.flags.reconnecting {
               self.begin_unwind(Unwind::RearmAccept);
            } else {
               self.begin_unwind(Unwind::Failure {
                  error: SessionError::ConnectFailed(code),
                  unpublish: false,
               });
            }
         },
      }
   }

   fn on_cancel_accept_confirm(&mut self, psm: u16) {
      let Some(kind) = ChannelKind::from_psm(psm) else {
         return;
      };
      self.pending.accepting.remove(kind);
      if !self.pending.cancelling.remove(kind) {
         debug!("Session {}: unsolicited {kind} cancel confirm", self.id);
         return;
      }
      self.advance_unwind();
   }

   fn on_connect_confirm(&mut self, psm: u16, result: Result<ChannelInfo, ErrorCode>) {
      let Some(kind) = ChannelKind::from_psm(psm) else {
         warn!("Session {}: connect confirm for unknown PSM {psm:#x}", self.id);
         return;
      };
      let expected = self.pending.connecting == Some(kind);
      if expected {
         self.pending.connecting = None;
         self.pending.connect_cancelled = false;
      }

      match result {
         Ok(info) => {
            let usable = kind == ChannelKind::Control || self.control.is_connected();
            if !expected || self.state != State::Connecting || !usable {
               warn!("Session {}: unexpected {kind} channel {}", self.id, info.cid);
               self.drop_stray(info.cid);
               return;
            }
            self.adopt(kind, info);
            if self.unwind.is_some() {
               self.advance_unwind();
               return;
            }
            match kind {
               ChannelKind::Control => self.connect(ChannelKind::Interrupt),
               ChannelKind::Interrupt => self.complete_connection(),
            }
         },
         Err(code) => {
            if !expected {
               debug!("Session {}: stale {kind} connect failure {code}", self.id);
               return;
            }
            if self.unwind.is_some() {
               self.advance_unwind();
               return;
            }
            self.last_error = Some(code);
            warn!("Session {}: {kind} connect failed: {code}", self.id);
            self.connect_failed(kind, code);
         },
      }
   }

   fn connect_failed(&mut self, kind: ChannelKind, code: ErrorCode) {
      if self.flags.reconnecting && self.retry.try_begin_attempt() {
         let kind = if self.control.is_connected() {
            kind
         } else {
            ChannelKind::Control
         };
         let (token, after) = self.retry.arm_connect_retry(kind);
         info!("Session {}: retrying {kind} connect in {after:?}", self.id);
         self.outbox.push_back(Action::StartTimer { token, after });
         return;
      }
      let error = if self.flags.reconnecting {
         SessionError::RetriesExhausted
      } else {
         SessionError::ConnectFailed(code)
      };
      self.begin_unwind(Unwind::Failure {
         error,
         unpublish: false,
      });
   }

   fn complete_connection(&mut self) {
      self.cancel_timers();
      self.retry.reset();
      self.flags.reconnecting = false;
      self.disconnect_reason = DisconnectCause::None;
      self.down_cause = None;
      self.last_error = None;
      self.session_cid = self.control.cid();
      self.enter(State::Connected);
      info!(
         "Session {}: connected to {} (control MTU {}, interrupt MTU {})",
         self.id,
         self.peer,
         self.control.host_mtu(),
         self.interrupt.host_mtu()
      );

      if std::mem::take(&mut self.flags.user_requested) {
         self.emit(HiddEvent::ModeChanged {
            mode: PowerMode::Active,
            status: Ok(()),
         });
      }
      if let Some(connection_id) = self.session_cid {
         self.emit(HiddEvent::Connected { connection_id });
      }
   }

   fn on_disconnect(&mut self, cid: ConnectionId, reason: ErrorCode, local: bool) {
      if let Some(pos) = self.strays.iter().position(|&c| c == cid) {
         self.strays.swap_remove(pos);
         self.after_channel_down(reason, local);
         return;
      }
      if self.held_interrupt.is_some_and(|held| held.cid == cid) {
         self.held_interrupt = None;
         self.after_channel_down(reason, local);
         return;
      }
      let Some(kind) = self.kind_of(cid) else {
         debug!("Session {}: disconnect of unknown channel {cid}", self.id);
         return;
      };

      info!(
         "Session {}: {kind} channel {cid} closed ({reason}, {})",
         self.id,
         if local { "local" } else { "remote" }
      );
      self.pending.disconnecting.remove(kind);
      self.endpoint_mut(kind).close();
      let link_lost = reason.is_link_loss();
      if self.state == State::Connected && self.down_cause.is_none() {
         self.down_cause = Some(DisconnectCause::classify(reason, local));
      }

      match kind {
         ChannelKind::Interrupt => {
            if link_lost {
               self.control.close();
               self.pending.disconnecting.remove(ChannelKind::Control);
            } else if local || self.unwind.is_some() {
               self.disconnect(ChannelKind::Control);
            }
         },
         ChannelKind::Control => {
            if let Some(orphan) = self.interrupt.close() {
               let already = self.pending.disconnecting.remove(ChannelKind::Interrupt);
               match (link_lost, already) {
                  (true, _) => {},
                  (false, true) => self.strays.push(orphan),
                  (false, false) => self.drop_stray(orphan),
               }
            }
         },
      }
      self.after_channel_down(reason, local);
   }

   fn after_channel_down(&mut self, reason: ErrorCode, local: bool) {
      if self.unwind.is_some() {
         self.advance_unwind();
         return;
      }
      let remaining = self.control.is_connected()
         || self.interrupt.is_connected()
         || !self.strays.is_empty()
         || self.held_interrupt.is_some();
      if remaining {
         return;
      }

      match self.state {
         State::Connected => {
            let cause = self
               .down_cause
               .take()
               .unwrap_or_else(|| DisconnectCause::classify(reason, local));
            self.connected_link_down(cause);
         },
         State::Connecting => {
            // a pending connect confirm will drive the retry
            if self.pending.connecting.is_none() && !self.retry.retry_pending() {
               self.connect_failed(ChannelKind::Control, reason);
            }
         },
         State::AcceptConnecting => {
            for kind in ChannelKind::ALL {
               if !self.pending.accepting.contains(kind) {
                  self.accept(kind);
               }
            }
         },
         _ => {},
      }
   }

   fn connected_link_down(&mut self, cause: DisconnectCause) {
      let connection_id = self.session_cid;
      match self.disconnect_reason {
         DisconnectCause::UnplugIndicated | DisconnectCause::UnplugRequested => {
            let peer = self.peer;
            info!("Session {}: virtual cable to {peer} unplugged", self.id);
            self.reset_to_idle(ResetScope::Keep);
            self.peer = Address::any();
            self.emit(HiddEvent::Unplugged { peer, status: Ok(()) });
         },
         DisconnectCause::ModeChange => {
            self.close_channels();
            self.enter(State::NotConnected);
            self.emit(HiddEvent::ModeChanged {
               mode: PowerMode::Disconnect,
               status: Ok(()),
            });
         },
         DisconnectCause::AppRequested => {
            self.close_channels();
            self.enter(State::NotConnected);
            self.emit(HiddEvent::Disconnected {
               connection_id,
               reason: SessionError::DisconnectedLocal,
            });
         },
         _ => {
            self.disconnect_reason = cause;
            let reconnectable = self.flags.virtual_cable || self.flags.reconnect_initiate;
            if cause == DisconnectCause::LinkLoss && reconnectable {
               if !self.retry.can_retry() {
                  self.give_up();
                  return;
               }
               info!("Session {}: link lost, reconnecting", self.id);
               self.close_channels();
               self.flags.reconnecting = true;
               self.enter(State::Idle);
               self.emit(HiddEvent::Reconnecting { connection_id });
               if self.config.auto_reactivate {
                  self.outbox.push_back(Action::Reactivate);
               }
               return;
            }

            let reason = match cause {
               DisconnectCause::LinkLoss => SessionError::DisconnectedLinkLoss,
               DisconnectCause::Local => SessionError::DisconnectedLocal,
               _ => SessionError::DisconnectedRemote,
            };
            self.reset_to_idle(ResetScope::Keep);
            self.emit(HiddEvent::Disconnected {
               connection_id,
               reason,
            });
         },
      }
   }

   // === Data ===

   fn send_message(&mut self, kind: ChannelKind, message: Vec<u8>) {
      if let Some(frame) = self.endpoint_mut(kind).enqueue(message) {
         self.send_frame(kind, frame);
      }
   }

   fn send_frame(&mut self, kind: ChannelKind, frame: Vec<u8>) {
      let Some(cid) = self.endpoint(kind).cid() else {
         return;
      };
      debug!("→ {kind} {cid}: {}", hex::encode(&frame));
      self.push_transport(TransportCommand::Send { cid, frame });
   }

   fn on_data_confirm(&mut self, cid: ConnectionId, result: Result<(), ErrorCode>) {
      let Some(kind) = self.kind_of(cid) else {
         debug!("Session {}: data confirm for unknown channel {cid}", self.id);
         return;
      };
      match self.endpoint_mut(kind).on_send_complete(result) {
         SendProgress::Continue(frame) => self.send_frame(kind, frame),
         SendProgress::Finished { status, next } => {
            if kind == ChannelKind::Interrupt {
               self.emit(HiddEvent::DataConfirm(status.map_err(SessionError::Transport)));
            }
            match next {
               Some(frame) => self.send_frame(kind, frame),
               None if kind == ChannelKind::Control
                  && self.disconnect_reason == DisconnectCause::UnplugRequested =>
               {
                  self.disconnect(ChannelKind::Interrupt);
               },
               None => {},
            }
         },
         SendProgress::Unexpected => {
            debug!("Session {}: unsolicited data confirm on {kind}", self.id);
         },
      }
   }

   fn on_data_indication(&mut self, cid: ConnectionId, payload: Vec<u8>) {
      let Some(kind) = self.kind_of(cid) else {
         debug!("Session {}: data on unknown channel {cid}", self.id);
         return;
      };
      self.endpoint_mut(kind).set_pull_outstanding(false);

      if self.state != State::Connected || self.unwind.is_some() {
         if self.state.is_transient() && self.unwind.is_none() {
            self.saved_transport
               .push_back(TransportEvent::DataIndication { cid, payload });
         } else {
            debug!("Session {}: dropping data in {}", self.id, self.state);
         }
         return;
      }

      debug!("← {kind} {cid}: {}", hex::encode(&payload));
      match self.endpoint_mut(kind).receive(payload) {
         Reassembly::Partial => {},
         Reassembly::Complete(message) => self.dispatch_message(kind, message),
         Reassembly::Violation { length } => {
            let mtu = self.endpoint(kind).local_mtu();
            warn!(
               "Session {}: {}",
               self.id,
               SessionError::ProtocolViolation { length, mtu }
            );
         },
      }
   }

   fn dispatch_message(&mut self, kind: ChannelKind, mut message: Vec<u8>) {
      let Some(&header) = message.first() else {
         return;
      };
      let Some((transaction, parameter)) = TransactionType::from_header(header) else {
         warn!("Session {}: unknown transaction {header:#04x} on {kind}", self.id);
         return;
      };
      let data = message.split_off(1);

      match kind {
         ChannelKind::Control => {
            if transaction == TransactionType::HidControl && parameter == VIRTUAL_CABLE_UNPLUG {
               info!("Session {}: host unplugged the virtual cable", self.id);
               self.disconnect_reason = DisconnectCause::UnplugIndicated;
               self.disconnect(ChannelKind::Interrupt);
               return;
            }
            self.emit(HiddEvent::ControlIndication {
               transaction,
               parameter,
               data,
            });
         },
         ChannelKind::Interrupt => self.emit(HiddEvent::DataIndication {
            report_type: ReportType::from_parameter(parameter),
            data,
         }),
      }
   }

   // === Handover ===

   pub(crate) fn snapshot(&self) -> HandoverSnapshot {
      let endpoint = |ep: &ChannelEndpoint| EndpointSnapshot {
         cid: ep.cid(),
         host_mtu: ep.host_mtu(),
         local_mtu: ep.local_mtu(),
      };
      HandoverSnapshot {
         state: self.state,
         control: endpoint(&self.control),
         interrupt: endpoint(&self.interrupt),
         last_error: self.last_error,
         disconnect_reason: self.disconnect_reason,
         flags: self.flags,
         retry_count: self.retry.count(),
         flush_timeout: self.flush_timeout,
      }
   }

   /// Rebuilds a session from a validated snapshot. Record bytes are local
   /// constants of the new owner and are supplied unpublished.
   pub(crate) fn restore(
      id: SessionId,
      config: SessionConfig,
      snapshot: HandoverSnapshot,
      peer: Address,
      hid_record: Option<Vec<u8>>,
      device_id_record: Option<Vec<u8>>,
   ) -> Self {
      let mut session = Self::blank(id, config, snapshot.state);
      session.peer = peer;
      session.control.restore(
         snapshot.control.cid,
         snapshot.control.host_mtu,
         snapshot.control.local_mtu,
      );
      session.interrupt.restore(
         snapshot.interrupt.cid,
         snapshot.interrupt.host_mtu,
         snapshot.interrupt.local_mtu,
      );
      session.flags = snapshot.flags;
      session.flags.replacing_records = false;
      session.last_error = snapshot.last_error;
      session.disconnect_reason = snapshot.disconnect_reason;
      session.retry.restore(snapshot.retry_count);
      session.flush_timeout = snapshot.flush_timeout;
      session.session_cid = session.control.cid();
      if let Some(record) = hid_record {
         session.records.supply(RecordKind::Hid, record);
      }
      if let Some(record) = device_id_record {
         session.records.supply(RecordKind::DeviceId, record);
      }

      match session.state {
         State::Init => session.push_transport(TransportCommand::Register { psm: PSM_CONTROL }),
         State::AcceptConnecting => {
            for kind in ChannelKind::ALL {
               if !session.endpoint(kind).is_connected() {
                  session.accept(kind);
               }
            }
            if session.flags.reconnecting {
               session.arm_accept_window();
            }
         },
         _ => {},
      }
      session
   }
}

/// Puts `header` into the reserved first byte of a message buffer.
fn write_header(buffer: &mut Vec<u8>, header: u8) {
   match buffer.first_mut() {
      Some(first) => *first = header,
      None => buffer.push(header),
   }
}

#[cfg(test)]
pub(crate) mod testing {
   //! Scripted collaborators for driving sessions in tests.

   use super::*;
   use crate::hid::sdp::test_hid_record;

   pub fn host() -> Address {
      Address::new([0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x13])
   }

   pub fn cid(raw: u32) -> ConnectionId {
      ConnectionId::new(raw).unwrap()
   }

   pub fn config(max_retries: u32) -> SessionConfig {
      SessionConfig {
         max_retries,
         local_mtu: 48,
         ..SessionConfig::default()
      }
   }

   pub fn activate(peer: Address, virtual_cable: bool, reconnect_initiate: bool) -> Request {
      Request::Activate(ActivateRequest {
         peer,
         hid_record: Some(test_hid_record(virtual_cable, reconnect_initiate)),
         device_id_record: None,
         qos_control: None,
         qos_interrupt: None,
         flush_timeout: FLUSH_TIMEOUT_INFINITE,
      })
   }

   pub fn channel(raw: u32, mtu: u16) -> ChannelInfo {
      ChannelInfo {
         cid: cid(raw),
         host_mtu: mtu,
         local_mtu: mtu,
      }
   }

   pub fn accepted(psm: u16, raw: u32) -> TransportEvent {
      TransportEvent::ConnectAcceptConfirm {
         psm,
         peer: host(),
         result: Ok(channel(raw, 48)),
      }
   }

   pub fn connected(psm: u16, raw: u32) -> TransportEvent {
      TransportEvent::ConnectConfirm {
         psm,
         result: Ok(channel(raw, 48)),
      }
   }

   pub fn closed(raw: u32, reason: ErrorCode, local: bool) -> TransportEvent {
      TransportEvent::DisconnectIndication {
         cid: cid(raw),
         reason,
         local,
      }
   }

   /// Handles `input` and checks the channel invariant afterwards.
   pub fn feed(session: &mut Session, input: impl Into<Input>) -> Vec<Action> {
      session.handle(input);
      assert!(
         session.channels_consistent(),
         "interrupt open without control in {}",
         session.state()
      );
      session.take_actions()
   }

   pub fn events(actions: &[Action]) -> Vec<HiddEvent> {
      actions
         .iter()
         .filter_map(|a| match a {
            Action::Emit(ev) => Some(ev.clone()),
            _ => None,
         })
         .collect()
   }

   pub fn commands(actions: &[Action]) -> Vec<TransportCommand> {
      actions
         .iter()
         .filter_map(|a| match a {
            Action::Transport(cmd) => Some(cmd.clone()),
            _ => None,
         })
         .collect()
   }

   /// A session past PSM registration.
   pub fn ready(max_retries: u32) -> Session {
      let mut session = Session::new(SessionId::new(1), config(max_retries));
      feed(&mut session, TransportEvent::Registered { psm: PSM_CONTROL });
      feed(&mut session, TransportEvent::Registered { psm: PSM_INTERRUPT });
      session
   }

   /// A session connected in acceptor mode: control 0x40, interrupt 0x41.
   pub fn accept_connected(virtual_cable: bool) -> Session {
      accept_connected_with_budget(7, virtual_cable)
   }

   pub fn accept_connected_with_budget(max_retries: u32, virtual_cable: bool) -> Session {
      let mut session = ready(max_retries);
      feed(&mut session, activate(Address::any(), virtual_cable, false));
      feed(&mut session, RecordEvent::Registered(Ok(7)));
      feed(&mut session, accepted(PSM_CONTROL, 0x40));
      feed(&mut session, accepted(PSM_INTERRUPT, 0x41));
      assert_eq!(session.state(), State::Connected);
      session
   }

   /// Answers every collaborator command the way a well-behaved stack would
   /// until nothing is left, returning the emitted events.
   pub fn settle(session: &mut Session, mut inputs: VecDeque<Input>) -> Vec<HiddEvent> {
      let mut emitted = Vec::new();
      let mut next_handle = 0x100;
      let mut rounds = 0;
      while let Some(input) = inputs.pop_front() {
         rounds += 1;
         assert!(rounds < 1000, "session does not settle");
         for action in feed(session, input) {
            match action {
               Action::Emit(ev) => emitted.push(ev),
               Action::Transport(TransportCommand::Register { psm }) => {
                  inputs.push_back(TransportEvent::Registered { psm }.into());
               },
               Action::Transport(TransportCommand::CancelConnectAccept { psm }) => {
                  inputs.push_back(TransportEvent::CancelAcceptConfirm { psm }.into());
               },
               Action::Transport(TransportCommand::CancelConnect { psm, .. }) => {
                  inputs.push_back(
                     TransportEvent::ConnectConfirm {
                        psm,
                        result: Err(ErrorCode::CANCELLED),
                     }
                     .into(),
                  );
               },
               Action::Transport(TransportCommand::Disconnect { cid }) => {
                  inputs.push_back(
                     TransportEvent::DisconnectIndication {
                        cid,
                        reason: ErrorCode::LOCAL_TERMINATED,
                        local: true,
                     }
                     .into(),
                  );
               },
               Action::Transport(TransportCommand::Send { cid, .. }) => {
                  inputs.push_back(TransportEvent::DataConfirm { cid, result: Ok(()) }.into());
               },
               Action::Record(RecordCommand::Register { .. }) => {
                  next_handle += 1;
                  inputs.push_back(RecordEvent::Registered(Ok(next_handle)).into());
               },
               Action::Record(RecordCommand::Unregister { handle }) => {
                  inputs.push_back(RecordEvent::Unregistered { handle, result: Ok(()) }.into());
               },
               _ => {},
            }
         }
      }
      emitted
   }
}

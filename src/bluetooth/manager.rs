//! HID device session manager.
//!
//! This module runs the actor that owns every session, executes the actions
//! they produce against the Bluetooth collaborators and feeds collaborator
//! results, timer expiries and re-arm requests back to them one at a time.

use std::collections::HashMap;

use log::{debug, info, warn};
use serde::Serialize;
use smol_str::{SmolStr, ToSmolStr};
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time,
};

use crate::{
   bluetooth::{
      Completion, CompletionReceiver, CompletionSender, RecordDirectory, Transport,
   },
   error::{HiddError, Result, SessionError},
   event::EventSender,
   hid::{
      Session, SessionConfig, SessionId, SessionRegistry, State,
      handover::ImportContext,
      message::{Action, Input, Request},
      retry::TimerToken,
   },
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;

/// Externally visible summary of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
   pub id: u32,
   pub state: &'static str,
   pub peer: SmolStr,
   pub retry_count: u32,
   pub control: Option<u32>,
   pub interrupt: Option<u32>,
   pub virtual_cable: bool,
}

impl SessionStatus {
   fn of(session: &Session) -> Self {
      Self {
         id: session.id().get(),
         state: session.state().to_str(),
         peer: session.peer().to_smolstr(),
         retry_count: session.retry_count(),
         control: session.control().cid().map(|c| c.get()),
         interrupt: session.interrupt().cid().map(|c| c.get()),
         virtual_cable: session.flags().virtual_cable,
      }
   }

   pub fn to_json(&self) -> serde_json::Value {
      serde_json::to_value(self).unwrap_or_default()
   }
}

// === Commands ===

#[derive(Debug)]
enum ManagerCommand {
   CreateSession(oneshot::Sender<SessionId>),
   Request(SessionId, Request, oneshot::Sender<Result<()>>),
   GetSession(SessionId, oneshot::Sender<Option<SessionStatus>>),
   ListSessions(oneshot::Sender<Vec<SessionStatus>>),
   RemoveSession(SessionId, oneshot::Sender<Result<()>>),
   ExportHandover(SessionId, oneshot::Sender<Result<Vec<u8>>>),
   ImportHandover(Vec<u8>, ImportContext, oneshot::Sender<SessionId>),
}

// === Main Manager ===

/// Handle to the session manager.
///
/// This type is cheaply cloneable; every clone talks to the same actor.
#[derive(Clone)]
pub struct HiddManager {
   inbox: mpsc::Sender<ManagerCommand>,
}

impl HiddManager {
   /// Spawns the manager. `completions` must be the channel the collaborators
   /// were built with.
   pub fn new<T, R>(
      event_tx: EventSender,
      config: SessionConfig,
      transport: T,
      records: R,
      completions: (CompletionSender, CompletionReceiver),
   ) -> Self
   where
      T: Transport,
      R: RecordDirectory,
   {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let (completion_tx, completion_rx) = completions;
      let actor = ManagerActor {
         registry: SessionRegistry::new(config),
         transport,
         records,
         event_tx,
         command_rx,
         completion_rx,
         completion_tx,
         timers: HashMap::new(),
      };
      tokio::spawn(actor.run());
      Self { inbox: command_tx }
   }

   async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(make(tx))
         .await
         .map_err(|_| HiddError::ManagerShutdown)?;
      rx.await.map_err(|_| HiddError::ManagerShutdown)
   }

   pub async fn create_session(&self) -> Result<SessionId> {
      self.call(ManagerCommand::CreateSession).await
   }

   /// Hands `request` to session `id`. Outcomes arrive as events.
   pub async fn request(&self, id: SessionId, request: Request) -> Result<()> {
      self
         .call(|tx| ManagerCommand::Request(id, request, tx))
         .await?
   }

   pub async fn get_session(&self, id: SessionId) -> Result<SessionStatus> {
      self
         .call(|tx| ManagerCommand::GetSession(id, tx))
         .await?
         .ok_or(HiddError::SessionNotFound(id))
   }

   pub async fn all_sessions(&self) -> Vec<SessionStatus> {
      self
         .call(ManagerCommand::ListSessions)
         .await
         .unwrap_or_default()
   }

   /// Drops an idle session.
   pub async fn remove_session(&self, id: SessionId) -> Result<()> {
      self.call(|tx| ManagerCommand::RemoveSession(id, tx)).await?
   }

   pub async fn export_handover(&self, id: SessionId) -> Result<Vec<u8>> {
      self.call(|tx| ManagerCommand::ExportHandover(id, tx)).await?
   }

   pub async fn import_handover(&self, blob: Vec<u8>, ctx: ImportContext) -> Result<SessionId> {
      self
         .call(|tx| ManagerCommand::ImportHandover(blob, ctx, tx))
         .await
   }
}

// === Manager Actor ===

struct ManagerActor<T, R> {
   registry: SessionRegistry,
   transport: T,
   records: R,
   event_tx: EventSender,
   command_rx: mpsc::Receiver<ManagerCommand>,
   completion_rx: CompletionReceiver,
   completion_tx: CompletionSender,
   timers: HashMap<(SessionId, TimerToken), JoinHandle<()>>,
}

impl<T: Transport, R: RecordDirectory> ManagerActor<T, R> {
   async fn run(mut self) {
      info!("Session manager starting up");

      loop {
         select! {
            cmd = self.command_rx.recv() => {
               let Some(cmd) = cmd else {
                  info!("Session manager shutting down");
                  break;
               };
               self.handle_command(cmd);
            }
            Some(completion) = self.completion_rx.recv() => {
               self.handle_completion(completion);
            }
         }
      }

      self.cleanup();
   }

   fn handle_command(&mut self, cmd: ManagerCommand) {
      match cmd {
         ManagerCommand::CreateSession(reply) => {
            let id = self.registry.create();
            self.drain(id);
            let _ = reply.send(id);
         },
         ManagerCommand::Request(id, request, reply) => {
            debug!("Session {id}: request {request:?}");
            let result = self.registry.handle(id, request).map(|actions| self.execute(id, actions));
            let _ = reply.send(result);
         },
         ManagerCommand::GetSession(id, reply) => {
            let _ = reply.send(self.registry.get(id).map(SessionStatus::of));
         },
         ManagerCommand::ListSessions(reply) => {
            let mut ids: Vec<_> = self.registry.ids().collect();
            ids.sort_unstable();
            let states = ids
               .into_iter()
               .filter_map(|id| self.registry.get(id).map(SessionStatus::of))
               .collect();
            let _ = reply.send(states);
         },
         ManagerCommand::RemoveSession(id, reply) => {
            let _ = reply.send(self.remove_session(id));
         },
         ManagerCommand::ExportHandover(id, reply) => {
            let result = self.registry.export_handover(id);
            if result.is_ok() {
               self.cancel_timers(id);
            }
            let _ = reply.send(result);
         },
         ManagerCommand::ImportHandover(blob, ctx, reply) => {
            let id = self.registry.import_handover(&blob, ctx);
            if let Some(session) = self.registry.get(id) {
               for cid in [session.control().cid(), session.interrupt().cid()]
                  .into_iter()
                  .flatten()
               {
                  self.transport.rebind(cid, id);
               }
            }
            self.drain(id);
            let _ = reply.send(id);
         },
      }
   }

   fn remove_session(&mut self, id: SessionId) -> Result<()> {
      let state = self
         .registry
         .get(id)
         .map(Session::state)
         .ok_or(HiddError::SessionNotFound(id))?;
      if !matches!(state, State::Init | State::Idle) {
         return Err(SessionError::InvalidState(state).into());
      }
      self.registry.remove(id);
      self.cancel_timers(id);
      self.transport.release(id);
      info!("Session {id}: removed");
      Ok(())
   }

   fn handle_completion(&mut self, Completion { session, input }: Completion) {
      if let Input::Timer(token) = &input {
         self.timers.remove(&(session, *token));
      }
      match self.registry.handle(session, input) {
         Ok(actions) => self.execute(session, actions),
         Err(e) => debug!("Dropping completion: {e}"),
      }
   }

   fn drain(&mut self, id: SessionId) {
      if let Ok(actions) = self.registry.take_actions(id) {
         self.execute(id, actions);
      }
   }

   fn execute(&mut self, session: SessionId, actions: Vec<Action>) {
      for action in actions {
         match action {
            Action::Transport(command) => self.transport.execute(session, command),
            Action::Record(command) => self.records.execute(session, command),
            Action::StartTimer { token, after } => {
               let completions = self.completion_tx.clone();
               let task = tokio::spawn(async move {
                  time::sleep(after).await;
                  let _ = completions.send(Completion::new(session, Input::Timer(token)));
               });
               if let Some(old) = self.timers.insert((session, token), task) {
                  old.abort();
               }
            },
            Action::CancelTimer(token) => {
               if let Some(task) = self.timers.remove(&(session, token)) {
                  task.abort();
               }
            },
            Action::Reactivate => {
               if self
                  .completion_tx
                  .send(Completion::new(session, Input::Reactivate))
                  .is_err()
               {
                  warn!("Session {session}: cannot schedule re-activation");
               }
            },
            Action::Emit(event) => self.event_tx.emit(session, event),
         }
      }
   }

   fn cancel_timers(&mut self, session: SessionId) {
      self.timers.retain(|(owner, _), task| {
         let keep = *owner != session;
         if !keep {
            task.abort();
         }
         keep
      });
   }

   fn cleanup(&mut self) {
      for task in self.timers.values() {
         task.abort();
      }
      self.timers.clear();
      let ids: Vec<_> = self.registry.ids().collect();
      for id in ids {
         self.transport.release(id);
      }
   }
}

#[cfg(test)]
mod tests {
   use std::{sync::Arc, time::Duration};

   use bluer::Address;
   use parking_lot::Mutex;
   use tokio::sync::Notify;

   use super::*;
   use crate::{
      error::ErrorCode,
      event::{EventBus, HiddEvent},
      hid::{
         message::{
            ActivateRequest, RecordCommand, RecordEvent, TransportCommand, TransportEvent,
         },
         protocol::{ChannelInfo, ConnectionId, FLUSH_TIMEOUT_INFINITE, ReportType},
         sdp::test_hid_record,
      },
   };

   /// Answers every command like a cooperative stack would.
   struct FakeTransport {
      completions: CompletionSender,
   }

   impl FakeTransport {
      fn reply(&self, session: SessionId, event: TransportEvent) {
         self.completions.send(Completion::new(session, event)).unwrap();
      }
   }

   fn channel(psm: u16) -> ChannelInfo {
      ChannelInfo {
         cid: ConnectionId::new(0x40 + u32::from(psm)).unwrap(),
         host_mtu: 48,
         local_mtu: 48,
      }
   }

   impl Transport for FakeTransport {
      fn execute(&mut self, session: SessionId, command: TransportCommand) {
         match command {
            TransportCommand::Register { psm } => {
               self.reply(session, TransportEvent::Registered { psm });
            },
            TransportCommand::ConnectAccept { psm, .. } => self.reply(
               session,
               TransportEvent::ConnectAcceptConfirm {
                  psm,
                  peer: Address::new([1, 2, 3, 4, 5, 6]),
                  result: Ok(channel(psm)),
               },
            ),
            TransportCommand::CancelConnectAccept { psm } => {
               self.reply(session, TransportEvent::CancelAcceptConfirm { psm });
            },
            TransportCommand::Connect { psm, .. } => self.reply(
               session,
               TransportEvent::ConnectConfirm {
                  psm,
                  result: Ok(channel(psm)),
               },
            ),
            TransportCommand::CancelConnect { psm, .. } => self.reply(
               session,
               TransportEvent::ConnectConfirm {
                  psm,
                  result: Err(ErrorCode::CANCELLED),
               },
            ),
            TransportCommand::Disconnect { cid } => self.reply(
               session,
               TransportEvent::DisconnectIndication {
                  cid,
                  reason: ErrorCode::LOCAL_TERMINATED,
                  local: true,
               },
            ),
            TransportCommand::Send { cid, .. } => {
               self.reply(session, TransportEvent::DataConfirm { cid, result: Ok(()) });
            },
            TransportCommand::Receive { .. } => {},
         }
      }

      fn release(&mut self, _session: SessionId) {}

      fn rebind(&mut self, _cid: ConnectionId, _session: SessionId) {}
   }

   struct FakeDirectory {
      completions: CompletionSender,
      next: u32,
   }

   impl RecordDirectory for FakeDirectory {
      fn execute(&mut self, session: SessionId, command: RecordCommand) {
         let event = match command {
            RecordCommand::Register { .. } => {
               self.next += 1;
               RecordEvent::Registered(Ok(self.next))
            },
            RecordCommand::Unregister { handle } => RecordEvent::Unregistered { handle, result: Ok(()) },
         };
         self.completions.send(Completion::new(session, event)).unwrap();
      }
   }

   #[derive(Default)]
   struct Recorder {
      events: Mutex<Vec<(SessionId, HiddEvent)>>,
      notify: Notify,
   }

   impl EventBus for Recorder {
      fn emit(&self, session: SessionId, event: HiddEvent) {
         self.events.lock().push((session, event));
         self.notify.notify_waiters();
      }
   }

   impl Recorder {
      async fn wait_for(&self, session: SessionId, pred: impl Fn(&HiddEvent) -> bool) -> HiddEvent {
         let search = async {
            loop {
               let notified = self.notify.notified();
               if let Some((_, ev)) = self
                  .events
                  .lock()
                  .iter()
                  .find(|(s, ev)| *s == session && pred(ev))
               {
                  return ev.clone();
               }
               notified.await;
            }
         };
         time::timeout(Duration::from_secs(5), search)
            .await
            .expect("event not emitted in time")
      }
   }

   fn start() -> (HiddManager, Arc<Recorder>) {
      let (tx, rx) = crate::bluetooth::completion_channel();
      let recorder = Arc::new(Recorder::default());
      let manager = HiddManager::new(
         recorder.clone(),
         SessionConfig {
            local_mtu: 48,
            ..SessionConfig::default()
         },
         FakeTransport {
            completions: tx.clone(),
         },
         FakeDirectory {
            completions: tx.clone(),
            next: 0x100,
         },
         (tx, rx),
      );
      (manager, recorder)
   }

   fn activate() -> Request {
      Request::Activate(ActivateRequest {
         peer: Address::any(),
         hid_record: Some(test_hid_record(true, false)),
         device_id_record: None,
         qos_control: None,
         qos_interrupt: None,
         flush_timeout: FLUSH_TIMEOUT_INFINITE,
      })
   }

   #[tokio::test]
   async fn test_session_lifecycle() {
      let (manager, recorder) = start();
      let id = manager.create_session().await.unwrap();
      manager.request(id, activate()).await.unwrap();

      recorder
         .wait_for(id, |ev| matches!(ev, HiddEvent::Connected { .. }))
         .await;
      let status = manager.get_session(id).await.unwrap();
      assert_eq!(status.state, "Connected");
      assert_eq!(status.peer, "01:02:03:04:05:06");

      manager
         .request(
            id,
            Request::DataRequest {
               report_type: ReportType::Input,
               report: vec![0; 100],
            },
         )
         .await
         .unwrap();
      let confirm = recorder
         .wait_for(id, |ev| matches!(ev, HiddEvent::DataConfirm(_)))
         .await;
      assert_eq!(confirm, HiddEvent::DataConfirm(Ok(())));

      manager.request(id, Request::Deactivate).await.unwrap();
      recorder
         .wait_for(id, |ev| matches!(ev, HiddEvent::DeactivateConfirm(_)))
         .await;
      assert_eq!(manager.get_session(id).await.unwrap().state, "Idle");

      manager.remove_session(id).await.unwrap();
      assert!(manager.all_sessions().await.is_empty());
   }

   #[tokio::test]
   async fn test_unknown_session() {
      let (manager, _) = start();
      let missing = SessionId::new(77);
      assert!(matches!(
         manager.request(missing, Request::Deactivate).await,
         Err(HiddError::SessionNotFound(_))
      ));
      assert!(matches!(
         manager.get_session(missing).await,
         Err(HiddError::SessionNotFound(_))
      ));
   }

   #[tokio::test]
   async fn test_remove_refused_while_connected() {
      let (manager, recorder) = start();
      let id = manager.create_session().await.unwrap();
      manager.request(id, activate()).await.unwrap();
      recorder
         .wait_for(id, |ev| matches!(ev, HiddEvent::Connected { .. }))
         .await;

      assert!(matches!(
         manager.remove_session(id).await,
         Err(HiddError::Session(SessionError::InvalidState(State::Connected)))
      ));
   }

   #[tokio::test]
   async fn test_handover_within_manager() {
      let (manager, recorder) = start();
      let id = manager.create_session().await.unwrap();
      manager.request(id, activate()).await.unwrap();
      recorder
         .wait_for(id, |ev| matches!(ev, HiddEvent::Connected { .. }))
         .await;

      let blob = manager.export_handover(id).await.unwrap();
      assert!(manager.get_session(id).await.is_err());

      let moved = manager
         .import_handover(
            blob,
            ImportContext {
               peer: Some(Address::new([1, 2, 3, 4, 5, 6])),
               hid_record: Some(test_hid_record(true, false)),
               device_id_record: None,
            },
         )
         .await
         .unwrap();
      assert_eq!(manager.get_session(moved).await.unwrap().state, "Connected");

      manager
         .request(
            moved,
            Request::DataRequest {
               report_type: ReportType::Input,
               report: vec![0, 1],
            },
         )
         .await
         .unwrap();
      let confirm = recorder
         .wait_for(moved, |ev| matches!(ev, HiddEvent::DataConfirm(_)))
         .await;
      assert_eq!(confirm, HiddEvent::DataConfirm(Ok(())));
   }
}

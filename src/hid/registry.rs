//! Owner of every session in one controller instance.

use std::collections::HashMap;

use log::{debug, info};

use crate::{
   error::{HiddError, Result},
   hid::{
      SessionId,
      handover::{self, ImportContext},
      message::{Action, Input},
      session::{Session, SessionConfig},
   },
};

pub struct SessionRegistry {
   config: SessionConfig,
   sessions: HashMap<SessionId, Session>,
   next_id: u32,
}

impl SessionRegistry {
   pub fn new(config: SessionConfig) -> Self {
      Self {
         config,
         sessions: HashMap::new(),
         next_id: 1,
      }
   }

   fn allocate(&mut self) -> SessionId {
      loop {
         let id = SessionId::new(self.next_id);
         self.next_id = self.next_id.wrapping_add(1).max(1);
         if !self.sessions.contains_key(&id) {
            return id;
         }
      }
   }

   /// Creates a session. Its first actions are waiting in `take_actions`.
   pub fn create(&mut self) -> SessionId {
      let id = self.allocate();
      self.sessions.insert(id, Session::new(id, self.config.clone()));
      debug!("Session {id}: created");
      id
   }

   pub fn get(&self, id: SessionId) -> Option<&Session> {
      self.sessions.get(&id)
   }

   pub fn ids(&self) -> impl Iterator<Item = SessionId> + '_ {
      self.sessions.keys().copied()
   }

   pub fn len(&self) -> usize {
      self.sessions.len()
   }

   pub fn is_empty(&self) -> bool {
      self.sessions.is_empty()
   }

   /// Feeds `input` to session `id` and returns what it wants done.
   pub fn handle(&mut self, id: SessionId, input: impl Into<Input>) -> Result<Vec<Action>> {
      let session = self.sessions.get_mut(&id).ok_or(HiddError::SessionNotFound(id))?;
      session.handle(input);
      Ok(session.take_actions())
   }

   pub fn take_actions(&mut self, id: SessionId) -> Result<Vec<Action>> {
      let session = self.sessions.get_mut(&id).ok_or(HiddError::SessionNotFound(id))?;
      Ok(session.take_actions())
   }

   /// Serializes session `id` and gives up ownership of it. A vetoed or busy
   /// session stays where it is.
   pub fn export_handover(&mut self, id: SessionId) -> Result<Vec<u8>> {
      let session = self.sessions.get(&id).ok_or(HiddError::SessionNotFound(id))?;
      let blob = handover::encode(session)?;
      self.sessions.remove(&id);
      info!("Session {id}: handed over ({} bytes)", blob.len());
      Ok(blob)
   }

   /// Takes ownership of a session exported by another instance.
   pub fn import_handover(&mut self, blob: &[u8], ctx: ImportContext) -> SessionId {
      let id = self.allocate();
      let session = handover::import(id, self.config.clone(), blob, ctx);
      info!("Session {id}: imported in {}", session.state());
      self.sessions.insert(id, session);
      id
   }

   pub fn remove(&mut self, id: SessionId) -> Option<Session> {
      self.sessions.remove(&id)
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::hid::{
      State,
      message::{Request, TransportCommand, TransportEvent},
      protocol::{PSM_CONTROL, PSM_INTERRUPT},
      session::testing::{commands, config},
   };

   #[test]
   fn test_create_and_drive() {
      let mut registry = SessionRegistry::new(config(7));
      let id = registry.create();
      assert_eq!(
         commands(&registry.take_actions(id).unwrap()),
         vec![TransportCommand::Register { psm: PSM_CONTROL }]
      );
      registry
         .handle(id, TransportEvent::Registered { psm: PSM_CONTROL })
         .unwrap();
      registry
         .handle(id, TransportEvent::Registered { psm: PSM_INTERRUPT })
         .unwrap();
      assert_eq!(registry.get(id).map(Session::state), Some(State::Idle));
   }

   #[test]
   fn test_unknown_session() {
      let mut registry = SessionRegistry::new(config(7));
      let err = registry.handle(SessionId::new(42), Request::Deactivate).unwrap_err();
      assert!(matches!(err, HiddError::SessionNotFound(id) if id == SessionId::new(42)));
   }

   #[test]
   fn test_export_moves_ownership() {
      let mut source = SessionRegistry::new(config(7));
      let id = source.create();
      source.take_actions(id).unwrap();
      source.handle(id, TransportEvent::Registered { psm: PSM_CONTROL }).unwrap();
      source.handle(id, TransportEvent::Registered { psm: PSM_INTERRUPT }).unwrap();

      let blob = source.export_handover(id).unwrap();
      assert!(source.get(id).is_none());

      let mut target = SessionRegistry::new(config(7));
      let moved = target.import_handover(&blob, ImportContext::default());
      assert_eq!(target.get(moved).map(Session::state), Some(State::Idle));
   }

   #[test]
   fn test_vetoed_export_keeps_session() {
      let mut registry = SessionRegistry::new(config(7));
      let id = registry.create();
      registry.take_actions(id).unwrap();
      registry.handle(id, TransportEvent::Registered { psm: PSM_CONTROL }).unwrap();
      registry.handle(id, TransportEvent::Registered { psm: PSM_INTERRUPT }).unwrap();
      registry
         .handle(
            id,
            crate::hid::session::testing::activate(bluer::Address::any(), false, false),
         )
         .unwrap();

      assert!(matches!(
         registry.export_handover(id),
         Err(HiddError::HandoverVetoed(State::RegisteringRecords))
      ));
      assert!(registry.get(id).is_some());
   }
}

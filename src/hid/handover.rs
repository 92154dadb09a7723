//! Session handover between controller instances.
//!
//! Only the parts of a session that survive a change of owner are carried:
//! state, channel identities and MTUs, flags and the retry count. Buffered
//! data is never carried, so a session must be quiescent to be exported.
//! The receiving side supplies its own peer binding and record bytes.

use bluer::Address;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::{
   error::{ErrorCode, HiddError, Result},
   hid::{
      SessionId,
      protocol::ConnectionId,
      session::{DisconnectCause, Session, SessionConfig, SessionFlags, State},
   },
};

/// Bumped whenever the snapshot layout changes.
pub const HANDOVER_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSnapshot {
   pub cid: Option<ConnectionId>,
   pub host_mtu: u16,
   pub local_mtu: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoverSnapshot {
   pub state: State,
   pub control: EndpointSnapshot,
   pub interrupt: EndpointSnapshot,
   pub last_error: Option<ErrorCode>,
   pub disconnect_reason: DisconnectCause,
   pub flags: SessionFlags,
   pub retry_count: u32,
   pub flush_timeout: u16,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
   version: u16,
   snapshot: HandoverSnapshot,
}

impl HandoverSnapshot {
   /// Checks that the snapshot describes a session that could exist.
   fn validate(&self) -> Result<()> {
      if !self.state.allows_handover() {
         return Err(HiddError::HandoverVetoed(self.state));
      }
      let control = self.control.cid.is_some();
      let interrupt = self.interrupt.cid.is_some();
      let consistent = match self.state {
         State::Connected => control && interrupt,
         State::Init | State::Idle | State::NotConnected => !control && !interrupt,
         _ => !interrupt || control,
      };
      if consistent {
         Ok(())
      } else {
         Err(HiddError::InvalidRecord(format!(
            "handover channels inconsistent with state {}",
            self.state
         )))
      }
   }
}

/// Serializes `session` for another controller.
pub fn encode(session: &Session) -> Result<Vec<u8>> {
   if !session.can_handover() {
      return Err(HiddError::HandoverVetoed(session.state()));
   }
   if !session.is_quiescent() {
      return Err(HiddError::HandoverBusy);
   }
   let envelope = Envelope {
      version: HANDOVER_VERSION,
      snapshot: session.snapshot(),
   };
   Ok(bincode::serialize(&envelope)?)
}

/// Parses and validates a handover blob.
pub fn decode(bytes: &[u8]) -> Result<HandoverSnapshot> {
   let envelope: Envelope = bincode::deserialize(bytes)?;
   if envelope.version != HANDOVER_VERSION {
      return Err(HiddError::InvalidRecord(format!(
         "unsupported handover version {}",
         envelope.version
      )));
   }
   envelope.snapshot.validate()?;
   Ok(envelope.snapshot)
}

/// Record bytes and binding the importing side brings to a handover.
#[derive(Debug, Clone, Default)]
pub struct ImportContext {
   pub peer: Option<Address>,
   pub hid_record: Option<Vec<u8>>,
   pub device_id_record: Option<Vec<u8>>,
}

/// Rebuilds a session from `bytes`. A blob that cannot be used yields a
/// clean Idle session with nothing bound.
pub fn import(id: SessionId, config: SessionConfig, bytes: &[u8], ctx: ImportContext) -> Session {
   match decode(bytes) {
      Ok(snapshot) => Session::restore(
         id,
         config,
         snapshot,
         ctx.peer.unwrap_or_else(Address::any),
         ctx.hid_record,
         ctx.device_id_record,
      ),
      Err(e) => {
         warn!("Session {id}: discarding handover: {e}");
         Session::idle(id, config)
      },
   }
}

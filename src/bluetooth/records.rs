//! SDP record directory backed by BlueZ profile registration.
//!
//! BlueZ publishes a service record for every registered profile. The
//! record blob is rendered to BlueZ XML and registered as a server profile
//! whose lifetime is tied to a task holding the profile handle; aborting the
//! task withdraws the record.

use std::collections::HashMap;

use bluer::rfcomm::{Profile, ReqError, Role};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::task::JoinHandle;

use crate::{
   bluetooth::{Completion, CompletionSender, RecordDirectory},
   error::ErrorCode,
   hid::{
      SessionId,
      message::{RecordCommand, RecordEvent},
      protocol::HID_SERVICE_UUID,
      sdp::SdpRecord,
   },
};

/// First handle handed out; lower values are reserved by the SDP server.
const FIRST_HANDLE: u32 = 0x0001_0000;

/// Builds the profile BlueZ registers for a record blob.
fn profile_for(record: &[u8]) -> Result<Profile, ErrorCode> {
   let parsed = SdpRecord::parse(record).map_err(|e| {
      warn!("Rejecting service record: {e}");
      ErrorCode::RECORD_REJECTED
   })?;
   Ok(Profile {
      uuid: parsed.service_class().unwrap_or(HID_SERVICE_UUID),
      role: Some(Role::Server),
      service_record: Some(parsed.to_bluez_xml()),
      require_authentication: Some(true),
      require_authorization: Some(false),
      auto_connect: Some(false),
      ..Default::default()
   })
}

pub struct ProfileDirectory {
   session: bluer::Session,
   completions: CompletionSender,
   next_handle: u32,
   published: HashMap<u32, JoinHandle<()>>,
}

impl ProfileDirectory {
   pub fn new(session: bluer::Session, completions: CompletionSender) -> Self {
      Self {
         session,
         completions,
         next_handle: FIRST_HANDLE,
         published: HashMap::new(),
      }
   }

   fn report(&self, session: SessionId, event: RecordEvent) {
      if self.completions.send(Completion::new(session, event)).is_err() {
         debug!("Manager gone, dropping record event");
      }
   }

   fn register(&mut self, owner: SessionId, record: &[u8]) {
      let profile = match profile_for(record) {
         Ok(profile) => profile,
         Err(code) => {
            self.report(owner, RecordEvent::Registered(Err(code)));
            return;
         },
      };

      let handle = self.next_handle;
      self.next_handle = self.next_handle.wrapping_add(1).max(FIRST_HANDLE);
      let uuid = profile.uuid;
      let bluez = self.session.clone();
      let completions = self.completions.clone();

      let task = tokio::spawn(async move {
         let mut profile_handle = match bluez.register_profile(profile).await {
            Ok(h) => h,
            Err(e) => {
               warn!("Failed to register profile {uuid}: {e}");
               let _ = completions.send(Completion::new(
                  owner,
                  RecordEvent::Registered(Err(ErrorCode::RECORD_REJECTED)),
               ));
               return;
            },
         };
         info!("Published record {handle:#x} for {uuid}");
         let _ = completions.send(Completion::new(owner, RecordEvent::Registered(Ok(handle))));

         // channels are opened on our own sockets, not through the profile
         while let Some(req) = profile_handle.next().await {
            debug!("Rejecting profile connection from {}", req.device());
            req.reject(ReqError::Rejected);
         }
      });
      self.published.insert(handle, task);
   }

   fn unregister(&mut self, owner: SessionId, handle: u32) {
      let result = match self.published.remove(&handle) {
         Some(task) => {
            task.abort();
            info!("Withdrew record {handle:#x}");
            Ok(())
         },
         None => Err(ErrorCode::RECORD_REJECTED),
      };
      self.report(owner, RecordEvent::Unregistered { handle, result });
   }
}

impl RecordDirectory for ProfileDirectory {
   fn execute(&mut self, session: SessionId, command: RecordCommand) {
      match command {
         RecordCommand::Register { record } => self.register(session, &record),
         RecordCommand::Unregister { handle } => self.unregister(session, handle),
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::hid::{protocol::PNP_INFO_UUID, sdp::test_hid_record};

   #[test]
   fn test_profile_from_hid_record() {
      let profile = profile_for(&test_hid_record(true, true)).unwrap();
      assert_eq!(profile.uuid, HID_SERVICE_UUID);
      assert!(matches!(profile.role, Some(Role::Server)));
      let xml = profile.service_record.unwrap();
      assert!(xml.starts_with("<?xml"), "{xml}");
      assert!(xml.contains("0x0204"), "{xml}");
   }

   #[test]
   fn test_device_id_record_keeps_its_class() {
      let record = [
         0x35, 0x08, // attribute list
         0x09, 0x00, 0x01, 0x35, 0x03, 0x19, 0x12, 0x00, // service class: PnP information
      ];
      let profile = profile_for(&record).unwrap();
      assert_eq!(profile.uuid, PNP_INFO_UUID);
   }

   #[test]
   fn test_garbage_record_rejected() {
      assert!(matches!(profile_for(&[0x09]), Err(ErrorCode::RECORD_REJECTED)));
   }
}

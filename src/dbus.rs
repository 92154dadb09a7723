use std::str::FromStr;

use bluer::Address;
use log::info;
use zbus::{interface, object_server::SignalEmitter};

use crate::{
   bluetooth::manager::HiddManager,
   error::Status,
   hid::{
      SessionId,
      handover::ImportContext,
      message::{ActivateRequest, Request},
      protocol::{PowerMode, ReportType, TransactionType},
   },
};

pub struct HiddService {
   manager: HiddManager,
   template: ActivateRequest,
}

impl HiddService {
   /// `template` supplies the records and channel parameters of activations
   /// that do not bring their own.
   pub const fn new(manager: HiddManager, template: ActivateRequest) -> Self {
      Self { manager, template }
   }

   async fn submit(&self, session: u32, request: Request) -> zbus::fdo::Result<bool> {
      self
         .manager
         .request(SessionId::new(session), request)
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
      Ok(true)
   }
}

fn parse_address(address: &str) -> zbus::fdo::Result<Address> {
   if address.is_empty() {
      return Ok(Address::any());
   }
   Address::from_str(address).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))
}

fn parse_hex(data: &str) -> zbus::fdo::Result<Vec<u8>> {
   hex::decode(data).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))
}

fn parse_enum<T: FromStr>(kind: &str, value: &str) -> zbus::fdo::Result<T> {
   T::from_str(value).map_err(|_| zbus::fdo::Error::InvalidArgs(format!("Invalid {kind}: {value}")))
}

/// Payload with byte 0 reserved for the protocol header.
fn with_header_slot(payload: &[u8]) -> Vec<u8> {
   let mut buf = Vec::with_capacity(payload.len() + 1);
   buf.push(0);
   buf.extend_from_slice(payload);
   buf
}

/// Renders a confirm outcome for signals; empty on success.
pub fn status_text(status: &Status) -> String {
   match status {
      Ok(()) => String::new(),
      Err(e) => e.to_string(),
   }
}

#[interface(name = "org.hidd.Device1")]
impl HiddService {
   async fn create_session(&self) -> zbus::fdo::Result<u32> {
      let id = self
         .manager
         .create_session()
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
      info!("Created session {id}");
      Ok(id.get())
   }

   async fn remove_session(&self, session: u32) -> zbus::fdo::Result<bool> {
      self
         .manager
         .remove_session(SessionId::new(session))
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
      Ok(true)
   }

   async fn get_sessions(&self) -> zbus::fdo::Result<String> {
      let states: Vec<serde_json::Value> = self
         .manager
         .all_sessions()
         .await
         .iter()
         .map(|s| s.to_json())
         .collect();
      serde_json::to_string(&states).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
   }

   async fn get_session(&self, session: u32) -> zbus::fdo::Result<String> {
      let status = self
         .manager
         .get_session(SessionId::new(session))
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
      Ok(status.to_json().to_string())
   }

   /// Empty `address` waits for any host; empty `hid_record` uses the
   /// configured record.
   async fn activate(
      &self,
      session: u32,
      address: String,
      hid_record: String,
   ) -> zbus::fdo::Result<bool> {
      let mut request = self.template.clone();
      request.peer = parse_address(&address)?;
      if !hid_record.is_empty() {
         request.hid_record = Some(parse_hex(&hid_record)?);
      }
      self.submit(session, Request::Activate(request)).await
   }

   async fn deactivate(&self, session: u32) -> zbus::fdo::Result<bool> {
      self.submit(session, Request::Deactivate).await
   }

   async fn send_report(
      &self,
      session: u32,
      report_type: String,
      report: String,
   ) -> zbus::fdo::Result<bool> {
      let report_type: ReportType = parse_enum("report type", &report_type)?;
      let report = with_header_slot(&parse_hex(&report)?);
      self
         .submit(session, Request::DataRequest { report_type, report })
         .await
   }

   async fn send_control(
      &self,
      session: u32,
      transaction: String,
      parameter: u8,
      data: String,
   ) -> zbus::fdo::Result<bool> {
      let transaction: TransactionType = parse_enum("transaction", &transaction)?;
      let data = with_header_slot(&parse_hex(&data)?);
      self
         .submit(
            session,
            Request::ControlResponse {
               transaction,
               parameter,
               data,
            },
         )
         .await
   }

   async fn unplug(&self, session: u32) -> zbus::fdo::Result<bool> {
      self.submit(session, Request::Unplug).await
   }

   async fn set_mode(&self, session: u32, mode: String) -> zbus::fdo::Result<bool> {
      let mode: PowerMode = parse_enum("power mode", &mode)?;
      self.submit(session, Request::ModeChange(mode)).await
   }

   async fn connect(&self, session: u32) -> zbus::fdo::Result<bool> {
      self.submit(session, Request::Connect).await
   }

   async fn disconnect(&self, session: u32) -> zbus::fdo::Result<bool> {
      self.submit(session, Request::Disconnect).await
   }

   async fn export_handover(&self, session: u32) -> zbus::fdo::Result<String> {
      let blob = self
         .manager
         .export_handover(SessionId::new(session))
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
      Ok(hex::encode(blob))
   }

   async fn import_handover(&self, blob: String, address: String) -> zbus::fdo::Result<u32> {
      let peer = parse_address(&address)?;
      let ctx = ImportContext {
         peer: (peer != Address::any()).then_some(peer),
         hid_record: self.template.hid_record.clone(),
         device_id_record: self.template.device_id_record.clone(),
      };
      let id = self
         .manager
         .import_handover(parse_hex(&blob)?, ctx)
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
      Ok(id.get())
   }

   // Signals
   #[zbus(signal)]
   pub async fn activate_confirm(
      emitter: &SignalEmitter<'_>,
      session: u32,
      error: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn deactivate_confirm(
      emitter: &SignalEmitter<'_>,
      session: u32,
      error: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn connected(emitter: &SignalEmitter<'_>, session: u32, cid: u32)
   -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn disconnected(
      emitter: &SignalEmitter<'_>,
      session: u32,
      cid: u32,
      reason: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn reconnecting(
      emitter: &SignalEmitter<'_>,
      session: u32,
      cid: u32,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn connect_failed(
      emitter: &SignalEmitter<'_>,
      session: u32,
      reason: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn control_received(
      emitter: &SignalEmitter<'_>,
      session: u32,
      transaction: &str,
      parameter: u8,
      data: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn report_received(
      emitter: &SignalEmitter<'_>,
      session: u32,
      report_type: &str,
      data: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn data_confirm(
      emitter: &SignalEmitter<'_>,
      session: u32,
      error: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn mode_changed(
      emitter: &SignalEmitter<'_>,
      session: u32,
      mode: &str,
      error: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn unplugged(
      emitter: &SignalEmitter<'_>,
      session: u32,
      address: &str,
      error: &str,
   ) -> zbus::Result<()>;

   // Properties for polling-free updates
   #[zbus(property)]
   async fn sessions(&self) -> String {
      self.get_sessions().await.unwrap_or_default()
   }

   #[zbus(property)]
   async fn session_count(&self) -> u32 {
      u32::try_from(self.manager.all_sessions().await.len()).unwrap_or(u32::MAX)
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::error::SessionError;

   #[test]
   fn test_argument_parsing() {
      assert_eq!(parse_address("").unwrap(), Address::any());
      assert_eq!(
         parse_address("00:1A:7D:DA:71:13").unwrap(),
         Address::new([0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x13])
      );
      assert!(parse_address("bogus").is_err());

      assert_eq!(parse_enum::<ReportType>("report type", "feature").unwrap(), ReportType::Feature);
      assert_eq!(
         parse_enum::<TransactionType>("transaction", "set_report").unwrap(),
         TransactionType::SetReport
      );
      assert_eq!(parse_enum::<PowerMode>("power mode", "sniff").unwrap(), PowerMode::Sniff);
      assert!(parse_enum::<PowerMode>("power mode", "hover").is_err());
   }

   #[test]
   fn test_report_gets_header_slot() {
      assert_eq!(with_header_slot(&parse_hex("0102").unwrap()), vec![0, 1, 2]);
      assert!(parse_hex("0g").is_err());
   }

   #[test]
   fn test_status_text() {
      assert_eq!(status_text(&Ok(())), "");
      assert_eq!(
         status_text(&Err(SessionError::RetriesExhausted)),
         "Reconnect attempts exhausted"
      );
   }
}

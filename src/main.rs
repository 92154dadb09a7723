//! Bluetooth HID device D-Bus service
//!
//! This service lets an application act as a Bluetooth HID device: it
//! publishes the HID service record, runs the control and interrupt
//! channels, and relays reports and control messages over D-Bus.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use hidd::{
   bluetooth::{self, l2cap::L2capTransport, manager::HiddManager, records::ProfileDirectory},
   config::Config,
   dbus::{HiddService, HiddServiceSignals, status_text},
   error::Result,
   event::{EventBus, HiddEvent},
   hid::{SessionId, message::Request},
};

const BUS_NAME: &str = "org.hidd";
const OBJECT_PATH: &str = "/org/hidd/device";

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting hidd D-Bus service...");

   // Load configuration
   let config = Config::load()?;
   let template = config.activation()?;
   info!(
      "Loaded configuration (HID record: {}, peer: {})",
      template.hid_record.as_ref().map_or(0, Vec::len),
      template.peer
   );

   let bluez = bluer::Session::new().await?;
   let adapter = bluez.default_adapter().await?;
   adapter.set_powered(true).await?;
   info!("Using adapter {} ({})", adapter.name(), adapter.address().await?);

   // Create event channel
   let event_bus = EventProcessor::new();

   let completions = bluetooth::completion_channel();
   let transport = L2capTransport::new(completions.0.clone(), config.security, config.local_mtu);
   let directory = ProfileDirectory::new(bluez, completions.0.clone());
   let manager = HiddManager::new(
      event_bus.clone(),
      config.session_config(),
      transport,
      directory,
      completions,
   );

   let primary = if config.auto_activate && template.hid_record.is_some() {
      let id = manager.create_session().await?;
      manager.request(id, Request::Activate(template.clone())).await?;
      info!("Activated session {id}");
      Some(id)
   } else {
      None
   };

   // Create D-Bus service
   let service = HiddService::new(manager.clone(), template);

   // Build D-Bus connection
   let connection = connection::Builder::session()?
      .name(BUS_NAME)?
      .serve_at(OBJECT_PATH, service)?
      .build()
      .await?;

   info!("hidd D-Bus service started at {BUS_NAME}");

   // Start event processor
   event_bus.clone().spawn_dispatcher(connection).await?;

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down hidd service...");

   if let Some(id) = primary {
      // records are withdrawn before the process goes away
      if let Err(e) = manager.request(id, Request::Deactivate).await {
         warn!("Failed to deactivate session {id}: {e}");
      } else {
         let _ = time::timeout(Duration::from_secs(2), event_bus.deactivated.notified()).await;
      }
   }

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<(SessionId, HiddEvent)>,
   notifier: Notify,
   deactivated: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
         deactivated: Notify::new(),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<(SessionId, HiddEvent)> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(
      &self,
      iface: &InterfaceRef<HiddService>,
      (session, event): (SessionId, HiddEvent),
   ) -> Result<()> {
      let id = session.get();
      match event {
         HiddEvent::ActivateConfirm(status) => {
            iface.activate_confirm(id, &status_text(&status)).await?;
         },
         HiddEvent::DeactivateConfirm(status) => {
            iface.deactivate_confirm(id, &status_text(&status)).await?;
         },
         HiddEvent::Connected { connection_id } => {
            iface.connected(id, connection_id.get()).await?;
         },
         HiddEvent::Disconnected {
            connection_id,
            reason,
         } => {
            let cid = connection_id.map_or(0, |c| c.get());
            iface.disconnected(id, cid, &reason.to_string()).await?;
         },
         HiddEvent::Reconnecting { connection_id } => {
            iface.reconnecting(id, connection_id.map_or(0, |c| c.get())).await?;
         },
         HiddEvent::ConnectFailed(reason) => {
            iface.connect_failed(id, &reason.to_string()).await?;
         },
         HiddEvent::ControlIndication {
            transaction,
            parameter,
            data,
         } => {
            iface
               .control_received(id, &transaction.to_string(), parameter, &hex::encode(data))
               .await?;
         },
         HiddEvent::DataIndication { report_type, data } => {
            iface
               .report_received(id, &report_type.to_string(), &hex::encode(data))
               .await?;
         },
         HiddEvent::DataConfirm(status) => {
            iface.data_confirm(id, &status_text(&status)).await?;
         },
         HiddEvent::ModeChanged { mode, status } => {
            iface.mode_changed(id, mode.to_str(), &status_text(&status)).await?;
         },
         HiddEvent::Unplugged { peer, status } => {
            iface.unplugged(id, &peer.to_string(), &status_text(&status)).await?;
         },
      }
      iface.get().await.sessions_changed(iface.signal_emitter()).await?;
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, HiddService>(OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, session: SessionId, event: HiddEvent) {
      if matches!(event, HiddEvent::DeactivateConfirm(_)) {
         self.deactivated.notify_one();
      }
      self.queue.push((session, event));
      self.notifier.notify_waiters();
   }
}

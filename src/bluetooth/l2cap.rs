//! L2CAP channel transport backed by BlueZ sockets.
//!
//! Each open channel gets a receive task and a send task. Frames handed to
//! a busy channel are returned with `SendBlocked` and announced again with
//! `MoreSpace` once the send task drains its queue.

use std::{
   collections::HashMap,
   io,
   sync::{
      Arc,
      atomic::{AtomicBool, AtomicU32, Ordering},
   },
   time::Duration,
};

use bluer::{
   Address, AddressType,
   l2cap::{SeqPacket, SeqPacketListener, Socket, SocketAddr},
};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::{
   sync::mpsc::{self, error::TrySendError},
   task::JoinHandle,
   time,
};

use crate::{
   bluetooth::{Completion, CompletionSender, Transport},
   error::{ErrorCode, Result},
   hid::{
      SessionId,
      message::{TransportCommand, TransportEvent},
      protocol::{ChannelInfo, ConnectionId, DEFAULT_MTU, Security},
   },
};

/// Timeout for write operations
const WRITE_TIMEOUT: Duration = Duration::from_secs(25);
/// Timeout for connection attempts
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Frames queued per channel before the transport pushes back
const SEND_QUEUE_DEPTH: usize = 8;

fn security_level(security: Security) -> bluer::l2cap::Security {
   let level = match security {
      Security::Low => bluer::l2cap::SecurityLevel::Low,
      Security::Medium => bluer::l2cap::SecurityLevel::Medium,
      Security::High => bluer::l2cap::SecurityLevel::High,
   };
   bluer::l2cap::Security { level, key_size: 0 }
}

/// Maps a socket error onto the code a session understands.
fn classify(err: &io::Error) -> ErrorCode {
   match err.kind() {
      io::ErrorKind::TimedOut => ErrorCode::LINK_LOSS,
      io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
         ErrorCode::REMOTE_TERMINATED
      },
      io::ErrorKind::ConnectionRefused => ErrorCode::CONNECT_REFUSED,
      io::ErrorKind::HostUnreachable => ErrorCode::CONNECT_TIMEOUT,
      _ => ErrorCode::TRANSPORT_FAILURE,
   }
}

fn mtu(value: io::Result<usize>) -> u16 {
   value
      .ok()
      .and_then(|v| u16::try_from(v).ok())
      .unwrap_or(DEFAULT_MTU)
}

/// Session a channel reports to; shared with the channel's tasks.
#[derive(Clone)]
struct Owner(Arc<AtomicU32>);

impl Owner {
   fn new(session: SessionId) -> Self {
      Self(Arc::new(AtomicU32::new(session.get())))
   }

   fn get(&self) -> SessionId {
      SessionId::new(self.0.load(Ordering::Acquire))
   }

   fn set(&self, session: SessionId) {
      self.0.store(session.get(), Ordering::Release);
   }
}

struct Channel {
   owner: Owner,
   tx: mpsc::Sender<Vec<u8>>,
   blocked: Arc<AtomicBool>,
   tasks: [JoinHandle<()>; 2],
}

impl Channel {
   fn abort(&self) {
      for task in &self.tasks {
         task.abort();
      }
   }
}

type ChannelTable = Arc<Mutex<HashMap<ConnectionId, Channel>>>;

/// Opens channels and moves frames for every session of the daemon.
pub struct L2capTransport {
   completions: CompletionSender,
   security: Security,
   local_mtu: u16,
   listeners: HashMap<u16, Arc<SeqPacketListener>>,
   accepts: HashMap<(SessionId, u16), JoinHandle<()>>,
   connects: HashMap<(SessionId, u16), JoinHandle<()>>,
   channels: ChannelTable,
   next_cid: Arc<AtomicU32>,
}

impl L2capTransport {
   pub fn new(completions: CompletionSender, security: Security, local_mtu: u16) -> Self {
      Self {
         completions,
         security,
         local_mtu,
         listeners: HashMap::new(),
         accepts: HashMap::new(),
         connects: HashMap::new(),
         channels: Arc::new(Mutex::new(HashMap::new())),
         next_cid: Arc::new(AtomicU32::new(0x40)),
      }
   }

   fn report(&self, session: SessionId, event: TransportEvent) {
      if self.completions.send(Completion::new(session, event)).is_err() {
         debug!("Manager gone, dropping transport event");
      }
   }

   fn listen(&self, psm: u16) -> Result<SeqPacketListener> {
      let socket = Socket::new_seq_packet()?;
      socket.set_security(security_level(self.security))?;
      socket.set_recv_mtu(self.local_mtu)?;
      socket.bind(SocketAddr::new(Address::any(), AddressType::BrEdr, psm))?;
      Ok(socket.listen(1)?)
   }

   fn register(&mut self, session: SessionId, psm: u16) {
      if !self.listeners.contains_key(&psm) {
         match self.listen(psm) {
            Ok(listener) => {
               info!("Listening on PSM {psm:#x}");
               self.listeners.insert(psm, Arc::new(listener));
            },
            Err(e) => error!("Failed to listen on PSM {psm:#x}: {e}"),
         }
      }
      self.report(session, TransportEvent::Registered { psm });
   }

   fn connect_accept(&mut self, session: SessionId, psm: u16) {
      let Some(listener) = self.listeners.get(&psm).cloned() else {
         self.report(
            session,
            TransportEvent::ConnectAcceptConfirm {
               psm,
               peer: Address::any(),
               result: Err(ErrorCode::TRANSPORT_FAILURE),
            },
         );
         return;
      };

      let opener = self.opener(session);
      let task = tokio::spawn(async move {
         let event = match listener.accept().await {
            Ok((sp, sa)) => {
               info!("Accepted PSM {psm:#x} from {}", sa.addr);
               TransportEvent::ConnectAcceptConfirm {
                  psm,
                  peer: sa.addr,
                  result: Ok(opener.open(sp)),
               }
            },
            Err(e) => {
               warn!("Accept on PSM {psm:#x} failed: {e}");
               TransportEvent::ConnectAcceptConfirm {
                  psm,
                  peer: Address::any(),
                  result: Err(classify(&e)),
               }
            },
         };
         opener.report(event);
      });
      if let Some(old) = self.accepts.insert((session, psm), task) {
         old.abort();
      }
   }

   fn cancel_accept(&mut self, session: SessionId, psm: u16) {
      if let Some(task) = self.accepts.remove(&(session, psm)) {
         task.abort();
      }
      self.report(session, TransportEvent::CancelAcceptConfirm { psm });
   }

   fn connect(&mut self, session: SessionId, peer: Address, psm: u16, security: Security, mtu: u16) {
      let opener = self.opener(session);
      let task = tokio::spawn(async move {
         let result = match dial(peer, psm, security, mtu).await {
            Ok(sp) => Ok(opener.open(sp)),
            Err(code) => Err(code),
         };
         opener.report(TransportEvent::ConnectConfirm { psm, result });
      });
      if let Some(old) = self.connects.insert((session, psm), task) {
         old.abort();
      }
   }

   fn cancel_connect(&mut self, session: SessionId, psm: u16) {
      let Some(task) = self.connects.remove(&(session, psm)) else {
         return;
      };
      if task.is_finished() {
         return;
      }
      task.abort();
      self.report(
         session,
         TransportEvent::ConnectConfirm {
            psm,
            result: Err(ErrorCode::CANCELLED),
         },
      );
   }

   fn disconnect(&mut self, session: SessionId, cid: ConnectionId) {
      let Some(channel) = self.channels.lock().remove(&cid) else {
         debug!("Disconnect of closed channel {cid}");
         return;
      };
      channel.abort();
      info!("Closed channel {cid}");
      self.report(
         session,
         TransportEvent::DisconnectIndication {
            cid,
            reason: ErrorCode::LOCAL_TERMINATED,
            local: true,
         },
      );
   }

   fn send(&mut self, session: SessionId, cid: ConnectionId, frame: Vec<u8>) {
      let refused = {
         let channels = self.channels.lock();
         match channels.get(&cid).map(|channel| (channel, channel.tx.try_send(frame))) {
            Some((_, Ok(()))) => return,
            Some((channel, Err(TrySendError::Full(frame)))) => {
               channel.blocked.store(true, Ordering::Release);
               Some(frame)
            },
            Some((_, Err(TrySendError::Closed(_)))) | None => None,
         }
      };
      let event = match refused {
         Some(frame) => TransportEvent::SendBlocked { cid, frame },
         None => TransportEvent::DataConfirm {
            cid,
            result: Err(ErrorCode::TRANSPORT_FAILURE),
         },
      };
      self.report(session, event);
   }

   fn opener(&self, session: SessionId) -> Opener {
      Opener {
         session,
         completions: self.completions.clone(),
         channels: self.channels.clone(),
         next_cid: self.next_cid.clone(),
      }
   }
}

impl Transport for L2capTransport {
   fn execute(&mut self, session: SessionId, command: TransportCommand) {
      match command {
         TransportCommand::Register { psm } => self.register(session, psm),
         TransportCommand::ConnectAccept {
            psm,
            flush_timeout,
            ..
         } => {
            debug!("Session {session}: accepting PSM {psm:#x} (flush timeout {flush_timeout:#x})");
            self.connect_accept(session, psm);
         },
         TransportCommand::CancelConnectAccept { psm } => self.cancel_accept(session, psm),
         TransportCommand::Connect {
            peer,
            psm,
            security,
            mtu,
         } => self.connect(session, peer, psm, security, mtu),
         TransportCommand::CancelConnect { psm, .. } => self.cancel_connect(session, psm),
         TransportCommand::Disconnect { cid } => self.disconnect(session, cid),
         TransportCommand::Send { cid, frame } => self.send(session, cid, frame),
         // inbound data is pushed as it arrives
         TransportCommand::Receive { cid } => debug!("Session {session}: pull on {cid}"),
      }
   }

   fn release(&mut self, session: SessionId) {
      self.accepts.retain(|(owner, _), task| {
         let keep = *owner != session;
         if !keep {
            task.abort();
         }
         keep
      });
      self.connects.retain(|(owner, _), task| {
         let keep = *owner != session;
         if !keep {
            task.abort();
         }
         keep
      });
      self.channels.lock().retain(|_, channel| {
         let keep = channel.owner.get() != session;
         if !keep {
            channel.abort();
         }
         keep
      });
   }

   fn rebind(&mut self, cid: ConnectionId, session: SessionId) {
      match self.channels.lock().get(&cid) {
         Some(channel) => {
            info!("Channel {cid} moves to session {session}");
            channel.owner.set(session);
         },
         None => debug!("Rebind of unknown channel {cid}"),
      }
   }
}

async fn dial(
   peer: Address,
   psm: u16,
   security: Security,
   mtu: u16,
) -> std::result::Result<SeqPacket, ErrorCode> {
   let setup = || -> io::Result<Socket<SeqPacket>> {
      let socket = Socket::new_seq_packet()?;
      socket.set_security(security_level(security))?;
      socket.set_recv_mtu(mtu)?;
      Ok(socket)
   };
   let socket = setup().map_err(|e| {
      warn!("Failed to create L2CAP socket: {e}");
      classify(&e)
   })?;

   debug!("Connecting to {peer}:{psm:#x}");
   let addr = SocketAddr::new(peer, AddressType::BrEdr, psm);
   match time::timeout(CONNECT_TIMEOUT, socket.connect(addr)).await {
      Ok(Ok(sp)) => Ok(sp),
      Ok(Err(e)) => {
         warn!("Connect to {peer}:{psm:#x} failed: {e}");
         Err(classify(&e))
      },
      Err(_) => Err(ErrorCode::CONNECT_TIMEOUT),
   }
}

/// Everything a connect or accept task needs to bring a channel up.
struct Opener {
   session: SessionId,
   completions: CompletionSender,
   channels: ChannelTable,
   next_cid: Arc<AtomicU32>,
}

impl Opener {
   fn report(&self, event: TransportEvent) {
      let _ = self.completions.send(Completion::new(self.session, event));
   }

   fn open(&self, sp: SeqPacket) -> ChannelInfo {
      let cid = loop {
         if let Some(cid) = ConnectionId::new(self.next_cid.fetch_add(1, Ordering::Relaxed)) {
            break cid;
         }
      };
      let info = ChannelInfo {
         cid,
         host_mtu: mtu(sp.send_mtu()),
         local_mtu: mtu(sp.recv_mtu()),
      };

      let sp = Arc::new(sp);
      let owner = Owner::new(self.session);
      let (tx, rx) = mpsc::channel(SEND_QUEUE_DEPTH);
      let blocked = Arc::new(AtomicBool::new(false));
      let recv = tokio::spawn(recv_task(
         cid,
         info.local_mtu,
         sp.clone(),
         owner.clone(),
         self.completions.clone(),
         self.channels.clone(),
      ));
      let send = tokio::spawn(send_task(
         cid,
         rx,
         sp,
         blocked.clone(),
         owner.clone(),
         self.completions.clone(),
      ));
      self.channels.lock().insert(
         cid,
         Channel {
            owner,
            tx,
            blocked,
            tasks: [recv, send],
         },
      );
      info
   }
}

async fn recv_task(
   cid: ConnectionId,
   local_mtu: u16,
   sp: Arc<SeqPacket>,
   owner: Owner,
   completions: CompletionSender,
   channels: ChannelTable,
) {
   // one spare byte so oversized fragments stay detectable
   let mut stack = vec![0u8; usize::from(local_mtu) + 1];
   let reason = loop {
      match sp.recv(&mut stack).await {
         Ok(0) => break ErrorCode::REMOTE_TERMINATED,
         Ok(n) => {
            let recvd = &stack[..n];
            debug!("← {cid}: {}", hex::encode(recvd));
            let event = TransportEvent::DataIndication {
               cid,
               payload: recvd.to_vec(),
            };
            if completions.send(Completion::new(owner.get(), event)).is_err() {
               return;
            }
         },
         Err(e) => {
            warn!("Channel {cid} failed: {e}");
            break classify(&e);
         },
      }
   };

   if let Some(channel) = channels.lock().remove(&cid) {
      channel.tasks[1].abort();
   }
   let _ = completions.send(Completion::new(
      owner.get(),
      TransportEvent::DisconnectIndication {
         cid,
         reason,
         local: false,
      },
   ));
}

async fn send_task(
   cid: ConnectionId,
   mut rx: mpsc::Receiver<Vec<u8>>,
   sp: Arc<SeqPacket>,
   blocked: Arc<AtomicBool>,
   owner: Owner,
   completions: CompletionSender,
) {
   while let Some(frame) = rx.recv().await {
      debug!("→ {cid}: {}", hex::encode(&frame));
      let result = match time::timeout(WRITE_TIMEOUT, sp.send(&frame)).await {
         Ok(Ok(_)) => Ok(()),
         Ok(Err(e)) => {
            warn!("Failed to send data on {cid}: {e}");
            Err(classify(&e))
         },
         Err(_) => Err(ErrorCode::TRANSPORT_FAILURE),
      };
      let session = owner.get();
      let _ = completions.send(Completion::new(session, TransportEvent::DataConfirm { cid, result }));
      if blocked.swap(false, Ordering::AcqRel) {
         let _ = completions.send(Completion::new(session, TransportEvent::MoreSpace { cid }));
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::hid::message::Input;

   #[test]
   fn test_error_classification() {
      let timeout = io::Error::from(io::ErrorKind::TimedOut);
      assert!(classify(&timeout).is_link_loss());
      assert_eq!(
         classify(&io::Error::from(io::ErrorKind::ConnectionReset)),
         ErrorCode::REMOTE_TERMINATED
      );
      assert_eq!(
         classify(&io::Error::from(io::ErrorKind::ConnectionRefused)),
         ErrorCode::CONNECT_REFUSED
      );
      assert_eq!(
         classify(&io::Error::other("boom")),
         ErrorCode::TRANSPORT_FAILURE
      );
   }

   #[test]
   fn test_mtu_fallback() {
      assert_eq!(mtu(Ok(48)), 48);
      assert_eq!(mtu(Ok(1 << 20)), DEFAULT_MTU);
      assert_eq!(mtu(Err(io::Error::other("closed"))), DEFAULT_MTU);
   }

   #[tokio::test]
   async fn test_unknown_channel_send_fails() {
      let (tx, mut rx) = crate::bluetooth::completion_channel();
      let mut transport = L2capTransport::new(tx, Security::Medium, 672);
      let cid = ConnectionId::new(0x99).unwrap();
      transport.execute(
         SessionId::new(1),
         TransportCommand::Send {
            cid,
            frame: vec![0xA1],
         },
      );
      let completion = rx.recv().await.unwrap();
      assert_eq!(
         completion.input,
         Input::Transport(TransportEvent::DataConfirm {
            cid,
            result: Err(ErrorCode::TRANSPORT_FAILURE),
         })
      );
   }

   #[tokio::test]
   async fn test_accept_without_listener_fails() {
      let (tx, mut rx) = crate::bluetooth::completion_channel();
      let mut transport = L2capTransport::new(tx, Security::Medium, 672);
      transport.execute(
         SessionId::new(1),
         TransportCommand::ConnectAccept {
            psm: 0x11,
            security: Security::Medium,
            mtu: 672,
            flush_timeout: 0xFFFF,
            qos: None,
         },
      );
      let completion = rx.recv().await.unwrap();
      assert!(matches!(
         completion.input,
         Input::Transport(TransportEvent::ConnectAcceptConfirm {
            result: Err(_),
            ..
         })
      ));
   }
}

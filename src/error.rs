//! Error types for the HID device service.
//!
//! `SessionError` describes failures the session engine reports to the
//! application inside confirms and indications. `HiddError` covers the
//! runtime around it, from the Bluetooth stack up to handover.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hid::{SessionId, State};

/// Layer that produced an [`ErrorCode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Origin {
   Transport,
   L2cap,
   Hci,
   Records,
   Profile,
}

/// Raw failure code paired with the layer that supplied it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ErrorCode {
   pub code: u16,
   pub origin: Origin,
}

impl ErrorCode {
   /// Operation was cancelled on request.
   pub const CANCELLED: Self = Self::new(0x0001, Origin::Transport);
   /// Generic transport failure (socket error, unexpected close).
   pub const TRANSPORT_FAILURE: Self = Self::new(0x0003, Origin::Transport);
   /// Channel closed by the local side.
   pub const LOCAL_TERMINATED: Self = Self::new(0x0004, Origin::Transport);
   /// Baseband link lost.
   pub const LINK_LOSS: Self = Self::new(0x0001, Origin::L2cap);
   /// Peer closed the channel.
   pub const REMOTE_TERMINATED: Self = Self::new(0x0002, Origin::L2cap);
   /// Connection attempt timed out.
   pub const CONNECT_TIMEOUT: Self = Self::new(0x0003, Origin::L2cap);
   /// Connection refused by the peer.
   pub const CONNECT_REFUSED: Self = Self::new(0x0004, Origin::L2cap);
   /// HCI supervision timeout.
   pub const HCI_CONNECTION_TIMEOUT: Self = Self::new(0x0008, Origin::Hci);
   /// HCI remote user terminated connection; the host dropped the ACL link.
   pub const HCI_REMOTE_USER_TERMINATED: Self = Self::new(0x0013, Origin::Hci);
   /// No HID service record was supplied.
   pub const NO_RECORD: Self = Self::new(0x0001, Origin::Profile);
   /// Reconnect accept window expired.
   pub const ACCEPT_TIMEOUT: Self = Self::new(0x0002, Origin::Profile);
   /// Record directory rejected the request.
   pub const RECORD_REJECTED: Self = Self::new(0x0001, Origin::Records);

   pub const fn new(code: u16, origin: Origin) -> Self {
      Self { code, origin }
   }

   /// Whether a disconnect with this reason means the radio link was lost.
   pub fn is_link_loss(self) -> bool {
      self == Self::LINK_LOSS
         || self == Self::HCI_CONNECTION_TIMEOUT
         || self == Self::HCI_REMOTE_USER_TERMINATED
   }
}

impl fmt::Display for ErrorCode {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{}:{:#06x}", self.origin, self.code)
   }
}

/// Failures reported by a session to its application.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionError {
   #[error("Service record registration failed ({0})")]
   RecordRegistrationFailed(ErrorCode),

   #[error("Service record unregistration failed ({0})")]
   RecordUnregistrationFailed(ErrorCode),

   #[error("Connection failed ({0})")]
   ConnectFailed(ErrorCode),

   #[error("Connection attempt cancelled")]
   ConnectCancelled,

   #[error("Disconnected: link loss")]
   DisconnectedLinkLoss,

   #[error("Disconnected locally")]
   DisconnectedLocal,

   #[error("Disconnected by peer")]
   DisconnectedRemote,

   #[error("Fragment of {length} bytes exceeds MTU {mtu}")]
   ProtocolViolation { length: usize, mtu: u16 },

   #[error("Transport error ({0})")]
   Transport(ErrorCode),

   #[error("Reconnect attempts exhausted")]
   RetriesExhausted,

   #[error("Request not valid in state {0}")]
   InvalidState(State),

   #[error("Aborted by deactivation")]
   Aborted,
}

/// Outcome carried by confirms.
pub type Status = std::result::Result<(), SessionError>;

/// Main error type for the HID device service.
#[derive(Error, Debug)]
pub enum HiddError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Session error: {0}")]
   Session(#[from] SessionError),

   #[error("Session not found: {0}")]
   SessionNotFound(SessionId),

   #[error("Handover refused in state {0}")]
   HandoverVetoed(State),

   #[error("Handover refused: session has data in flight")]
   HandoverBusy,

   #[error("Handover encoding error: {0}")]
   HandoverCodec(#[from] bincode::Error),

   #[error("Invalid Bluetooth address: {0}")]
   InvalidAddress(String),

   #[error("Malformed service record: {0}")]
   InvalidRecord(String),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Manager has been shut down")]
   ManagerShutdown,
}

/// Convenience type alias for Results with `HiddError`.
pub type Result<T> = std::result::Result<T, HiddError>;

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_link_loss_codes() {
      assert!(ErrorCode::LINK_LOSS.is_link_loss());
      assert!(ErrorCode::HCI_CONNECTION_TIMEOUT.is_link_loss());
      assert!(ErrorCode::HCI_REMOTE_USER_TERMINATED.is_link_loss());
      assert!(!ErrorCode::REMOTE_TERMINATED.is_link_loss());
      assert!(!ErrorCode::LOCAL_TERMINATED.is_link_loss());
      // same code, different layer
      assert!(!ErrorCode::new(0x0013, Origin::L2cap).is_link_loss());
   }

   #[test]
   fn test_code_display() {
      assert_eq!(ErrorCode::HCI_REMOTE_USER_TERMINATED.to_string(), "hci:0x0013");
   }
}

//! HID-over-L2CAP protocol definitions.
//!
//! Channel identifiers, the one-byte HIDP transaction header and the small
//! value types shared by the session engine and its collaborators.

use std::{fmt, num::NonZeroU32};

use serde::{Deserialize, Serialize};

/// PSM of the HID control channel.
pub const PSM_CONTROL: u16 = 0x11;
/// PSM of the HID interrupt channel.
pub const PSM_INTERRUPT: u16 = 0x13;

/// Default L2CAP MTU offered by the device.
pub const DEFAULT_MTU: u16 = 672;
/// Infinite flush timeout.
pub const FLUSH_TIMEOUT_INFINITE: u16 = 0xFFFF;

/// HID profile service class (0x1124).
pub const HID_SERVICE_UUID: uuid::Uuid = uuid::Uuid::from_u128(0x00001124_0000_1000_8000_00805f9b34fb);
/// PnP information service class (0x1200), used by Device ID records.
pub const PNP_INFO_UUID: uuid::Uuid = uuid::Uuid::from_u128(0x00001200_0000_1000_8000_00805f9b34fb);

// Header layout
const TRANSACTION_MASK: u8 = 0xF0;
const PARAMETER_MASK: u8 = 0x0F;

/// HID_CONTROL parameter asking the peer to forget the virtual cable.
pub const VIRTUAL_CABLE_UNPLUG: u8 = 0x05;

/// The two L2CAP channels of a HID session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum ChannelKind {
   #[strum(serialize = "control")]
   Control,
   #[strum(serialize = "interrupt")]
   Interrupt,
}

impl ChannelKind {
   pub const ALL: [Self; 2] = [Self::Control, Self::Interrupt];

   pub const fn psm(self) -> u16 {
      match self {
         Self::Control => PSM_CONTROL,
         Self::Interrupt => PSM_INTERRUPT,
      }
   }

   pub const fn from_psm(psm: u16) -> Option<Self> {
      match psm {
         PSM_CONTROL => Some(Self::Control),
         PSM_INTERRUPT => Some(Self::Interrupt),
         _ => None,
      }
   }
}

/// Transport-assigned identifier of an open channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(NonZeroU32);

impl ConnectionId {
   pub const fn new(raw: u32) -> Option<Self> {
      match NonZeroU32::new(raw) {
         Some(id) => Some(Self(id)),
         None => None,
      }
   }

   pub const fn get(self) -> u32 {
      self.0.get()
   }
}

impl fmt::Display for ConnectionId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{:#06x}", self.0.get())
   }
}

/// HIDP transaction types, stored in the upper nibble of the header byte.
#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
pub enum TransactionType {
   Handshake = 0x00,
   HidControl = 0x10,
   GetReport = 0x40,
   SetReport = 0x50,
   GetProtocol = 0x60,
   SetProtocol = 0x70,
   GetIdle = 0x80,
   SetIdle = 0x90,
   Data = 0xA0,
   Datc = 0xB0,
}

impl TransactionType {
   /// Splits a header byte into its transaction type and parameter.
   pub fn from_header(header: u8) -> Option<(Self, u8)> {
      Self::from_repr(header & TRANSACTION_MASK).map(|t| (t, header & PARAMETER_MASK))
   }

   pub const fn header(self, parameter: u8) -> u8 {
      self as u8 | (parameter & PARAMETER_MASK)
   }
}

/// Returns the continuation header that follows a first frame with `header`.
pub const fn continuation_header(header: u8) -> u8 {
   TransactionType::Datc.header(header)
}

/// Report types carried in the parameter nibble of DATA/GET_REPORT/SET_REPORT.
#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
pub enum ReportType {
   Other = 0x00,
   Input = 0x01,
   Output = 0x02,
   Feature = 0x03,
}

impl ReportType {
   pub fn from_parameter(parameter: u8) -> Self {
      Self::from_repr(parameter & 0x03).unwrap_or(Self::Other)
   }
}

/// Link power modes an application may request.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum PowerMode {
   Active,
   Sniff,
   Disconnect,
}

impl PowerMode {
   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

/// Required link security for both channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Security {
   Low,
   #[default]
   Medium,
   High,
}

/// L2CAP flow specification requested for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Qos {
   pub service_type: u8,
   pub token_rate: u32,
   pub token_bucket: u32,
   pub peak_bandwidth: u32,
   pub latency: u32,
   pub delay_variation: u32,
}

/// Parameters of a channel reported by the transport once it is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInfo {
   pub cid: ConnectionId,
   pub host_mtu: u16,
   pub local_mtu: u16,
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_header_split() {
      assert_eq!(
         TransactionType::from_header(0x15),
         Some((TransactionType::HidControl, VIRTUAL_CABLE_UNPLUG))
      );
      assert_eq!(TransactionType::from_header(0xA1), Some((TransactionType::Data, 0x01)));
      assert_eq!(TransactionType::from_header(0x20), None, "0x2_ is reserved");
   }

   #[test]
   fn test_continuation_keeps_parameter() {
      assert_eq!(continuation_header(0xA1), 0xB1);
      assert_eq!(continuation_header(0x53), 0xB3);
   }

   #[test]
   fn test_psm_mapping() {
      assert_eq!(ChannelKind::from_psm(0x11), Some(ChannelKind::Control));
      assert_eq!(ChannelKind::from_psm(0x13), Some(ChannelKind::Interrupt));
      assert_eq!(ChannelKind::from_psm(0x01), None);
      assert!(ConnectionId::new(0).is_none());
   }
}

//! SDP data elements.
//!
//! Service records are handed to the session as opaque bytes. This module
//! parses them just far enough to read the HID boolean attributes and the
//! service class, and renders them in the XML form bluetoothd accepts.

use std::fmt;

use log::warn;
use thiserror::Error;
use uuid::Uuid;

use crate::error::HiddError;

/// ServiceClassIDList
pub const ATTR_SERVICE_CLASS_ID_LIST: u16 = 0x0001;
/// HIDVirtualCable
pub const ATTR_HID_VIRTUAL_CABLE: u16 = 0x0204;
/// HIDReconnectInitiate
pub const ATTR_HID_RECONNECT_INITIATE: u16 = 0x0205;

const MAX_DEPTH: usize = 16;

/// Bluetooth base UUID, 0000xxxx-0000-1000-8000-00805F9B34FB.
const BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SdpError {
   #[error("Element truncated: expected {expected} bytes, got {actual}")]
   Truncated { expected: usize, actual: usize },

   #[error("Invalid size index {size} for element type {kind}")]
   InvalidSize { kind: u8, size: u8 },

   #[error("Unknown element type {0}")]
   UnknownType(u8),

   #[error("Nesting deeper than {MAX_DEPTH} levels")]
   TooDeep,

   #[error("Not an attribute list")]
   NotARecord,
}

impl From<SdpError> for HiddError {
   fn from(err: SdpError) -> Self {
      Self::InvalidRecord(err.to_string())
   }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataElement {
   Nil,
   Uint8(u8),
   Uint16(u16),
   Uint32(u32),
   Uint64(u64),
   Uint128(u128),
   Int8(i8),
   Int16(i16),
   Int32(i32),
   Int64(i64),
   Int128(i128),
   Uuid16(u16),
   Uuid32(u32),
   Uuid128(Uuid),
   Text(Vec<u8>),
   Bool(bool),
   Sequence(Vec<DataElement>),
   Alternative(Vec<DataElement>),
   Url(Vec<u8>),
}

impl DataElement {
   /// Expands any UUID form to 128 bits.
   pub fn as_uuid(&self) -> Option<Uuid> {
      match *self {
         Self::Uuid16(short) => Some(Uuid::from_u128(BASE_UUID | (u128::from(short) << 96))),
         Self::Uuid32(short) => Some(Uuid::from_u128(BASE_UUID | (u128::from(short) << 96))),
         Self::Uuid128(uuid) => Some(uuid),
         _ => None,
      }
   }
}

struct Reader<'a> {
   buf: &'a [u8],
}

impl<'a> Reader<'a> {
   fn take(&mut self, n: usize) -> Result<&'a [u8], SdpError> {
      if self.buf.len() < n {
         return Err(SdpError::Truncated {
            expected: n,
            actual: self.buf.len(),
         });
      }
      let (head, tail) = self.buf.split_at(n);
      self.buf = tail;
      Ok(head)
   }

   fn array<const N: usize>(&mut self) -> Result<[u8; N], SdpError> {
      let mut out = [0u8; N];
      out.copy_from_slice(self.take(N)?);
      Ok(out)
   }

   fn element(&mut self, depth: usize) -> Result<DataElement, SdpError> {
      if depth > MAX_DEPTH {
         return Err(SdpError::TooDeep);
      }

      let [descriptor] = self.array::<1>()?;
      let kind = descriptor >> 3;
      let size = descriptor & 0x07;
      if kind == 0 {
         return if size == 0 {
            Ok(DataElement::Nil)
         } else {
            Err(SdpError::InvalidSize { kind, size })
         };
      }

      let len = match size {
         0 => 1,
         1 => 2,
         2 => 4,
         3 => 8,
         4 => 16,
         5 => usize::from(self.array::<1>()?[0]),
         6 => usize::from(u16::from_be_bytes(self.array()?)),
         _ => u32::from_be_bytes(self.array()?) as usize,
      };
      let invalid = SdpError::InvalidSize { kind, size };
      let mut body = Reader { buf: self.take(len)? };

      let element = match (kind, size) {
         (1, 0) => DataElement::Uint8(u8::from_be_bytes(body.array()?)),
         (1, 1) => DataElement::Uint16(u16::from_be_bytes(body.array()?)),
         (1, 2) => DataElement::Uint32(u32::from_be_bytes(body.array()?)),
         (1, 3) => DataElement::Uint64(u64::from_be_bytes(body.array()?)),
         (1, 4) => DataElement::Uint128(u128::from_be_bytes(body.array()?)),
         (2, 0) => DataElement::Int8(i8::from_be_bytes(body.array()?)),
         (2, 1) => DataElement::Int16(i16::from_be_bytes(body.array()?)),
         (2, 2) => DataElement::Int32(i32::from_be_bytes(body.array()?)),
         (2, 3) => DataElement::Int64(i64::from_be_bytes(body.array()?)),
         (2, 4) => DataElement::Int128(i128::from_be_bytes(body.array()?)),
         (3, 1) => DataElement::Uuid16(u16::from_be_bytes(body.array()?)),
         (3, 2) => DataElement::Uuid32(u32::from_be_bytes(body.array()?)),
         (3, 4) => DataElement::Uuid128(Uuid::from_bytes(body.array()?)),
         (4, 5..) => DataElement::Text(body.buf.to_vec()),
         (5, 0) => DataElement::Bool(body.array::<1>()?[0] != 0),
         (6 | 7, 5..) => {
            let mut items = Vec::new();
            while !body.buf.is_empty() {
               items.push(body.element(depth + 1)?);
            }
            if kind == 6 {
               DataElement::Sequence(items)
            } else {
               DataElement::Alternative(items)
            }
         },
         (8, 5..) => DataElement::Url(body.buf.to_vec()),
         (1..=8, _) => return Err(invalid),
         _ => return Err(SdpError::UnknownType(kind)),
      };
      Ok(element)
   }
}

/// A parsed service record: attribute id / value pairs in record order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpRecord {
   attributes: Vec<(u16, DataElement)>,
}

impl SdpRecord {
   pub fn parse(bytes: &[u8]) -> Result<Self, SdpError> {
      let mut reader = Reader { buf: bytes };
      let DataElement::Sequence(items) = reader.element(0)? else {
         return Err(SdpError::NotARecord);
      };

      let mut attributes = Vec::with_capacity(items.len() / 2);
      let mut items = items.into_iter();
      while let Some(id) = items.next() {
         let (DataElement::Uint16(id), Some(value)) = (id, items.next()) else {
            return Err(SdpError::NotARecord);
         };
         attributes.push((id, value));
      }
      Ok(Self { attributes })
   }

   pub fn attribute(&self, id: u16) -> Option<&DataElement> {
      self
         .attributes
         .iter()
         .find(|(attr, _)| *attr == id)
         .map(|(_, value)| value)
   }

   pub fn bool_attribute(&self, id: u16) -> Option<bool> {
      match self.attribute(id)? {
         DataElement::Bool(v) => Some(*v),
         _ => None,
      }
   }

   /// First entry of the ServiceClassIDList.
   pub fn service_class(&self) -> Option<Uuid> {
      match self.attribute(ATTR_SERVICE_CLASS_ID_LIST)? {
         DataElement::Sequence(classes) => classes.first()?.as_uuid(),
         other => other.as_uuid(),
      }
   }

   /// Renders the record in bluetoothd's XML record format.
   pub fn to_bluez_xml(&self) -> String {
      BluezXml(self).to_string()
   }
}

/// HID attributes that drive reconnect behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HidFlags {
   pub virtual_cable: bool,
   pub reconnect_initiate: bool,
}

impl HidFlags {
   /// Reads the flags from a HID record. Unreadable records yield no flags.
   pub fn from_record(record: &[u8]) -> Self {
      match SdpRecord::parse(record) {
         Ok(record) => Self {
            virtual_cable: record.bool_attribute(ATTR_HID_VIRTUAL_CABLE).unwrap_or(false),
            reconnect_initiate: record
               .bool_attribute(ATTR_HID_RECONNECT_INITIATE)
               .unwrap_or(false),
         },
         Err(e) => {
            warn!("Cannot read HID attributes from record: {e}");
            Self::default()
         },
      }
   }
}

struct BluezXml<'a>(&'a SdpRecord);

impl BluezXml<'_> {
   fn element(f: &mut fmt::Formatter<'_>, element: &DataElement, indent: usize) -> fmt::Result {
      let pad = indent * 2;
      write!(f, "{:pad$}", "")?;
      match element {
         DataElement::Nil => writeln!(f, "<nil />"),
         DataElement::Uint8(v) => writeln!(f, "<uint8 value=\"0x{v:02x}\" />"),
         DataElement::Uint16(v) => writeln!(f, "<uint16 value=\"0x{v:04x}\" />"),
         DataElement::Uint32(v) => writeln!(f, "<uint32 value=\"0x{v:08x}\" />"),
         DataElement::Uint64(v) => writeln!(f, "<uint64 value=\"0x{v:016x}\" />"),
         DataElement::Uint128(v) => writeln!(f, "<uint128 value=\"0x{v:032x}\" />"),
         DataElement::Int8(v) => writeln!(f, "<int8 value=\"{v}\" />"),
         DataElement::Int16(v) => writeln!(f, "<int16 value=\"{v}\" />"),
         DataElement::Int32(v) => writeln!(f, "<int32 value=\"{v}\" />"),
         DataElement::Int64(v) => writeln!(f, "<int64 value=\"{v}\" />"),
         DataElement::Int128(v) => writeln!(f, "<int128 value=\"{v}\" />"),
         DataElement::Uuid16(v) => writeln!(f, "<uuid value=\"0x{v:04x}\" />"),
         DataElement::Uuid32(v) => writeln!(f, "<uuid value=\"0x{v:08x}\" />"),
         DataElement::Uuid128(v) => writeln!(f, "<uuid value=\"{v}\" />"),
         DataElement::Text(bytes) => {
            writeln!(f, "<text encoding=\"hex\" value=\"{}\" />", hex::encode(bytes))
         },
         DataElement::Bool(v) => writeln!(f, "<boolean value=\"{v}\" />"),
         DataElement::Url(bytes) => {
            writeln!(f, "<url value=\"{}\" />", xml_escape(&String::from_utf8_lossy(bytes)))
         },
         DataElement::Sequence(items) | DataElement::Alternative(items) => {
            let tag = if matches!(element, DataElement::Sequence(_)) {
               "sequence"
            } else {
               "alternate"
            };
            writeln!(f, "<{tag}>")?;
            for item in items {
               Self::element(f, item, indent + 1)?;
            }
            writeln!(f, "{:pad$}</{tag}>", "")
         },
      }
   }
}

impl fmt::Display for BluezXml<'_> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      writeln!(f, "<?xml version=\"1.0\" encoding=\"UTF-8\" ?>")?;
      writeln!(f, "<record>")?;
      for (id, value) in &self.0.attributes {
         writeln!(f, "  <attribute id=\"0x{id:04x}\">")?;
         Self::element(f, value, 2)?;
         writeln!(f, "  </attribute>")?;
      }
      writeln!(f, "</record>")
   }
}

fn xml_escape(raw: &str) -> String {
   raw.replace('&', "&amp;")
      .replace('<', "&lt;")
      .replace('>', "&gt;")
      .replace('"', "&quot;")
}

/// Minimal HID record used by tests across the crate.
#[cfg(test)]
pub(crate) fn test_hid_record(virtual_cable: bool, reconnect_initiate: bool) -> Vec<u8> {
   vec![
      0x35, 0x12, // attribute list
      0x09, 0x00, 0x01, 0x35, 0x03, 0x19, 0x11, 0x24, // service class: HID
      0x09, 0x02, 0x04, 0x28, u8::from(virtual_cable),
      0x09, 0x02, 0x05, 0x28, u8::from(reconnect_initiate),
   ]
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::hid::protocol::HID_SERVICE_UUID;

   #[test]
   fn test_hid_flags_from_record() {
      let flags = HidFlags::from_record(&test_hid_record(true, false));
      assert!(flags.virtual_cable);
      assert!(!flags.reconnect_initiate);

      let flags = HidFlags::from_record(&test_hid_record(false, true));
      assert!(!flags.virtual_cable);
      assert!(flags.reconnect_initiate);

      assert_eq!(HidFlags::from_record(&[0x35, 0x09]), HidFlags::default());
   }

   #[test]
   fn test_service_class() {
      let record = SdpRecord::parse(&test_hid_record(true, true)).unwrap();
      assert_eq!(record.service_class(), Some(HID_SERVICE_UUID));
   }

   #[test]
   fn test_malformed_records() {
      assert_eq!(
         SdpRecord::parse(&[0x35, 0x05, 0x09, 0x00]),
         Err(SdpError::Truncated { expected: 5, actual: 2 })
      );
      assert_eq!(SdpRecord::parse(&[0x09, 0x00, 0x01]), Err(SdpError::NotARecord));
      assert_eq!(
         SdpRecord::parse(&[0x35, 0x02, 0x28, 0x01]),
         Err(SdpError::NotARecord),
         "attribute ids must be uint16"
      );
      assert_eq!(
         SdpRecord::parse(&[0x35, 0x02, 0x19, 0x11]),
         Err(SdpError::Truncated { expected: 2, actual: 1 })
      );
   }

   #[test]
   fn test_text_and_xml() {
      let bytes = [
         0x35, 0x0D, // list
         0x09, 0x01, 0x00, 0x25, 0x03, b'K', b'b', b'd', // ServiceName
         0x09, 0x02, 0x04, 0x28, 0x01,
      ];
      let xml = SdpRecord::parse(&bytes).unwrap().to_bluez_xml();
      assert!(xml.starts_with("<?xml"));
      assert!(xml.contains("<attribute id=\"0x0100\">"));
      assert!(xml.contains("<text encoding=\"hex\" value=\"4b6264\" />"));
      assert!(xml.contains("<boolean value=\"true\" />"));
      assert!(xml.trim_end().ends_with("</record>"));
   }
}

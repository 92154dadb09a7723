//! Service record bookkeeping.
//!
//! A session publishes at most two records, the HID record and an optional
//! Device ID record. They are always registered HID first and unregistered
//! HID first, one directory operation at a time.

use serde::{Deserialize, Serialize};

/// Which of the two records a slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum RecordKind {
   #[strum(serialize = "HID")]
   Hid,
   #[strum(serialize = "Device ID")]
   DeviceId,
}

impl RecordKind {
   const ORDER: [Self; 2] = [Self::Hid, Self::DeviceId];

   const fn index(self) -> usize {
      match self {
         Self::Hid => 0,
         Self::DeviceId => 1,
      }
   }
}

/// Directory handle lifecycle of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordHandle {
   #[default]
   Unregistered,
   Registering,
   Registered(u32),
   Unregistering(u32),
}

#[derive(Debug, Default)]
struct RecordSlot {
   bytes: Option<Vec<u8>>,
   handle: RecordHandle,
}

#[derive(Debug, Default)]
pub struct ServiceRecordManager {
   slots: [RecordSlot; 2],
}

impl ServiceRecordManager {
   pub fn new() -> Self {
      Self::default()
   }

   fn slot(&self, kind: RecordKind) -> &RecordSlot {
      &self.slots[kind.index()]
   }

   fn slot_mut(&mut self, kind: RecordKind) -> &mut RecordSlot {
      &mut self.slots[kind.index()]
   }

   pub fn bytes(&self, kind: RecordKind) -> Option<&[u8]> {
      self.slot(kind).bytes.as_deref()
   }

   pub fn handle(&self, kind: RecordKind) -> RecordHandle {
      self.slot(kind).handle
   }

   /// Stores new record bytes. The directory is not touched.
   pub fn supply(&mut self, kind: RecordKind, bytes: Vec<u8>) {
      self.slot_mut(kind).bytes = Some(bytes);
   }

   /// Drops all record bytes; handles are kept.
   pub fn forget_bytes(&mut self) {
      for slot in &mut self.slots {
         slot.bytes = None;
      }
   }

   pub fn is_published(&self, kind: RecordKind) -> bool {
      matches!(self.handle(kind), RecordHandle::Registered(_))
   }

   pub fn any_published(&self) -> bool {
      RecordKind::ORDER.iter().any(|&k| self.is_published(k))
   }

   /// A directory operation is awaiting its confirm.
   pub fn in_flight(&self) -> Option<RecordKind> {
      RecordKind::ORDER.into_iter().find(|&k| {
         matches!(
            self.handle(k),
            RecordHandle::Registering | RecordHandle::Unregistering(_)
         )
      })
   }

   /// Supplying these records requires unpublishing what is there first.
   pub fn requires_replacement(&self, hid: bool, device_id: bool) -> bool {
      (hid && self.is_published(RecordKind::Hid))
         || (device_id && self.is_published(RecordKind::DeviceId))
   }

   /// Next record with bytes that is not yet in the directory.
   pub fn next_unpublished(&self) -> Option<RecordKind> {
      RecordKind::ORDER.into_iter().find(|&k| {
         let slot = self.slot(k);
         slot.bytes.is_some() && slot.handle == RecordHandle::Unregistered
      })
   }

   /// Next record to take out of the directory.
   pub fn next_published(&self) -> Option<(RecordKind, u32)> {
      RecordKind::ORDER
         .into_iter()
         .find_map(|k| match self.handle(k) {
            RecordHandle::Registered(h) => Some((k, h)),
            _ => None,
         })
   }

   /// Marks `kind` as being registered and returns its bytes for the directory.
   pub fn begin_register(&mut self, kind: RecordKind) -> Option<Vec<u8>> {
      let slot = self.slot_mut(kind);
      let bytes = slot.bytes.clone()?;
      slot.handle = RecordHandle::Registering;
      Some(bytes)
   }

   /// Completes the in-flight registration, returning the kind it was for.
   pub fn finish_register(&mut self, handle: Option<u32>) -> Option<RecordKind> {
      let kind = RecordKind::ORDER
         .into_iter()
         .find(|&k| self.handle(k) == RecordHandle::Registering)?;
      self.slot_mut(kind).handle = match handle {
         Some(h) => RecordHandle::Registered(h),
         None => RecordHandle::Unregistered,
      };
      Some(kind)
   }

   pub fn begin_unregister(&mut self, kind: RecordKind) -> Option<u32> {
      let slot = self.slot_mut(kind);
      let RecordHandle::Registered(h) = slot.handle else {
         return None;
      };
      slot.handle = RecordHandle::Unregistering(h);
      Some(h)
   }

   /// Completes an unregistration. The handle is forgotten whatever the outcome.
   pub fn finish_unregister(&mut self, handle: u32) -> Option<RecordKind> {
      let kind = RecordKind::ORDER
         .into_iter()
         .find(|&k| self.handle(k) == RecordHandle::Unregistering(handle))?;
      self.slot_mut(kind).handle = RecordHandle::Unregistered;
      Some(kind)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_fixed_order() {
      let mut records = ServiceRecordManager::new();
      records.supply(RecordKind::DeviceId, vec![2]);
      records.supply(RecordKind::Hid, vec![1]);

      assert_eq!(records.next_unpublished(), Some(RecordKind::Hid));
      assert_eq!(records.begin_register(RecordKind::Hid), Some(vec![1]));
      assert_eq!(records.in_flight(), Some(RecordKind::Hid));
      assert_eq!(records.finish_register(Some(7)), Some(RecordKind::Hid));
      assert_eq!(records.next_unpublished(), Some(RecordKind::DeviceId));
      records.begin_register(RecordKind::DeviceId);
      records.finish_register(Some(8));

      assert_eq!(records.next_published(), Some((RecordKind::Hid, 7)));
      assert_eq!(records.begin_unregister(RecordKind::Hid), Some(7));
      assert_eq!(records.finish_unregister(7), Some(RecordKind::Hid));
      assert_eq!(records.next_published(), Some((RecordKind::DeviceId, 8)));
   }

   #[test]
   fn test_replacement_only_for_published_kinds() {
      let mut records = ServiceRecordManager::new();
      records.supply(RecordKind::Hid, vec![1]);
      assert!(!records.requires_replacement(true, true));

      records.begin_register(RecordKind::Hid);
      records.finish_register(Some(3));
      assert!(records.requires_replacement(true, false));
      assert!(!records.requires_replacement(false, true));
   }

   #[test]
   fn test_failed_register_leaves_slot_unregistered() {
      let mut records = ServiceRecordManager::new();
      records.supply(RecordKind::Hid, vec![1]);
      records.begin_register(RecordKind::Hid);
      assert_eq!(records.finish_register(None), Some(RecordKind::Hid));
      assert_eq!(records.handle(RecordKind::Hid), RecordHandle::Unregistered);
      assert!(records.in_flight().is_none());
      assert!(records.finish_register(Some(1)).is_none(), "stray confirm is ignored");
   }
}

//! One L2CAP channel of a HID session.
//!
//! The endpoint owns the channel's MTUs and the two buffers that make HIDP
//! segmentation work: an outbound message being sliced into MTU-sized
//! frames, and an inbound message being stitched back together.

use std::collections::VecDeque;

use log::warn;

use crate::{
   error::ErrorCode,
   hid::protocol::{ChannelInfo, ChannelKind, ConnectionId, Qos, continuation_header},
};

/// A message being sliced into frames.
#[derive(Debug)]
struct Outbound {
   buffer: Vec<u8>,
   offset: usize,
   continuation: u8,
   /// The frame carrying the final bytes has been handed to the transport.
   last_issued: bool,
}

/// Result of feeding one inbound fragment to the endpoint.
#[derive(Debug, PartialEq, Eq)]
pub enum Reassembly {
   /// Fragment buffered, more to come.
   Partial,
   /// A whole message, header byte first.
   Complete(Vec<u8>),
   /// Fragment larger than the local MTU; it and any partial message were dropped.
   Violation { length: usize },
}

/// Result of a send-complete notification.
#[derive(Debug, PartialEq, Eq)]
pub enum SendProgress {
   /// Next chunk of the current message.
   Continue(Vec<u8>),
   /// Current message is done; `next` is the first frame of the following one.
   Finished {
      status: Result<(), ErrorCode>,
      next: Option<Vec<u8>>,
   },
   /// Nothing was in flight.
   Unexpected,
}

#[derive(Debug)]
pub struct ChannelEndpoint {
   kind: ChannelKind,
   cid: Option<ConnectionId>,
   host_mtu: u16,
   local_mtu: u16,
   qos: Option<Qos>,
   outbound: Option<Outbound>,
   backlog: VecDeque<Vec<u8>>,
   stalled: Option<Vec<u8>>,
   inbound: Option<Vec<u8>>,
   pull_outstanding: bool,
}

impl ChannelEndpoint {
   pub const fn new(kind: ChannelKind) -> Self {
      Self {
         kind,
         cid: None,
         host_mtu: 0,
         local_mtu: 0,
         qos: None,
         outbound: None,
         backlog: VecDeque::new(),
         stalled: None,
         inbound: None,
         pull_outstanding: false,
      }
   }

   pub const fn cid(&self) -> Option<ConnectionId> {
      self.cid
   }

   pub const fn is_connected(&self) -> bool {
      self.cid.is_some()
   }

   pub const fn host_mtu(&self) -> u16 {
      self.host_mtu
   }

   pub const fn local_mtu(&self) -> u16 {
      self.local_mtu
   }

   pub const fn qos(&self) -> Option<Qos> {
      self.qos
   }

   pub fn set_qos(&mut self, qos: Option<Qos>) {
      self.qos = qos;
   }

   /// No message, chunk or pull is outstanding on this channel.
   pub fn is_quiescent(&self) -> bool {
      self.outbound.is_none()
         && self.backlog.is_empty()
         && self.stalled.is_none()
         && !self.pull_outstanding
   }

   /// Adopts an open channel reported by the transport.
   pub fn open(&mut self, info: ChannelInfo) {
      self.cid = Some(info.cid);
      self.host_mtu = info.host_mtu;
      self.local_mtu = info.local_mtu;
   }

   /// Restores channel parameters without any buffered data.
   pub fn restore(&mut self, cid: Option<ConnectionId>, host_mtu: u16, local_mtu: u16) {
      self.close();
      self.cid = cid;
      self.host_mtu = host_mtu;
      self.local_mtu = local_mtu;
   }

   /// Forgets the channel and drops every buffer. QoS is kept for the next open.
   pub fn close(&mut self) -> Option<ConnectionId> {
      self.outbound = None;
      self.backlog.clear();
      self.stalled = None;
      self.inbound = None;
      self.pull_outstanding = false;
      self.cid.take()
   }

   // === Outbound ===

   /// Queues `message` and returns the frame to hand to the transport now, if
   /// the channel is not already busy with an earlier message.
   pub fn enqueue(&mut self, message: Vec<u8>) -> Option<Vec<u8>> {
      if self.outbound.is_some() || self.stalled.is_some() {
         self.backlog.push_back(message);
         return None;
      }
      Some(self.begin(message))
   }

   fn begin(&mut self, mut message: Vec<u8>) -> Vec<u8> {
      let mtu = usize::from(self.host_mtu);
      let header = message.first().copied().unwrap_or_default();

      if mtu < 2 || message.len() < mtu {
         self.outbound = Some(Outbound {
            buffer: Vec::new(),
            offset: 0,
            continuation: continuation_header(header),
            last_issued: true,
         });
         return message;
      }

      let rest = message.split_off(mtu);
      self.outbound = Some(Outbound {
         buffer: rest,
         offset: 0,
         continuation: continuation_header(header),
         last_issued: false,
      });
      message
   }

   fn next_chunk(&mut self) -> Option<Vec<u8>> {
      let chunk = usize::from(self.host_mtu).saturating_sub(1);
      let out = self.outbound.as_mut()?;
      let remaining = out.buffer.len() - out.offset;
      let take = if remaining >= chunk {
         chunk
      } else {
         out.last_issued = true;
         remaining
      };

      let mut frame = Vec::with_capacity(take + 1);
      frame.push(out.continuation);
      frame.extend_from_slice(&out.buffer[out.offset..out.offset + take]);
      out.offset += take;
      if out.last_issued {
         out.buffer = Vec::new();
      }
      Some(frame)
   }

   /// Advances the outbound state after the transport confirmed a frame.
   pub fn on_send_complete(&mut self, result: Result<(), ErrorCode>) -> SendProgress {
      let Some(out) = self.outbound.as_ref() else {
         return SendProgress::Unexpected;
      };

      if result.is_ok() && !out.last_issued {
         if let Some(frame) = self.next_chunk() {
            return SendProgress::Continue(frame);
         }
      }

      if let Err(code) = result {
         warn!("{} channel: send failed ({code}), dropping message", self.kind);
      }
      self.outbound = None;
      let next = self.backlog.pop_front().map(|msg| self.begin(msg));
      SendProgress::Finished { status: result, next }
   }

   /// Keeps a frame the transport could not accept until it reports space.
   pub fn stall(&mut self, frame: Vec<u8>) {
      self.stalled = Some(frame);
   }

   /// Releases the stalled frame for resending.
   pub fn take_stalled(&mut self) -> Option<Vec<u8>> {
      self.stalled.take()
   }

   // === Inbound ===

   pub fn set_pull_outstanding(&mut self, pending: bool) {
      self.pull_outstanding = pending;
   }

   /// Feeds one fragment received on this channel.
   pub fn receive(&mut self, fragment: Vec<u8>) -> Reassembly {
      let mtu = usize::from(self.local_mtu);
      let length = fragment.len();

      if mtu != 0 && length > mtu {
         self.inbound = None;
         return Reassembly::Violation { length };
      }

      match self.inbound.take() {
         Some(mut buffer) => {
            if length <= 1 {
               return Reassembly::Complete(buffer);
            }
            buffer.extend_from_slice(&fragment[1..]);
            if length < mtu {
               Reassembly::Complete(buffer)
            } else {
               self.inbound = Some(buffer);
               Reassembly::Partial
            }
         },
         None if mtu != 0 && length == mtu => {
            self.inbound = Some(fragment);
            Reassembly::Partial
         },
         None => Reassembly::Complete(fragment),
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn endpoint(mtu: u16) -> ChannelEndpoint {
      let mut ep = ChannelEndpoint::new(ChannelKind::Interrupt);
      ep.open(ChannelInfo {
         cid: ConnectionId::new(0x41).unwrap(),
         host_mtu: mtu,
         local_mtu: mtu,
      });
      ep
   }

   /// Drives a full send, confirming every frame.
   fn segment(ep: &mut ChannelEndpoint, message: Vec<u8>) -> Vec<Vec<u8>> {
      let mut frames = vec![ep.enqueue(message).expect("idle endpoint sends immediately")];
      loop {
         match ep.on_send_complete(Ok(())) {
            SendProgress::Continue(frame) => frames.push(frame),
            SendProgress::Finished { status, next } => {
               assert_eq!(status, Ok(()));
               assert!(next.is_none());
               return frames;
            },
            SendProgress::Unexpected => panic!("confirm without frame in flight"),
         }
      }
   }

   fn reassemble(ep: &mut ChannelEndpoint, frames: Vec<Vec<u8>>) -> Vec<u8> {
      let count = frames.len();
      for (i, frame) in frames.into_iter().enumerate() {
         match ep.receive(frame) {
            Reassembly::Partial => assert!(i + 1 < count, "last frame must complete the message"),
            Reassembly::Complete(msg) => {
               assert_eq!(i + 1, count, "message completed early");
               return msg;
            },
            Reassembly::Violation { length } => panic!("unexpected violation at {length} bytes"),
         }
      }
      panic!("message never completed");
   }

   #[test]
   fn test_segmentation_round_trip() {
      for mtu in [2u16, 3, 7, 48, 672] {
         let m = usize::from(mtu);
         for len in [0, 1, m - 1, m, m + 1, 10 * m - 3] {
            let message: Vec<u8> = (0..len).map(|i| (i * 7 + 3) as u8).collect();
            let mut tx = endpoint(mtu);
            let mut rx = endpoint(mtu);

            let frames = segment(&mut tx, message.clone());
            assert!(
               frames.iter().all(|f| f.len() <= m),
               "mtu {mtu} len {len}: frame exceeds MTU"
            );
            assert_eq!(reassemble(&mut rx, frames), message, "mtu {mtu} len {len}");
            assert!(tx.is_quiescent());
         }
      }
   }

   #[test]
   fn test_130_bytes_over_48() {
      let mut report = vec![0u8; 130];
      report[0] = 0xA1;
      let frames = segment(&mut endpoint(48), report);
      let sizes: Vec<_> = frames.iter().map(Vec::len).collect();
      assert_eq!(sizes, [48, 48, 36]);
      assert_eq!(frames[0][0], 0xA1, "first frame keeps the original header");
      assert_eq!(frames[1][0], 0xB1);
      assert_eq!(frames[2][0], 0xB1);
   }

   #[test]
   fn test_exact_mtu_needs_terminator() {
      let frames = segment(&mut endpoint(4), vec![0xA1, 1, 2, 3]);
      assert_eq!(frames, vec![vec![0xA1, 1, 2, 3], vec![0xB1]]);
   }

   #[test]
   fn test_oversized_fragment_drops_partial() {
      let mut ep = endpoint(4);
      assert_eq!(ep.receive(vec![0xA1, 1, 2, 3]), Reassembly::Partial);
      assert_eq!(ep.receive(vec![0; 5]), Reassembly::Violation { length: 5 });
      assert_eq!(ep.receive(vec![0xA1, 9]), Reassembly::Complete(vec![0xA1, 9]));
   }

   #[test]
   fn test_messages_are_serialized() {
      let mut ep = endpoint(4);
      let first = ep.enqueue(vec![0xA1, 1, 2, 3, 4]).unwrap();
      assert_eq!(first, vec![0xA1, 1, 2, 3]);
      assert!(ep.enqueue(vec![0xA1, 9]).is_none(), "second message waits");

      assert_eq!(ep.on_send_complete(Ok(())), SendProgress::Continue(vec![0xB1, 4]));
      assert_eq!(
         ep.on_send_complete(Ok(())),
         SendProgress::Finished { status: Ok(()), next: Some(vec![0xA1, 9]) }
      );
      assert_eq!(
         ep.on_send_complete(Ok(())),
         SendProgress::Finished { status: Ok(()), next: None }
      );
      assert_eq!(ep.on_send_complete(Ok(())), SendProgress::Unexpected);
   }

   #[test]
   fn test_failed_confirm_aborts_message() {
      let mut ep = endpoint(4);
      ep.enqueue(vec![0xA1; 12]).unwrap();
      assert_eq!(
         ep.on_send_complete(Err(ErrorCode::TRANSPORT_FAILURE)),
         SendProgress::Finished { status: Err(ErrorCode::TRANSPORT_FAILURE), next: None }
      );
      assert!(ep.is_quiescent());
   }
}

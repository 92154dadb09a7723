//! Bluetooth HID device session engine.
//!
//! Everything under this module is free of I/O. A [`Session`] turns inputs
//! into actions; the runtime in [`crate::bluetooth`] executes them.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod channel;
pub mod handover;
pub mod message;
pub mod protocol;
pub mod record;
pub mod registry;
pub mod retry;
pub mod sdp;
pub mod session;

pub use registry::SessionRegistry;
pub use session::{Session, SessionConfig, State};

/// Identifies a session within one controller instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u32);

impl SessionId {
   pub const fn new(raw: u32) -> Self {
      Self(raw)
   }

   pub const fn get(self) -> u32 {
      self.0
   }
}

impl fmt::Display for SessionId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "#{}", self.0)
   }
}

//! Reconnect budget and session timers.
//!
//! Every reconnect attempt (an active connect or a reconnect accept window)
//! consumes one unit of the budget; a successful connection refills it.
//! Timers are identified by a token whose generation lets the session tell
//! a live expiry from one that raced with a cancel.

use std::time::Duration;

use log::debug;

use crate::hid::protocol::ChannelKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
   /// Bounds how long a reconnect accept window stays open.
   AcceptWindow,
   /// Delay before the next active connect on the given channel.
   ConnectRetry(ChannelKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken {
   pub kind: TimerKind,
   pub generation: u64,
}

#[derive(Debug)]
pub struct RetryController {
   count: u32,
   max: u32,
   accept_window: Duration,
   retry_delay: Duration,
   generation: u64,
   accept_timer: Option<TimerToken>,
   retry_timer: Option<TimerToken>,
}

impl RetryController {
   pub const fn new(max: u32, accept_window: Duration, retry_delay: Duration) -> Self {
      Self {
         count: 0,
         max,
         accept_window,
         retry_delay,
         generation: 0,
         accept_timer: None,
         retry_timer: None,
      }
   }

   pub const fn count(&self) -> u32 {
      self.count
   }

   pub const fn max(&self) -> u32 {
      self.max
   }

   /// Budget left for at least one more attempt.
   pub const fn can_retry(&self) -> bool {
      self.count < self.max
   }

   /// Consumes one attempt; refuses once the budget is spent.
   pub fn try_begin_attempt(&mut self) -> bool {
      if !self.can_retry() {
         debug!("Reconnect budget exhausted ({}/{})", self.count, self.max);
         return false;
      }
      self.count += 1;
      debug!("Reconnect attempt {}/{}", self.count, self.max);
      true
   }

   pub fn reset(&mut self) {
      self.count = 0;
   }

   pub fn restore(&mut self, count: u32) {
      self.count = count.min(self.max);
   }

   fn next_token(&mut self, kind: TimerKind) -> TimerToken {
      self.generation += 1;
      TimerToken {
         kind,
         generation: self.generation,
      }
   }

   /// Arms the accept window, replacing any previous one.
   pub fn arm_accept_window(&mut self) -> (TimerToken, Duration) {
      let token = self.next_token(TimerKind::AcceptWindow);
      self.accept_timer = Some(token);
      (token, self.accept_window)
   }

   /// Arms the connect-retry delay, replacing any previous one.
   pub fn arm_connect_retry(&mut self, channel: ChannelKind) -> (TimerToken, Duration) {
      let token = self.next_token(TimerKind::ConnectRetry(channel));
      self.retry_timer = Some(token);
      (token, self.retry_delay)
   }

   pub const fn retry_pending(&self) -> bool {
      self.retry_timer.is_some()
   }

   /// Disarms every timer and returns the tokens to cancel.
   pub fn cancel_all(&mut self) -> impl Iterator<Item = TimerToken> + use<> {
      [self.accept_timer.take(), self.retry_timer.take()]
         .into_iter()
         .flatten()
   }

   /// Disarms the timer `token` belongs to. Returns false for stale tokens.
   pub fn expire(&mut self, token: TimerToken) -> bool {
      let slot = match token.kind {
         TimerKind::AcceptWindow => &mut self.accept_timer,
         TimerKind::ConnectRetry(_) => &mut self.retry_timer,
      };
      if *slot == Some(token) {
         *slot = None;
         true
      } else {
         debug!("Ignoring stale timer {token:?}");
         false
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn controller(max: u32) -> RetryController {
      RetryController::new(max, Duration::from_secs(60), Duration::from_secs(2))
   }

   #[test]
   fn test_budget_is_bounded() {
      let mut retry = controller(3);
      let granted = (0..10).filter(|_| retry.try_begin_attempt()).count();
      assert_eq!(granted, 3);
      assert_eq!(retry.count(), 3);
      assert!(!retry.can_retry());

      retry.reset();
      assert!(retry.can_retry());
   }

   #[test]
   fn test_stale_tokens_are_ignored() {
      let mut retry = controller(3);
      let (first, after) = retry.arm_accept_window();
      assert_eq!(after, Duration::from_secs(60));
      let (second, _) = retry.arm_accept_window();

      assert!(!retry.expire(first), "replaced timer must not fire");
      assert!(retry.expire(second));
      assert!(!retry.expire(second), "a timer fires once");
   }

   #[test]
   fn test_cancel_all() {
      let mut retry = controller(3);
      let (accept, _) = retry.arm_accept_window();
      let (connect, _) = retry.arm_connect_retry(ChannelKind::Control);
      let cancelled: Vec<_> = retry.cancel_all().collect();
      assert_eq!(cancelled, vec![accept, connect]);
      assert!(!retry.expire(connect));
      assert!(!retry.retry_pending());
   }
}

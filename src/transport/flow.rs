//! Ordering between the event ring and the ACL ring.
//!
//! Events and ACL data travel on separate rings but the consumer must see a
//! handle's Connected event before its data, and its data before its
//! Disconnected event. Each ring is paused when its head record would
//! break that order. When both are paused at once, the coordinator looks
//! ahead in the event ring for the Connected event the ACL ring is waiting
//! on and delivers it early, remembering its slot so the normal scan skips it.

use log::debug;

/// Whether a ring may currently be drained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Flow {
   #[default]
   Flowing,
   Paused,
}

#[derive(Debug)]
pub struct FlowControl {
   event: Flow,
   acl: Flow,
   /// Event slots already delivered out of order.
   processed: Vec<bool>,
}

impl FlowControl {
   pub fn new(event_ring_capacity: usize) -> Self {
      Self {
         event: Flow::Flowing,
         acl: Flow::Flowing,
         processed: vec![false; event_ring_capacity],
      }
   }

   pub fn event_flow(&self) -> Flow {
      self.event
   }

   pub fn acl_flow(&self) -> Flow {
      self.acl
   }

   pub fn events_paused(&self) -> bool {
      self.event == Flow::Paused
   }

   pub fn acl_paused(&self) -> bool {
      self.acl == Flow::Paused
   }

   pub fn both_paused(&self) -> bool {
      self.events_paused() && self.acl_paused()
   }

   /// A Disconnected event arrived while its handle still has ACL data queued.
   pub fn pause_events(&mut self, handle: u16) {
      if self.event != Flow::Paused {
         debug!("Event flow paused for handle 0x{handle:04x}");
      }
      self.event = Flow::Paused;
   }

   /// The terminal ACL record arrived.
   pub fn resume_events(&mut self) {
      self.event = Flow::Flowing;
   }

   /// ACL data arrived for a handle whose Connected event is not delivered.
   pub fn pause_acl(&mut self, handle: u16) {
      if self.acl != Flow::Paused {
         debug!("ACL flow paused for handle 0x{handle:04x}");
      }
      self.acl = Flow::Paused;
   }

   /// A Connected event was delivered.
   pub fn resume_acl(&mut self) {
      self.acl = Flow::Flowing;
   }

   /// Records that the event in `slot` was delivered ahead of the read index.
   pub fn mark_processed(&mut self, slot: u32) {
      if let Some(flag) = self.processed.get_mut(slot as usize) {
         *flag = true;
      }
   }

   /// Clears and returns the out-of-order mark for `slot`.
   pub fn take_processed(&mut self, slot: u32) -> bool {
      self
         .processed
         .get_mut(slot as usize)
         .is_some_and(std::mem::take)
   }

   pub fn is_processed(&self, slot: u32) -> bool {
      self.processed.get(slot as usize).copied().unwrap_or(false)
   }
}

//! Doorbell signalling towards the firmware.
//!
//! The physical mailbox interrupt is hidden behind the [`Doorbell`] trait;
//! the transport only knows the opaque interrupt source ids negotiated when
//! the session was brought up.

use std::sync::Arc;

use parking_lot::Mutex;

/// Interrupt source ids used to kick the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptSources {
   /// Raised after publishing TX records (commands, ACL, AVDTP notifications).
   pub to_background: u16,
   /// Raised after consuming RX records so firmware can reuse the slots.
   pub to_foreground: u16,
}

impl Default for InterruptSources {
   fn default() -> Self {
      Self {
         to_background: 0,
         to_foreground: 1,
      }
   }
}

/// Trait for implementing the host-to-firmware interrupt.
pub trait Doorbell: Send + Sync {
   /// Tells the peer to re-scan its rings.
   fn ring(&self, source: u16);
}

/// Type alias for a thread-safe doorbell handle.
pub type DoorbellHandle = Arc<dyn Doorbell>;

/// Doorbell that does nothing, for peers that poll.
#[derive(Debug, Default)]
pub struct NullDoorbell;

impl Doorbell for NullDoorbell {
   fn ring(&self, _source: u16) {}
}

/// Doorbell that records every ring, used by the emulator and tests.
#[derive(Debug, Default)]
pub struct RecordingDoorbell {
   rung: Mutex<Vec<u16>>,
}

impl RecordingDoorbell {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   /// Drains the recorded source ids.
   pub fn take(&self) -> Vec<u16> {
      std::mem::take(&mut *self.rung.lock())
   }

   pub fn count(&self, source: u16) -> usize {
      self.rung.lock().iter().filter(|&&s| s == source).count()
   }
}

impl Doorbell for RecordingDoorbell {
   fn ring(&self, source: u16) {
      self.rung.lock().push(source);
   }
}

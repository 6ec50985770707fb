//! Error types for the shared-memory transport.
//!
//! Errors are split by how the session reacts to them: fatal kinds latch the
//! session's permanent error flag, transient kinds are returned to the caller
//! and leave the session usable.

use thiserror::Error;

use crate::mailbox::RingKind;

/// Main error type for the transport.
#[derive(Error, Debug)]
pub enum TransportError {
   #[error("{ring} index {index} out of bounds (capacity {capacity})")]
   OutOfBounds {
      ring: RingKind,
      index: u32,
      capacity: u32,
   },

   #[error("No room in {0} ring")]
   NoRoom(RingKind),

   #[error("ACL transmit buffer pool exhausted")]
   NoBuffer,

   #[error("Protocol violation: {0}")]
   ProtocolViolation(#[from] Violation),

   #[error("Caller buffer fault at offset {offset}")]
   CopyFault { offset: usize },

   #[error("Another reader or writer is active")]
   Busy,

   #[error("No data available, try again")]
   WouldBlock,

   #[error("Wait interrupted")]
   Interrupted,

   #[error("Transport failed, session must be reinitialized")]
   Io,

   #[error("Session closed")]
   Closed,

   #[error("Firmware panic 0x{0:08x}")]
   FirmwarePanic(u32),

   #[error("Config I/O error: {0}")]
   ConfigIo(#[from] std::io::Error),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Invalid configuration: {0}")]
   InvalidConfig(&'static str),
}

impl TransportError {
   /// Returns true for errors that permanently fail the session.
   pub const fn is_fatal(&self) -> bool {
      matches!(
         self,
         Self::OutOfBounds { .. } | Self::NoBuffer | Self::ProtocolViolation(_) | Self::FirmwarePanic(_)
      )
   }
}

/// Peer or caller behaviour that breaks the wire contract.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Violation {
   /// Unknown H4 packet indicator on the write path
   #[error("Unknown H4 packet type 0x{packet_type:02x}")]
   UnknownPacketType { packet_type: u8 },

   /// ACL frame declares more payload than a buffer holds
   #[error("ACL payload of {length} bytes exceeds {max}")]
   AclTooLong { length: usize, max: usize },

   /// Command parameters do not fit a command descriptor
   #[error("Command of {length} bytes exceeds {max}")]
   CommandTooLong { length: usize, max: usize },

   /// Event descriptor length disagrees with its parameter length
   #[error("Event length mismatch: descriptor {length}, header says {declared}")]
   EventLengthMismatch { length: usize, declared: usize },

   /// Connection handle beyond the connection table
   #[error("Connection handle 0x{handle:04x} beyond table of {bound}")]
   HandleOutOfRange { handle: u16, bound: usize },

   /// Packet boundary flag value 0b11
   #[error("Reserved packet boundary flag on handle 0x{handle:04x}")]
   ReservedBoundary { handle: u16 },

   /// First fragment too short to carry an L2CAP basic header
   #[error("Start fragment of {length} bytes has no L2CAP header")]
   MissingL2capHeader { length: usize },

   /// A start fragment arrived while another packet was still incomplete
   #[error("Fragment interleaving on handle 0x{handle:04x}: {remaining} bytes outstanding")]
   FragmentInterleaved { handle: u16, remaining: usize },

   /// A continuation fragment with no packet in progress, or one that overruns it
   #[error("Unexpected continuation on handle 0x{handle:04x}: {length} bytes, {remaining} expected")]
   UnexpectedContinuation {
      handle: u16,
      length: usize,
      remaining: usize,
   },

   /// Continuation longer than the L2CAP remainder while overrun tolerance is disabled
   #[error("Fragment overrun on handle 0x{handle:04x}: {length} bytes, {remaining} remaining")]
   FragmentOverrun {
      handle: u16,
      length: usize,
      remaining: usize,
   },

   /// ACL data for a handle whose disconnection was already signalled
   #[error("ACL data on handle 0x{handle:04x} after disconnect marker")]
   DataAfterDisconnect { handle: u16 },

   /// The sync helper found no Connected event for a paused ACL handle
   #[error("No Connected event for handle 0x{handle:04x} within {timeout_ms} ms")]
   SyncTimeout { handle: u16, timeout_ms: u64 },
}

/// Convenience type alias for Results with `TransportError`.
pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_fatal_classification() {
      assert!(TransportError::NoBuffer.is_fatal());
      assert!(TransportError::FirmwarePanic(0x10DE_AD01).is_fatal());
      assert!(
         TransportError::ProtocolViolation(Violation::ReservedBoundary { handle: 1 }).is_fatal()
      );
      assert!(!TransportError::NoRoom(RingKind::Command).is_fatal());
      assert!(!TransportError::CopyFault { offset: 3 }.is_fatal());
      assert!(!TransportError::WouldBlock.is_fatal());
   }

   #[test]
   fn test_display_messages() {
      let err = TransportError::OutOfBounds {
         ring: RingKind::Event,
         index: 40,
         capacity: 32,
      };
      assert_eq!(err.to_string(), "event index 40 out of bounds (capacity 32)");

      let err: TransportError = Violation::UnknownPacketType { packet_type: 0x07 }.into();
      assert_eq!(err.to_string(), "Protocol violation: Unknown H4 packet type 0x07");
   }
}

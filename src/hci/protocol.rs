//! HCI wire definitions used on the byte-stream boundary.
//!
//! Packets cross the stream in H4 (UART) framing: a one-byte packet
//! indicator followed by the standard HCI packet.

use crate::mailbox::descriptor::acl_flags;

/// H4 header length for command packets: indicator, opcode, length.
pub const H4_COMMAND_HEADER: usize = 1 + 3;
/// H4 header length for ACL packets: indicator, handle/flags, length.
pub const H4_ACL_HEADER: usize = 1 + 4;
/// HCI event header: code and parameter length.
pub const EVENT_HEADER: usize = 2;
/// L2CAP basic header: length and channel id.
pub const L2CAP_HEADER: usize = 4;

/// Connection handle bits in an ACL header.
pub const HANDLE_MASK: u16 = 0x0FFF;
/// Handles in this range carry raw controller traces and bypass tracking.
pub const RAW_HANDLE_MASK: u16 = 0xF000;
pub const RAW_HANDLE_VALUE: u16 = 0x2000;

pub const EV_HARDWARE_ERROR: u8 = 0x10;
pub const EV_COMMAND_COMPLETE: u8 = 0x0E;
pub const EV_NUMBER_OF_COMPLETED_PACKETS: u8 = 0x13;
pub const EV_LE_META: u8 = 0x3E;

pub const LE_CONNECTIONLESS_IQ_REPORT: u8 = 0x15;
pub const LE_CONNECTION_IQ_REPORT: u8 = 0x16;

/// H4 packet indicators.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum PacketType {
   Command = 0x01,
   Acl = 0x02,
   Event = 0x04,
}

impl PacketType {
   /// Bytes needed before the total packet length is known.
   pub const fn header_len(self) -> usize {
      match self {
         Self::Command => H4_COMMAND_HEADER,
         Self::Acl => H4_ACL_HEADER,
         Self::Event => 1 + EVENT_HEADER,
      }
   }

   /// Total H4 packet length given at least `header_len` bytes.
   pub fn packet_len(self, h4: &[u8]) -> usize {
      match self {
         Self::Command => H4_COMMAND_HEADER + h4[3] as usize,
         Self::Acl => H4_ACL_HEADER + u16::from_le_bytes([h4[3], h4[4]]) as usize,
         Self::Event => 1 + EVENT_HEADER + h4[2] as usize,
      }
   }
}

/// Packet boundary of an ACL frame, as found in bits 4-5 of the flags nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketBoundary {
   StartNonFlush,
   Continuation,
   StartFlush,
   Reserved,
}

impl PacketBoundary {
   /// From the upper flags nibble of an ACL header (`flags & 0x30`).
   pub const fn from_flags(flags: u8) -> Self {
      match flags & acl_flags::PB_MASK {
         acl_flags::PB_START_NONFLUSH => Self::StartNonFlush,
         acl_flags::PB_CONT => Self::Continuation,
         acl_flags::PB_START_FLUSH => Self::StartFlush,
         _ => Self::Reserved,
      }
   }

   /// From the two-bit value carried by RX descriptors.
   pub const fn from_bits(bits: u8) -> Self {
      Self::from_flags((bits & 0x03) << 4)
   }

   pub const fn bits(self) -> u8 {
      match self {
         Self::StartNonFlush => 0,
         Self::Continuation => 1,
         Self::StartFlush => 2,
         Self::Reserved => 3,
      }
   }

   pub const fn is_start(self) -> bool {
      matches!(self, Self::StartNonFlush | Self::StartFlush)
   }
}

/// ACL header, without the H4 indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AclHeader {
   pub handle: u16,
   /// Upper nibble of the second byte: boundary and broadcast bits.
   pub flags: u8,
   pub length: u16,
}

impl AclHeader {
   pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
      let b = bytes.get(..4)?;
      Some(Self {
         handle: u16::from(b[0]) | (u16::from(b[1] & 0x0F) << 8),
         flags: b[1] & 0xF0,
         length: u16::from_le_bytes([b[2], b[3]]),
      })
   }

   pub const fn boundary(&self) -> PacketBoundary {
      PacketBoundary::from_flags(self.flags)
   }

   pub const fn is_broadcast(&self) -> bool {
      self.flags & acl_flags::BC_MASK != 0
   }
}

/// Reads the L2CAP basic header at the start of `payload`: (length, cid).
pub fn l2cap_header(payload: &[u8]) -> Option<(u16, u16)> {
   let b = payload.get(..L2CAP_HEADER)?;
   Some((u16::from_le_bytes([b[0], b[1]]), u16::from_le_bytes([b[2], b[3]])))
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_acl_header_parse() {
      // handle 0x0123, start flushable, 9 bytes
      let hdr = AclHeader::from_bytes(&[0x23, 0x21, 0x09, 0x00]).unwrap();
      assert_eq!(hdr.handle, 0x0123);
      assert_eq!(hdr.flags, 0x20);
      assert_eq!(hdr.length, 9);
      assert_eq!(hdr.boundary(), PacketBoundary::StartFlush);
      assert!(!hdr.is_broadcast());

      let hdr = AclHeader::from_bytes(&[0x01, 0x50, 0x00, 0x00]).unwrap();
      assert_eq!(hdr.boundary(), PacketBoundary::Continuation);
      assert!(hdr.is_broadcast());

      assert!(AclHeader::from_bytes(&[0x01, 0x00, 0x00]).is_none());
   }

   #[test]
   fn test_packet_lengths() {
      assert_eq!(PacketType::from_repr(0x01), Some(PacketType::Command));
      assert_eq!(PacketType::from_repr(0x03), None);
      assert_eq!(PacketType::Command.packet_len(&[0x01, 0x03, 0x0c, 0x03]), 7);
      assert_eq!(PacketType::Acl.packet_len(&[0x02, 0x01, 0x00, 0x05, 0x01]), 5 + 261);
   }

   #[test]
   fn test_boundary_bits_roundtrip() {
      for bits in 0..4 {
         assert_eq!(PacketBoundary::from_bits(bits).bits(), bits);
      }
      assert!(PacketBoundary::from_bits(2).is_start());
      assert!(!PacketBoundary::from_bits(1).is_start());
   }
}

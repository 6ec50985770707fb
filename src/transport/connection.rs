//! Per-handle connection tracking and L2CAP fragment accounting.
//!
//! On transmit, each ACL frame is tagged with the L2CAP channel it belongs
//! to and whether it completes its L2CAP packet, so the firmware can
//! schedule whole packets. On receive, boundary flags set by the firmware
//! are checked for interleaving within one handle.

use log::{debug, warn};

use crate::{
   error::{Result, Violation},
   hci::protocol::{AclHeader, L2CAP_HEADER, PacketBoundary, l2cap_header},
   mailbox::descriptor::acl_flags,
};

/// Lifecycle of one HCI connection handle as seen by the reader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
   /// No Connected event delivered yet, or fully torn down.
   #[default]
   None,
   /// Connected event delivered, data may flow.
   Active,
   /// Firmware sent the last ACL record, the Disconnected event is pending.
   Disconnected,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionInfo {
   pub state: ConnectionState,
   /// L2CAP bytes still to be sent for the packet in progress.
   pub pending_fragment_len: usize,
   pub l2cap_cid: u16,
   rx_remaining: usize,
   /// Start of an L2CAP basic header split across inbound fragments.
   rx_header: [u8; L2CAP_HEADER],
   rx_header_len: usize,
}

impl ConnectionInfo {
   /// Inbound bytes still owed to the L2CAP packet in progress.
   fn rx_outstanding(&self) -> usize {
      if self.rx_header_len != 0 {
         L2CAP_HEADER - self.rx_header_len
      } else {
         self.rx_remaining
      }
   }
}

/// Descriptor tagging for one outbound ACL frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxTag {
   pub flags: u8,
   pub l2cap_cid: u16,
}

impl TxTag {
   pub const fn is_end(&self) -> bool {
      self.flags & acl_flags::L2CAP_END != 0
   }
}

#[derive(Debug)]
pub struct ConnectionTable {
   entries: Vec<ConnectionInfo>,
   tolerate_overrun: bool,
   anomalies: u64,
}

impl ConnectionTable {
   pub fn new(size: usize, tolerate_overrun: bool) -> Self {
      Self {
         entries: vec![ConnectionInfo::default(); size],
         tolerate_overrun,
         anomalies: 0,
      }
   }

   pub fn bound(&self) -> usize {
      self.entries.len()
   }

   /// Malformed fragments that were tolerated instead of failing.
   pub fn anomalies(&self) -> u64 {
      self.anomalies
   }

   pub fn get(&self, handle: u16) -> Result<&ConnectionInfo> {
      self.entries.get(handle as usize).ok_or_else(|| {
         Violation::HandleOutOfRange {
            handle,
            bound: self.entries.len(),
         }
         .into()
      })
   }

   fn entry_mut(&mut self, handle: u16) -> Result<&mut ConnectionInfo> {
      let bound = self.entries.len();
      self
         .entries
         .get_mut(handle as usize)
         .ok_or_else(|| Violation::HandleOutOfRange { handle, bound }.into())
   }

   pub fn state(&self, handle: u16) -> Result<ConnectionState> {
      Ok(self.get(handle)?.state)
   }

   /// A Connected event was delivered for `handle`.
   pub fn connect(&mut self, handle: u16) -> Result<()> {
      *self.entry_mut(handle)? = ConnectionInfo {
         state: ConnectionState::Active,
         ..Default::default()
      };
      Ok(())
   }

   /// The firmware's last ACL record for `handle` arrived.
   pub fn mark_disconnected(&mut self, handle: u16) -> Result<()> {
      let entry = self.entry_mut(handle)?;
      entry.state = ConnectionState::Disconnected;
      entry.rx_remaining = 0;
      entry.rx_header_len = 0;
      Ok(())
   }

   /// The Disconnected event for `handle` was delivered.
   pub fn reset(&mut self, handle: u16) -> Result<()> {
      *self.entry_mut(handle)? = ConnectionInfo::default();
      Ok(())
   }

   /// Works out the descriptor flags and L2CAP channel for an outbound frame.
   ///
   /// `payload` is the ACL payload, which for a start frame begins with the
   /// L2CAP basic header.
   pub fn tag_tx(&mut self, hdr: &AclHeader, payload: &[u8]) -> Result<TxTag> {
      let tolerate = self.tolerate_overrun;
      let handle = hdr.handle;
      let entry = self.entry_mut(handle)?;
      // Broadcast frames have no Connected event of their own.
      if hdr.is_broadcast() {
         entry.state = ConnectionState::Active;
      }

      let mut flags = hdr.flags;
      let mut anomaly = false;
      match hdr.boundary() {
         PacketBoundary::StartNonFlush | PacketBoundary::StartFlush => {
            let (l2cap_len, cid) = l2cap_header(payload).ok_or(Violation::MissingL2capHeader {
               length: payload.len(),
            })?;
            if entry.pending_fragment_len != 0 {
               warn!(
                  "Handle 0x{handle:04x}: new L2CAP packet with {} bytes of the previous one unsent",
                  entry.pending_fragment_len
               );
               anomaly = true;
            }
            let l2cap_len = l2cap_len as usize;
            let carried = payload.len() - L2CAP_HEADER;
            entry.l2cap_cid = cid;
            entry.pending_fragment_len = 0;
            if l2cap_len > carried {
               entry.pending_fragment_len = l2cap_len - carried;
            } else {
               if l2cap_len < carried {
                  if !tolerate {
                     return Err(
                        Violation::FragmentOverrun {
                           handle,
                           length: carried,
                           remaining: l2cap_len,
                        }
                        .into(),
                     );
                  }
                  warn!("Handle 0x{handle:04x}: frame carries {carried} bytes for a {l2cap_len} byte L2CAP packet");
                  anomaly = true;
               }
               flags |= acl_flags::L2CAP_END;
            }
         },
         PacketBoundary::Continuation => {
            let remaining = entry.pending_fragment_len;
            if remaining > payload.len() {
               entry.pending_fragment_len -= payload.len();
            } else {
               if remaining < payload.len() {
                  if !tolerate {
                     return Err(
                        Violation::FragmentOverrun {
                           handle,
                           length: payload.len(),
                           remaining,
                        }
                        .into(),
                     );
                  }
                  warn!(
                     "Handle 0x{handle:04x}: continuation of {} bytes exceeds {remaining} remaining, ending packet",
                     payload.len()
                  );
                  anomaly = true;
               }
               entry.pending_fragment_len = 0;
               flags |= acl_flags::L2CAP_END;
            }
         },
         PacketBoundary::Reserved => return Err(Violation::ReservedBoundary { handle }.into()),
      }

      let tag = TxTag {
         flags,
         l2cap_cid: entry.l2cap_cid,
      };
      if anomaly {
         self.anomalies += 1;
      }
      debug!(
         "TX handle 0x{handle:04x} cid 0x{:04x} flags 0x{:02x} ({} bytes)",
         tag.l2cap_cid,
         tag.flags,
         payload.len()
      );
      Ok(tag)
   }

   /// Checks that inbound fragments on `handle` do not interleave.
   ///
   /// The L2CAP basic header may itself be split over fragments, in which
   /// case its first bytes are held until a continuation completes it.
   pub fn check_rx(&mut self, handle: u16, boundary: PacketBoundary, payload: &[u8]) -> Result<()> {
      let entry = self.entry_mut(handle)?;
      match boundary {
         PacketBoundary::StartNonFlush | PacketBoundary::StartFlush => {
            let outstanding = entry.rx_outstanding();
            if outstanding != 0 {
               return Err(
                  Violation::FragmentInterleaved {
                     handle,
                     remaining: outstanding,
                  }
                  .into(),
               );
            }
            match l2cap_header(payload) {
               Some((l2cap_len, _)) => {
                  entry.rx_remaining = (l2cap_len as usize).saturating_sub(payload.len() - L2CAP_HEADER);
               },
               None => {
                  entry.rx_header[..payload.len()].copy_from_slice(payload);
                  entry.rx_header_len = payload.len();
                  debug!("RX handle 0x{handle:04x}: L2CAP header split after {} bytes", payload.len());
               },
            }
         },
         PacketBoundary::Continuation if entry.rx_header_len != 0 => {
            let have = entry.rx_header_len;
            let take = (L2CAP_HEADER - have).min(payload.len());
            entry.rx_header[have..have + take].copy_from_slice(&payload[..take]);
            entry.rx_header_len += take;
            if entry.rx_header_len < L2CAP_HEADER {
               return Ok(());
            }
            entry.rx_header_len = 0;
            let l2cap_len = u16::from_le_bytes([entry.rx_header[0], entry.rx_header[1]]) as usize;
            let body = payload.len() - take;
            if body > l2cap_len {
               return Err(
                  Violation::UnexpectedContinuation {
                     handle,
                     length: payload.len(),
                     remaining: l2cap_len + take,
                  }
                  .into(),
               );
            }
            entry.rx_remaining = l2cap_len - body;
         },
         PacketBoundary::Continuation => {
            if entry.rx_remaining == 0 || payload.len() > entry.rx_remaining {
               return Err(
                  Violation::UnexpectedContinuation {
                     handle,
                     length: payload.len(),
                     remaining: entry.rx_remaining,
                  }
                  .into(),
               );
            }
            entry.rx_remaining -= payload.len();
         },
         PacketBoundary::Reserved => return Err(Violation::ReservedBoundary { handle }.into()),
      }
      Ok(())
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::error::TransportError;

   fn header(handle: u16, flags: u8, len: usize) -> AclHeader {
      AclHeader {
         handle,
         flags,
         length: len as u16,
      }
   }

   /// L2CAP basic header followed by `body_len` filler bytes.
   fn l2cap_frame(total_len: u16, cid: u16, body_len: usize) -> Vec<u8> {
      let mut v = Vec::new();
      v.extend_from_slice(&total_len.to_le_bytes());
      v.extend_from_slice(&cid.to_le_bytes());
      v.resize(L2CAP_HEADER + body_len, 0x5a);
      v
   }

   #[test]
   fn test_single_frame_is_end() -> Result<()> {
      let mut table = ConnectionTable::new(0x1000, true);
      let payload = l2cap_frame(10, 0x0041, 10);
      let tag = table.tag_tx(&header(1, acl_flags::PB_START_FLUSH, payload.len()), &payload)?;
      assert!(tag.is_end());
      assert_eq!(tag.l2cap_cid, 0x0041);
      assert_eq!(tag.flags & acl_flags::PB_MASK, acl_flags::PB_START_FLUSH);
      assert_eq!(table.get(1)?.pending_fragment_len, 0);
      Ok(())
   }

   #[test]
   fn test_only_last_fragment_is_end() -> Result<()> {
      for split in [vec![96], vec![10, 86], vec![1, 1, 1, 93], vec![40, 40, 16], vec![30; 3]] {
         let l2cap_len = split.iter().sum::<usize>() as u16;
         let mut table = ConnectionTable::new(16, true);
         for (i, &len) in split.iter().enumerate() {
            let (flags, payload) = if i == 0 {
               (acl_flags::PB_START_NONFLUSH, l2cap_frame(l2cap_len, 0x0040, len))
            } else {
               (acl_flags::PB_CONT, vec![0u8; len])
            };
            let tag = table.tag_tx(&header(3, flags, payload.len()), &payload)?;
            let last = i == split.len() - 1;
            assert_eq!(tag.is_end(), last, "split {split:?} fragment {i}");
            assert_eq!(tag.l2cap_cid, 0x0040);
            assert_eq!(table.get(3)?.pending_fragment_len == 0, last);
         }
         assert_eq!(table.anomalies(), 0);
      }
      Ok(())
   }

   #[test]
   fn test_overrun_tolerated_and_counted() -> Result<()> {
      let mut table = ConnectionTable::new(16, true);
      let payload = l2cap_frame(20, 0x0040, 8);
      assert!(!table.tag_tx(&header(2, acl_flags::PB_START_FLUSH, 12), &payload)?.is_end());
      assert_eq!(table.get(2)?.pending_fragment_len, 12);

      let tag = table.tag_tx(&header(2, acl_flags::PB_CONT, 15), &[0u8; 15])?;
      assert!(tag.is_end());
      assert_eq!(table.get(2)?.pending_fragment_len, 0);
      assert_eq!(table.anomalies(), 1);
      Ok(())
   }

   #[test]
   fn test_overrun_rejected_when_strict() {
      let mut table = ConnectionTable::new(16, false);
      let payload = l2cap_frame(4, 0x0040, 8);
      let err = table
         .tag_tx(&header(2, acl_flags::PB_START_FLUSH, payload.len()), &payload)
         .unwrap_err();
      assert!(matches!(
         err,
         TransportError::ProtocolViolation(Violation::FragmentOverrun { handle: 2, .. })
      ));
   }

   #[test]
   fn test_reserved_boundary_and_short_start() {
      let mut table = ConnectionTable::new(16, true);
      assert!(table.tag_tx(&header(1, acl_flags::PB_RESERVED, 4), &[0; 4]).unwrap_err().is_fatal());
      assert!(table.tag_tx(&header(1, acl_flags::PB_START_FLUSH, 2), &[0; 2]).unwrap_err().is_fatal());
   }

   #[test]
   fn test_broadcast_marks_active() -> Result<()> {
      let mut table = ConnectionTable::new(16, true);
      let payload = l2cap_frame(0, 0x0002, 0);
      table.tag_tx(&header(5, acl_flags::PB_START_FLUSH | acl_flags::BC_ACTIVE, 4), &payload)?;
      assert_eq!(table.state(5)?, ConnectionState::Active);
      Ok(())
   }

   #[test]
   fn test_handle_beyond_table() {
      let mut table = ConnectionTable::new(16, true);
      assert!(matches!(
         table.connect(16),
         Err(TransportError::ProtocolViolation(Violation::HandleOutOfRange { handle: 16, bound: 16 }))
      ));
   }

   #[test]
   fn test_lifecycle() -> Result<()> {
      let mut table = ConnectionTable::new(16, true);
      assert_eq!(table.state(7)?, ConnectionState::None);
      table.connect(7)?;
      assert_eq!(table.state(7)?, ConnectionState::Active);
      table.mark_disconnected(7)?;
      assert_eq!(table.state(7)?, ConnectionState::Disconnected);
      table.reset(7)?;
      assert_eq!(table.state(7)?, ConnectionState::None);
      Ok(())
   }

   #[test]
   fn test_rx_interleaving_detected() -> Result<()> {
      let mut table = ConnectionTable::new(16, true);
      table.check_rx(1, PacketBoundary::StartFlush, &l2cap_frame(20, 0x40, 10))?;
      table.check_rx(1, PacketBoundary::Continuation, &[0; 4])?;
      // other handles are independent
      table.check_rx(2, PacketBoundary::StartFlush, &l2cap_frame(2, 0x40, 2))?;

      let err = table
         .check_rx(1, PacketBoundary::StartFlush, &l2cap_frame(2, 0x40, 2))
         .unwrap_err();
      assert!(matches!(
         err,
         TransportError::ProtocolViolation(Violation::FragmentInterleaved { handle: 1, remaining: 6 })
      ));
      Ok(())
   }

   #[test]
   fn test_rx_continuation_without_start() {
      let mut table = ConnectionTable::new(16, true);
      assert!(table.check_rx(1, PacketBoundary::Continuation, &[0; 3]).is_err());
   }

   #[test]
   fn test_rx_header_split_across_fragments() -> Result<()> {
      let mut table = ConnectionTable::new(16, true);
      table.check_rx(1, PacketBoundary::StartFlush, &[0x03, 0x00])?;
      let err = table
         .check_rx(1, PacketBoundary::StartFlush, &l2cap_frame(0, 0x40, 0))
         .unwrap_err();
      assert!(matches!(
         err,
         TransportError::ProtocolViolation(Violation::FragmentInterleaved { handle: 1, remaining: 2 })
      ));

      table.check_rx(1, PacketBoundary::Continuation, &[0x40, 0x00, 0x01, 0x02, 0x03])?;
      assert!(table.check_rx(1, PacketBoundary::StartFlush, &l2cap_frame(1, 0x40, 1)).is_ok());

      // one byte at a time, body in a later fragment
      table.check_rx(2, PacketBoundary::StartFlush, &[0x05])?;
      table.check_rx(2, PacketBoundary::Continuation, &[0x00, 0x41])?;
      table.check_rx(2, PacketBoundary::Continuation, &[0x00])?;
      table.check_rx(2, PacketBoundary::Continuation, &[0; 5])?;
      assert!(table.check_rx(2, PacketBoundary::Continuation, &[0]).is_err());
      Ok(())
   }

   #[test]
   fn test_rx_split_header_overrun() {
      let mut table = ConnectionTable::new(16, true);
      table.check_rx(1, PacketBoundary::StartFlush, &[0x01, 0x00, 0x40]).unwrap();
      assert!(matches!(
         table.check_rx(1, PacketBoundary::Continuation, &[0x00, 1, 2]),
         Err(TransportError::ProtocolViolation(Violation::UnexpectedContinuation { handle: 1, .. }))
      ));
   }
}

//! H4 framing in both directions.
//!
//! The write path feeds arbitrary byte chunks into a [`FrameAssembler`]
//! until one complete packet is present. The read path turns ring
//! descriptors into H4 records that are then copied out, possibly across
//! several reads.

use log::trace;
use smallvec::SmallVec;

use crate::{
   error::{Result, Violation},
   hci::protocol::{
      EV_HARDWARE_ERROR, EV_LE_META, EV_NUMBER_OF_COMPLETED_PACKETS, EVENT_HEADER, H4_ACL_HEADER,
      HANDLE_MASK, LE_CONNECTION_IQ_REPORT, LE_CONNECTIONLESS_IQ_REPORT, PacketType,
   },
   mailbox::descriptor::{ACL_PACKET_SIZE, AclRxTd, EventTd, IqReportTd},
};

/// One H4 record staged for the reader.
pub type Record = SmallVec<[u8; 64]>;

/// Distinct handles one credits record can describe.
pub const MAX_CREDIT_HANDLES: usize = 36;

/// Hardware error event with code 0, delivered once after a fatal error.
pub const HARDWARE_ERROR_RECORD: [u8; 4] = [PacketType::Event as u8, EV_HARDWARE_ERROR, 0x01, 0x00];

/// Carry-over buffer assembling one H4 packet from write chunks.
#[derive(Debug)]
pub struct FrameAssembler {
   buf: Vec<u8>,
}

impl Default for FrameAssembler {
   fn default() -> Self {
      Self {
         buf: Vec::with_capacity(H4_ACL_HEADER + ACL_PACKET_SIZE),
      }
   }
}

impl FrameAssembler {
   /// Bytes buffered towards the current packet.
   pub fn pending(&self) -> usize {
      self.buf.len()
   }

   /// The buffered packet, H4 indicator included.
   pub fn frame(&self) -> &[u8] {
      &self.buf
   }

   pub fn packet_type(&self) -> Option<PacketType> {
      self.buf.first().copied().and_then(PacketType::from_repr)
   }

   /// Target length for the buffer, and whether it is the full packet
   /// length rather than just the header.
   fn wanted(&self) -> Result<(usize, bool)> {
      let Some(&indicator) = self.buf.first() else {
         return Ok((1, false));
      };
      let ty = match PacketType::from_repr(indicator) {
         Some(ty @ (PacketType::Command | PacketType::Acl)) => ty,
         _ => {
            return Err(Violation::UnknownPacketType {
               packet_type: indicator,
            }
            .into());
         },
      };
      if self.buf.len() < ty.header_len() {
         return Ok((ty.header_len(), false));
      }
      let total = ty.packet_len(&self.buf);
      if ty == PacketType::Acl && total - H4_ACL_HEADER > ACL_PACKET_SIZE {
         return Err(
            Violation::AclTooLong {
               length: total - H4_ACL_HEADER,
               max: ACL_PACKET_SIZE,
            }
            .into(),
         );
      }
      Ok((total, true))
   }

   /// Takes bytes from `input` up to the end of the current packet.
   ///
   /// Returns how many bytes were taken and whether a full packet is now
   /// buffered. Bytes past the end of the packet are left in `input`.
   pub fn feed(&mut self, input: &[u8]) -> Result<(usize, bool)> {
      let mut taken = 0;
      loop {
         let (target, is_total) = self.wanted()?;
         if is_total && self.buf.len() == target {
            return Ok((taken, true));
         }
         let take = (target - self.buf.len()).min(input.len() - taken);
         if take == 0 {
            return Ok((taken, false));
         }
         self.buf.extend_from_slice(&input[taken..taken + take]);
         taken += take;
      }
   }

   /// Gives back the last `n` fed bytes, used when a packet could not be
   /// dispatched and the caller will offer the bytes again.
   pub fn unfeed(&mut self, n: usize) {
      let keep = self.buf.len().saturating_sub(n);
      self.buf.truncate(keep);
   }

   pub fn clear(&mut self) {
      self.buf.clear();
   }
}

/// Renders an event descriptor as an H4 event.
pub fn event_record(td: &EventTd) -> Result<Record> {
   let declared = td.data.get(1).map_or(0, |&len| len as usize + EVENT_HEADER);
   if td.data.len() < EVENT_HEADER || declared != td.data.len() {
      return Err(
         Violation::EventLengthMismatch {
            length: td.data.len(),
            declared,
         }
         .into(),
      );
   }
   let mut record = Record::with_capacity(1 + td.data.len());
   record.push(PacketType::Event as u8);
   record.extend_from_slice(&td.data);
   Ok(record)
}

/// Renders an ACL RX descriptor as an H4 ACL packet.
pub fn acl_record(td: &AclRxTd) -> Record {
   let len = td.data.len() as u16;
   let handle = td.connection_handle;
   let mut record = Record::with_capacity(H4_ACL_HEADER + td.data.len());
   record.extend_from_slice(&[
      PacketType::Acl as u8,
      (handle & 0xFF) as u8,
      ((handle >> 8) & 0x0F) as u8 | (td.packet_boundary & 0x03) << 4 | (td.broadcast_flag & 0x03) << 6,
   ]);
   record.extend_from_slice(&len.to_le_bytes());
   record.extend_from_slice(&td.data);
   record
}

/// Credits returned by the firmware, coalesced per connection handle.
#[derive(Debug, Default, Clone)]
pub struct CreditReport {
   entries: heapless::Vec<(u16, u16), MAX_CREDIT_HANDLES>,
}

impl CreditReport {
   /// Counts one returned buffer for `handle`. Returns false when the
   /// report already describes the maximum number of handles.
   pub fn add(&mut self, handle: u16) -> bool {
      let handle = handle & HANDLE_MASK;
      if let Some(entry) = self.entries.iter_mut().find(|(h, _)| *h == handle) {
         entry.1 = entry.1.saturating_add(1);
         return true;
      }
      self.entries.push((handle, 1)).is_ok()
   }

   /// Whether one more credit for `handle` fits.
   pub fn can_add(&self, handle: u16) -> bool {
      let handle = handle & HANDLE_MASK;
      !self.entries.is_full() || self.entries.iter().any(|(h, _)| *h == handle)
   }

   pub fn is_empty(&self) -> bool {
      self.entries.is_empty()
   }

   pub fn entries(&self) -> &[(u16, u16)] {
      &self.entries
   }

   pub fn total(&self) -> usize {
      self.entries.iter().map(|&(_, n)| n as usize).sum()
   }

   /// Number Of Completed Packets event covering every entry.
   pub fn to_record(&self) -> Record {
      let n = self.entries.len();
      let mut record = Record::with_capacity(4 + 4 * n);
      record.extend_from_slice(&[
         PacketType::Event as u8,
         EV_NUMBER_OF_COMPLETED_PACKETS,
         (1 + 4 * n) as u8,
         n as u8,
      ]);
      for &(handle, count) in &self.entries {
         record.extend_from_slice(&handle.to_le_bytes());
         record.extend_from_slice(&count.to_le_bytes());
      }
      trace!("Credits record: {}", hex::encode(&record));
      record
   }
}

/// Renders an IQ report descriptor as an LE meta event.
///
/// I and Q samples arrive interleaved and are emitted as two arrays.
pub fn iq_report_record(td: &IqReportTd) -> Record {
   let samples = td.sample_count();
   let mut record = Record::new();
   record.extend_from_slice(&[PacketType::Event as u8, EV_LE_META, 0, td.subevent_code]);
   match td.subevent_code {
      LE_CONNECTIONLESS_IQ_REPORT => record.extend_from_slice(&td.sync_handle.to_le_bytes()),
      LE_CONNECTION_IQ_REPORT => {
         record.extend_from_slice(&td.connection_handle.to_le_bytes());
         record.push(td.rx_phy);
      },
      _ => {},
   }
   record.push(td.channel_index);
   record.extend_from_slice(&td.rssi.to_le_bytes());
   record.extend_from_slice(&[td.rssi_antenna_id, td.cte_type, td.slot_durations, td.packet_status]);
   record.extend_from_slice(&td.event_count.to_le_bytes());
   record.push(samples as u8);
   record.extend(td.data.chunks_exact(2).map(|iq| iq[0]));
   record.extend(td.data.chunks_exact(2).map(|iq| iq[1]));
   record[2] = (record.len() - 1 - EVENT_HEADER) as u8;
   record
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{error::TransportError, mailbox::descriptor::EventKind};

   #[test]
   fn test_assembler_split_command() -> Result<()> {
      let mut asm = FrameAssembler::default();
      let packet = [0x01, 0x03, 0x0c, 0x03, 0xaa, 0xbb, 0xcc];

      assert_eq!(asm.feed(&packet[..4])?, (4, false));
      assert_eq!(asm.feed(&packet[4..])?, (3, true));
      assert_eq!(asm.frame(), &packet);
      assert_eq!(asm.packet_type(), Some(PacketType::Command));
      Ok(())
   }

   #[test]
   fn test_assembler_stops_at_packet_end() -> Result<()> {
      let mut asm = FrameAssembler::default();
      // Two zero-parameter commands back to back.
      let input = [0x01, 0x03, 0x0c, 0x00, 0x01, 0x01, 0x10, 0x00];
      assert_eq!(asm.feed(&input)?, (4, true));
      asm.clear();
      assert_eq!(asm.feed(&input[4..])?, (4, true));
      assert_eq!(asm.frame(), &input[4..]);
      Ok(())
   }

   #[test]
   fn test_assembler_byte_at_a_time_acl() -> Result<()> {
      let mut asm = FrameAssembler::default();
      let packet = [0x02, 0x01, 0x20, 0x05, 0x00, 0x01, 0x00, 0x40, 0x00, 0xff];
      for (i, b) in packet.iter().enumerate() {
         let (taken, done) = asm.feed(std::slice::from_ref(b))?;
         assert_eq!(taken, 1);
         assert_eq!(done, i == packet.len() - 1);
      }
      asm.unfeed(3);
      assert_eq!(asm.pending(), packet.len() - 3);
      Ok(())
   }

   #[test]
   fn test_assembler_rejects_bad_input() {
      let mut asm = FrameAssembler::default();
      let err = asm.feed(&[0x04, 0x0e, 0x00]).unwrap_err();
      assert!(matches!(
         err,
         TransportError::ProtocolViolation(Violation::UnknownPacketType { packet_type: 0x04 })
      ));

      let mut asm = FrameAssembler::default();
      // 1022 byte payload
      let err = asm.feed(&[0x02, 0x01, 0x00, 0xfe, 0x03]).unwrap_err();
      assert!(matches!(
         err,
         TransportError::ProtocolViolation(Violation::AclTooLong { length: 1022, .. })
      ));
   }

   #[test]
   fn test_event_record_validates_length() {
      let mut td = EventTd {
         connection_handle: 0,
         kind: EventKind::None,
         data: heapless::Vec::from_slice(&[0x0e, 0x04, 0x01, 0x03, 0x0c, 0x00]).unwrap(),
      };
      let record = event_record(&td).unwrap();
      assert_eq!(record.as_slice(), &[0x04, 0x0e, 0x04, 0x01, 0x03, 0x0c, 0x00]);

      td.data.pop();
      assert!(event_record(&td).unwrap_err().is_fatal());
   }

   #[test]
   fn test_acl_record_header() {
      let td = AclRxTd {
         connection_handle: 0x0a42,
         broadcast_flag: 0,
         packet_boundary: 2,
         disconnected: false,
         data: heapless::Vec::from_slice(&[1, 2, 3]).unwrap(),
      };
      assert_eq!(
         acl_record(&td).as_slice(),
         &[0x02, 0x42, 0x2a, 0x03, 0x00, 1, 2, 3]
      );
   }

   #[test]
   fn test_credit_report_coalesces() {
      let mut report = CreditReport::default();
      assert!(report.is_empty());
      report.add(0x0001);
      report.add(0x0002);
      report.add(0x1001);
      assert_eq!(report.entries(), &[(0x0001, 2), (0x0002, 1)]);
      assert_eq!(report.total(), 3);
      assert_eq!(
         report.to_record().as_slice(),
         &[0x04, 0x13, 0x09, 0x02, 0x01, 0x00, 0x02, 0x00, 0x02, 0x00, 0x01, 0x00]
      );
   }

   #[test]
   fn test_credit_report_capacity() {
      let mut report = CreditReport::default();
      for handle in 0..MAX_CREDIT_HANDLES as u16 {
         assert!(report.add(handle));
      }
      assert!(!report.can_add(0x0100));
      assert!(!report.add(0x0100));
      assert!(report.can_add(0x0003));
   }

   #[test]
   fn test_iq_report_record_layout() {
      let td = IqReportTd {
         subevent_code: LE_CONNECTION_IQ_REPORT,
         packet_status: 0,
         connection_handle: 0x0040,
         sync_handle: 0,
         rx_phy: 1,
         channel_index: 7,
         rssi: -60,
         rssi_antenna_id: 2,
         cte_type: 0,
         slot_durations: 1,
         event_count: 0x0102,
         data: heapless::Vec::from_slice(&[0x11, 0x21, 0x12, 0x22]).unwrap(),
      };
      let record = iq_report_record(&td);
      let rssi = (-60i16).to_le_bytes();
      assert_eq!(
         record.as_slice(),
         &[
            0x04, 0x3e, 18, 0x16, 0x40, 0x00, 1, 7, rssi[0], rssi[1], 2, 0, 1, 0, 0x02, 0x01, 2,
            0x11, 0x12, 0x21, 0x22
         ]
      );
   }
}

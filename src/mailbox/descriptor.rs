//! Transfer descriptor layouts, one per ring.
//!
//! Payload areas are bounded vectors sized like the firmware's fixed
//! arrays, so a descriptor can never carry more than its slot holds.

use heapless::Vec as BoundedVec;

/// Payload bytes of a command or event descriptor.
pub const CMD_EVT_BUFFER_SIZE: usize = 258;
/// Size of one ACL buffer.
pub const ACL_BUFFER_SIZE: usize = 1024;
/// Largest ACL payload the host may send in one frame.
pub const ACL_PACKET_SIZE: usize = ACL_BUFFER_SIZE - 3;
/// IQ sample storage in an IQ report descriptor.
pub const IQ_REPORT_BUFFER_SIZE: usize = 164;

/// Packet-boundary / end flags carried in [`AclTxTd::flags`].
pub mod acl_flags {
   /// This frame completes a fragmented L2CAP packet.
   pub const L2CAP_END: u8 = 0x01;
   pub const PB_START_NONFLUSH: u8 = 0x00;
   pub const PB_CONT: u8 = 0x10;
   pub const PB_START_FLUSH: u8 = 0x20;
   pub const PB_RESERVED: u8 = 0x30;
   pub const PB_MASK: u8 = 0x30;
   pub const BC_ACTIVE: u8 = 0x40;
   pub const BC_ALL: u8 = 0x80;
   pub const BC_MASK: u8 = 0xC0;
}

/// What an event descriptor tells the host besides its HCI bytes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::FromRepr, strum::Display)]
pub enum EventKind {
   #[default]
   None = 0,
   Connected = 1,
   Disconnected = 2,
   IqReportEnabled = 3,
   IqReportDisabled = 4,
}

/// Host to firmware HCI command, without the H4 indicator.
#[derive(Debug, Clone, Default)]
pub struct CommandTd {
   pub data: BoundedVec<u8, CMD_EVT_BUFFER_SIZE>,
}

/// Firmware to host HCI event, starting at the event code.
#[derive(Debug, Clone, Default)]
pub struct EventTd {
   pub connection_handle: u16,
   pub kind: EventKind,
   pub data: BoundedVec<u8, CMD_EVT_BUFFER_SIZE>,
}

/// Firmware to host ACL data.
#[derive(Debug, Clone, Default)]
pub struct AclRxTd {
   pub connection_handle: u16,
   pub broadcast_flag: u8,
   /// Two-bit HCI packet boundary value (0 start non-flushable, 1 continuation, 2 start flushable).
   pub packet_boundary: u8,
   /// Last record for a handle after its disconnection; carries no data.
   pub disconnected: bool,
   pub data: BoundedVec<u8, ACL_BUFFER_SIZE>,
}

/// Host to firmware ACL data.
#[derive(Debug, Clone, Default)]
pub struct AclTxTd {
   pub buffer_index: u8,
   pub flags: u8,
   pub connection_handle: u16,
   pub l2cap_cid: u16,
   pub data: BoundedVec<u8, ACL_PACKET_SIZE>,
}

impl AclTxTd {
   pub fn is_l2cap_end(&self) -> bool {
      self.flags & acl_flags::L2CAP_END != 0
   }

   pub fn packet_boundary(&self) -> u8 {
      self.flags & acl_flags::PB_MASK
   }
}

/// Firmware returning an ACL transmit buffer (one credit).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AclFreeTd {
   pub buffer_index: u8,
   pub connection_handle: u16,
}

/// Raw direction-finding IQ samples from the controller.
#[derive(Debug, Clone, Default)]
pub struct IqReportTd {
   pub subevent_code: u8,
   pub packet_status: u8,
   pub connection_handle: u16,
   pub sync_handle: u16,
   pub rx_phy: u8,
   pub channel_index: u8,
   pub rssi: i16,
   pub rssi_antenna_id: u8,
   pub cte_type: u8,
   pub slot_durations: u8,
   pub event_count: u16,
   /// Interleaved I/Q pairs, one pair per sample.
   pub data: BoundedVec<u8, IQ_REPORT_BUFFER_SIZE>,
}

impl IqReportTd {
   pub fn sample_count(&self) -> usize {
      self.data.len() / 2
   }
}

/// Host to firmware AVDTP stream notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AvdtpTd {
   pub flags: u32,
   pub l2cap_cid: u16,
   pub connection_handle: u16,
}

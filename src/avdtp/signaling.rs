//! L2CAP signaling and AVDTP message parsing.
//!
//! All parsers take a frame starting at the L2CAP basic header (length,
//! channel id) and return `None` for anything too short to inspect.

/// Fixed channel carrying L2CAP signaling commands.
pub const L2CAP_SIGNALING_CID: u16 = 0x0001;
/// Protocol/service multiplexer reserved for AVDTP.
pub const AVDTP_PSM: u16 = 0x0019;

/// Shortest signaling frame worth inspecting (connect and disconnect requests).
pub const MIN_SIGNALING_LEN: usize = 12;
/// Connect responses additionally carry result and status.
pub const MIN_CONNECT_RSP_LEN: usize = 16;
/// Shortest AVDTP frame: basic header, message header and signal id.
pub const MIN_AVDTP_LEN: usize = 6;

pub const CONNECT_RESULT_SUCCESS: u16 = 0x0000;
/// Results from this value upwards are refusals; 1 means pending.
pub const CONNECT_RESULT_REFUSED: u16 = 0x0002;

const SEID_INFO_OFFSET: usize = 6;
const SEID_INFO_SIZE: usize = 2;

#[inline]
fn le16(data: &[u8], at: usize) -> Option<u16> {
   data.get(at..at + 2).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

/// Channel id from the L2CAP basic header.
pub fn channel_id(data: &[u8]) -> Option<u16> {
   le16(data, 2)
}

/// L2CAP signaling command codes the detector cares about.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr)]
pub enum SignalingCode {
   ConnectReq = 0x02,
   ConnectRsp = 0x03,
   DisconnectReq = 0x06,
}

/// An L2CAP signaling command relevant to channel tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2capSignal {
   ConnectReq {
      psm: u16,
      source_cid: u16,
   },
   ConnectRsp {
      dest_cid: u16,
      source_cid: u16,
      result: u16,
   },
   DisconnectReq {
      dest_cid: u16,
      source_cid: u16,
   },
}

impl L2capSignal {
   /// Parses the first command of a signaling channel frame.
   pub fn parse(data: &[u8]) -> Option<Self> {
      if data.len() < MIN_SIGNALING_LEN {
         return None;
      }
      match SignalingCode::from_repr(data[4])? {
         SignalingCode::ConnectReq => Some(Self::ConnectReq {
            psm: le16(data, 8)?,
            source_cid: le16(data, 10)?,
         }),
         SignalingCode::ConnectRsp if data.len() >= MIN_CONNECT_RSP_LEN => Some(Self::ConnectRsp {
            dest_cid: le16(data, 8)?,
            source_cid: le16(data, 10)?,
            result: le16(data, 12)?,
         }),
         SignalingCode::ConnectRsp => None,
         SignalingCode::DisconnectReq => Some(Self::DisconnectReq {
            dest_cid: le16(data, 8)?,
            source_cid: le16(data, 10)?,
         }),
      }
   }
}

/// AVDTP message type (low two bits of the first header byte).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr)]
pub enum MessageType {
   Command = 0x00,
   GeneralReject = 0x01,
   ResponseAccept = 0x02,
   ResponseReject = 0x03,
}

/// AVDTP signal identifiers.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr)]
pub enum SignalId {
   Discover = 0x01,
   GetCapabilities = 0x02,
   SetConfiguration = 0x03,
   GetConfiguration = 0x04,
   Reconfigure = 0x05,
   Open = 0x06,
   Start = 0x07,
   Close = 0x08,
   Suspend = 0x09,
   Abort = 0x0A,
   SecurityControl = 0x0B,
   GetAllCapabilities = 0x0C,
   DelayReport = 0x0D,
}

/// Stream end-point type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tsep {
   #[default]
   Source,
   Sink,
}

/// Header of a single-packet AVDTP signaling message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvdtpHeader {
   pub message_type: MessageType,
   pub signal_id: Option<SignalId>,
}

impl AvdtpHeader {
   pub fn parse(data: &[u8]) -> Option<Self> {
      if data.len() < MIN_AVDTP_LEN {
         return None;
      }
      Some(Self {
         message_type: MessageType::from_repr(data[4] & 0x03)?,
         signal_id: SignalId::from_repr(data[5] & 0x1F),
      })
   }

   pub fn is(&self, message_type: MessageType, signal_id: SignalId) -> bool {
      self.message_type == message_type && self.signal_id == Some(signal_id)
   }
}

/// One entry of a DISCOVER response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeidInfo {
   pub seid: u8,
   pub tsep: Tsep,
}

/// Endpoint entries of a DISCOVER response.
pub fn discover_entries(data: &[u8]) -> impl Iterator<Item = SeidInfo> + '_ {
   data
      .get(SEID_INFO_OFFSET..)
      .unwrap_or_default()
      .chunks_exact(SEID_INFO_SIZE)
      .map(|info| SeidInfo {
         seid: (info[0] >> 2) & 0x3F,
         tsep: if (info[1] >> 3) & 0x01 == 1 {
            Tsep::Sink
         } else {
            Tsep::Source
         },
      })
}

/// Acceptor SEID of a SET_CONFIGURATION command.
pub fn set_configuration_acp_seid(data: &[u8]) -> Option<u8> {
   data.get(SEID_INFO_OFFSET).map(|b| (b >> 2) & 0x3F)
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_parse_connect_req() {
      // len 8, cid 1, code 2, id 1, cmd len 4, psm 0x19, scid 0x0040
      let frame = [8, 0, 1, 0, 0x02, 0x01, 4, 0, 0x19, 0x00, 0x40, 0x00];
      assert_eq!(channel_id(&frame), Some(L2CAP_SIGNALING_CID));
      assert_eq!(
         L2capSignal::parse(&frame),
         Some(L2capSignal::ConnectReq {
            psm: AVDTP_PSM,
            source_cid: 0x0040
         })
      );
      assert_eq!(L2capSignal::parse(&frame[..11]), None);
   }

   #[test]
   fn test_connect_rsp_needs_result() {
      let frame = [
         12, 0, 1, 0, 0x03, 0x01, 8, 0, 0x41, 0x00, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00,
      ];
      assert_eq!(
         L2capSignal::parse(&frame),
         Some(L2capSignal::ConnectRsp {
            dest_cid: 0x0041,
            source_cid: 0x0040,
            result: CONNECT_RESULT_SUCCESS
         })
      );
      assert_eq!(L2capSignal::parse(&frame[..14]), None);
   }

   #[test]
   fn test_avdtp_header() {
      let frame = [2, 0, 0x41, 0x00, 0x12, 0x07];
      let hdr = AvdtpHeader::parse(&frame).unwrap();
      assert!(hdr.is(MessageType::ResponseAccept, SignalId::Start));
      assert!(AvdtpHeader::parse(&frame[..5]).is_none());
   }

   #[test]
   fn test_discover_entries() {
      // seid 1 source, seid 2 sink, trailing odd byte ignored
      let frame = [6, 0, 0x41, 0x00, 0x02, 0x01, 0x04, 0x00, 0x08, 0x08, 0xff];
      let entries: Vec<_> = discover_entries(&frame).collect();
      assert_eq!(
         entries,
         vec![
            SeidInfo {
               seid: 1,
               tsep: Tsep::Source
            },
            SeidInfo {
               seid: 2,
               tsep: Tsep::Sink
            },
         ]
      );
      assert_eq!(set_configuration_acp_seid(&frame), Some(1));
   }
}

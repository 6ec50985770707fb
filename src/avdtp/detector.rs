//! AVDTP stream detection.
//!
//! The detector watches L2CAP traffic in both directions. The first AVDTP
//! channel opened on an ACL link is taken as the signaling channel, the next
//! one as the media stream. Once signaling is known, AVDTP commands on it
//! reveal when the stream opens, starts and stops, and whether the local side
//! is the sink. Each such change becomes an [`AvdtpNotification`] for the
//! firmware, which uses it to prioritise the media channel.

use std::collections::HashMap;

use heapless::Vec as BoundedVec;
use log::{debug, info};
use parking_lot::Mutex;

use crate::{
   avdtp::signaling::{
      AVDTP_PSM, AvdtpHeader, CONNECT_RESULT_REFUSED, CONNECT_RESULT_SUCCESS, L2CAP_SIGNALING_CID,
      L2capSignal, MIN_AVDTP_LEN, MessageType, SignalId, Tsep, channel_id, discover_entries,
      set_configuration_acp_seid,
   },
   mailbox::descriptor::AvdtpTd,
};

/// Notification flag: the local side is the sink.
pub const FLAG_SINK: u32 = 0x01;
/// Notification flag: the stream was just opened.
pub const FLAG_OPEN: u32 = 0x02;

const LEGACY_SIGNAL_FLAG: u32 = 0x8000_0000;
const LEGACY_SINK_FLAG: u32 = 0x4000_0000;

/// SEIDs are six bits wide.
const MAX_SEIDS: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChannelState {
   #[default]
   Idle,
   Pending,
   Complete,
}

/// One L2CAP channel as seen from the local side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct L2capChannel {
   pub state: ChannelState,
   /// Local channel id.
   pub src_cid: u16,
   /// Remote channel id.
   pub dst_cid: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
   Incoming,
   Outgoing,
}

/// Channels being negotiated, per direction.
#[derive(Debug, Clone, Default)]
struct Ongoing {
   incoming_signal: L2capChannel,
   outgoing_signal: L2capChannel,
   incoming_stream: L2capChannel,
   outgoing_stream: L2capChannel,
}

impl Ongoing {
   fn reset_signal(&mut self) {
      self.incoming_signal = L2capChannel::default();
      self.outgoing_signal = L2capChannel::default();
   }

   fn reset_stream(&mut self) {
      self.incoming_stream = L2capChannel::default();
      self.outgoing_stream = L2capChannel::default();
   }
}

/// Sink detection from DISCOVER and SET_CONFIGURATION exchanges.
#[derive(Debug, Clone, Default)]
struct TsepDetect {
   tsep: Tsep,
   local_sinks: BoundedVec<u8, MAX_SEIDS>,
   remote_sinks: BoundedVec<u8, MAX_SEIDS>,
   local_candidate: u8,
   remote_candidate: u8,
}

/// Stream state changes worth telling the firmware about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamActivity {
   Active,
   Open,
   Inactive,
}

/// AVDTP state for one ACL link.
#[derive(Debug, Clone)]
pub struct AvdtpConnection {
   pub connection_handle: u16,
   pub signal: L2capChannel,
   pub stream: L2capChannel,
   ongoing: Ongoing,
   tsep_detect: TsepDetect,
}

impl AvdtpConnection {
   fn new(connection_handle: u16) -> Self {
      Self {
         connection_handle,
         signal: L2capChannel::default(),
         stream: L2capChannel::default(),
         ongoing: Ongoing::default(),
         tsep_detect: TsepDetect::default(),
      }
   }

   /// Role of the local side on the stream.
   pub fn tsep(&self) -> Tsep {
      self.tsep_detect.tsep
   }

   /// The channel a connect request or response in `direction` refers to:
   /// the stream once signaling is established, signaling before that.
   fn ongoing_slot(&mut self, direction: Direction) -> &mut L2capChannel {
      let stream = self.signal.state == ChannelState::Complete;
      match (stream, direction) {
         (true, Direction::Outgoing) => &mut self.ongoing.outgoing_stream,
         (true, Direction::Incoming) => &mut self.ongoing.incoming_stream,
         (false, Direction::Outgoing) => &mut self.ongoing.outgoing_signal,
         (false, Direction::Incoming) => &mut self.ongoing.incoming_signal,
      }
   }

   fn connect_req(&mut self, source_cid: u16, is_tx: bool) {
      let handle = self.connection_handle;
      let direction = if is_tx {
         Direction::Outgoing
      } else {
         Direction::Incoming
      };
      let slot = self.ongoing_slot(direction);
      if slot.state != ChannelState::Idle {
         return;
      }
      if is_tx {
         slot.src_cid = source_cid;
      } else {
         slot.dst_cid = source_cid;
      }
      slot.state = ChannelState::Pending;
      debug!(
         "AVDTP connect request on 0x{handle:04x}: src 0x{:04x} dst 0x{:04x} (tx={is_tx})",
         slot.src_cid, slot.dst_cid
      );
   }

   fn connect_rsp(&mut self, dest_cid: u16, source_cid: u16, result: u16, is_tx: bool) {
      let handle = self.connection_handle;
      // A response travels opposite to its request.
      let direction = if is_tx {
         Direction::Incoming
      } else {
         Direction::Outgoing
      };
      let is_stream = self.signal.state == ChannelState::Complete;
      let slot = self.ongoing_slot(direction);
      let expected = if is_tx { slot.dst_cid } else { slot.src_cid };
      if slot.state != ChannelState::Pending || expected != source_cid {
         return;
      }

      if result == CONNECT_RESULT_SUCCESS {
         if is_tx {
            slot.src_cid = dest_cid;
         } else {
            slot.dst_cid = dest_cid;
         }
         slot.state = ChannelState::Complete;
         let channel = *slot;
         if is_stream {
            self.stream = channel;
            self.ongoing.reset_stream();
         } else {
            self.signal = channel;
            self.ongoing.reset_signal();
         }
         info!(
            "AVDTP {} channel on 0x{handle:04x}: src 0x{:04x} dst 0x{:04x}",
            if is_stream { "stream" } else { "signaling" },
            channel.src_cid,
            channel.dst_cid
         );
      } else if result >= CONNECT_RESULT_REFUSED {
         *slot = L2capChannel::default();
         debug!("AVDTP connect refused on 0x{handle:04x} (result {result})");
      }
   }

   /// Processes an AVDTP message on the signaling channel.
   fn signaling(&mut self, data: &[u8], is_tx: bool) -> Option<StreamActivity> {
      let hdr = AvdtpHeader::parse(data)?;
      let signal_id = hdr.signal_id?;
      let stops_stream = matches!(signal_id, SignalId::Close | SignalId::Suspend | SignalId::Abort);
      let detect = &mut self.tsep_detect;

      match hdr.message_type {
         MessageType::ResponseAccept => match signal_id {
            SignalId::Start => return Some(StreamActivity::Active),
            SignalId::Open => return Some(StreamActivity::Open),
            _ if is_tx && stops_stream => return Some(StreamActivity::Inactive),
            SignalId::Discover => {
               // Sinks on our side are local sink endpoints when we answer, or
               // remote source endpoints when the peer answers.
               let (list, wanted) = if is_tx {
                  (&mut detect.local_sinks, Tsep::Sink)
               } else {
                  (&mut detect.remote_sinks, Tsep::Source)
               };
               list.clear();
               for info in discover_entries(data).filter(|info| info.tsep == wanted) {
                  if list.push(info.seid).is_err() {
                     break;
                  }
               }
               if is_tx {
                  detect.local_candidate = 0;
               } else {
                  detect.remote_candidate = 0;
               }
            },
            SignalId::SetConfiguration => {
               let (list, candidate) = if is_tx {
                  (&detect.local_sinks, detect.local_candidate)
               } else {
                  (&detect.remote_sinks, detect.remote_candidate)
               };
               detect.tsep = if list.contains(&candidate) {
                  Tsep::Sink
               } else {
                  Tsep::Source
               };
               detect.local_candidate = 0;
               detect.remote_candidate = 0;
               debug!(
                  "AVDTP configuration on 0x{:04x}: local side is {:?}",
                  self.connection_handle, detect.tsep
               );
            },
            _ => {},
         },
         MessageType::Command => match signal_id {
            SignalId::SetConfiguration => {
               let seid = set_configuration_acp_seid(data).unwrap_or(0);
               if is_tx {
                  detect.remote_candidate = seid;
               } else {
                  detect.local_candidate = seid;
               }
            },
            _ if is_tx && stops_stream => return Some(StreamActivity::Inactive),
            _ => {},
         },
         MessageType::GeneralReject | MessageType::ResponseReject => {
            if signal_id == SignalId::SetConfiguration {
               if is_tx {
                  detect.local_candidate = 0;
               } else {
                  detect.remote_candidate = 0;
               }
            }
         },
      }
      None
   }
}

/// Stream change report for the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvdtpNotification {
   pub connection_handle: u16,
   /// Remote media channel id, zero when no stream is running.
   pub l2cap_cid: u16,
   pub sink: bool,
   pub open: bool,
}

impl AvdtpNotification {
   pub fn flags(&self) -> u32 {
      let mut flags = 0;
      if self.sink {
         flags |= FLAG_SINK;
      }
      if self.open {
         flags |= FLAG_OPEN;
      }
      flags
   }

   pub fn to_descriptor(&self) -> AvdtpTd {
      AvdtpTd {
         flags: self.flags(),
         l2cap_cid: self.l2cap_cid,
         connection_handle: self.connection_handle,
      }
   }

   /// Packs the notification into the single header word used by firmware
   /// without the AVDTP ring. Bits 28-29 carry a counter so the firmware can
   /// tell consecutive reports apart.
   pub fn legacy_stream_id(&self, previous: u32) -> u32 {
      let counter = ((previous >> 28) + 1) & 0x3;
      let mut word = u32::from(self.l2cap_cid)
         | u32::from(self.connection_handle & 0x0FFF) << 16
         | counter << 28
         | LEGACY_SIGNAL_FLAG;
      if self.sink {
         word |= LEGACY_SINK_FLAG;
      }
      word
   }
}

/// Per-link AVDTP state, keyed by connection handle.
#[derive(Debug, Default)]
pub struct AvdtpDetector {
   connections: Mutex<HashMap<u16, AvdtpConnection>>,
}

impl AvdtpDetector {
   pub fn new() -> Self {
      Self::default()
   }

   /// Inspects one L2CAP frame (starting at the basic header) sent on or
   /// received from `handle`.
   pub fn inspect(&self, handle: u16, data: &[u8], is_tx: bool) -> Option<AvdtpNotification> {
      let cid = channel_id(data)?;
      let mut connections = self.connections.lock();

      if cid == L2CAP_SIGNALING_CID {
         let signal = L2capSignal::parse(data)?;
         if !Self::track_channels(&mut connections, handle, signal, is_tx) {
            return None;
         }
         let (l2cap_cid, sink) = connections
            .get(&handle)
            .map_or((0, false), |c| (c.stream.dst_cid, c.tsep() == Tsep::Sink));
         return Some(AvdtpNotification {
            connection_handle: handle,
            l2cap_cid,
            sink,
            open: false,
         });
      }

      let conn = connections.get_mut(&handle)?;
      let signal_cid = if is_tx {
         conn.signal.dst_cid
      } else {
         conn.signal.src_cid
      };
      if conn.signal.state != ChannelState::Complete
         || data.len() < MIN_AVDTP_LEN
         || signal_cid == 0
         || signal_cid != cid
      {
         return None;
      }

      let activity = conn.signaling(data, is_tx)?;
      info!("AVDTP stream on 0x{handle:04x}: {activity:?} (tx={is_tx})");
      Some(AvdtpNotification {
         connection_handle: handle,
         l2cap_cid: match activity {
            StreamActivity::Inactive => 0,
            _ => conn.stream.dst_cid,
         },
         sink: conn.tsep() == Tsep::Sink,
         open: activity == StreamActivity::Open,
      })
   }

   /// Applies an L2CAP signaling command. Returns true when the firmware
   /// must be told, which is only the case when a stream goes away.
   fn track_channels(
      connections: &mut HashMap<u16, AvdtpConnection>,
      handle: u16,
      signal: L2capSignal,
      is_tx: bool,
   ) -> bool {
      match signal {
         L2capSignal::ConnectReq { psm, source_cid } => {
            if psm == AVDTP_PSM {
               connections
                  .entry(handle)
                  .or_insert_with(|| AvdtpConnection::new(handle))
                  .connect_req(source_cid, is_tx);
            }
            false
         },
         L2capSignal::ConnectRsp {
            dest_cid,
            source_cid,
            result,
         } => {
            if let Some(conn) = connections.get_mut(&handle) {
               conn.connect_rsp(dest_cid, source_cid, result, is_tx);
            }
            false
         },
         L2capSignal::DisconnectReq {
            dest_cid,
            source_cid,
         } => {
            let Some(conn) = connections.get_mut(&handle) else {
               return false;
            };
            let matches = |ch: &L2capChannel| {
               ch.state == ChannelState::Complete
                  && if is_tx {
                     ch.src_cid == source_cid && ch.dst_cid == dest_cid
                  } else {
                     ch.src_cid == dest_cid && ch.dst_cid == source_cid
                  }
            };
            if matches(&conn.signal) {
               connections.remove(&handle);
               info!("AVDTP signaling on 0x{handle:04x} disconnected");
               false
            } else if matches(&conn.stream) {
               conn.stream = L2capChannel::default();
               conn.ongoing.reset_stream();
               info!("AVDTP stream on 0x{handle:04x} disconnected");
               true
            } else {
               false
            }
         },
      }
   }

   /// Forgets everything about `handle`, used when the ACL link goes down.
   pub fn reset_connection_handle(&self, handle: u16) -> bool {
      let removed = self.connections.lock().remove(&handle).is_some();
      if removed {
         debug!("AVDTP detection for 0x{handle:04x} dropped");
      }
      removed
   }

   pub fn clear(&self) {
      self.connections.lock().clear();
   }

   /// Snapshot of the state kept for `handle`.
   pub fn connection(&self, handle: u16) -> Option<AvdtpConnection> {
      self.connections.lock().get(&handle).cloned()
   }

   pub fn len(&self) -> usize {
      self.connections.lock().len()
   }

   pub fn is_empty(&self) -> bool {
      self.len() == 0
   }
}

#[cfg(test)]
pub(crate) mod tests {
   use super::*;

   const HANDLE: u16 = 0x000B;

   fn signaling(code: u8, params: &[u8]) -> Vec<u8> {
      let mut v = Vec::new();
      v.extend_from_slice(&((4 + params.len()) as u16).to_le_bytes());
      v.extend_from_slice(&L2CAP_SIGNALING_CID.to_le_bytes());
      v.extend_from_slice(&[code, 0x01]);
      v.extend_from_slice(&(params.len() as u16).to_le_bytes());
      v.extend_from_slice(params);
      v
   }

   pub(crate) fn connect_req(psm: u16, scid: u16) -> Vec<u8> {
      let mut p = psm.to_le_bytes().to_vec();
      p.extend_from_slice(&scid.to_le_bytes());
      signaling(0x02, &p)
   }

   pub(crate) fn connect_rsp(dcid: u16, scid: u16, result: u16) -> Vec<u8> {
      let mut p = dcid.to_le_bytes().to_vec();
      p.extend_from_slice(&scid.to_le_bytes());
      p.extend_from_slice(&result.to_le_bytes());
      p.extend_from_slice(&[0, 0]);
      signaling(0x03, &p)
   }

   pub(crate) fn disconnect_req(dcid: u16, scid: u16) -> Vec<u8> {
      let mut p = dcid.to_le_bytes().to_vec();
      p.extend_from_slice(&scid.to_le_bytes());
      signaling(0x06, &p)
   }

   pub(crate) fn avdtp(cid: u16, message_type: u8, signal: u8, body: &[u8]) -> Vec<u8> {
      let mut v = Vec::new();
      v.extend_from_slice(&((2 + body.len()) as u16).to_le_bytes());
      v.extend_from_slice(&cid.to_le_bytes());
      v.extend_from_slice(&[0x10 | message_type, signal]);
      v.extend_from_slice(body);
      v
   }

   /// Local side opens signaling 0x40<->0x50 and stream 0x41<->0x51.
   fn establish(det: &AvdtpDetector) {
      assert!(det.inspect(HANDLE, &connect_req(AVDTP_PSM, 0x0040), true).is_none());
      assert!(det.inspect(HANDLE, &connect_rsp(0x0050, 0x0040, 0), false).is_none());
      assert!(det.inspect(HANDLE, &connect_req(AVDTP_PSM, 0x0041), true).is_none());
      assert!(det.inspect(HANDLE, &connect_rsp(0x0051, 0x0041, 0), false).is_none());
   }

   #[test]
   fn test_signal_then_stream_then_disconnect() {
      let det = AvdtpDetector::new();
      det.inspect(HANDLE, &connect_req(AVDTP_PSM, 0x0040), true);
      let conn = det.connection(HANDLE).unwrap();
      assert_eq!(conn.signal.state, ChannelState::Idle);
      assert_eq!(conn.ongoing.outgoing_signal.state, ChannelState::Pending);

      det.inspect(HANDLE, &connect_rsp(0x0050, 0x0040, 0), false);
      let conn = det.connection(HANDLE).unwrap();
      assert_eq!(
         conn.signal,
         L2capChannel {
            state: ChannelState::Complete,
            src_cid: 0x0040,
            dst_cid: 0x0050
         }
      );

      det.inspect(HANDLE, &connect_req(AVDTP_PSM, 0x0041), true);
      det.inspect(HANDLE, &connect_rsp(0x0051, 0x0041, 0), false);
      let conn = det.connection(HANDLE).unwrap();
      assert_eq!(
         conn.stream,
         L2capChannel {
            state: ChannelState::Complete,
            src_cid: 0x0041,
            dst_cid: 0x0051
         }
      );

      assert!(det.inspect(HANDLE, &disconnect_req(0x0050, 0x0040), true).is_none());
      assert!(det.connection(HANDLE).is_none());
      assert!(det.is_empty());
   }

   #[test]
   fn test_incoming_connection() {
      let det = AvdtpDetector::new();
      // Remote requests with its cid 0x70, we answer with ours 0x60.
      det.inspect(HANDLE, &connect_req(AVDTP_PSM, 0x0070), false);
      det.inspect(HANDLE, &connect_rsp(0x0060, 0x0070, 0), true);
      let conn = det.connection(HANDLE).unwrap();
      assert_eq!(conn.signal.state, ChannelState::Complete);
      assert_eq!((conn.signal.src_cid, conn.signal.dst_cid), (0x0060, 0x0070));

      // Remote disconnects: dcid is ours, scid is theirs.
      det.inspect(HANDLE, &disconnect_req(0x0060, 0x0070), false);
      assert!(det.connection(HANDLE).is_none());
   }

   #[test]
   fn test_other_psm_and_mismatched_response_ignored() {
      let det = AvdtpDetector::new();
      det.inspect(HANDLE, &connect_req(0x0001, 0x0040), true);
      assert!(det.is_empty());

      det.inspect(HANDLE, &connect_req(AVDTP_PSM, 0x0040), true);
      det.inspect(HANDLE, &connect_rsp(0x0050, 0x0099, 0), false);
      assert_eq!(det.connection(HANDLE).unwrap().signal.state, ChannelState::Idle);

      // pending result leaves the request outstanding
      det.inspect(HANDLE, &connect_rsp(0x0050, 0x0040, 1), false);
      let conn = det.connection(HANDLE).unwrap();
      assert_eq!(conn.ongoing.outgoing_signal.state, ChannelState::Pending);
   }

   #[test]
   fn test_refused_allows_renegotiation() {
      let det = AvdtpDetector::new();
      det.inspect(HANDLE, &connect_req(AVDTP_PSM, 0x0040), true);
      det.inspect(HANDLE, &connect_rsp(0x0000, 0x0040, 0x0004), false);
      let conn = det.connection(HANDLE).unwrap();
      assert_eq!(conn.ongoing.outgoing_signal, L2capChannel::default());

      det.inspect(HANDLE, &connect_req(AVDTP_PSM, 0x0042), true);
      det.inspect(HANDLE, &connect_rsp(0x0052, 0x0042, 0), false);
      assert_eq!(det.connection(HANDLE).unwrap().signal.src_cid, 0x0042);
   }

   #[test]
   fn test_stream_disconnect_notifies_and_keeps_signal() {
      let det = AvdtpDetector::new();
      establish(&det);
      let note = det.inspect(HANDLE, &disconnect_req(0x0051, 0x0041), true).unwrap();
      assert_eq!(note.l2cap_cid, 0);
      assert_eq!(note.connection_handle, HANDLE);
      let conn = det.connection(HANDLE).unwrap();
      assert_eq!(conn.stream.state, ChannelState::Idle);
      assert_eq!(conn.signal.state, ChannelState::Complete);
   }

   #[test]
   fn test_stream_activity_reports() {
      let det = AvdtpDetector::new();
      establish(&det);

      // Peer accepts our OPEN: received on our signaling cid 0x40.
      let note = det.inspect(HANDLE, &avdtp(0x0040, 2, 0x06, &[]), false).unwrap();
      assert!(note.open);
      assert_eq!(note.l2cap_cid, 0x0051);
      assert_eq!(note.flags(), FLAG_OPEN);

      let note = det.inspect(HANDLE, &avdtp(0x0040, 2, 0x07, &[0x04]), false).unwrap();
      assert!(!note.open);
      assert_eq!(note.l2cap_cid, 0x0051);

      // We send SUSPEND to the remote cid 0x50.
      let note = det.inspect(HANDLE, &avdtp(0x0050, 0, 0x09, &[0x04]), true).unwrap();
      assert_eq!(note.l2cap_cid, 0);

      // Received SUSPEND commands are not reported, nor is traffic on other cids.
      assert!(det.inspect(HANDLE, &avdtp(0x0040, 0, 0x09, &[0x04]), false).is_none());
      assert!(det.inspect(HANDLE, &avdtp(0x0051, 2, 0x07, &[]), false).is_none());
   }

   #[test]
   fn test_sink_detection() {
      let det = AvdtpDetector::new();
      establish(&det);

      // We answer DISCOVER with seid 1 (source) and seid 2 (sink).
      det.inspect(HANDLE, &avdtp(0x0050, 2, 0x01, &[0x04, 0x00, 0x08, 0x08]), true);
      // Remote configures our seid 2.
      det.inspect(HANDLE, &avdtp(0x0040, 0, 0x03, &[0x08, 0x04]), false);
      det.inspect(HANDLE, &avdtp(0x0050, 2, 0x03, &[]), true);
      assert_eq!(det.connection(HANDLE).unwrap().tsep(), Tsep::Sink);

      let note = det.inspect(HANDLE, &avdtp(0x0050, 2, 0x07, &[]), true).unwrap();
      assert!(note.sink);
      assert_eq!(note.flags(), FLAG_SINK);

      // Reconfiguration towards the source seid flips it back.
      det.inspect(HANDLE, &avdtp(0x0040, 0, 0x03, &[0x04, 0x04]), false);
      det.inspect(HANDLE, &avdtp(0x0050, 2, 0x03, &[]), true);
      assert_eq!(det.connection(HANDLE).unwrap().tsep(), Tsep::Source);
   }

   #[test]
   fn test_rejected_configuration_clears_candidate() {
      let det = AvdtpDetector::new();
      establish(&det);
      det.inspect(HANDLE, &avdtp(0x0050, 2, 0x01, &[0x08, 0x08]), true);
      det.inspect(HANDLE, &avdtp(0x0040, 0, 0x03, &[0x08, 0x04]), false);
      det.inspect(HANDLE, &avdtp(0x0050, 3, 0x03, &[]), true);
      det.inspect(HANDLE, &avdtp(0x0050, 2, 0x03, &[]), true);
      assert_eq!(det.connection(HANDLE).unwrap().tsep(), Tsep::Source);
   }

   #[test]
   fn test_reset_connection_handle() {
      let det = AvdtpDetector::new();
      establish(&det);
      assert!(det.reset_connection_handle(HANDLE));
      assert!(!det.reset_connection_handle(HANDLE));
      assert!(det.inspect(HANDLE, &avdtp(0x0040, 2, 0x07, &[]), false).is_none());
   }

   #[test]
   fn test_legacy_stream_id() {
      let note = AvdtpNotification {
         connection_handle: 0x0042,
         l2cap_cid: 0x0051,
         sink: true,
         open: false,
      };
      let first = note.legacy_stream_id(0);
      assert_eq!(first, 0x0051 | 0x0042 << 16 | 1 << 28 | 0x8000_0000 | 0x4000_0000);
      let second = note.legacy_stream_id(first);
      assert_eq!((second >> 28) & 0x3, 2);
      let wrapped = note.legacy_stream_id(note.legacy_stream_id(second));
      assert_eq!((wrapped >> 28) & 0x3, 0);
   }
}

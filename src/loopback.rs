//! Firmware emulator for the far side of the mailbox.
//!
//! Drives a [`FirmwarePort`] the way the controller firmware would: it
//! publishes events, ACL data, buffer returns and IQ reports, and drains
//! what the host transmits. Used by the self-test binary and by the
//! session tests.

use std::sync::Arc;

use heapless::Vec as BoundedVec;
use log::debug;

use crate::{
   error::{Result, Violation},
   hci::protocol::{EV_COMMAND_COMPLETE, PacketBoundary},
   mailbox::{
      FirmwarePort, MailboxHeader,
      descriptor::{
         ACL_BUFFER_SIZE, AclFreeTd, AclRxTd, AclTxTd, AvdtpTd, CMD_EVT_BUFFER_SIZE, EventKind,
         EventTd, IqReportTd,
      },
   },
   transport::session::Session,
};

/// HCI Connection Complete event code.
const EV_CONNECTION_COMPLETE: u8 = 0x03;
/// HCI Disconnection Complete event code.
const EV_DISCONNECTION_COMPLETE: u8 = 0x05;
/// Remote user terminated connection.
const REASON_REMOTE_USER: u8 = 0x13;

/// What one [`Firmware::service`] pass handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceReport {
   pub commands: usize,
   pub acl_frames: usize,
}

pub struct Firmware {
   port: FirmwarePort,
   session: Option<Arc<Session>>,
}

impl Firmware {
   pub fn new(port: FirmwarePort) -> Self {
      Self { port, session: None }
   }

   /// Routes the emulator's doorbell to `session`.
   pub fn attach(&mut self, session: Arc<Session>) {
      self.session = Some(session);
   }

   pub fn header(&self) -> &MailboxHeader {
      &self.port.header
   }

   fn raise_interrupt(&self) {
      if let Some(session) = &self.session {
         session.handle_interrupt();
      }
   }

   pub fn set_features(&self, features: u32) {
      self.port.header.set_firmware_features(features);
   }

   pub fn set_panic(&self, marker: u32) {
      self.port.header.set_panic_marker(marker);
      self.raise_interrupt();
   }

   /// Publishes an event descriptor carrying the raw HCI event `data`
   /// (event code, length, parameters).
   pub fn push_event(&mut self, connection_handle: u16, kind: EventKind, data: &[u8]) -> Result<()> {
      let data = BoundedVec::from_slice(data).map_err(|()| Violation::EventLengthMismatch {
         length: data.len(),
         declared: CMD_EVT_BUFFER_SIZE,
      })?;
      self.port.event.push(EventTd {
         connection_handle,
         kind,
         data,
      })?;
      debug!("Firmware: {kind} event for 0x{connection_handle:04x}");
      self.raise_interrupt();
      Ok(())
   }

   pub fn push_connected(&mut self, handle: u16) -> Result<()> {
      let [lo, hi] = handle.to_le_bytes();
      let data = [
         EV_CONNECTION_COMPLETE,
         11,
         0x00,
         lo,
         hi,
         0x11,
         0x22,
         0x33,
         0x44,
         0x55,
         0x66,
         0x01,
         0x00,
      ];
      self.push_event(handle, EventKind::Connected, &data)
   }

   pub fn push_disconnected(&mut self, handle: u16) -> Result<()> {
      let [lo, hi] = handle.to_le_bytes();
      let data = [EV_DISCONNECTION_COMPLETE, 4, 0x00, lo, hi, REASON_REMOTE_USER];
      self.push_event(handle, EventKind::Disconnected, &data)
   }

   fn push_acl_td(&mut self, td: AclRxTd) -> Result<()> {
      self.port.acl_rx.push(td)?;
      self.raise_interrupt();
      Ok(())
   }

   /// Publishes one received ACL fragment.
   pub fn push_acl(&mut self, handle: u16, boundary: PacketBoundary, payload: &[u8]) -> Result<()> {
      let data = BoundedVec::from_slice(payload).map_err(|()| Violation::AclTooLong {
         length: payload.len(),
         max: ACL_BUFFER_SIZE,
      })?;
      debug!("Firmware: ACL for 0x{handle:04x} {}", hex::encode(payload));
      self.push_acl_td(AclRxTd {
         connection_handle: handle,
         broadcast_flag: 0,
         packet_boundary: boundary.bits(),
         disconnected: false,
         data,
      })
   }

   /// Publishes the terminal record for `handle`, after which the host may
   /// deliver its Disconnected event.
   pub fn push_acl_disconnected_marker(&mut self, handle: u16) -> Result<()> {
      self.push_acl_td(AclRxTd {
         connection_handle: handle,
         disconnected: true,
         ..Default::default()
      })
   }

   pub fn push_iq_report(&mut self, td: IqReportTd) -> Result<()> {
      self.port.iq_report.push(td)?;
      self.raise_interrupt();
      Ok(())
   }

   /// Hands an ACL buffer back to the host, which reports it as a credit.
   pub fn return_buffer(&mut self, buffer_index: u8, connection_handle: u16) -> Result<()> {
      self.port.acl_free.push(AclFreeTd {
         buffer_index,
         connection_handle,
      })?;
      self.raise_interrupt();
      Ok(())
   }

   /// Drains the command ring, returning each command without its H4 indicator.
   pub fn take_commands(&mut self) -> Result<Vec<Vec<u8>>> {
      let mut commands = Vec::new();
      while let Some(td) = self.port.command.peek_read()? {
         commands.push(td.data.to_vec());
         self.port.command.commit_read()?;
      }
      Ok(commands)
   }

   pub fn take_acl(&mut self) -> Result<Vec<AclTxTd>> {
      let mut frames = Vec::new();
      while let Some(td) = self.port.acl_tx.peek_read()? {
         frames.push(td.clone());
         self.port.acl_tx.commit_read()?;
      }
      Ok(frames)
   }

   pub fn take_avdtp(&mut self) -> Result<Vec<AvdtpTd>> {
      let mut notes = Vec::new();
      while let Some(&td) = self.port.avdtp.peek_read()? {
         notes.push(td);
         self.port.avdtp.commit_read()?;
      }
      Ok(notes)
   }

   /// Answers every queued command with Command Complete and returns every
   /// transmitted ACL buffer.
   pub fn service(&mut self) -> Result<ServiceReport> {
      let commands = self.take_commands()?;
      for command in &commands {
         let (lo, hi) = match command.as_slice() {
            [lo, hi, ..] => (*lo, *hi),
            _ => (0, 0),
         };
         // num packets, opcode, status
         let data = [EV_COMMAND_COMPLETE, 4, 0x01, lo, hi, 0x00];
         self.push_event(0, EventKind::None, &data)?;
      }

      let frames = self.take_acl()?;
      for td in &frames {
         self.return_buffer(td.buffer_index, td.connection_handle)?;
      }

      let report = ServiceReport {
         commands: commands.len(),
         acl_frames: frames.len(),
      };
      if report != ServiceReport::default() {
         debug!("Firmware serviced {report:?}");
      }
      Ok(report)
   }
}

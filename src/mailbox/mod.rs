//! Shared-memory mailbox between host and firmware.
//!
//! The mailbox is a fixed set of transfer rings plus a small header. Each
//! ring is created once and its two halves are handed to the side that owns
//! that direction, so the host can only produce on TX rings and only consume
//! on RX rings.

use std::sync::{
   Arc,
   atomic::{AtomicU32, Ordering},
};

use crate::{config::Config, error::Result};

pub mod descriptor;
pub mod ring;

use descriptor::{AclFreeTd, AclRxTd, AclTxTd, AvdtpTd, CommandTd, EventTd, IqReportTd};
use ring::{Consumer, Producer, transfer_ring};

/// Firmware died while starting.
pub const PANIC_START: u32 = 0x10DE_AD01;
/// Firmware died while stopping.
pub const PANIC_STOP: u32 = 0x0201_DEAD;
/// Firmware died while handling a connection.
pub const PANIC_CONNECTION: u32 = 0xDEAD_2002;

/// Firmware supports the AVDTP notification ring.
pub const FEATURE_AVDTP_TRANSFER_RING: u32 = 0x08;

/// Identifies a transfer ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum RingKind {
   Command,
   Event,
   AclRx,
   AclTx,
   AclFree,
   IqReport,
   Avdtp,
}

/// Words shared outside of the rings.
#[derive(Debug, Default)]
pub struct MailboxHeader {
   panic_marker: AtomicU32,
   firmware_features: AtomicU32,
   avdtp_stream_id: AtomicU32,
}

impl MailboxHeader {
   /// Non-zero once the firmware has panicked.
   pub fn panic_marker(&self) -> u32 {
      self.panic_marker.load(Ordering::Acquire)
   }

   pub fn set_panic_marker(&self, marker: u32) {
      self.panic_marker.store(marker, Ordering::Release);
   }

   pub fn firmware_features(&self) -> u32 {
      self.firmware_features.load(Ordering::Acquire)
   }

   pub fn set_firmware_features(&self, features: u32) {
      self.firmware_features.store(features, Ordering::Release);
   }

   pub fn has_avdtp_ring(&self) -> bool {
      self.firmware_features() & FEATURE_AVDTP_TRANSFER_RING != 0
   }

   /// Legacy stream notification word for firmware without the AVDTP ring.
   pub fn avdtp_stream_id(&self) -> u32 {
      self.avdtp_stream_id.load(Ordering::Acquire)
   }

   pub fn set_avdtp_stream_id(&self, value: u32) {
      self.avdtp_stream_id.store(value, Ordering::Release);
   }
}

/// Host side of the mailbox.
pub struct HostPort {
   pub header: Arc<MailboxHeader>,
   pub command: Producer<CommandTd>,
   pub acl_tx: Producer<AclTxTd>,
   pub avdtp: Producer<AvdtpTd>,
   pub event: Consumer<EventTd>,
   pub acl_rx: Consumer<AclRxTd>,
   pub acl_free: Consumer<AclFreeTd>,
   pub iq_report: Consumer<IqReportTd>,
}

/// Firmware side of the mailbox.
pub struct FirmwarePort {
   pub header: Arc<MailboxHeader>,
   pub command: Consumer<CommandTd>,
   pub acl_tx: Consumer<AclTxTd>,
   pub avdtp: Consumer<AvdtpTd>,
   pub event: Producer<EventTd>,
   pub acl_rx: Producer<AclRxTd>,
   pub acl_free: Producer<AclFreeTd>,
   pub iq_report: Producer<IqReportTd>,
}

/// Builds the rings described by `config` and splits them by owner.
pub fn mailbox(config: &Config) -> Result<(HostPort, FirmwarePort)> {
   config.validate()?;
   let sizes = &config.rings;
   let header = Arc::new(MailboxHeader::default());

   let (command_tx, command_rx) = transfer_ring(RingKind::Command, sizes.command)?;
   let (acl_tx_tx, acl_tx_rx) = transfer_ring(RingKind::AclTx, sizes.acl_tx)?;
   let (avdtp_tx, avdtp_rx) = transfer_ring(RingKind::Avdtp, sizes.avdtp)?;
   let (event_tx, event_rx) = transfer_ring(RingKind::Event, sizes.event)?;
   let (acl_rx_tx, acl_rx_rx) = transfer_ring(RingKind::AclRx, sizes.acl_rx)?;
   let (acl_free_tx, acl_free_rx) = transfer_ring(RingKind::AclFree, sizes.acl_free)?;
   let (iq_tx, iq_rx) = transfer_ring(RingKind::IqReport, sizes.iq_report)?;

   let host = HostPort {
      header: header.clone(),
      command: command_tx,
      acl_tx: acl_tx_tx,
      avdtp: avdtp_tx,
      event: event_rx,
      acl_rx: acl_rx_rx,
      acl_free: acl_free_rx,
      iq_report: iq_rx,
   };
   let firmware = FirmwarePort {
      header,
      command: command_rx,
      acl_tx: acl_tx_rx,
      avdtp: avdtp_rx,
      event: event_tx,
      acl_rx: acl_rx_tx,
      acl_free: acl_free_tx,
      iq_report: iq_tx,
   };
   Ok((host, firmware))
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_mailbox_wires_directions() -> Result<()> {
      let (mut host, mut fw) = mailbox(&Config::default())?;

      host.command.push(CommandTd::default())?;
      assert_eq!(fw.command.usage()?, 1);

      fw.acl_free.push(AclFreeTd {
         buffer_index: 4,
         connection_handle: 1,
      })?;
      assert_eq!(host.acl_free.peek_read()?.map(|td| td.buffer_index), Some(4));

      assert_eq!(host.event.capacity(), 32);
      assert_eq!(fw.avdtp.capacity(), 16);
      Ok(())
   }

   #[test]
   fn test_header_is_shared() -> Result<()> {
      let (host, fw) = mailbox(&Config::default())?;
      assert_eq!(host.header.panic_marker(), 0);
      fw.header.set_panic_marker(PANIC_CONNECTION);
      assert_eq!(host.header.panic_marker(), PANIC_CONNECTION);

      assert!(!host.header.has_avdtp_ring());
      fw.header.set_firmware_features(FEATURE_AVDTP_TRANSFER_RING);
      assert!(host.header.has_avdtp_ring());
      Ok(())
   }
}

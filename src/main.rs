//! Loopback self-test for the shared-memory HCI transport.
//!
//! Brings up a session against the firmware emulator, pushes a command, a
//! connection, ACL traffic in both directions and a disconnect through it,
//! and prints the resulting statistics as JSON.

use std::sync::Arc;

use log::{info, warn};

use bsmhcp::{
   Config, InterruptSources, Result, Session, TransportError,
   doorbell::RecordingDoorbell,
   hci::protocol::PacketBoundary,
   loopback::Firmware,
   mailbox::{FEATURE_AVDTP_TRANSFER_RING, descriptor::acl_flags, mailbox},
};

const HANDLE: u16 = 0x0040;

/// Reads whatever the session has pending.
fn drain(session: &Session) -> Result<Vec<u8>> {
   let mut out = Vec::new();
   let mut buf = [0u8; 256];
   loop {
      match session.read(&mut buf[..]) {
         Ok(n) => out.extend_from_slice(&buf[..n]),
         Err(TransportError::WouldBlock) => return Ok(out),
         Err(e) => return Err(e),
      }
   }
}

fn acl_packet(handle: u16, flags: u8, payload: &[u8]) -> Vec<u8> {
   let mut v = vec![0x02, (handle & 0xFF) as u8, ((handle >> 8) & 0x0F) as u8 | flags];
   v.extend_from_slice(&(payload.len() as u16).to_le_bytes());
   v.extend_from_slice(payload);
   v
}

fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting bsmhcp loopback self-test...");

   let config = Config::load()?;
   info!(
      "Loaded configuration: {} ACL buffers, event ring {}",
      config.acl_tx_buffers, config.rings.event
   );

   let (host, port) = mailbox(&config)?;
   port.header.set_firmware_features(FEATURE_AVDTP_TRANSFER_RING);

   let doorbell = RecordingDoorbell::new();
   let session = Arc::new(Session::new(host, &config, doorbell.clone(), InterruptSources::default())?);
   session.set_nonblocking(true);

   let mut firmware = Firmware::new(port);
   firmware.attach(session.clone());

   // HCI Reset and its Command Complete.
   let written = session.write(&[0x01u8, 0x03, 0x0c, 0x00][..])?;
   firmware.service()?;
   info!("Reset: wrote {written} bytes, got {}", hex::encode(drain(&session)?));

   firmware.push_connected(HANDLE)?;
   info!("Connection: {}", hex::encode(drain(&session)?));

   // L2CAP frames on a dynamic channel, returned as credits.
   let mut payload = 8u16.to_le_bytes().to_vec();
   payload.extend_from_slice(&0x0041u16.to_le_bytes());
   payload.extend_from_slice(b"loopback");
   for _ in 0..4 {
      session.write(&acl_packet(HANDLE, acl_flags::PB_START_FLUSH, &payload)[..])?;
   }
   let report = firmware.service()?;
   info!(
      "Sent {} ACL frames, credits: {}",
      report.acl_frames,
      hex::encode(drain(&session)?)
   );

   firmware.push_acl(HANDLE, PacketBoundary::StartFlush, &payload)?;
   firmware.push_acl_disconnected_marker(HANDLE)?;
   firmware.push_disconnected(HANDLE)?;
   info!("Inbound data and disconnect: {}", hex::encode(drain(&session)?));

   let rung = doorbell.take();
   info!("Doorbell rung {} times", rung.len());

   let stats = session.stats();
   if stats.failed {
      warn!("Session failed during self-test");
   }
   println!("{:#}", stats.to_json());

   session.close();
   Ok(())
}

//! Byte-stream view of the mailbox.
//!
//! A [`Session`] turns the transfer rings into the H4 byte stream a host
//! Bluetooth stack expects. Reads stage one record at a time from the RX
//! rings (credits, events, ACL data, IQ reports) behind a cursor that
//! survives across calls; writes assemble H4 packets from arbitrary chunks
//! and publish them on the TX rings.
//!
//! One reader and one writer may be active at a time; a second concurrent
//! caller gets `Busy`. Fatal errors latch the session: the reader drains
//! any partially copied record, receives one Hardware Error event, and from
//! then on every call fails with `Io`.

use std::{
   sync::atomic::{AtomicBool, AtomicU64, Ordering},
   time::{Duration, Instant},
};

use log::{debug, error, info, trace, warn};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::{
   avdtp::detector::{AvdtpDetector, AvdtpNotification},
   config::Config,
   doorbell::{DoorbellHandle, InterruptSources},
   error::{Result, TransportError, Violation},
   hci::{
      framing::{
         CreditReport, FrameAssembler, HARDWARE_ERROR_RECORD, Record, acl_record, event_record,
         iq_report_record,
      },
      protocol::{AclHeader, H4_ACL_HEADER, HANDLE_MASK, PacketBoundary, PacketType, RAW_HANDLE_MASK, RAW_HANDLE_VALUE},
   },
   mailbox::{
      HostPort, MailboxHeader, RingKind,
      descriptor::{
         ACL_PACKET_SIZE, AclFreeTd, AclRxTd, AclTxTd, AvdtpTd, CMD_EVT_BUFFER_SIZE, CommandTd, EventKind,
         EventTd, IqReportTd,
      },
      ring::{Consumer, Producer},
   },
   transport::{
      allocator::AclBufferPool,
      connection::{ConnectionState, ConnectionTable},
      flow::FlowControl,
      user::{UserBuffer, UserData},
   },
};

/// Bytes pulled from the caller per assembler step, one maximal ACL packet.
const WRITE_CHUNK: usize = H4_ACL_HEADER + ACL_PACKET_SIZE;

/// Where the record under the read cursor came from, and what to do once
/// it has been copied out completely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordSource {
   /// Event at `slot`. Out-of-order deliveries are not at the read index
   /// and are skipped later instead of committed.
   Event { slot: u32, in_order: bool },
   AclRx { inspect_avdtp: bool },
   Credits,
   IqReport,
   HardwareError,
}

impl RecordSource {
   fn ring(&self) -> Option<RingKind> {
      match self {
         Self::Event { .. } => Some(RingKind::Event),
         Self::AclRx { .. } => Some(RingKind::AclRx),
         Self::Credits => Some(RingKind::AclFree),
         Self::IqReport => Some(RingKind::IqReport),
         Self::HardwareError => None,
      }
   }
}

/// A record partially copied to the caller.
#[derive(Debug)]
struct ReadCursor {
   source: RecordSource,
   record: Record,
   offset: usize,
}

impl ReadCursor {
   fn new(source: RecordSource, record: Record) -> Self {
      trace!("Staged {:?} record: {}", source, hex::encode(&record));
      Self {
         source,
         record,
         offset: 0,
      }
   }

   fn remaining(&self) -> usize {
      self.record.len() - self.offset
   }
}

struct ReaderState {
   event: Consumer<EventTd>,
   acl_rx: Consumer<AclRxTd>,
   acl_free: Consumer<AclFreeTd>,
   iq_report: Consumer<IqReportTd>,
   flow: FlowControl,
   cursor: Option<ReadCursor>,
   /// Leading AclFree records whose buffers were already returned to the pool.
   free_scanned: usize,
   iq_enabled: bool,
   /// The event ring's read index moved since the last doorbell.
   events_advanced: bool,
   /// Some other RX read index moved since the last doorbell.
   advanced: bool,
}

struct WriterState {
   command: Producer<CommandTd>,
   acl_tx: Producer<AclTxTd>,
   assembler: FrameAssembler,
   /// Some TX record was published since the last doorbell.
   published: bool,
}

#[derive(Debug, Default)]
struct Counters {
   interrupts: AtomicU64,
   events: AtomicU64,
   out_of_order_events: AtomicU64,
   acl_rx: AtomicU64,
   iq_reports: AtomicU64,
   iq_dropped: AtomicU64,
   credits: AtomicU64,
   credits_dropped: AtomicU64,
   commands: AtomicU64,
   acl_tx: AtomicU64,
   bytes_read: AtomicU64,
   bytes_written: AtomicU64,
   avdtp_notifications: AtomicU64,
   avdtp_dropped: AtomicU64,
}

fn bump(counter: &AtomicU64, n: u64) {
   counter.fetch_add(n, Ordering::Relaxed);
}

/// Readiness reported by [`Session::poll`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollStatus {
   pub readable: bool,
   pub writable: bool,
   pub error: bool,
}

/// Snapshot of the session counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
   pub interrupts: u64,
   pub events_delivered: u64,
   pub out_of_order_events: u64,
   pub acl_delivered: u64,
   pub iq_reports_delivered: u64,
   pub iq_reports_dropped: u64,
   pub credits_returned: u64,
   pub credits_dropped: u64,
   pub commands_sent: u64,
   pub acl_sent: u64,
   pub bytes_read: u64,
   pub bytes_written: u64,
   pub avdtp_notifications: u64,
   pub avdtp_dropped: u64,
   pub fragment_anomalies: u64,
   pub buffers_allocated: u64,
   pub buffers_freed: u64,
   pub buffers_in_flight: u64,
   pub failed: bool,
}

impl TransportStats {
   pub fn to_json(&self) -> serde_json::Value {
      serde_json::to_value(self).unwrap_or_default()
   }
}

#[derive(Debug, Default)]
struct WakeState {
   /// Bumped by every doorbell from the firmware.
   generation: u64,
   /// Readers blocked in `wait_for_interrupt`.
   parked: usize,
   interrupt: bool,
}

/// Host side of one shared-memory transport instance.
pub struct Session {
   header: std::sync::Arc<MailboxHeader>,
   reader: Mutex<ReaderState>,
   writer: Mutex<WriterState>,
   avdtp_ring: Mutex<Producer<AvdtpTd>>,
   connections: Mutex<ConnectionTable>,
   pool: Mutex<AclBufferPool>,
   detector: AvdtpDetector,
   doorbell: DoorbellHandle,
   sources: InterruptSources,
   sync_timeout: Duration,

   failed: AtomicBool,
   hw_error_delivered: AtomicBool,
   closed: AtomicBool,
   nonblocking: AtomicBool,
   wake: Mutex<WakeState>,
   wake_cond: Condvar,
   counters: Counters,
}

impl Session {
   pub fn new(port: HostPort, config: &Config, doorbell: DoorbellHandle, sources: InterruptSources) -> Result<Self> {
      config.validate()?;
      let HostPort {
         header,
         command,
         acl_tx,
         avdtp,
         event,
         acl_rx,
         acl_free,
         iq_report,
      } = port;

      info!(
         "Session up: {} ACL buffers, firmware features 0x{:08x}",
         config.acl_tx_buffers,
         header.firmware_features()
      );
      Ok(Self {
         reader: Mutex::new(ReaderState {
            flow: FlowControl::new(event.capacity()),
            event,
            acl_rx,
            acl_free,
            iq_report,
            cursor: None,
            free_scanned: 0,
            iq_enabled: false,
            events_advanced: false,
            advanced: false,
         }),
         writer: Mutex::new(WriterState {
            command,
            acl_tx,
            assembler: FrameAssembler::default(),
            published: false,
         }),
         avdtp_ring: Mutex::new(avdtp),
         connections: Mutex::new(ConnectionTable::new(
            config.connection_table_size,
            config.tolerate_fragment_overrun,
         )),
         pool: Mutex::new(AclBufferPool::new(config.acl_tx_buffers)),
         detector: AvdtpDetector::new(),
         doorbell,
         sources,
         sync_timeout: config.sync_timeout(),
         header,
         failed: AtomicBool::new(false),
         hw_error_delivered: AtomicBool::new(false),
         closed: AtomicBool::new(false),
         nonblocking: AtomicBool::new(config.nonblocking),
         wake: Mutex::new(WakeState::default()),
         wake_cond: Condvar::new(),
         counters: Counters::default(),
      })
   }

   pub fn is_failed(&self) -> bool {
      self.failed.load(Ordering::Acquire)
   }

   pub fn is_closed(&self) -> bool {
      self.closed.load(Ordering::Acquire)
   }

   pub fn set_nonblocking(&self, nonblocking: bool) {
      self.nonblocking.store(nonblocking, Ordering::Relaxed);
   }

   pub fn detector(&self) -> &AvdtpDetector {
      &self.detector
   }

   /// Latches the permanent error flag.
   fn fail(&self, err: &TransportError) {
      if !self.failed.swap(true, Ordering::AcqRel) {
         error!("Transport failed: {err}");
      }
      self.wake_all();
   }

   /// Latches fatal errors on the way out.
   fn latch<T>(&self, result: Result<T>) -> Result<T> {
      if let Err(e) = &result
         && e.is_fatal()
      {
         self.fail(e);
      }
      result
   }

   fn check_panic(&self) {
      let marker = self.header.panic_marker();
      if marker != 0 && !self.is_failed() {
         self.fail(&TransportError::FirmwarePanic(marker));
      }
   }

   fn wake_all(&self) {
      let mut wake = self.wake.lock();
      wake.generation = wake.generation.wrapping_add(1);
      self.wake_cond.notify_all();
   }

   fn wake_generation(&self) -> u64 {
      self.wake.lock().generation
   }

   /// Blocks until the interrupt generation moves past `seen`.
   ///
   /// Returns false when `deadline` passed first.
   fn wait_for_interrupt(&self, seen: u64, deadline: Option<Instant>) -> Result<bool> {
      let mut wake = self.wake.lock();
      wake.parked += 1;
      let result = loop {
         if wake.interrupt {
            break Err(TransportError::Interrupted);
         }
         if wake.generation != seen {
            break if self.is_closed() { Err(TransportError::Closed) } else { Ok(true) };
         }
         match deadline {
            Some(deadline) => {
               if self.wake_cond.wait_until(&mut wake, deadline).timed_out() {
                  break Ok(wake.generation != seen);
               }
            },
            None => self.wake_cond.wait(&mut wake),
         }
      };
      wake.parked -= 1;
      if wake.parked == 0 {
         wake.interrupt = false;
      }
      result
   }

   /// Doorbell interrupt from the firmware.
   pub fn handle_interrupt(&self) {
      bump(&self.counters.interrupts, 1);
      self.wake_all();
   }

   /// Aborts a blocked read with `Interrupted`.
   pub fn interrupt_reader(&self) {
      let mut wake = self.wake.lock();
      // Only a parked reader can be interrupted.
      if wake.parked > 0 {
         wake.interrupt = true;
         self.wake_cond.notify_all();
      }
   }

   /// Stops the session. Blocked and later callers get `Closed`.
   pub fn close(&self) {
      if self.closed.swap(true, Ordering::AcqRel) {
         return;
      }
      self.detector.clear();
      info!("Session closed");
      self.wake_all();
   }

   /// Copies pending records into `buf`.
   ///
   /// Returns the number of bytes written, which is only 0 for an empty
   /// buffer. Blocks while nothing is readable unless the session is
   /// nonblocking.
   pub fn read<B: UserBuffer + ?Sized>(&self, buf: &mut B) -> Result<usize> {
      if self.is_closed() {
         return Err(TransportError::Closed);
      }
      let mut reader = self.reader.try_lock().ok_or(TransportError::Busy)?;
      if buf.capacity() == 0 {
         return Ok(0);
      }
      if self.hw_error_delivered.load(Ordering::Acquire) {
         return Err(TransportError::Io);
      }

      let result = self.latch(self.read_locked(&mut reader, buf));
      // Freed event slots are reclaimed by the background handler.
      if std::mem::take(&mut reader.events_advanced) {
         self.doorbell.ring(self.sources.to_background);
      }
      if std::mem::take(&mut reader.advanced) {
         self.doorbell.ring(self.sources.to_foreground);
      }
      if let Ok(n) = result {
         bump(&self.counters.bytes_read, n as u64);
      }
      result
   }

   fn read_locked<B: UserBuffer + ?Sized>(&self, r: &mut ReaderState, buf: &mut B) -> Result<usize> {
      let mut consumed = 0;
      if let Err(e) = self.scan_freed_buffers(r) {
         self.fail(&e);
      }

      // Finish the record a previous call left half copied.
      self.copy_out(r, buf, &mut consumed)?;

      while consumed == 0 && r.cursor.is_none() {
         self.check_panic();
         if self.is_failed() {
            break;
         }
         let seen = self.wake_generation();
         match self.service_rings(r, buf, &mut consumed) {
            Ok(()) => {},
            Err(e) if e.is_fatal() => {
               self.fail(&e);
               break;
            },
            Err(e) if consumed > 0 => {
               debug!("Read stopped early: {e}");
               break;
            },
            Err(e) => return Err(e),
         }
         if consumed > 0 || r.cursor.is_some() {
            break;
         }
         match self.rx_idle(r) {
            Ok(false) => continue,
            Ok(true) => {},
            Err(e) => {
               self.fail(&e);
               break;
            },
         }
         if self.nonblocking.load(Ordering::Relaxed) {
            return Err(TransportError::WouldBlock);
         }
         self.wait_for_interrupt(seen, None)?;
         if self.is_closed() {
            return Err(TransportError::Closed);
         }
      }

      if consumed == 0 && r.cursor.is_none() && self.is_failed() {
         r.cursor = Some(ReadCursor::new(
            RecordSource::HardwareError,
            Record::from_slice(&HARDWARE_ERROR_RECORD),
         ));
         self.copy_out(r, buf, &mut consumed)?;
      }
      Ok(consumed)
   }

   /// Nothing the reader is allowed to consume right now.
   fn rx_idle(&self, r: &ReaderState) -> Result<bool> {
      if r.flow.both_paused() {
         // The sync helper has to look for the missing Connected event.
         return Ok(false);
      }
      Ok((r.flow.events_paused() || r.event.is_empty()?)
         && (r.flow.acl_paused() || r.acl_rx.is_empty()?)
         && r.acl_free.is_empty()?
         && r.iq_report.is_empty()?)
   }

   /// One pass over the RX rings in delivery order.
   fn service_rings<B: UserBuffer + ?Sized>(&self, r: &mut ReaderState, buf: &mut B, consumed: &mut usize) -> Result<()> {
      self.sync_paused_flows(r, buf, consumed)?;
      if r.cursor.is_some() {
         return Ok(());
      }
      self.scan_freed_buffers(r)?;
      self.read_credits(r, buf, consumed)?;
      self.read_events(r, buf, consumed)?;
      self.read_acl(r, buf, consumed)?;
      self.read_iq_reports(r, buf, consumed)
   }

   /// Copies as much of the staged record as fits and completes it.
   fn copy_out<B: UserBuffer + ?Sized>(&self, r: &mut ReaderState, buf: &mut B, consumed: &mut usize) -> Result<()> {
      let Some(cursor) = r.cursor.as_mut() else {
         return Ok(());
      };
      let n = cursor.remaining().min(buf.capacity() - *consumed);
      if n > 0 {
         buf.write_at(*consumed, &cursor.record[cursor.offset..cursor.offset + n])?;
      }
      cursor.offset += n;
      *consumed += n;
      if cursor.remaining() == 0 {
         let source = cursor.source;
         r.cursor = None;
         self.finish_record(r, source)?;
      }
      Ok(())
   }

   fn finish_record(&self, r: &mut ReaderState, source: RecordSource) -> Result<()> {
      trace!("Delivered {:?} record from {:?}", source, source.ring());
      match source {
         RecordSource::Event { in_order: true, .. } => {
            r.event.commit_read()?;
            r.events_advanced = true;
            bump(&self.counters.events, 1);
         },
         RecordSource::Event { in_order: false, .. } => {
            bump(&self.counters.events, 1);
            bump(&self.counters.out_of_order_events, 1);
         },
         RecordSource::AclRx { inspect_avdtp } => {
            if inspect_avdtp
               && let Some(td) = r.acl_rx.peek_read()?
               && let Some(note) = self.detector.inspect(td.connection_handle, &td.data, false)
            {
               self.notify_firmware(note);
            }
            r.acl_rx.commit_read()?;
            r.advanced = true;
            bump(&self.counters.acl_rx, 1);
         },
         RecordSource::Credits => {},
         RecordSource::IqReport => {
            r.iq_report.commit_read()?;
            r.advanced = true;
            bump(&self.counters.iq_reports, 1);
         },
         RecordSource::HardwareError => {
            self.hw_error_delivered.store(true, Ordering::Release);
            info!("Hardware error delivered, session stopped");
         },
      }
      Ok(())
   }

   /// Returns buffers named in newly published AclFree records to the pool
   /// so writers can reuse them before the credits are reported.
   fn scan_freed_buffers(&self, r: &mut ReaderState) -> Result<()> {
      let usage = r.acl_free.usage()?;
      if r.free_scanned >= usage {
         return Ok(());
      }
      let mut pool = self.pool.lock();
      for offset in r.free_scanned..usage {
         if let Some((_, td)) = r.acl_free.peek_at(offset)? {
            pool.free(td.buffer_index);
         }
      }
      r.free_scanned = usage;
      Ok(())
   }

   fn read_credits<B: UserBuffer + ?Sized>(&self, r: &mut ReaderState, buf: &mut B, consumed: &mut usize) -> Result<()> {
      if r.cursor.is_some() || *consumed == buf.capacity() {
         return Ok(());
      }
      let mut report = CreditReport::default();
      {
         let connections = self.connections.lock();
         while let Some(&td) = r.acl_free.peek_read()? {
            let handle = td.connection_handle & HANDLE_MASK;
            let active = connections
               .get(handle)
               .is_ok_and(|info| info.state == ConnectionState::Active);
            if active {
               if !report.can_add(handle) {
                  break;
               }
               report.add(handle);
            } else {
               warn!("Dropping credit for inactive handle 0x{handle:04x}");
               bump(&self.counters.credits_dropped, 1);
            }
            if r.free_scanned == 0 {
               self.pool.lock().free(td.buffer_index);
            } else {
               r.free_scanned -= 1;
            }
            r.acl_free.commit_read()?;
            r.advanced = true;
         }
      }
      if report.is_empty() {
         return Ok(());
      }
      bump(&self.counters.credits, report.total() as u64);
      debug!("Reporting {} credits for {} handles", report.total(), report.entries().len());
      r.cursor = Some(ReadCursor::new(RecordSource::Credits, report.to_record()));
      self.copy_out(r, buf, consumed)
   }

   fn read_events<B: UserBuffer + ?Sized>(&self, r: &mut ReaderState, buf: &mut B, consumed: &mut usize) -> Result<()> {
      while r.cursor.is_none() && *consumed < buf.capacity() && !r.flow.events_paused() {
         let Some((slot, td)) = r.event.peek_at(0)? else {
            break;
         };
         if r.flow.take_processed(slot) {
            r.event.commit_read()?;
            r.events_advanced = true;
            continue;
         }

         let handle = td.connection_handle;
         match td.kind {
            EventKind::Connected => {
               self.connections.lock().connect(handle)?;
               r.flow.resume_acl();
               debug!("Handle 0x{handle:04x} connected");
            },
            EventKind::Disconnected => {
               self.detector.reset_connection_handle(handle);
               let mut connections = self.connections.lock();
               if connections.state(handle)? == ConnectionState::Active {
                  // ACL data for the handle is still in flight.
                  r.flow.pause_events(handle);
                  break;
               }
               connections.reset(handle)?;
               debug!("Handle 0x{handle:04x} disconnected");
            },
            EventKind::IqReportEnabled => r.iq_enabled = true,
            EventKind::IqReportDisabled => r.iq_enabled = false,
            EventKind::None => {},
         }
         let record = event_record(td)?;
         r.cursor = Some(ReadCursor::new(RecordSource::Event { slot, in_order: true }, record));
         self.copy_out(r, buf, consumed)?;
      }
      Ok(())
   }

   fn read_acl<B: UserBuffer + ?Sized>(&self, r: &mut ReaderState, buf: &mut B, consumed: &mut usize) -> Result<()> {
      while r.cursor.is_none() && *consumed < buf.capacity() && !r.flow.acl_paused() {
         let Some(td) = r.acl_rx.peek_read()? else {
            break;
         };
         let handle = td.connection_handle;

         if handle & RAW_HANDLE_MASK == RAW_HANDLE_VALUE {
            let record = acl_record(td);
            r.cursor = Some(ReadCursor::new(RecordSource::AclRx { inspect_avdtp: false }, record));
            self.copy_out(r, buf, consumed)?;
            continue;
         }

         let mut connections = self.connections.lock();
         match connections.state(handle)? {
            ConnectionState::Active if td.disconnected => {
               connections.mark_disconnected(handle)?;
               drop(connections);
               r.flow.resume_events();
               r.acl_rx.commit_read()?;
               r.advanced = true;
               debug!("Last ACL record for handle 0x{handle:04x}");
            },
            ConnectionState::Active => {
               let boundary = PacketBoundary::from_bits(td.packet_boundary);
               connections.check_rx(handle, boundary, &td.data)?;
               drop(connections);
               let record = acl_record(td);
               let source = RecordSource::AclRx {
                  inspect_avdtp: boundary == PacketBoundary::StartFlush,
               };
               r.cursor = Some(ReadCursor::new(source, record));
               self.copy_out(r, buf, consumed)?;
            },
            ConnectionState::None => {
               // Connected event for this handle not delivered yet.
               r.flow.pause_acl(handle);
               break;
            },
            ConnectionState::Disconnected => {
               return Err(Violation::DataAfterDisconnect { handle }.into());
            },
         }
      }
      Ok(())
   }

   fn read_iq_reports<B: UserBuffer + ?Sized>(&self, r: &mut ReaderState, buf: &mut B, consumed: &mut usize) -> Result<()> {
      while r.cursor.is_none() && *consumed < buf.capacity() {
         let Some(td) = r.iq_report.peek_read()? else {
            break;
         };
         if !r.iq_enabled {
            r.iq_report.commit_read()?;
            r.advanced = true;
            bump(&self.counters.iq_dropped, 1);
            continue;
         }
         let record = iq_report_record(td);
         r.cursor = Some(ReadCursor::new(RecordSource::IqReport, record));
         self.copy_out(r, buf, consumed)?;
      }
      Ok(())
   }

   /// Breaks the deadlock where events wait on a Disconnected while the ACL
   /// ring waits on a Connected that sits further down the event ring.
   fn sync_paused_flows<B: UserBuffer + ?Sized>(
      &self,
      r: &mut ReaderState,
      buf: &mut B,
      consumed: &mut usize,
   ) -> Result<()> {
      if !r.flow.both_paused() || r.cursor.is_some() {
         return Ok(());
      }
      let Some(head) = r.acl_rx.peek_read()? else {
         return Ok(());
      };
      let handle = head.connection_handle;
      let deadline = Instant::now() + self.sync_timeout;
      let mut offset = 0;

      loop {
         let seen = self.wake_generation();
         while let Some((slot, td)) = r.event.peek_at(offset)? {
            offset += 1;
            if td.kind != EventKind::Connected || td.connection_handle != handle || r.flow.is_processed(slot) {
               continue;
            }
            let record = event_record(td)?;
            self.connections.lock().connect(handle)?;
            r.flow.resume_acl();
            r.flow.mark_processed(slot);
            info!("Delivering Connected for handle 0x{handle:04x} out of order (slot {slot})");
            r.cursor = Some(ReadCursor::new(RecordSource::Event { slot, in_order: false }, record));
            return self.copy_out(r, buf, consumed);
         }

         self.check_panic();
         if self.is_failed() {
            return Ok(());
         }
         if !self.wait_for_interrupt(seen, Some(deadline))? {
            return Err(
               Violation::SyncTimeout {
                  handle,
                  timeout_ms: self.sync_timeout.as_millis() as u64,
               }
               .into(),
            );
         }
      }
   }

   /// Consumes H4 packets from `data`.
   ///
   /// Returns the number of bytes accepted. When a ring is full the bytes of
   /// the blocked packet are not counted, so a short count means "retry the
   /// rest later"; a packet whose header is still incomplete is buffered.
   pub fn write<D: UserData + ?Sized>(&self, data: &D) -> Result<usize> {
      if self.is_closed() {
         return Err(TransportError::Closed);
      }
      self.check_panic();
      if self.is_failed() {
         return Err(TransportError::Io);
      }
      let mut writer = self.writer.try_lock().ok_or(TransportError::Busy)?;
      let result = self.write_locked(&mut writer, data);
      if std::mem::take(&mut writer.published) {
         self.doorbell.ring(self.sources.to_background);
      }
      if let Ok(n) = result {
         bump(&self.counters.bytes_written, n as u64);
      }
      self.latch(result)
   }

   fn write_locked<D: UserData + ?Sized>(&self, w: &mut WriterState, data: &D) -> Result<usize> {
      let total = data.size();
      let mut consumed = 0;
      let mut chunk = [0u8; WRITE_CHUNK];

      while consumed < total {
         let n = (total - consumed).min(WRITE_CHUNK);
         if let Err(e) = data.read_at(consumed, &mut chunk[..n]) {
            return if consumed > 0 { Ok(consumed) } else { Err(e) };
         }
         let (taken, complete) = w.assembler.feed(&chunk[..n])?;
         if complete {
            match self.dispatch(w) {
               Ok(()) => w.assembler.clear(),
               Err(TransportError::NoRoom(ring)) => {
                  debug!("{ring} ring full, deferring packet");
                  w.assembler.unfeed(taken);
                  return Ok(consumed);
               },
               Err(e) => return Err(e),
            }
         }
         consumed += taken;
      }
      Ok(consumed)
   }

   fn dispatch(&self, w: &mut WriterState) -> Result<()> {
      let frame = w.assembler.frame();
      trace!("TX {}", hex::encode(frame));
      match w.assembler.packet_type() {
         Some(PacketType::Command) => {
            let td = w.command.reserve_write()?;
            td.data.clear();
            td.data
               .extend_from_slice(&frame[1..])
               .map_err(|()| Violation::CommandTooLong {
                  length: frame.len() - 1,
                  max: CMD_EVT_BUFFER_SIZE,
               })?;
            w.command.commit_write();
            w.published = true;
            bump(&self.counters.commands, 1);
            Ok(())
         },
         Some(PacketType::Acl) => self.dispatch_acl(w),
         _ => Err(
            Violation::UnknownPacketType {
               packet_type: frame.first().copied().unwrap_or_default(),
            }
            .into(),
         ),
      }
   }

   fn dispatch_acl(&self, w: &mut WriterState) -> Result<()> {
      let frame = &w.assembler.frame()[1..];
      let hdr = AclHeader::from_bytes(frame).ok_or(Violation::MissingL2capHeader { length: frame.len() })?;
      let payload = &frame[H4_ACL_HEADER - 1..];

      // Back-pressure before any per-handle state changes.
      if w.acl_tx.space()? == 0 {
         return Err(TransportError::NoRoom(RingKind::AclTx));
      }
      let tag = self.connections.lock().tag_tx(&hdr, payload)?;
      let buffer_index = self.pool.lock().allocate()?;

      if hdr.boundary().is_start()
         && let Some(note) = self.detector.inspect(hdr.handle, payload, true)
      {
         self.notify_firmware(note);
      }

      let td = w.acl_tx.reserve_write()?;
      td.buffer_index = buffer_index;
      td.flags = tag.flags;
      td.connection_handle = hdr.handle;
      td.l2cap_cid = tag.l2cap_cid;
      td.data.clear();
      td.data
         .extend_from_slice(payload)
         .map_err(|()| Violation::AclTooLong {
            length: payload.len(),
            max: ACL_PACKET_SIZE,
         })?;
      w.acl_tx.commit_write();
      w.published = true;
      bump(&self.counters.acl_tx, 1);
      Ok(())
   }

   /// Tells the firmware about an AVDTP stream change.
   fn notify_firmware(&self, note: AvdtpNotification) {
      info!(
         "AVDTP handle 0x{:04x} cid 0x{:04x} sink={} open={}",
         note.connection_handle, note.l2cap_cid, note.sink, note.open
      );
      if self.header.has_avdtp_ring() {
         match self.avdtp_ring.lock().push(note.to_descriptor()) {
            Ok(()) => bump(&self.counters.avdtp_notifications, 1),
            Err(TransportError::NoRoom(_)) => {
               warn!("AVDTP ring full, dropping notification for handle 0x{:04x}", note.connection_handle);
               bump(&self.counters.avdtp_dropped, 1);
               return;
            },
            Err(e) => {
               self.fail(&e);
               return;
            },
         }
      } else {
         let word = note.legacy_stream_id(self.header.avdtp_stream_id());
         self.header.set_avdtp_stream_id(word);
         bump(&self.counters.avdtp_notifications, 1);
      }
      self.doorbell.ring(self.sources.to_background);
   }

   /// Readiness without blocking. While another caller holds the reader or
   /// writer, the corresponding direction reports not ready.
   pub fn poll(&self) -> PollStatus {
      self.check_panic();
      let failed = self.is_failed();
      let stopped = self.is_closed() || self.hw_error_delivered.load(Ordering::Acquire);

      let readable = !stopped
         && (failed
            || self
               .reader
               .try_lock()
               .is_some_and(|r| r.cursor.is_some() || !matches!(self.rx_idle(&r), Ok(true))));
      let writable = !stopped
         && !failed
         && self
            .writer
            .try_lock()
            .is_some_and(|w| w.command.space().is_ok_and(|n| n > 0) && w.acl_tx.space().is_ok_and(|n| n > 0));

      PollStatus {
         readable,
         writable,
         error: failed,
      }
   }

   pub fn stats(&self) -> TransportStats {
      let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
      let c = &self.counters;
      let fragment_anomalies = self.connections.lock().anomalies();
      let pool = self.pool.lock();
      TransportStats {
         interrupts: load(&c.interrupts),
         events_delivered: load(&c.events),
         out_of_order_events: load(&c.out_of_order_events),
         acl_delivered: load(&c.acl_rx),
         iq_reports_delivered: load(&c.iq_reports),
         iq_reports_dropped: load(&c.iq_dropped),
         credits_returned: load(&c.credits),
         credits_dropped: load(&c.credits_dropped),
         commands_sent: load(&c.commands),
         acl_sent: load(&c.acl_tx),
         bytes_read: load(&c.bytes_read),
         bytes_written: load(&c.bytes_written),
         avdtp_notifications: load(&c.avdtp_notifications),
         avdtp_dropped: load(&c.avdtp_dropped),
         fragment_anomalies,
         buffers_allocated: pool.allocated_count(),
         buffers_freed: pool.freed_count(),
         buffers_in_flight: pool.in_flight(),
         failed: self.is_failed(),
      }
   }
}

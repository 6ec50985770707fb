//! Single-producer/single-consumer transfer ring.
//!
//! A ring of `N` fixed descriptors with a write index owned by the producer
//! and a read index owned by the consumer. One slot is always left empty so
//! that `write == read` means empty, giving `usage = (write - read) mod N`
//! and `space = N - 1 - usage`.
//!
//! The producer fills the slot at its write index and only then publishes
//! the advanced index with `Release`; the consumer observes it with
//! `Acquire`. Indices coming from the other side are range-checked on every
//! observation, an out-of-range value is reported as `OutOfBounds`.

use std::{
   cell::UnsafeCell,
   sync::{
      Arc,
      atomic::{AtomicU32, Ordering},
   },
};

use crossbeam::utils::CachePadded;

use crate::{
   error::{Result, TransportError},
   mailbox::RingKind,
};

struct RingShared<T> {
   write: CachePadded<AtomicU32>,
   read: CachePadded<AtomicU32>,
   kind: RingKind,
   slots: Box<[UnsafeCell<T>]>,
}

// SAFETY: slots are only touched through the unique Producer (slot at the
// write index, never visible to the consumer) and the unique Consumer (slots
// in [read, write), never written by the producer). The index handoff is
// ordered by the Release store / Acquire load pair.
unsafe impl<T: Send> Sync for RingShared<T> {}

impl<T> RingShared<T> {
   #[inline]
   fn capacity(&self) -> u32 {
      self.slots.len() as u32
   }

   fn observe(&self, index: &AtomicU32) -> Result<u32> {
      let value = index.load(Ordering::Acquire);
      if value >= self.capacity() {
         return Err(TransportError::OutOfBounds {
            ring: self.kind,
            index: value,
            capacity: self.capacity(),
         });
      }
      Ok(value)
   }

   #[inline]
   fn usage(&self, write: u32, read: u32) -> usize {
      ((write + self.capacity() - read) % self.capacity()) as usize
   }
}

/// Creates a ring of `capacity` default-initialized descriptors.
pub fn transfer_ring<T: Default>(kind: RingKind, capacity: usize) -> Result<(Producer<T>, Consumer<T>)> {
   if capacity < 2 || u32::try_from(capacity).is_err() {
      return Err(TransportError::InvalidConfig("transfer ring needs between 2 and u32::MAX slots"));
   }
   let slots = (0..capacity).map(|_| UnsafeCell::new(T::default())).collect();
   let ring = Arc::new(RingShared {
      write: CachePadded::new(AtomicU32::new(0)),
      read: CachePadded::new(AtomicU32::new(0)),
      kind,
      slots,
   });
   Ok((
      Producer {
         ring: ring.clone(),
         write: 0,
         reserved: false,
      },
      Consumer { ring, read: 0 },
   ))
}

/// Writing half of a transfer ring.
pub struct Producer<T> {
   ring: Arc<RingShared<T>>,
   write: u32,
   reserved: bool,
}

impl<T> Producer<T> {
   pub fn kind(&self) -> RingKind {
      self.ring.kind
   }

   pub fn capacity(&self) -> usize {
      self.ring.slots.len()
   }

   /// Published records not yet consumed by the peer.
   pub fn usage(&self) -> Result<usize> {
      let read = self.ring.observe(&self.ring.read)?;
      Ok(self.ring.usage(self.write, read))
   }

   pub fn space(&self) -> Result<usize> {
      Ok(self.capacity() - 1 - self.usage()?)
   }

   /// Returns the slot at the write index for the caller to fill.
   ///
   /// Nothing becomes visible to the consumer until [`commit_write`].
   ///
   /// [`commit_write`]: Producer::commit_write
   pub fn reserve_write(&mut self) -> Result<&mut T> {
      if self.space()? == 0 {
         return Err(TransportError::NoRoom(self.ring.kind));
      }
      self.reserved = true;
      // SAFETY: space > 0 so the slot at `write` lies outside the consumer's
      // [read, write) window, and `&mut self` makes this the only producer borrow.
      Ok(unsafe { &mut *self.ring.slots[self.write as usize].get() })
   }

   /// Publishes the reserved slot.
   pub fn commit_write(&mut self) {
      debug_assert!(self.reserved, "commit_write without reserve_write");
      if !self.reserved {
         return;
      }
      self.reserved = false;
      self.write = (self.write + 1) % self.ring.capacity();
      self.ring.write.store(self.write, Ordering::Release);
   }

   /// Reserves, fills and commits in one step.
   pub fn push(&mut self, value: T) -> Result<()> {
      *self.reserve_write()? = value;
      self.commit_write();
      Ok(())
   }

   /// Index of the next slot to be written.
   pub fn write_index(&self) -> u32 {
      self.write
   }

   /// Publishes an arbitrary write index, for exercising the consumer's
   /// bounds checks against a misbehaving peer.
   pub fn publish_raw_index(&self, index: u32) {
      self.ring.write.store(index, Ordering::Release);
   }
}

/// Reading half of a transfer ring.
pub struct Consumer<T> {
   ring: Arc<RingShared<T>>,
   read: u32,
}

impl<T> Consumer<T> {
   pub fn kind(&self) -> RingKind {
      self.ring.kind
   }

   pub fn capacity(&self) -> usize {
      self.ring.slots.len()
   }

   /// Records published by the peer and not yet consumed.
   pub fn usage(&self) -> Result<usize> {
      let write = self.ring.observe(&self.ring.write)?;
      Ok(self.ring.usage(write, self.read))
   }

   pub fn is_empty(&self) -> Result<bool> {
      Ok(self.usage()? == 0)
   }

   /// Index of the next slot to be consumed.
   pub fn read_index(&self) -> u32 {
      self.read
   }

   /// Returns the oldest unread record.
   pub fn peek_read(&self) -> Result<Option<&T>> {
      Ok(self.peek_at(0)?.map(|(_, td)| td))
   }

   /// Returns the `offset`-th unread record together with its slot index,
   /// without consuming anything.
   pub fn peek_at(&self, offset: usize) -> Result<Option<(u32, &T)>> {
      if offset >= self.usage()? {
         return Ok(None);
      }
      let slot = (self.read + offset as u32) % self.ring.capacity();
      // SAFETY: the slot lies in the published [read, write) window which the
      // producer never touches until the read index moves past it, and moving
      // it requires `&mut self`, ending this borrow.
      Ok(Some((slot, unsafe { &*self.ring.slots[slot as usize].get() })))
   }

   /// Releases the oldest unread record back to the producer.
   pub fn commit_read(&mut self) -> Result<()> {
      if self.usage()? == 0 {
         return Ok(());
      }
      self.read = (self.read + 1) % self.ring.capacity();
      self.ring.read.store(self.read, Ordering::Release);
      Ok(())
   }
}

#[cfg(test)]
mod tests {
   use rand::Rng;

   use super::*;

   #[test]
   fn test_empty_and_full() -> Result<()> {
      let (mut tx, mut rx) = transfer_ring::<u32>(RingKind::Command, 4)?;
      assert_eq!(rx.usage()?, 0);
      assert!(rx.peek_read()?.is_none());
      assert_eq!(tx.space()?, 3);

      for i in 0..3 {
         tx.push(i)?;
      }
      assert_eq!(tx.space()?, 0);
      assert!(matches!(
         tx.reserve_write(),
         Err(TransportError::NoRoom(RingKind::Command))
      ));

      assert_eq!(rx.peek_read()?, Some(&0));
      rx.commit_read()?;
      assert_eq!(tx.space()?, 1);
      tx.push(3)?;

      let mut seen = Vec::new();
      while let Some(&v) = rx.peek_read()? {
         seen.push(v);
         rx.commit_read()?;
      }
      assert_eq!(seen, vec![1, 2, 3]);
      Ok(())
   }

   #[test]
   fn test_reserve_is_invisible_until_commit() -> Result<()> {
      let (mut tx, rx) = transfer_ring::<u32>(RingKind::AclTx, 3)?;
      *tx.reserve_write()? = 7;
      assert_eq!(rx.usage()?, 0);
      tx.commit_write();
      assert_eq!(rx.peek_read()?, Some(&7));
      Ok(())
   }

   #[test]
   fn test_peek_at_reports_slot_indices_across_wrap() -> Result<()> {
      let (mut tx, mut rx) = transfer_ring::<u32>(RingKind::Event, 5)?;
      for i in 0..4 {
         tx.push(i)?;
      }
      rx.commit_read()?;
      rx.commit_read()?;
      tx.push(4)?;
      tx.push(5)?;

      assert_eq!(rx.peek_at(0)?, Some((2, &2)));
      assert_eq!(rx.peek_at(2)?, Some((4, &4)));
      assert_eq!(rx.peek_at(3)?, Some((0, &5)));
      assert_eq!(rx.peek_at(4)?, None);
      Ok(())
   }

   #[test]
   fn test_peer_index_out_of_bounds() {
      let (tx, rx) = transfer_ring::<u32>(RingKind::AclRx, 8).unwrap();
      tx.publish_raw_index(8);
      let err = rx.usage().unwrap_err();
      assert!(err.is_fatal());
      assert!(matches!(
         err,
         TransportError::OutOfBounds {
            ring: RingKind::AclRx,
            index: 8,
            capacity: 8
         }
      ));
   }

   #[test]
   fn test_usage_space_invariant_random_ops() -> Result<()> {
      let mut rng = rand::thread_rng();
      for capacity in [2usize, 3, 7, 8, 32] {
         let (mut tx, mut rx) = transfer_ring::<usize>(RingKind::AclFree, capacity)?;
         let mut produced = 0usize;
         let mut consumed = 0usize;

         for _ in 0..500 {
            if rng.gen_bool(0.55) {
               match tx.push(produced) {
                  Ok(()) => produced += 1,
                  Err(TransportError::NoRoom(_)) => assert_eq!(produced - consumed, capacity - 1),
                  Err(e) => return Err(e),
               }
            } else if let Some(&v) = rx.peek_read()? {
               assert_eq!(v, consumed);
               rx.commit_read()?;
               consumed += 1;
            }

            let usage = rx.usage()?;
            assert_eq!(usage, produced - consumed);
            assert!(usage <= capacity - 1);
            assert_eq!(tx.space()?, capacity - 1 - usage);
         }
      }
      Ok(())
   }

   #[test]
   fn test_cross_thread_handoff() {
      let (mut tx, mut rx) = transfer_ring::<u64>(RingKind::AclRx, 8).unwrap();
      let producer = std::thread::spawn(move || {
         let mut next = 0u64;
         while next < 10_000 {
            if tx.push(next).is_ok() {
               next += 1;
            } else {
               std::thread::yield_now();
            }
         }
      });

      let mut expected = 0u64;
      while expected < 10_000 {
         match rx.peek_read().unwrap() {
            Some(&v) => {
               assert_eq!(v, expected);
               rx.commit_read().unwrap();
               expected += 1;
            },
            None => std::thread::yield_now(),
         }
      }
      producer.join().unwrap();
   }

   #[test]
   fn test_degenerate_capacity_rejected() {
      for capacity in [0, 1] {
         assert!(matches!(
            transfer_ring::<u32>(RingKind::Command, capacity),
            Err(TransportError::InvalidConfig(_))
         ));
      }
   }
}

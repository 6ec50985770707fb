//! ACL transmit buffer allocator.
//!
//! Round-robin over a fixed pool: every allocation starts searching just
//! after the previously allocated slot, so a buffer the firmware has just
//! returned is the last one to be handed out again.

use log::{trace, warn};

use crate::error::{Result, TransportError};

#[derive(Debug)]
pub struct AclBufferPool {
   used: Vec<bool>,
   last_allocated: usize,
   allocated_count: u64,
   freed_count: u64,
}

impl AclBufferPool {
   pub fn new(size: usize) -> Self {
      Self {
         used: vec![false; size],
         // The first allocation lands on index 0.
         last_allocated: size - 1,
         allocated_count: 0,
         freed_count: 0,
      }
   }

   pub fn size(&self) -> usize {
      self.used.len()
   }

   /// Claims the next free buffer after the last allocated one.
   pub fn allocate(&mut self) -> Result<u8> {
      let size = self.size();
      let index = (1..=size)
         .map(|step| (self.last_allocated + step) % size)
         .find(|&i| !self.used[i])
         .ok_or(TransportError::NoBuffer)?;

      self.used[index] = true;
      self.last_allocated = index;
      self.allocated_count += 1;
      trace!("ACL buffer {index} allocated, {} in flight", self.in_flight());
      Ok(index as u8)
   }

   /// Returns a buffer to the pool.
   ///
   /// Indices outside the pool and buffers that are not allocated are
   /// ignored with a warning.
   pub fn free(&mut self, index: u8) {
      let index = index as usize;
      match self.used.get_mut(index) {
         Some(slot) if *slot => {
            *slot = false;
            self.freed_count += 1;
         },
         Some(_) => warn!("ACL buffer {index} freed while not allocated"),
         None => warn!("ACL buffer index {index} out of range (pool of {})", self.size()),
      }
   }

   pub fn in_flight(&self) -> u64 {
      self.allocated_count - self.freed_count
   }

   /// Buffers that can still be allocated.
   pub fn credits(&self) -> usize {
      self.size() - self.in_flight() as usize
   }

   pub fn allocated_count(&self) -> u64 {
      self.allocated_count
   }

   pub fn freed_count(&self) -> u64 {
      self.freed_count
   }
}

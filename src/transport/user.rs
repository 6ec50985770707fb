//! Caller buffers for the byte-stream interface.
//!
//! Reads and writes go through these traits so that buffers which can fault
//! part way (memory owned by another address space, mapped files) report a
//! `CopyFault` instead of aborting the session.

use crate::error::{Result, TransportError};

/// Destination of a read.
pub trait UserBuffer {
   fn capacity(&self) -> usize;

   /// Copies `src` into the buffer at `offset`.
   fn write_at(&mut self, offset: usize, src: &[u8]) -> Result<()>;
}

/// Source of a write.
pub trait UserData {
   fn size(&self) -> usize;

   /// Fills `dst` from the data starting at `offset`.
   fn read_at(&self, offset: usize, dst: &mut [u8]) -> Result<()>;
}

impl UserBuffer for [u8] {
   fn capacity(&self) -> usize {
      self.len()
   }

   fn write_at(&mut self, offset: usize, src: &[u8]) -> Result<()> {
      self
         .get_mut(offset..offset + src.len())
         .ok_or(TransportError::CopyFault { offset })?
         .copy_from_slice(src);
      Ok(())
   }
}

impl UserData for [u8] {
   fn size(&self) -> usize {
      self.len()
   }

   fn read_at(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
      dst.copy_from_slice(
         self
            .get(offset..offset + dst.len())
            .ok_or(TransportError::CopyFault { offset })?,
      );
      Ok(())
   }
}

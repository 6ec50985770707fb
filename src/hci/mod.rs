//! HCI packet handling on the byte-stream side of the transport.
//!
//! This module contains the H4 wire definitions and the conversion between
//! H4 byte streams and ring descriptors.

pub mod framing;
pub mod protocol;

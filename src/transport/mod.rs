//! Host-side transport over the mailbox rings.
//!
//! This module contains the per-session bookkeeping (buffer pool, connection
//! table, flow control) and the [`session::Session`] that exposes it all as
//! an H4 byte stream.

pub mod allocator;
pub mod connection;
pub mod flow;
pub mod session;
pub mod user;

pub use session::{PollStatus, Session, TransportStats};
pub use user::{UserBuffer, UserData};

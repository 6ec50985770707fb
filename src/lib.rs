//! Shared-memory HCI transport.
//!
//! Moves HCI commands, events, ACL data and IQ reports between a host
//! Bluetooth stack and controller firmware through fixed-size transfer rings
//! in memory both sides can see. The host side is presented as an H4 byte
//! stream by [`Session`]; [`loopback::Firmware`] plays the firmware side.

pub mod avdtp;
pub mod config;
pub mod doorbell;
pub mod error;
pub mod hci;
pub mod loopback;
pub mod mailbox;
pub mod transport;

pub use config::Config;
pub use doorbell::{Doorbell, DoorbellHandle, InterruptSources};
pub use error::{Result, TransportError, Violation};
pub use mailbox::{FirmwarePort, HostPort, mailbox};
pub use transport::{PollStatus, Session, TransportStats};

//! AVDTP stream detection on ACL traffic.
//!
//! This module contains the L2CAP/AVDTP parsers and the per-link state
//! machine that reports media stream changes to the firmware.

pub mod detector;
pub mod signaling;

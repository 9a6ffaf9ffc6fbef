#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Wire protocol and command channels for HALO.
//!
//! The coordinator drives nodes over one-shot TCP exchanges: a single
//! status byte (optionally followed by a length-prefixed payload) down,
//! a single confirmation byte back. The same frames travel on the admin
//! port, the gossip port and the coordinator's failure-report port.

mod channel;
mod protocol;

pub use channel::{dispatch_command, send_report, ChannelConfig, CommandChannel};
pub use protocol::{AdminMessage, CommandKind, Confirmation, MAX_PAYLOAD};

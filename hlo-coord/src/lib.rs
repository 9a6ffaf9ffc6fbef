#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! The HALO coordinator.
//!
//! One coordinator process owns the cluster: it provisions nodes onto
//! configured slots, maintains the authoritative topology, repairs the
//! ring when nodes crash, and keeps every range replicated on its
//! owner plus two successors.

mod config;
mod coordinator;
mod dispatch;
mod failure;
mod inventory;
mod launch;

pub use config::{CoordinatorConfig, LaunchSettings, SlotConfig, TimingSettings};
pub use coordinator::Coordinator;
pub use dispatch::Dispatcher;
pub use failure::{run_crash_handler, run_failure_listener, ReportQueue};
pub use launch::{NodeLauncher, SshLauncher};

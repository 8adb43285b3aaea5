//! Close every inherited file descriptor a child process was not explicitly
//! given.
//!
//! Launch options declare the descriptors they need through [`CollectFds`].
//! Before duplicating, [`FdRestrict::prepare`] collects them into storage
//! reserved up front; in the child, [`FdRestrict::on_exec_setup`] collects
//! again without allocating and closes everything else below the descriptor
//! ceiling.

#![cfg(unix)]

pub mod child_report;
pub mod clone3;
#[cfg(target_os = "linux")]
pub mod close_range;
pub mod closer;
pub mod collector;
pub mod config;
pub mod contribute;
pub mod error;
pub mod fixed_buf_writer;
pub mod launch;
pub mod options;

pub use child_report::Errno;
pub use closer::{DescriptorTable, FdRestrict, Os, enforce};
pub use collector::{LaunchConfiguration, ProtectedSet, collect};
pub use config::{Ceiling, CloseStrategy, RestrictConfig};
pub use contribute::{CollectFds, FdSink, OutStream, OutTargets, Pass, StdStream};
pub use error::*;
pub use fixed_buf_writer::FixedBufferWriter;
pub use launch::*;
pub use options::*;

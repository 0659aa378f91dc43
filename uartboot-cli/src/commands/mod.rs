//! Command implementations.
//!
//! Each subcommand is implemented in its own module; [`operation`] holds the
//! event loop they share.

pub(crate) mod completions;
pub(crate) mod device;
pub(crate) mod flash;
pub(crate) mod operation;
pub(crate) mod ports;

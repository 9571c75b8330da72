//! Runtime wiring and the command handlers used by the binary.

pub mod commands;
pub mod context;
pub mod error;

//! Shared library for strongbox.
//! Includes config parsing, type definitions, the error taxonomy and the
//! launcher protocol spoken between the engine and its child processes.

pub mod config;
pub mod error;
pub mod paths;
pub mod protocol;
pub mod types;

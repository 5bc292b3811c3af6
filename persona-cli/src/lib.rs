//! Command handlers for `personactl`.
//!
//! Each handler returns a JSON report; the binary only parses arguments and
//! prints.

pub mod commands;

pub use commands::{describe_report, request, reseed, show, sign, verify};

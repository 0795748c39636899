//! Operator commands for the `dbpool` binary
//!
//! - `validate`: load and check a configuration, print a summary
//! - `simulate`: drive the full request path against in-memory stores and
//!   print the resulting statistics as JSON

pub mod commands;

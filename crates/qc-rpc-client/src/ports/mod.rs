//! Ports layer for the ledger client.
//!
//! The client core only talks to the outside world through these traits;
//! `crate::adapters` holds the network implementations.

pub mod outbound;

pub use outbound::*;

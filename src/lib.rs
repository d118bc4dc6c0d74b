//! apibus: an HTTP task bus in front of a research engine CLI.
//!
//! Hexagonal layout: domain model in [`domain`], port traits in [`ports`],
//! concrete implementations in [`adapters`]. [`queue`] ties the ports
//! together and [`cli`] wires everything into a server.

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod ports;
pub mod queue;

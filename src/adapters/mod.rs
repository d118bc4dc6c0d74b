//! Concrete adapter implementations for ports.

pub mod event_hub;
pub mod process_runner;
pub mod sqlite_store;
pub mod web;

//! AI Tasks: asynchronous analysis tasks over grouped streams.
//!
//! Submissions are stored as pending records, delivered over per-type
//! streams, and executed by registered workers that record their own
//! progress and outcome.

pub mod api;
pub mod app;
pub mod clients;
pub mod config;
pub mod error;
pub mod store;
pub mod tasks;
pub mod transport;
pub mod worker;
pub mod workers;

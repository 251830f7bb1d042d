//! Route traffic monitoring service.
//!
//! Watches a set of driving routes and, on each vehicle ignition, checks live
//! traffic on all of them, posts chat alerts for routes whose state flipped,
//! and sends a push summary for the routes the owner cares about.

pub mod alert;
pub mod balance;
pub mod config;
pub mod coordinates;
pub mod ignition;
pub mod ingest;
pub mod logging;
pub mod management;
pub mod maps;
pub mod model;
pub mod monitor;
pub mod notify;
pub mod store;
pub mod summary;

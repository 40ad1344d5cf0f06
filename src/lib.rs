//! Tails an HTTP access log, keeps rolling traffic statistics over several
//! windows and raises threshold alerts on the log's own timeline.

pub mod agent;
pub mod alert;
pub mod buckets;
pub mod clock;
pub mod config;
pub mod export;
pub mod reader;
pub mod stat;
pub mod watcher;

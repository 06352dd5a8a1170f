//! Library crate for scanwatch: live tracking of remote scan sessions over a push channel
//! and REST polling, with a notification store for the dashboard.
pub mod api;
pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod messages;
pub mod notices;
pub mod notifications;
pub mod poller;
pub mod ports;
pub mod server;
pub mod session;
pub mod ticker;
pub mod tracker;
pub mod types;

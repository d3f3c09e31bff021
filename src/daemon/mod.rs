//! Daemon module for the configuration databases
//!
//! The daemon runs as a separate process. A single core thread owns every
//! database, the listener registries and the saved-state log; the socket
//! front-end only decodes requests and hands them over.

pub mod client;
pub mod database;
pub mod event_loop;
pub mod listeners;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod socket_peer;
pub mod state_log;

//! Pinwatch - retail delivery-availability monitor.
//!
//! Polls a retail site's product listings on behalf of multiple independent
//! users, checks whether newly listed products can be delivered to each
//! user's postal codes, and emits a notification exactly once per
//! newly-deliverable product. The crate is the core: per-user state machines,
//! the proxy-rotated API client, deduplication and the fleet scheduler. A
//! chat front end embeds it through [`commands::CommandService`] and drains
//! the notification queue; the bundled binary runs the scheduler standalone.

pub mod auth;
pub mod commands;
pub mod config;
pub mod error;
pub mod monitor;
pub mod notify;
pub mod state;
pub mod store;
pub mod upstream;

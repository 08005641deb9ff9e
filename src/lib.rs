//! Flood Scout remote-control dashboard core
//!
//! Keeps a local mirror of the rescue boat state in sync with a remote
//! channel, dispatches operator commands to it and tracks saved missions.

pub mod auth;
pub mod channel;
pub mod config;
pub mod console;
pub mod dispatcher;
pub mod errors;
pub mod history;
pub mod models;
pub mod scheduler;
pub mod subscriptions;
pub mod view;

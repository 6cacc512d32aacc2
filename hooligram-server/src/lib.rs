//! Hooligram messaging server.
//!
//! Clients connect over WebSocket (or the optional JSON-lines TCP
//! transport), verify a phone number, form groups and exchange messages.
//! The moving parts:
//!
//! - [`registry`]: live connections and the identity each one carries
//! - [`connection`]: the per-connection read loop and the action handlers
//! - [`delivery`]: the single consumer that fans stored messages out to
//!   signed-in recipients
//! - [`db`] and [`sms`]: the storage and phone verification collaborators

pub mod config;
pub mod connection;
pub mod db;
pub mod delivery;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod sms;
pub mod web;

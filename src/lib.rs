#![deny(missing_docs)]
//! Conversational APK download broker.
//!
//! Chat messages are resolved against an application catalog, the matching
//! package is acquired (download API first, local tool second), `.xapk`
//! bundles are split into APK + OBB files, and everything is delivered back
//! into the conversation. Abuse protection and per-conversation sessions keep
//! one acquisition running per user at a time.

/// Two-tier artifact acquisition
pub mod acquire;
/// Conversation orchestration
pub mod broker;
/// XAPK bundle splitting
pub mod bundle;
/// Application catalog client
pub mod catalog;
/// Configuration
pub mod config;
/// Message formatting and sequencing
pub mod delivery;
/// Transport-neutral messaging types
pub mod gateway;
/// Abuse protection
pub mod guard;
/// Per-conversation sessions
pub mod session;
/// Persistent store
pub mod storage;
/// Telegram transport
pub mod telegram;
/// Shared helpers
pub mod utils;

#[cfg(test)]
pub mod testing;

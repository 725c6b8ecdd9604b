//! modhost - plugin lifecycle management for the modhost server.
//!
//! Covers the full plugin lifecycle around a running host: installing
//! extension modules through an external package-fetching tool, toggling
//! their enabled state in the persisted config document, and discovering,
//! validating, and loading the enabled ones at host startup.
//!
//! This library exposes the subsystem for both the CLI binary and
//! integration testing. Every mutating operation takes effect only after the
//! host server restarts; nothing here hot-loads code into a live process.

pub mod config;
pub mod loader;
pub mod plugins;

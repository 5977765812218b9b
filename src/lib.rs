#![deny(missing_docs)]

//! This crate manages a single connection to a serial device on the host machine.
//!
//! Devices may be listed, and one of them connected to at a time.
//! Whatever the device prints is split into lines and broadcast on a log feed.
//! Connects, disconnects, and faults are broadcast on a separate event feed.
//! Any number of observers may follow either feed, in process or over a websocket.
//!
//! A mock transport stands in for real serial ports,
//! which allows testing logic without the actual devices available.
//!
//! Firmware build options can be checked against a set of rules before use,
//! see [`validation`].

/// The actions that can be sent from a connecting user,
/// as well as the responses.
pub mod actions;

/// Code relating to setting up the server which sets up connections and spawns handlers for clients.
pub mod server;

/// The command line interface.
pub mod cli;

/// Handles incoming websockets.
pub(crate) mod websocket;

/// The actor spawned from a connected user.
pub(crate) mod peer;

/// In-memory devices standing in for serial ports.
pub mod mock;

/// Serial port driver.
pub mod serial;

/// Listing and opening devices, natively or mocked.
pub mod transport;

/// The session manager.
pub mod session;

/// Broadcasting device output and lifecycle events.
pub mod events;

/// Validation of firmware build options.
pub mod validation;

/// Relates to config files.
pub mod config;

/// Possible errors in this library.
pub mod error;

/// Logging/tracing setup.
pub mod logging;

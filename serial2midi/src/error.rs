//! Common error types for serial2midi.
//!
//! Every failure reported by a collaborating I/O layer (serial ports, port
//! enumeration, the MIDI subsystem) is converted into one of these variants at
//! the boundary where it enters the bridge, so callers can tell a transient
//! discovery problem from a broken connection.

use std::io;

use thiserror::Error;

/// Main error type for serial2midi operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A single port's metadata could not be inspected
    #[error("Discovery error on {port}: {reason}")]
    Discovery { port: String, reason: String },

    /// A match expression failed to compile or evaluate
    #[error("Predicate error: {0}")]
    Predicate(String),

    /// A serial device could not be opened
    #[error("Failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: tokio_serial::Error,
    },

    /// Reading from an open serial connection failed
    #[error("Serial read failed: {0}")]
    InboundIo(#[source] io::Error),

    /// Writing to an open serial connection failed
    #[error("Serial write failed: {0}")]
    OutboundIo(#[source] io::Error),

    /// Virtual MIDI port creation or delivery failed
    #[error("Virtual endpoint error: {0}")]
    VirtualEndpoint(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port errors
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

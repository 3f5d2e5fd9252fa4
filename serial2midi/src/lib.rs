//! Bridge between a serial device and a virtual MIDI device.
//!
//! Microcontrollers that speak MIDI over a USB serial port show up on the
//! host as plain serial devices. This crate finds such a device, opens it,
//! and forwards 3-byte MIDI messages in both directions between it and a
//! virtual MIDI input/output pair that other applications can use like any
//! hardware controller. Unplugging and replugging the device reconnects
//! automatically.

#[cfg(not(unix))]
compile_error!("serial2midi needs unix serial devices and virtual MIDI ports (ALSA or CoreMIDI)");

pub mod config;
pub mod device;
pub mod discovery;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod matcher;
pub mod pipeline;
pub mod supervisor;
pub mod tracing;
pub mod transport;

#[cfg(test)]
mod test_support;

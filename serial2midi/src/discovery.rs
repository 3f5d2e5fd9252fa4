//! Serial device discovery.
//!
//! Each pass enumerates the serial ports currently attached, inspects every
//! port on the blocking pool, and yields the ones the [`Matcher`] accepts.
//! Nothing is cached: every call to [`discover`] starts a fresh pass.
//!
//! A port whose inspection fails is skipped; a failure to enumerate at all
//! is logged and produces an empty pass. Neither aborts the caller.

use std::{io::Write, sync::Arc};

use futures::{
    future,
    stream::{self, Stream, StreamExt},
};
use tokio::task;

use crate::{
    device::DeviceDescriptor,
    error::{Error, Result},
    matcher::Matcher,
    tracing::prelude::*,
};

/// Upper bound on ports inspected at the same time.
const INSPECT_CONCURRENCY: usize = 8;

/// Source of serial ports.
///
/// Both methods may block; callers run them on the blocking pool.
pub trait PortEnumerator: Send + Sync + 'static {
    /// Platform handle for one enumerated port.
    type Port: Send + 'static;

    /// List attached ports in platform order.
    fn enumerate(&self) -> Result<Vec<Self::Port>>;

    /// Turn one port into a descriptor.
    fn inspect(&self, port: Self::Port) -> Result<DeviceDescriptor>;
}

/// Ports reported by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPorts;

impl PortEnumerator for SystemPorts {
    type Port = tokio_serial::SerialPortInfo;

    fn enumerate(&self) -> Result<Vec<Self::Port>> {
        Ok(tokio_serial::available_ports()?)
    }

    fn inspect(&self, port: Self::Port) -> Result<DeviceDescriptor> {
        // The device can vanish between enumeration and inspection.
        std::fs::metadata(&port.port_name).map_err(|e| Error::Discovery {
            port: port.port_name.clone(),
            reason: e.to_string(),
        })?;

        Ok(DeviceDescriptor::from(port))
    }
}

/// Lazily yield every attached device accepted by `matcher`.
///
/// Inspections run concurrently but results keep enumeration order, so
/// "first match" is stable within a pass.
pub fn discover<P>(ports: Arc<P>, matcher: Matcher) -> impl Stream<Item = DeviceDescriptor> + Send
where
    P: PortEnumerator,
{
    let listing = {
        let ports = ports.clone();
        async move {
            match task::spawn_blocking(move || ports.enumerate()).await {
                Ok(Ok(found)) => {
                    trace!(count = found.len(), "Enumerated serial ports.");
                    found
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "Failed to enumerate serial ports.");
                    Vec::new()
                }
                Err(e) => {
                    error!(error = %e, "Serial port enumeration task failed.");
                    Vec::new()
                }
            }
        }
    };

    stream::once(listing)
        .flat_map(stream::iter)
        .map(move |port| {
            let ports = ports.clone();
            task::spawn_blocking(move || ports.inspect(port))
        })
        .buffered(INSPECT_CONCURRENCY)
        .filter_map(move |inspected| {
            let device = match inspected {
                Ok(Ok(device)) => matcher.matches(&device).then_some(device),
                Ok(Err(e)) => {
                    debug!(error = %e, "Skipping serial port.");
                    None
                }
                Err(e) => {
                    error!(error = %e, "Serial port inspection task failed.");
                    None
                }
            };
            future::ready(device)
        })
}

/// Run one discovery pass and print each match to `out`.
///
/// Text output is one `key: value` block per device followed by a blank
/// line; JSON output is one object per line.
pub async fn list_devices<P, W>(ports: Arc<P>, matcher: Matcher, json: bool, out: &mut W) -> Result<usize>
where
    P: PortEnumerator,
    W: Write,
{
    let devices = discover(ports, matcher);
    futures::pin_mut!(devices);

    let mut count = 0;
    while let Some(device) = devices.next().await {
        if json {
            let line = serde_json::to_string(&device)
                .map_err(|e| Error::Io(std::io::Error::other(e)))?;
            writeln!(out, "{}", line)?;
        } else {
            writeln!(out, "{}", device)?;
        }
        count += 1;
    }
    Ok(count)
}

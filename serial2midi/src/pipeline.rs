//! Bidirectional frame forwarding for one connection.
//!
//! Two tasks run for the lifetime of a connection:
//!
//! - the inbound task owns the read half of the serial stream, reads frames
//!   with a bounded timeout so it notices cancellation promptly, and sends
//!   each frame to the virtual output;
//! - the outbound task owns the write half and drains the channel the
//!   [`OutboundRoute`] feeds from the virtual input callback.
//!
//! Neither half is shared, so reads and writes never contend for a lock. On
//! shutdown the inbound task is awaited first, then the route is detached so
//! no new write can be queued, then the outbound task is awaited, and only
//! then are the halves rejoined for the supervisor to close. A write still
//! pending when the connection is cancelled is abandoned, so a device that
//! stops draining can't hold up shutdown.
//!
//! Failure policy: a read error ends this connection only (the supervisor
//! reconnects), while a write error stops the whole bridge.

use std::{sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use tokio::{sync::mpsc, task::JoinHandle, time::{self, Instant}};
use tokio_util::sync::CancellationToken;

use crate::{
    endpoint::{OutboundRoute, VirtualOutput},
    error::{Error, Result},
    frame::Frame,
    supervisor::{StopHandle, StopReason},
    tracing::prelude::*,
    transport::{FrameReader, FrameWriter, TransportConnection},
};

/// Longest a single read blocks before re-checking for cancellation.
pub const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Direction tag for frames read from serial.
pub const SERIAL_TO_VIRTUAL: &str = "serial-to-virtual";

/// Direction tag for frames written to serial.
pub const VIRTUAL_TO_SERIAL: &str = "virtual-to-serial";

/// Signals shared between a pipeline and its supervisor.
#[derive(Clone)]
pub struct PipelineSignals {
    /// Cancelled when this connection should end.
    pub connection: CancellationToken,
    /// Stops the entire bridge.
    pub stop: StopHandle,
    /// Reference point for forwarding timestamps.
    pub started: Instant,
}

/// Running forwarding tasks for one connection.
pub struct ForwardingPipeline {
    connection: TransportConnection,
    inbound: JoinHandle<FrameReader>,
    outbound: JoinHandle<FrameWriter>,
    route: OutboundRoute,
}

impl ForwardingPipeline {
    /// Split `connection` and start both forwarding tasks.
    pub fn start(
        mut connection: TransportConnection,
        output: Arc<dyn VirtualOutput>,
        route: OutboundRoute,
        signals: PipelineSignals,
    ) -> Result<Self> {
        let (reader, writer) = connection.split()?;
        let outbound_rx = route.attach();

        let inbound = tokio::spawn(inbound_task(reader, output, signals.clone()));
        let outbound = tokio::spawn(outbound_task(writer, outbound_rx, signals));

        Ok(Self {
            connection,
            inbound,
            outbound,
            route,
        })
    }

    /// Wait for both tasks to finish and hand back the connection.
    ///
    /// The caller must have cancelled the connection token first.
    pub async fn shutdown(self) -> TransportConnection {
        let Self {
            mut connection,
            inbound,
            outbound,
            route,
        } = self;

        let reader = inbound.await;
        route.detach();
        let writer = outbound.await;

        match (reader, writer) {
            (Ok(reader), Ok(writer)) => connection.rejoin(reader, writer),
            (reader, writer) => {
                // Whatever half survived is dropped here, which releases it.
                for e in [reader.err(), writer.err()].into_iter().flatten() {
                    error!(path = %connection.path(), error = %e, "Forwarding task failed.");
                }
            }
        }
        connection
    }
}

async fn inbound_task(
    mut reader: FrameReader,
    output: Arc<dyn VirtualOutput>,
    signals: PipelineSignals,
) -> FrameReader {
    trace!("Inbound task started.");

    loop {
        let next = tokio::select! {
            biased;
            _ = signals.connection.cancelled() => break,
            next = time::timeout(READ_TIMEOUT, reader.next()) => next,
        };

        match next {
            Ok(Some(Ok(frame))) => forward_to_virtual(&frame, output.as_ref(), &signals),
            Ok(Some(Err(e))) => {
                let e = Error::InboundIo(e);
                error!(error = %e, error_detail = ?e, "Serial connection lost.");
                signals.connection.cancel();
                break;
            }
            Ok(None) => {
                let e = Error::InboundIo(std::io::ErrorKind::UnexpectedEof.into());
                error!(error = %e, "Serial device closed the connection.");
                signals.connection.cancel();
                break;
            }
            Err(_elapsed) => {
                // Bytes that didn't complete a frame within the timeout are
                // not a frame.
                let partial = reader.read_buffer().len();
                if partial > 0 {
                    debug!(bytes = partial, "Discarding incomplete frame.");
                    reader.read_buffer_mut().clear();
                }
            }
        }
    }

    trace!("Inbound task stopped.");
    reader
}

fn forward_to_virtual(frame: &Frame, output: &dyn VirtualOutput, signals: &PipelineSignals) {
    info!(
        elapsed = %elapsed(signals.started),
        direction = SERIAL_TO_VIRTUAL,
        bytes = %frame,
        "Forwarded frame."
    );
    if let Err(e) = output.send(frame) {
        error!(error = %e, %frame, "Failed to deliver frame to virtual port.");
    }
}

// Seconds since the bridge started, to the millisecond.
fn elapsed(started: Instant) -> String {
    format!("{:.3}", started.elapsed().as_secs_f64())
}

async fn outbound_task(
    mut writer: FrameWriter,
    mut frames: mpsc::Receiver<Frame>,
    signals: PipelineSignals,
) -> FrameWriter {
    trace!("Outbound task started.");

    loop {
        let frame = tokio::select! {
            biased;
            _ = signals.connection.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        info!(
            elapsed = %elapsed(signals.started),
            direction = VIRTUAL_TO_SERIAL,
            bytes = %frame,
            "Forwarded frame."
        );

        let sent = tokio::select! {
            biased;
            _ = signals.connection.cancelled() => {
                debug!(%frame, "Connection closing; abandoning serial write.");
                break;
            }
            sent = writer.send(frame) => sent,
        };

        if let Err(e) = sent {
            let e = Error::OutboundIo(e);
            error!(error = %e, error_detail = ?e, "Serial write failed; stopping bridge.");
            signals.stop.stop(StopReason::OutboundFailure);
            break;
        }
    }

    trace!("Outbound task stopped.");
    writer
}

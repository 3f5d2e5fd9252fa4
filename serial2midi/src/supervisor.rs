//! Connection lifecycle.
//!
//! The supervisor owns the virtual endpoint for the whole run and cycles
//! serial connections underneath it:
//!
//! ```text
//! Idle -> Discovering -> Opening -> Active -> Closing -> (Discovering | Idle)
//!                  \__ nothing found: sleep, back to Idle
//! ```
//!
//! Discovery is skipped when a device path is configured. Opening retries
//! until it succeeds or the bridge is stopped. An active connection ends when
//! its reader fails, when a write fails (which also stops the bridge), or on
//! an explicit stop. Every sleep is cut short by a stop request.

use std::{
    sync::{Arc, OnceLock},
    time::Duration,
};

use futures::StreamExt;
use strum::Display;
use tokio::{
    sync::watch,
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::BridgeConfig,
    discovery::{self, PortEnumerator},
    endpoint::{OutboundRoute, VirtualEndpoint},
    error::Result,
    pipeline::{ForwardingPipeline, PipelineSignals},
    tracing::prelude::*,
    transport::{Connector, TransportConnection},
};

/// Where the supervisor is in the connection lifecycle.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Discovering,
    Opening,
    Active,
    Closing,
    Stopped,
}

/// Why the bridge stopped.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Stop requested from outside (signal, caller)
    Requested,
    /// Writing to the serial device failed
    OutboundFailure,
}

/// Single stop operation for the bridge.
///
/// Cloneable and safe to call from any thread, any number of times. The
/// first reason given is the one reported.
#[derive(Clone, Debug, Default)]
pub struct StopHandle {
    token: CancellationToken,
    reason: Arc<OnceLock<StopReason>>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self, reason: StopReason) {
        if self.reason.set(reason).is_ok() {
            debug!(%reason, "Stop requested.");
        }
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<StopReason> {
        self.reason.get().copied()
    }

    /// Wait until the bridge is stopped.
    pub async fn stopped(&self) {
        self.token.cancelled().await
    }

    /// Token cancelled by [`stop`](Self::stop) and also cancellable alone.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }
}

/// Drives discovery, connection, and reconnection until stopped.
pub struct Supervisor<C, P> {
    config: BridgeConfig,
    connector: C,
    ports: Arc<P>,
    stop: StopHandle,
    state: watch::Sender<ConnectionState>,
}

impl<C, P> Supervisor<C, P>
where
    C: Connector,
    P: PortEnumerator,
{
    pub fn new(config: BridgeConfig, connector: C, ports: P) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            config,
            connector,
            ports: Arc::new(ports),
            stop: StopHandle::new(),
            state,
        }
    }

    /// Handle that stops this supervisor.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Run until stopped.
    ///
    /// `open_endpoint` creates the virtual endpoint once, given its name and
    /// the route its input callback must feed. Failure to create it is the
    /// only error returned; everything after that is retried or ends in a
    /// stop, whose reason is returned.
    pub async fn run<E, F>(self, open_endpoint: F) -> Result<StopReason>
    where
        E: VirtualEndpoint,
        F: FnOnce(&str, OutboundRoute) -> Result<E>,
    {
        let started = Instant::now();
        let route = OutboundRoute::new();
        let name = self.config.endpoint_name();

        let mut endpoint = match open_endpoint(&name, route.clone()) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                error!(name = %name, error = %e, "Failed to create virtual MIDI device.");
                self.set_state(ConnectionState::Stopped);
                return Err(e);
            }
        };
        info!(name = %endpoint.name(), "MIDI device created.");

        while !self.stop.is_stopped() {
            let path = match &self.config.manual_device {
                Some(path) => path.clone(),
                None => match self.discover_first().await {
                    Some(path) => path,
                    None => {
                        info!("No serial devices found.");
                        self.set_state(ConnectionState::Idle);
                        self.sleep_unless_stopped().await;
                        continue;
                    }
                },
            };
            info!(path = %path, "Using serial device.");

            self.set_state(ConnectionState::Opening);
            let Some(connection) = self.open_with_retry(&path).await else {
                continue;
            };

            self.set_state(ConnectionState::Active);
            info!(path = %path, baud_rate = self.config.baud_rate, "Serial device connected.");
            if let Some(mut connection) = self.forward(connection, &endpoint, &route, started).await {
                connection.close();
            }
            info!(path = %path, "Serial device disconnected.");
            self.sleep_unless_stopped().await;
        }

        endpoint.close();
        self.set_state(ConnectionState::Stopped);
        info!("Exited cleanly.");

        Ok(self.stop.reason().unwrap_or(StopReason::Requested))
    }

    async fn discover_first(&self) -> Option<String> {
        self.set_state(ConnectionState::Discovering);
        let devices = discovery::discover(self.ports.clone(), self.config.matcher.clone());
        futures::pin_mut!(devices);
        devices.next().await.map(|device| device.device_path)
    }

    // Keep trying to open `path`. Returns None only when stopped.
    async fn open_with_retry(&self, path: &str) -> Option<TransportConnection> {
        loop {
            if self.stop.is_stopped() {
                return None;
            }
            match self.connector.open(path, self.config.baud_rate).await {
                Ok(connection) => return Some(connection),
                Err(e) => {
                    warn!(path, error = %e, "Serial open failed.");
                    if !self.sleep_unless_stopped().await {
                        return None;
                    }
                }
            }
        }
    }

    // Run the pipeline until this connection ends; returns the connection
    // once nothing else is using it.
    async fn forward<E: VirtualEndpoint>(
        &self,
        connection: TransportConnection,
        endpoint: &E,
        route: &OutboundRoute,
        started: Instant,
    ) -> Option<TransportConnection> {
        let signals = PipelineSignals {
            connection: self.stop.child_token(),
            stop: self.stop.clone(),
            started,
        };

        let pipeline = match ForwardingPipeline::start(
            connection,
            endpoint.output(),
            route.clone(),
            signals.clone(),
        ) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                error!(error = %e, "Failed to start forwarding.");
                self.set_state(ConnectionState::Closing);
                return None;
            }
        };

        signals.connection.cancelled().await;
        self.set_state(ConnectionState::Closing);
        Some(pipeline.shutdown().await)
    }

    // Sleep for the configured interval; false if a stop cut it short.
    async fn sleep_unless_stopped(&self) -> bool {
        sleep_unless_stopped(&self.stop, self.config.sleep_interval).await
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            trace!(from = %previous, to = %state, "State change.");
        }
    }
}

async fn sleep_unless_stopped(stop: &StopHandle, interval: Duration) -> bool {
    tokio::select! {
        _ = stop.stopped() => false,
        _ = time::sleep(interval) => true,
    }
}

//! In-memory stand-ins for serial ports, port enumeration, and the virtual
//! MIDI endpoint, plus a tracing layer that records log events.

use std::{
    fmt,
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf},
    sync::Notify,
};
use tracing::{
    field::{Field, Visit},
    subscriber::DefaultGuard,
    Event, Level, Subscriber,
};
use tracing_subscriber::{layer::Context as LayerContext, prelude::*, Layer};

use crate::{
    device::DeviceDescriptor,
    discovery::PortEnumerator,
    endpoint::{OutboundRoute, VirtualEndpoint, VirtualOutput},
    error::{Error, Result},
    frame::Frame,
    transport::{Connector, TransportConnection},
};

// ---- port enumeration ------------------------------------------------------

/// Fixed list of ports; `Err` entries fail inspection.
pub struct StaticPorts {
    ports: Option<Vec<std::result::Result<DeviceDescriptor, String>>>,
    enumerations: AtomicUsize,
}

impl StaticPorts {
    pub fn new(ports: Vec<std::result::Result<DeviceDescriptor, String>>) -> Self {
        Self {
            ports: Some(ports),
            enumerations: AtomicUsize::new(0),
        }
    }

    /// Enumeration itself fails.
    pub fn failing() -> Self {
        Self {
            ports: None,
            enumerations: AtomicUsize::new(0),
        }
    }

    pub fn enumerations(&self) -> usize {
        self.enumerations.load(Ordering::SeqCst)
    }
}

impl PortEnumerator for StaticPorts {
    type Port = std::result::Result<DeviceDescriptor, String>;

    fn enumerate(&self) -> Result<Vec<Self::Port>> {
        self.enumerations.fetch_add(1, Ordering::SeqCst);
        self.ports
            .clone()
            .ok_or_else(|| Error::Io(io::Error::other("enumeration unavailable")))
    }

    fn inspect(&self, port: Self::Port) -> Result<DeviceDescriptor> {
        port.map_err(|reason| Error::Discovery {
            port: "<test>".into(),
            reason,
        })
    }
}

impl PortEnumerator for Arc<StaticPorts> {
    type Port = <StaticPorts as PortEnumerator>::Port;

    fn enumerate(&self) -> Result<Vec<Self::Port>> {
        self.as_ref().enumerate()
    }

    fn inspect(&self, port: Self::Port) -> Result<DeviceDescriptor> {
        self.as_ref().inspect(port)
    }
}

// ---- serial streams --------------------------------------------------------

/// Counts how many times the wrapped stream is dropped.
pub struct Tracked<T> {
    inner: T,
    drops: Arc<AtomicUsize>,
}

impl<T> Tracked<T> {
    pub fn new(inner: T, drops: Arc<AtomicUsize>) -> Self {
        Self { inner, drops }
    }
}

impl<T> Drop for Tracked<T> {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Tracked<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Tracked<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Reads normally; every write fails as if the device were unplugged.
pub struct BrokenWrites<T> {
    inner: T,
}

impl<T> BrokenWrites<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for BrokenWrites<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T: Unpin> AsyncWrite for BrokenWrites<T> {
    fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "device unplugged",
        )))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

// ---- connector -------------------------------------------------------------

#[derive(Default)]
struct ConnectorState {
    failures_left: Mutex<usize>,
    broken_writes: bool,
    attempts: Mutex<Vec<(String, u32)>>,
    remotes: Mutex<Vec<DuplexStream>>,
    closes: Arc<AtomicUsize>,
}

/// Connector backed by in-memory duplex streams.
///
/// The far end of each opened connection is kept for the test to drive.
#[derive(Clone, Default)]
pub struct MockConnector(Arc<ConnectorState>);

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first `n` opens fail with a "no device" error.
    pub fn failing_first(n: usize) -> Self {
        let connector = Self::default();
        *connector.0.failures_left.lock() = n;
        connector
    }

    /// Opened connections reject every write.
    pub fn with_broken_writes() -> Self {
        Self(Arc::new(ConnectorState {
            broken_writes: true,
            ..Default::default()
        }))
    }

    /// Every (path, baud rate) open attempted so far.
    pub fn attempts(&self) -> Vec<(String, u32)> {
        self.0.attempts.lock().clone()
    }

    /// How many opened streams have been released.
    pub fn closes(&self) -> usize {
        self.0.closes.load(Ordering::SeqCst)
    }

    /// Far end of the most recently opened connection.
    pub fn take_remote(&self) -> DuplexStream {
        self.0
            .remotes
            .lock()
            .pop()
            .expect("no open connection to take")
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, path: &str, baud_rate: u32) -> Result<TransportConnection> {
        self.0.attempts.lock().push((path.to_string(), baud_rate));

        {
            let mut failures_left = self.0.failures_left.lock();
            if *failures_left > 0 {
                *failures_left -= 1;
                return Err(Error::Open {
                    path: path.to_string(),
                    source: tokio_serial::Error::new(
                        tokio_serial::ErrorKind::NoDevice,
                        "device not present",
                    ),
                });
            }
        }

        let (local, remote) = tokio::io::duplex(256);
        self.0.remotes.lock().push(remote);
        let local = Tracked::new(local, self.0.closes.clone());

        Ok(if self.0.broken_writes {
            TransportConnection::new(path, BrokenWrites::new(local))
        } else {
            TransportConnection::new(path, local)
        })
    }
}

// ---- virtual endpoint ------------------------------------------------------

/// Virtual output that records every frame it is given.
#[derive(Default)]
pub struct RecordingOutput {
    frames: Mutex<Vec<Frame>>,
    changed: Notify,
}

impl RecordingOutput {
    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().clone()
    }

    /// Wait until at least `count` frames have arrived.
    pub async fn wait_for(&self, count: usize) {
        loop {
            let changed = self.changed.notified();
            if self.frames.lock().len() >= count {
                return;
            }
            changed.await;
        }
    }
}

impl VirtualOutput for RecordingOutput {
    fn send(&self, frame: &Frame) -> Result<()> {
        self.frames.lock().push(*frame);
        self.changed.notify_waiters();
        Ok(())
    }
}

#[derive(Default)]
struct ProbeState {
    output: Arc<RecordingOutput>,
    route: Mutex<Option<OutboundRoute>>,
    name: Mutex<Option<String>>,
    closes: AtomicUsize,
}

/// Test-side view of a [`MockEndpoint`].
#[derive(Clone, Default)]
pub struct EndpointProbe(Arc<ProbeState>);

impl EndpointProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Endpoint factory to pass to `Supervisor::run`.
    pub fn factory(&self) -> impl FnOnce(&str, OutboundRoute) -> Result<MockEndpoint> {
        let probe = self.clone();
        move |name, route| {
            *probe.0.route.lock() = Some(route);
            *probe.0.name.lock() = Some(name.to_string());
            Ok(MockEndpoint {
                probe,
                name: name.to_string(),
                closed: false,
            })
        }
    }

    /// Simulate another application sending to the virtual input port.
    pub fn inject(&self, message: &[u8]) {
        if let Some(route) = self.0.route.lock().as_ref() {
            route.dispatch(message);
        }
    }

    pub fn output(&self) -> &RecordingOutput {
        &self.0.output
    }

    pub fn name(&self) -> Option<String> {
        self.0.name.lock().clone()
    }

    pub fn closes(&self) -> usize {
        self.0.closes.load(Ordering::SeqCst)
    }
}

/// Endpoint handed to the supervisor in tests.
pub struct MockEndpoint {
    probe: EndpointProbe,
    name: String,
    closed: bool,
}

impl VirtualEndpoint for MockEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn output(&self) -> Arc<dyn VirtualOutput> {
        self.probe.0.output.clone()
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.probe.0.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// ---- log capture -----------------------------------------------------------

/// One recorded log event.
#[derive(Debug)]
struct CapturedEvent {
    level: Level,
    message: String,
    fields: Vec<(String, String)>,
}

/// Log events recorded on the current thread while this is alive.
pub struct LogCapture {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
    _guard: DefaultGuard,
}

/// Record every event emitted on this thread until the capture is dropped.
///
/// Works with the current-thread runtime `#[tokio::test]` uses, where
/// spawned tasks run on the test thread.
pub fn capture_logs() -> LogCapture {
    let events = Arc::new(Mutex::new(Vec::new()));
    let subscriber = tracing_subscriber::registry().with(CaptureLayer {
        events: events.clone(),
    });
    LogCapture {
        events,
        _guard: tracing::subscriber::set_default(subscriber),
    }
}

impl LogCapture {
    /// Events with `field` recorded as `value`.
    pub fn count_field(&self, field: &str, value: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.fields.iter().any(|(k, v)| k == field && v == value))
            .count()
    }

    /// Events at `level` whose message is `message`.
    pub fn count(&self, level: Level, message: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.level == level && e.message == message)
            .count()
    }
}

struct CaptureLayer {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: LayerContext<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        self.events.lock().push(CapturedEvent {
            level: *event.metadata().level(),
            message: visitor.message,
            fields: visitor.fields,
        });
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push((field.name().to_string(), value.to_string()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields
                .push((field.name().to_string(), format!("{:?}", value)));
        }
    }
}

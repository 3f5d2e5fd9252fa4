//! Serial transport connections.
//!
//! A [`Connector`] opens a device path into a [`TransportConnection`], which
//! owns the byte stream for exactly one connection attempt. The forwarding
//! pipeline borrows the stream by splitting it into a frame reader and a
//! frame writer and hands both halves back before the connection is closed,
//! so a close can never race an in-flight read or write.

use async_trait::async_trait;
use tokio::io::{self, AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio_serial::SerialPortBuilderExt;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::{
    error::{Error, Result},
    frame::FrameCodec,
    tracing::prelude::*,
};

/// Byte stream a connection can carry.
pub trait SerialIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SerialIo for T {}

/// Read side of a split connection.
pub type FrameReader = FramedRead<ReadHalf<Box<dyn SerialIo>>, FrameCodec>;

/// Write side of a split connection.
pub type FrameWriter = FramedWrite<WriteHalf<Box<dyn SerialIo>>, FrameCodec>;

/// Opens transport connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open `path` at `baud_rate`. Failures are reported as [`Error::Open`].
    async fn open(&self, path: &str, baud_rate: u32) -> Result<TransportConnection>;
}

/// Opens real serial ports with tokio-serial.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialConnector;

#[async_trait]
impl Connector for SerialConnector {
    async fn open(&self, path: &str, baud_rate: u32) -> Result<TransportConnection> {
        #[allow(unused_mut)]
        let mut port = tokio_serial::new(path, baud_rate)
            .open_native_async()
            .map_err(|source| Error::Open {
                path: path.to_string(),
                source,
            })?;

        // Keep a second bridge instance from opening the same port. Where the
        // lock is unavailable the port stays usable in shared mode.
        if let Err(e) = port.set_exclusive(true) {
            warn!(
                path,
                error = %e,
                "Exclusive access not supported; opening serial port shared."
            );
        }

        Ok(TransportConnection::new(path, port))
    }
}

/// One open serial connection.
pub struct TransportConnection {
    path: String,
    io: Option<Box<dyn SerialIo>>,
}

impl TransportConnection {
    pub fn new(path: impl Into<String>, io: impl SerialIo + 'static) -> Self {
        Self {
            path: path.into(),
            io: Some(Box::new(io)),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.io.is_some()
    }

    /// Split into a frame reader and a frame writer.
    ///
    /// Fails if the connection has already been closed.
    pub fn split(&mut self) -> Result<(FrameReader, FrameWriter)> {
        let stream = self.io.take().ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("{} is closed", self.path),
            ))
        })?;
        let (read, write) = io::split(stream);
        Ok((
            FramedRead::new(read, FrameCodec),
            FramedWrite::new(write, FrameCodec),
        ))
    }

    /// Reassemble the stream from the halves returned by [`split`].
    ///
    /// [`split`]: TransportConnection::split
    pub fn rejoin(&mut self, reader: FrameReader, writer: FrameWriter) {
        let read = reader.into_inner();
        let write = writer.into_inner();
        self.io = Some(read.unsplit(write));
    }

    /// Release the OS handle. Closing an already closed connection is a no-op.
    pub fn close(&mut self) {
        if let Some(stream) = self.io.take() {
            drop(stream);
            debug!(path = %self.path, "Serial port closed.");
        }
    }
}

impl Drop for TransportConnection {
    fn drop(&mut self) {
        self.close();
    }
}

//! Virtual MIDI endpoint.
//!
//! The endpoint publishes an input port and an output port under one name for
//! the lifetime of the process. Frames read from serial go out through
//! [`VirtualOutput`]; messages other applications send to the input port are
//! delivered on a thread owned by the MIDI subsystem and handed to an
//! [`OutboundRoute`], which forwards them to whichever connection is active.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{error::Result, frame::Frame, tracing::prelude::*};

/// Frames from the virtual input that may wait for a slow serial write.
/// Anything beyond this is dropped.
pub const OUTBOUND_QUEUE_DEPTH: usize = 128;

/// Send side of the virtual endpoint.
pub trait VirtualOutput: Send + Sync {
    /// Deliver one frame to applications listening on the virtual port.
    fn send(&self, frame: &Frame) -> Result<()>;
}

/// A virtual endpoint owned by the supervisor.
pub trait VirtualEndpoint {
    /// Name the ports were published under.
    fn name(&self) -> &str;

    /// Handle for sending frames, shareable with the inbound reader.
    fn output(&self) -> Arc<dyn VirtualOutput>;

    /// Tear down both ports. Calling this more than once has no effect.
    fn close(&mut self);
}

/// Routes messages from the virtual input port to the active connection.
///
/// Cloned into the endpoint's input callback once; connections come and go
/// by attaching and detaching a sender. While detached, input is dropped.
#[derive(Clone, Default)]
pub struct OutboundRoute {
    target: Arc<Mutex<Option<mpsc::Sender<Frame>>>>,
}

impl OutboundRoute {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start routing to a new connection, returning the receiving end.
    pub fn attach(&self) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        *self.target.lock() = Some(tx);
        rx
    }

    /// Stop routing. No frame is accepted after this returns.
    pub fn detach(&self) {
        self.target.lock().take();
    }

    pub fn is_attached(&self) -> bool {
        self.target.lock().is_some()
    }

    /// Entry point for the input callback; may be called from any thread.
    ///
    /// Only the first three bytes of a message are forwarded. Shorter
    /// messages are not frames and are dropped.
    pub fn dispatch(&self, message: &[u8]) {
        let Some(frame) = message.get(..3).and_then(Frame::from_slice) else {
            debug!(len = message.len(), "Dropping short virtual MIDI message.");
            return;
        };

        let target = self.target.lock();
        match target.as_ref() {
            Some(tx) => match tx.try_send(frame) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(frame)) => {
                    debug!(%frame, "Serial writes backed up; dropping virtual MIDI message.");
                }
                Err(mpsc::error::TrySendError::Closed(frame)) => {
                    debug!(%frame, "Connection closing; dropping virtual MIDI message.");
                }
            },
            None => trace!(%frame, "No serial connection; dropping virtual MIDI message."),
        }
    }
}

pub use midi::MidiEndpoint;

mod midi {
    use std::sync::Arc;

    use midir::{
        os::unix::{VirtualInput, VirtualOutput as _},
        Ignore, MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection,
    };
    use parking_lot::Mutex;

    use super::{OutboundRoute, VirtualEndpoint, VirtualOutput};
    use crate::{
        error::{Error, Result},
        frame::Frame,
        tracing::prelude::*,
    };

    /// Virtual ports provided by the host MIDI system (ALSA, CoreMIDI).
    pub struct MidiEndpoint {
        name: String,
        input: Option<MidiInputConnection<()>>,
        output: Arc<MidiOutputPort>,
    }

    struct MidiOutputPort {
        conn: Mutex<Option<MidiOutputConnection>>,
    }

    impl MidiEndpoint {
        /// Publish input and output ports named `name`.
        ///
        /// Messages arriving on the input port are passed to `route`.
        pub fn open(name: &str, route: OutboundRoute) -> Result<Self> {
            let mut midi_in = MidiInput::new(name)
                .map_err(|e| Error::VirtualEndpoint(format!("MIDI input init: {}", e)))?;
            // Skip SysEx, timing clock, and active sensing.
            midi_in.ignore(Ignore::All);
            let input = midi_in
                .create_virtual(
                    name,
                    move |_stamp, message, _| route.dispatch(message),
                    (),
                )
                .map_err(|e| Error::VirtualEndpoint(format!("virtual input port: {}", e)))?;

            let midi_out = MidiOutput::new(name)
                .map_err(|e| Error::VirtualEndpoint(format!("MIDI output init: {}", e)))?;
            let output = midi_out
                .create_virtual(name)
                .map_err(|e| Error::VirtualEndpoint(format!("virtual output port: {}", e)))?;

            Ok(Self {
                name: name.to_string(),
                input: Some(input),
                output: Arc::new(MidiOutputPort {
                    conn: Mutex::new(Some(output)),
                }),
            })
        }
    }

    impl VirtualEndpoint for MidiEndpoint {
        fn name(&self) -> &str {
            &self.name
        }

        fn output(&self) -> Arc<dyn VirtualOutput> {
            self.output.clone()
        }

        fn close(&mut self) {
            if let Some(input) = self.input.take() {
                input.close();
            }
            if let Some(output) = self.output.conn.lock().take() {
                output.close();
                debug!(name = %self.name, "Virtual MIDI ports closed.");
            }
        }
    }

    impl Drop for MidiEndpoint {
        fn drop(&mut self) {
            self.close();
        }
    }

    impl VirtualOutput for MidiOutputPort {
        fn send(&self, frame: &Frame) -> Result<()> {
            match self.conn.lock().as_mut() {
                Some(conn) => conn
                    .send(frame.as_ref())
                    .map_err(|e| Error::VirtualEndpoint(format!("send failed: {}", e))),
                None => Err(Error::VirtualEndpoint("output port closed".into())),
            }
        }
    }
}

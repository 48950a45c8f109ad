//! Observer transport for the telemetry bridge.
//!
//! [`TcpTelemetryEndpoint`] serves one observer at a time over newline
//! delimited JSON. The server sends a `register` message on connect, followed
//! by the current level of every level channel, and an `output` message per
//! change. The observer sends `inputs` messages.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{InputChannel, OutputChange, OutputChannel, OutputKind};
use crate::error::HarnessError;

/// Pending outbound bytes above which new messages are dropped.
pub const MAX_PENDING_OUTPUT: usize = 1 << 20;

/// Longest unterminated inbound line; an observer exceeding it is dropped.
pub const MAX_PENDING_INPUT: usize = 1 << 16;

/// Transport contract used by [`TelemetryBridge`](super::TelemetryBridge).
pub trait TelemetryEndpoint {
    /// Announces the channel tables; replayed to every new observer.
    fn register_channels(&mut self, inputs: &[InputChannel], outputs: &[OutputChannel]);

    /// Returns the most recent input vector received since the last poll.
    fn poll_inputs(&mut self) -> Option<Vec<u8>>;

    /// Publishes one output change.
    fn push_output_change(&mut self, change: &OutputChange);

    /// Releases the transport.
    fn close(&mut self) {}
}

/// Server to observer messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Channel tables.
    Register {
        /// Observer-driven channels.
        inputs: Vec<InputChannel>,
        /// Model-driven channels.
        outputs: Vec<OutputChannel>,
    },
    /// One output change.
    Output {
        /// Channel name.
        channel: String,
        /// New level or stream byte.
        value: u64,
        /// Virtual time of the change.
        time: u64,
    },
}

/// Observer to server messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ObserverMessage {
    /// Complete input vector, one entry per input channel.
    Inputs {
        /// Channel values; nonzero means high.
        values: Vec<u64>,
    },
}

#[derive(Debug)]
struct Observer {
    stream: TcpStream,
    peer: SocketAddr,
    inbox: Vec<u8>,
    outbox: Vec<u8>,
}

/// Loopback TCP endpoint speaking JSON lines.
#[derive(Debug)]
pub struct TcpTelemetryEndpoint {
    listener: TcpListener,
    observer: Option<Observer>,
    registration: Vec<u8>,
    levels: BTreeMap<String, Option<OutputChange>>,
}

impl TcpTelemetryEndpoint {
    /// Binds the loopback listener on `port`.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Startup`] when the port cannot be bound.
    pub fn bind(port: u16) -> Result<Self, HarnessError> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let startup = |source| HarnessError::Startup {
            transport: "telemetry",
            addr,
            source,
        };
        let listener = TcpListener::bind(addr).map_err(startup)?;
        listener.set_nonblocking(true).map_err(startup)?;
        info!(%addr, "telemetry server listening");
        Ok(Self {
            listener,
            observer: None,
            registration: Vec::new(),
            levels: BTreeMap::new(),
        })
    }

    /// Address the listener is bound to.
    ///
    /// # Errors
    ///
    /// Propagates the socket error.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Returns true while an observer is attached.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.observer.is_some()
    }

    fn accept(&mut self) {
        if self.observer.is_some() {
            return;
        }
        match self.listener.accept() {
            Ok((stream, peer)) => {
                if let Err(error) = stream.set_nonblocking(true) {
                    warn!(%peer, %error, "rejecting telemetry observer");
                    return;
                }
                info!(%peer, "telemetry observer connected");
                let mut outbox = self.registration.clone();
                for change in self.levels.values().flatten() {
                    if let Err(error) = write_line(&mut outbox, &output_message(change)) {
                        warn!(%error, "failed to encode telemetry level");
                    }
                }
                self.observer = Some(Observer {
                    stream,
                    peer,
                    inbox: Vec::new(),
                    outbox,
                });
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {}
            Err(error) => warn!(%error, "telemetry accept failed"),
        }
    }

    fn send(&mut self, message: &ServerMessage) {
        let Some(observer) = self.observer.as_mut() else {
            return;
        };
        if observer.outbox.len() > MAX_PENDING_OUTPUT {
            debug!(peer = %observer.peer, "telemetry observer is not reading; dropping output");
            return;
        }
        if let Err(error) = write_line(&mut observer.outbox, message) {
            warn!(%error, "failed to encode telemetry message");
        }
    }

    fn flush(&mut self) {
        let Some(observer) = self.observer.as_mut() else {
            return;
        };
        while !observer.outbox.is_empty() {
            match observer.stream.write(&observer.outbox) {
                Ok(0) => return self.disconnect(),
                Ok(written) => {
                    observer.outbox.drain(..written);
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => {
                    debug!(%error, "telemetry write failed");
                    return self.disconnect();
                }
            }
        }
    }

    fn fill_inbox(&mut self) {
        let Some(observer) = self.observer.as_mut() else {
            return;
        };
        let mut chunk = [0u8; 4096];
        loop {
            match observer.stream.read(&mut chunk) {
                Ok(0) => return self.disconnect(),
                Ok(read) => {
                    observer.inbox.extend_from_slice(&chunk[..read]);
                    let unterminated = observer
                        .inbox
                        .iter()
                        .rev()
                        .position(|byte| *byte == b'\n')
                        .unwrap_or(observer.inbox.len());
                    if unterminated > MAX_PENDING_INPUT {
                        warn!(peer = %observer.peer, "telemetry line too long; dropping observer");
                        return self.disconnect();
                    }
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => {
                    debug!(%error, "telemetry read failed");
                    return self.disconnect();
                }
            }
        }
    }

    fn disconnect(&mut self) {
        if let Some(observer) = self.observer.take() {
            info!(peer = %observer.peer, "telemetry observer disconnected");
        }
    }
}

impl TelemetryEndpoint for TcpTelemetryEndpoint {
    fn register_channels(&mut self, inputs: &[InputChannel], outputs: &[OutputChannel]) {
        let message = ServerMessage::Register {
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
        };
        self.levels = outputs
            .iter()
            .filter(|channel| matches!(channel.kind, OutputKind::Level { .. }))
            .map(|channel| (channel.name.clone(), None))
            .collect();
        self.registration.clear();
        if let Err(error) = write_line(&mut self.registration, &message) {
            warn!(%error, "failed to encode telemetry registration");
        }
        if let Some(observer) = self.observer.as_mut() {
            observer.outbox.extend_from_slice(&self.registration);
        }
    }

    fn poll_inputs(&mut self) -> Option<Vec<u8>> {
        self.accept();
        self.flush();
        self.fill_inbox();
        let observer = self.observer.as_mut()?;
        let mut latest = None;
        while let Some(end) = observer.inbox.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = observer.inbox.drain(..=end).collect();
            let text = String::from_utf8_lossy(&line);
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            match serde_json::from_str::<ObserverMessage>(text) {
                Ok(ObserverMessage::Inputs { values }) => {
                    latest = Some(values.iter().map(|value| u8::from(*value != 0)).collect());
                }
                Err(error) => warn!(%error, line = text, "dropping malformed telemetry message"),
            }
        }
        latest
    }

    fn push_output_change(&mut self, change: &OutputChange) {
        self.accept();
        if let Some(level) = self.levels.get_mut(&change.channel) {
            *level = Some(change.clone());
        }
        self.send(&output_message(change));
        self.flush();
    }

    fn close(&mut self) {
        self.flush();
        if let Some(observer) = self.observer.take() {
            let _ = observer.stream.shutdown(std::net::Shutdown::Both);
            debug!(peer = %observer.peer, "telemetry observer socket closed");
        }
    }
}

fn output_message(change: &OutputChange) -> ServerMessage {
    ServerMessage::Output {
        channel: change.channel.clone(),
        value: change.value,
        time: change.time,
    }
}

fn write_line(buffer: &mut Vec<u8>, message: &ServerMessage) -> serde_json::Result<()> {
    serde_json::to_writer(&mut *buffer, message)?;
    buffer.push(b'\n');
    Ok(())
}

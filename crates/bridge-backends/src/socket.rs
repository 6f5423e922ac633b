//! Newline-delimited JSON client for the PCM registry service.
//!
//! One Unix socket carries both the method calls of [`RegistryService`] and
//! the signal stream consumed by the dispatch loop. Signals that arrive while
//! a call waits for its reply are buffered and delivered in order afterwards.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use bridge_core::{
    decode_properties, DeviceDescriptor, DeviceId, Direction, NotificationSource,
    PollSet, RawChannel, RawNotification, RegistryError, RegistryService, TransportError,
    MANAGER_INTERFACE, PCM_ADDED, PCM_INTERFACE, PCM_REMOVED, PROPERTIES_CHANGED,
    PROPERTIES_INTERFACE,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, trace, warn};

const READ_CHUNK: usize = 16 * 1024;

/// One line on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Call {
        serial: u64,
        method: String,
        #[serde(default)]
        params: Value,
    },
    Reply {
        serial: u64,
        #[serde(default)]
        result: Value,
    },
    Error {
        serial: u64,
        message: String,
    },
    Signal(RawNotification),
}

#[derive(Debug, Deserialize)]
struct PcmEntry {
    path: String,
    #[serde(default)]
    properties: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct OpenReply {
    data: PathBuf,
    control: PathBuf,
}

/// The shared socket and its read buffer.
#[derive(Debug)]
struct Connection {
    stream: UnixStream,
    buffer: Vec<u8>,
    signals: VecDeque<RawNotification>,
    next_serial: u64,
}

impl Connection {
    fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            buffer: Vec::new(),
            signals: VecDeque::new(),
            next_serial: 1,
        }
    }

    fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let mut line = serde_json::to_vec(frame)?;
        line.push(b'\n');
        self.stream.write_all(&line)?;
        Ok(())
    }

    /// Sends a call and blocks until its reply arrives.
    fn call(&mut self, method: &str, params: Value) -> Result<Value, RegistryError> {
        let serial = self.next_serial;
        self.next_serial += 1;
        self.send(&Frame::Call {
            serial,
            method: method.to_string(),
            params,
        })?;

        loop {
            match self.next_frame_blocking()? {
                Frame::Reply { serial: s, result } if s == serial => {
                    self.queue_buffered_signals();
                    return Ok(result);
                }
                Frame::Error { serial: s, message } if s == serial => {
                    self.queue_buffered_signals();
                    return Err(RegistryError::Call {
                        method: method.to_string(),
                        message,
                    });
                }
                Frame::Signal(signal) => self.signals.push_back(signal),
                other => trace!(?other, "ignoring unexpected frame"),
            }
        }
    }

    fn next_frame_blocking(&mut self) -> Result<Frame, TransportError> {
        loop {
            while let Some(line) = self.take_line() {
                if let Some(frame) = parse_frame(&line) {
                    return Ok(frame);
                }
            }
            self.fill()?;
        }
    }

    /// Reads once and queues every complete signal frame.
    ///
    /// End of stream is only reported once no signal is left to deliver;
    /// the socket stays readable, so the next wait observes it again.
    fn pump(&mut self) -> Result<(), TransportError> {
        self.queue_buffered_signals();
        match self.fill() {
            Ok(_) => {}
            Err(TransportError::Closed) if !self.signals.is_empty() => return Ok(()),
            Err(err) => return Err(err),
        }
        self.queue_buffered_signals();
        Ok(())
    }

    /// Moves every complete line left in the read buffer into the signal queue.
    fn queue_buffered_signals(&mut self) {
        while let Some(line) = self.take_line() {
            match parse_frame(&line) {
                Some(Frame::Signal(signal)) => self.signals.push_back(signal),
                Some(other) => trace!(?other, "ignoring unsolicited frame"),
                None => {}
            }
        }
    }

    fn fill(&mut self) -> Result<usize, TransportError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(read) => {
                    self.buffer.extend_from_slice(&chunk[..read]);
                    return Ok(read);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        let end = self.buffer.iter().position(|byte| *byte == b'\n')?;
        let mut line: Vec<u8> = self.buffer.drain(..=end).collect();
        line.pop();
        Some(line)
    }
}

fn parse_frame(line: &[u8]) -> Option<Frame> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    match serde_json::from_slice(line) {
        Ok(frame) => Some(frame),
        Err(err) => {
            warn!("discarding malformed frame: {err}");
            None
        }
    }
}

/// Registry half of the connection; implements [`RegistryService`].
#[derive(Debug, Clone)]
pub struct RegistryClient {
    conn: Rc<RefCell<Connection>>,
}

impl RegistryClient {
    pub fn connect(path: &Path) -> Result<Self, TransportError> {
        let stream = UnixStream::connect(path).map_err(TransportError::Connect)?;
        debug!(socket = %path.display(), "connected to registry service");
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: UnixStream) -> Self {
        Self {
            conn: Rc::new(RefCell::new(Connection::new(stream))),
        }
    }

    /// Subscribes to PCM lifecycle and property-change signals.
    pub fn subscribe(&self) -> Result<(), TransportError> {
        let rules = [
            (MANAGER_INTERFACE, PCM_ADDED, None),
            (MANAGER_INTERFACE, PCM_REMOVED, None),
            (PROPERTIES_INTERFACE, PROPERTIES_CHANGED, Some(PCM_INTERFACE)),
        ];
        for (interface, member, arg0) in rules {
            let mut params = json!({ "interface": interface, "member": member });
            if let Some(arg0) = arg0 {
                params["arg0"] = Value::String(arg0.to_string());
            }
            self.conn
                .borrow_mut()
                .call("AddMatch", params)
                .map_err(|err| TransportError::Subscribe {
                    rule: format!("{interface}.{member}"),
                    reason: err.to_string(),
                })?;
        }
        Ok(())
    }

    /// The notification half sharing this connection.
    pub fn notifications(&self) -> SocketNotifications {
        SocketNotifications {
            conn: Rc::clone(&self.conn),
        }
    }
}

impl RegistryService for RegistryClient {
    fn enumerate_devices(&mut self) -> Result<Vec<DeviceDescriptor>, RegistryError> {
        let result = self.conn.borrow_mut().call("GetPCMs", Value::Null)?;
        let entries: Vec<PcmEntry> =
            serde_json::from_value(result).map_err(|err| RegistryError::Reply(err.to_string()))?;
        let mut devices = Vec::with_capacity(entries.len());
        for entry in entries {
            match decode_properties(&entry.properties) {
                Ok(changes) => devices.push(changes.into_descriptor(DeviceId::new(entry.path))),
                Err(err) => warn!(path = %entry.path, "skipping PCM: {err}"),
            }
        }
        Ok(devices)
    }

    fn open_channel(
        &mut self,
        device: &DeviceId,
        direction: Direction,
    ) -> Result<RawChannel, RegistryError> {
        let result = self.conn.borrow_mut().call(
            "Open",
            json!({ "path": device.as_str(), "mode": direction.as_str() }),
        )?;
        let reply: OpenReply =
            serde_json::from_value(result).map_err(|err| RegistryError::Reply(err.to_string()))?;

        let data = match direction {
            Direction::Sink => OpenOptions::new().read(true).open(&reply.data)?,
            Direction::Source => OpenOptions::new().write(true).open(&reply.data)?,
        };
        let control = UnixStream::connect(&reply.control)?;
        debug!(device = %device, %direction, data = %reply.data.display(), "opened PCM");
        Ok(RawChannel::new(OwnedFd::from(data), OwnedFd::from(control)))
    }
}

/// Signal half of the connection; implements [`NotificationSource`].
#[derive(Debug)]
pub struct SocketNotifications {
    conn: Rc<RefCell<Connection>>,
}

impl NotificationSource for SocketNotifications {
    fn poll_fds(&mut self, set: &mut PollSet) -> Result<(), TransportError> {
        set.register(self.conn.borrow().stream.as_raw_fd())
    }

    fn dispatch(&mut self, set: &PollSet) -> Result<(), TransportError> {
        let mut conn = self.conn.borrow_mut();
        if set.is_ready(conn.stream.as_raw_fd()) {
            conn.pump()?;
        }
        Ok(())
    }

    fn next_notification(&mut self) -> Option<RawNotification> {
        self.conn.borrow_mut().signals.pop_front()
    }
}

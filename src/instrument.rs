use log::{debug, warn};
use parking_lot::Mutex;
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use crate::error::StationError;
use crate::types::{DeviceRole, InstrumentStatus};

/// Minimal capability the measurement core needs from a bench instrument.
///
/// Commands are opaque strings. Implementations must deliver them in the order
/// they were sent; no acknowledgement is expected.
pub trait Instrument: Send {
    fn role(&self) -> DeviceRole;

    fn address(&self) -> &str;

    /// Change the target address. Resets the status to `Unknown`.
    fn set_address(&mut self, address: &str);

    /// Try to reach the instrument at its current address
    fn find(&mut self) -> bool;

    fn status(&self) -> InstrumentStatus;

    /// Fire-and-forget write of one command
    fn send(&mut self, command: &str) -> Result<(), StationError>;
}

/// One command as seen by a [`MockInstrument`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentCommand {
    pub role: DeviceRole,
    pub command: String,
}

/// Command history shared by a set of mock instruments, in global issue order
#[derive(Debug, Clone, Default)]
pub struct CommandLog(Arc<Mutex<Vec<SentCommand>>>);

impl CommandLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, role: DeviceRole, command: &str) {
        self.0.lock().push(SentCommand {
            role,
            command: command.to_string(),
        });
    }

    pub fn entries(&self) -> Vec<SentCommand> {
        self.0.lock().clone()
    }

    /// Commands received by one role, in order
    pub fn commands_for(&self, role: DeviceRole) -> Vec<String> {
        self.0
            .lock()
            .iter()
            .filter(|c| c.role == role)
            .map(|c| c.command.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

/// Hardware-free instrument that records every command it receives
#[derive(Debug)]
pub struct MockInstrument {
    role: DeviceRole,
    address: String,
    status: InstrumentStatus,
    present: bool,
    fail_on: Option<String>,
    log: CommandLog,
}

impl MockInstrument {
    pub fn new(role: DeviceRole, address: &str, log: CommandLog) -> Self {
        Self {
            role,
            address: address.to_string(),
            status: InstrumentStatus::Unknown,
            present: true,
            fail_on: None,
            log,
        }
    }

    /// Make `find()` report the instrument as absent
    pub fn absent(mut self) -> Self {
        self.present = false;
        self
    }

    /// Fail `send()` for any command starting with `prefix`
    pub fn failing_on(mut self, prefix: &str) -> Self {
        self.fail_on = Some(prefix.to_string());
        self
    }
}

impl Instrument for MockInstrument {
    fn role(&self) -> DeviceRole {
        self.role
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn set_address(&mut self, address: &str) {
        self.address = address.to_string();
        self.status = InstrumentStatus::Unknown;
    }

    fn find(&mut self) -> bool {
        self.status = if self.present {
            InstrumentStatus::Found
        } else {
            InstrumentStatus::NotFound
        };
        self.present
    }

    fn status(&self) -> InstrumentStatus {
        self.status
    }

    fn send(&mut self, command: &str) -> Result<(), StationError> {
        if let Some(prefix) = &self.fail_on {
            if command.starts_with(prefix.as_str()) {
                return Err(StationError::Instrument {
                    role: self.role.to_string(),
                    address: self.address.clone(),
                    message: format!("injected fault on '{command}'"),
                });
            }
        }
        debug!("[{}] <- {}", self.role, command);
        self.log.push(self.role, command);
        Ok(())
    }
}

/// Timeouts for [`SocketInstrument`]
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for establishing the TCP connection
    pub connect_timeout: Duration,
    /// Timeout for the identification reply during discovery
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(2),
        }
    }
}

/// Raw SCPI-over-TCP instrument.
///
/// Accepts `TCPIP[n]::host::port::SOCKET` resource strings or plain
/// `host:port` addresses.
pub struct SocketInstrument {
    role: DeviceRole,
    address: String,
    config: ConnectionConfig,
    status: InstrumentStatus,
    stream: Option<TcpStream>,
}

impl SocketInstrument {
    pub fn new(role: DeviceRole, address: &str) -> Self {
        Self::with_config(role, address, ConnectionConfig::default())
    }

    pub fn with_config(role: DeviceRole, address: &str, config: ConnectionConfig) -> Self {
        Self {
            role,
            address: address.to_string(),
            config,
            status: InstrumentStatus::Unknown,
            stream: None,
        }
    }

    fn fault(&self, message: impl Into<String>) -> StationError {
        StationError::Instrument {
            role: self.role.to_string(),
            address: self.address.clone(),
            message: message.into(),
        }
    }

    fn connect(&self) -> Result<TcpStream, StationError> {
        let socket_addr = parse_socket_address(&self.address)?;
        let stream = TcpStream::connect_timeout(&socket_addr, self.config.connect_timeout)?;
        stream.set_read_timeout(Some(self.config.read_timeout))?;
        stream.set_write_timeout(Some(self.config.write_timeout))?;
        Ok(stream)
    }

    fn identify(&self, stream: &mut TcpStream) -> Result<String, StationError> {
        stream.write_all(b"*IDN?\n")?;
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut line = String::new();
        reader.read_line(&mut line)?;
        let idn = line.trim().to_string();
        if idn.is_empty() {
            return Err(self.fault("empty identification reply"));
        }
        Ok(idn)
    }
}

impl Instrument for SocketInstrument {
    fn role(&self) -> DeviceRole {
        self.role
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn set_address(&mut self, address: &str) {
        self.address = address.to_string();
        self.status = InstrumentStatus::Unknown;
        self.stream = None;
    }

    fn find(&mut self) -> bool {
        let found = self.connect().and_then(|mut stream| {
            let idn = self.identify(&mut stream)?;
            Ok((stream, idn))
        });
        match found {
            Ok((stream, idn)) => {
                debug!("{} at {} identified as {}", self.role, self.address, idn);
                self.stream = Some(stream);
                self.status = InstrumentStatus::Found;
                true
            }
            Err(e) => {
                warn!("{} not found at {}: {}", self.role, self.address, e);
                self.stream = None;
                self.status = InstrumentStatus::NotFound;
                false
            }
        }
    }

    fn status(&self) -> InstrumentStatus {
        self.status
    }

    fn send(&mut self, command: &str) -> Result<(), StationError> {
        let role = self.role;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| StationError::Instrument {
                role: role.to_string(),
                address: self.address.clone(),
                message: "not connected".to_string(),
            })?;
        debug!("[{role}] <- {command}");
        stream.write_all(command.as_bytes())?;
        stream.write_all(b"\n")?;
        Ok(())
    }
}

/// Resolve a VISA socket resource string or `host:port` into a socket address
pub fn parse_socket_address(address: &str) -> Result<SocketAddr, StationError> {
    let invalid = || StationError::Instrument {
        role: "-".to_string(),
        address: address.to_string(),
        message: "not a TCP socket address".to_string(),
    };

    let host_port = if address.to_uppercase().starts_with("TCPIP") {
        let parts: Vec<&str> = address.split("::").collect();
        match parts.as_slice() {
            [_, host, port, kind] if kind.eq_ignore_ascii_case("SOCKET") => {
                format!("{host}:{port}")
            }
            _ => return Err(invalid()),
        }
    } else {
        address.to_string()
    };

    host_port
        .to_socket_addrs()
        .map_err(|_| invalid())?
        .next()
        .ok_or_else(invalid)
}

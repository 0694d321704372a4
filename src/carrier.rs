//! Byte-duplex carriers
//!
//! The device end of the MUP1 link is reachable three ways: a local
//! serial port (plain filesystem path), a raw TCP bridge
//! (`termhub://host:port`), or a telnet console server
//! (`telnet://host:port`). All three expose the same blocking
//! read-with-timeout surface to the driver; nothing above this layer
//! knows which transport is in use.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use serialport::SerialPort;

use crate::error::{Error, Result};

const SERIAL_BAUD: u32 = 115_200;

/// Telnet negotiation: IAC WILL BIN, IAC DO BIN, IAC DO ECHO
const TELNET_HANDSHAKE: [u8; 9] = [0xFF, 0xFB, 0x03, 0xFF, 0xFD, 0x03, 0xFF, 0xFD, 0x01];

/// Stand-in for an unbounded wait; both transports need a finite value
const INDEFINITE: Duration = Duration::from_secs(3600);

/// A connected byte-duplex channel
#[derive(Debug)]
pub enum Carrier {
    Serial(Box<dyn SerialPort>),
    Tcp(TcpStream),
}

impl Carrier {
    /// Open a carrier from its URI form
    pub fn open(uri: &str) -> Result<Self> {
        if let Some(rest) = uri.strip_prefix("termhub://") {
            return Self::open_tcp(rest, false);
        }
        if let Some(rest) = uri.strip_prefix("telnet://") {
            return Self::open_tcp(rest, true);
        }
        if uri.contains("://") {
            return Err(Error::Carrier(format!("unsupported carrier URI {:?}", uri)));
        }
        Self::open_serial(uri)
    }

    fn open_serial(path: &str) -> Result<Self> {
        let port = serialport::new(path, SERIAL_BAUD)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| Error::Carrier(format!("open {}: {}", path, e)))?;
        log::debug!("serial carrier on {} at {} 8N1", path, SERIAL_BAUD);
        Ok(Carrier::Serial(port))
    }

    fn open_tcp(addr: &str, telnet: bool) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .map_err(|e| Error::Carrier(format!("connect {}: {}", addr, e)))?;
        stream.set_nodelay(true).ok();

        if telnet {
            let mut stream = stream;
            stream.write_all(&TELNET_HANDSHAKE)?;
            // discard the server's reply to the negotiation
            stream.set_read_timeout(Some(Duration::from_millis(200)))?;
            let mut scratch = [0u8; 64];
            let _ = stream.read(&mut scratch);
            log::debug!("telnet carrier on {}", addr);
            return Ok(Carrier::Tcp(stream));
        }

        log::debug!("termhub carrier on {}", addr);
        Ok(Carrier::Tcp(stream))
    }

    /// Blocking read with a bounded wait; returns 0 on timeout
    pub fn read_timeout(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        let wait = timeout.unwrap_or(INDEFINITE).max(Duration::from_millis(1));
        let result = match self {
            Carrier::Serial(port) => {
                port.set_timeout(wait)
                    .map_err(|e| Error::Carrier(format!("set timeout: {}", e)))?;
                port.read(buf)
            }
            Carrier::Tcp(stream) => {
                stream.set_read_timeout(Some(wait))?;
                stream.read(buf)
            }
        };
        match result {
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => Ok(0),
            Err(e) => Err(Error::Io(e)),
        }
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        match self {
            Carrier::Serial(port) => {
                port.write_all(bytes)?;
                port.flush()?;
            }
            Carrier::Tcp(stream) => {
                stream.write_all(bytes)?;
                stream.flush()?;
            }
        }
        Ok(())
    }
}

//! Physical layer: serial framing, echo-cancellation, break generation.

use std::io::{self, Read, Write};
use std::time::Duration;

use log::{info, trace};
use serialport::{DataBits, Parity, SerialPort, StopBits};

use crate::consts::{UPDI_BREAK, UPDI_PHY_SYNC};
use crate::error::PhyError;

/// Abstraction over a half-duplex serial connection, implemented for a real
/// `serialport` handle and for an in-memory mock used by tests.
///
/// Reconfiguring baud/parity/stop-bits happens in place on the existing
/// handle rather than closing and reopening the OS file descriptor; this is
/// functionally equivalent to the close/reopen dance of the tool this crate
/// is descended from and is the more idiomatic way to express it on top of
/// the `serialport` crate (see DESIGN.md).
pub trait SerialTransport: Read + Write {
    fn set_baud_rate(&mut self, baud: u32) -> io::Result<()>;
    fn set_parity(&mut self, parity: Parity) -> io::Result<()>;
    fn set_stop_bits(&mut self, stop_bits: StopBits) -> io::Result<()>;
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;
}

impl SerialTransport for Box<dyn SerialPort> {
    fn set_baud_rate(&mut self, baud: u32) -> io::Result<()> {
        SerialPort::set_baud_rate(self.as_mut(), baud).map_err(io::Error::from)
    }

    fn set_parity(&mut self, parity: Parity) -> io::Result<()> {
        SerialPort::set_parity(self.as_mut(), parity).map_err(io::Error::from)
    }

    fn set_stop_bits(&mut self, stop_bits: StopBits) -> io::Result<()> {
        SerialPort::set_stop_bits(self.as_mut(), stop_bits).map_err(io::Error::from)
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        SerialPort::set_timeout(self.as_mut(), timeout).map_err(io::Error::from)
    }
}

/// Default working baud rate; the working serial configuration overall.
const WORKING_TIMEOUT: Duration = Duration::from_secs(1);
const BREAK_BAUD: u32 = 300;

pub struct Phy<T: SerialTransport> {
    port: T,
    baud: u32,
}

impl Phy<Box<dyn SerialPort>> {
    /// Opens a real serial port at `path`/`baud` with the UPDI framing
    /// (even parity, two stop bits) and sends the initial break handshake.
    pub fn open(path: &str, baud: u32) -> Result<Self, PhyError> {
        info!("opening {} at {} baud", path, baud);
        let port = serialport::new(path, baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::Even)
            .stop_bits(StopBits::Two)
            .timeout(WORKING_TIMEOUT)
            .open()
            .map_err(|source| PhyError::Open {
                port: path.to_string(),
                source,
            })?;
        let mut phy = Phy { port, baud };
        phy.send(&[UPDI_BREAK])?;
        Ok(phy)
    }
}

impl<T: SerialTransport> Phy<T> {
    /// Wraps an already-open transport (used by tests with a mock).
    pub fn from_transport(port: T, baud: u32) -> Self {
        Phy { port, baud }
    }

    /// Sends `bytes` one at a time and discards the one-byte echo after
    /// each, matching the reference tool's default pacing.
    pub fn send_slow(&mut self, bytes: &[u8]) -> Result<(), PhyError> {
        trace!("send_slow {:02x?}", bytes);
        for &b in bytes {
            self.port.write_all(&[b])?;
            let mut echo = [0u8; 1];
            let got = self.read_best_effort(&mut echo)?;
            if got != 1 {
                return Err(PhyError::EchoLost {
                    expected: 1,
                    got,
                });
            }
        }
        Ok(())
    }

    /// Sends `bytes` as a single write, then reads back and discards the
    /// echo in one block read. This is the default, much faster than
    /// [`Phy::send_slow`].
    pub fn send(&mut self, bytes: &[u8]) -> Result<(), PhyError> {
        trace!("send {:02x?}", bytes);
        self.port.write_all(bytes)?;
        let mut echo = vec![0u8; bytes.len()];
        let got = self.read_best_effort(&mut echo)?;
        if got != bytes.len() {
            return Err(PhyError::EchoLost {
                expected: bytes.len(),
                got,
            });
        }
        Ok(())
    }

    /// Reads up to `size` bytes, one read attempt at a time. A single empty
    /// read is tolerated (decrementing `timeout` from 1 to 0) and ends the
    /// loop immediately, without a further read attempt — matching the
    /// reference tool's `while size and timeout` loop, where the timeout
    /// countdown is checked before the next read rather than after a second
    /// failure. Never blocks beyond the port's configured read timeout.
    pub fn receive(&mut self, size: usize) -> Vec<u8> {
        let mut response = Vec::with_capacity(size);
        let mut timeout = 1;
        let mut byte = [0u8; 1];
        while response.len() < size && timeout > 0 {
            match self.port.read(&mut byte) {
                Ok(1) => response.push(byte[0]),
                _ => timeout -= 1,
            }
        }
        trace!("receive {:02x?}", response);
        response
    }

    /// Sends SYNC + the SIB key command and reads back the ASCII SIB line.
    pub fn sib(&mut self) -> Result<Vec<u8>, PhyError> {
        use crate::consts::{key, opcode};
        self.send(&[UPDI_PHY_SYNC, opcode::KEY | key::SIB | key::SIB_16BYTES])?;
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        for _ in 0..32 {
            match self.port.read(&mut byte) {
                Ok(1) => {
                    if byte[0] == b'\n' {
                        break;
                    }
                    line.push(byte[0]);
                }
                _ => break,
            }
        }
        Ok(line)
    }

    /// Resyncs the UPDI state machine by holding the line low for longer
    /// than one frame, twice in a row, then restores the working config.
    pub fn send_double_break(&mut self) -> Result<(), PhyError> {
        info!("sending double break");
        self.port.set_baud_rate(BREAK_BAUD)?;
        self.port.set_parity(Parity::None)?;
        self.port.set_stop_bits(StopBits::One)?;

        self.port.write_all(&[UPDI_BREAK, UPDI_BREAK])?;
        let mut discard = [0u8; 2];
        let _ = self.read_best_effort(&mut discard);

        self.port.set_baud_rate(self.baud)?;
        self.port.set_parity(Parity::Even)?;
        self.port.set_stop_bits(StopBits::Two)?;
        self.port.set_timeout(WORKING_TIMEOUT)?;
        Ok(())
    }

    fn read_best_effort(&mut self, buf: &mut [u8]) -> Result<usize, PhyError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.port.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(e) => return Err(PhyError::Io(e)),
            }
        }
        Ok(filled)
    }
}

//! Framed byte stream between a worker and a debugger proxy.
//!
//! Every multi-byte integer crosses the wire big-endian. A frame is a `u32`
//! length followed by that many raw bytes, without terminator. Primitives
//! return [`Error::SessionLost`] or [`Error::ConnectionClosed`] when the peer
//! or the network is gone; a session loop must drop the channel on those
//! (see [`Error::is_fatal`]). Other socket errors are retried in place, so a
//! frame is never left half read. A stream that keeps failing is lost after
//! [`TRANSIENT_RETRY_LIMIT`] errors in a row.

use crate::debugger::error::Error;
use crate::debugger::process::IdentityToken;
use crate::pd_debug;
use bytes::{Buf, BufMut, BytesMut};
use nix::errno::Errno;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};

/// Protocol version exchanged during handshake.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Prefix of the notice a worker emits when it waits for a proxy.
pub const BREAK_NOTICE_PREFIX: &str = "PLDBGBREAK:";

/// Longest accepted frame.
pub const MAX_FRAME_LEN: u32 = 0x3fff_ffff;

/// Consecutive non-fatal socket errors tolerated within one transfer.
pub const TRANSIENT_RETRY_LIMIT: u32 = 8;

#[derive(Clone, Copy, Debug, PartialEq)]
enum Direction {
    Read,
    Write,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum IoClass {
    Retry,
    Fatal,
    Transient,
}

fn classify(err: &io::Error, direction: Direction) -> IoClass {
    match err.kind() {
        io::ErrorKind::Interrupted if direction == Direction::Read => return IoClass::Retry,
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => return IoClass::Retry,
        _ => {}
    }

    let Some(errno) = err.raw_os_error().map(Errno::from_i32) else {
        return match err.kind() {
            io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset => IoClass::Fatal,
            _ => IoClass::Transient,
        };
    };

    match errno {
        Errno::EINTR
        | Errno::ECONNREFUSED
        | Errno::EPIPE
        | Errno::ENOTCONN
        | Errno::ENETDOWN
        | Errno::ENETUNREACH
        | Errno::ENETRESET
        | Errno::ECONNABORTED
        | Errno::ESHUTDOWN
        | Errno::EHOSTDOWN
        | Errno::ECONNRESET => IoClass::Fatal,
        _ => IoClass::Transient,
    }
}

/// Decide whether a transfer goes on after `err`. `transient` counts
/// non-fatal errors since the last progress.
fn recover(err: io::Error, direction: Direction, transient: &mut u32) -> Result<(), Error> {
    match classify(&err, direction) {
        IoClass::Retry => Ok(()),
        IoClass::Fatal => Err(Error::SessionLost(err)),
        IoClass::Transient => {
            *transient += 1;
            if *transient > TRANSIENT_RETRY_LIMIT {
                return Err(Error::SessionLost(err));
            }
            pd_debug!(target: "transport", "{direction:?} retry {transient} after socket error: {err}");
            Ok(())
        }
    }
}

/// Bidirectional framed channel.
pub struct Channel<S = TcpStream> {
    stream: S,
}

impl Channel<TcpStream> {
    /// Wrap a connected socket. Nagle is disabled, frames are small and
    /// request-response shaped.
    pub fn from_tcp(stream: TcpStream) -> Result<Self, Error> {
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    /// Shut down both halves of the connection, the peer sees end of stream.
    pub fn shutdown(&self) -> Result<(), Error> {
        self.stream.shutdown(Shutdown::Both)?;
        Ok(())
    }
}

impl<S: Read + Write> Channel<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Fill the whole buffer, retrying short, interrupted and failed reads.
    pub fn read_exactly(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        let mut filled = 0;
        let mut transient = 0;
        while filled < buf.len() {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => {
                    filled += n;
                    transient = 0;
                }
                Err(e) => recover(e, Direction::Read, &mut transient)?,
            }
        }
        Ok(())
    }

    /// Write the whole buffer, retrying short and failed writes.
    pub fn write_exactly(&mut self, buf: &[u8]) -> Result<(), Error> {
        let mut written = 0;
        let mut transient = 0;
        while written < buf.len() {
            match self.stream.write(&buf[written..]) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => {
                    written += n;
                    transient = 0;
                }
                Err(e) => recover(e, Direction::Write, &mut transient)?,
            }
        }
        loop {
            match self.stream.flush() {
                Ok(()) => return Ok(()),
                Err(e) => recover(e, Direction::Write, &mut transient)?,
            }
        }
    }

    pub fn read_u32(&mut self) -> Result<u32, Error> {
        let mut raw = [0u8; 4];
        self.read_exactly(&mut raw)?;
        Ok((&raw[..]).get_u32())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<(), Error> {
        self.write_exactly(&value.to_be_bytes())
    }

    pub fn read_token(&mut self) -> Result<IdentityToken, Error> {
        let mut raw = [0u8; 8];
        self.read_exactly(&mut raw)?;
        Ok(IdentityToken((&raw[..]).get_u64()))
    }

    pub fn write_token(&mut self, token: IdentityToken) -> Result<(), Error> {
        self.write_exactly(&token.0.to_be_bytes())
    }

    /// Read one frame. A length over the limit leaves the stream
    /// desynchronized, the error is fatal.
    fn read_frame(&mut self) -> Result<Vec<u8>, Error> {
        let len = self.read_u32()?;
        if len > MAX_FRAME_LEN {
            return Err(Error::FrameTooLarge(len));
        }
        let mut payload = vec![0u8; len as usize];
        self.read_exactly(&mut payload)?;
        Ok(payload)
    }

    fn write_frame(&mut self, payload: &[u8]) -> Result<(), Error> {
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= MAX_FRAME_LEN)
            .ok_or(Error::FrameTooLarge(u32::MAX))?;
        let mut frame = BytesMut::with_capacity(4 + payload.len());
        frame.put_u32(len);
        frame.put_slice(payload);
        self.write_exactly(&frame)
    }

    /// Send a framed string.
    pub fn send_string(&mut self, s: &str) -> Result<(), Error> {
        self.write_frame(s.as_bytes())
    }

    /// Read a framed string, an empty frame is returned as an empty string.
    pub fn read_str(&mut self) -> Result<String, Error> {
        Ok(String::from_utf8(self.read_frame()?)?)
    }

    /// Read a framed string, an empty frame is returned as `None`.
    ///
    /// Only the version reply of a proxy is read this way, a proxy that has
    /// nothing to say about its version sends an empty frame.
    pub fn get_nstring(&mut self) -> Result<Option<String>, Error> {
        let s = self.read_str()?;
        Ok((!s.is_empty()).then_some(s))
    }

    pub fn send_bool(&mut self, value: bool) -> Result<(), Error> {
        self.send_string(if value { "t" } else { "f" })
    }

    /// Read a framed boolean. A frame starting with `t` is true, anything
    /// else, empty frame included, is false.
    pub fn get_bool(&mut self) -> Result<bool, Error> {
        Ok(self.read_frame()?.first() == Some(&b't'))
    }

    /// Format a message and send it as a framed string.
    pub fn send_message(&mut self, args: fmt::Arguments) -> Result<(), Error> {
        self.send_string(&fmt::format(args))
    }
}

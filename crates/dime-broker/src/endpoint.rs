use std::io::{self, Read, Write};

use dime_proto::{Decoder, Frame, FrameError};
use mio::net::{TcpStream, UnixStream};
use mio::{Interest, Registry, Token};

const READ_CHUNK: usize = 16 * 1024;

/// Either transport DiME listens on. Framing and backpressure handling are
/// identical either way — only the underlying `mio` type differs.
pub enum RawStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl RawStream {
    fn register(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        match self {
            Self::Tcp(s) => registry.register(s, token, interest),
            Self::Unix(s) => registry.register(s, token, interest),
        }
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        match self {
            Self::Tcp(s) => registry.reregister(s, token, interest),
            Self::Unix(s) => registry.reregister(s, token, interest),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Self::Tcp(s) => registry.deregister(s),
            Self::Unix(s) => registry.deregister(s),
        }
    }
}

impl Read for RawStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            Self::Unix(s) => s.read(buf),
        }
    }
}

impl Write for RawStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            Self::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.flush(),
            Self::Unix(s) => s.flush(),
        }
    }
}

#[derive(Debug)]
pub enum ReadError {
    /// The peer closed the connection (read returned 0) or an I/O error
    /// occurred. Either way the connection is done.
    Closed,
    /// A framing violation. The contract is to close without trying to
    /// resynchronize on the stream.
    Frame(FrameError),
}

impl From<io::Error> for ReadError {
    fn from(_: io::Error) -> Self {
        Self::Closed
    }
}

/// One socket's raw byte plumbing: buffering partial reads, buffering
/// unwritten bytes across `WouldBlock`, and tracking whether WRITABLE
/// interest is currently armed.
///
/// Read and write buffers are split the same way any non-blocking stream
/// wrapper splits them, collapsed to a single contiguous write buffer since
/// frames here are already serialized in order by the caller and don't need
/// per-message backlog bookkeeping.
pub struct Endpoint {
    stream: RawStream,
    peer: String,
    rbuf: Vec<u8>,
    wbuf: Vec<u8>,
    writable_armed: bool,
}

impl Endpoint {
    pub fn new(stream: RawStream, peer: String) -> Self {
        Self { stream, peer, rbuf: Vec::with_capacity(4096), wbuf: Vec::new(), writable_armed: false }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        self.stream.register(registry, token, Interest::READABLE)
    }

    pub fn deregister(&mut self, registry: &Registry) {
        let _ = self.stream.deregister(registry);
    }

    /// Drains every fully-buffered frame currently available without
    /// blocking into `out`. Returns once the socket would block; a partial
    /// frame is simply left in `rbuf` for the next readable event.
    pub fn read_frames(&mut self, decoder: &Decoder, out: &mut Vec<Frame>) -> Result<(), ReadError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(ReadError::Closed),
                Ok(n) => self.rbuf.extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return Err(ReadError::Closed),
            }
        }

        loop {
            match decoder.decode_from(&mut self.rbuf) {
                Ok(Some(frame)) => out.push(frame),
                Ok(None) => break,
                Err(err) => return Err(ReadError::Frame(err)),
            }
        }
        Ok(())
    }

    pub fn enqueue_frame(&mut self, frame: &Frame) -> Result<(), FrameError> {
        frame.encode_into(&mut self.wbuf)
    }

    pub fn has_pending_write(&self) -> bool {
        !self.wbuf.is_empty()
    }

    /// Writes as much of `wbuf` as the kernel accepts without blocking, then
    /// (re)arms WRITABLE interest based on whether any bytes remain.
    pub fn flush(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        while !self.wbuf.is_empty() {
            match self.stream.write(&self.wbuf) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
                Ok(n) => drop(self.wbuf.drain(..n)),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.sync_writable_interest(registry, token)
    }

    fn sync_writable_interest(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        let want = self.has_pending_write();
        if want != self.writable_armed {
            let interest = if want { Interest::READABLE | Interest::WRITABLE } else { Interest::READABLE };
            self.stream.reregister(registry, token, interest)?;
            self.writable_armed = want;
        }
        Ok(())
    }
}

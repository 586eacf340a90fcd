use super::*;

/// Handshake and relay state of a single socket.
///
/// A client leg walks `AwaitingGreeting → AwaitingRequest → Resolving (domain
/// targets) → Connecting → Relaying`; the upstream leg is created in
/// `Dialing` and jumps straight to `Relaying` when the connect settles.
/// `Closing` means the write buffer is flushed and the socket closed once it
/// drains.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    AwaitingGreeting,
    AwaitingRequest,
    Resolving,
    /// Client leg, waiting for its upstream dial to settle.
    Connecting,
    /// Upstream leg, non-blocking connect in flight.
    Dialing,
    Relaying,
    Closing,
}

/// Per-socket record owned by the server's connection table.
///
/// `peer` is the slab index of the other leg of the session, a non-owning
/// back-reference: whoever closes a connection is responsible for clearing
/// the index stored on the survivor. `want_read`/`want_write` are the desired
/// interest set; `apply_interest` reconciles them with the registration
/// actually held on the poller.
pub struct Connection {
    pub stream: TcpStream,
    pub token: Token,
    pub addr: SocketAddr,
    pub phase: Phase,
    pub seq: u64,
    pub peer: Option<usize>,
    pub rbuf: Vec<u8>,
    wbuf: Vec<u8>,
    wpos: usize,
    pub want_read: bool,
    pub want_write: bool,
    registered: Option<Interest>,
}

impl Connection {
    pub fn client(stream: TcpStream, token: Token, addr: SocketAddr, seq: u64) -> Self {
        Self::new(stream, token, addr, seq, Phase::AwaitingGreeting, true, false)
    }

    pub fn upstream(stream: TcpStream, token: Token, addr: SocketAddr, seq: u64) -> Self {
        Self::new(stream, token, addr, seq, Phase::Dialing, false, true)
    }

    fn new(
        stream: TcpStream,
        token: Token,
        addr: SocketAddr,
        seq: u64,
        phase: Phase,
        want_read: bool,
        want_write: bool,
    ) -> Self {
        Self {
            stream,
            token,
            addr,
            phase,
            seq,
            peer: None,
            rbuf: Vec::new(),
            wbuf: Vec::new(),
            wpos: 0,
            want_read,
            want_write,
            registered: None,
        }
    }

    /// Reads until the socket would block or the buffer reaches `cap`.
    /// `Ok(true)` means the remote closed its end.
    pub fn fill(&mut self, cap: usize) -> io::Result<bool> {
        let mut buf = [0u8; 16384];
        while self.rbuf.len() < cap {
            match self.stream.read(&mut buf) {
                Ok(0) => return Ok(true),
                Ok(n) => self.rbuf.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }

    /// Writes pending bytes until the socket would block, `Ok(true)` when the
    /// buffer fully drained.
    pub fn flush(&mut self) -> io::Result<bool> {
        while self.wpos < self.wbuf.len() {
            match self.stream.write(&self.wbuf[self.wpos..]) {
                Ok(n) => self.wpos += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.wbuf.clear();
        self.wpos = 0;
        Ok(true)
    }

    /// Appends outbound bytes, reclaiming the buffer first if it is drained.
    pub fn queue(&mut self, data: &[u8]) {
        if self.wpos == self.wbuf.len() {
            self.wbuf.clear();
            self.wpos = 0;
        }
        self.wbuf.extend_from_slice(data);
    }

    pub fn pending(&self) -> &[u8] {
        &self.wbuf[self.wpos..]
    }

    pub fn has_pending(&self) -> bool {
        self.wpos < self.wbuf.len()
    }

    pub fn consume(&mut self, n: usize) {
        self.wpos += n;
        if self.wpos == self.wbuf.len() {
            self.wbuf.clear();
            self.wpos = 0;
        }
    }

    /// Brings the poller registration in line with the desired interest set.
    /// No desired interest at all means the socket is deregistered, which is
    /// how a leg is parked while its counterpart catches up.
    pub fn apply_interest(&mut self, registry: &Registry) -> io::Result<()> {
        let interest = match (self.want_read, self.want_write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        };

        match (self.registered, interest) {
            (None, Some(new)) => registry.register(&mut self.stream, self.token, new)?,
            (Some(old), Some(new)) => {
                if old != new {
                    registry.reregister(&mut self.stream, self.token, new)?;
                }
            }
            (Some(_), None) => registry.deregister(&mut self.stream)?,
            (None, None) => {}
        }
        self.registered = interest;

        Ok(())
    }

    pub fn is_registered(&self) -> bool {
        self.registered.is_some()
    }
}

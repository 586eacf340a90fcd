use std::io::{self, Read, Write};
use std::mem;
use std::net::{SocketAddr, SocketAddrV4};

use log::{debug, info, warn};
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use slab::Slab;

use crate::error::{Error, Result};
use crate::resolver::{Resolution, Resolver};
use crate::socks5::{
    decode_greeting, decode_request, encode_method, encode_reply, Reply, Request, Socks5Target,
    METHOD_NO_AUTH, METHOD_UNACCEPTABLE,
};

pub use self::conn::{Connection, Phase};

mod conn;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const TOKEN_BASE: usize = 2;

const BUF_SIZE: usize = 1048576;
const EVENTS_CAPACITY: usize = 1024;

/// Single-threaded SOCKS5 proxy server.
///
/// One thread owns the poller and every socket; all I/O is non-blocking and
/// every live socket's registration reflects exactly what it still waits for.
/// Per-connection failures are contained to that connection and its paired
/// leg, only a poller failure ends the loop.
pub struct Server {
    poll: Poll,
    listener: TcpListener,
    local: SocketAddrV4,
    conns: Slab<Connection>,
    resolver: Resolver,
    next_seq: u64,
}

impl Server {
    pub fn bind(addr: SocketAddrV4) -> Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(addr.into())?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Waker::new(poll.registry(), WAKER)?;

        let local = match listener.local_addr()? {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => return Err("IPv6 listen addresses are not supported".into()),
        };

        Ok(Self {
            poll,
            listener,
            local,
            conns: Slab::new(),
            resolver: Resolver::new(waker),
            next_seq: 0,
        })
    }

    /// The listening address, also used as the bound address in every reply.
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local
    }

    pub fn run(&mut self) -> Result<()> {
        info!("listening on {}", self.local);

        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept(),
                    WAKER => self.drain_resolutions(),
                    Token(t) => self.ready(t - TOKEN_BASE, event),
                }
            }
        }
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    let seq = self.next_seq;
                    self.next_seq += 1;

                    let entry = self.conns.vacant_entry();
                    let idx = entry.key();
                    let token = Token(idx + TOKEN_BASE);
                    let conn = entry.insert(Connection::client(stream, token, addr, seq));
                    match conn.apply_interest(self.poll.registry()) {
                        Ok(()) => info!("accepted connection from {}", addr),
                        Err(e) => {
                            warn!("failed to register {}: {}", addr, e);
                            self.conns.remove(idx);
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    /// Dispatches one readiness event to the connection it belongs to.
    fn ready(&mut self, idx: usize, event: &Event) {
        // The connection may have been torn down by an earlier event in the
        // same wakeup.
        if !self.conns.contains(idx) {
            return;
        }

        if self.conns[idx].phase == Phase::Dialing {
            if event.is_writable()
                || event.is_error()
                || event.is_read_closed()
                || event.is_write_closed()
            {
                if let Err(e) = self.connect_complete(idx) {
                    self.fail(idx, e);
                }
            }
            return;
        }

        if event.is_readable() || event.is_read_closed() {
            if let Err(e) = self.read(idx) {
                self.fail(idx, e);
            }
        }

        if !self.conns.contains(idx) {
            return;
        }
        if event.is_writable() {
            if let Err(e) = self.write(idx) {
                self.fail(idx, e);
            }
        }
    }

    fn fail(&mut self, idx: usize, e: Error) {
        if let Some(conn) = self.conns.get(idx) {
            debug!("{}: {}", conn.addr, e);
        }
        self.close(idx);
    }

    fn read(&mut self, idx: usize) -> Result<()> {
        let eof = self.conns[idx].fill(BUF_SIZE)?;

        match self.conns[idx].phase {
            Phase::AwaitingGreeting => self.greeting(idx)?,
            Phase::AwaitingRequest => self.request(idx)?,
            Phase::Relaying => self.forward(idx)?,
            _ => {}
        }

        if eof && self.conns.contains(idx) {
            let conn = &self.conns[idx];
            // A refusal still in the write buffer is flushed before teardown.
            if !(conn.phase == Phase::Closing && conn.has_pending()) {
                self.close(idx);
            }
        }
        Ok(())
    }

    fn greeting(&mut self, idx: usize) -> Result<()> {
        let registry = self.poll.registry();
        let conn = &mut self.conns[idx];

        let greeting = match decode_greeting(&conn.rbuf) {
            Some(greeting) => greeting,
            None => return Ok(()),
        };

        if !greeting.accept {
            debug!("{}: no acceptable authentication method", conn.addr);
            conn.queue(&encode_method(METHOD_UNACCEPTABLE));
            conn.phase = Phase::Closing;
            conn.want_read = false;
            conn.want_write = true;
            conn.apply_interest(registry)?;
            return Ok(());
        }

        conn.rbuf.drain(..greeting.len);
        conn.queue(&encode_method(METHOD_NO_AUTH));
        conn.phase = Phase::AwaitingRequest;
        conn.want_write = true;
        conn.apply_interest(registry)?;
        debug!("{}: method negotiation complete", conn.addr);

        // The request may have arrived in the same segment as the greeting.
        if !self.conns[idx].rbuf.is_empty() {
            self.request(idx)?;
        }
        Ok(())
    }

    fn request(&mut self, idx: usize) -> Result<()> {
        let request = match decode_request(&self.conns[idx].rbuf) {
            Some(request) => request,
            None => return Ok(()),
        };

        match request {
            Request::Invalid(reply) => {
                warn!("{}: request refused: {}", self.conns[idx].addr, reply);
                self.reject(idx, reply)
            }
            Request::Connect { len, target } => {
                let conn = &mut self.conns[idx];
                conn.rbuf.drain(..len);
                // Parked until the dial settles.
                conn.want_read = false;
                conn.apply_interest(self.poll.registry())?;
                info!("{} -> {}", conn.addr, target);

                match target {
                    Socks5Target::V4(addr) => self.start_connect(idx, addr),
                    Socks5Target::Domain(domain) => {
                        let conn = &mut self.conns[idx];
                        conn.phase = Phase::Resolving;
                        self.resolver.lookup(idx, conn.seq, domain);
                        Ok(())
                    }
                }
            }
        }
    }

    /// Queues an error reply and lets the write handler close the connection
    /// once it is flushed.
    fn reject(&mut self, idx: usize, reply: Reply) -> Result<()> {
        let msg = encode_reply(reply, self.local);
        let conn = &mut self.conns[idx];
        conn.queue(&msg);
        conn.phase = Phase::Closing;
        conn.want_read = false;
        conn.want_write = true;
        conn.apply_interest(self.poll.registry())?;
        Ok(())
    }

    /// Opens the outbound leg and links both connections to each other, so
    /// either side dying before the connect settles tears down both.
    fn start_connect(&mut self, idx: usize, addr: SocketAddrV4) -> Result<()> {
        let stream = match TcpStream::connect(addr.into()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("failed to connect {}: {}", addr, e);
                return self.reject(idx, Reply::ConnectionFailure);
            }
        };

        let seq = self.next_seq;
        self.next_seq += 1;

        let entry = self.conns.vacant_entry();
        let uidx = entry.key();
        let upstream = entry.insert(Connection::upstream(
            stream,
            Token(uidx + TOKEN_BASE),
            SocketAddr::V4(addr),
            seq,
        ));
        upstream.peer = Some(idx);

        let conn = &mut self.conns[idx];
        conn.peer = Some(uidx);
        conn.phase = Phase::Connecting;

        self.conns[uidx].apply_interest(self.poll.registry())?;
        Ok(())
    }

    /// Settles a pending upstream connect, one way or the other.
    fn connect_complete(&mut self, uidx: usize) -> Result<()> {
        if let Some(e) = self.conns[uidx].stream.take_error()? {
            return self.connect_failed(uidx, e);
        }
        match self.conns[uidx].stream.peer_addr() {
            Ok(_) => {}
            Err(ref e)
                if e.kind() == io::ErrorKind::NotConnected
                    || e.raw_os_error() == Some(libc::EINPROGRESS) =>
            {
                // Spurious wakeup, the connect is still in flight.
                return Ok(());
            }
            Err(e) => return self.connect_failed(uidx, e),
        }

        let cidx = match self.conns[uidx].peer {
            Some(cidx) => cidx,
            None => {
                self.close(uidx);
                return Ok(());
            }
        };

        let upstream_addr = self.conns[uidx].addr;
        let reply = encode_reply(Reply::Success, self.local);

        let upstream = &mut self.conns[uidx];
        upstream.phase = Phase::Relaying;
        upstream.want_write = false;
        upstream.apply_interest(self.poll.registry())?;

        let client = &mut self.conns[cidx];
        client.phase = Phase::Relaying;
        client.queue(&reply);
        client.want_read = true;
        client.want_write = true;
        client.apply_interest(self.poll.registry())?;
        info!("{} => {} connected", client.addr, upstream_addr);

        // Bytes the client sent ahead of the reply.
        if !self.conns[cidx].rbuf.is_empty() {
            self.forward(cidx)?;
        }
        Ok(())
    }

    fn connect_failed(&mut self, uidx: usize, e: io::Error) -> Result<()> {
        let cidx = self.conns[uidx].peer.take();
        warn!("{} dropped the connection: {}", self.conns[uidx].addr, e);

        if let Some(cidx) = cidx {
            if let Some(client) = self.conns.get_mut(cidx) {
                client.peer = None;
            }
        }
        self.close(uidx);

        if let Some(cidx) = cidx {
            if self.conns.contains(cidx) {
                self.reject(cidx, Reply::ConnectionFailure)?;
            }
        }
        Ok(())
    }

    /// Hands everything read on this leg to its peer and flips interest:
    /// this leg stops reading until the peer has drained the data.
    fn forward(&mut self, idx: usize) -> Result<()> {
        if self.conns[idx].rbuf.is_empty() {
            return Ok(());
        }
        let pidx = match self.conns[idx].peer {
            Some(pidx) => pidx,
            None => return Ok(()),
        };

        let data = mem::take(&mut self.conns[idx].rbuf);

        let peer = &mut self.conns[pidx];
        peer.queue(&data);
        peer.want_write = true;
        peer.apply_interest(self.poll.registry())?;

        let conn = &mut self.conns[idx];
        conn.want_read = false;
        conn.apply_interest(self.poll.registry())?;
        Ok(())
    }

    fn write(&mut self, idx: usize) -> Result<()> {
        if !self.conns[idx].flush()? {
            return Ok(());
        }

        match self.conns[idx].phase {
            Phase::Closing => self.close(idx),
            Phase::Relaying => {
                let pidx = self.conns[idx].peer;

                let conn = &mut self.conns[idx];
                conn.want_write = false;
                conn.apply_interest(self.poll.registry())?;

                match pidx {
                    Some(pidx) => {
                        // The peer may read again now that its data is out.
                        if let Some(peer) = self.conns.get_mut(pidx) {
                            peer.want_read = true;
                            peer.apply_interest(self.poll.registry())?;
                        }
                    }
                    // Final flush of a shutdown propagated from the peer.
                    None => self.close(idx),
                }
            }
            _ => {
                // A handshake reply went out; keep whatever read interest the
                // phase already holds.
                let conn = &mut self.conns[idx];
                conn.want_write = false;
                conn.apply_interest(self.poll.registry())?;
            }
        }
        Ok(())
    }

    fn drain_resolutions(&mut self) {
        while let Some(resolution) = self.resolver.try_recv() {
            self.resolved(resolution);
        }
    }

    fn resolved(&mut self, resolution: Resolution) {
        let Resolution { conn, seq, result } = resolution;

        // The client may be gone, or the slot reused, by the time the lookup
        // finished.
        match self.conns.get(conn) {
            Some(c) if c.seq == seq && c.phase == Phase::Resolving => {}
            _ => return,
        }

        let r = match result {
            Some(addr) => self.start_connect(conn, addr),
            None => {
                warn!("{}: failed to find domain", self.conns[conn].addr);
                self.reject(conn, Reply::NetworkUnavailable)
            }
        };
        if let Err(e) = r {
            self.fail(conn, e);
        }
    }

    /// Removes a connection and propagates the shutdown to its peer: a peer
    /// with data still queued is switched to write-only so it can flush
    /// before it is closed in turn, an idle peer is closed immediately.
    fn close(&mut self, idx: usize) {
        if !self.conns.contains(idx) {
            return;
        }
        let mut conn = self.conns.remove(idx);
        if conn.is_registered() {
            let _ = self.poll.registry().deregister(&mut conn.stream);
        }
        debug!("{} closed", conn.addr);

        if let Some(pidx) = conn.peer {
            if let Some(peer) = self.conns.get_mut(pidx) {
                peer.peer = None;
                if peer.has_pending() {
                    peer.phase = Phase::Closing;
                    peer.want_read = false;
                    peer.want_write = true;
                    if peer.apply_interest(self.poll.registry()).is_err() {
                        self.close(pidx);
                    }
                } else {
                    self.close(pidx);
                }
            }
        }
    }
}

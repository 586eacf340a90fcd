use std::net::{SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use log::debug;
use mio::Waker;

/// The outcome of a background lookup, delivered to the reactor thread.
///
/// `conn` is the slab index of the client that asked for it and `seq` its
/// generation stamp; the pair guards against the slot having been reused by
/// the time the lookup finishes.
pub struct Resolution {
    pub conn: usize,
    pub seq: u64,
    pub result: Option<SocketAddrV4>,
}

/// Resolves `host:port` targets off the reactor thread.
///
/// Each lookup runs on its own thread so a slow or hung name server never
/// stalls the event loop; the result is queued on a channel and the reactor
/// is woken to collect it.
pub struct Resolver {
    waker: Arc<Waker>,
    tx: Sender<Resolution>,
    rx: Receiver<Resolution>,
}

impl Resolver {
    pub fn new(waker: Waker) -> Self {
        let (tx, rx) = channel();
        Self {
            waker: Arc::new(waker),
            tx,
            rx,
        }
    }

    /// Starts a lookup for `target` (a `host:port` string), filtered to the
    /// first IPv4 address.
    pub fn lookup(&self, conn: usize, seq: u64, target: String) {
        let tx = self.tx.clone();
        let waker = self.waker.clone();

        thread::spawn(move || {
            let result = target
                .to_socket_addrs()
                .ok()
                .and_then(|mut addrs| {
                    addrs.find_map(|addr| match addr {
                        SocketAddr::V4(v4) => Some(v4),
                        SocketAddr::V6(_) => None,
                    })
                });
            debug!("resolved {} => {:?}", target, result);

            // The reactor may already be gone on shutdown.
            let _ = tx.send(Resolution { conn, seq, result });
            let _ = waker.wake();
        });
    }

    pub fn try_recv(&self) -> Option<Resolution> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use mio::{Poll, Token};

    use super::*;

    fn wait(resolver: &Resolver) -> Resolution {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(resolution) = resolver.try_recv() {
                return resolution;
            }
            assert!(Instant::now() < deadline, "lookup timed out");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn resolves_localhost() {
        let poll = Poll::new().unwrap();
        let waker = Waker::new(poll.registry(), Token(0)).unwrap();
        let resolver = Resolver::new(waker);

        resolver.lookup(3, 7, "localhost:80".to_owned());
        let resolution = wait(&resolver);
        assert_eq!(resolution.conn, 3);
        assert_eq!(resolution.seq, 7);
        let addr = resolution.result.unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 80);
    }

    #[test]
    fn unresolvable_domain() {
        let poll = Poll::new().unwrap();
        let waker = Waker::new(poll.registry(), Token(0)).unwrap();
        let resolver = Resolver::new(waker);

        resolver.lookup(0, 0, "no-such-host.invalid:80".to_owned());
        assert!(wait(&resolver).result.is_none());
    }
}

use std::collections::HashSet;
use std::io;
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::PathBuf;
use std::time::Duration;

use dime_proto::Decoder;
use mio::net::{TcpListener, UnixListener};
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, info, warn};

use crate::address::{Address, bind_tcp_listener};
use crate::client::Client;
use crate::dispatch::{ClientTable, dispatch};
use crate::endpoint::{Endpoint, RawStream, ReadError};
use crate::error::BrokerError;
use crate::registry::GroupRegistry;

const LISTENER_TOKEN: Token = Token(0);
const FIRST_CLIENT_TOKEN: usize = 1;

/// Everything [`Broker::bind`] needs to know before it starts accepting
/// connections. None of these are reloaded once the broker is running (spec
/// §6: "Persisted state: none").
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Address to bind and listen on. The server binds exactly one address
    /// (spec §6).
    pub address: Address,
    /// Largest binary body accepted per frame before the connection is
    /// closed as a framing violation (spec §4.1: "must accept at least 200
    /// MB bodies").
    pub max_body_len: u32,
    /// Optional cap on a client's outbox, in approximate bytes. `None`
    /// reproduces the reference server's unbounded behavior (spec §5); `Some`
    /// closes a client whose outbox grows past the cap instead of letting
    /// memory grow without bound.
    pub outbox_cap_bytes: Option<usize>,
    /// Capacity of the `mio::Events` buffer drained per `poll` call.
    pub events_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: Address::default_for_platform(),
            max_body_len: dime_proto::DEFAULT_MAX_BODY_LEN,
            outbox_cap_bytes: None,
            events_capacity: 1024,
        }
    }
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// Single-threaded, readiness-based DiME broker.
///
/// Owns the listening socket, every connected client, and the group
/// registry. All mutation happens from [`Broker::tick`] (or [`Broker::run`],
/// which just loops `tick` forever) — there is no lock anywhere in this
/// crate because there is never more than one thread touching this state
/// (spec §5).
pub struct Broker {
    poll: Poll,
    events: Events,
    listener: Listener,
    clients: ClientTable,
    groups: GroupRegistry,
    decoder: Decoder,
    outbox_cap_bytes: Option<usize>,
    next_token: usize,
    unix_path: Option<PathBuf>,
}

impl Broker {
    /// Binds `config.address` and registers the listener for readiness
    /// events. For a local-domain socket, an existing file at the same path
    /// is removed first (a stale socket from a prior crashed run is the
    /// common case); the file is removed again on drop.
    pub fn bind(config: BrokerConfig) -> Result<Self, BrokerError> {
        let mut poll = Poll::new()?;
        let (listener, unix_path) = match &config.address {
            Address::Tcp(addr) => {
                let std_listener = bind_tcp_listener(*addr)
                    .map_err(|source| BrokerError::Bind { addr: addr.to_string(), source })?;
                std_listener.set_nonblocking(true)?;
                let mut listener = TcpListener::from_std(std_listener);
                poll.registry().register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
                info!(addr = %addr, "listening on tcp");
                (Listener::Tcp(listener), None)
            }
            Address::Unix(path) => {
                if path.exists() {
                    std::fs::remove_file(path).map_err(|source| BrokerError::Bind {
                        addr: path.display().to_string(),
                        source,
                    })?;
                }
                let std_listener = StdUnixListener::bind(path).map_err(|source| BrokerError::Bind {
                    addr: path.display().to_string(),
                    source,
                })?;
                std_listener.set_nonblocking(true)?;
                let mut listener = UnixListener::from_std(std_listener);
                poll.registry().register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
                info!(path = %path.display(), "listening on unix socket");
                (Listener::Unix(listener), Some(path.clone()))
            }
        };

        Ok(Self {
            poll,
            events: Events::with_capacity(config.events_capacity),
            listener,
            clients: ClientTable::new(),
            groups: GroupRegistry::default(),
            decoder: Decoder::new(config.max_body_len),
            outbox_cap_bytes: config.outbox_cap_bytes,
            next_token: FIRST_CLIENT_TOKEN,
            unix_path,
        })
    }

    /// Number of currently connected (not-yet-reaped) clients. Exposed for
    /// tests and for a future `devices`-style introspection hook.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Drives the broker forever. Never returns except on a fatal `poll`
    /// error (spec §7: bind/listen failures are fatal; everything else is
    /// recovered per-connection).
    pub fn run(&mut self) -> io::Result<()> {
        loop {
            self.tick(None)?;
        }
    }

    /// Runs exactly one readiness-wait-and-react iteration. `timeout = None`
    /// blocks until something is ready; `Some(d)` bounds the wait, which
    /// tests use to drive the loop without a dedicated thread per case.
    ///
    /// Order within one tick, matching spec §4.5:
    /// 1. wait for readiness
    /// 2. accept all pending connections on the listener
    /// 3. read and dispatch every complete frame on each readable client
    /// 4. flush every client with pending output
    /// 5. reap clients latched `closed`
    pub fn tick(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.poll.poll(&mut self.events, timeout)?;

        let ready: Vec<(Token, bool, bool)> =
            self.events.iter().map(|e| (e.token(), e.is_readable(), e.is_writable())).collect();

        for (token, readable, writable) in ready {
            if token == LISTENER_TOKEN {
                if readable {
                    self.accept_all();
                }
                continue;
            }
            if readable {
                self.read_and_dispatch(token);
            }
            if writable && self.clients.contains_key(&token) {
                self.flush_one(token);
            }
        }

        self.reap();
        Ok(())
    }

    fn accept_all(&mut self) {
        loop {
            let accepted = match &mut self.listener {
                Listener::Tcp(listener) => match listener.accept() {
                    Ok((stream, addr)) => Some((RawStream::Tcp(stream), addr.to_string())),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => None,
                    Err(e) => {
                        warn!(?e, "accept failed");
                        None
                    }
                },
                Listener::Unix(listener) => match listener.accept() {
                    Ok((stream, _addr)) => Some((RawStream::Unix(stream), "unix".to_owned())),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => None,
                    Err(e) => {
                        warn!(?e, "accept failed");
                        None
                    }
                },
            };
            let Some((stream, peer)) = accepted else { break };
            self.install_client(stream, peer);
        }
    }

    fn install_client(&mut self, stream: RawStream, peer: String) {
        let token = Token(self.next_token);
        self.next_token += 1;

        let mut endpoint = Endpoint::new(stream, peer);
        if let Err(err) = endpoint.register(self.poll.registry(), token) {
            warn!(?err, "failed to register new connection, dropping");
            return;
        }
        debug!(peer = endpoint.peer(), ?token, "client connected");
        self.clients.insert(token, Client::new(endpoint));
    }

    /// Reads every complete frame currently buffered for `token` and
    /// dispatches each one, applying the responses it produces immediately.
    fn read_and_dispatch(&mut self, token: Token) {
        let mut frames = Vec::new();
        let read_result = {
            let Some(client) = self.clients.get_mut(&token) else { return };
            client.endpoint.read_frames(&self.decoder, &mut frames)
        };

        let mut responses = Vec::new();
        for frame in frames {
            dispatch(&mut self.clients, &mut self.groups, token, frame, &mut responses, self.outbox_cap_bytes);
        }
        for (target, frame) in responses {
            self.apply_response(target, frame);
        }

        match read_result {
            Ok(()) => {}
            Err(ReadError::Closed) => self.latch_closed(token),
            Err(ReadError::Frame(err)) => {
                debug!(?token, ?err, "framing violation, closing without resync");
                self.latch_closed(token);
            }
        }
    }

    /// Enqueues a response frame onto `target`'s write buffer and makes an
    /// immediate best-effort flush attempt, the same way a slow consumer's
    /// backlog is drained opportunistically rather than held until the next
    /// writable-readiness event.
    fn apply_response(&mut self, target: Token, frame: dime_proto::Frame) {
        let Some(client) = self.clients.get_mut(&target) else { return };
        if client.state.closed {
            return;
        }
        if let Err(err) = client.endpoint.enqueue_frame(&frame) {
            warn!(?target, ?err, "failed to encode response frame");
            client.state.closed = true;
            return;
        }
        if let Err(err) = client.endpoint.flush(self.poll.registry(), target) {
            debug!(?target, ?err, "write failed, closing");
            client.state.closed = true;
        }
    }

    fn flush_one(&mut self, token: Token) {
        let Some(client) = self.clients.get_mut(&token) else { return };
        if let Err(err) = client.endpoint.flush(self.poll.registry(), token) {
            debug!(?token, ?err, "write failed, closing");
            client.state.closed = true;
        }
    }

    fn latch_closed(&mut self, token: Token) {
        if let Some(client) = self.clients.get_mut(&token) {
            client.state.closed = true;
        }
    }

    /// Removes every client latched `closed` from the group registry and the
    /// client table, discarding its outbox. Runs exactly once per tick (spec
    /// §4.5).
    fn reap(&mut self) {
        let dead: Vec<Token> = self
            .clients
            .iter()
            .filter(|(_, client)| client.state.closed)
            .map(|(token, _)| *token)
            .collect();
        if dead.is_empty() {
            return;
        }
        let dead: HashSet<Token> = dead.into_iter().collect();
        for token in dead {
            if let Some(mut client) = self.clients.remove(&token) {
                self.groups.leave_all(token, &mut client.state);
                client.endpoint.deregister(self.poll.registry());
                debug!(?token, peer = client.endpoint.peer(), "client reaped");
            }
        }
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        if let Some(path) = &self.unix_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpStream as StdTcpStream;
    use std::time::Duration as StdDuration;

    use super::*;

    fn free_tcp_addr() -> std::net::SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    fn tick_until(broker: &mut Broker, mut predicate: impl FnMut(&Broker) -> bool) {
        for _ in 0..200 {
            if predicate(broker) {
                return;
            }
            broker.tick(Some(StdDuration::from_millis(20))).unwrap();
        }
        panic!("condition never became true");
    }

    #[test]
    fn unix_socket_is_removed_when_broker_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dime.sock");
        let broker =
            Broker::bind(BrokerConfig { address: Address::Unix(path.clone()), ..Default::default() }).unwrap();
        assert!(path.exists());
        drop(broker);
        assert!(!path.exists());
    }

    #[test]
    fn bind_removes_a_stale_socket_file_left_by_a_prior_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dime.sock");
        std::fs::write(&path, b"stale").unwrap();
        let broker = Broker::bind(BrokerConfig { address: Address::Unix(path.clone()), ..Default::default() });
        assert!(broker.is_ok());
    }

    #[test]
    fn disconnecting_client_is_reaped_and_leaves_its_groups() {
        let addr = free_tcp_addr();
        let mut broker = Broker::bind(BrokerConfig { address: Address::Tcp(addr), ..Default::default() }).unwrap();

        let a = StdTcpStream::connect(addr).unwrap();
        tick_until(&mut broker, |b| b.client_count() == 1);
        drop(a);
        tick_until(&mut broker, |b| b.client_count() == 0);
        assert!(broker.groups.list_nonempty().is_empty());
    }
}

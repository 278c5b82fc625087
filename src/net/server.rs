use std::collections::HashMap;
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};

use crate::config::Config;
use crate::error::ServerError;
use crate::net::session::{Flow, Session};
use crate::net::tcp_opt;
use crate::observe::Observer;

// Token for the listening socket in the MIO poll
const LISTENER: Token = Token(0);

const READ_BUF_LEN: usize = 4096;

/// One accepted socket and the protocol state riding on it.
struct Connection {
    stream: TcpStream,
    session: Session,
    /// Bytes produced by the session and not yet accepted by the socket.
    out: Vec<u8>,
    /// Set once the session asked to close. Later input is read and discarded
    /// so the close is a FIN rather than a reset.
    closing: bool,
}

impl Connection {
    /// Reads until the socket would block. Returns true when the socket failed.
    ///
    /// EOF only marks the connection as closing: a half-closed peer still
    /// receives whatever output is queued.
    fn read(&mut self, buf: &mut [u8], obs: &mut dyn Observer) -> bool {
        loop {
            match self.stream.read(buf) {
                Ok(0) => {
                    self.session.on_eof(obs);
                    self.closing = true;
                    return false;
                }
                Ok(_) if self.closing => {}
                Ok(n) => {
                    if let Flow::Close(_) = self.session.on_bytes(&buf[..n], &mut self.out, obs) {
                        self.closing = true;
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return false,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!("{}: read error: {}", self.session.peer(), e);
                    self.session.on_eof(obs);
                    return true;
                }
            }
        }
    }

    /// Writes as much pending output as the socket takes.
    fn flush(&mut self) -> io::Result<()> {
        let mut written = 0;
        let result = loop {
            if written == self.out.len() {
                break Ok(());
            }
            match self.stream.write(&self.out[written..]) {
                Ok(0) => break Err(ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break Ok(()),
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => break Err(e),
            }
        };
        self.out.drain(..written);
        result
    }

    fn finished(&self) -> bool {
        self.closing && self.out.is_empty()
    }
}

/// Single-threaded event loop; every connection is an independent state machine.
pub struct Server<O: Observer> {
    poll: Poll,
    listener: TcpListener,
    connections: HashMap<Token, Connection>,
    next_token: usize,
    config: Arc<Config>,
    observer: O,
    read_buf: Box<[u8]>,
}

impl<O: Observer> Server<O> {
    pub fn bind(config: Arc<Config>, observer: O) -> Result<Self, ServerError> {
        let poll = Poll::new()?;
        let mut listener = tcp_opt::create_listener(config.listen_addr())?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        Ok(Self {
            poll,
            listener,
            connections: HashMap::new(),
            next_token: LISTENER.0 + 1,
            config,
            observer,
            read_buf: vec![0u8; READ_BUF_LEN].into_boxed_slice(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Runs the event loop until an unrecoverable poll error.
    pub fn run(&mut self) -> Result<(), ServerError> {
        let mut events = Events::with_capacity(128);
        loop {
            self.poll_once(&mut events, None)?;
        }
    }

    /// Waits for readiness once and handles every event it reports.
    pub fn poll_once(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        for event in events.iter() {
            match event.token() {
                LISTENER => self.accept(),
                token => self.connection_event(token, event),
            }
        }
        Ok(())
    }

    fn accept(&mut self) {
        loop {
            let (mut stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed: {e}");
                    return;
                }
            };

            if self.connections.len() >= self.config.max_connections {
                warn!("{peer}: connection limit {} reached, dropping", self.config.max_connections);
                continue;
            }
            if let Err(e) = tcp_opt::apply_optimizations(&stream) {
                debug!("{peer}: could not set socket options: {e}");
            }

            let token = Token(self.next_token);
            self.next_token += 1;
            if let Err(e) = self.poll.registry().register(
                &mut stream,
                token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                warn!("{peer}: register failed: {e}");
                continue;
            }

            debug!("{peer}: accepted as {token:?}");
            let session = Session::new(peer, Arc::clone(&self.config));
            self.connections.insert(
                token,
                Connection {
                    stream,
                    session,
                    out: Vec::new(),
                    closing: false,
                },
            );
        }
    }

    fn connection_event(&mut self, token: Token, event: &Event) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };

        let mut done = event.is_readable() && conn.read(&mut self.read_buf, &mut self.observer);
        // Output left over here is drained on later WRITABLE events.
        if let Err(e) = conn.flush() {
            debug!("{}: write error: {}", conn.session.peer(), e);
            conn.session.on_eof(&mut self.observer);
            done = true;
        }

        if done || conn.finished() {
            if let Some(mut conn) = self.connections.remove(&token) {
                if let Err(e) = self.poll.registry().deregister(&mut conn.stream) {
                    debug!("{}: deregister failed: {}", conn.session.peer(), e);
                }
            }
        }
    }
}

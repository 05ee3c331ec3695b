//! [`HttpServer`]: binds a listening socket and hands every accepted
//! stream to a fresh [`Connection`].
//!
//! The teacher's own `HTTPServer extends TCPServer` inheritance is
//! reformulated as composition per §9: a generic accept loop takes a
//! capability to do something with each accepted `(stream, addr)` pair;
//! the only capability this crate ever supplies is "wrap it in a
//! `Connection`", so the trait-object indirection collapses into one
//! closure rather than a `StreamHandler` trait nobody else implements.

use std::cell::RefCell;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;

use mio::event::Source;
use mio::net::TcpListener;
use mio::{Interest, Token};

use crate::connection::Connection;
use crate::error::Result;
use crate::options::ServerOptions;
use crate::reactor::{ReadyEvent, Reactor};

const LISTENER_TOKEN: Token = Token(0);

struct Listener {
    socket: TcpListener,
    next_token: usize,
}

/// Owns the listening socket and the token allocator for accepted
/// connections. `run` blocks forever, driving the reactor.
pub struct HttpServer {
    reactor: Reactor,
    listener: Rc<RefCell<Listener>>,
    options: Arc<ServerOptions>,
}

impl HttpServer {
    /// Binds `options.bind_addr`, registers the listener for readability,
    /// and returns a server ready to `run()`. Does not accept anything yet.
    pub fn bind(options: ServerOptions) -> Result<HttpServer> {
        let options = Arc::new(options);
        let mut reactor = Reactor::new()?;
        let socket = TcpListener::bind(options.bind_addr)?;
        let listener = Rc::new(RefCell::new(Listener { socket, next_token: 1 }));

        let accept_options = options.clone();
        let accept_listener = listener.clone();
        reactor.add(
            &mut listener.borrow_mut().socket as &mut dyn Source,
            LISTENER_TOKEN,
            Interest::READABLE,
            Box::new(move |reactor, event| {
                accept_all(reactor, event, &accept_listener, &accept_options);
            }),
        )?;

        Ok(HttpServer { reactor, listener, options: options.clone() })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.borrow().socket.local_addr()?)
    }

    pub fn options(&self) -> &Arc<ServerOptions> {
        &self.options
    }

    /// Runs the reactor until `stop()` is called; this is the server's
    /// whole job once bound, so most binaries just call this and return.
    pub fn run(&mut self) -> Result<()> {
        self.reactor.run()
    }

    /// Runs one reactor tick; exposed for tests and embedders that want to
    /// drive the loop themselves rather than block in `run()`.
    pub fn run_once(&mut self) -> Result<()> {
        self.reactor.run_once()
    }
}

/// Accepts every pending connection on `listener`, looping until
/// `WouldBlock`. `mio`'s edge-triggered semantics mean a single readiness
/// event only tells us the listener became ready *once* — accepting just
/// the first pending connection per event would strand the rest in the
/// kernel's backlog until the next unrelated event woke the listener back
/// up, so the loop drains it completely each time. Each accepted socket is
/// handed to a new [`Connection`]. A single misbehaving accept (e.g.
/// `ECONNABORTED`) is logged and skipped rather than tearing down the
/// listener.
fn accept_all(
    reactor: &mut Reactor,
    _event: ReadyEvent,
    listener: &Rc<RefCell<Listener>>,
    options: &Arc<ServerOptions>,
) {
    loop {
        let (socket, remote_addr) = {
            let mut state = listener.borrow_mut();
            match state.socket.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) => {
                    proxy_log::warn!("accept failed: {e}");
                    return;
                }
            }
        };

        let token = {
            let mut state = listener.borrow_mut();
            let token = Token(state.next_token);
            state.next_token += 1;
            token
        };

        proxy_log::trace!("accepted connection from {remote_addr}");
        #[cfg(feature = "tls")]
        let tls = options.ssl_options.is_some();
        #[cfg(not(feature = "tls"))]
        let tls = false;
        if let Err(e) = Connection::spawn(reactor, socket, token, remote_addr, tls, options.clone()) {
            proxy_log::warn!("failed to register accepted connection: {e}");
        }
    }
}

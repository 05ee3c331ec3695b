//! [`Connection`]: the per-socket HTTP state machine.
//!
//! Sequences reads and writes of requests and responses on top of one
//! [`crate::stream::Stream`], deciding keep-alive at the end of each
//! request per §4.4's truth table. One `Connection` is reused across every
//! request a kept-alive socket serves; `generation` distinguishes which
//! request a `Request` handle was issued for, so a stale `write`/`finish`
//! call fails fast instead of corrupting a later request's state.
//!
//! Always held as `Rc<RefCell<Connection>>` — single ownership,
//! reference-counted only so the reactor's dispatch closure, the idle
//! timer, and any `Request` it hands out can each hold a handle on one
//! thread. The dispatch closure's strong `Rc` is what keeps a live
//! connection alive; once the stream closes and the reactor drops that
//! closure, the `Connection` is freed.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;

use mio::Token;

use crate::args::{self, Arguments};
use crate::error::{Result, ServerError};
use crate::head_parser::{self, FormPart};
use crate::headers::HeaderSet;
use crate::options::ServerOptions;
use crate::reactor::{ReadyEvent, Reactor, TimerHandle};
use crate::request::{Request, RequestParts};
use crate::stream::{Stream, Submitted};

/// Callback signature the application registers at server construction.
/// Takes `&mut Reactor` explicitly (rather than a hidden thread-global)
/// so `Request::write`/`finish` have a reactor handle to drive the
/// underlying stream with, however many ticks later they're called.
pub type RequestCallback = dyn Fn(&mut Reactor, Request);

pub(crate) type WriteTag = Box<dyn FnOnce(&mut Reactor)>;

#[derive(Debug, Clone)]
struct RequestMeta {
    method: String,
    version: String,
    headers: HeaderSet,
}

enum State {
    AwaitingHeaders,
    ReadingBody { expected_len: usize, meta: RequestMeta, path: String, query: String },
    Dispatched,
    Writing { finish_pending: bool },
    Closed,
}

pub struct Connection {
    stream: Stream<WriteTag>,
    options: Arc<ServerOptions>,
    state: State,
    generation: u64,
    remote_addr: SocketAddr,
    tls: bool,
    idle_timer: Option<TimerHandle>,
    current_meta: Option<RequestMeta>,
}

impl Connection {
    /// Wraps an accepted socket in a `Stream`, registers it with `reactor`,
    /// and starts the first `AwaitingHeaders` read.
    pub fn spawn(
        reactor: &mut Reactor,
        socket: mio::net::TcpStream,
        token: Token,
        remote_addr: SocketAddr,
        tls: bool,
        options: Arc<ServerOptions>,
    ) -> Result<Rc<RefCell<Connection>>> {
        let stream = Stream::new(socket, token, options.max_buffer_size);
        let conn = Rc::new(RefCell::new(Connection {
            stream,
            options,
            state: State::AwaitingHeaders,
            generation: 0,
            remote_addr,
            tls,
            idle_timer: None,
            current_meta: None,
        }));

        let dispatch_handle = conn.clone();
        conn.borrow_mut()
            .stream
            .register(reactor, Box::new(move |reactor, event| {
                Connection::on_ready(&dispatch_handle, reactor, event);
            }))?;

        Connection::arm_idle_timer(&conn, reactor);
        Connection::start_head_read(&conn, reactor);
        Ok(conn)
    }

    fn arm_idle_timer(rc: &Rc<RefCell<Connection>>, reactor: &mut Reactor) {
        let timeout = rc.borrow().options.idle_timeout;
        let weak = Rc::downgrade(rc);
        let deadline = std::time::Instant::now() + timeout;
        let handle = reactor.add_timeout(
            deadline,
            Box::new(move |reactor| {
                if let Some(conn) = weak.upgrade() {
                    Connection::on_idle_timeout(&conn, reactor);
                }
            }),
        );
        rc.borrow_mut().idle_timer = Some(handle);
    }

    fn disarm_idle_timer(&mut self, reactor: &mut Reactor) {
        if let Some(handle) = self.idle_timer.take() {
            reactor.remove_timeout(handle);
        }
    }

    fn on_idle_timeout(rc: &Rc<RefCell<Connection>>, reactor: &mut Reactor) {
        let mut conn = rc.borrow_mut();
        if matches!(conn.state, State::AwaitingHeaders) && !conn.stream.closed() {
            proxy_log::trace!("idle connection timed out awaiting next request");
            conn.idle_timer = None;
            conn.stream.close(reactor);
        }
    }

    /// Issues the `read_until(\r\n\r\n)` that begins a new request. If the
    /// bytes are already sitting in the buffer (pipelining, or the very
    /// first read after accept racing a fast client), the completion is
    /// still deferred to the next reactor tick rather than handled inline
    /// — see `Stream`'s docs for why that uniformity matters.
    fn start_head_read(rc: &Rc<RefCell<Connection>>, reactor: &mut Reactor) {
        let submitted = {
            let mut conn = rc.borrow_mut();
            conn.state = State::AwaitingHeaders;
            conn.stream.submit_read_until(b"\r\n\r\n")
        };
        if let Submitted::Ready(bytes) = submitted {
            let rc = rc.clone();
            reactor.defer(Box::new(move |reactor| {
                Connection::on_head_bytes(&rc, reactor, bytes);
            }));
        }
    }

    fn on_ready(rc: &Rc<RefCell<Connection>>, reactor: &mut Reactor, event: ReadyEvent) {
        let (outcome, was_reading_body) = {
            let mut conn = rc.borrow_mut();
            if conn.stream.closed() {
                return;
            }
            let reading_body = matches!(conn.state, State::ReadingBody { .. });
            (conn.stream.pump(reactor, event), reading_body)
        };

        for cb in outcome.completed_write_tags {
            cb(reactor);
        }

        if outcome.closed {
            rc.borrow_mut().disarm_idle_timer(reactor);
            return;
        }

        if let Some(bytes) = outcome.completed_read {
            if was_reading_body {
                Connection::on_body_bytes(rc, reactor, bytes);
            } else {
                Connection::on_head_bytes(rc, reactor, bytes);
            }
            return;
        }

        Connection::maybe_finalize(rc, reactor);
    }

    fn on_head_bytes(rc: &Rc<RefCell<Connection>>, reactor: &mut Reactor, bytes: Vec<u8>) {
        {
            let mut conn = rc.borrow_mut();
            conn.disarm_idle_timer(reactor);
        }

        let head = match head_parser::parse_request_head(&bytes) {
            Ok(head) => head,
            Err(err) => {
                proxy_log::warn!("{err}");
                rc.borrow_mut().stream.close(reactor);
                return;
            }
        };

        let meta = RequestMeta {
            method: head.method.clone(),
            version: head.version.clone(),
            headers: head.headers.clone(),
        };

        let content_length: Option<usize> = head.headers.get("content-length").and_then(|v| v.trim().parse().ok());

        match content_length {
            None => Connection::dispatch(rc, reactor, meta, head.path, head.query, head.query_args, Vec::new()),
            Some(len) => {
                let max = rc.borrow().options.max_buffer_size;
                if len > max {
                    proxy_log::warn!("{}", ServerError::PayloadTooLarge);
                    rc.borrow_mut().stream.close(reactor);
                    return;
                }
                if head.headers.contains_token("expect", "100-continue") {
                    let mut conn = rc.borrow_mut();
                    conn.stream.queue_write(
                        reactor,
                        b"HTTP/1.1 100 (Continue)\r\n\r\n".to_vec(),
                        None,
                    );
                }
                let submitted = {
                    let mut conn = rc.borrow_mut();
                    conn.state = State::ReadingBody {
                        expected_len: len,
                        meta: meta.clone(),
                        path: head.path.clone(),
                        query: head.query.clone(),
                    };
                    conn.current_meta = Some(meta);
                    conn.stream.submit_read_bytes(len)
                };
                if let Submitted::Ready(body) = submitted {
                    let rc = rc.clone();
                    reactor.defer(Box::new(move |reactor| {
                        Connection::on_body_bytes(&rc, reactor, body);
                    }));
                }
            }
        }
    }

    fn on_body_bytes(rc: &Rc<RefCell<Connection>>, reactor: &mut Reactor, body: Vec<u8>) {
        let (meta, path, query) = {
            let conn = rc.borrow();
            match &conn.state {
                State::ReadingBody { meta, path, query, .. } => (meta.clone(), path.clone(), query.clone()),
                _ => return, // stale completion racing a close; nothing to do
            }
        };
        let query_args = args::parse_www_form(&query).unwrap_or_default();
        Connection::dispatch(rc, reactor, meta, path, query, query_args, body)
    }

    fn dispatch(
        rc: &Rc<RefCell<Connection>>,
        reactor: &mut Reactor,
        meta: RequestMeta,
        path: String,
        query: String,
        query_args: Arguments,
        body: Vec<u8>,
    ) {
        // Query args and form args are each capped at MAX_ARGS on their own
        // source (§3); build the form side as its own map and fold it in
        // afterward rather than inserting into `query_args` directly, so a
        // query string already at the cap can't crowd out a form field.
        let mut arguments = query_args;
        let mut files = HashMap::new();
        if let Some(content_type) = meta.headers.get("content-type") {
            if let Ok(form) = head_parser::parse_form_body(content_type, &body) {
                let mut form_args = Arguments::new();
                for (key, part) in form {
                    match part {
                        FormPart::Value(v) => form_args.insert_value(key, v),
                        FormPart::Multi(values) => {
                            for v in values {
                                form_args.insert_value(key.clone(), v);
                            }
                        }
                        FormPart::File(f) => files.entry(key).or_insert_with(Vec::new).push(f),
                    }
                }
                arguments.merge_from(form_args);
            }
        }

        let uri = if query.is_empty() { path } else { format!("{path}?{query}") };

        let (callback, xheaders, tls, remote_addr, generation) = {
            let mut conn = rc.borrow_mut();
            conn.generation += 1;
            conn.state = State::Dispatched;
            conn.current_meta = Some(meta.clone());
            (
                conn.options.request_callback.clone(),
                conn.options.xheaders,
                conn.tls,
                conn.remote_addr,
                conn.generation,
            )
        };

        let parts = RequestParts {
            method: meta.method,
            uri,
            version: meta.version,
            headers: meta.headers,
            body,
            arguments,
            files,
        };
        let request = Request::new(parts, rc, generation, remote_addr, xheaders, tls);
        // No outer borrow is held across this call: the application is
        // free to call `request.write`/`request.finish` synchronously.
        callback(reactor, request);
    }

    /// Entry point `Request::write` forwards to. `cb`, if given, fires
    /// once `chunk` has fully drained to the socket (§4.4: "records `cb`
    /// to fire after the chunk drains"), via `on_ready`'s
    /// `completed_write_tags` dispatch.
    pub(crate) fn request_write(
        rc: &Rc<RefCell<Connection>>,
        reactor: &mut Reactor,
        generation: u64,
        chunk: Vec<u8>,
        cb: Option<WriteTag>,
    ) -> Result<()> {
        let mut conn = rc.borrow_mut();
        conn.check_generation(generation)?;
        if conn.stream.closed() {
            return Ok(());
        }
        if matches!(conn.state, State::Dispatched) {
            conn.state = State::Writing { finish_pending: false };
        }
        conn.stream.queue_write(reactor, chunk, cb);
        Ok(())
    }

    /// Entry point `Request::finish` forwards to.
    pub(crate) fn request_finish(
        rc: &Rc<RefCell<Connection>>,
        reactor: &mut Reactor,
        generation: u64,
    ) -> Result<()> {
        {
            let mut conn = rc.borrow_mut();
            conn.check_generation(generation)?;
            if conn.stream.closed() {
                return Ok(());
            }
            if conn.stream.writing() {
                conn.state = State::Writing { finish_pending: true };
                return Ok(());
            }
        }
        Connection::finalize(rc, reactor);
        Ok(())
    }

    fn maybe_finalize(rc: &Rc<RefCell<Connection>>, reactor: &mut Reactor) {
        let should = {
            let conn = rc.borrow();
            matches!(conn.state, State::Writing { finish_pending: true }) && !conn.stream.writing()
        };
        if should {
            Connection::finalize(rc, reactor);
        }
    }

    /// The request is fully drained and finished: decide keep-alive per
    /// §4.4's truth table and either re-arm for the next request or close.
    fn finalize(rc: &Rc<RefCell<Connection>>, reactor: &mut Reactor) {
        let keep_alive = {
            let conn = rc.borrow();
            let meta = conn.current_meta.as_ref();
            meta.is_some_and(|meta| {
                Connection::wants_keep_alive(meta, conn.options.no_keep_alive)
            })
        };

        rc.borrow_mut().current_meta = None;

        if keep_alive {
            Connection::arm_idle_timer(rc, reactor);
            Connection::start_head_read(rc, reactor);
        } else {
            let mut conn = rc.borrow_mut();
            conn.disarm_idle_timer(reactor);
            conn.stream.close(reactor);
        }
    }

    fn wants_keep_alive(meta: &RequestMeta, no_keep_alive: bool) -> bool {
        if no_keep_alive {
            return false;
        }
        if meta.version == "HTTP/1.1" {
            return !meta.headers.contains_token("connection", "close");
        }
        // HTTP/1.0: only kept alive when the client asked for it, and only
        // for requests where that's even meaningful (a Content-Length
        // framed body, or a method with a well-understood response shape).
        let has_content_length = meta.headers.get("content-length").is_some();
        let eligible_method = meta.method.eq_ignore_ascii_case("HEAD") || meta.method.eq_ignore_ascii_case("GET");
        if has_content_length || eligible_method {
            return meta.headers.contains_token("connection", "keep-alive");
        }
        false
    }

    fn check_generation(&self, generation: u64) -> Result<()> {
        if generation != self.generation {
            return Err(ServerError::UserCallbackFault(format!(
                "stale Request (generation {generation}, connection now at {})",
                self.generation
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(version: &str, method: &str, connection: Option<&str>, content_length: Option<&str>) -> RequestMeta {
        let mut headers = HeaderSet::new();
        if let Some(c) = connection {
            headers.insert("Connection", c);
        }
        if let Some(cl) = content_length {
            headers.insert("Content-Length", cl);
        }
        RequestMeta {
            method: method.to_string(),
            version: version.to_string(),
            headers,
        }
    }

    /// §4.4's keep-alive truth table, exercised directly against every
    /// combination the spec calls out.
    #[test]
    fn keep_alive_truth_table() {
        // no_keep_alive always wins regardless of everything else.
        assert!(!Connection::wants_keep_alive(&meta("HTTP/1.1", "GET", None, None), true));

        // HTTP/1.1: kept alive unless Connection: close is present.
        assert!(Connection::wants_keep_alive(&meta("HTTP/1.1", "GET", None, None), false));
        assert!(Connection::wants_keep_alive(&meta("HTTP/1.1", "POST", Some("keep-alive"), None), false));
        assert!(!Connection::wants_keep_alive(&meta("HTTP/1.1", "GET", Some("close"), None), false));
        assert!(!Connection::wants_keep_alive(&meta("HTTP/1.1", "GET", Some("Close"), None), false));

        // HTTP/1.0 with Content-Length or an eligible method: needs an
        // explicit Connection: keep-alive to stay open.
        assert!(Connection::wants_keep_alive(
            &meta("HTTP/1.0", "POST", Some("keep-alive"), Some("3")),
            false
        ));
        assert!(!Connection::wants_keep_alive(&meta("HTTP/1.0", "POST", None, Some("3")), false));
        assert!(Connection::wants_keep_alive(&meta("HTTP/1.0", "GET", Some("keep-alive"), None), false));
        assert!(!Connection::wants_keep_alive(&meta("HTTP/1.0", "GET", None, None), false));

        // HTTP/1.0, no Content-Length, method not GET/HEAD: always closes.
        assert!(!Connection::wants_keep_alive(
            &meta("HTTP/1.0", "POST", Some("keep-alive"), None),
            false
        ));
    }
}

//! [`Request`]: a passive container for one decoded HTTP request plus a
//! write handle back to the [`crate::connection::Connection`] that parsed
//! it.
//!
//! The back-reference is non-owning (`Weak`) — the `Connection` strictly
//! outlives any `Request` it hands out. Because the same `Connection` is
//! reused across keep-alive requests, `write`/`finish` also carry the
//! generation the `Request` was built under; a mismatch means the
//! `Connection` has already moved on (or closed), and is treated as the
//! contract violation §9 calls for rather than silently touching the
//! wrong request's state.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::Instant;

use crate::args::Arguments;
use crate::connection::{Connection, WriteTag};
use crate::error::{Result, ServerError};
use crate::head_parser::FileField;
use crate::headers::HeaderSet;
use crate::reactor::Reactor;

/// One uploaded file from a `multipart/form-data` body.
pub type UploadedFile = FileField;

/// A fully-parsed HTTP request. Immutable after construction except for
/// `finish_time`, which is stamped when [`Request::finish`] runs.
pub struct Request {
    pub method: String,
    pub uri: String,
    pub version: String,
    pub headers: HeaderSet,
    pub body: Vec<u8>,
    pub remote_ip: String,
    pub protocol: &'static str,
    pub host: String,
    pub arguments: Arguments,
    pub files: HashMap<String, Vec<UploadedFile>>,
    pub start_time: Instant,
    pub finish_time: Option<Instant>,

    connection: Weak<RefCell<Connection>>,
    generation: u64,
}

pub(crate) struct RequestParts {
    pub method: String,
    pub uri: String,
    pub version: String,
    pub headers: HeaderSet,
    pub body: Vec<u8>,
    pub arguments: Arguments,
    pub files: HashMap<String, Vec<UploadedFile>>,
}

impl Request {
    pub(crate) fn new(
        parts: RequestParts,
        connection: &Rc<RefCell<Connection>>,
        generation: u64,
        socket_peer: SocketAddr,
        xheaders: bool,
        tls: bool,
    ) -> Request {
        let host = parts.headers.get("host").unwrap_or("").to_string();

        let mut remote_ip = socket_peer.ip().to_string();
        let mut protocol: &'static str = if tls { "https" } else { "http" };

        if xheaders {
            if let Some(overlay) = parts
                .headers
                .get("x-real-ip")
                .or_else(|| parts.headers.get("x-forwarded-for"))
            {
                // Forwarded-For is a comma-separated chain; the first hop
                // is the original client.
                let candidate = overlay.split(',').next().unwrap_or(overlay).trim();
                if is_dotted_ipv4(candidate) {
                    remote_ip = candidate.to_string();
                }
            }
            // §9 design note: the source's `protocol ~= "http" or ~=
            // "https"` condition is vacuously true for any string — a Lua
            // `and`/`or` slip. The corrected check accepts only the two
            // literal values, falling back to the stream's own scheme
            // otherwise.
            if let Some(scheme) = parts
                .headers
                .get("x-scheme")
                .or_else(|| parts.headers.get("x-forwarded-proto"))
            {
                protocol = match scheme {
                    "http" => "http",
                    "https" => "https",
                    _ => protocol,
                };
            }
        }

        Request {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            body: parts.body,
            remote_ip,
            protocol,
            host,
            arguments: parts.arguments,
            files: parts.files,
            start_time: Instant::now(),
            finish_time: None,
            connection: Rc::downgrade(connection),
            generation,
        }
    }

    /// Queues `chunk` on the owning connection's stream. May be called any
    /// number of times before [`Request::finish`].
    pub fn write(&self, reactor: &mut Reactor, chunk: Vec<u8>) -> Result<()> {
        self.write_with::<fn(&mut Reactor)>(reactor, chunk, None)
    }

    /// Like [`Request::write`], but `cb` fires once `chunk` has fully
    /// drained to the socket (§4.4: "records `cb` to fire after the chunk
    /// drains").
    pub fn write_with<F>(&self, reactor: &mut Reactor, chunk: Vec<u8>, cb: Option<F>) -> Result<()>
    where
        F: FnOnce(&mut Reactor) + 'static,
    {
        let conn = self.upgrade()?;
        let cb: Option<WriteTag> = cb.map(|f| Box::new(f) as WriteTag);
        Connection::request_write(&conn, reactor, self.generation, chunk, cb)
    }

    /// Marks the response complete. Must be called exactly once. Decides
    /// keep-alive vs close once the write queue has fully drained.
    pub fn finish(mut self, reactor: &mut Reactor) -> Result<()> {
        let conn = self.upgrade()?;
        self.finish_time = Some(Instant::now());
        Connection::request_finish(&conn, reactor, self.generation)
    }

    fn upgrade(&self) -> Result<Rc<RefCell<Connection>>> {
        self.connection.upgrade().ok_or_else(|| {
            ServerError::UserCallbackFault(
                "write/finish called on a Request whose Connection is gone".to_string(),
            )
        })
    }
}

/// Validates the dotted-quad-only IPv4 grammar the X-header overlay
/// requires (§4.5) — a real DNS name or IPv6 literal is left as-is,
/// falling back to the socket's own peer address.
fn is_dotted_ipv4(candidate: &str) -> bool {
    let parts: Vec<&str> = candidate.split('.').collect();
    parts.len() == 4
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.len() <= 3 && p.bytes().all(|b| b.is_ascii_digit()) && p.parse::<u8>().is_ok())
}

//! Construction-time options for an [`crate::server::HttpServer`].
//!
//! Mirrors the teacher's own preference for a plain struct built with
//! `..Default::default()` over a fluent builder — there's no validation
//! step that benefits from one, and every field is independently optional.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::connection::RequestCallback;

/// TLS parameters for an encrypted listener. Only the interface is in
/// scope here — handshake mechanics live inside `rustls` itself.
#[cfg(feature = "tls")]
#[derive(Clone)]
pub struct SslOptions {
    pub config: Arc<rustls::ServerConfig>,
}

/// Every knob the connection-lifecycle engine exposes at construction.
/// `request_callback` is the only required field.
#[derive(Clone)]
pub struct ServerOptions {
    pub bind_addr: SocketAddr,
    pub request_callback: Arc<RequestCallback>,
    /// Close the connection after every response rather than honoring
    /// keep-alive. Default `false`.
    pub no_keep_alive: bool,
    /// Trust `X-Real-Ip`/`X-Forwarded-For`/`X-Scheme`/`X-Forwarded-Proto`
    /// from a reverse proxy in front of this server (§4.5). Default
    /// `false`.
    pub xheaders: bool,
    #[cfg(feature = "tls")]
    pub ssl_options: Option<SslOptions>,
    /// Per-stream cap on buffered bytes, both for the header/body read
    /// buffer and for a single queued write. Default 100 MiB.
    pub max_buffer_size: usize,
    /// How long an idle, kept-alive connection may sit in
    /// `AwaitingHeaders` before the reactor force-closes it.
    pub idle_timeout: std::time::Duration,
}

pub const DEFAULT_MAX_BUFFER_SIZE: usize = 100 * 1024 * 1024;
pub const DEFAULT_IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

impl ServerOptions {
    pub fn new(bind_addr: SocketAddr, request_callback: Arc<RequestCallback>) -> Self {
        ServerOptions {
            bind_addr,
            request_callback,
            no_keep_alive: false,
            xheaders: false,
            #[cfg(feature = "tls")]
            ssl_options: None,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn no_keep_alive(mut self, value: bool) -> Self {
        self.no_keep_alive = value;
        self
    }

    pub fn xheaders(mut self, value: bool) -> Self {
        self.xheaders = value;
        self
    }

    pub fn max_buffer_size(mut self, value: usize) -> Self {
        self.max_buffer_size = value;
        self
    }

    pub fn idle_timeout(mut self, value: std::time::Duration) -> Self {
        self.idle_timeout = value;
        self
    }

    #[cfg(feature = "tls")]
    pub fn ssl_options(mut self, value: SslOptions) -> Self {
        self.ssl_options = Some(value);
        self
    }
}

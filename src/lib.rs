//! Connection-lifecycle engine for an asynchronous HTTP/1.x server.
//!
//! Three things have to stay consistent under concurrent traffic: a
//! [`reactor`] multiplexing readiness events on one thread, a buffered
//! [`stream`] exposing delimiter- and length-prefixed reads as
//! completion-style requests, and a per-connection [`connection`] state
//! machine chaining those reads and writes while honoring keep-alive,
//! 100-continue, and body-size limits. [`server`] ties a listening socket
//! to that state machine; application routing, MIME tables, and response
//! templating are deliberately left to the caller — this crate ends at the
//! `Request`/`Connection` boundary.

pub mod args;
pub mod connection;
pub mod error;
pub mod head_parser;
pub mod headers;
pub mod options;
pub mod reactor;
pub mod request;
pub mod server;
pub mod stream;

pub use connection::{Connection, RequestCallback};
pub use error::{Result, ServerError};
pub use options::ServerOptions;
pub use request::Request;
pub use server::HttpServer;

//! Minimal demo binary: an echo-style handler wired into the
//! connection-lifecycle engine. Routing, templating, and everything past
//! `Request`/`Connection` is deliberately out of scope for the library —
//! this binary exists to give it somewhere to run.

use std::sync::Arc;

use httpd_core::reactor::Reactor;
use httpd_core::{HttpServer, Request, ServerOptions};

fn handle(reactor: &mut Reactor, request: Request) {
    let body = format!(
        "{} {} from {}\n",
        request.method, request.uri, request.remote_ip
    );
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: text/plain\r\n\r\n{}",
        body.len(),
        body
    );
    if let Err(e) = request.write(reactor, response.into_bytes()) {
        proxy_log::warn!("write failed: {e}");
        return;
    }
    if let Err(e) = request.finish(reactor) {
        proxy_log::warn!("finish failed: {e}");
    }
}

fn main() -> httpd_core::Result<()> {
    let addr = "127.0.0.1:8080".parse().expect("valid socket address");
    let options = ServerOptions::new(addr, Arc::new(handle));

    let mut server = HttpServer::bind(options)?;
    proxy_log::info!("listening on {}", server.local_addr()?);
    server.run()
}

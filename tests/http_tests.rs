//! End-to-end wire-level scenarios from the connection-lifecycle spec:
//! keep-alive vs close, form bodies, 100-continue, oversize payloads, and
//! malformed request lines. Everything runs on one thread — the reactor
//! is single-threaded by design, so the test drives the server's
//! `run_once` loop and a plain blocking client socket interleaved, rather
//! than putting the server on a background thread.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use httpd_core::{HttpServer, Request, ServerOptions};

fn local_addr() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
    stream
}

/// Drives the reactor for up to `iterations` ticks, giving the listener a
/// chance to accept, the stream a chance to read, and the stream a chance
/// to flush its write queue — each is typically a separate readiness
/// event on loopback.
fn drive(server: &mut HttpServer, iterations: usize) {
    for _ in 0..iterations {
        server.run_once().unwrap();
    }
}

/// Reads whatever is available right now without blocking past the
/// socket's read timeout; returns an empty vec on timeout rather than
/// panicking, since "nothing more to read yet" is a valid intermediate
/// state while the reactor is still catching up.
fn read_available(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = [0u8; 4096];
    let mut out = Vec::new();
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
            Err(e) => panic!("unexpected read error: {e}"),
        }
    }
    out
}

fn echo_handler(reactor: &mut httpd_core::reactor::Reactor, request: Request) {
    let body = b"hi";
    let response = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len());
    let mut bytes = response.into_bytes();
    bytes.extend_from_slice(body);
    request.write(reactor, bytes).unwrap();
    request.finish(reactor).unwrap();
}

#[test]
fn simple_get_keeps_connection_open() {
    let options = ServerOptions::new(local_addr(), Arc::new(echo_handler));
    let mut server = HttpServer::bind(options).unwrap();
    let addr = server.local_addr().unwrap();

    let mut client = connect(addr);
    client
        .write_all(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();

    drive(&mut server, 4);
    let response = read_available(&mut client);
    assert_eq!(response, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi");

    // The socket is still open: a second request on the same connection
    // is served without reconnecting.
    client
        .write_all(b"GET /b HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    drive(&mut server, 4);
    let second = read_available(&mut client);
    assert_eq!(second, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi");
}

#[test]
fn connection_close_header_closes_the_socket() {
    let options = ServerOptions::new(local_addr(), Arc::new(echo_handler));
    let mut server = HttpServer::bind(options).unwrap();
    let addr = server.local_addr().unwrap();

    let mut client = connect(addr);
    client
        .write_all(b"GET /a HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();

    drive(&mut server, 4);
    let response = read_available(&mut client);
    assert_eq!(response, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi");

    // The server closed its end; a further read returns EOF (0 bytes).
    let mut buf = [0u8; 16];
    let n = client.read(&mut buf).unwrap();
    assert_eq!(n, 0);
}

#[test]
fn post_form_body_is_decoded_into_arguments() {
    let (tx, rx) = mpsc::channel::<Vec<(String, Vec<String>)>>();
    let handler = move |reactor: &mut httpd_core::reactor::Reactor, request: Request| {
        let mut collected: Vec<(String, Vec<String>)> = request
            .arguments
            .iter()
            .map(|(k, v)| (k.clone(), v.all().into_iter().map(str::to_string).collect()))
            .collect();
        collected.sort();
        tx.send(collected).unwrap();
        request.write(reactor, b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec()).unwrap();
        request.finish(reactor).unwrap();
    };
    let options = ServerOptions::new(local_addr(), Arc::new(handler));
    let mut server = HttpServer::bind(options).unwrap();
    let addr = server.local_addr().unwrap();

    let mut client = connect(addr);
    let body = b"a=1&b=2&a=3";
    let request = format!(
        "POST /x HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\nContent-Type: application/x-www-form-urlencoded\r\n\r\n",
        body.len()
    );
    client.write_all(request.as_bytes()).unwrap();
    client.write_all(body).unwrap();

    drive(&mut server, 5);
    let _ = read_available(&mut client);

    let arguments = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(
        arguments,
        vec![
            ("a".to_string(), vec!["1".to_string(), "3".to_string()]),
            ("b".to_string(), vec!["2".to_string()]),
        ]
    );
}

#[test]
fn expect_100_continue_precedes_the_final_response() {
    let options = ServerOptions::new(local_addr(), Arc::new(echo_handler));
    let mut server = HttpServer::bind(options).unwrap();
    let addr = server.local_addr().unwrap();

    let mut client = connect(addr);
    let head = "POST /x HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\nExpect: 100-continue\r\n\r\n";
    client.write_all(head.as_bytes()).unwrap();

    // The continue line is queued as soon as the head is parsed, before
    // the body has even arrived.
    drive(&mut server, 3);
    let first = read_available(&mut client);
    assert_eq!(first, b"HTTP/1.1 100 (Continue)\r\n\r\n");

    client.write_all(b"ping").unwrap();
    drive(&mut server, 3);
    let second = read_available(&mut client);
    assert_eq!(second, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi");
}

#[test]
fn write_completion_callback_fires_after_the_chunk_drains() {
    let (tx, rx) = mpsc::channel::<()>();
    let handler = move |reactor: &mut httpd_core::reactor::Reactor, request: Request| {
        let tx = tx.clone();
        let body = b"hi".to_vec();
        let response = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len());
        let mut bytes = response.into_bytes();
        bytes.extend_from_slice(&body);
        request
            .write_with(reactor, bytes, Some(move |_: &mut httpd_core::reactor::Reactor| {
                tx.send(()).unwrap();
            }))
            .unwrap();
        request.finish(reactor).unwrap();
    };
    let options = ServerOptions::new(local_addr(), Arc::new(handler));
    let mut server = HttpServer::bind(options).unwrap();
    let addr = server.local_addr().unwrap();

    let mut client = connect(addr);
    client
        .write_all(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();

    drive(&mut server, 4);
    let response = read_available(&mut client);
    assert_eq!(response, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi");
    assert!(rx.try_recv().is_ok(), "write completion callback should have fired once the chunk drained");
}

#[test]
fn oversize_content_length_closes_without_invoking_the_handler() {
    let (tx, rx) = mpsc::channel::<()>();
    let handler = move |reactor: &mut httpd_core::reactor::Reactor, request: Request| {
        tx.send(()).unwrap();
        request.finish(reactor).unwrap();
    };
    let options = ServerOptions::new(local_addr(), Arc::new(handler)).max_buffer_size(1024);
    let mut server = HttpServer::bind(options).unwrap();
    let addr = server.local_addr().unwrap();

    let mut client = connect(addr);
    client
        .write_all(b"POST /x HTTP/1.1\r\nHost: x\r\nContent-Length: 999999999\r\n\r\n")
        .unwrap();

    drive(&mut server, 4);

    let mut buf = [0u8; 16];
    let n = client.read(&mut buf).unwrap();
    assert_eq!(n, 0, "server should have closed the socket without responding");
    assert!(rx.try_recv().is_err(), "handler must not run for an oversize payload");
}

#[test]
fn malformed_request_line_closes_silently_but_acceptor_keeps_serving() {
    let options = ServerOptions::new(local_addr(), Arc::new(echo_handler));
    let mut server = HttpServer::bind(options).unwrap();
    let addr = server.local_addr().unwrap();

    let mut bad_client = connect(addr);
    bad_client.write_all(b"GARBAGE\r\n\r\n").unwrap();
    drive(&mut server, 4);
    let mut buf = [0u8; 16];
    let n = bad_client.read(&mut buf).unwrap();
    assert_eq!(n, 0);

    // The acceptor and reactor are unaffected: a fresh connection is
    // served normally.
    let mut good_client = connect(addr);
    good_client
        .write_all(b"GET /ok HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    drive(&mut server, 4);
    let response = read_available(&mut good_client);
    assert_eq!(response, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi");
}

//! End-to-end tests over localhost TCP
//!
//! Each test starts its own listener on an ephemeral port and drives the
//! public API the way an embedding application would.

use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tether_net::config::NetConfig;
use tether_net::http::{build_response_header, read_header, HeaderLines, HttpRequest};
use tether_net::net::Connection;
use tether_net::tls::{Certificate, PeerProviders, Protocol, SecureSession, SecureStream, SessionOptions};
use tether_net::transport::{TcpTransport, Transport};
use tether_net::ws::{AcceptPolicy, WebSocket, WsOptions, WsRead};
use tether_net::{Error, NetworkRuntime};

const TIMEOUT: Duration = Duration::from_secs(10);

/// Log output for failing runs; `RUST_LOG=tether_net=debug` turns it up
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_test_writer()
        .try_init();
}

fn peer_runtime() -> NetworkRuntime {
    init_tracing();
    NetworkRuntime::builder()
        .providers(Arc::new(PeerProviders))
        .init(NetConfig::default())
        .unwrap()
}

/// Accept one TLS client with `cert` and hand the stream to `serve`
fn tls_server<F, R>(cert: Arc<Certificate>, serve: F) -> (u16, thread::JoinHandle<tether_net::Result<R>>)
where
    F: FnOnce(SecureStream<TcpTransport>) -> tether_net::Result<R> + Send + 'static,
    R: Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept()?;
        let tcp = TcpTransport::from_stream(stream)?;
        let options = SessionOptions::server().with_certificate(cert);
        let session = SecureSession::new(Protocol::Tls, options, &PeerProviders)?;
        let secure = SecureStream::accept(tcp, session, TIMEOUT)?;
        serve(secure)
    });
    (port, handle)
}

#[test]
fn secure_websocket_with_pinned_fingerprint() {
    let cert = Arc::new(Certificate::generate());
    let fingerprint = cert.fingerprint();

    let (port, server) = tls_server(cert, |stream| {
        let mut ws = WebSocket::accept(stream, &AcceptPolicy::allow_any(), WsOptions::default(), TIMEOUT)?;
        loop {
            match ws.read(TIMEOUT)? {
                WsRead::Message(text) => {
                    ws.write(&text.to_uppercase())?;
                    return Ok(text);
                }
                WsRead::Continue => continue,
                WsRead::Closed(code) => return Err(Error::WebSocket(format!("closed early with {}", code))),
            }
        }
    });

    let runtime = peer_runtime();
    let options = SessionOptions::client().with_peer_fingerprint(fingerprint.clone());
    let conn = Connection::connect_secure(runtime.connect_context(), "127.0.0.1", port, options, TIMEOUT).unwrap();
    assert!(conn.is_secure());
    assert_eq!(conn.peer_fingerprint(), Some(fingerprint));

    let mut ws =
        WebSocket::client_handshake(conn, "127.0.0.1", "/chat", None, WsOptions::default(), TIMEOUT).unwrap();
    ws.write("hello over tls").unwrap();

    let reply = loop {
        match ws.read(TIMEOUT).unwrap() {
            WsRead::Message(text) => break text,
            WsRead::Continue => continue,
            WsRead::Closed(code) => panic!("closed with {}", code),
        }
    };
    assert_eq!(reply, "HELLO OVER TLS");
    assert_eq!(server.join().unwrap().unwrap(), "hello over tls");
}

#[test]
fn default_providers_keep_pinned_links_on_peer_provider() {
    let cert = Arc::new(Certificate::generate());
    let fingerprint = cert.fingerprint();

    let (port, server) = tls_server(cert, |mut stream| {
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf, TIMEOUT)?;
        stream.write_all(&buf)?;
        Ok(())
    });

    init_tracing();
    let runtime = NetworkRuntime::init(NetConfig::default()).unwrap();
    let options = SessionOptions::client().with_peer_fingerprint(fingerprint.clone());
    let mut conn =
        Connection::connect_secure(runtime.connect_context(), "127.0.0.1", port, options, TIMEOUT).unwrap();
    assert_eq!(conn.peer_fingerprint(), Some(fingerprint));

    conn.write_all(b"ping").unwrap();
    let mut echoed = [0u8; 4];
    conn.read_exact(&mut echoed, TIMEOUT).unwrap();
    assert_eq!(&echoed, b"ping");
    server.join().unwrap().unwrap();
}

#[test]
fn pinned_fingerprint_mismatch_fails_connect() {
    let cert = Arc::new(Certificate::generate());
    let other = Certificate::generate();

    let (port, server) = tls_server(cert, |_stream| Ok(()));

    let runtime = peer_runtime();
    let options = SessionOptions::client().with_peer_fingerprint(other.fingerprint());
    let result = Connection::connect_secure(runtime.connect_context(), "127.0.0.1", port, options, TIMEOUT);
    assert!(matches!(result, Err(Error::FingerprintMismatch { .. })));

    // The server never sees a finished handshake
    assert!(server.join().unwrap().is_err());
    assert_eq!(runtime.metrics().handshakes_failed(), 1);
}

#[test]
fn request_through_proxy_tunnel() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let proxy_port = listener.local_addr().unwrap().port();
    let proxy = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut tcp = TcpTransport::from_stream(stream).unwrap();

        let connect = read_header(&mut tcp, 4096, TIMEOUT).unwrap();
        tcp.write_all(build_response_header(200, "Connection Established", None).as_bytes())
            .unwrap();

        // Act as the origin once the tunnel is up
        let request = read_header(&mut tcp, 4096, TIMEOUT).unwrap();
        let mut lines = HeaderLines::new();
        lines.set("Transfer-Encoding", "chunked");
        tcp.write_all(build_response_header(200, "OK", Some(lines.as_str())).as_bytes())
            .unwrap();
        tcp.write_all(b"6\r\ntunnel\r\n6\r\ned ok!\r\n0\r\n\r\n").unwrap();

        (connect.first_line().to_string(), request.first_line().to_string())
    });

    let runtime = peer_runtime();
    runtime
        .set_proxy(Some(&format!("http://127.0.0.1:{}", proxy_port)))
        .unwrap();

    let req = HttpRequest::new("GET", "origin.invalid", "/data").with_port(8080);
    let response = runtime.request(&req, TIMEOUT).unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.text().unwrap(), "tunneled ok!");

    let (connect, request) = proxy.join().unwrap();
    assert_eq!(connect, "CONNECT origin.invalid:8080 HTTP/1.1");
    assert_eq!(request, "GET /data HTTP/1.1");
    assert_eq!(runtime.metrics().requests_total(), 1);
}

#[test]
fn async_request_end_to_end() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut tcp = TcpTransport::from_stream(stream).unwrap();
        let request = read_header(&mut tcp, 4096, TIMEOUT).unwrap();
        let len = request.value_int("Content-Length").unwrap_or(0) as usize;
        let mut body = vec![0u8; len];
        tcp.read_exact(&mut body, TIMEOUT).unwrap();

        let mut lines = HeaderLines::new();
        lines.set_int("Content-Length", body.len() as i64);
        tcp.write_all(build_response_header(201, "Created", Some(lines.as_str())).as_bytes())
            .unwrap();
        tcp.write_all(&body).unwrap();
    });

    let runtime = peer_runtime();
    runtime.start_async();

    let mut handle = None;
    let req = HttpRequest::new("POST", "127.0.0.1", "/echo")
        .with_port(port)
        .with_headers("Content-Type: text/plain")
        .with_body(b"echo me".to_vec());
    runtime.http().request(&mut handle, req, TIMEOUT, false).unwrap();

    let deadline = std::time::Instant::now() + TIMEOUT;
    let response = loop {
        match runtime.http().poll(handle) {
            tether_net::AsyncPoll::Continue if std::time::Instant::now() < deadline => {
                thread::sleep(Duration::from_millis(5))
            }
            tether_net::AsyncPoll::Ok(response) => break response,
            other => panic!("unexpected {:?}", other),
        }
    };
    assert_eq!(response.status, 201);
    assert_eq!(&response.body[..], b"echo me");

    runtime.http().clear(&mut handle);
    assert_eq!(runtime.http().outstanding(), 0);
    runtime.shutdown();
}

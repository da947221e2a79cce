//! End-to-end tests: a real server on a loopback socket, driven with
//! plain `TcpStream`s.

use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use skiff_http::{CredentialStore, MemoryCredentials};
use skiff_server::{Server, ServerConfig, ServerHandle};

struct TempRoot {
    dir: PathBuf,
}

impl TempRoot {
    fn new(name: &str) -> Self {
        let dir = std::env::temp_dir().join(format!("skiff-e2e-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        Self { dir }
    }

    fn write(&self, name: &str, contents: &[u8]) {
        fs::write(self.dir.join(name), contents).unwrap();
    }

    fn root(&self) -> String {
        self.dir.to_str().unwrap().to_string()
    }
}

impl Drop for TempRoot {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

struct TestServer {
    handle: ServerHandle,
    port: u16,
    thread: Option<JoinHandle<()>>,
}

impl TestServer {
    fn start(config: ServerConfig, store: Arc<dyn CredentialStore>) -> Self {
        let mut server = Server::new(config.port(0), store).expect("server init");
        let port = server.port();
        let handle = server.handle();
        let thread = std::thread::spawn(move || server.run());
        Self {
            handle,
            port,
            thread: Some(thread),
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(("127.0.0.1", self.port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        stream
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn base_config(root: &TempRoot) -> ServerConfig {
    ServerConfig::new()
        .doc_root(root.root())
        .workers(2)
        .log_enabled(false)
}

/// Read one response: status line + headers, then exactly Content-Length
/// body bytes.
fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut raw = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).expect("read response");
        assert!(n > 0, "connection closed before full response");
        raw.extend_from_slice(&chunk[..n]);
        if let Some(split) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&raw[..split]).into_owned();
            let body_len: usize = head
                .lines()
                .find_map(|l| l.strip_prefix("Content-Length: "))
                .expect("missing Content-Length")
                .parse()
                .unwrap();
            let mut body = raw[split + 4..].to_vec();
            while body.len() < body_len {
                let n = stream.read(&mut chunk).expect("read body");
                assert!(n > 0);
                body.extend_from_slice(&chunk[..n]);
            }
            return (head, body);
        }
    }
}

fn expect_eof(stream: &mut TcpStream) {
    let mut chunk = [0u8; 64];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => return,
            Ok(_) => continue,
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                panic!("expected peer close, got timeout")
            }
            Err(_) => return,
        }
    }
}

#[test]
fn test_serves_static_file() {
    let root = TempRoot::new("static");
    root.write("index.html", b"<h1>welcome</h1>");
    let server = TestServer::start(base_config(&root), Arc::new(MemoryCredentials::new()));

    let mut stream = server.connect();
    stream
        .write_all(b"GET /index.html HTTP/1.1\r\nConnection: close\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert!(head.contains("Content-Type: text/html"));
    assert!(head.contains("Connection: close"));
    assert_eq!(body, b"<h1>welcome</h1>");
    expect_eof(&mut stream);
}

#[test]
fn test_bare_route_and_index_rewrites() {
    let root = TempRoot::new("routes");
    root.write("index.html", b"home");
    root.write("picture.html", b"pics");
    let server = TestServer::start(base_config(&root), Arc::new(MemoryCredentials::new()));

    let mut stream = server.connect();
    stream
        .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert_eq!(body, b"home");

    let mut stream = server.connect();
    stream
        .write_all(b"GET /picture HTTP/1.1\r\nConnection: close\r\n\r\n")
        .unwrap();
    let (_, body) = read_response(&mut stream);
    assert_eq!(body, b"pics");
}

#[test]
fn test_missing_file_serves_404_document() {
    let root = TempRoot::new("missing");
    root.write("404.html", b"there is nothing here");
    let server = TestServer::start(base_config(&root), Arc::new(MemoryCredentials::new()));

    let mut stream = server.connect();
    stream
        .write_all(b"GET /ghost.html HTTP/1.1\r\nConnection: close\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 404 Not Found"));
    assert_eq!(body, b"there is nothing here");
}

#[test]
fn test_missing_error_document_falls_back_to_synthesized_body() {
    let root = TempRoot::new("synth");
    let server = TestServer::start(base_config(&root), Arc::new(MemoryCredentials::new()));

    let mut stream = server.connect();
    stream
        .write_all(b"GET /ghost.html HTTP/1.1\r\nConnection: close\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 404 Not Found"));
    assert!(String::from_utf8_lossy(&body).contains("404 : Not Found"));
}

#[test]
fn test_keep_alive_serves_sequential_requests() {
    let root = TempRoot::new("keepalive");
    root.write("a.txt", b"first");
    root.write("b.txt", b"second");
    let server = TestServer::start(base_config(&root), Arc::new(MemoryCredentials::new()));

    let mut stream = server.connect();
    stream
        .write_all(b"GET /a.txt HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.contains("Connection: keep-alive"));
    assert!(head.contains("keep-alive: max=6, timeout=120"));
    assert_eq!(body, b"first");

    stream
        .write_all(b"GET /b.txt HTTP/1.1\r\nConnection: close\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.contains("Connection: close"));
    assert_eq!(body, b"second");
    expect_eof(&mut stream);
}

#[test]
fn test_post_login_serves_welcome_page() {
    let root = TempRoot::new("login");
    root.write("welcome.html", b"hello alice");
    root.write("error.html", b"bad credentials");
    let store = Arc::new(MemoryCredentials::with_users([("alice", "secret")]));
    let server = TestServer::start(base_config(&root), store);

    let body = "username=alice&password=secret";
    let request = format!(
        "POST /login HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let mut stream = server.connect();
    stream.write_all(request.as_bytes()).unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert_eq!(body, b"hello alice");

    // Wrong password lands on the error page.
    let body = "username=alice&password=wrong";
    let request = format!(
        "POST /login HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let mut stream = server.connect();
    stream.write_all(request.as_bytes()).unwrap();
    let (_, body) = read_response(&mut stream);
    assert_eq!(body, b"bad credentials");
}

#[test]
fn test_idle_connection_is_evicted() {
    let root = TempRoot::new("evict");
    root.write("index.html", b"x");
    let config = base_config(&root).timeout_ms(300);
    let server = TestServer::start(config, Arc::new(MemoryCredentials::new()));

    let mut stream = server.connect();
    // Send nothing: the reactor must close this connection on its own
    // within one polling cycle of the deadline.
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut chunk = [0u8; 16];
    let start = std::time::Instant::now();
    let n = stream.read(&mut chunk).unwrap_or(0);
    assert_eq!(n, 0, "expected eviction close, got data");
    assert!(start.elapsed() < Duration::from_secs(4));
}

#[test]
fn test_activity_refreshes_idle_timer() {
    let root = TempRoot::new("refresh");
    root.write("a.txt", b"tick");
    let config = base_config(&root).timeout_ms(600);
    let server = TestServer::start(config, Arc::new(MemoryCredentials::new()));

    let mut stream = server.connect();
    // Three requests spaced under the timeout keep the connection alive
    // well past the original deadline.
    for _ in 0..3 {
        std::thread::sleep(Duration::from_millis(300));
        stream
            .write_all(b"GET /a.txt HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        let (head, body) = read_response(&mut stream);
        assert!(head.starts_with("HTTP/1.1 200 OK"));
        assert_eq!(body, b"tick");
    }
}

#[test]
fn test_capacity_rejection_sends_busy() {
    let root = TempRoot::new("busy");
    root.write("index.html", b"x");
    let config = base_config(&root).max_connections(1);
    let server = TestServer::start(config, Arc::new(MemoryCredentials::new()));

    // First connection occupies the single slot.
    let mut first = server.connect();
    first
        .write_all(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let _ = read_response(&mut first);

    // Second connection is rejected with the fixed busy message.
    let mut second = server.connect();
    let mut raw = Vec::new();
    let mut chunk = [0u8; 256];
    loop {
        match second.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => raw.extend_from_slice(&chunk[..n]),
            Err(_) => break,
        }
    }
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.1 503 Service Unavailable"), "got: {text}");
    assert!(text.ends_with("Server busy!"));
}

#[test]
fn test_level_triggered_mode_serves_too() {
    let root = TempRoot::new("lt");
    root.write("index.html", b"level");
    let config = base_config(&root).trig_mode(0);
    let server = TestServer::start(config, Arc::new(MemoryCredentials::new()));

    let mut stream = server.connect();
    stream
        .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert_eq!(body, b"level");
}

#[test]
fn test_many_concurrent_connections() {
    let root = TempRoot::new("concurrent");
    root.write("index.html", b"fan out");
    let config = base_config(&root).workers(4);
    let server = TestServer::start(config, Arc::new(MemoryCredentials::new()));

    let mut clients = Vec::new();
    for _ in 0..32 {
        let mut stream = server.connect();
        stream
            .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .unwrap();
        clients.push(stream);
    }
    for mut stream in clients {
        let (head, body) = read_response(&mut stream);
        assert!(head.starts_with("HTTP/1.1 200 OK"));
        assert_eq!(body, b"fan out");
    }
}

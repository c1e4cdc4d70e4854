#![allow(dead_code)]

use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::watch;

use legion::{Server, ServerConfig};

/// A real server instance on an ephemeral loopback port, backed by a
/// temporary asset tree and a throwaway self-signed certificate.
pub struct TestServer {
    pub addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    thread: Option<thread::JoinHandle<()>>,
    client_config: Arc<rustls::ClientConfig>,
    _dir: TempDir,
}

/// The standard asset tree used by the protocol scenarios.
pub fn default_assets(dir: &Path) {
    fs::write(dir.join("index.html"), "<h1>hi</h1>\n").unwrap();
    fs::write(dir.join("error_404.html"), "404\n").unwrap();
    fs::write(dir.join("error_500.html"), "500\n").unwrap();
}

pub fn spawn_server() -> TestServer {
    spawn_server_with(|_| {})
}

/// Start a server over `default_assets` plus whatever `populate` adds.
pub fn spawn_server_with(populate: impl FnOnce(&Path)) -> TestServer {
    let dir = TempDir::new().unwrap();
    let assets = dir.path().join("assets");
    fs::create_dir(&assets).unwrap();
    default_assets(&assets);
    populate(&assets);

    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_path = dir.path().join("server.crt");
    let key_path = dir.path().join("server.key");
    fs::write(&cert_path, cert.cert.pem()).unwrap();
    fs::write(&key_path, cert.key_pair.serialize_pem()).unwrap();

    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert.cert.der().clone()).unwrap();
    let client_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    );

    let config = ServerConfig {
        ip: Some("127.0.0.1".parse().unwrap()),
        port: 0,
        asset_root: assets,
        cert: cert_path,
        key: key_path,
    };

    let (shutdown, shutdown_rx) = watch::channel(false);
    let (addr_tx, addr_rx) = std::sync::mpsc::channel();
    let thread = thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let server = Server::bind(&config).expect("failed to start test server");
            addr_tx.send(server.local_addr()).unwrap();
            server.run(shutdown_rx).await;
        });
    });
    let addr = addr_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("server did not come up");

    TestServer {
        addr,
        shutdown,
        thread: Some(thread),
        client_config,
        _dir: dir,
    }
}

impl TestServer {
    pub fn client(&self) -> TlsClient {
        TlsClient::connect(self.addr, Arc::clone(&self.client_config))
    }

    /// One-shot request over a fresh session.
    pub fn request(&self, raw: &str) -> Response {
        let mut client = self.client();
        client.send(raw.as_bytes());
        client.read_response(false)
    }

    /// Signal shutdown and wait for the server thread to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Synchronous TLS client speaking raw HTTP/1.1 over one session.
pub struct TlsClient {
    conn: rustls::ClientConnection,
    sock: TcpStream,
}

impl TlsClient {
    pub fn connect(addr: SocketAddr, config: Arc<rustls::ClientConfig>) -> Self {
        let sock = TcpStream::connect(addr).unwrap();
        sock.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        let name = rustls::pki_types::ServerName::try_from("localhost".to_string()).unwrap();
        let conn = rustls::ClientConnection::new(config, name).unwrap();
        Self { conn, sock }
    }

    fn stream(&mut self) -> rustls::Stream<'_, rustls::ClientConnection, TcpStream> {
        rustls::Stream::new(&mut self.conn, &mut self.sock)
    }

    pub fn send(&mut self, bytes: &[u8]) {
        self.try_send(bytes).unwrap();
    }

    /// Send without panicking, for peers that expect to be cut off.
    pub fn try_send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stream().write_all(bytes)
    }

    /// Read one response. With `head_only` the body is not read even though
    /// Content-Length is nonzero (HEAD semantics). Panics if the server
    /// closes the session before a full response arrives.
    pub fn read_response(&mut self, head_only: bool) -> Response {
        self.response_inner(head_only)
            .expect("connection closed before a full response")
    }

    /// Like `read_response`, but `None` when the server closes the session
    /// before (or while) answering.
    pub fn try_read_response(&mut self) -> Option<Response> {
        self.response_inner(false)
    }

    fn response_inner(&mut self, head_only: bool) -> Option<Response> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        let header_end = loop {
            if let Some(pos) = find(&buf, b"\r\n\r\n") {
                break pos;
            }
            match self.stream().read(&mut chunk) {
                Ok(0) | Err(_) => return None,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        };

        let head = String::from_utf8(buf[..header_end].to_vec()).unwrap();
        let mut lines = head.split("\r\n");
        let status = lines.next().unwrap().to_string();
        let headers: Vec<(String, String)> = lines
            .filter_map(|line| {
                line.split_once(": ")
                    .map(|(name, value)| (name.to_string(), value.to_string()))
            })
            .collect();

        let mut body = buf[header_end + 4..].to_vec();
        if !head_only {
            let len: usize = headers
                .iter()
                .find(|(name, _)| name == "Content-Length")
                .map(|(_, value)| value.parse().unwrap())
                .unwrap_or(0);
            while body.len() < len {
                match self.stream().read(&mut chunk) {
                    Ok(0) | Err(_) => return None,
                    Ok(n) => body.extend_from_slice(&chunk[..n]),
                }
            }
        }

        Some(Response {
            status,
            headers,
            body,
        })
    }

    /// Assert the server closes the session from its side.
    pub fn expect_close(&mut self) {
        use std::io::ErrorKind;

        let mut chunk = [0u8; 64];
        match self.stream().read(&mut chunk) {
            Ok(0) => {}
            Ok(n) => panic!("expected close, read {n} more bytes"),
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                panic!("expected close, timed out waiting for it")
            }
            // Reset or truncated close-notify both count as closed.
            Err(_) => {}
        }
    }
}

pub struct Response {
    pub status: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn code(&self) -> u16 {
        self.status
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse().ok())
            .unwrap_or(0)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header == name)
            .map(|(_, value)| value.as_str())
    }
}

pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

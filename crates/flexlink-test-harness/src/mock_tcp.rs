//! Scripted mock radio for command channel tests.
//!
//! [`MockTcpServer`] listens on a random localhost port, accepts a single
//! client, writes its greeting lines (typically the `V` version and `H`
//! handle lines a radio sends on connect), then walks a queue of
//! expectations: for each one it reads a line from the client, checks it,
//! and writes back the scripted response lines. Every line the client sent
//! is returned from [`wait`](MockTcpServer::wait).
//!
//! # Example
//!
//! ```
//! use flexlink_test_harness::MockTcpServer;
//!
//! # async fn example() -> flexlink_core::Result<()> {
//! let mut server = MockTcpServer::new().await?;
//! server.greet("V1.4.0.0");
//! server.greet("H40000001");
//! // When the client sends "C0|info", reply with "R0|0|model=FLEX-6600".
//! server.expect("C0|info", &["R0|0|model=FLEX-6600"]);
//! server.start();
//! // ... connect to server.addr() and test ...
//! let received = server.wait().await.map_err(flexlink_core::Error::Protocol)?;
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use flexlink_core::error::{Error, Result};

use crate::mock_relay::self_signed_acceptor;

const LINE_TIMEOUT: Duration = Duration::from_secs(5);

/// One scripted exchange.
#[derive(Debug, Clone)]
struct LineExpectation {
    /// The exact line (without terminator) the client must send.
    request: String,
    /// Lines written back once the request has been seen.
    responses: Vec<String>,
}

/// What the server does once the script is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterScript {
    /// Close the connection.
    Close,
    /// Keep reading and recording lines until the client disconnects.
    Drain,
}

type ServerResult = std::result::Result<Vec<String>, String>;

/// A scripted, line-oriented mock radio.
pub struct MockTcpServer {
    listener: Option<TcpListener>,
    acceptor: Option<TlsAcceptor>,
    addr: SocketAddr,
    greeting: Vec<Vec<u8>>,
    expectations: VecDeque<LineExpectation>,
    after: AfterScript,
    server_handle: Option<JoinHandle<ServerResult>>,
}

impl MockTcpServer {
    /// Create a plain TCP server on a random port.
    pub async fn new() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| Error::Transport(format!("failed to bind mock TCP server: {e}")))?;
        let addr = listener.local_addr().map_err(Error::Io)?;

        Ok(Self {
            listener: Some(listener),
            acceptor: None,
            addr,
            greeting: Vec::new(),
            expectations: VecDeque::new(),
            after: AfterScript::Close,
            server_handle: None,
        })
    }

    /// Create a server that requires TLS, with a self-signed certificate.
    pub async fn new_tls() -> Result<Self> {
        let mut server = Self::new().await?;
        server.acceptor = Some(self_signed_acceptor()?);
        Ok(server)
    }

    /// Queue a line to send as soon as the client connects.
    pub fn greet(&mut self, line: &str) {
        self.greet_bytes(line.as_bytes());
    }

    /// Queue a raw greeting line, for bytes that are not valid UTF-8.
    pub fn greet_bytes(&mut self, line: &[u8]) {
        self.greeting.push(line.to_vec());
    }

    /// Add an expected request line and the lines to answer it with.
    pub fn expect(&mut self, request: &str, responses: &[&str]) {
        self.expectations.push_back(LineExpectation {
            request: request.to_string(),
            responses: responses.iter().map(|s| s.to_string()).collect(),
        });
    }

    /// Choose what happens after the last expectation (default: close).
    pub fn after_script(&mut self, after: AfterScript) {
        self.after = after;
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Spawn the server task. It accepts exactly one connection.
    pub fn start(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        let acceptor = self.acceptor.clone();
        let greeting = std::mem::take(&mut self.greeting);
        let expectations: Vec<LineExpectation> = self.expectations.drain(..).collect();
        let after = self.after;

        let handle = tokio::spawn(async move {
            let (tcp, _) = listener
                .accept()
                .await
                .map_err(|e| format!("failed to accept connection: {e}"))?;

            match acceptor {
                Some(acceptor) => {
                    let tls = acceptor
                        .accept(tcp)
                        .await
                        .map_err(|e| format!("TLS accept failed: {e}"))?;
                    run_script(tls, greeting, expectations, after).await
                }
                None => run_script(tcp, greeting, expectations, after).await,
            }
        });

        self.server_handle = Some(handle);
    }

    /// Wait for the server task and return every line the client sent.
    pub async fn wait(self) -> ServerResult {
        match self.server_handle {
            Some(handle) => handle
                .await
                .map_err(|e| format!("server task panicked: {e}"))?,
            None => Ok(Vec::new()),
        }
    }
}

async fn run_script<S>(
    stream: S,
    greeting: Vec<Vec<u8>>,
    expectations: Vec<LineExpectation>,
    after: AfterScript,
) -> ServerResult
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let mut received = Vec::new();

    write_lines(&mut writer, &greeting).await?;

    for (i, expectation) in expectations.iter().enumerate() {
        let line = match read_line(&mut reader).await? {
            Some(line) => line,
            None => {
                return Err(format!(
                    "expectation {i}: client disconnected (expected {:?})",
                    expectation.request
                ));
            }
        };
        received.push(line.clone());

        if line != expectation.request {
            return Err(format!(
                "expectation {i}: request mismatch: expected {:?}, got {line:?}",
                expectation.request
            ));
        }

        write_lines(&mut writer, &expectation.responses)
            .await
            .map_err(|e| format!("expectation {i}: {e}"))?;
    }

    if after == AfterScript::Drain {
        while let Some(line) = read_line(&mut reader).await? {
            received.push(line);
        }
    }

    let _ = writer.shutdown().await;
    Ok(received)
}

async fn write_lines<W, L>(writer: &mut W, lines: &[L]) -> std::result::Result<(), String>
where
    W: AsyncWrite + Unpin,
    L: AsRef<[u8]>,
{
    for line in lines {
        let mut bytes = line.as_ref().to_vec();
        bytes.push(b'\n');
        writer
            .write_all(&bytes)
            .await
            .map_err(|e| format!("write error: {e}"))?;
    }
    writer.flush().await.map_err(|e| format!("flush error: {e}"))
}

async fn read_line<R: AsyncBufReadExt + Unpin>(
    reader: &mut R,
) -> std::result::Result<Option<String>, String> {
    let mut line = String::new();
    let n = tokio::time::timeout(LINE_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| "timed out waiting for a line".to_string())?
        .map_err(|e| format!("read error: {e}"))?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

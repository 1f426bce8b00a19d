//! Mock SmartLink relay: a TLS line server with a self-signed certificate.
//!
//! Unlike [`MockTcpServer`](crate::MockTcpServer), the relay is driven
//! interactively: a test accepts the client, then pushes and reads lines in
//! whatever order the scenario needs.
//!
//! # Example
//!
//! ```no_run
//! use flexlink_test_harness::MockRelay;
//!
//! # async fn example() -> flexlink_core::Result<()> {
//! let relay = MockRelay::new().await?;
//! let port = relay.port();
//! // ... start the client against 127.0.0.1:port ...
//! let mut conn = relay.accept().await?;
//! let register = conn.recv_line().await?;
//! conn.send_line("application info public_ip=203.0.113.7").await?;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;

use flexlink_core::error::{Error, Result};

/// How long [`RelayConnection::recv_line`] waits before giving up.
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Build a TLS acceptor around a freshly generated self-signed certificate
/// for `localhost`.
pub fn self_signed_acceptor() -> Result<TlsAcceptor> {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .map_err(|e| Error::Tls(format!("certificate generation failed: {e}")))?;

    let cert_chain = vec![CertificateDer::from(certified.cert.der().to_vec())];
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| Error::Tls(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// A TLS listener on a random localhost port.
pub struct MockRelay {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    addr: SocketAddr,
}

impl MockRelay {
    pub async fn new() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| Error::Transport(format!("failed to bind mock relay: {e}")))?;
        let addr = listener.local_addr()?;
        Ok(Self {
            listener,
            acceptor: self_signed_acceptor()?,
            addr,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Accept one client and complete the TLS handshake.
    pub async fn accept(&self) -> Result<RelayConnection> {
        let (tcp, peer) = tokio::time::timeout(RECV_TIMEOUT, self.listener.accept())
            .await
            .map_err(|_| Error::Timeout)??;
        let tls = self
            .acceptor
            .accept(tcp)
            .await
            .map_err(|e| Error::Tls(e.to_string()))?;
        tracing::debug!(peer = %peer, "Mock relay accepted client");

        let (read_half, write_half) = tokio::io::split(tls);
        Ok(RelayConnection {
            reader: BufReader::new(read_half),
            writer: write_half,
            peer,
        })
    }
}

/// One accepted relay client.
pub struct RelayConnection {
    reader: BufReader<ReadHalf<TlsStream<TcpStream>>>,
    writer: WriteHalf<TlsStream<TcpStream>>,
    peer: SocketAddr,
}

impl RelayConnection {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Write `line` followed by a newline.
    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        self.send_bytes(line.as_bytes()).await
    }

    /// Write raw bytes followed by a newline.
    pub async fn send_bytes(&mut self, line: &[u8]) -> Result<()> {
        self.writer.write_all(line).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Read the next line without its terminator.
    ///
    /// Returns [`Error::ConnectionLost`] when the client has closed the
    /// connection and [`Error::Timeout`] after five seconds of silence.
    pub async fn recv_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = tokio::time::timeout(RECV_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .map_err(|_| Error::Timeout)??;
        if n == 0 {
            return Err(Error::ConnectionLost);
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Read lines until one starts with `prefix`, skipping keep-alive pings.
    pub async fn recv_matching(&mut self, prefix: &str) -> Result<String> {
        loop {
            let line = self.recv_line().await?;
            if line.starts_with(prefix) {
                return Ok(line);
            }
            if line != "ping from client" {
                return Err(Error::Protocol(format!(
                    "expected line starting with {prefix:?}, got {line:?}"
                )));
            }
        }
    }

    /// Close the connection from the relay side.
    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
    }
}

//! TCP streams for the command channel and the relay control channel.
//!
//! [`NetStream`] is a TCP connection that may have been upgraded to TLS.
//! LAN radios speak plain TCP; the SmartLink relay and radios reached
//! through it require TLS immediately after the TCP connect. Both variants
//! implement `AsyncRead`/`AsyncWrite`, so line readers and writers do not
//! care which one they hold.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::client::TlsStream;

use flexlink_core::error::{Error, Result};

use crate::tls::{self, TrustPolicy};

/// Default connection timeout (5 seconds).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Options for establishing a TCP connection.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Maximum time to wait for the TCP connect.
    pub timeout: Duration,
    /// Bind the local end to this address before connecting (hole punching).
    pub local_addr: Option<SocketAddr>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_CONNECT_TIMEOUT,
            local_addr: None,
        }
    }
}

/// A TCP connection, optionally wrapped in TLS.
#[derive(Debug)]
pub enum NetStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl NetStream {
    /// Open a plain TCP connection to `host:port`.
    ///
    /// `host` may be a DNS name or an IP literal. When
    /// [`ConnectOptions::local_addr`] is set, the socket is bound to that
    /// address first, with address reuse enabled.
    pub async fn connect(host: &str, port: u16, options: &ConnectOptions) -> Result<Self> {
        tracing::debug!(
            host = %host,
            port = port,
            local = ?options.local_addr,
            timeout_ms = options.timeout.as_millis(),
            "Connecting to TCP endpoint"
        );

        let stream = tokio::time::timeout(options.timeout, open(host, port, options.local_addr))
            .await
            .map_err(|_| {
                tracing::error!(host = %host, port = port, "TCP connection timed out");
                Error::Timeout
            })?
            .map_err(|e| {
                tracing::error!(host = %host, port = port, error = %e, "TCP connection failed");
                map_connect_error(e, host, port)
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(
                host = %host,
                error = %e,
                "Failed to set TCP_NODELAY (continuing anyway)"
            );
        }

        tracing::info!(host = %host, port = port, "TCP connection established");
        Ok(NetStream::Plain(stream))
    }

    /// Upgrade a plain connection to TLS.
    ///
    /// Upgrading an already secured stream is an error.
    pub async fn into_tls(self, host: &str, trust: &TrustPolicy) -> Result<Self> {
        let tcp = match self {
            NetStream::Plain(tcp) => tcp,
            NetStream::Tls(_) => {
                return Err(Error::InvalidParameter("stream is already TLS".into()));
            }
        };

        let name = tls::server_name(host)?;
        let tls = trust.connector().connect(name, tcp).await.map_err(|e| {
            tracing::error!(host = %host, error = %e, "TLS handshake failed");
            Error::Tls(e.to_string())
        })?;

        tracing::debug!(host = %host, "TLS session established");
        Ok(NetStream::Tls(Box::new(tls)))
    }

    /// Whether the stream is TLS-wrapped.
    pub fn is_tls(&self) -> bool {
        matches!(self, NetStream::Tls(_))
    }

    fn tcp(&self) -> &TcpStream {
        match self {
            NetStream::Plain(tcp) => tcp,
            NetStream::Tls(tls) => tls.get_ref().0,
        }
    }

    /// Local address of the underlying TCP socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.tcp().local_addr().map_err(Error::Io)
    }

    /// Remote address of the underlying TCP socket.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.tcp().peer_addr().map_err(Error::Io)
    }
}

impl AsyncRead for NetStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            NetStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for NetStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            NetStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            NetStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetStream::Plain(s) => Pin::new(s).poll_flush(cx),
            NetStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            NetStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

async fn open(host: &str, port: u16, local: Option<SocketAddr>) -> io::Result<TcpStream> {
    let Some(local) = local else {
        return TcpStream::connect((host, port)).await;
    };

    let remote = tokio::net::lookup_host((host, port))
        .await?
        .find(|addr| addr.is_ipv4() == local.is_ipv4())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no address for {host} matching local family"),
            )
        })?;

    let socket = if local.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(local)?;
    socket.connect(remote).await
}

/// Map a connect error to an [`Error`] with a readable message.
fn map_connect_error(e: io::Error, host: &str, port: u16) -> Error {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => {
            Error::Transport(format!("connection refused by {host}:{port}"))
        }
        io::ErrorKind::AddrInUse | io::ErrorKind::AddrNotAvailable => {
            Error::Transport(format!("cannot bind local address for {host}:{port}: {e}"))
        }
        _ => Error::Transport(format!("failed to connect to {host}:{port}: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connect_plain_and_exchange_line() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            line
        });

        let mut stream = NetStream::connect("127.0.0.1", port, &ConnectOptions::default())
            .await
            .unwrap();
        assert!(!stream.is_tls());
        assert_eq!(stream.peer_addr().unwrap().port(), port);

        stream.write_all(b"C0|info\n").await.unwrap();
        stream.flush().await.unwrap();

        assert_eq!(server.await.unwrap(), "C0|info\n");
    }

    #[tokio::test]
    async fn connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = NetStream::connect("127.0.0.1", port, &ConnectOptions::default()).await;
        assert!(matches!(result, Err(Error::Transport(_))));
    }

    #[tokio::test]
    async fn connect_from_local_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let spare = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let local = spare.local_addr().unwrap();
        drop(spare);

        let accept = tokio::spawn(async move {
            let (_stream, peer) = listener.accept().await.unwrap();
            peer
        });

        let options = ConnectOptions {
            local_addr: Some(local),
            ..ConnectOptions::default()
        };
        let stream = NetStream::connect("127.0.0.1", port, &options).await.unwrap();
        assert_eq!(stream.local_addr().unwrap(), local);
        assert_eq!(accept.await.unwrap(), local);
    }
}

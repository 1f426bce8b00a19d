//! UDP transport for discovery broadcasts and VITA-49 streams.
//!
//! [`UdpTransport`] wraps a [`tokio::net::UdpSocket`] with the error
//! mapping and logging used across flexlink. Three binding strategies are
//! offered:
//!
//! - [`bind`](UdpTransport::bind) -- a plain bind to one address
//! - [`bind_shared`](UdpTransport::bind_shared) -- address/port reuse plus
//!   broadcast, so several listeners on one host can hear discovery
//!   broadcasts on the same well-known port
//! - [`bind_with_retry`](UdpTransport::bind_with_retry) -- walk upward from a
//!   preferred port until a bind succeeds or the attempt budget runs out

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use flexlink_core::error::{Error, Result};

/// UDP socket with flexlink error mapping.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl UdpTransport {
    /// Bind to a local address.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        tracing::trace!(addr = %addr, "Binding UDP socket");

        let socket = UdpSocket::bind(addr).await.map_err(|e| {
            tracing::debug!(addr = %addr, error = %e, "Failed to bind UDP socket");
            Error::Io(e)
        })?;

        Self::from_socket(socket)
    }

    /// Bind with `SO_REUSEADDR` (and `SO_REUSEPORT` on Unix) and broadcast
    /// reception enabled.
    pub fn bind_shared(addr: SocketAddr) -> Result<Self> {
        tracing::debug!(addr = %addr, "Binding shared broadcast UDP socket");

        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into()).map_err(|e| {
            tracing::error!(addr = %addr, error = %e, "Failed to bind broadcast socket");
            Error::Transport(format!("failed to bind UDP {addr}: {e}"))
        })?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)?;
        Self::from_socket(socket)
    }

    /// Try `first_port`, then each following port, until a bind succeeds.
    ///
    /// At most `max_attempts` binds are made (at least one). On success the
    /// number of attempts used is returned with the transport; when every
    /// attempt fails, the last bind error is returned.
    pub async fn bind_with_retry(
        ip: IpAddr,
        first_port: u16,
        max_attempts: u32,
    ) -> Result<(Self, u32)> {
        let max_attempts = max_attempts.max(1);
        let mut port = first_port;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match Self::bind(SocketAddr::new(ip, port)).await {
                Ok(transport) => {
                    tracing::debug!(
                        local = %transport.local_addr,
                        attempts = attempt,
                        "UDP socket bound"
                    );
                    return Ok((transport, attempt));
                }
                Err(e) => {
                    let next = port.checked_add(1);
                    if attempt >= max_attempts || next.is_none() {
                        tracing::warn!(
                            ip = %ip,
                            first_port = first_port,
                            attempts = attempt,
                            error = %e,
                            "UDP bind attempts exhausted"
                        );
                        return Err(Error::BindExhausted {
                            ip,
                            first_port,
                            attempts: attempt,
                            reason: e.to_string(),
                        });
                    }
                    tracing::trace!(port = port, error = %e, "UDP port unavailable, trying next");
                    port = next.unwrap_or(port);
                }
            }
        }
    }

    fn from_socket(socket: UdpSocket) -> Result<Self> {
        let local_addr = socket.local_addr().map_err(|e| {
            tracing::error!(error = %e, "Failed to get local address");
            Error::Io(e)
        })?;
        Ok(Self { socket, local_addr })
    }

    /// The local address this socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send one datagram to `addr`.
    pub async fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<()> {
        tracing::trace!(
            local = %self.local_addr,
            remote = %addr,
            bytes = data.len(),
            "Sending datagram"
        );

        self.socket.send_to(data, addr).await.map_err(|e| {
            tracing::debug!(
                local = %self.local_addr,
                remote = %addr,
                error = %e,
                "Failed to send datagram"
            );
            Error::Io(e)
        })?;
        Ok(())
    }

    /// Wait for the next datagram. Returns `(bytes_read, source_addr)`.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await.map_err(Error::Io)
    }

    /// Wait up to `timeout` for the next datagram.
    pub async fn recv_from_timeout(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<(usize, SocketAddr)> {
        match tokio::time::timeout(timeout, self.socket.recv_from(buf)).await {
            Ok(result) => result.map_err(Error::Io),
            Err(_) => Err(Error::Timeout),
        }
    }
}

//! UDP data-plane channel to one radio.
//!
//! [`StreamChannel`] binds a local UDP port, decodes every inbound datagram
//! as a VITA-49 frame and forwards the decodable ones to the consumer. UDP
//! registration has no acknowledgement in the wire protocol, so
//! [`register`](StreamChannel::register) keeps sending
//! `client udp_register handle=0x...` until the first frame arrives.
//!
//! Treating any inbound frame as proof of registration is a heuristic: a
//! frame that was already in flight, or one meant for a previous session
//! on the same port, will stop the registration loop early.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use flexlink_core::error::{Error, Result};
use flexlink_core::{Radio, StreamStatus};
use flexlink_transport::UdpTransport;

use crate::codec;
use crate::endpoint::{self, StreamEndpoint, StreamPorts};
use crate::vita49::{self, OwnedPacket};

/// First local port tried for LAN radios.
pub const DEFAULT_LOCAL_UDP_PORT: u16 = 4991;

/// Port LAN radios receive stream datagrams on.
pub const DEFAULT_RADIO_UDP_PORT: u16 = 4993;

/// Bind attempts before giving up (not used when hole punching).
pub const DEFAULT_MAX_BIND_ATTEMPTS: u32 = 20;

/// Delay between registration datagrams. The tokio timer rounds this up to
/// its 1 ms resolution.
pub const DEFAULT_REGISTER_INTERVAL: Duration = Duration::from_micros(250);

const DEFAULT_FRAME_CAPACITY: usize = 1024;
const STATUS_CHANNEL_CAPACITY: usize = 64;
const RECV_BUFFER_SIZE: usize = 16384;

/// Options for a [`StreamChannel`].
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Local address to bind, unless hole punching picks the interface.
    pub bind_ip: IpAddr,
    /// First local port tried for LAN radios (default 4991).
    pub local_udp_port: u16,
    /// Radio's stream port for LAN radios (default 4993).
    pub radio_udp_port: u16,
    /// Bind attempt budget (default 20).
    pub max_bind_attempts: u32,
    /// Delay between registration datagrams (default 250 µs).
    pub register_interval: Duration,
    /// Frames buffered for the consumer before new ones are dropped.
    pub frame_capacity: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            local_udp_port: DEFAULT_LOCAL_UDP_PORT,
            radio_udp_port: DEFAULT_RADIO_UDP_PORT,
            max_bind_attempts: DEFAULT_MAX_BIND_ATTEMPTS,
            register_interval: DEFAULT_REGISTER_INTERVAL,
            frame_capacity: DEFAULT_FRAME_CAPACITY,
        }
    }
}

impl StreamOptions {
    fn ports(&self) -> StreamPorts {
        StreamPorts {
            bind_ip: self.bind_ip,
            local_udp_port: self.local_udp_port,
            radio_udp_port: self.radio_udp_port,
            max_bind_attempts: self.max_bind_attempts,
        }
    }
}

struct Bound {
    socket: Arc<UdpTransport>,
    remote: SocketAddr,
    cancel: CancellationToken,
    recv_task: JoinHandle<()>,
    register_task: Option<JoinHandle<()>>,
}

/// UDP stream channel to one radio.
pub struct StreamChannel {
    options: StreamOptions,
    bound: Mutex<Option<Bound>>,
    registered: Arc<AtomicBool>,
    handle: Arc<Mutex<Option<u32>>>,
    status_tx: broadcast::Sender<StreamStatus>,
}

impl StreamChannel {
    pub fn new(options: StreamOptions) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            options,
            bound: Mutex::new(None),
            registered: Arc::new(AtomicBool::new(false)),
            handle: Arc::new(Mutex::new(None)),
            status_tx,
        }
    }

    /// Bind the receive socket for `radio` and start receiving.
    ///
    /// Returns the receiver decoded frames are delivered on. Port selection
    /// follows [`endpoint::stream_endpoint`]; when hole punching, exactly
    /// one bind is attempted on the negotiated port.
    pub async fn bind(&self, radio: &Radio) -> Result<mpsc::Receiver<OwnedPacket>> {
        let target = endpoint::stream_endpoint(radio, self.options.ports())?;
        self.bind_endpoint(&target).await
    }

    /// Bind against explicit addresses.
    ///
    /// Emits [`StreamStatus::Bound`] on success and
    /// [`StreamStatus::BindFailed`] when every attempt fails.
    pub async fn bind_endpoint(
        &self,
        target: &StreamEndpoint,
    ) -> Result<mpsc::Receiver<OwnedPacket>> {
        let mut bound = self.bound.lock().await;
        if bound.is_some() {
            return Err(Error::InvalidParameter("stream channel is already bound".into()));
        }

        let (socket, attempts) = match UdpTransport::bind_with_retry(
            target.bind_ip,
            target.first_port,
            target.max_attempts,
        )
        .await
        {
            Ok(bound) => bound,
            Err(e) => {
                let attempts = match &e {
                    Error::BindExhausted { attempts, .. } => *attempts,
                    _ => 1,
                };
                tracing::warn!(
                    port = target.first_port,
                    attempts = attempts,
                    hole_punch = target.hole_punch,
                    error = %e,
                    "Stream bind failed"
                );
                let _ = self.status_tx.send(StreamStatus::BindFailed {
                    port: target.first_port,
                    attempts,
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let socket = Arc::new(socket);
        let local = socket.local_addr();
        let (frame_tx, frame_rx) = mpsc::channel(self.options.frame_capacity.max(1));
        let cancel = CancellationToken::new();

        self.registered.store(false, Ordering::SeqCst);
        *self.handle.lock().await = None;

        let recv_task = tokio::spawn(recv_loop(
            Arc::clone(&socket),
            frame_tx,
            Arc::clone(&self.registered),
            Arc::clone(&self.handle),
            self.status_tx.clone(),
            cancel.clone(),
        ));

        *bound = Some(Bound {
            socket,
            remote: target.remote,
            cancel,
            recv_task,
            register_task: None,
        });

        tracing::info!(local = %local, remote = %target.remote, attempts = attempts, "Stream channel bound");
        let _ = self.status_tx.send(StreamStatus::Bound {
            local,
            remote: target.remote,
        });
        Ok(frame_rx)
    }

    /// Start announcing `handle` to the radio until a frame arrives.
    ///
    /// Runs in a background task; calling it again replaces the previous
    /// loop.
    pub async fn register(&self, handle: u32) -> Result<()> {
        let mut guard = self.bound.lock().await;
        let bound = guard.as_mut().ok_or(Error::NotConnected)?;

        if let Some(task) = bound.register_task.take() {
            task.abort();
        }
        *self.handle.lock().await = Some(handle);

        if self.registered.load(Ordering::SeqCst) {
            let _ = self.status_tx.send(StreamStatus::Registered { handle });
            return Ok(());
        }

        tracing::debug!(handle = format!("0x{handle:08X}"), remote = %bound.remote, "Starting UDP registration");
        bound.register_task = Some(tokio::spawn(register_loop(
            Arc::clone(&bound.socket),
            bound.remote,
            handle,
            self.options.register_interval,
            Arc::clone(&self.registered),
            bound.cancel.child_token(),
        )));
        Ok(())
    }

    /// Send one datagram to the radio. No sequencing, no delivery guarantee.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        let (socket, remote) = {
            let guard = self.bound.lock().await;
            let bound = guard.as_ref().ok_or(Error::NotConnected)?;
            (Arc::clone(&bound.socket), bound.remote)
        };
        socket.send_to(data, remote).await
    }

    /// Close the socket and emit [`StreamStatus::Unbound`]. Does nothing if
    /// the channel is not bound.
    pub async fn unbind(&self) {
        let Some(bound) = self.bound.lock().await.take() else {
            return;
        };

        bound.cancel.cancel();
        let _ = bound.recv_task.await;
        if let Some(task) = bound.register_task {
            let _ = task.await;
        }

        self.registered.store(false, Ordering::SeqCst);
        *self.handle.lock().await = None;

        tracing::debug!(remote = %bound.remote, "Stream channel unbound");
        let _ = self.status_tx.send(StreamStatus::Unbound);
    }

    pub async fn is_bound(&self) -> bool {
        self.bound.lock().await.is_some()
    }

    /// Whether a frame has arrived since the last bind.
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.bound.lock().await.as_ref().map(|b| b.socket.local_addr())
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StreamStatus> {
        self.status_tx.subscribe()
    }
}

impl Drop for StreamChannel {
    fn drop(&mut self) {
        if let Some(bound) = self.bound.get_mut().take() {
            bound.cancel.cancel();
        }
    }
}

async fn recv_loop(
    socket: Arc<UdpTransport>,
    frames: mpsc::Sender<OwnedPacket>,
    registered: Arc<AtomicBool>,
    handle: Arc<Mutex<Option<u32>>>,
    status_tx: broadcast::Sender<StreamStatus>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };

        let (n, src) = match received {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(error = %e, "Stream receive error");
                continue;
            }
        };

        let packet = match vita49::parse_packet(&buf[..n]) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!(src = %src, bytes = n, error = %e, "Dropping undecodable datagram");
                continue;
            }
        };

        if !registered.swap(true, Ordering::SeqCst) {
            if let Some(handle) = *handle.lock().await {
                tracing::debug!(handle = format!("0x{handle:08X}"), "First stream frame received");
                let _ = status_tx.send(StreamStatus::Registered { handle });
            }
        }

        match frames.try_send(packet.to_owned_frame()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::trace!("Frame consumer is behind, dropping frame");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::trace!("Frame consumer gone, dropping frame");
            }
        }
    }
}

async fn register_loop(
    socket: Arc<UdpTransport>,
    remote: SocketAddr,
    handle: u32,
    interval: Duration,
    registered: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let command = codec::cmd_udp_register(handle);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut sent: u64 = 0;

    while !registered.load(Ordering::SeqCst) {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if registered.load(Ordering::SeqCst) {
            break;
        }
        if let Err(e) = socket.send_to(command.as_bytes(), remote).await {
            tracing::debug!(error = %e, "Registration datagram failed");
        }
        sent += 1;
    }

    tracing::debug!(handle = format!("0x{handle:08X}"), sent = sent, "UDP registration done");
}

#[cfg(test)]
mod tests {
    use super::*;
    use flexlink_core::Origin;
    use flexlink_test_harness::vita;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn options(radio_port: u16) -> StreamOptions {
        StreamOptions {
            bind_ip: LOCALHOST,
            local_udp_port: 0,
            radio_udp_port: radio_port,
            ..StreamOptions::default()
        }
    }

    fn local_radio() -> Radio {
        let mut radio = Radio::new("1234-5678", Origin::Local);
        radio.ip = Some(LOCALHOST);
        radio
    }

    async fn next_status(rx: &mut broadcast::Receiver<StreamStatus>) -> StreamStatus {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("status timeout")
            .expect("status channel closed")
    }

    #[tokio::test]
    async fn hole_punch_bind_makes_one_attempt() {
        let busy = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = busy.local_addr().unwrap().port();

        let mut radio = Radio::new("1234-5678", Origin::Relay);
        radio.public_ip = Some(LOCALHOST);
        radio.requires_hole_punch = true;
        radio.negotiated_hole_punch_port = Some(port);
        radio.local_interface_ip = Some(LOCALHOST);

        let channel = StreamChannel::new(StreamOptions::default());
        let mut status = channel.subscribe_status();
        let err = channel.bind(&radio).await.unwrap_err();
        assert!(err.to_string().contains("after 1 attempt"), "{err}");

        match next_status(&mut status).await {
            StreamStatus::BindFailed {
                port: failed_port,
                attempts,
                ..
            } => {
                assert_eq!(failed_port, port);
                assert_eq!(attempts, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!channel.is_bound().await);
    }

    #[tokio::test]
    async fn bind_failure_reports_attempts_made() {
        let _busy = std::net::UdpSocket::bind("127.0.0.1:65535");

        let channel = StreamChannel::new(StreamOptions {
            local_udp_port: 65535,
            max_bind_attempts: 20,
            ..options(DEFAULT_RADIO_UDP_PORT)
        });
        let mut status = channel.subscribe_status();
        assert!(matches!(
            channel.bind(&local_radio()).await,
            Err(Error::BindExhausted { attempts: 1, .. })
        ));

        match next_status(&mut status).await {
            StreamStatus::BindFailed { port, attempts, .. } => {
                assert_eq!(port, 65535);
                assert_eq!(attempts, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn local_bind_walks_past_busy_port() {
        let busy = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = busy.local_addr().unwrap().port();

        let channel = StreamChannel::new(StreamOptions {
            local_udp_port: port,
            ..options(DEFAULT_RADIO_UDP_PORT)
        });
        let mut status = channel.subscribe_status();
        channel.bind(&local_radio()).await.unwrap();

        match next_status(&mut status).await {
            StreamStatus::Bound { local, remote } => {
                assert!(local.port() > port);
                assert_eq!(remote, SocketAddr::new(LOCALHOST, DEFAULT_RADIO_UDP_PORT));
            }
            other => panic!("unexpected {other:?}"),
        }
        channel.unbind().await;
    }

    #[tokio::test]
    async fn register_until_first_frame() {
        let radio_socket = UdpTransport::bind(SocketAddr::new(LOCALHOST, 0)).await.unwrap();
        let channel = StreamChannel::new(options(radio_socket.local_addr().port()));
        let mut status = channel.subscribe_status();

        let mut frames = channel.bind(&local_radio()).await.unwrap();
        assert!(matches!(next_status(&mut status).await, StreamStatus::Bound { .. }));
        let local = channel.local_addr().await.unwrap();

        channel.register(0x4000_0001).await.unwrap();

        let mut buf = [0u8; 256];
        let (n, src) = radio_socket
            .recv_from_timeout(&mut buf, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(&buf[..n], b"client udp_register handle=0x40000001");
        assert_eq!(src.port(), local.port());
        assert!(!channel.is_registered());

        radio_socket
            .send_to(&vita::data_frame(0x8002, 0x42, &[1, 2, 3, 4]), local)
            .await
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.header.stream_id, Some(0x42));
        assert_eq!(&frame.payload[..], &[1, 2, 3, 4]);
        assert!(channel.is_registered());
        assert_eq!(
            next_status(&mut status).await,
            StreamStatus::Registered { handle: 0x4000_0001 }
        );

        // Drain what was in flight, then the loop must have gone quiet.
        tokio::time::sleep(Duration::from_millis(50)).await;
        while radio_socket
            .recv_from_timeout(&mut buf, Duration::from_millis(20))
            .await
            .is_ok()
        {}
        assert!(matches!(
            radio_socket
                .recv_from_timeout(&mut buf, Duration::from_millis(100))
                .await,
            Err(Error::Timeout)
        ));

        channel.unbind().await;
    }

    #[tokio::test]
    async fn undecodable_datagrams_are_dropped() {
        let radio_socket = UdpTransport::bind(SocketAddr::new(LOCALHOST, 0)).await.unwrap();
        let channel = StreamChannel::new(options(radio_socket.local_addr().port()));
        let mut frames = channel.bind(&local_radio()).await.unwrap();
        let local = channel.local_addr().await.unwrap();

        radio_socket.send_to(b"\x00\x01", local).await.unwrap();
        radio_socket
            .send_to(&vita::data_frame(0x03E3, 7, &[9; 8]), local)
            .await
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.header.stream_id, Some(7));
        assert!(frames.try_recv().is_err());

        channel.unbind().await;
    }

    #[tokio::test]
    async fn send_reaches_radio() {
        let radio_socket = UdpTransport::bind(SocketAddr::new(LOCALHOST, 0)).await.unwrap();
        let channel = StreamChannel::new(options(radio_socket.local_addr().port()));
        let _frames = channel.bind(&local_radio()).await.unwrap();

        channel.send(b"payload").await.unwrap();
        let mut buf = [0u8; 64];
        let (n, _) = radio_socket
            .recv_from_timeout(&mut buf, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(&buf[..n], b"payload");

        channel.unbind().await;
    }

    #[tokio::test]
    async fn unbind_closes_and_reports() {
        let channel = StreamChannel::new(options(DEFAULT_RADIO_UDP_PORT));
        let mut status = channel.subscribe_status();
        let mut frames = channel.bind(&local_radio()).await.unwrap();
        assert!(matches!(next_status(&mut status).await, StreamStatus::Bound { .. }));

        channel.unbind().await;
        assert_eq!(next_status(&mut status).await, StreamStatus::Unbound);
        assert!(!channel.is_bound().await);
        assert!(!channel.is_registered());
        assert!(matches!(channel.send(b"x").await, Err(Error::NotConnected)));
        assert!(matches!(channel.register(1).await, Err(Error::NotConnected)));
        // The frame sender is gone with the receive task.
        assert!(frames.recv().await.is_none());

        // A second unbind is silent.
        channel.unbind().await;
        assert!(status.try_recv().is_err());
    }

    #[tokio::test]
    async fn bind_twice_is_rejected() {
        let channel = StreamChannel::new(options(DEFAULT_RADIO_UDP_PORT));
        let _frames = channel.bind(&local_radio()).await.unwrap();
        assert!(matches!(
            channel.bind(&local_radio()).await,
            Err(Error::InvalidParameter(_))
        ));
        channel.unbind().await;
    }

    #[tokio::test]
    async fn hole_punch_without_interface_rejected() {
        let mut radio = Radio::new("1234-5678", Origin::Relay);
        radio.public_ip = Some(LOCALHOST);
        radio.requires_hole_punch = true;
        radio.negotiated_hole_punch_port = Some(30001);

        let channel = StreamChannel::new(StreamOptions::default());
        let mut status = channel.subscribe_status();
        assert!(matches!(
            channel.bind(&radio).await,
            Err(Error::InvalidParameter(_))
        ));
        assert!(status.try_recv().is_err());
    }
}

//! FlexRadio LAN discovery via VITA-49 UDP broadcasts.
//!
//! FlexRadio transceivers announce their presence on the local network by
//! broadcasting VITA-49 packets with class code `0xFFFF` (Discovery) to UDP
//! port 4992, roughly once per second. [`LanListener`] binds that port,
//! turns every discovery broadcast into a [`Radio`] with
//! [`Origin::Local`], and feeds it to the shared [`Registry`]. A periodic
//! sweep evicts radios that have stopped broadcasting.
//!
//! # Usage
//!
//! ```no_run
//! use flexlink::discovery::{LanListener, LanOptions};
//! use flexlink::registry::Registry;
//!
//! # async fn example() -> flexlink_core::Result<()> {
//! let registry = Registry::new();
//! let mut events = registry.subscribe();
//! let listener = LanListener::new(registry.clone(), LanOptions::default());
//! listener.start().await?;
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use flexlink_core::error::{Error, Result};
use flexlink_core::{ChangeEvent, DEFAULT_COMMAND_PORT, Origin, Radio};
use flexlink_transport::UdpTransport;

use crate::registry::Registry;
use crate::tokens::{Properties, unescape_spaces};
use crate::vita49;

/// Default FlexRadio discovery broadcast port.
pub const DISCOVERY_PORT: u16 = 4992;

/// Default interval between staleness sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Default age after which a silent radio is evicted.
pub const DEFAULT_STALE_TIMEOUT: Duration = Duration::from_secs(10);

const RECV_BUFFER_SIZE: usize = 8192;

/// Configuration for [`LanListener`].
#[derive(Debug, Clone)]
pub struct LanOptions {
    /// Address to bind. Defaults to all IPv4 interfaces.
    pub bind_ip: IpAddr,
    /// Broadcast port (default 4992).
    pub port: u16,
    /// How often to look for stale radios (default 1 s).
    pub sweep_interval: Duration,
    /// Evict a radio not heard from for longer than this (default 10 s).
    pub timeout: Duration,
}

impl Default for LanOptions {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DISCOVERY_PORT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            timeout: DEFAULT_STALE_TIMEOUT,
        }
    }
}

/// Lifecycle of a [`LanListener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanState {
    Stopped,
    Binding,
    Listening,
}

/// Parse a single UDP datagram as a FlexRadio discovery packet.
///
/// The datagram must be a VITA-49 packet with class code 0xFFFF. When the
/// payload has no `ip` key, the datagram source address is used.
pub fn parse_discovery_packet(data: &[u8], src_ip: IpAddr) -> Result<Radio> {
    let packet = vita49::parse_packet(data)?;

    if !packet.header.is_discovery() {
        return Err(Error::Protocol("not a discovery packet".into()));
    }

    radio_from_properties(&Properties::from_payload(packet.payload), src_ip)
}

/// Build a local radio descriptor from discovery properties.
///
/// `serial` is required; everything else falls back to a default.
pub fn radio_from_properties(props: &Properties, src_ip: IpAddr) -> Result<Radio> {
    let serial = props
        .get("serial")
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::Protocol("discovery payload has no serial".into()))?;

    let mut radio = Radio::new(serial, Origin::Local);
    radio.model = props.string("model");
    radio.callsign = unescape_spaces(&props.string("callsign"));
    radio.nickname = unescape_spaces(props.first_of(&["nickname", "callsign"]).unwrap_or_default());
    radio.version = props.string("version");
    radio.status = props.string("status");
    radio.inuse_ip = props.string("inuse_ip");
    radio.inuse_host = props.string("inuse_host");
    radio.max_licensed_version = props.string("max_licensed_version");
    radio.radio_license_id = props.string("radio_license_id");
    radio.discovery_protocol_version = props.string("discovery_protocol_version");
    radio.available_clients = props.u32("available_clients");
    radio.licensed_clients = props.u32("licensed_clients");

    // Prefer the IP from the payload, otherwise the datagram source.
    radio.ip = Some(props.ip("ip").unwrap_or(src_ip));
    radio.port = props.u16("port").unwrap_or(DEFAULT_COMMAND_PORT);

    radio.gui_client_handles = props.list("gui_client_handles");
    radio.gui_client_programs = props.list("gui_client_programs");
    radio.gui_client_stations = props
        .list("gui_client_stations")
        .iter()
        .map(|s| unescape_spaces(s))
        .collect();
    radio.gui_client_hosts = props.list("gui_client_hosts");
    radio.gui_client_ips = props.list("gui_client_ips");

    Ok(radio)
}

/// Evict local radios whose last broadcast is older than `timeout` at `now`.
pub async fn sweep_stale(registry: &Registry, now: Instant, timeout: Duration) -> Vec<ChangeEvent> {
    registry
        .evict(|radio| {
            radio.origin == Origin::Local
                && radio
                    .last_seen
                    .is_some_and(|seen| now.saturating_duration_since(seen) > timeout)
        })
        .await
}

/// Listens for discovery broadcasts and keeps the registry's local radios
/// current.
pub struct LanListener {
    registry: Registry,
    options: LanOptions,
    state_tx: watch::Sender<LanState>,
    running: Mutex<Option<Running>>,
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl LanListener {
    pub fn new(registry: Registry, options: LanOptions) -> Self {
        let (state_tx, _) = watch::channel(LanState::Stopped);
        Self {
            registry,
            options,
            state_tx,
            running: Mutex::new(None),
        }
    }

    /// Bind the discovery port and start receiving.
    ///
    /// A bind failure is returned to the caller and leaves the listener
    /// stopped; it is not retried.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(Error::InvalidParameter("LAN listener already running".into()));
        }

        self.state_tx.send_replace(LanState::Binding);
        let addr = SocketAddr::new(self.options.bind_ip, self.options.port);
        let transport = match UdpTransport::bind_shared(addr) {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(addr = %addr, error = %e, "Discovery bind failed");
                self.state_tx.send_replace(LanState::Stopped);
                return Err(e);
            }
        };
        let local_addr = transport.local_addr();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(lan_read_loop(
            transport,
            self.registry.clone(),
            self.options.clone(),
            cancel.clone(),
        ));

        *running = Some(Running {
            cancel,
            task,
            local_addr,
        });
        self.state_tx.send_replace(LanState::Listening);
        tracing::info!(local = %local_addr, "Listening for FlexRadio discovery broadcasts");
        Ok(local_addr)
    }

    /// Stop receiving and close the socket. Safe to call at any time.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        running.cancel.cancel();
        let _ = running.task.await;
        self.state_tx.send_replace(LanState::Stopped);
        tracing::debug!("LAN listener stopped");
    }

    pub fn state(&self) -> LanState {
        *self.state_tx.borrow()
    }

    /// Watch state transitions.
    pub fn state_changes(&self) -> watch::Receiver<LanState> {
        self.state_tx.subscribe()
    }

    /// Address the discovery socket is bound to, while listening.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Drop for LanListener {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}

async fn lan_read_loop(
    transport: UdpTransport,
    registry: Registry,
    options: LanOptions,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    let mut sweep = tokio::time::interval(options.sweep_interval);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sweep.tick() => {
                let evicted = sweep_stale(&registry, Instant::now(), options.timeout).await;
                if !evicted.is_empty() {
                    tracing::debug!(count = evicted.len(), "Evicted stale radios");
                }
            }
            result = transport.recv_from(&mut buf) => match result {
                Ok((n, src)) => match parse_discovery_packet(&buf[..n], src.ip()) {
                    Ok(mut radio) => {
                        tracing::trace!(serial = %radio.serial, src = %src, "Discovery broadcast");
                        radio.last_seen = Some(Instant::now());
                        registry.ingest(radio).await;
                    }
                    Err(e) => {
                        tracing::trace!(src = %src, error = %e, "Ignoring datagram on discovery port");
                    }
                },
                Err(e) => {
                    tracing::warn!(error = %e, "Discovery receive error");
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flexlink_core::ChangeAction;
    use flexlink_test_harness::vita;

    const SRC: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50));

    #[test]
    fn parse_full_payload() {
        let pkt = vita::discovery_frame(
            "discovery_protocol_version=3.0.0.2 model=FLEX-6600 serial=1234-5678 \
             version=3.5.1.0 nickname=My\u{7f}Shack callsign=W1AW ip=192.168.1.100 port=4992 \
             status=Available inuse_ip= inuse_host= max_licensed_version=v3 \
             radio_license_id=00-1C-2D available_clients=2 licensed_clients=2 \
             gui_client_handles=0x40000001,0x40000002 gui_client_programs=SmartSDR-Win,Maestro \
             gui_client_stations=Main\u{7f}Desk,Porch gui_client_hosts=desk,tablet \
             gui_client_ips=192.168.1.2,192.168.1.3",
        );
        let radio = parse_discovery_packet(&pkt, SRC).unwrap();

        assert_eq!(radio.origin, Origin::Local);
        assert_eq!(radio.serial, "1234-5678");
        assert_eq!(radio.model, "FLEX-6600");
        assert_eq!(radio.nickname, "My Shack");
        assert_eq!(radio.callsign, "W1AW");
        assert_eq!(radio.version, "3.5.1.0");
        assert_eq!(radio.discovery_protocol_version, "3.0.0.2");
        assert_eq!(radio.ip, Some("192.168.1.100".parse().unwrap()));
        assert_eq!(radio.port, 4992);
        assert_eq!(radio.available_clients, Some(2));

        let clients = radio.gui_clients();
        assert_eq!(clients.len(), 2);
        assert_eq!(clients[0].handle, 0x4000_0001);
        assert_eq!(clients[0].station, "Main Desk");
        assert_eq!(clients[1].program, "Maestro");
        assert_eq!(clients[1].ip, "192.168.1.3");
    }

    #[test]
    fn source_address_fallback_and_defaults() {
        let pkt = vita::discovery_frame("serial=42 callsign=K1ABC");
        let radio = parse_discovery_packet(&pkt, SRC).unwrap();
        assert_eq!(radio.ip, Some(SRC));
        assert_eq!(radio.port, DEFAULT_COMMAND_PORT);
        assert_eq!(radio.nickname, "K1ABC");
        assert!(radio.gui_clients().is_empty());
    }

    #[test]
    fn payload_without_serial_is_rejected() {
        let pkt = vita::discovery_frame("model=FLEX-6400 nickname=NoSerial");
        assert!(matches!(parse_discovery_packet(&pkt, SRC), Err(Error::Protocol(_))));
    }

    #[test]
    fn data_frame_is_not_discovery() {
        let pkt = vita::data_frame(0x8002, 1, b"serial=1");
        let err = parse_discovery_packet(&pkt, SRC).unwrap_err();
        assert!(err.to_string().contains("not a discovery packet"));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_discovery_packet(&[0x18, 0x00], SRC).is_err());
    }

    #[tokio::test]
    async fn shack_scenario_added_then_updated() {
        let registry = Registry::new();

        let first = vita::discovery_frame("nickname=Shack1 serial=1234-5678 status=Available");
        let events = registry
            .ingest(parse_discovery_packet(&first, SRC).unwrap())
            .await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            ChangeEvent::Radio { action, radio } => {
                assert_eq!(*action, ChangeAction::Added);
                assert_eq!(radio.nickname, "Shack1");
            }
            other => panic!("unexpected {other:?}"),
        }

        let second = vita::discovery_frame("nickname=Shack1 serial=1234-5678 status=InUse");
        let events = registry
            .ingest(parse_discovery_packet(&second, SRC).unwrap())
            .await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            ChangeEvent::Radio { action, radio } => {
                assert_eq!(*action, ChangeAction::Updated);
                assert_eq!(radio.status, "InUse");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stale_radio_evicted_exactly_once() {
        let registry = Registry::new();
        let mut radio = Radio::new("1234-5678", Origin::Local);
        radio.last_seen = Some(Instant::now());
        registry.ingest(radio).await;

        // A relay radio never has last_seen and is never swept.
        registry.ingest(Radio::new("9999", Origin::Relay)).await;

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(sweep_stale(&registry, Instant::now(), DEFAULT_STALE_TIMEOUT).await.is_empty());

        tokio::time::advance(Duration::from_secs(6)).await;
        let events = sweep_stale(&registry, Instant::now(), DEFAULT_STALE_TIMEOUT).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action(), ChangeAction::Deleted);

        assert!(sweep_stale(&registry, Instant::now(), DEFAULT_STALE_TIMEOUT).await.is_empty());
        assert_eq!(registry.snapshot().await.len(), 1);
    }

    fn test_options() -> LanOptions {
        LanOptions {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            sweep_interval: Duration::from_millis(50),
            timeout: Duration::from_millis(300),
        }
    }

    #[tokio::test]
    async fn listener_ingests_and_evicts() {
        let registry = Registry::new();
        let mut events = registry.subscribe();
        let listener = LanListener::new(registry.clone(), test_options());
        assert_eq!(listener.state(), LanState::Stopped);

        let addr = listener.start().await.unwrap();
        assert_eq!(listener.state(), LanState::Listening);

        let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        // Noise on the port is ignored.
        sender.send_to(b"not vita", addr).await.unwrap();
        sender
            .send_to(&vita::discovery_frame("serial=1234-5678 nickname=Shack1"), addr)
            .await
            .unwrap();

        let added = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(added.action(), ChangeAction::Added);
        match added {
            ChangeEvent::Radio { radio, .. } => {
                assert_eq!(radio.ip, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
                assert!(radio.last_seen.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }

        let deleted = tokio::time::timeout(Duration::from_secs(3), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(deleted.action(), ChangeAction::Deleted);

        listener.stop().await;
        assert_eq!(listener.state(), LanState::Stopped);
        assert!(listener.local_addr().await.is_none());
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let listener = LanListener::new(Registry::new(), test_options());
        listener.start().await.unwrap();
        assert!(matches!(listener.start().await, Err(Error::InvalidParameter(_))));
        listener.stop().await;
        // Stopping again is harmless.
        listener.stop().await;
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let options = LanOptions {
            bind_ip: "203.0.113.1".parse().unwrap(),
            ..test_options()
        };
        let listener = LanListener::new(Registry::new(), options);
        assert!(listener.start().await.is_err());
        assert_eq!(listener.state(), LanState::Stopped);
    }
}

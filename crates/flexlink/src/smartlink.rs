//! SmartLink relay listener.
//!
//! [`SmartlinkListener`] keeps a TLS control session open to the SmartLink
//! relay. After authenticating it sends `application register`, pings the
//! relay every ten seconds and turns the lines it receives into registry
//! updates (radio listings, disconnect notices) or [`RelayEvent`]s
//! (public address, user settings, connect and test results).
//!
//! Outbound control operations (`send_connect`, `send_disconnect`,
//! `send_disconnect_client`, `send_test`) only queue a line. Their outcome,
//! if any, arrives later as an inbound line.
//!
//! When the session ends for any reason every relay radio is evicted from
//! the registry and a `Disconnected` [`ChannelStatus`] is emitted.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use flexlink::auth::StaticToken;
//! use flexlink::registry::Registry;
//! use flexlink::smartlink::{SmartlinkListener, SmartlinkOptions};
//!
//! # async fn example() -> flexlink_core::Result<()> {
//! let registry = Registry::new();
//! let listener = SmartlinkListener::new(
//!     registry.clone(),
//!     Arc::new(StaticToken::new("eyJhbGciOi...")),
//!     SmartlinkOptions::default(),
//! );
//! listener.start("").await?;
//! for radio in registry.snapshot().await {
//!     println!("{} {}", radio.serial, radio.nickname);
//! }
//! # Ok(())
//! # }
//! ```

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use flexlink_core::error::{Error, Result};
use flexlink_core::{ChannelState, ChannelStatus, Origin, Radio, RadioKey};
use flexlink_transport::{ConnectOptions, DEFAULT_CONNECT_TIMEOUT, NetStream, TrustPolicy};

use crate::auth::Authenticator;
use crate::registry::Registry;
use crate::tokens::{Properties, unescape_spaces};

/// Default relay host.
pub const DEFAULT_RELAY_HOST: &str = "smartlink.flexradio.com";

/// Default relay TLS port.
pub const DEFAULT_RELAY_PORT: u16 = 443;

/// Default keep-alive period.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);

const PING_LINE: &str = "ping from client";
const EVENT_CHANNEL_CAPACITY: usize = 256;
const OUTBOUND_CAPACITY: usize = 64;

/// Options for a [`SmartlinkListener`].
#[derive(Debug, Clone)]
pub struct SmartlinkOptions {
    pub host: String,
    pub port: u16,
    /// Application name sent in `application register`.
    pub app_name: String,
    /// Platform string sent in `application register`.
    pub platform: String,
    pub ping_interval: Duration,
    pub connect_timeout: Duration,
    /// Certificate policy for the relay connection.
    pub trust: TrustPolicy,
}

impl Default for SmartlinkOptions {
    fn default() -> Self {
        Self {
            host: DEFAULT_RELAY_HOST.to_string(),
            port: DEFAULT_RELAY_PORT,
            app_name: env!("CARGO_PKG_NAME").to_string(),
            platform: std::env::consts::OS.to_string(),
            ping_interval: DEFAULT_PING_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            trust: TrustPolicy::default(),
        }
    }
}

/// Relay session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Disconnected,
    TcpConnecting,
    TlsHandshaking,
    /// TLS is up, registration not yet written.
    Secured,
    /// Registered and sending keep-alives.
    Pinging,
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RelayState::Disconnected => "disconnected",
            RelayState::TcpConnecting => "tcp-connecting",
            RelayState::TlsHandshaking => "tls-handshaking",
            RelayState::Secured => "secured",
            RelayState::Pinging => "pinging",
        };
        write!(f, "{s}")
    }
}

/// Outcome of `application test_connection`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestResults {
    pub serial: String,
    pub upnp_tcp_port_working: bool,
    pub upnp_udp_port_working: bool,
    pub forward_tcp_port_working: bool,
    pub forward_udp_port_working: bool,
    pub nat_supports_hole_punch: bool,
}

/// Relay notifications that are not registry changes.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// Our public address as seen by the relay.
    PublicIp(IpAddr),
    UserSettings {
        callsign: String,
        first_name: String,
        last_name: String,
    },
    /// The relay rejected the token. The session is closed afterwards.
    RegistrationInvalid,
    /// The radio accepted a connect request. `handle` is later sent to the
    /// radio as `wan validate handle=<handle>`.
    ConnectReady { serial: String, handle: String },
    TestResult(TestResults),
}

/// One inbound relay line, classified.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    PublicIp(IpAddr),
    UserSettings {
        callsign: String,
        first_name: String,
        last_name: String,
    },
    RegistrationInvalid,
    /// A listing of radios available to this account.
    RadioList(Vec<Radio>),
    ConnectReady {
        serial: String,
        handle: String,
    },
    TestResult(TestResults),
    /// The relay lost a radio.
    RadioDisconnected {
        serial: String,
    },
    Unknown(String),
}

/// Classify one relay line by its first two words.
pub fn parse_relay_line(line: &str) -> RelayMessage {
    let line = line.trim();
    let mut parts = line.splitn(3, char::is_whitespace);
    let family = parts.next().unwrap_or_default().to_ascii_lowercase();
    let kind = parts.next().unwrap_or_default().to_ascii_lowercase();
    let rest = parts.next().unwrap_or_default();

    match (family.as_str(), kind.as_str()) {
        ("application", "info") => match Properties::parse(rest).ip("public_ip") {
            Some(ip) => RelayMessage::PublicIp(ip),
            None => RelayMessage::Unknown(line.to_string()),
        },
        ("application", "user_settings") => {
            let props = Properties::parse(rest);
            RelayMessage::UserSettings {
                callsign: unescape_spaces(&props.string("callsign")),
                first_name: unescape_spaces(&props.string("first_name")),
                last_name: unescape_spaces(&props.string("last_name")),
            }
        }
        ("application", "registration_invalid") => RelayMessage::RegistrationInvalid,
        ("radio", "list") => RelayMessage::RadioList(
            rest.split('|')
                .filter(|entry| !entry.trim().is_empty())
                .filter_map(|entry| relay_radio_from_properties(&Properties::parse(entry)))
                .collect(),
        ),
        ("radio", "connect_ready") => {
            let props = Properties::parse(rest);
            match (props.get("serial"), props.get("handle")) {
                (Some(serial), Some(handle)) => RelayMessage::ConnectReady {
                    serial: serial.to_string(),
                    handle: handle.to_string(),
                },
                _ => RelayMessage::Unknown(line.to_string()),
            }
        }
        ("radio", "test_connection") => {
            let props = Properties::parse(rest);
            RelayMessage::TestResult(TestResults {
                serial: props.string("serial"),
                upnp_tcp_port_working: props.bool("upnp_tcp_port_working"),
                upnp_udp_port_working: props.bool("upnp_udp_port_working"),
                forward_tcp_port_working: props.bool("forward_tcp_port_working"),
                forward_udp_port_working: props.bool("forward_udp_port_working"),
                nat_supports_hole_punch: props.bool("nat_supports_hole_punch"),
            })
        }
        ("radio", "disconnected") => match Properties::parse(rest).get("serial") {
            Some(serial) if !serial.is_empty() => RelayMessage::RadioDisconnected {
                serial: serial.to_string(),
            },
            _ => RelayMessage::Unknown(line.to_string()),
        },
        _ => RelayMessage::Unknown(line.to_string()),
    }
}

/// Build a relay radio from one `radio list` entry. Entries without a
/// serial are skipped.
///
/// Ports resolve to the UPnP pair when both are present, else the manually
/// forwarded pair, else the radio needs a hole punch.
pub fn relay_radio_from_properties(props: &Properties) -> Option<Radio> {
    let serial = props.get("serial").filter(|s| !s.is_empty())?;

    let mut radio = Radio::new(serial, Origin::Relay);
    radio.model = props.string("model");
    radio.callsign = unescape_spaces(&props.string("callsign"));
    radio.nickname = unescape_spaces(props.first_of(&["nickname", "radio_name"]).unwrap_or_default());
    radio.version = props.string("version");
    radio.status = props.string("status");
    radio.inuse_ip = props.string("inuse_ip");
    radio.inuse_host = props.string("inuse_host");
    radio.max_licensed_version = props.string("max_licensed_version");
    radio.radio_license_id = props.string("radio_license_id");
    radio.public_ip = props.ip("public_ip");
    radio.upnp_supported = props.bool("upnp_supported");

    let upnp = (props.port("public_upnp_tls_port"), props.port("public_upnp_udp_port"));
    let forwarded = (props.port("public_tls_port"), props.port("public_udp_port"));
    match (upnp, forwarded) {
        ((Some(tls), Some(udp)), _) | (_, (Some(tls), Some(udp))) => {
            radio.public_tls_port = Some(tls);
            radio.public_udp_port = Some(udp);
        }
        _ => radio.requires_hole_punch = true,
    }

    radio.gui_client_handles = props.list("gui_client_handles");
    radio.gui_client_programs = props.list("gui_client_programs");
    radio.gui_client_stations = props
        .list("gui_client_stations")
        .iter()
        .map(|s| unescape_spaces(s))
        .collect();
    radio.gui_client_hosts = props.list("gui_client_hosts");
    radio.gui_client_ips = props.list("gui_client_ips");

    Some(radio)
}

pub fn cmd_register(app_name: &str, platform: &str, token: &str) -> String {
    format!("application register name={app_name} platform={platform} token={token}")
}

pub fn cmd_connect(serial: &str, hole_punch_port: u16) -> String {
    format!("application connect serial={serial} hole_punch_port={hole_punch_port}")
}

pub fn cmd_disconnect(serial: &str) -> String {
    format!("application disconnect_users serial={serial}")
}

pub fn cmd_disconnect_client(serial: &str, handle: u32) -> String {
    format!("application disconnect_users serial={serial} handle=0x{handle:08X}")
}

pub fn cmd_test_connection(serial: &str) -> String {
    format!("application test_connection serial={serial}")
}

fn check_token(name: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.contains(char::is_whitespace) {
        return Err(Error::InvalidParameter(format!(
            "{name} must be a single non-empty word: {value:?}"
        )));
    }
    Ok(())
}

struct Session {
    id: u64,
    cancel: CancellationToken,
    outbound: Option<mpsc::Sender<String>>,
    task: Option<JoinHandle<()>>,
}

#[derive(Clone)]
struct Shared {
    registry: Registry,
    session: Arc<Mutex<Option<Session>>>,
    hole_punch_ports: Arc<Mutex<HashMap<String, u16>>>,
    public_ip: Arc<Mutex<Option<IpAddr>>>,
    state_tx: Arc<watch::Sender<RelayState>>,
    event_tx: broadcast::Sender<RelayEvent>,
    status_tx: broadcast::Sender<ChannelStatus>,
}

/// Control session with the SmartLink relay.
pub struct SmartlinkListener {
    options: SmartlinkOptions,
    authenticator: Arc<dyn Authenticator>,
    shared: Shared,
    next_session: AtomicU64,
}

impl SmartlinkListener {
    pub fn new(
        registry: Registry,
        authenticator: Arc<dyn Authenticator>,
        options: SmartlinkOptions,
    ) -> Self {
        let (state_tx, _) = watch::channel(RelayState::Disconnected);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (status_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            options,
            authenticator,
            shared: Shared {
                registry,
                session: Arc::new(Mutex::new(None)),
                hole_punch_ports: Arc::new(Mutex::new(HashMap::new())),
                public_ip: Arc::new(Mutex::new(None)),
                state_tx: Arc::new(state_tx),
                event_tx,
                status_tx,
            },
            next_session: AtomicU64::new(1),
        }
    }

    /// Authenticate, connect, upgrade to TLS and register with the relay.
    ///
    /// Returns once the registration line is queued. An
    /// [`Error::Authentication`] means no connection was attempted, as does
    /// [`Error::InvalidParameter`] when the application name, platform or
    /// token would not fit in one `key=value` word. Any later failure is
    /// also reported as a `Disconnected` status.
    pub async fn start(&self, credential: &str) -> Result<()> {
        check_token("application name", &self.options.app_name)?;
        check_token("platform", &self.options.platform)?;

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        {
            let mut session = self.shared.session.lock().await;
            if session.is_some() {
                return Err(Error::InvalidParameter(
                    "SmartLink listener is already running".into(),
                ));
            }
            *session = Some(Session {
                id,
                cancel: cancel.clone(),
                outbound: None,
                task: None,
            });
        }

        let opened = tokio::select! {
            result = self.open(credential) => result,
            _ = cancel.cancelled() => return Err(Error::NotConnected),
        };

        let (stream, local_ip, token) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                let mut session = self.shared.session.lock().await;
                if !cancel.is_cancelled() {
                    *session = None;
                    drop(session);
                    self.shared.state_tx.send_replace(RelayState::Disconnected);
                    if !matches!(e, Error::Authentication(_) | Error::InvalidParameter(_)) {
                        self.shared.emit(ChannelStatus::disconnected(
                            &self.options.host,
                            self.options.port,
                            Some(e.to_string()),
                        ));
                    }
                }
                return Err(e);
            }
        };

        let mut session = self.shared.session.lock().await;
        let Some(current) = session.as_mut().filter(|s| s.id == id && !cancel.is_cancelled())
        else {
            return Err(Error::NotConnected);
        };

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let register = cmd_register(&self.options.app_name, &self.options.platform, &token);

        let (read_half, write_half) = tokio::io::split(stream);
        let context = SessionContext {
            id,
            local_ip,
            host: self.options.host.clone(),
            port: self.options.port,
            ping_interval: self.options.ping_interval,
        };
        current.outbound = Some(outbound_tx);
        current.task = Some(tokio::spawn(run_session(
            BufReader::new(read_half),
            write_half,
            register,
            outbound_rx,
            self.shared.clone(),
            context,
            cancel,
        )));

        tracing::info!(
            host = %self.options.host,
            port = self.options.port,
            local = %local_ip,
            "Registering with SmartLink relay"
        );
        Ok(())
    }

    async fn open(&self, credential: &str) -> Result<(NetStream, IpAddr, String)> {
        let token = self.authenticator.authenticate(credential).await?;
        check_token("token", &token)?;
        let host = &self.options.host;
        let port = self.options.port;

        self.shared.state_tx.send_replace(RelayState::TcpConnecting);
        self.shared
            .emit(ChannelStatus::new(ChannelState::Connecting, host, port));
        let connect = ConnectOptions {
            timeout: self.options.connect_timeout,
            local_addr: None,
        };
        let stream = NetStream::connect(host, port, &connect).await?;
        let local_ip = stream.local_addr()?.ip();
        self.shared
            .emit(ChannelStatus::new(ChannelState::Connected, host, port));

        self.shared.state_tx.send_replace(RelayState::TlsHandshaking);
        let stream = stream.into_tls(host, &self.options.trust).await?;
        self.shared.state_tx.send_replace(RelayState::Secured);
        self.shared
            .emit(ChannelStatus::new(ChannelState::Secured, host, port));

        Ok((stream, local_ip, token))
    }

    /// Close the relay session. Safe to call at any time, including while
    /// `start` is in flight.
    pub async fn stop(&self) {
        let Some(session) = self.shared.session.lock().await.take() else {
            return;
        };
        session.cancel.cancel();
        drop(session.outbound);

        match session.task {
            // The session task evicts relay radios and reports the close.
            Some(task) => {
                let _ = task.await;
            }
            None => {
                self.shared.state_tx.send_replace(RelayState::Disconnected);
                self.shared.emit(ChannelStatus::disconnected(
                    &self.options.host,
                    self.options.port,
                    None,
                ));
            }
        }
        tracing::debug!("SmartLink listener stopped");
    }

    /// Ask the relay to broker a connection to `serial`.
    ///
    /// A non-zero `hole_punch_port` is remembered and applied to the
    /// radio's descriptor, now and on every later listing in this session.
    pub async fn send_connect(&self, serial: &str, hole_punch_port: u16) -> Result<()> {
        check_token("serial", serial)?;
        let outbound = self.outbound().await?;

        if hole_punch_port != 0 {
            self.shared
                .hole_punch_ports
                .lock()
                .await
                .insert(serial.to_string(), hole_punch_port);
            let key = RadioKey {
                serial: serial.to_string(),
                origin: Origin::Relay,
            };
            if let Some(mut radio) = self.shared.registry.get(&key).await {
                radio.negotiated_hole_punch_port = Some(hole_punch_port);
                self.shared.registry.ingest(radio).await;
            }
        }

        send_line(&outbound, cmd_connect(serial, hole_punch_port)).await
    }

    /// Disconnect every client session on `serial`.
    pub async fn send_disconnect(&self, serial: &str) -> Result<()> {
        check_token("serial", serial)?;
        send_line(&self.outbound().await?, cmd_disconnect(serial)).await
    }

    /// Disconnect one client session on `serial`.
    pub async fn send_disconnect_client(&self, serial: &str, handle: u32) -> Result<()> {
        check_token("serial", serial)?;
        send_line(&self.outbound().await?, cmd_disconnect_client(serial, handle)).await
    }

    /// Ask the relay to test reachability of `serial`. The result arrives
    /// as [`RelayEvent::TestResult`].
    pub async fn send_test(&self, serial: &str) -> Result<()> {
        check_token("serial", serial)?;
        send_line(&self.outbound().await?, cmd_test_connection(serial)).await
    }

    async fn outbound(&self) -> Result<mpsc::Sender<String>> {
        self.shared
            .session
            .lock()
            .await
            .as_ref()
            .and_then(|s| s.outbound.clone())
            .ok_or(Error::NotConnected)
    }

    pub fn state(&self) -> RelayState {
        *self.shared.state_tx.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<RelayState> {
        self.shared.state_tx.subscribe()
    }

    /// Our public address, once the relay has reported it.
    pub async fn public_ip(&self) -> Option<IpAddr> {
        *self.shared.public_ip.lock().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.shared.event_tx.subscribe()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<ChannelStatus> {
        self.shared.status_tx.subscribe()
    }

    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }
}

impl Drop for SmartlinkListener {
    fn drop(&mut self) {
        if let Ok(mut session) = self.shared.session.try_lock() {
            if let Some(session) = session.take() {
                session.cancel.cancel();
            }
        }
    }
}

impl Shared {
    fn emit(&self, status: ChannelStatus) {
        tracing::debug!(
            state = %status.state,
            host = %status.host,
            port = status.port,
            error = ?status.error,
            "Relay channel status"
        );
        let _ = self.status_tx.send(status);
    }

    fn publish(&self, event: RelayEvent) {
        let _ = self.event_tx.send(event);
    }

    async fn finish(&self, context: &SessionContext, error: Option<String>) {
        {
            let mut session = self.session.lock().await;
            if session.as_ref().is_some_and(|s| s.id == context.id) {
                *session = None;
            }
        }
        self.hole_punch_ports.lock().await.clear();
        *self.public_ip.lock().await = None;

        let evicted = self
            .registry
            .evict(|radio| radio.origin == Origin::Relay)
            .await;
        tracing::info!(
            host = %context.host,
            evicted = evicted.len(),
            error = ?error,
            "SmartLink session closed"
        );

        self.state_tx.send_replace(RelayState::Disconnected);
        self.emit(ChannelStatus::disconnected(
            context.host.clone(),
            context.port,
            error,
        ));
    }
}

async fn send_line(outbound: &mpsc::Sender<String>, line: String) -> Result<()> {
    outbound.send(line).await.map_err(|_| Error::NotConnected)
}

struct SessionContext {
    id: u64,
    local_ip: IpAddr,
    host: String,
    port: u16,
    ping_interval: Duration,
}

/// Runs one relay session: a writer task for queued lines and keep-alives,
/// and the read loop on this task. Whichever side stops first ends both.
async fn run_session(
    reader: BufReader<ReadHalf<NetStream>>,
    writer: WriteHalf<NetStream>,
    register: String,
    outbound: mpsc::Receiver<String>,
    shared: Shared,
    context: SessionContext,
    cancel: CancellationToken,
) {
    let write_task = tokio::spawn(write_loop(
        writer,
        register,
        outbound,
        context.ping_interval,
        Arc::clone(&shared.state_tx),
        cancel.clone(),
    ));

    let read_error = read_loop(reader, &shared, context.local_ip, &cancel).await;
    cancel.cancel();
    let write_error = write_task.await.ok().flatten();

    shared.finish(&context, read_error.or(write_error)).await;
}

/// Writes the registration line, then queued lines and keep-alives until
/// cancelled or a write fails.
async fn write_loop(
    mut writer: WriteHalf<NetStream>,
    register: String,
    mut outbound: mpsc::Receiver<String>,
    ping_interval: Duration,
    state_tx: Arc<watch::Sender<RelayState>>,
    cancel: CancellationToken,
) -> Option<String> {
    let mut ping =
        tokio::time::interval_at(tokio::time::Instant::now() + ping_interval, ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let error = match write_line(&mut writer, &register).await {
        Err(e) => Some(e),
        Ok(()) => {
            state_tx.send_replace(RelayState::Pinging);
            loop {
                let line = tokio::select! {
                    _ = cancel.cancelled() => break None,
                    _ = ping.tick() => PING_LINE.to_string(),
                    line = outbound.recv() => match line {
                        Some(line) => line,
                        None => break None,
                    },
                };
                if let Err(e) = write_line(&mut writer, &line).await {
                    break Some(e);
                }
            }
        }
    };

    if error.is_some() {
        cancel.cancel();
    }
    let _ = writer.shutdown().await;
    error
}

async fn write_line(
    writer: &mut WriteHalf<NetStream>,
    line: &str,
) -> std::result::Result<(), String> {
    tracing::trace!(line = %redact(line), "Sending relay line");
    let written = async {
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await
    }
    .await;
    written.map_err(|e| {
        tracing::debug!(error = %e, "Relay write failed");
        format!("failed to write to relay: {e}")
    })
}

async fn read_loop(
    mut reader: BufReader<ReadHalf<NetStream>>,
    shared: &Shared,
    local_ip: IpAddr,
    cancel: &CancellationToken,
) -> Option<String> {
    let mut line_buf = Vec::new();

    loop {
        line_buf.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => return None,
            read = reader.read_until(b'\n', &mut line_buf) => read,
        };

        match read {
            Ok(0) => {
                tracing::debug!("Relay closed the connection");
                return None;
            }
            Ok(_) => {
                let text = String::from_utf8_lossy(&line_buf);
                if matches!(text, Cow::Owned(_)) {
                    tracing::debug!("Relay line is not valid UTF-8");
                }
                let line = text.trim_end_matches(['\r', '\n']);
                if line.is_empty() {
                    continue;
                }
                if let Some(error) = handle_line(line, shared, local_ip).await {
                    return Some(error);
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Relay read error");
                return Some(e.to_string());
            }
        }
    }
}

/// Apply one inbound line. Returns an error when the line ends the session.
async fn handle_line(line: &str, shared: &Shared, local_ip: IpAddr) -> Option<String> {
    tracing::trace!(line = %line, "Relay line");

    match parse_relay_line(line) {
        RelayMessage::PublicIp(ip) => {
            tracing::debug!(public_ip = %ip, "Relay reported public address");
            *shared.public_ip.lock().await = Some(ip);
            shared.publish(RelayEvent::PublicIp(ip));
        }
        RelayMessage::UserSettings {
            callsign,
            first_name,
            last_name,
        } => shared.publish(RelayEvent::UserSettings {
            callsign,
            first_name,
            last_name,
        }),
        RelayMessage::RegistrationInvalid => {
            tracing::warn!("Relay rejected the registration");
            shared.publish(RelayEvent::RegistrationInvalid);
            return Some("relay rejected the registration".to_string());
        }
        RelayMessage::RadioList(radios) => {
            tracing::debug!(count = radios.len(), "Relay radio list");
            let ports = shared.hole_punch_ports.lock().await.clone();
            for mut radio in radios {
                radio.local_interface_ip = Some(local_ip);
                radio.negotiated_hole_punch_port = ports.get(&radio.serial).copied();
                shared.registry.ingest(radio).await;
            }
        }
        RelayMessage::ConnectReady { serial, handle } => {
            tracing::debug!(serial = %serial, handle = %handle, "Radio ready for connection");
            shared.publish(RelayEvent::ConnectReady { serial, handle });
        }
        RelayMessage::TestResult(results) => shared.publish(RelayEvent::TestResult(results)),
        RelayMessage::RadioDisconnected { serial } => {
            tracing::debug!(serial = %serial, "Relay lost radio");
            shared.hole_punch_ports.lock().await.remove(&serial);
            shared
                .registry
                .evict(|radio| radio.origin == Origin::Relay && radio.serial == serial)
                .await;
        }
        RelayMessage::Unknown(line) => {
            tracing::debug!(line = %line, "Unhandled relay line, dropping");
        }
    }
    None
}

/// Hide the token in trace output.
fn redact(line: &str) -> Cow<'_, str> {
    match line.find("token=") {
        Some(pos) => format!("{}token=<redacted>", &line[..pos]).into(),
        None => line.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticToken;
    use flexlink_core::{ChangeAction, ChangeEvent};
    use flexlink_test_harness::{MockRelay, RelayConnection};

    const LIST_ENTRY: &str = "serial=1234-5678 model=FLEX-6600 radio_name=Remote\u{7f}Shack \
        callsign=W1AW version=3.5.1.0 status=Available public_ip=203.0.113.7 \
        public_tls_port=4994 public_udp_port=4993 public_upnp_tls_port=-1 \
        public_upnp_udp_port=-1 upnp_supported=0 gui_client_handles=0x40000001 \
        gui_client_programs=SmartSDR-Win gui_client_stations=Main\u{7f}Desk \
        gui_client_hosts=desk gui_client_ips=192.168.1.2";

    fn options(relay: &MockRelay) -> SmartlinkOptions {
        SmartlinkOptions {
            host: "127.0.0.1".to_string(),
            port: relay.port(),
            app_name: "flexlink-test".to_string(),
            platform: "linux".to_string(),
            ..SmartlinkOptions::default()
        }
    }

    fn listener(relay: &MockRelay, registry: &Registry) -> SmartlinkListener {
        SmartlinkListener::new(
            registry.clone(),
            Arc::new(StaticToken::new("tok")),
            options(relay),
        )
    }

    async fn started(relay: &MockRelay, listener: &SmartlinkListener) -> RelayConnection {
        let (started, conn) = tokio::join!(listener.start(""), relay.accept());
        started.unwrap();
        let mut conn = conn.unwrap();
        assert_eq!(
            conn.recv_line().await.unwrap(),
            "application register name=flexlink-test platform=linux token=tok"
        );
        conn
    }

    async fn next<T: Clone>(rx: &mut broadcast::Receiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event timeout")
            .expect("channel closed")
    }

    #[test]
    fn parse_public_ip_and_settings() {
        assert_eq!(
            parse_relay_line("application info public_ip=203.0.113.7"),
            RelayMessage::PublicIp("203.0.113.7".parse().unwrap())
        );
        assert_eq!(
            parse_relay_line("application user_settings callsign=W1AW first_name=Hiram last_name=Percy\u{7f}Maxim"),
            RelayMessage::UserSettings {
                callsign: "W1AW".into(),
                first_name: "Hiram".into(),
                last_name: "Percy Maxim".into(),
            }
        );
        assert_eq!(
            parse_relay_line("application registration_invalid"),
            RelayMessage::RegistrationInvalid
        );
    }

    #[test]
    fn parse_radio_list_port_resolution() {
        let line = format!(
            "radio list {LIST_ENTRY}|serial=A model=FLEX-6400 public_ip=198.51.100.2 \
             public_upnp_tls_port=21000 public_upnp_udp_port=22000 public_tls_port=4994 \
             public_udp_port=4993|serial=B public_ip=198.51.100.3 public_tls_port=-1 \
             public_udp_port=-1|model=no-serial"
        );
        let RelayMessage::RadioList(radios) = parse_relay_line(&line) else {
            panic!("not a list");
        };
        assert_eq!(radios.len(), 3);

        let forwarded = &radios[0];
        assert_eq!(forwarded.origin, Origin::Relay);
        assert_eq!(forwarded.nickname, "Remote Shack");
        assert_eq!(forwarded.public_tls_port, Some(4994));
        assert_eq!(forwarded.public_udp_port, Some(4993));
        assert!(!forwarded.requires_hole_punch);
        assert_eq!(forwarded.gui_clients()[0].station, "Main Desk");

        let upnp = &radios[1];
        assert_eq!(upnp.public_tls_port, Some(21000));
        assert_eq!(upnp.public_udp_port, Some(22000));

        let punched = &radios[2];
        assert!(punched.requires_hole_punch);
        assert_eq!(punched.public_tls_port, None);
        assert_eq!(punched.public_udp_port, None);
    }

    #[test]
    fn parse_radio_notices() {
        assert_eq!(
            parse_relay_line("radio connect_ready handle=0x1F2E3D4C serial=1234-5678"),
            RelayMessage::ConnectReady {
                serial: "1234-5678".into(),
                handle: "0x1F2E3D4C".into(),
            }
        );
        assert_eq!(
            parse_relay_line("radio disconnected serial=1234-5678"),
            RelayMessage::RadioDisconnected {
                serial: "1234-5678".into()
            }
        );

        let RelayMessage::TestResult(results) = parse_relay_line(
            "radio test_connection serial=1234-5678 upnp_tcp_port_working=false \
             upnp_udp_port_working=false forward_tcp_port_working=true \
             forward_udp_port_working=true nat_supports_hole_punch=1",
        ) else {
            panic!("not a test result");
        };
        assert_eq!(results.serial, "1234-5678");
        assert!(!results.upnp_tcp_port_working);
        assert!(results.forward_tcp_port_working);
        assert!(results.forward_udp_port_working);
        assert!(results.nat_supports_hole_punch);
    }

    #[test]
    fn parse_unknown_lines() {
        assert!(matches!(parse_relay_line("radio connect_ready serial=1"), RelayMessage::Unknown(_)));
        assert!(matches!(parse_relay_line("application info"), RelayMessage::Unknown(_)));
        assert!(matches!(parse_relay_line("something else"), RelayMessage::Unknown(_)));
        assert!(matches!(parse_relay_line(""), RelayMessage::Unknown(_)));
    }

    #[test]
    fn outbound_lines() {
        assert_eq!(
            cmd_connect("1234-5678", 30001),
            "application connect serial=1234-5678 hole_punch_port=30001"
        );
        assert_eq!(
            cmd_disconnect_client("1234-5678", 0x4000_0001),
            "application disconnect_users serial=1234-5678 handle=0x40000001"
        );
        assert_eq!(redact("application register name=a token=secret"), "application register name=a token=<redacted>");
    }

    #[tokio::test]
    async fn start_registers_and_reports_state() {
        let relay = MockRelay::new().await.unwrap();
        let registry = Registry::new();
        let listener = listener(&relay, &registry);
        let mut status = listener.subscribe_status();

        let _conn = started(&relay, &listener).await;

        let states: Vec<ChannelState> = vec![
            next(&mut status).await.state,
            next(&mut status).await.state,
            next(&mut status).await.state,
        ];
        assert_eq!(
            states,
            vec![ChannelState::Connecting, ChannelState::Connected, ChannelState::Secured]
        );

        let mut state = listener.state_changes();
        tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| *s == RelayState::Pinging))
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(listener.start("").await, Err(Error::InvalidParameter(_))));
        listener.stop().await;
    }

    #[tokio::test]
    async fn auth_failure_opens_nothing() {
        let relay = MockRelay::new().await.unwrap();
        let listener = SmartlinkListener::new(
            Registry::new(),
            Arc::new(StaticToken::new("")),
            options(&relay),
        );
        let mut status = listener.subscribe_status();

        assert!(matches!(listener.start("").await, Err(Error::Authentication(_))));
        assert_eq!(listener.state(), RelayState::Disconnected);
        assert!(status.try_recv().is_err());
        assert!(matches!(listener.send_test("1234-5678").await, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn refused_connect_reports_error() {
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let listener = SmartlinkListener::new(
            Registry::new(),
            Arc::new(StaticToken::new("tok")),
            SmartlinkOptions {
                host: "127.0.0.1".into(),
                port,
                ..SmartlinkOptions::default()
            },
        );
        let mut status = listener.subscribe_status();

        assert!(listener.start("").await.is_err());
        assert_eq!(next(&mut status).await.state, ChannelState::Connecting);
        let closed = next(&mut status).await;
        assert_eq!(closed.state, ChannelState::Disconnected);
        assert!(closed.error.is_some());
        assert_eq!(listener.state(), RelayState::Disconnected);
    }

    #[tokio::test]
    async fn listing_and_disconnect_notice_drive_registry() {
        let relay = MockRelay::new().await.unwrap();
        let registry = Registry::new();
        let mut changes = registry.subscribe();
        let listener = listener(&relay, &registry);
        let mut events = listener.subscribe();
        let mut conn = started(&relay, &listener).await;

        conn.send_line("application info public_ip=203.0.113.9").await.unwrap();
        conn.send_line(&format!("radio list {LIST_ENTRY}")).await.unwrap();

        assert_eq!(
            next(&mut events).await,
            RelayEvent::PublicIp("203.0.113.9".parse().unwrap())
        );
        match next(&mut changes).await {
            ChangeEvent::Radio { action, radio } => {
                assert_eq!(action, ChangeAction::Added);
                assert_eq!(radio.serial, "1234-5678");
                assert_eq!(radio.origin, Origin::Relay);
                assert_eq!(radio.local_interface_ip, Some("127.0.0.1".parse().unwrap()));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            next(&mut changes).await,
            ChangeEvent::Client { action: ChangeAction::Added, .. }
        ));
        assert_eq!(listener.public_ip().await, Some("203.0.113.9".parse().unwrap()));

        // The same listing again changes nothing.
        conn.send_line(&format!("radio list {LIST_ENTRY}")).await.unwrap();
        conn.send_line("radio disconnected serial=1234-5678").await.unwrap();
        match next(&mut changes).await {
            ChangeEvent::Radio { action, radio } => {
                assert_eq!(action, ChangeAction::Deleted);
                assert_eq!(radio.serial, "1234-5678");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(registry.is_empty().await);

        listener.stop().await;
    }

    #[tokio::test]
    async fn non_utf8_line_does_not_end_session() {
        let relay = MockRelay::new().await.unwrap();
        let registry = Registry::new();
        let mut changes = registry.subscribe();
        let listener = listener(&relay, &registry);
        let mut events = listener.subscribe();
        let mut conn = started(&relay, &listener).await;

        conn.send_bytes(b"application user_settings callsign=W1AW first_name=Ren\xE9")
            .await
            .unwrap();
        conn.send_line(&format!("radio list {LIST_ENTRY}")).await.unwrap();

        assert_eq!(
            next(&mut events).await,
            RelayEvent::UserSettings {
                callsign: "W1AW".into(),
                first_name: "Ren\u{FFFD}".into(),
                last_name: String::new(),
            }
        );
        assert!(matches!(
            next(&mut changes).await,
            ChangeEvent::Radio { action: ChangeAction::Added, .. }
        ));
        let mut state = listener.state_changes();
        tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| *s == RelayState::Pinging))
            .await
            .unwrap()
            .unwrap();

        listener.stop().await;
    }

    #[tokio::test]
    async fn register_fields_must_be_single_words() {
        let relay = MockRelay::new().await.unwrap();

        let mut spaced_name = options(&relay);
        spaced_name.app_name = "flex link".to_string();
        let listener =
            SmartlinkListener::new(Registry::new(), Arc::new(StaticToken::new("tok")), spaced_name);
        let mut status = listener.subscribe_status();
        assert!(matches!(listener.start("").await, Err(Error::InvalidParameter(_))));
        assert!(status.try_recv().is_err());

        let listener = SmartlinkListener::new(
            Registry::new(),
            Arc::new(StaticToken::new("tok en")),
            options(&relay),
        );
        let mut status = listener.subscribe_status();
        assert!(matches!(listener.start("").await, Err(Error::InvalidParameter(_))));
        assert!(status.try_recv().is_err());
        assert_eq!(listener.state(), RelayState::Disconnected);

        // A rejected start leaves the listener usable.
        assert!(matches!(listener.send_test("1234-5678").await, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn control_lines_are_written() {
        let relay = MockRelay::new().await.unwrap();
        let registry = Registry::new();
        let listener = listener(&relay, &registry);
        let mut events = listener.subscribe();
        let mut conn = started(&relay, &listener).await;

        listener.send_disconnect("1234-5678").await.unwrap();
        listener.send_disconnect_client("1234-5678", 0x4000_0002).await.unwrap();
        listener.send_test("1234-5678").await.unwrap();

        assert_eq!(
            conn.recv_matching("application").await.unwrap(),
            "application disconnect_users serial=1234-5678"
        );
        assert_eq!(
            conn.recv_matching("application").await.unwrap(),
            "application disconnect_users serial=1234-5678 handle=0x40000002"
        );
        assert_eq!(
            conn.recv_matching("application").await.unwrap(),
            "application test_connection serial=1234-5678"
        );

        conn.send_line(
            "radio test_connection serial=1234-5678 upnp_tcp_port_working=true \
             upnp_udp_port_working=true forward_tcp_port_working=false \
             forward_udp_port_working=false nat_supports_hole_punch=false",
        )
        .await
        .unwrap();
        match next(&mut events).await {
            RelayEvent::TestResult(results) => {
                assert_eq!(results.serial, "1234-5678");
                assert!(results.upnp_tcp_port_working);
                assert!(!results.nat_supports_hole_punch);
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(matches!(
            listener.send_test("bad serial").await,
            Err(Error::InvalidParameter(_))
        ));
        listener.stop().await;
    }

    #[tokio::test]
    async fn send_connect_records_hole_punch_port() {
        let relay = MockRelay::new().await.unwrap();
        let registry = Registry::new();
        let listener = listener(&relay, &registry);
        let mut events = listener.subscribe();
        let mut conn = started(&relay, &listener).await;

        conn.send_line("radio list serial=HP1 public_ip=198.51.100.3 public_tls_port=-1 public_udp_port=-1")
            .await
            .unwrap();
        let key = RadioKey {
            serial: "HP1".into(),
            origin: Origin::Relay,
        };
        for _ in 0..100 {
            if registry.get(&key).await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(registry.get(&key).await.unwrap().requires_hole_punch);

        listener.send_connect("HP1", 30001).await.unwrap();
        assert_eq!(
            conn.recv_matching("application").await.unwrap(),
            "application connect serial=HP1 hole_punch_port=30001"
        );
        assert_eq!(
            registry.get(&key).await.unwrap().negotiated_hole_punch_port,
            Some(30001)
        );

        // A later listing keeps the negotiated port.
        conn.send_line("radio list serial=HP1 public_ip=198.51.100.3 public_tls_port=-1 public_udp_port=-1")
            .await
            .unwrap();
        conn.send_line("radio connect_ready handle=0x1F2E3D4C serial=HP1").await.unwrap();
        assert_eq!(
            next(&mut events).await,
            RelayEvent::ConnectReady {
                serial: "HP1".into(),
                handle: "0x1F2E3D4C".into(),
            }
        );
        assert_eq!(
            registry.get(&key).await.unwrap().negotiated_hole_punch_port,
            Some(30001)
        );

        listener.stop().await;
    }

    #[tokio::test]
    async fn pings_on_interval() {
        let relay = MockRelay::new().await.unwrap();
        let listener = SmartlinkListener::new(
            Registry::new(),
            Arc::new(StaticToken::new("tok")),
            SmartlinkOptions {
                ping_interval: Duration::from_millis(100),
                ..options(&relay)
            },
        );
        let mut conn = started(&relay, &listener).await;

        assert_eq!(conn.recv_line().await.unwrap(), "ping from client");
        assert_eq!(conn.recv_line().await.unwrap(), "ping from client");
        listener.stop().await;
    }

    #[tokio::test]
    async fn stop_evicts_relay_radios_only() {
        let relay = MockRelay::new().await.unwrap();
        let registry = Registry::new();
        let mut lan_radio = Radio::new("LAN-1", Origin::Local);
        lan_radio.ip = Some("192.168.1.20".parse().unwrap());
        registry.ingest(lan_radio).await;

        let listener = listener(&relay, &registry);
        let mut status = listener.subscribe_status();
        let mut conn = started(&relay, &listener).await;
        conn.send_line(&format!("radio list {LIST_ENTRY}")).await.unwrap();
        for _ in 0..100 {
            if registry.len().await == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(registry.len().await, 2);

        listener.stop().await;
        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].origin, Origin::Local);
        assert_eq!(listener.state(), RelayState::Disconnected);

        let mut last = next(&mut status).await;
        while last.state != ChannelState::Disconnected {
            last = next(&mut status).await;
        }
        assert_eq!(last.error, None);
        assert!(matches!(listener.send_test("1234-5678").await, Err(Error::NotConnected)));

        // A second stop is a no-op.
        listener.stop().await;
    }

    #[tokio::test]
    async fn remote_close_ends_session() {
        let relay = MockRelay::new().await.unwrap();
        let registry = Registry::new();
        let listener = listener(&relay, &registry);
        let mut status = listener.subscribe_status();
        let mut conn = started(&relay, &listener).await;
        conn.send_line(&format!("radio list {LIST_ENTRY}")).await.unwrap();
        conn.close().await;

        let mut last = next(&mut status).await;
        while last.state != ChannelState::Disconnected {
            last = next(&mut status).await;
        }
        assert!(registry.is_empty().await);
        assert_eq!(listener.state(), RelayState::Disconnected);

        // The listener can be started again.
        let _conn = started(&relay, &listener).await;
        listener.stop().await;
    }

    #[tokio::test]
    async fn registration_invalid_closes_session() {
        let relay = MockRelay::new().await.unwrap();
        let listener = listener(&relay, &Registry::new());
        let mut events = listener.subscribe();
        let mut status = listener.subscribe_status();
        let mut conn = started(&relay, &listener).await;

        conn.send_line("application registration_invalid").await.unwrap();
        assert_eq!(next(&mut events).await, RelayEvent::RegistrationInvalid);

        let mut last = next(&mut status).await;
        while last.state != ChannelState::Disconnected {
            last = next(&mut status).await;
        }
        assert!(last.error.unwrap().contains("registration"));
        assert!(matches!(conn.recv_matching("application").await, Err(Error::ConnectionLost)));
    }
}

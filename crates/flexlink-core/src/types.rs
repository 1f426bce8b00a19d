//! Core data model shared by the discovery and transport crates.
//!
//! A [`Radio`] is one physically discovered transceiver, identified by its
//! [`RadioKey`] (serial number plus [`Origin`]). Connected client sessions
//! are not transmitted on their own: they are rebuilt from the radio's
//! parallel `gui_client_*` lists by [`Radio::gui_clients`].

use std::fmt;
use std::net::IpAddr;

use tokio::time::Instant;

/// Default TCP command port advertised by radios on the LAN.
pub const DEFAULT_COMMAND_PORT: u16 = 4992;

/// How a radio was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Heard via LAN discovery broadcast.
    Local,
    /// Listed by the SmartLink relay.
    Relay,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Local => write!(f, "local"),
            Origin::Relay => write!(f, "smartlink"),
        }
    }
}

/// Identity of a radio. Two descriptors with equal keys are the same device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RadioKey {
    pub serial: String,
    pub origin: Origin,
}

impl fmt::Display for RadioKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.serial, self.origin)
    }
}

/// Descriptor of one discovered radio.
///
/// Everything except `serial` and `origin` may change between sightings
/// without changing the radio's identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Radio {
    /// Radio serial number (identity, with `origin`).
    pub serial: String,
    /// Where the radio was found (identity, with `serial`).
    pub origin: Origin,

    /// Model name, e.g. "FLEX-6600".
    pub model: String,
    /// User-assigned nickname.
    pub nickname: String,
    /// Station callsign.
    pub callsign: String,
    /// Status string, e.g. "Available" or "In_Use".
    pub status: String,
    /// Firmware version string.
    pub version: String,
    /// Discovery protocol version (LAN only).
    pub discovery_protocol_version: String,
    /// Highest firmware version the radio is licensed for.
    pub max_licensed_version: String,
    /// License identifier.
    pub radio_license_id: String,
    /// Address of the client currently using the radio, if any.
    pub inuse_ip: String,
    /// Host name of the client currently using the radio, if any.
    pub inuse_host: String,
    /// Number of additional GUI clients the radio will accept.
    pub available_clients: Option<u32>,
    /// Number of GUI clients the radio is licensed for.
    pub licensed_clients: Option<u32>,

    /// LAN address of the radio (local radios).
    pub ip: Option<IpAddr>,
    /// TCP command port advertised on the LAN.
    pub port: u16,
    /// Public address as seen by the relay.
    pub public_ip: Option<IpAddr>,
    /// Public TLS command port (relay radios).
    pub public_tls_port: Option<u16>,
    /// Public UDP stream port (relay radios).
    pub public_udp_port: Option<u16>,
    /// Whether the relay reports UPnP on the radio's router.
    pub upnp_supported: bool,
    /// Hole-punch port negotiated through the relay, if any.
    pub negotiated_hole_punch_port: Option<u16>,
    /// Neither UPnP nor forwarded ports are available; a hole punch is needed.
    pub requires_hole_punch: bool,
    /// Local interface to bind when hole punching.
    pub local_interface_ip: Option<IpAddr>,

    /// Parallel session lists, zipped on index by [`Radio::gui_clients`].
    pub gui_client_handles: Vec<String>,
    pub gui_client_programs: Vec<String>,
    pub gui_client_stations: Vec<String>,
    pub gui_client_hosts: Vec<String>,
    pub gui_client_ips: Vec<String>,

    /// When the last LAN broadcast for this radio arrived.
    pub last_seen: Option<Instant>,
}

impl Radio {
    /// Create an empty descriptor with the given identity.
    pub fn new(serial: impl Into<String>, origin: Origin) -> Self {
        Self {
            serial: serial.into(),
            origin,
            model: String::new(),
            nickname: String::new(),
            callsign: String::new(),
            status: String::new(),
            version: String::new(),
            discovery_protocol_version: String::new(),
            max_licensed_version: String::new(),
            radio_license_id: String::new(),
            inuse_ip: String::new(),
            inuse_host: String::new(),
            available_clients: None,
            licensed_clients: None,
            ip: None,
            port: DEFAULT_COMMAND_PORT,
            public_ip: None,
            public_tls_port: None,
            public_udp_port: None,
            upnp_supported: false,
            negotiated_hole_punch_port: None,
            requires_hole_punch: false,
            local_interface_ip: None,
            gui_client_handles: Vec::new(),
            gui_client_programs: Vec::new(),
            gui_client_stations: Vec::new(),
            gui_client_hosts: Vec::new(),
            gui_client_ips: Vec::new(),
            last_seen: None,
        }
    }

    /// The identity key of this radio.
    pub fn key(&self) -> RadioKey {
        RadioKey {
            serial: self.serial.clone(),
            origin: self.origin,
        }
    }

    /// Whether the radio was found through the SmartLink relay.
    pub fn is_relay(&self) -> bool {
        self.origin == Origin::Relay
    }

    /// Compare every field except `last_seen`.
    ///
    /// A repeated LAN broadcast only refreshes `last_seen`, which must not
    /// count as a change.
    pub fn same_facts(&self, other: &Radio) -> bool {
        let lhs = Radio {
            last_seen: None,
            ..self.clone()
        };
        let rhs = Radio {
            last_seen: None,
            ..other.clone()
        };
        lhs == rhs
    }

    /// Rebuild the connected client sessions from the parallel lists.
    ///
    /// Handles are hex, with or without a `0x` prefix. An entry whose handle
    /// does not parse is skipped; missing entries in the shorter lists are
    /// empty strings. The result is in list order and holds each handle
    /// once: a repeated handle takes the values of its last entry.
    pub fn gui_clients(&self) -> Vec<GuiClient> {
        let at = |list: &[String], i: usize| list.get(i).cloned().unwrap_or_default();

        let mut clients: Vec<GuiClient> = Vec::with_capacity(self.gui_client_handles.len());
        for (i, raw) in self.gui_client_handles.iter().enumerate() {
            let Some(handle) = parse_handle(raw) else {
                continue;
            };
            let client = GuiClient {
                handle,
                program: at(&self.gui_client_programs, i),
                station: at(&self.gui_client_stations, i),
                host: at(&self.gui_client_hosts, i),
                ip: at(&self.gui_client_ips, i),
            };
            match clients.iter_mut().find(|c| c.handle == handle) {
                Some(existing) => *existing = client,
                None => clients.push(client),
            }
        }
        clients
    }
}

/// A client session connected to a radio, keyed by `handle`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuiClient {
    /// Opaque session handle assigned by the radio.
    pub handle: u32,
    /// Client program name, e.g. "SmartSDR-Win".
    pub program: String,
    /// Station name.
    pub station: String,
    /// Client host name.
    pub host: String,
    /// Client IP address.
    pub ip: String,
}

/// Parse a session handle: hex digits with an optional `0x`/`0X` prefix.
pub fn parse_handle(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    let digits = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw);
    if digits.is_empty() {
        return None;
    }
    u32::from_str_radix(digits, 16).ok()
}

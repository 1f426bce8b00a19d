//! Where to connect and bind for a selected radio.
//!
//! The command and stream channels share one rule for picking addresses:
//!
//! | Radio | Command channel | Stream receive port | Stream remote |
//! |---|---|---|---|
//! | local | `ip:port`, plain TCP | 4991 upward, 20 tries | `ip:4993` |
//! | relay | `public_ip:public_tls_port`, TLS | `public_udp_port` upward | `public_ip:public_udp_port` |
//! | relay + hole punch | `public_ip:hp`, TLS, bound to `local_interface_ip:hp` | `hp` on `local_interface_ip`, one try | `public_ip:hp` |
//!
//! `hp` is the negotiated hole-punch port. Every missing fact is rejected
//! here with [`Error::InvalidParameter`] so no socket call is attempted.

use std::net::{IpAddr, SocketAddr};

use flexlink_core::{Error, Radio, Result};

/// Resolved command channel target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEndpoint {
    pub host: String,
    pub port: u16,
    /// Upgrade to TLS right after the TCP connect.
    pub tls: bool,
    /// Bind the local end here before connecting.
    pub local_bind: Option<SocketAddr>,
}

/// Resolved stream channel addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEndpoint {
    /// Local address to bind.
    pub bind_ip: IpAddr,
    /// First local port to try.
    pub first_port: u16,
    /// Bind attempts allowed, walking upward from `first_port`.
    pub max_attempts: u32,
    /// Where outbound datagrams go.
    pub remote: SocketAddr,
    pub hole_punch: bool,
}

/// Parameters for the LAN half of [`stream_endpoint`].
#[derive(Debug, Clone, Copy)]
pub struct StreamPorts {
    pub bind_ip: IpAddr,
    pub local_udp_port: u16,
    pub radio_udp_port: u16,
    pub max_bind_attempts: u32,
}

struct HolePunch {
    public_ip: IpAddr,
    port: u16,
    local_ip: IpAddr,
}

fn hole_punch(radio: &Radio) -> Result<Option<HolePunch>> {
    if !radio.is_relay() || !radio.requires_hole_punch {
        return Ok(None);
    }
    let port = radio.negotiated_hole_punch_port.ok_or_else(|| {
        Error::InvalidParameter(format!(
            "{} requires a hole punch but no port was negotiated",
            radio.serial
        ))
    })?;
    let local_ip = radio.local_interface_ip.ok_or_else(|| {
        Error::InvalidParameter(format!(
            "{} requires a hole punch but no local interface is set",
            radio.serial
        ))
    })?;
    Ok(Some(HolePunch {
        public_ip: public_ip(radio)?,
        port,
        local_ip,
    }))
}

fn public_ip(radio: &Radio) -> Result<IpAddr> {
    radio
        .public_ip
        .ok_or_else(|| Error::InvalidParameter(format!("{} has no public address", radio.serial)))
}

fn lan_ip(radio: &Radio) -> Result<IpAddr> {
    radio
        .ip
        .ok_or_else(|| Error::InvalidParameter(format!("{} has no LAN address", radio.serial)))
}

/// Resolve the command channel target for `radio`.
pub fn command_endpoint(radio: &Radio) -> Result<CommandEndpoint> {
    if let Some(hp) = hole_punch(radio)? {
        return Ok(CommandEndpoint {
            host: hp.public_ip.to_string(),
            port: hp.port,
            tls: true,
            local_bind: Some(SocketAddr::new(hp.local_ip, hp.port)),
        });
    }

    if radio.is_relay() {
        let port = radio.public_tls_port.ok_or_else(|| {
            Error::InvalidParameter(format!("{} has no public TLS port", radio.serial))
        })?;
        return Ok(CommandEndpoint {
            host: public_ip(radio)?.to_string(),
            port,
            tls: true,
            local_bind: None,
        });
    }

    Ok(CommandEndpoint {
        host: lan_ip(radio)?.to_string(),
        port: radio.port,
        tls: false,
        local_bind: None,
    })
}

/// Resolve the stream channel addresses for `radio`.
pub fn stream_endpoint(radio: &Radio, ports: StreamPorts) -> Result<StreamEndpoint> {
    if let Some(hp) = hole_punch(radio)? {
        return Ok(StreamEndpoint {
            bind_ip: hp.local_ip,
            first_port: hp.port,
            max_attempts: 1,
            remote: SocketAddr::new(hp.public_ip, hp.port),
            hole_punch: true,
        });
    }

    if radio.is_relay() {
        let port = radio.public_udp_port.ok_or_else(|| {
            Error::InvalidParameter(format!("{} has no public UDP port", radio.serial))
        })?;
        return Ok(StreamEndpoint {
            bind_ip: ports.bind_ip,
            first_port: port,
            max_attempts: ports.max_bind_attempts,
            remote: SocketAddr::new(public_ip(radio)?, port),
            hole_punch: false,
        });
    }

    Ok(StreamEndpoint {
        bind_ip: ports.bind_ip,
        first_port: ports.local_udp_port,
        max_attempts: ports.max_bind_attempts,
        remote: SocketAddr::new(lan_ip(radio)?, ports.radio_udp_port),
        hole_punch: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flexlink_core::Origin;
    use std::net::Ipv4Addr;

    const PORTS: StreamPorts = StreamPorts {
        bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        local_udp_port: 4991,
        radio_udp_port: 4993,
        max_bind_attempts: 20,
    };

    fn local() -> Radio {
        let mut r = Radio::new("L1", Origin::Local);
        r.ip = Some("192.168.1.20".parse().unwrap());
        r.port = 4992;
        r
    }

    fn relay() -> Radio {
        let mut r = Radio::new("R1", Origin::Relay);
        r.public_ip = Some("203.0.113.7".parse().unwrap());
        r.public_tls_port = Some(4994);
        r.public_udp_port = Some(4993);
        r
    }

    fn hole_punched() -> Radio {
        let mut r = relay();
        r.public_tls_port = None;
        r.public_udp_port = None;
        r.requires_hole_punch = true;
        r.negotiated_hole_punch_port = Some(30001);
        r.local_interface_ip = Some("10.0.0.5".parse().unwrap());
        r
    }

    #[test]
    fn local_command_is_plain() {
        let ep = command_endpoint(&local()).unwrap();
        assert_eq!(ep.host, "192.168.1.20");
        assert_eq!(ep.port, 4992);
        assert!(!ep.tls);
        assert_eq!(ep.local_bind, None);
    }

    #[test]
    fn relay_command_uses_public_tls_port() {
        let ep = command_endpoint(&relay()).unwrap();
        assert_eq!(ep.host, "203.0.113.7");
        assert_eq!(ep.port, 4994);
        assert!(ep.tls);
        assert_eq!(ep.local_bind, None);
    }

    #[test]
    fn hole_punch_command_binds_local_interface() {
        let ep = command_endpoint(&hole_punched()).unwrap();
        assert_eq!(ep.port, 30001);
        assert!(ep.tls);
        assert_eq!(ep.local_bind, Some("10.0.0.5:30001".parse().unwrap()));
    }

    #[test]
    fn hole_punch_without_interface_rejected() {
        let mut r = hole_punched();
        r.local_interface_ip = None;
        assert!(matches!(command_endpoint(&r), Err(Error::InvalidParameter(_))));
        assert!(matches!(stream_endpoint(&r, PORTS), Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn hole_punch_without_port_rejected() {
        let mut r = hole_punched();
        r.negotiated_hole_punch_port = None;
        assert!(matches!(command_endpoint(&r), Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn hole_punch_flag_ignored_for_local() {
        let mut r = local();
        r.requires_hole_punch = true;
        assert!(!command_endpoint(&r).unwrap().tls);
    }

    #[test]
    fn local_without_ip_rejected() {
        let r = Radio::new("L2", Origin::Local);
        assert!(matches!(command_endpoint(&r), Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn stream_local() {
        let ep = stream_endpoint(&local(), PORTS).unwrap();
        assert_eq!(ep.first_port, 4991);
        assert_eq!(ep.max_attempts, 20);
        assert_eq!(ep.remote, "192.168.1.20:4993".parse().unwrap());
        assert!(!ep.hole_punch);
    }

    #[test]
    fn stream_relay() {
        let ep = stream_endpoint(&relay(), PORTS).unwrap();
        assert_eq!(ep.first_port, 4993);
        assert_eq!(ep.max_attempts, 20);
        assert_eq!(ep.remote, "203.0.113.7:4993".parse().unwrap());
    }

    #[test]
    fn stream_hole_punch_single_attempt() {
        let ep = stream_endpoint(&hole_punched(), PORTS).unwrap();
        assert_eq!(ep.bind_ip, "10.0.0.5".parse::<IpAddr>().unwrap());
        assert_eq!(ep.first_port, 30001);
        assert_eq!(ep.max_attempts, 1);
        assert_eq!(ep.remote, "203.0.113.7:30001".parse().unwrap());
        assert!(ep.hole_punch);
    }

    #[test]
    fn relay_missing_ports_rejected() {
        let mut r = relay();
        r.public_tls_port = None;
        r.public_udp_port = None;
        assert!(command_endpoint(&r).is_err());
        assert!(stream_endpoint(&r, PORTS).is_err());
    }
}

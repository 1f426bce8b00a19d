//! Socket plumbing for flexlink.
//!
//! - [`NetStream`]: TCP connections for the radio command channel and the
//!   SmartLink relay, with optional local bind and TLS upgrade
//! - [`UdpTransport`]: UDP sockets for discovery broadcasts and VITA-49
//!   streams, with shared (reuse + broadcast) and retrying binds
//! - [`TrustPolicy`]: how server certificates are checked on TLS upgrade
//!
//! # Example
//!
//! ```no_run
//! use flexlink_transport::{ConnectOptions, NetStream, TrustPolicy};
//!
//! # async fn example() -> flexlink_core::Result<()> {
//! let stream = NetStream::connect("smartlink.flexradio.com", 443, &ConnectOptions::default())
//!     .await?
//!     .into_tls("smartlink.flexradio.com", &TrustPolicy::AcceptAll)
//!     .await?;
//! assert!(stream.is_tls());
//! # Ok(())
//! # }
//! ```

pub mod tcp;
pub mod tls;
pub mod udp;

pub use tcp::{ConnectOptions, DEFAULT_CONNECT_TIMEOUT, NetStream};
pub use tls::TrustPolicy;
pub use udp::UdpTransport;

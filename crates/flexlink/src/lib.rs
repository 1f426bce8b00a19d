//! FlexRadio discovery and transport.
//!
//! This crate finds FlexRadio transceivers and opens the two sessions a
//! client needs to talk to one. It provides:
//!
//! - **VITA-49 codec** ([`vita49`]) -- decode and validate the binary frames
//!   used for discovery broadcasts and stream data.
//! - **Tokenizer** ([`tokens`]) -- the `key=value` parser shared by the LAN
//!   and relay parsers.
//! - **Registry** ([`registry`]) -- deduplicates discovered radios and their
//!   client sessions and publishes added/updated/deleted events.
//! - **LAN discovery** ([`discovery`]) -- listens for broadcasts on UDP
//!   port 4992 and evicts radios that go quiet.
//! - **SmartLink** ([`smartlink`]) -- TLS control session with the cloud
//!   relay: registration, keep-alive, radio listings, connection brokering.
//! - **Command channel** ([`command`]) -- sequenced `C<seq>|<cmd>` lines
//!   over TCP (TLS for relay radios), with reply routing.
//! - **Stream channel** ([`stream`]) -- UDP bind with retry, registration
//!   and VITA-49 frame delivery.
//!
//! # Architecture
//!
//! The LAN and SmartLink listeners both feed one [`Registry`], constructed
//! by the caller and passed to each. A consumer watches the registry's
//! change events, picks a radio, and opens a [`CommandChannel`] and a
//! [`StreamChannel`] against it. [`endpoint`] decides which addresses and
//! ports those channels use: the advertised LAN port, the relay's public
//! TLS/UDP ports, or a hole-punched port bound on a specific interface.
//!
//! # Example
//!
//! ```no_run
//! use flexlink::{CommandChannel, CommandOptions, LanListener, LanOptions, Registry};
//! use flexlink_core::{ChangeAction, ChangeEvent};
//!
//! # async fn example() -> flexlink_core::Result<()> {
//! let registry = Registry::new();
//! let mut changes = registry.subscribe();
//! let lan = LanListener::new(registry.clone(), LanOptions::default());
//! lan.start().await?;
//!
//! while let Ok(event) = changes.recv().await {
//!     if let ChangeEvent::Radio { action: ChangeAction::Added, radio } = event {
//!         let channel = CommandChannel::new(CommandOptions::default());
//!         channel.connect(&radio).await?;
//!         channel.send("info", false).await?;
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod codec;
pub mod command;
pub mod discovery;
pub mod endpoint;
pub mod registry;
pub mod smartlink;
pub mod stream;
pub mod tokens;
pub mod vita49;

pub use auth::{Authenticator, PassThrough, StaticToken};
pub use command::{CommandChannel, CommandEvent, CommandOptions};
pub use discovery::{LanListener, LanOptions, LanState};
pub use registry::{DiscoveryRegistry, Registry};
pub use smartlink::{RelayEvent, RelayState, SmartlinkListener, SmartlinkOptions, TestResults};
pub use stream::{StreamChannel, StreamOptions};
pub use vita49::{OwnedPacket, Vita49Packet, parse_packet};

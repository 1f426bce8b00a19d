//! flexlink-core: error, data model and event definitions for flexlink.
//!
//! This crate holds the vocabulary shared by the transport crate and the
//! discovery/session crate, so consumers can depend on these types without
//! pulling in any socket code.
//!
//! # Key types
//!
//! - [`Radio`] / [`RadioKey`] -- a discovered radio and its identity
//! - [`GuiClient`] -- a client session rebuilt from a radio's session lists
//! - [`ChangeEvent`] -- registry change notifications
//! - [`ChannelStatus`] / [`StreamStatus`] -- transport state transitions
//! - [`Error`] / [`Result`] -- error handling

pub mod error;
pub mod events;
pub mod types;

pub use error::{Error, Result};
pub use events::{ChangeAction, ChangeEvent, ChannelState, ChannelStatus, StreamStatus};
pub use types::{DEFAULT_COMMAND_PORT, GuiClient, Origin, Radio, RadioKey, parse_handle};

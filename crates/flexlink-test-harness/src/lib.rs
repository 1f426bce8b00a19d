//! flexlink-test-harness: mock servers and frame builders for flexlink
//! tests.
//!
//! - [`MockTcpServer`] -- scripted, line-oriented mock radio (plain or TLS)
//! - [`MockRelay`] -- interactive TLS mock of the SmartLink relay
//! - [`vita`] -- VITA-49 discovery and data frame builders

pub mod mock_relay;
pub mod mock_tcp;
pub mod vita;

pub use mock_relay::{MockRelay, RelayConnection, self_signed_acceptor};
pub use mock_tcp::{AfterScript, MockTcpServer};

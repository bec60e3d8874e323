//! Local-network protocol stack for Tuya-based smart devices.
//!
//! Speaks the LAN protocol directly to devices sharing a network with the
//! host, with no cloud dependency: versioned binary framing (v3.1 through
//! v3.5), per-version payload encryption, session-key negotiation, heartbeat
//! supervision and UDP discovery.
//!
//! The layers are usable independently:
//!
//! - [`protocol`] — pure frame codec: [`protocol::encode`], [`protocol::decode`]
//!   and the [`protocol::FrameBuffer`] stream reassembler.
//! - [`crypto`] — the cipher primitives behind the codec and the session-key
//!   derivation.
//! - [`session`] — the sans-io key-exchange state machine for v3.4/v3.5.
//! - [`heartbeat`] — keep-alive accounting for long-lived connections.
//! - [`discovery`] — UDP broadcast parsing and the passive network listener.
//! - [`connection`] — a tokio driver tying the above to a TCP transport.
//!
//! # Example
//!
//! ```no_run
//! use tuyalink::{ConnectionConfig, ConnectionEvent, DeviceConnection, Version};
//!
//! # async fn demo() -> tuyalink::Result<()> {
//! let config = ConnectionConfig::new(
//!     "bf1234567890abcd",
//!     "192.168.1.50",
//!     "16-byte-localkey".as_bytes(),
//!     Version::V3_4,
//! );
//! let device = DeviceConnection::new(config);
//! device.status().await?;
//! while let ConnectionEvent::Frame(frame) = device.recv().await? {
//!     println!("datapoints: {}", String::from_utf8_lossy(&frame.payload));
//! }
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod crypto;
pub mod discovery;
pub mod error;
pub mod heartbeat;
pub mod protocol;
pub mod session;

pub use connection::{ConnectionConfig, ConnectionEvent, DeviceConnection};
pub use discovery::{DiscoveryCache, DiscoveryListener, DiscoveryRecord};
pub use error::{Result, TuyaError};
pub use heartbeat::{HeartbeatAction, HeartbeatSupervisor, HeartbeatThresholds};
pub use protocol::{CommandType, DecodeResult, Frame, FrameBuffer, FrameEvent, Version};
pub use session::{NegotiationState, SessionNegotiator};

#![forbid(unsafe_code)]
//! Secure unicast session layer for fabric-based device networks.
//!
//! The crate establishes and operates encrypted sessions over an unreliable
//! datagram transport. Two handshakes are supported: a password-authenticated
//! exchange (SPAKE2+ over P-256) used during commissioning, and a
//! certificate-authenticated sigma exchange (ECDH + ECDSA) used between
//! operational nodes, with single-use session resumption. Established
//! sessions protect traffic with AES-128-GCM, reject replays with a sliding
//! counter window, and repair counter desynchronization with a
//! challenge-response sync exchange.
//!
//! # Sans-IO
//!
//! [`SecureChannel`] performs no I/O, spawns no tasks, and reads no clocks.
//! The embedding application owns the socket and the event loop:
//!
//! * inbound datagrams go in via [`SecureChannel::handle_receive`],
//! * time goes in via [`SecureChannel::handle_timeout`],
//! * outbound datagrams come out via [`SecureChannel::poll_datagram`],
//! * state changes come out via [`SecureChannel::poll_event`],
//! * [`SecureChannel::poll_timeout`] says when to call back in.
//!
//! ```
//! use selink::{CertificateVerifier, Config, Error, MemoryEpochStore, SecureChannel, VerifiedPeer};
//!
//! struct RejectAll;
//!
//! impl CertificateVerifier for RejectAll {
//!     fn verify(&self, _certificate: &[u8]) -> Result<VerifiedPeer, Error> {
//!         Err(Error::AuthenticationFailed)
//!     }
//! }
//!
//! let config = Config::builder().max_sessions(8).build()?;
//! let mut channel = SecureChannel::new(
//!     config,
//!     Box::new(RejectAll),
//!     Box::new(MemoryEpochStore::new()),
//! );
//!
//! while let Some((peer, datagram)) = channel.poll_datagram() {
//!     // Write `datagram` to the UDP socket, addressed to `peer`.
//!     let _ = (peer, datagram);
//! }
//! # Ok::<(), selink::Error>(())
//! ```
//!
//! Certificate chain validation is injected through [`CertificateVerifier`];
//! persistence of the send counter epoch is injected through [`EpochStore`].
//! Neither concern is owned by this crate.

mod case;
mod channel;
mod config;
mod counter;
mod crypto;
mod error;
mod event;
mod message;
mod pase;
mod registry;
mod rng;
mod session;
mod sync;
mod timer;

// Signing keys in `LocalIdentity` come from the RustCrypto p256 crate.
pub use p256;

pub use case::LocalIdentity;
pub use channel::SecureChannel;
pub use config::{Config, ConfigBuilder};
pub use counter::{EpochStore, MemoryEpochStore, PeerCounter, RejectReason, WINDOW_SIZE};
pub use crypto::spake2p::{Spake2pProver, Spake2pVerifier};
pub use crypto::{CertificateVerifier, VerifiedPeer};
pub use error::Error;
pub use event::Event;
pub use message::MessageHeader;
pub use registry::{SessionId, SessionRegistry};
pub use rng::SeededRng;
pub use session::{PeerIdentity, ResumptionRecord, Role, SecureSession, SessionKind};

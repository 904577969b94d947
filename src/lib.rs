//! TKey session library
//!
//! Keeps one live connection to a TKey hardware signer and hands out its
//! Ed25519 public key and signatures. The session finds the token's serial
//! port, loads the signer app when the token is still in firmware mode,
//! reuses the connection across closely spaced requests and releases the
//! device after a short idle period.
//!
//! The byte-level protocol is not part of this crate: callers plug in a
//! [`TokenTransport`] implementation.
//!
//! ```no_run
//! use tkey_session::{AppBinary, SessionManager, SignOptions, TokenTransport};
//!
//! fn example(transport: Box<dyn TokenTransport>) -> tkey_session::SessionResult<()> {
//!     let app = AppBinary::from_file("signer.bin")?;
//!     let session = SessionManager::builder(transport, app).build();
//!     let key = session.get_public_key()?;
//!     let signature = session.sign(b"challenge", SignOptions::unhashed())?;
//!     key.verify(b"challenge", &signature)?;
//!     Ok(())
//! }
//! ```

pub mod adapters;
pub mod domain;
pub mod infra;
pub mod services;

pub use adapters::transport::{PortDiscovery, StaticDiscovery, TokenTransport, TransportFactory};
pub use domain::{
    AppBinary, HashAlgorithm, NameVersion, PublicKey, Secret, SignOptions, SignedMessage,
    TokenMode, Udi,
};
pub use infra::config::{ConfigManager, SessionConfiguration};
pub use infra::error::{SessionError, SessionResult, TransportError, TransportResult};
pub use services::provider::{get_public_key, sign};
pub use services::{
    SecretPrompt, SecretSource, SessionBuilder, SessionManager, SessionState, SignatureProvider,
};

//! Capability interface for talking to a token.
//!
//! The session manager drives a token exclusively through these traits. The
//! wire protocol and framing live in the implementation, which is supplied by
//! the embedding application; nothing here retries, that policy belongs to the
//! caller.

use crate::domain::{NameVersion, Secret, Udi};
use crate::infra::error::TransportResult;

/// Synchronous, single-command-at-a-time access to one token.
///
/// Implementations may block for hundreds of milliseconds per call. The
/// session manager guarantees that no two calls on the same transport
/// overlap.
pub trait TokenTransport: Send {
    /// Open the serial port at `port` with the given speed.
    fn open(&mut self, port: &str, speed: u32) -> TransportResult<()>;

    /// Close the port. Closing an already closed transport is not an error.
    fn close(&mut self) -> TransportResult<()>;

    /// Identity reported by the firmware.
    fn firmware_name_version(&mut self) -> TransportResult<NameVersion>;

    /// Identity reported by the currently loaded app.
    fn app_name_version(&mut self) -> TransportResult<NameVersion>;

    /// Unique device identifier (firmware mode only).
    fn udi(&mut self) -> TransportResult<Udi>;

    /// Load `binary` as the running app, personalised with `secret` if any.
    fn load_app(&mut self, binary: &[u8], secret: Option<&Secret>) -> TransportResult<()>;

    /// Raw public key bytes from the signer app.
    fn public_key(&mut self) -> TransportResult<Vec<u8>>;

    /// Raw signature over the unhashed `message`.
    fn sign(&mut self, message: &[u8]) -> TransportResult<Vec<u8>>;
}

/// Finds serial ports that look like a token.
pub trait PortDiscovery: Send + Sync {
    /// All candidate ports currently present.
    fn candidates(&self) -> TransportResult<Vec<String>>;
}

/// A fixed list of candidates, for pinned setups and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery(pub Vec<String>);

impl PortDiscovery for StaticDiscovery {
    fn candidates(&self) -> TransportResult<Vec<String>> {
        Ok(self.0.clone())
    }
}

/// Creates a fresh transport for each new session.
pub type TransportFactory = Box<dyn Fn() -> Box<dyn TokenTransport> + Send + Sync>;

//! Personalization secret (USS) handed to the token at app load.

use std::fmt;

use zeroize::Zeroizing;

/// A user-supplied secret mixed into the signer app at load time.
///
/// The bytes are wiped when the value is dropped, and the value is consumed
/// by exactly one load. It is not `Clone` so a secret cannot outlive the load
/// it was acquired for.
pub struct Secret(Zeroizing<Vec<u8>>);

impl Secret {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Secret(Zeroizing::new(bytes))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

// Keep secrets out of logs and panic messages.
impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret([REDACTED; {}])", self.0.len())
    }
}

//! The signer app binary loaded onto the token.
//!
//! The binary itself is a vendor-supplied blob; this crate only carries it,
//! names it and fingerprints it.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha512};

use crate::domain::constants::SIGNER_APP_NAME;
use crate::infra::error::{SessionError, SessionResult};

/// An app binary ready to be loaded, shared between sessions.
#[derive(Clone)]
pub struct AppBinary {
    name: String,
    bytes: Arc<[u8]>,
}

impl AppBinary {
    /// Wrap the signer app bytes under the expected app name.
    #[must_use]
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self::named(SIGNER_APP_NAME, bytes)
    }

    #[must_use]
    pub fn named(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        let bytes: Vec<u8> = bytes.into();
        Self {
            name: name.into(),
            bytes: Arc::from(bytes),
        }
    }

    /// Read the signer app from disk.
    pub fn from_file(path: impl AsRef<Path>) -> SessionResult<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            SessionError::Configuration(format!(
                "failed to read app binary {}: {e}",
                path.display()
            ))
        })?;
        if bytes.is_empty() {
            return Err(SessionError::Configuration(format!(
                "app binary {} is empty",
                path.display()
            )));
        }
        log::debug!("Read app binary {} ({} bytes)", path.display(), bytes.len());
        Ok(Self::from_bytes(bytes))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Hex encoded SHA-512 digest of the binary.
    #[must_use]
    pub fn digest_hex(&self) -> String {
        hex::encode(Sha512::digest(&self.bytes))
    }
}

impl fmt::Debug for AppBinary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppBinary")
            .field("name", &self.name)
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_digest_of_empty_input_matches_known_value() {
        let app = AppBinary::named("empty", Vec::new());
        assert!(app.digest_hex().starts_with("cf83e1357eefb8bdf1542850d66d8007"));
        assert_eq!(app.digest_hex().len(), 128);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0x13, 0x37]).unwrap();

        let app = AppBinary::from_file(file.path()).unwrap();
        assert_eq!(app.as_bytes(), &[0x13, 0x37]);
        assert_eq!(app.name(), SIGNER_APP_NAME);
    }

    #[test]
    fn test_from_file_rejects_missing_and_empty() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            AppBinary::from_file(file.path()),
            Err(SessionError::Configuration(_))
        ));
        assert!(AppBinary::from_file("/nonexistent/signer.bin").is_err());
    }
}

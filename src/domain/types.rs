//! Type-safe wrappers for values exchanged with the token.
//!
//! Newtypes keep raw byte vectors coming off the wire from being confused
//! with each other and validate lengths once, at the boundary.

use std::fmt;

use base64::Engine;
use ed25519_dalek::Verifier;

use crate::domain::constants::{
    FIRMWARE_NAME0, FIRMWARE_NAME1, PUBLIC_KEY_LEN, SIGNATURE_LEN, SIGNER_APP_NAME0,
    SIGNER_APP_NAME1, UDI_LEN,
};
use crate::infra::error::{SessionError, SessionResult};

/// Name and version reported by the firmware or by a loaded app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameVersion {
    pub name0: String,
    pub name1: String,
    pub version: u32,
}

impl NameVersion {
    #[must_use]
    pub fn new(name0: impl Into<String>, name1: impl Into<String>, version: u32) -> Self {
        Self {
            name0: name0.into(),
            name1: name1.into(),
            version,
        }
    }

    /// True when this is the bare firmware identity. The version is ignored.
    #[must_use]
    pub fn is_firmware(&self) -> bool {
        self.name0 == FIRMWARE_NAME0 && self.name1 == FIRMWARE_NAME1
    }

    /// True when this is the signer app identity. The version is ignored.
    #[must_use]
    pub fn is_signer_app(&self) -> bool {
        self.name0 == SIGNER_APP_NAME0 && self.name1 == SIGNER_APP_NAME1
    }
}

impl fmt::Display for NameVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{} v{}", self.name0, self.name1, self.version)
    }
}

/// Unique device identifier of a physical token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Udi([u8; UDI_LEN]);

impl Udi {
    #[must_use]
    pub fn new(bytes: [u8; UDI_LEN]) -> Self {
        Udi(bytes)
    }

    /// Build from a device response, validating the length.
    pub fn from_slice(bytes: &[u8]) -> SessionResult<Self> {
        let array: [u8; UDI_LEN] = bytes.try_into().map_err(|_| {
            SessionError::DeviceOperationFailed(format!(
                "UDI must be {UDI_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Udi(array))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; UDI_LEN] {
        &self.0
    }
}

impl fmt::Display for Udi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", hex::encode(&self.0[..4]), hex::encode(&self.0[4..]))
    }
}

/// Ed25519 public key held by the signer app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    #[must_use]
    pub fn new(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
        PublicKey(bytes)
    }

    /// Build from a device response, validating the length.
    pub fn from_slice(bytes: &[u8]) -> SessionResult<Self> {
        let array: [u8; PUBLIC_KEY_LEN] = bytes.try_into().map_err(|_| {
            SessionError::DeviceOperationFailed(format!(
                "public key must be {PUBLIC_KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(PublicKey(array))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Render as an OpenSSH `authorized_keys` line (without trailing newline).
    #[must_use]
    pub fn to_authorized_key(&self) -> String {
        const KEY_TYPE: &[u8] = b"ssh-ed25519";

        let mut blob = Vec::with_capacity(8 + KEY_TYPE.len() + PUBLIC_KEY_LEN);
        blob.extend_from_slice(&(KEY_TYPE.len() as u32).to_be_bytes());
        blob.extend_from_slice(KEY_TYPE);
        blob.extend_from_slice(&(PUBLIC_KEY_LEN as u32).to_be_bytes());
        blob.extend_from_slice(&self.0);

        format!(
            "ssh-ed25519 {}",
            base64::engine::general_purpose::STANDARD.encode(blob)
        )
    }

    /// Verify an Ed25519 signature made over the unhashed `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> SessionResult<()> {
        if signature.len() != SIGNATURE_LEN {
            return Err(SessionError::PreconditionViolated(format!(
                "signature must be {SIGNATURE_LEN} bytes, got {}",
                signature.len()
            )));
        }
        let key = ed25519_dalek::VerifyingKey::from_bytes(&self.0).map_err(|e| {
            SessionError::PreconditionViolated(format!("invalid public key: {e}"))
        })?;
        let signature = ed25519_dalek::Signature::from_slice(signature).map_err(|e| {
            SessionError::PreconditionViolated(format!("invalid signature: {e}"))
        })?;
        key.verify(message, &signature).map_err(|e| {
            SessionError::PreconditionViolated(format!("signature does not verify: {e}"))
        })
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Hash algorithms a caller may claim to have applied to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha384 => "sha384",
            HashAlgorithm::Sha512 => "sha512",
        }
    }
}

/// Options for a sign request.
///
/// Ed25519 signs the raw message, so the only accepted mode is `prehash: None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignOptions {
    pub prehash: Option<HashAlgorithm>,
}

impl SignOptions {
    #[must_use]
    pub fn unhashed() -> Self {
        Self { prehash: None }
    }

    #[must_use]
    pub fn prehashed(algorithm: HashAlgorithm) -> Self {
        Self {
            prehash: Some(algorithm),
        }
    }
}

/// What the token is running, as seen by one classification step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenMode {
    /// Neither firmware nor any app answered an identity query.
    Unreachable,
    /// Bare firmware, waiting for an app to be loaded.
    Firmware,
    /// Some other app is loaded.
    WrongApp(NameVersion),
    /// The signer app is loaded.
    CorrectApp,
}

impl TokenMode {
    /// Classify from the answers to the firmware and app identity queries.
    ///
    /// Firmware wins when both are present; `None` means the query failed.
    #[must_use]
    pub fn from_identities(firmware: Option<&NameVersion>, app: Option<&NameVersion>) -> Self {
        if firmware.is_some_and(NameVersion::is_firmware) {
            return TokenMode::Firmware;
        }
        match app {
            Some(app) if app.is_signer_app() => TokenMode::CorrectApp,
            Some(app) => TokenMode::WrongApp(app.clone()),
            None => TokenMode::Unreachable,
        }
    }
}

/// A signature together with the key that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedMessage {
    pub signature: Vec<u8>,
    pub public_key: PublicKey,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_version_matching() {
        assert!(NameVersion::new("tk1 ", "mkdf", 5).is_firmware());
        assert!(NameVersion::new("tk1 ", "sign", 1).is_signer_app());
        assert!(!NameVersion::new("tk1 ", "ssh-", 1).is_signer_app());
        assert_eq!(NameVersion::new("tk1 ", "sign", 3).to_string(), "tk1 sign v3");
    }

    #[test]
    fn test_token_mode_classification() {
        let fw = NameVersion::new("tk1 ", "mkdf", 2);
        let signer = NameVersion::new("tk1 ", "sign", 1);
        let other = NameVersion::new("tk1 ", "totp", 1);

        assert_eq!(TokenMode::from_identities(Some(&fw), None), TokenMode::Firmware);
        assert_eq!(
            TokenMode::from_identities(None, Some(&signer)),
            TokenMode::CorrectApp
        );
        assert_eq!(
            TokenMode::from_identities(None, Some(&other)),
            TokenMode::WrongApp(other.clone())
        );
        assert_eq!(TokenMode::from_identities(None, None), TokenMode::Unreachable);
        // An app answering the firmware query with its own name is not firmware.
        assert_eq!(
            TokenMode::from_identities(Some(&other), Some(&signer)),
            TokenMode::CorrectApp
        );
    }

    #[test]
    fn test_public_key_length_validation() {
        assert!(PublicKey::from_slice(&[0u8; 32]).is_ok());
        assert!(matches!(
            PublicKey::from_slice(&[0u8; 31]),
            Err(SessionError::DeviceOperationFailed(_))
        ));
    }

    #[test]
    fn test_authorized_key_format() {
        let line = PublicKey::new([0x42; 32]).to_authorized_key();
        assert!(line.starts_with("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAI"));
        // 51 byte blob encodes to 68 base64 characters.
        assert_eq!(line.len(), "ssh-ed25519 ".len() + 68);
    }

    #[test]
    fn test_verify_roundtrip_with_dalek_key() {
        use ed25519_dalek::Signer;

        let signing_key = ed25519_dalek::SigningKey::from_bytes(&[7u8; 32]);
        let public_key = PublicKey::new(signing_key.verifying_key().to_bytes());
        let signature = signing_key.sign(b"challenge");

        assert!(public_key.verify(b"challenge", &signature.to_bytes()).is_ok());
        assert!(public_key.verify(b"other", &signature.to_bytes()).is_err());
        assert!(public_key.verify(b"challenge", &[0u8; 10]).is_err());
    }

    #[test]
    fn test_udi_display() {
        let udi = Udi::new([0x01, 0x33, 0x70, 0x22, 0x00, 0x00, 0x01, 0x2a]);
        assert_eq!(udi.to_string(), "01337022:0000012a");
        assert!(Udi::from_slice(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_hash_algorithm_properties() {
        assert_eq!(HashAlgorithm::Sha256.as_str(), "sha256");
        assert_eq!(SignOptions::default(), SignOptions::unhashed());
    }
}

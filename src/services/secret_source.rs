//! Personalization secret acquisition.
//!
//! A secret comes from one of two mutually exclusive places: the user, asked
//! through a [`SecretPrompt`] that is told which device the secret is for, or
//! a file. Having neither is valid and means the app loads without a secret.
//! A source that is configured but fails never degrades to "no secret".

use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use zeroize::Zeroizing;

use crate::domain::{Secret, Udi};
use crate::infra::error::{SessionError, SessionResult};

/// Asks the user for the secret belonging to one physical device.
pub trait SecretPrompt: Send + Sync {
    fn ask(&self, udi: &Udi) -> SessionResult<Secret>;
}

/// Where the personalization secret comes from.
#[derive(Clone, Default)]
pub enum SecretSource {
    /// Load the app without a secret.
    #[default]
    None,
    /// Ask the user, keyed by the device's UDI.
    Prompt(Arc<dyn SecretPrompt>),
    /// Read from a file; `-` reads standard input.
    File(PathBuf),
}

impl SecretSource {
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, SecretSource::None)
    }

    /// Obtain a fresh secret for one app load.
    ///
    /// `udi` is only invoked for the prompt source, so a device that cannot
    /// report its UDI still loads when no prompt is configured.
    pub fn acquire<F>(&self, udi: F) -> SessionResult<Option<Secret>>
    where
        F: FnOnce() -> SessionResult<Udi>,
    {
        match self {
            SecretSource::None => Ok(None),
            SecretSource::Prompt(prompt) => {
                let udi = udi()?;
                log::debug!("Prompting for secret of TKey {udi}");
                prompt.ask(&udi).map(Some)
            }
            SecretSource::File(path) => read_secret_file(path).map(Some),
        }
    }
}

impl fmt::Debug for SecretSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretSource::None => write!(f, "None"),
            SecretSource::Prompt(_) => write!(f, "Prompt"),
            SecretSource::File(path) => f.debug_tuple("File").field(path).finish(),
        }
    }
}

/// Read a secret file, or standard input for `-`.
pub fn read_secret_file(path: &Path) -> SessionResult<Secret> {
    if path == Path::new("-") {
        return read_secret(std::io::stdin().lock())
            .map_err(|e| SessionError::SecretAcquisitionFailed(format!("stdin: {e}")));
    }

    let file = std::fs::File::open(path).map_err(|e| {
        SessionError::SecretAcquisitionFailed(format!(
            "could not read secret file {}: {e}",
            path.display()
        ))
    })?;
    read_secret(file).map_err(|e| {
        SessionError::SecretAcquisitionFailed(format!("secret file {}: {e}", path.display()))
    })
}

/// Read a whole secret from `reader`, dropping one trailing line ending.
pub(crate) fn read_secret<R: Read>(mut reader: R) -> Result<Secret, String> {
    let mut buf = Zeroizing::new(Vec::new());
    reader.read_to_end(&mut buf).map_err(|e| e.to_string())?;

    if buf.ends_with(b"\n") {
        buf.pop();
        if buf.ends_with(b"\r") {
            buf.pop();
        }
    }
    if buf.is_empty() {
        return Err("secret is empty".to_string());
    }
    Ok(Secret::new(std::mem::take(&mut *buf)))
}

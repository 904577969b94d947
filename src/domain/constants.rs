//! Protocol constants for the TKey and the signer app.

use std::time::Duration;

/// USB vendor ID of the TKey serial interface.
pub const TKEY_USB_VID: u16 = 0x1207;

/// USB product ID of the TKey serial interface.
pub const TKEY_USB_PID: u16 = 0x8887;

/// Default serial speed (baud).
pub const DEFAULT_SERIAL_SPEED: u32 = 62_500;

/// Delay after the last request before the connection is closed.
pub const IDLE_DISCONNECT: Duration = Duration::from_secs(3);

// Identity names are 4 ASCII characters each.

/// Firmware identity, first half.
pub const FIRMWARE_NAME0: &str = "tk1 ";
/// Firmware identity, second half.
pub const FIRMWARE_NAME1: &str = "mkdf";

/// Signer app identity, first half.
pub const SIGNER_APP_NAME0: &str = "tk1 ";
/// Signer app identity, second half.
pub const SIGNER_APP_NAME1: &str = "sign";

/// Name and version of the signer app binary this crate expects to load.
pub const SIGNER_APP_NAME: &str = "tkey-device-signer 1.0.3";

/// Length of an Ed25519 public key.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Length of an Ed25519 signature.
pub const SIGNATURE_LEN: usize = 64;

/// Length of the unique device identifier.
pub const UDI_LEN: usize = 8;

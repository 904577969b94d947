//! Adapter layer modules for external system integration.
//!
//! Provides adapters for:
//! - The token capability interface (`TokenTransport`, `PortDiscovery`)
//! - USB serial port discovery - feature `serial-discovery`
//! - Interactive secret entry through `pinentry`

pub mod pinentry;
pub mod transport;

#[cfg(feature = "serial-discovery")]
pub mod serial;

//! Serial port discovery for TKeys.
//!
//! Scans the system's serial ports for USB devices carrying the TKey vendor
//! and product IDs.

use crate::adapters::transport::PortDiscovery;
use crate::domain::constants::{TKEY_USB_PID, TKEY_USB_VID};
use crate::infra::error::{TransportError, TransportResult};

/// Discovers TKeys among the USB serial ports of this machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialPortDiscovery;

impl PortDiscovery for SerialPortDiscovery {
    fn candidates(&self) -> TransportResult<Vec<String>> {
        let ports = serialport::available_ports()
            .map_err(|e| TransportError::Io(format!("failed to enumerate serial ports: {e}")))?;

        let usb_ports = ports.into_iter().map(|port| {
            let ids = match port.port_type {
                serialport::SerialPortType::UsbPort(info) => Some((info.vid, info.pid)),
                _ => None,
            };
            (port.port_name, ids)
        });

        let found = select_token_ports(usb_ports);
        log::debug!("Serial discovery found {} TKey port(s)", found.len());
        Ok(found)
    }
}

/// Keep ports whose USB IDs match a TKey.
///
/// macOS lists every device twice, as `/dev/cu.*` and `/dev/tty.*`; only the
/// call-out device is kept so one token counts once.
pub(crate) fn select_token_ports<I>(ports: I) -> Vec<String>
where
    I: IntoIterator<Item = (String, Option<(u16, u16)>)>,
{
    let matching: Vec<String> = ports
        .into_iter()
        .filter(|(_, ids)| *ids == Some((TKEY_USB_VID, TKEY_USB_PID)))
        .map(|(name, _)| name)
        .collect();

    matching
        .iter()
        .filter(|name| match name.strip_prefix("/dev/tty.") {
            Some(rest) => !matching.iter().any(|other| other == &format!("/dev/cu.{rest}")),
            None => true,
        })
        .cloned()
        .collect()
}

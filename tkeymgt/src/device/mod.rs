//! TKey discovery.
//!
//! A TKey shows up as a USB CDC-ACM serial port with a fixed VID/PID pair.
//! Discovery enumerates serial ports, classifies them, and picks the single
//! TKey present. Two attached TKeys are reported as ambiguous rather than
//! guessed between.

use crate::error::{Error, Result};

#[cfg(feature = "native")]
use log::{debug, info, trace};

/// USB vendor ID of the TKey (Tillitis).
pub const TKEY_VID: u16 = 0x1207;
/// USB product ID of the TKey.
pub const TKEY_PID: u16 = 0x8887;

/// Classification of a discovered serial port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// A Tillitis TKey.
    TKey,
    /// Some other USB serial device.
    OtherUsb,
    /// Not a USB device, or no USB metadata available.
    Unknown,
}

impl DeviceKind {
    /// Classify a VID/PID pair.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        if vid == TKEY_VID && pid == TKEY_PID {
            Self::TKey
        } else {
            Self::OtherUsb
        }
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::TKey => "TKey",
            Self::OtherUsb => "USB serial",
            Self::Unknown => "Unknown",
        }
    }
}

/// Discovered serial port with metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DetectedPort {
    /// Port name/path (e.g., "/dev/ttyACM0" or "COM3").
    pub name: String,
    /// Classified device kind.
    #[cfg_attr(feature = "serde", serde(serialize_with = "serialize_kind"))]
    pub device: DeviceKind,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Device manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Device product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

#[cfg(feature = "serde")]
fn serialize_kind<S>(kind: &DeviceKind, s: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    s.serialize_str(kind.name())
}

impl DetectedPort {
    /// Whether this port is a TKey.
    pub fn is_tkey(&self) -> bool {
        self.device == DeviceKind::TKey
    }
}

#[cfg(feature = "native")]
impl From<serialport::SerialPortInfo> for DetectedPort {
    fn from(info: serialport::SerialPortInfo) -> Self {
        match info.port_type {
            serialport::SerialPortType::UsbPort(usb) => Self {
                device: DeviceKind::from_vid_pid(usb.vid, usb.pid),
                name: info.port_name,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                manufacturer: usb.manufacturer,
                product: usb.product,
                serial: usb.serial_number,
            },
            _ => Self {
                name: info.port_name,
                device: DeviceKind::Unknown,
                vid: None,
                pid: None,
                manufacturer: None,
                product: None,
                serial: None,
            },
        }
    }
}

/// Enumerate all serial ports with metadata.
///
/// Enumeration failures are logged and yield an empty list.
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<DetectedPort> {
    let ports = serialport::available_ports().unwrap_or_else(|e| {
        debug!("Serial port enumeration failed: {e}");
        Vec::new()
    });
    ports
        .into_iter()
        .map(DetectedPort::from)
        .inspect(|port| trace!("{}: {:?}", port.name, port.device))
        .collect()
}

/// Enumerate all serial ports (no native backend: always empty).
#[cfg(not(feature = "native"))]
pub fn detect_ports() -> Vec<DetectedPort> {
    Vec::new()
}

/// Ports that are TKeys.
pub fn detect_tkey_ports() -> Vec<DetectedPort> {
    detect_ports()
        .into_iter()
        .filter(DetectedPort::is_tkey)
        .collect()
}

/// Pick the single TKey among `ports`.
pub fn select_tkey(ports: Vec<DetectedPort>) -> Result<DetectedPort> {
    let mut tkeys: Vec<DetectedPort> = ports.into_iter().filter(DetectedPort::is_tkey).collect();
    match tkeys.len() {
        0 => Err(Error::DeviceNotFound),
        1 => Ok(tkeys.remove(0)),
        _ => Err(Error::AmbiguousDevice(
            tkeys.into_iter().map(|p| p.name).collect(),
        )),
    }
}

/// Auto-detect the attached TKey.
#[cfg(feature = "native")]
pub fn auto_detect_port() -> Result<DetectedPort> {
    let port = select_tkey(detect_ports())?;
    info!("Auto-detected TKey: {}", port.name);
    Ok(port)
}

/// Auto-detect the attached TKey (no native backend: never found).
#[cfg(not(feature = "native"))]
pub fn auto_detect_port() -> Result<DetectedPort> {
    Err(Error::DeviceNotFound)
}

/// One display line per port: name, a TKey tag or VID/PID, and serial number.
pub fn format_port_list(ports: &[DetectedPort]) -> Vec<String> {
    ports
        .iter()
        .map(|port| {
            let mut line = port.name.clone();
            match (port.is_tkey(), port.vid, port.pid) {
                (true, ..) => line.push_str(&format!(" [{}]", port.device.name())),
                (false, Some(vid), Some(pid)) => {
                    line.push_str(&format!(" [VID:{vid:04X} PID:{pid:04X}]"));
                },
                _ => {},
            }
            if let Some(serial) = &port.serial {
                line.push_str(&format!(" (serial {serial})"));
            }
            line
        })
        .collect()
}

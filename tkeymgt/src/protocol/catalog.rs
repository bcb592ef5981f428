//! Command catalog.
//!
//! Every exchange a workflow performs is described by a [`Command`]: which
//! endpoint it targets, its opcode and the fixed frame length the device
//! expects. Requests and responses are separate entries because the same
//! opcode is often answered with a different length class (a one-byte
//! `GetPubkey` request is answered by a 128-byte frame).

use crate::error::{Error, Result};

/// Frame length classes of the TKey framing protocol.
///
/// The length includes the opcode byte, so the payload capacity is one less.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameLen {
    /// 1 byte (opcode only).
    One,
    /// 4 bytes.
    Four,
    /// 32 bytes.
    ThirtyTwo,
    /// 128 bytes.
    OneTwentyEight,
}

impl FrameLen {
    /// Number of bytes following the framing header.
    pub const fn size(self) -> usize {
        match self {
            Self::One => 1,
            Self::Four => 4,
            Self::ThirtyTwo => 32,
            Self::OneTwentyEight => 128,
        }
    }

    /// Payload bytes available after the opcode.
    pub const fn capacity(self) -> usize {
        self.size() - 1
    }

    /// Two-bit code used in the framing header.
    pub const fn code(self) -> u8 {
        match self {
            Self::One => 0,
            Self::Four => 1,
            Self::ThirtyTwo => 2,
            Self::OneTwentyEight => 3,
        }
    }

    /// Decode the two-bit header code.
    pub const fn from_code(code: u8) -> Self {
        match code & 0x03 {
            0 => Self::One,
            1 => Self::Four,
            2 => Self::ThirtyTwo,
            _ => Self::OneTwentyEight,
        }
    }
}

/// Destination of a frame inside the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// The ROM firmware (app loading).
    Firmware,
    /// The running device app (the verifier).
    App,
}

impl Endpoint {
    /// Two-bit value used in the framing header.
    pub const fn wire(self) -> u8 {
        match self {
            Self::Firmware => 2,
            Self::App => 3,
        }
    }

    /// Map a header value back to an endpoint. Hardware and FPGA endpoints
    /// are never addressed by this tool.
    pub const fn from_wire(value: u8) -> Option<Self> {
        match value {
            2 => Some(Self::Firmware),
            3 => Some(Self::App),
            _ => None,
        }
    }
}

/// Whether a command is sent by the host or by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Host to device.
    Request,
    /// Device to host.
    Response,
}

/// One catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Command {
    /// Name used in logs and errors.
    pub name: &'static str,
    /// Opcode carried in the first byte after the header.
    pub opcode: u8,
    /// Target endpoint.
    pub endpoint: Endpoint,
    /// Fixed frame length.
    pub len: FrameLen,
    /// Request or response.
    pub direction: Direction,
}

impl Command {
    const fn request(name: &'static str, opcode: u8, endpoint: Endpoint, len: FrameLen) -> Self {
        Self {
            name,
            opcode,
            endpoint,
            len,
            direction: Direction::Request,
        }
    }

    const fn response(name: &'static str, opcode: u8, endpoint: Endpoint, len: FrameLen) -> Self {
        Self {
            name,
            opcode,
            endpoint,
            len,
            direction: Direction::Response,
        }
    }

    /// Payload capacity of this command's frames.
    pub const fn capacity(&self) -> usize {
        self.len.capacity()
    }
}

/// Verify a digest/signature pair with the installed key.
pub const CMD_VERIFY: Command =
    Command::request("verify", 0x01, Endpoint::App, FrameLen::OneTwentyEight);
/// Response to [`CMD_VERIFY`].
pub const RSP_VERIFY: Command = Command::response("verify", 0x01, Endpoint::App, FrameLen::Four);
/// Start an app upload: size, digest, signature.
pub const CMD_UPDATE_APP_INIT: Command =
    Command::request("update app init", 0x03, Endpoint::App, FrameLen::OneTwentyEight);
/// Response to [`CMD_UPDATE_APP_INIT`].
pub const RSP_UPDATE_APP_INIT: Command =
    Command::response("update app init", 0x03, Endpoint::App, FrameLen::Four);
/// One chunk of app data.
pub const CMD_UPDATE_APP_CHUNK: Command =
    Command::request("update app chunk", 0x04, Endpoint::App, FrameLen::OneTwentyEight);
/// Response to [`CMD_UPDATE_APP_CHUNK`].
pub const RSP_UPDATE_APP_CHUNK: Command =
    Command::response("update app chunk", 0x04, Endpoint::App, FrameLen::Four);
/// Read the installed public key.
pub const CMD_GET_PUBKEY: Command =
    Command::request("get pubkey", 0x05, Endpoint::App, FrameLen::One);
/// Response to [`CMD_GET_PUBKEY`]: status then the 32-byte key.
pub const RSP_GET_PUBKEY: Command =
    Command::response("get pubkey", 0x05, Endpoint::App, FrameLen::OneTwentyEight);
/// Store a new trusted public key (needs presence confirmation).
pub const CMD_STORE_PUBKEY: Command =
    Command::request("store pubkey", 0x06, Endpoint::App, FrameLen::OneTwentyEight);
/// Response to [`CMD_STORE_PUBKEY`].
pub const RSP_STORE_PUBKEY: Command =
    Command::response("store pubkey", 0x06, Endpoint::App, FrameLen::Four);
/// Hand a public key to the running verifier for the next `verify`.
pub const CMD_SET_PUBKEY: Command =
    Command::request("set pubkey", 0x07, Endpoint::App, FrameLen::OneTwentyEight);
/// Response to [`CMD_SET_PUBKEY`].
pub const RSP_SET_PUBKEY: Command =
    Command::response("set pubkey", 0x07, Endpoint::App, FrameLen::Four);
/// Erase all storage areas (needs presence confirmation).
pub const CMD_ERASE_AREAS: Command =
    Command::request("erase areas", 0x08, Endpoint::App, FrameLen::One);
/// Response to [`CMD_ERASE_AREAS`].
pub const RSP_ERASE_AREAS: Command =
    Command::response("erase areas", 0x08, Endpoint::App, FrameLen::Four);
/// Reset into a boot target. No response; the device drops off the bus.
pub const CMD_RESET: Command = Command::request("reset", 0xfe, Endpoint::App, FrameLen::Four);
/// Reset opcode of older verifier builds.
pub const CMD_RESET_LEGACY: Command =
    Command::request("reset", 0x02, Endpoint::App, FrameLen::Four);

/// Firmware: announce an app of a given size.
pub const CMD_LOAD_APP: Command =
    Command::request("load app", 0x03, Endpoint::Firmware, FrameLen::OneTwentyEight);
/// Response to [`CMD_LOAD_APP`].
pub const RSP_LOAD_APP: Command =
    Command::response("load app", 0x04, Endpoint::Firmware, FrameLen::Four);
/// Firmware: one chunk of app data.
pub const CMD_LOAD_APP_DATA: Command =
    Command::request("load app data", 0x05, Endpoint::Firmware, FrameLen::OneTwentyEight);
/// Response to every [`CMD_LOAD_APP_DATA`] but the last.
pub const RSP_LOAD_APP_DATA: Command =
    Command::response("load app data", 0x06, Endpoint::Firmware, FrameLen::Four);
/// Response to the last [`CMD_LOAD_APP_DATA`]: status then the digest the
/// firmware computed.
pub const RSP_LOAD_APP_DATA_READY: Command =
    Command::response("load app data ready", 0x07, Endpoint::Firmware, FrameLen::OneTwentyEight);

const REQUESTS: &[Command] = &[
    CMD_VERIFY,
    CMD_UPDATE_APP_INIT,
    CMD_UPDATE_APP_CHUNK,
    CMD_GET_PUBKEY,
    CMD_STORE_PUBKEY,
    CMD_SET_PUBKEY,
    CMD_ERASE_AREAS,
    CMD_LOAD_APP,
    CMD_LOAD_APP_DATA,
];

const RESPONSES: &[Command] = &[
    RSP_VERIFY,
    RSP_UPDATE_APP_INIT,
    RSP_UPDATE_APP_CHUNK,
    RSP_GET_PUBKEY,
    RSP_STORE_PUBKEY,
    RSP_SET_PUBKEY,
    RSP_ERASE_AREAS,
    RSP_LOAD_APP,
    RSP_LOAD_APP_DATA,
    RSP_LOAD_APP_DATA_READY,
];

/// Verifier protocol revision. Only the reset opcode differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum CatalogRevision {
    /// Reset is opcode 0xfe.
    #[default]
    Current,
    /// Reset is opcode 0x02.
    Legacy,
}

/// Versioned view over the closed command table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandCatalog {
    revision: CatalogRevision,
}

impl CommandCatalog {
    /// Catalog for the given revision.
    pub const fn new(revision: CatalogRevision) -> Self {
        Self { revision }
    }

    /// Revision this catalog describes.
    pub const fn revision(&self) -> CatalogRevision {
        self.revision
    }

    /// The reset command for this revision.
    pub const fn reset(&self) -> Command {
        match self.revision {
            CatalogRevision::Current => CMD_RESET,
            CatalogRevision::Legacy => CMD_RESET_LEGACY,
        }
    }

    /// All entries of one direction.
    pub fn entries(&self, direction: Direction) -> Vec<Command> {
        match direction {
            Direction::Request => {
                let mut all = REQUESTS.to_vec();
                all.push(self.reset());
                all
            },
            Direction::Response => RESPONSES.to_vec(),
        }
    }

    /// Find the entry for an opcode seen on the wire.
    pub fn lookup(&self, opcode: u8, endpoint: Endpoint, direction: Direction) -> Option<Command> {
        self.entries(direction)
            .into_iter()
            .find(|c| c.opcode == opcode && c.endpoint == endpoint)
    }
}

/// What the firmware boots into after a reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum FirmwareResetType {
    /// Whatever the firmware would boot by default.
    StartDefault = 0,
    /// App slot 0 (the verifier).
    StartFlash0 = 1,
    /// App slot 1.
    StartFlash1 = 2,
    /// App slot 0, digest checked by firmware.
    StartFlash0Ver = 3,
    /// App slot 1, digest checked by firmware.
    StartFlash1Ver = 4,
    /// Wait for an app from the client.
    StartClient = 5,
    /// Wait for an app from the client, digest checked by firmware.
    StartClientVer = 6,
}

impl TryFrom<u8> for FirmwareResetType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Self::StartDefault,
            1 => Self::StartFlash0,
            2 => Self::StartFlash1,
            3 => Self::StartFlash0Ver,
            4 => Self::StartFlash1Ver,
            5 => Self::StartClient,
            6 => Self::StartClientVer,
            other => {
                return Err(Error::Config(format!("unknown firmware reset type {other}")));
            },
        })
    }
}

/// Where the verifier goes after it has been started by a reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum VerifierDestination {
    /// Verify and start app slot 1.
    App1 = 0,
    /// Stay in command mode.
    CommandMode = 1,
}

impl TryFrom<u8> for VerifierDestination {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::App1),
            1 => Ok(Self::CommandMode),
            other => Err(Error::Config(format!("unknown verifier destination {other}"))),
        }
    }
}

/// Payload of a reset command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ResetDirective {
    /// Firmware boot target.
    pub firmware: FirmwareResetType,
    /// Verifier destination.
    pub destination: VerifierDestination,
}

impl ResetDirective {
    /// Create a directive.
    pub const fn new(firmware: FirmwareResetType, destination: VerifierDestination) -> Self {
        Self {
            firmware,
            destination,
        }
    }

    /// Reset payload bytes.
    pub const fn payload(&self) -> [u8; 2] {
        [self.firmware as u8, self.destination as u8]
    }
}

//! Error types for tkeymgt.

use std::{fmt, io};

use thiserror::Error;

/// Result type for tkeymgt operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for tkeymgt operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No TKey is attached (or the requested port is not present).
    #[error("No TKey found")]
    DeviceNotFound,

    /// Auto-detection found more than one TKey.
    #[error("More than one TKey found: {}", .0.join(", "))]
    AmbiguousDevice(Vec<String>),

    /// The port exists but could not be opened.
    #[error("Could not open {port}: {reason}")]
    OpenFailed {
        /// Port name/path.
        port: String,
        /// Underlying reason.
        reason: String,
    },

    /// I/O error (transport, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The device did not answer in time.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A frame did not match the request it answers. The session is
    /// desynchronized; this is not a device fault.
    #[error("Protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// The device answered with a non-OK status byte.
    #[error("Device returned status {status:#04x} for {command}")]
    DeviceError {
        /// Name of the command the device rejected.
        command: &'static str,
        /// Raw status byte.
        status: u8,
    },

    /// The signature passed the local check but the on-device verifier
    /// refused it.
    #[error("Device rejected the signature (status {status:#04x})")]
    DeviceRejectedSignature {
        /// Raw status byte returned by the verifier.
        status: u8,
    },

    /// Local signature check or key read-back failed.
    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    /// The requested public key is already installed.
    #[error("Public key already installed")]
    NoOpRotation,

    /// The device refused the upload.
    #[error("Upload rejected at {stage} (status {status:#04x})")]
    UploadRejected {
        /// Which part of the upload was refused.
        stage: UploadStage,
        /// Raw status byte.
        status: u8,
    },

    /// Payload too large for the command's frame length class.
    #[error("Payload of {len} bytes exceeds {capacity} byte capacity of {command}")]
    InvalidPayload {
        /// Command name.
        command: &'static str,
        /// Requested payload length.
        len: usize,
        /// Capacity of the command's frame.
        capacity: usize,
    },

    /// The application image cannot be sent to the device.
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// Malformed signature or public key file.
    #[error("Invalid key file: {0}")]
    InvalidKeyFile(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Part of an app upload a rejection refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStage {
    /// The initial size/digest/signature command.
    Init,
    /// A data chunk (zero-based index).
    Chunk(usize),
}

impl fmt::Display for UploadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "upload init"),
            Self::Chunk(index) => write!(f, "chunk {index}"),
        }
    }
}

/// Top-level operation a [`WorkflowError`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workflow {
    /// Install an app into flash.
    Install,
    /// Load the verifier and boot a verified app.
    Boot,
    /// Erase all storage areas.
    EraseAll,
    /// Replace the trusted public key.
    RotatePublicKey,
    /// Raw reset directive.
    Reset,
}

impl fmt::Display for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Install => "install",
            Self::Boot => "boot",
            Self::EraseAll => "erase",
            Self::RotatePublicKey => "pubkey rotation",
            Self::Reset => "reset",
        })
    }
}

/// Step inside a workflow at which it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Opening the initial session.
    Connect,
    /// Host-side checks of the inputs, before the device is touched.
    Prepare,
    /// Sending the reset directive.
    Reset,
    /// Waiting for the transport to vanish.
    AwaitDisconnect,
    /// Re-opening the transport.
    Reconnect,
    /// Reading the installed public key.
    ReadPublicKey,
    /// Host-side signature check.
    VerifyLocally,
    /// App upload into flash.
    Upload,
    /// Loading the verifier app through the firmware.
    LoadVerifier,
    /// Handing a public key to the running verifier.
    SetPublicKey,
    /// Verifier-side signature check.
    VerifyOnDevice,
    /// Loading the verified app through the firmware.
    LoadApp,
    /// Erasing storage areas.
    Erase,
    /// Storing a new public key.
    StorePublicKey,
    /// Reading the public key back after storing it.
    ReadBack,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connect => "connect",
            Self::Prepare => "input check",
            Self::Reset => "reset",
            Self::AwaitDisconnect => "await disconnect",
            Self::Reconnect => "reconnect",
            Self::ReadPublicKey => "read public key",
            Self::VerifyLocally => "local signature check",
            Self::Upload => "upload",
            Self::LoadVerifier => "load verifier",
            Self::SetPublicKey => "set public key",
            Self::VerifyOnDevice => "device signature check",
            Self::LoadApp => "load app",
            Self::Erase => "erase",
            Self::StorePublicKey => "store public key",
            Self::ReadBack => "public key read-back",
        })
    }
}

/// Failure of a provisioning workflow, with the step it happened in.
#[derive(Debug, Error)]
#[error("{workflow} failed at {step}")]
pub struct WorkflowError {
    /// Workflow that failed.
    pub workflow: Workflow,
    /// Step that failed.
    pub step: Step,
    /// Underlying error.
    #[source]
    pub source: Error,
}

impl WorkflowError {
    /// The underlying error kind.
    pub fn error(&self) -> &Error {
        &self.source
    }

    /// Whether the failure means no device could be reached.
    pub fn is_device_absent(&self) -> bool {
        matches!(
            self.source,
            Error::DeviceNotFound | Error::AmbiguousDevice(_) | Error::OpenFailed { .. }
        )
    }

    /// Whether the device was reached but refused the operation.
    pub fn is_device_rejection(&self) -> bool {
        matches!(
            self.source,
            Error::DeviceError { .. }
                | Error::DeviceRejectedSignature { .. }
                | Error::UploadRejected { .. }
        )
    }
}

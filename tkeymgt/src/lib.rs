//! # tkeymgt
//!
//! A library for provisioning apps on Tillitis TKey devices.
//!
//! This crate talks the TKey framing protocol to the device's verifier app
//! and firmware over USB serial, including:
//!
//! - Installing a signed app into flash
//! - Booting an app through the on-device verifier
//! - Rotating the verifier's trusted public key
//! - Erasing the device's storage areas
//!
//! All of these reset the device at least once. A reset makes the serial
//! port disappear, so the session layer waits for it to close and
//! rediscovers the device before continuing.
//!
//! ## Features
//!
//! - `native` (default): Serial port support via the `serialport` crate
//! - `serde`: Serialization support for configuration and discovery types
//!
//! ## Example
//!
//! ```rust,no_run
//! use tkeymgt::{Locator, NativeConnector, ProvisionConfig, Provisioner, sigfile};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = sigfile::read_image_file("app.bin")?;
//!     let signature = sigfile::read_signature_file("app.bin.sig")?;
//!
//!     let mut provisioner =
//!         Provisioner::new(NativeConnector::default(), Locator::Auto, ProvisionConfig::default());
//!     provisioner.install(&image, &signature)?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod device;
pub mod error;
pub mod port;
pub mod protocol;
pub mod provision;
pub mod session;
pub mod sigfile;
pub mod signature;
pub mod upload;

// Re-exports for convenience
// Native-specific re-exports
#[cfg(feature = "native")]
pub use {
    port::NativePort,
    session::NativeConnector,
};
pub use {
    device::{DetectedPort, DeviceKind, auto_detect_port, detect_ports},
    error::{Error, Result, Step, UploadStage, Workflow, WorkflowError},
    port::{Port, SerialConfig},
    protocol::{
        CatalogRevision, CommandCatalog, FirmwareResetType, ResetDirective, TransactionId,
        VerifierDestination,
    },
    provision::{
        PresenceConfirmation, ProvisionConfig, ProvisionEvent, ProvisionState, Provisioner,
        ResetSync, WorkflowResult,
    },
    session::{Connector, DeviceSession, Locator, SessionState},
    signature::{Digest, PublicKey, Signature},
    upload::BinaryChunker,
};

//! Protocol implementations.

pub mod catalog;
pub mod firmware;
pub mod frame;

// Re-export common types
pub use {
    catalog::{
        CMD_ERASE_AREAS, CMD_GET_PUBKEY, CMD_SET_PUBKEY, CMD_STORE_PUBKEY, CMD_UPDATE_APP_CHUNK,
        CMD_UPDATE_APP_INIT, CMD_VERIFY, CatalogRevision, Command, CommandCatalog, Direction,
        Endpoint, FirmwareResetType, FrameLen, RSP_ERASE_AREAS, RSP_GET_PUBKEY, RSP_SET_PUBKEY,
        RSP_STORE_PUBKEY, RSP_UPDATE_APP_CHUNK, RSP_UPDATE_APP_INIT, RSP_VERIFY, ResetDirective,
        VerifierDestination,
    },
    frame::{Frame, FrameHeader, Reply, STATUS_OK, TransactionId, decode, encode},
};

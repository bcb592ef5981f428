//! Loading an app into RAM through the device firmware.
//!
//! After a reset into `StartClient` the firmware waits for an app: a
//! `load app` command announcing the size, then the binary in 127-byte
//! chunks. The reply to the last chunk carries the digest the firmware
//! computed, which has to match ours before the app is trusted to be the one
//! we sent.

use {
    super::{
        catalog::{
            CMD_LOAD_APP, CMD_LOAD_APP_DATA, RSP_LOAD_APP, RSP_LOAD_APP_DATA,
            RSP_LOAD_APP_DATA_READY,
        },
        frame::TransactionId,
    },
    crate::{
        error::{Error, Result},
        port::Port,
        session::DeviceSession,
        signature::{DIGEST_LEN, Digest},
        upload::{MAX_CHUNK_SIZE, check_image, segment_count, segments},
    },
    byteorder::{ByteOrder, LittleEndian},
    log::debug,
    std::time::Duration,
};

/// Load `image` through the firmware using transaction `id`.
///
/// Returns the digest both sides agreed on.
pub fn load_app<P: Port>(
    session: &mut DeviceSession<P>,
    id: TransactionId,
    image: &[u8],
    timeout: Option<Duration>,
) -> Result<Digest> {
    let previous = session.transaction_id();
    session.set_transaction_id(id);
    let result = load(session, image, timeout);
    session.set_transaction_id(previous);
    result
}

fn load<P: Port>(
    session: &mut DeviceSession<P>,
    image: &[u8],
    timeout: Option<Duration>,
) -> Result<Digest> {
    check_image(image)?;
    let size = u32::try_from(image.len())
        .map_err(|_| Error::InvalidImage(format!("image of {} bytes too large", image.len())))?;

    // size, no user-supplied secret, zeroed secret digest
    let mut announce = [0u8; 4 + 1 + DIGEST_LEN];
    LittleEndian::write_u32(&mut announce[..4], size);
    session.exchange(CMD_LOAD_APP, RSP_LOAD_APP, &announce, timeout)?;

    let local = Digest::compute(image);
    let count = segment_count(image.len(), MAX_CHUNK_SIZE);
    debug!("Loading {size} byte app in {count} chunks");

    for (index, chunk) in segments(image, MAX_CHUNK_SIZE).enumerate() {
        if index + 1 < count {
            session.exchange(CMD_LOAD_APP_DATA, RSP_LOAD_APP_DATA, chunk, timeout)?;
            continue;
        }

        let reply = session.exchange(CMD_LOAD_APP_DATA, RSP_LOAD_APP_DATA_READY, chunk, timeout)?;
        let reported = reply.body().get(..DIGEST_LEN).ok_or_else(|| {
            Error::ProtocolMismatch("load app data ready without digest".to_string())
        })?;
        if reported != local.as_bytes() {
            return Err(Error::VerificationFailed(
                "digest reported by firmware does not match the app".to_string(),
            ));
        }
    }

    Ok(local)
}

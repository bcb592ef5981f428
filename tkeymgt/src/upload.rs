//! Chunked app upload into flash.
//!
//! An upload is one `update app init` command carrying the image length,
//! digest and signature, followed by the image in chunks of at most 127
//! bytes. Each command waits for an OK before the next is sent.

use {
    crate::{
        error::{Error, Result, UploadStage},
        port::Port,
        protocol::{
            CMD_UPDATE_APP_CHUNK, CMD_UPDATE_APP_INIT, RSP_UPDATE_APP_CHUNK, RSP_UPDATE_APP_INIT,
        },
        session::DeviceSession,
        signature::{DIGEST_LEN, Digest, SIGNATURE_LEN, Signature},
    },
    byteorder::{ByteOrder, LittleEndian},
    log::{debug, info},
    std::time::Duration,
};

/// Largest chunk a 128-byte frame can carry.
pub const MAX_CHUNK_SIZE: usize = 127;

/// Largest app the device can hold.
pub const MAX_APP_SIZE: usize = 128 * 1024;

/// Reject images the device cannot take.
pub fn check_image(image: &[u8]) -> Result<()> {
    if image.is_empty() {
        return Err(Error::InvalidImage("image is empty".to_string()));
    }
    if image.len() > MAX_APP_SIZE {
        return Err(Error::InvalidImage(format!(
            "image is {} bytes, the device takes at most {MAX_APP_SIZE}",
            image.len()
        )));
    }
    Ok(())
}

/// Split `image` into consecutive segments of at most `size` bytes.
///
/// # Panics
///
/// Panics if `size` is zero.
pub fn segments(image: &[u8], size: usize) -> std::slice::Chunks<'_, u8> {
    image.chunks(size)
}

/// Number of segments `segments(image, size)` yields for `len` bytes.
pub const fn segment_count(len: usize, size: usize) -> usize {
    len.div_ceil(size)
}

/// Drives the init + chunk sequence of an app upload.
///
/// Chunks are always [`MAX_CHUNK_SIZE`] bytes except the last: the verifier
/// writes the full frame payload to flash, padding included.
#[derive(Debug, Clone, Default)]
pub struct BinaryChunker {
    init_timeout: Option<Duration>,
    chunk_timeout: Option<Duration>,
}

impl BinaryChunker {
    /// Chunker without response timeouts.
    pub fn new() -> Self {
        Self::default()
    }

    /// How long to wait for the init response. The device only answers
    /// after the user confirmed with touches.
    #[must_use]
    pub fn with_init_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.init_timeout = timeout;
        self
    }

    /// How long to wait for each chunk response.
    #[must_use]
    pub fn with_chunk_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.chunk_timeout = timeout;
        self
    }

    /// Upload `image` with its `digest` and `signature`.
    ///
    /// `progress` is called with `(bytes_sent, total)` after every
    /// acknowledged chunk. Returns only after the last chunk is acknowledged.
    pub fn upload<P: Port>(
        &self,
        session: &mut DeviceSession<P>,
        image: &[u8],
        digest: &Digest,
        signature: &Signature,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<()> {
        check_image(image)?;
        let total = image.len();
        let size = u32::try_from(total)
            .map_err(|_| Error::InvalidImage(format!("image of {total} bytes too large")))?;

        let mut init = [0u8; 4 + DIGEST_LEN + SIGNATURE_LEN];
        LittleEndian::write_u32(&mut init[..4], size);
        init[4..4 + DIGEST_LEN].copy_from_slice(digest.as_bytes());
        init[4 + DIGEST_LEN..].copy_from_slice(&signature.bytes);

        debug!("Upload init: {total} bytes, digest {digest:?}");
        session
            .exchange(CMD_UPDATE_APP_INIT, RSP_UPDATE_APP_INIT, &init, self.init_timeout)
            .map_err(|e| rejected(e, UploadStage::Init))?;

        let count = segment_count(total, MAX_CHUNK_SIZE);
        let mut sent = 0;
        for (index, chunk) in segments(image, MAX_CHUNK_SIZE).enumerate() {
            session
                .exchange(
                    CMD_UPDATE_APP_CHUNK,
                    RSP_UPDATE_APP_CHUNK,
                    chunk,
                    self.chunk_timeout,
                )
                .map_err(|e| rejected(e, UploadStage::Chunk(index)))?;
            sent += chunk.len();
            progress(sent, total);
        }

        info!("Uploaded {total} bytes in {count} chunks");
        Ok(())
    }
}

fn rejected(error: Error, stage: UploadStage) -> Error {
    match error {
        Error::DeviceError { status, .. } => Error::UploadRejected { stage, status },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segments_are_lossless_and_ordered() {
        let image: Vec<u8> = (0..1000u32).map(|i| (i * 7 % 256) as u8).collect();
        for size in [1, 5, 64, 127] {
            let parts: Vec<&[u8]> = segments(&image, size).collect();
            assert_eq!(parts.len(), segment_count(image.len(), size));
            assert!(parts.iter().all(|p| !p.is_empty() && p.len() <= size));
            assert_eq!(parts.concat(), image);
        }
    }

    #[test]
    fn test_segment_sizes_for_300_bytes() {
        let image = [0u8; 300];
        let sizes: Vec<usize> = segments(&image, 127).map(<[u8]>::len).collect();
        assert_eq!(sizes, vec![127, 127, 46]);
        assert_eq!(segment_count(127, 127), 1);
        assert_eq!(segment_count(128, 127), 2);
    }

    #[test]
    fn test_check_image() {
        assert!(matches!(check_image(&[]), Err(Error::InvalidImage(_))));
        assert!(check_image(&[0u8; MAX_APP_SIZE]).is_ok());
        assert!(check_image(&vec![0u8; MAX_APP_SIZE + 1]).is_err());
    }

    #[test]
    fn test_device_error_becomes_upload_rejection() {
        let err = rejected(
            Error::DeviceError {
                command: "update app chunk",
                status: 1,
            },
            UploadStage::Chunk(2),
        );
        assert!(matches!(
            err,
            Error::UploadRejected {
                stage: UploadStage::Chunk(2),
                status: 1
            }
        ));
        assert!(matches!(
            rejected(Error::Timeout("x".into()), UploadStage::Init),
            Error::Timeout(_)
        ));
    }
}

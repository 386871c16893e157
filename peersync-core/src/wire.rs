//! Stream framing for envelopes. Each frame is a little-endian `u32` payload length followed
//! by the envelope as JSON.

use crate::protocol::Envelope;

pub const LEN_SIZE: usize = 4;
/// Largest payload either side will write or accept.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("envelope is not serializable: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("envelope exceeds the 16 MiB limit")]
    TooLarge,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    /// The buffer holds less than one frame; read more and retry from the same offset.
    #[error("incomplete frame")]
    NeedMore,
    #[error("declared frame length exceeds the 16 MiB limit")]
    TooLarge,
    #[error("frame payload is not an envelope: {0}")]
    Decode(#[from] serde_json::Error),
}

pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = serde_json::to_vec(envelope)?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or(FrameEncodeError::TooLarge)?;
    let mut frame = Vec::with_capacity(LEN_SIZE + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Payload length announced by the header at the front of `bytes`, if the header is complete.
pub fn frame_len(bytes: &[u8]) -> Option<usize> {
    let header: [u8; LEN_SIZE] = bytes.get(..LEN_SIZE)?.try_into().ok()?;
    Some(u32::from_le_bytes(header) as usize)
}

/// Parse the first frame in `bytes`, returning the envelope and the frame's total size.
/// An oversized header is rejected before its payload arrives.
pub fn decode_frame(bytes: &[u8]) -> Result<(Envelope, usize), FrameDecodeError> {
    let len = frame_len(bytes).ok_or(FrameDecodeError::NeedMore)?;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge);
    }
    let end = LEN_SIZE + len;
    let payload = bytes.get(LEN_SIZE..end).ok_or(FrameDecodeError::NeedMore)?;
    Ok((serde_json::from_slice(payload)?, end))
}

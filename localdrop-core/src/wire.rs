//! Encoding: JSON envelopes on the rendezvous channel, JSON text frames on
//! data channels.

use crate::protocol::{Envelope, StreamFrame};

/// Largest envelope accepted from the rendezvous channel.
pub const MAX_ENVELOPE_LEN: usize = 64 * 1024;

/// Encode an envelope for publishing.
pub fn encode_envelope(env: &Envelope) -> Result<Vec<u8>, WireError> {
    let out = serde_json::to_vec(env)?;
    if out.len() > MAX_ENVELOPE_LEN {
        return Err(WireError::TooLarge(out.len()));
    }
    Ok(out)
}

/// Decode one envelope. Unknown `type` values and missing fields are errors.
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, WireError> {
    if bytes.len() > MAX_ENVELOPE_LEN {
        return Err(WireError::TooLarge(bytes.len()));
    }
    Ok(serde_json::from_slice(bytes)?)
}

/// Encode a stream frame as a text message.
pub fn encode_frame(frame: &StreamFrame) -> Result<String, WireError> {
    Ok(serde_json::to_string(frame)?)
}

pub fn decode_frame(text: &str) -> Result<StreamFrame, WireError> {
    Ok(serde_json::from_str(text)?)
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("envelope too large ({0} bytes)")]
    TooLarge(usize),
}

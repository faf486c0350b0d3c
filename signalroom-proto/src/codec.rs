//! JSON text encoding for signaling messages.

use crate::signal::{Signal, SignalKind};

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The text is not a JSON object with a known `type`, or a field has the
    /// wrong shape.
    #[error("invalid signal: {0}")]
    Json(#[from] serde_json::Error),
    /// A message that names a room arrived without one.
    #[error("`{kind}` message is missing a non-empty `room` field")]
    MissingRoom {
        /// Kind of the offending message.
        kind: SignalKind,
    },
}

/// Encodes a [`Signal`] as a JSON text frame.
///
/// # Errors
///
/// Returns [`CodecError::Json`] if a payload value cannot be serialized.
pub fn encode(signal: &Signal) -> Result<String, CodecError> {
    Ok(serde_json::to_string(signal)?)
}

/// Decodes a JSON text frame into a [`Signal`].
///
/// A `join` must name a non-empty room. Nothing else is validated: payload
/// fields are accepted whatever their shape.
///
/// # Errors
///
/// Returns [`CodecError::Json`] for unparseable text or a missing or unknown
/// `type`; [`CodecError::MissingRoom`] for a `join` without a string room.
pub fn decode(text: &str) -> Result<Signal, CodecError> {
    let signal: Signal = serde_json::from_str(text)?;
    if signal.kind == SignalKind::Join && signal.room.as_deref().is_none_or(str::is_empty) {
        return Err(CodecError::MissingRoom { kind: signal.kind });
    }
    Ok(signal)
}

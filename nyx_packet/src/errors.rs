/*! Errors for sealed packet payloads.
*/

use nom::error::ErrorKind;
use thiserror::Error;

/// Error that can happen when calling `get_payload`/`open` of a packet.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum GetPayloadError {
    /// Received payload of an encrypted packet can't be decrypted.
    #[error("Decrypt payload error")]
    Decrypt,
    /// Decrypted payload of a packet can't be parsed.
    #[error("Deserialize payload error: {error:?}")]
    Deserialize {
        /// Parsing error.
        error: nom::Err<(Vec<u8>, ErrorKind)>,
    },
}

impl GetPayloadError {
    pub(crate) fn decrypt() -> GetPayloadError {
        GetPayloadError::Decrypt
    }

    pub(crate) fn deserialize(e: nom::Err<(&[u8], ErrorKind)>) -> GetPayloadError {
        GetPayloadError::Deserialize { error: e.to_owned() }
    }
}

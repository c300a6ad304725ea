/// Errors that can occur while operating on the ratchet tree or on packets.
#[derive(thiserror::Error, Debug, Clone, Eq, PartialEq)]
pub enum Error {
    /// Not enough bytes, or an invalid length, while parsing a wire structure.
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// The operation is not allowed in the current state of the value.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Required key material is missing for a cryptographic operation.
    #[error("Cryptographic precondition failed: {0}")]
    CryptoPrecondition(String),

    /// A signature or sender identity did not check out.
    #[error("Authentication failed: {0}")]
    AuthenticationFailure(String),

    /// Random number generation failed.
    #[error("Random number generation failed")]
    Random,
}

impl From<ed25519_dalek::SignatureError> for Error {
    fn from(value: ed25519_dalek::SignatureError) -> Self {
        Self::AuthenticationFailure(value.to_string())
    }
}

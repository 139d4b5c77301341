use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("encryption failed: {0}")]
    EncryptionError(String),

    #[error("decryption failed: {0}")]
    DecryptionError(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("ratchet session error: {0}")]
    SessionError(String),

    #[error("too many skipped messages (limit {max}, requested {requested})")]
    TooManySkipped { max: u32, requested: u32 },

    #[error("key storage error: {0}")]
    StorageError(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

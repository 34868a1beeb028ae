/// Errors that can occur during blob storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The requested blob was not found.
    #[error("blob not found: {0}")]
    NotFound(String),
    /// An I/O error occurred.
    #[error("storage IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The provided content hash is invalid.
    #[error("invalid content hash: {0}")]
    InvalidHash(String),
    /// The blob exceeds the configured size limit (or the declared length).
    #[error("blob exceeds size limit ({actual} > {limit} bytes)")]
    SizeLimitExceeded { actual: u64, limit: u64 },
    /// The source ended before the declared length was reached.
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: u64, actual: u64 },
    /// The computed digest differs from the digest the caller declared.
    #[error("content hash mismatch: expected {expected}, computed {actual}")]
    HashMismatch { expected: String, actual: String },
    /// A blob with the same digest but a different length already exists.
    #[error("length mismatch for blob {hash}: stored {stored} bytes, incoming {incoming} bytes")]
    LengthMismatch {
        hash: String,
        stored: u64,
        incoming: u64,
    },
}

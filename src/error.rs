//! Error taxonomy for the relay core.
//!
//! Each error is contained to the message, event, or connection that produced
//! it. None of them terminate the process.

/// Malformed top-level client message. Reported back as a `NOTICE`.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The frame was not valid JSON.
    #[error("invalid message: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// The frame was JSON but not an array.
    #[error("message is not a JSON array")]
    NotAnArray,

    /// The array was empty or its first element was not a string.
    #[error("message has no command")]
    MissingCommand,

    /// A known command was missing a required argument.
    #[error("{command} requires {what}")]
    MissingArgument {
        /// Command name, e.g. `REQ`.
        command: &'static str,
        /// Description of the missing argument.
        what: &'static str,
    },
}

/// A single filter inside a `REQ` could not be understood.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("filter is not a JSON object")]
    NotAnObject,

    #[error("invalid `{field}`: {reason}")]
    InvalidField {
        /// Offending key, e.g. `kinds` or `#e`.
        field: String,
        /// Human readable reason.
        reason: &'static str,
    },
}

/// An event failed structural parsing or cryptographic verification.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("malformed event: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("tag {index} is empty")]
    EmptyTag {
        /// Position of the tag in the event's tag list.
        index: usize,
    },

    #[error("`{field}` is not {expected} lowercase hex characters")]
    InvalidHex {
        /// Field name as it appears on the wire.
        field: &'static str,
        /// Expected number of hex characters.
        expected: usize,
    },

    #[error("event id does not match its content hash")]
    IdMismatch,

    #[error("bad signature: {0}")]
    BadSignature(#[from] secp256k1::Error),
}

/// Persistence failure. The affected event is treated as rejected.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("stored event is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("stored event failed verification: {0}")]
    Invalid(#[from] ValidationError),

    #[error("storage lock poisoned")]
    Poisoned,

    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

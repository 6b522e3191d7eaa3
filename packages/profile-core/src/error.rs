//! # Error Handling
//!
//! Error types for the profile core.
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                      │
//! │  │                                                                      │
//! │  ├── Address Errors                                                     │
//! │  │   ├── InvalidAddress        - No identifier / malformed E.164        │
//! │  │   └── AddressConflict       - Identifiers cannot be reconciled      │
//! │  │                                                                      │
//! │  ├── Profile Errors                                                     │
//! │  │   ├── NotFound              - No record for the address             │
//! │  │   └── InvalidProfile        - Write failed validation               │
//! │  │                                                                      │
//! │  ├── Crypto Errors                                                      │
//! │  │   ├── DecryptFailure        - Envelope could not be decrypted       │
//! │  │   ├── EncryptionFailed      - Envelope could not be sealed          │
//! │  │   └── InvalidKey            - Profile key has the wrong length      │
//! │  │                                                                      │
//! │  ├── Storage Errors                                                     │
//! │  │   ├── PersistFailure        - A write could not be persisted        │
//! │  │   ├── TransactionAborted    - Commit failed, rolled back            │
//! │  │   ├── CorruptRecord         - Stored row fails schema checks        │
//! │  │   └── Database              - Any other SQLite failure              │
//! │  │                                                                      │
//! │  └── Fetch Errors                                                       │
//! │      ├── Suppressed            - Dropped by the main-app-only filter   │
//! │      ├── Throttled             - Fresh data asked for inside cooldown  │
//! │      ├── Unavailable           - Coordinator closed                    │
//! │      ├── Network / Timeout     - Transient, drives back-off            │
//! │      └── Cancelled             - Last subscriber went away             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `Error` is `Clone`: a single fetch outcome is handed to every subscriber
//! of the coalesced request.

use thiserror::Error;

/// Result type alias for profile core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the profile core
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // ========================================================================
    // Address Errors (100-199)
    // ========================================================================
    /// The address is malformed or has no identifier at all
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Two addresses carry identifiers that cannot belong to the same user
    #[error("Address conflict: {0}")]
    AddressConflict(String),

    // ========================================================================
    // Profile Errors (200-299)
    // ========================================================================
    /// No profile record exists for the address
    #[error("Profile not found: {0}")]
    NotFound(String),

    /// A profile write failed validation
    #[error("Invalid profile: {0}")]
    InvalidProfile(String),

    // ========================================================================
    // Crypto Errors (300-399)
    // ========================================================================
    /// The profile envelope could not be decrypted (stale or missing key)
    #[error("Failed to decrypt profile: {0}")]
    DecryptFailure(String),

    /// The profile envelope could not be encrypted
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Invalid key format or length
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    // ========================================================================
    // Storage Errors (400-499)
    // ========================================================================
    /// A write could not be persisted; the caller may retry
    #[error("Failed to persist profile: {0}")]
    PersistFailure(String),

    /// The transaction was rolled back
    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    /// A stored row failed schema checks
    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    // ========================================================================
    // Fetch Errors (500-599)
    // ========================================================================
    /// Request dropped because it is main-app-only and we run in an extension
    #[error("Profile fetch suppressed outside the main app.")]
    Suppressed,

    /// Fresh data was requested inside the cooldown window
    #[error("Profile fetch throttled.")]
    Throttled,

    /// The fetch coordinator has been closed
    #[error("Profile fetching is unavailable.")]
    Unavailable,

    /// Transient network failure
    #[error("Network error: {0}")]
    Network(String),

    /// The network collaborator timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The fetch was cancelled before it committed
    #[error("Profile fetch cancelled.")]
    Cancelled,

    // ========================================================================
    // Internal Errors (900-999)
    // ========================================================================
    /// Internal error (should not happen in normal operation)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Get the numeric error code
    ///
    /// Error codes are organized by category:
    /// - 100-199: Address
    /// - 200-299: Profile
    /// - 300-399: Crypto
    /// - 400-499: Storage
    /// - 500-599: Fetch
    /// - 900-999: Internal
    pub fn code(&self) -> i32 {
        match self {
            // Address (100-199)
            Error::InvalidAddress(_) => 100,
            Error::AddressConflict(_) => 101,

            // Profile (200-299)
            Error::NotFound(_) => 200,
            Error::InvalidProfile(_) => 201,

            // Crypto (300-399)
            Error::DecryptFailure(_) => 300,
            Error::EncryptionFailed(_) => 301,
            Error::InvalidKey(_) => 302,

            // Storage (400-499)
            Error::PersistFailure(_) => 400,
            Error::TransactionAborted(_) => 401,
            Error::CorruptRecord(_) => 402,
            Error::Database(_) => 403,

            // Fetch (500-599)
            Error::Suppressed => 500,
            Error::Throttled => 501,
            Error::Unavailable => 502,
            Error::Network(_) => 503,
            Error::Timeout(_) => 504,
            Error::Cancelled => 505,

            // Internal (900-999)
            Error::Internal(_) => 900,
            Error::Serialization(_) => 901,
        }
    }

    /// Check if this error is recoverable
    ///
    /// Recoverable errors may succeed when retried later. A decrypt failure
    /// is deliberately not recoverable: the profile key has to be rotated
    /// by a higher layer first.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Network(_)
                | Error::Timeout(_)
                | Error::PersistFailure(_)
                | Error::TransactionAborted(_)
        )
    }

    /// Whether a failed fetch with this error should start a back-off window
    pub(crate) fn starts_backoff(&self) -> bool {
        matches!(
            self,
            Error::Network(_)
                | Error::Timeout(_)
                | Error::NotFound(_)
                | Error::DecryptFailure(_)
                | Error::InvalidProfile(_)
        )
    }
}

// ============================================================================
// ERROR CONVERSIONS
// ============================================================================

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

// ============================================================================
// TESTS
// ============================================================================

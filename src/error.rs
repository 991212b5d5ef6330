//! Error types
//!
//! Validation errors are returned to whoever issued a command. Platform and
//! storage errors are caught at the boundary, logged, and handled by a
//! fallback; they never stop the background timers.

use thiserror::Error;

/// Rejected command input. The message is shown to the caller as-is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("End time must be in the future")]
    EndTimeInPast,

    #[error("Duration must be at least {min_secs} seconds")]
    DurationTooShort { min_secs: i64 },

    #[error("Duration must be at most {max_secs} seconds")]
    DurationTooLong { max_secs: i64 },

    #[error("Winner count must be between 1 and {max}")]
    WinnerCount { max: u32 },

    #[error("Too many active giveaways (limit {limit})")]
    TooManyActive { limit: usize },

    #[error("Giveaway not found: {0}")]
    NotFound(String),

    #[error("Giveaway {0} has already ended")]
    AlreadyEnded(String),

    #[error("Giveaway {0} is not an invite giveaway")]
    NotInviteGiveaway(String),

    #[error("Giveaway {0} does not accept direct entries")]
    NotClassicGiveaway(String),

    #[error("Already entered giveaway {0}")]
    AlreadyEntered(String),

    #[error("Entry requirement not met: {0}")]
    RequirementNotMet(String),

    #[error("Invalid setting: {0}")]
    InvalidSetting(String),

    #[error("Could not create invite link: {0}")]
    InviteUnavailable(String),
}

/// Failure talking to the chat platform.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// The channel, message, member or invite no longer resolves.
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected response {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Platform error: {0}")]
    Other(String),
}

impl PlatformError {
    /// Stale external references are cleared instead of retried.
    pub fn is_not_found(&self) -> bool {
        matches!(self, PlatformError::NotFound(_))
    }
}

/// Failure in a persistence backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Other(String),
}

pub type PlatformResult<T> = Result<T, PlatformError>;
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_messages_are_descriptive() {
        assert_eq!(
            ValidationError::MissingField("title").to_string(),
            "title is required"
        );
        assert_eq!(
            ValidationError::WinnerCount { max: 20 }.to_string(),
            "Winner count must be between 1 and 20"
        );
    }

    #[test]
    fn test_not_found_detection() {
        assert!(PlatformError::NotFound("message 1".into()).is_not_found());
        assert!(!PlatformError::Forbidden("channel 1".into()).is_not_found());
    }
}

//! Error taxonomy for the stage engine

use thiserror::Error;

/// Result type used across the engine
pub type Result<T> = std::result::Result<T, EngineError>;

/// Every failure is scoped to a single operation and surfaced to the caller.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Type-level gate closed, or its deadline has passed
    #[error("Stage locked: {0}")]
    StageLocked(String),

    /// Attempted state change outside the allowed edge set
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// A non-proposal defense has no evaluator panel yet
    #[error("Panel not allocated for defense {0}")]
    PanelNotAllocated(uuid::Uuid),

    /// Monthly filing attempted before all weekly meetings were recorded
    #[error("Meetings incomplete for month {month}: {recorded} of 4 recorded, {missing} more needed")]
    MeetingsIncomplete { month: u8, recorded: usize, missing: usize },

    /// A meeting for the same (group, month, week) already exists
    #[error("Duplicate meeting record for month {month}, week {week}")]
    DuplicateMeetingRecord { month: u8, week: u8 },

    /// Defense scheduled in the past or before its prerequisite stage
    #[error("Invalid defense sequencing: {0}")]
    InvalidDefenseSequencing(String),

    /// The group's results are published and frozen
    #[error("Results already published for group {0}")]
    ResultsAlreadyPublished(uuid::Uuid),

    /// No compiled results are available to publish
    #[error("Nothing to publish")]
    NothingToPublish,

    /// Malformed input
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// Referenced entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The authorization provider denied the operation
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl EngineError {
    /// True for conditions the caller can act on (everything except infrastructure failures).
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            EngineError::Database(_)
                | EngineError::Migration(_)
                | EngineError::Config(_)
                | EngineError::Io(_)
                | EngineError::Csv(_)
        )
    }

    /// Stable machine-readable code for callers that branch on the condition.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::StageLocked(_) => "stage_locked",
            EngineError::InvalidTransition(_) => "invalid_transition",
            EngineError::PanelNotAllocated(_) => "panel_not_allocated",
            EngineError::MeetingsIncomplete { .. } => "meetings_incomplete",
            EngineError::DuplicateMeetingRecord { .. } => "duplicate_meeting_record",
            EngineError::InvalidDefenseSequencing(_) => "invalid_defense_sequencing",
            EngineError::ResultsAlreadyPublished(_) => "results_already_published",
            EngineError::NothingToPublish => "nothing_to_publish",
            EngineError::ValidationFailed(_) => "validation_failed",
            EngineError::NotFound(_) => "not_found",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::Database(_) => "database",
            EngineError::Migration(_) => "migration",
            EngineError::Config(_) => "config",
            EngineError::Io(_) => "io",
            EngineError::Csv(_) => "csv",
        }
    }
}

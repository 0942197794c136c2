//! Error handling for catchall
//!
//! This module provides error types and result aliases for state machine,
//! snapshot and aggregation operations.

use std::io;
use thiserror::Error;

/// Errors that can occur in catchall operations
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed command invocation (argument count or argument values)
    #[error("Wrong arguments: {0}")]
    WrongArguments(String),

    /// Command name not recognised by the state machine
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// Extract requested outside the allowed epoch window
    #[error("Invalid extraction: {0}")]
    InvalidExtraction(String),

    /// Epoch token could not be decoded or epoch arithmetic overflowed
    #[error("Invalid epoch: {0}")]
    InvalidEpoch(String),

    /// Snapshot bytes are truncated or malformed
    #[error("Corrupt snapshot: {0}")]
    CorruptSnapshot(String),

    /// A shard call failed during aggregation
    #[error("Shard {shard} unavailable: {message}")]
    ShardUnavailable {
        shard: usize,
        message: String,
    },

    /// Errors related to the command log
    #[error("Command log error: {0}")]
    Wal(String),

    /// Errors related to the downstream domain store
    #[error("Store error: {0}")]
    Store(String),

    /// Errors related to configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors related to I/O operations
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Errors related to serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error type for other cases
    #[error("{0}")]
    Other(String),
}

/// Result type for catchall operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new wrong arguments error
    pub fn wrong_arguments(message: impl Into<String>) -> Self {
        Self::WrongArguments(message.into())
    }

    /// Create a new unknown command error
    pub fn unknown_command(name: impl Into<String>) -> Self {
        Self::UnknownCommand(name.into())
    }

    /// Create a new invalid extraction error
    pub fn invalid_extraction(message: impl Into<String>) -> Self {
        Self::InvalidExtraction(message.into())
    }

    /// Create a new invalid epoch error
    pub fn invalid_epoch(message: impl Into<String>) -> Self {
        Self::InvalidEpoch(message.into())
    }

    /// Create a new corrupt snapshot error
    pub fn corrupt_snapshot(message: impl Into<String>) -> Self {
        Self::CorruptSnapshot(message.into())
    }

    /// Create a new shard unavailable error
    pub fn shard_unavailable(shard: usize, message: impl Into<String>) -> Self {
        Self::ShardUnavailable {
            shard,
            message: message.into(),
        }
    }

    /// Create a new command log error
    pub fn wal(message: impl Into<String>) -> Self {
        Self::Wal(message.into())
    }

    /// Create a new store error
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    /// Create a new configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a new generic error
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    /// Check if this error was raised while validating a command.
    ///
    /// Command errors are returned to the issuing client and never change
    /// replicated state.
    pub fn is_command_error(&self) -> bool {
        matches!(
            self,
            Self::WrongArguments(_)
                | Self::UnknownCommand(_)
                | Self::InvalidExtraction(_)
                | Self::InvalidEpoch(_)
        )
    }

    /// Check if this is a corrupt snapshot error
    pub fn is_corrupt_snapshot(&self) -> bool {
        matches!(self, Self::CorruptSnapshot(_))
    }

    /// Check if this is a shard unavailable error
    pub fn is_shard_unavailable(&self) -> bool {
        matches!(self, Self::ShardUnavailable { .. })
    }

    /// Check if this is an I/O error
    pub fn is_io_error(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    /// Check if the error must stop a replica from serving.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::CorruptSnapshot(_))
    }

    /// Get a user-friendly suggestion for resolving the error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::CorruptSnapshot(_) => {
                Some("Snapshot is unreadable. Restore the replica from a healthy peer".to_string())
            }
            Self::ShardUnavailable { .. } => {
                Some("The aggregation cycle will be retried on the next interval".to_string())
            }
            Self::Io(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                Some("You don't have permission to access the data directory".to_string())
            }
            Self::Config(_) => Some("Check the configuration file values".to_string()),
            _ => None,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Self::Wal(format!("Bincode error: {}", err))
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for drydock-core.
//!
//! Provides a unified error type with stable machine-readable codes.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur while reading or mutating platform records.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// A record was not found in the store.
    NotFound {
        /// The entity kind (service, deploy, plan, network).
        entity: &'static str,
        /// The identifier that was not found.
        id: String,
    },

    /// The service is in a gate state and the requested transition is rejected.
    StatusConflict {
        /// The service ID.
        service_id: String,
        /// The status the service is currently in.
        status: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// JSON encoding or decoding failed.
    SerializationError {
        /// What was being encoded or decoded.
        context: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::StatusConflict { .. } => "STATUS_CONFLICT",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
            Self::SerializationError { .. } => "SERIALIZATION_ERROR",
        }
    }

    /// True when the error is a gate-state rejection.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::StatusConflict { .. })
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { entity, id } => {
                write!(f, "{} '{}' not found", entity, id)
            }
            Self::StatusConflict { service_id, status } => {
                write!(
                    f,
                    "Service '{}' is busy: status '{}' rejects concurrent lifecycle requests",
                    service_id, status
                )
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
            Self::SerializationError { context, details } => {
                write!(f, "Serialization error for '{}': {}", context, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError {
            context: "json".to_string(),
            details: err.to_string(),
        }
    }
}

//! Unified application error model and mapping helpers.
//! This module provides a common error enum used across the request pipeline
//! stages, along with the mapper to the `{"error": ...}` response payload.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppError {
    /// Unknown table/column, missing lookup entry.
    Schema { code: String, message: String },
    /// Malformed formula, missing period column, unknown spatial scale.
    Validation { code: String, message: String },
    /// Empty result after merge, unusable values in source rows.
    Data { code: String, message: String },
    /// Database connection/query failures.
    Io { code: String, message: String },
    Internal { code: String, message: String },
}

impl AppError {
    pub fn code_str(&self) -> &str {
        match self {
            AppError::Schema { code, .. }
            | AppError::Validation { code, .. }
            | AppError::Data { code, .. }
            | AppError::Io { code, .. }
            | AppError::Internal { code, .. } => code.as_str(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AppError::Schema { message, .. }
            | AppError::Validation { message, .. }
            | AppError::Data { message, .. }
            | AppError::Io { message, .. }
            | AppError::Internal { message, .. } => message.as_str(),
        }
    }

    pub fn schema<S: Into<String>>(code: S, msg: S) -> Self { AppError::Schema { code: code.into(), message: msg.into() } }
    pub fn validation<S: Into<String>>(code: S, msg: S) -> Self { AppError::Validation { code: code.into(), message: msg.into() } }
    pub fn data<S: Into<String>>(code: S, msg: S) -> Self { AppError::Data { code: code.into(), message: msg.into() } }
    pub fn io<S: Into<String>>(code: S, msg: S) -> Self { AppError::Io { code: code.into(), message: msg.into() } }
    pub fn internal<S: Into<String>>(code: S, msg: S) -> Self { AppError::Internal { code: code.into(), message: msg.into() } }

    /// Map to the response payload every failing operation returns.
    /// The caller-facing contract is a single human-readable message.
    pub fn payload(&self) -> serde_json::Value {
        serde_json::json!({ "error": self.message() })
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code_str(), self.message())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal { code: "internal_error".into(), message: err.to_string() }
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::Io { code: "sqlite_error".into(), message: err.to_string() }
    }
}

impl From<polars::error::PolarsError> for AppError {
    fn from(err: polars::error::PolarsError) -> Self {
        AppError::Internal { code: "frame_error".into(), message: err.to_string() }
    }
}

//! Core error types for graphtune.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Launch failure details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchErrorInfo {
    /// Experiment name the launch belonged to
    pub experiment: String,
    /// Error message
    pub message: String,
    /// Child exit code, if the process got far enough to have one
    pub exit_code: Option<i32>,
}

impl std::fmt::Display for LaunchErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Launch {} failed: {}", self.experiment, self.message)?;
        if let Some(code) = self.exit_code {
            write!(f, " (exit code: {})", code)?;
        }
        Ok(())
    }
}

/// Unified error enum for all graphtune core errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Invalid input provided
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),

    /// Validation error
    #[error("validation error: {0}")]
    Validation(String),

    /// Trainer launch failed
    #[error("{0}")]
    Launch(LaunchErrorInfo),

    /// Dataset construction or verification failed
    #[error("dataset error: {0}")]
    Dataset(String),

    /// JSON (de)serialization failed
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem operation failed
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        CoreError::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        CoreError::Validation(message.into())
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        CoreError::InvalidInput(message.into())
    }

    /// Create a dataset error.
    pub fn dataset(message: impl Into<String>) -> Self {
        CoreError::Dataset(message.into())
    }

    /// Create a launch error.
    pub fn launch(experiment: &str, message: &str, exit_code: Option<i32>) -> Self {
        CoreError::Launch(LaunchErrorInfo {
            experiment: experiment.to_string(),
            message: message.to_string(),
            exit_code,
        })
    }

    /// Check if this is a launch error.
    pub fn is_launch_error(&self) -> bool {
        matches!(self, CoreError::Launch(_))
    }

    /// Get the child exit code if this is a launch error that has one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            CoreError::Launch(info) => info.exit_code,
            _ => None,
        }
    }
}

/// Result type alias using CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_error_display() {
        let err = CoreError::launch("scene_graph_dapo", "trainer exited", Some(2));
        let msg = format!("{}", err);
        assert!(msg.contains("scene_graph_dapo"));
        assert!(msg.contains("exit code: 2"));
    }

    #[test]
    fn test_launch_error_without_code() {
        let err = CoreError::launch("scene_graph_dapo", "spawn failed", None);
        let msg = format!("{}", err);
        assert!(!msg.contains("exit code"));
        assert_eq!(err.exit_code(), None);
        assert!(err.is_launch_error());
    }

    #[test]
    fn test_exit_code_accessor() {
        let err = CoreError::launch("exp", "boom", Some(137));
        assert_eq!(err.exit_code(), Some(137));

        let err_cfg = CoreError::config("bad toml");
        assert_eq!(err_cfg.exit_code(), None);
        assert!(!err_cfg.is_launch_error());
    }
}

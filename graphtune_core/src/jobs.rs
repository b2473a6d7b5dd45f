//! Launch lifecycle tracking.
//!
//! This module provides the launch status enum and a state machine for
//! recording one trainer invocation's lifecycle events.

use crate::errors::{CoreError, CoreResult, LaunchErrorInfo};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Launch lifecycle status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Check if this is a terminal (final) status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Check if this is a success status.
    pub fn is_success(&self) -> bool {
        *self == JobStatus::Succeeded
    }

    /// Parse a status string (case-insensitive, handles aliases).
    pub fn parse(s: &str) -> Option<Self> {
        let normalized = s.trim().to_lowercase().replace(' ', "_");
        match normalized.as_str() {
            "pending" | "queued" => Some(JobStatus::Pending),
            "running" | "in_progress" => Some(JobStatus::Running),
            "succeeded" | "success" | "completed" | "complete" => Some(JobStatus::Succeeded),
            "failed" | "failure" | "error" => Some(JobStatus::Failed),
            "cancelled" | "canceled" | "cancel" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    /// Convert to string.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Default for JobStatus {
    fn default() -> Self {
        JobStatus::Pending
    }
}

/// Launch event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LaunchEventType {
    #[serde(rename = "launch.started")]
    Started,
    #[serde(rename = "launch.completed")]
    Completed,
    #[serde(rename = "launch.failed")]
    Failed,
    #[serde(rename = "launch.cancelled")]
    Cancelled,
}

impl LaunchEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LaunchEventType::Started => "launch.started",
            LaunchEventType::Completed => "launch.completed",
            LaunchEventType::Failed => "launch.failed",
            LaunchEventType::Cancelled => "launch.cancelled",
        }
    }
}

/// A launch lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchEvent {
    /// Event type (e.g., "launch.started")
    #[serde(rename = "type")]
    pub event_type: String,
    /// Experiment name this event belongs to
    pub experiment: String,
    /// Sequence number (1-indexed)
    pub seq: i64,
    /// Unix timestamp (seconds since epoch)
    pub timestamp: f64,
    /// Optional event data payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Optional human-readable message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Launch lifecycle state machine.
///
/// Tracks status transitions for one trainer invocation and records
/// sequenced events. The launcher drives one lifecycle per launch.
#[derive(Debug, Clone)]
pub struct LaunchLifecycle {
    experiment: String,
    status: JobStatus,
    events: Vec<LaunchEvent>,
    started_at: Option<f64>,
    ended_at: Option<f64>,
}

impl LaunchLifecycle {
    /// Create a new lifecycle tracker.
    pub fn new(experiment: &str) -> Self {
        Self {
            experiment: experiment.to_string(),
            status: JobStatus::Pending,
            events: Vec::new(),
            started_at: None,
            ended_at: None,
        }
    }

    /// Get the current status.
    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Get the experiment name.
    pub fn experiment(&self) -> &str {
        &self.experiment
    }

    /// Get elapsed time in seconds, if the launch has started.
    pub fn elapsed_seconds(&self) -> Option<f64> {
        let start = self.started_at?;
        let end = self.ended_at.unwrap_or_else(now_timestamp);
        Some(end - start)
    }

    /// Get the history of events.
    pub fn events(&self) -> &[LaunchEvent] {
        &self.events
    }

    fn emit(
        &mut self,
        event_type: LaunchEventType,
        data: Option<Value>,
        message: Option<&str>,
    ) -> LaunchEvent {
        let event = LaunchEvent {
            event_type: event_type.as_str().to_string(),
            experiment: self.experiment.clone(),
            seq: (self.events.len() + 1) as i64,
            timestamp: now_timestamp(),
            data,
            message: message.map(String::from),
        };
        self.events.push(event.clone());
        event
    }

    fn invalid_transition(&self, action: &str) -> CoreError {
        CoreError::Launch(LaunchErrorInfo {
            experiment: self.experiment.clone(),
            message: format!("cannot {} launch in {} status", action, self.status),
            exit_code: None,
        })
    }

    /// Start the launch (transition from Pending to Running).
    ///
    /// Returns the launch.started event.
    pub fn start(&mut self, data: Option<Value>) -> CoreResult<LaunchEvent> {
        if self.status != JobStatus::Pending {
            return Err(self.invalid_transition("start"));
        }

        self.status = JobStatus::Running;
        self.started_at = Some(now_timestamp());

        Ok(self.emit(LaunchEventType::Started, data, Some("Trainer started")))
    }

    /// Complete the launch successfully (transition from Running to Succeeded).
    ///
    /// Returns the launch.completed event.
    pub fn complete(&mut self, data: Option<Value>) -> CoreResult<LaunchEvent> {
        if self.status != JobStatus::Running {
            return Err(self.invalid_transition("complete"));
        }

        self.status = JobStatus::Succeeded;
        self.ended_at = Some(now_timestamp());

        let mut event_data = data.unwrap_or_else(|| Value::Object(Default::default()));
        if let Value::Object(ref mut map) = event_data {
            if let Some(elapsed) = self.elapsed_seconds() {
                map.insert("elapsed_seconds".to_string(), Value::from(elapsed));
            }
        }

        Ok(self.emit(
            LaunchEventType::Completed,
            Some(event_data),
            Some("Trainer exited cleanly"),
        ))
    }

    /// Fail the launch (transition from Running or Pending to Failed).
    ///
    /// Returns the launch.failed event.
    pub fn fail(&mut self, error: Option<&str>, exit_code: Option<i32>) -> CoreResult<LaunchEvent> {
        if self.status != JobStatus::Running && self.status != JobStatus::Pending {
            return Err(self.invalid_transition("fail"));
        }

        self.status = JobStatus::Failed;
        self.ended_at = Some(now_timestamp());

        let mut event_data = Value::Object(Default::default());
        if let Value::Object(ref mut map) = event_data {
            if let Some(err) = error {
                map.insert("error".to_string(), Value::String(err.to_string()));
            }
            if let Some(code) = exit_code {
                map.insert("exit_code".to_string(), Value::from(code));
            }
            if let Some(elapsed) = self.elapsed_seconds() {
                map.insert("elapsed_seconds".to_string(), Value::from(elapsed));
            }
        }

        Ok(self.emit(
            LaunchEventType::Failed,
            Some(event_data),
            Some(error.unwrap_or("Trainer failed")),
        ))
    }

    /// Cancel the launch (transition to Cancelled from any non-terminal state).
    ///
    /// Returns the launch.cancelled event.
    pub fn cancel(&mut self) -> CoreResult<LaunchEvent> {
        if self.status.is_terminal() {
            return Err(self.invalid_transition("cancel"));
        }

        self.status = JobStatus::Cancelled;
        self.ended_at = Some(now_timestamp());

        let mut event_data = Value::Object(Default::default());
        if let Value::Object(ref mut map) = event_data {
            if let Some(elapsed) = self.elapsed_seconds() {
                map.insert("elapsed_seconds".to_string(), Value::from(elapsed));
            }
        }

        Ok(self.emit(
            LaunchEventType::Cancelled,
            Some(event_data),
            Some("Launch cancelled"),
        ))
    }
}

/// Get current Unix timestamp in seconds.
fn now_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse() {
        assert_eq!(JobStatus::parse("pending"), Some(JobStatus::Pending));
        assert_eq!(JobStatus::parse("RUNNING"), Some(JobStatus::Running));
        assert_eq!(JobStatus::parse("in_progress"), Some(JobStatus::Running));
        assert_eq!(JobStatus::parse("success"), Some(JobStatus::Succeeded));
        assert_eq!(JobStatus::parse("completed"), Some(JobStatus::Succeeded));
        assert_eq!(JobStatus::parse("failed"), Some(JobStatus::Failed));
        assert_eq!(JobStatus::parse("canceled"), Some(JobStatus::Cancelled));
        assert_eq!(JobStatus::parse("unknown"), None);
    }

    #[test]
    fn test_status_is_terminal() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_lifecycle_happy_path() {
        let mut lifecycle = LaunchLifecycle::new("scene_graph_dapo");
        assert_eq!(lifecycle.status(), JobStatus::Pending);

        let start_event = lifecycle.start(None).unwrap();
        assert_eq!(lifecycle.status(), JobStatus::Running);
        assert_eq!(start_event.event_type, "launch.started");
        assert_eq!(start_event.seq, 1);

        let complete_event = lifecycle.complete(None).unwrap();
        assert_eq!(lifecycle.status(), JobStatus::Succeeded);
        assert_eq!(complete_event.event_type, "launch.completed");
        assert_eq!(complete_event.seq, 2);

        assert!(lifecycle.elapsed_seconds().is_some());
    }

    #[test]
    fn test_lifecycle_fail_records_exit_code() {
        let mut lifecycle = LaunchLifecycle::new("scene_graph_dapo");
        lifecycle.start(None).unwrap();

        let fail_event = lifecycle.fail(Some("trainer exited"), Some(2)).unwrap();
        assert_eq!(lifecycle.status(), JobStatus::Failed);
        assert_eq!(fail_event.event_type, "launch.failed");

        let data = fail_event.data.unwrap();
        assert_eq!(data["exit_code"], 2);
        assert_eq!(data["error"], "trainer exited");
    }

    #[test]
    fn test_lifecycle_fail_before_start() {
        // Spawn failures never reach Running
        let mut lifecycle = LaunchLifecycle::new("scene_graph_dapo");
        let event = lifecycle.fail(Some("spawn failed"), None).unwrap();
        assert_eq!(lifecycle.status(), JobStatus::Failed);
        assert_eq!(event.seq, 1);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut lifecycle = LaunchLifecycle::new("scene_graph_dapo");

        assert!(lifecycle.complete(None).is_err());

        lifecycle.start(None).unwrap();
        assert!(lifecycle.start(None).is_err());

        lifecycle.complete(None).unwrap();
        assert!(lifecycle.fail(None, None).is_err());
        assert!(lifecycle.cancel().is_err());
    }

    #[test]
    fn test_cancel() {
        let mut lifecycle = LaunchLifecycle::new("scene_graph_dapo");
        lifecycle.start(None).unwrap();

        let cancel_event = lifecycle.cancel().unwrap();
        assert_eq!(lifecycle.status(), JobStatus::Cancelled);
        assert_eq!(cancel_event.event_type, "launch.cancelled");
    }
}

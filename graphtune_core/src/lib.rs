//! Graphtune core library.
//!
//! This crate provides the core functionality for the graphtune tooling:
//! - Typed launch configuration and dotted override handling
//! - External trainer invocation and process supervision
//! - Launch lifecycle tracking
//! - Scene-graph reward scoring (batch DAPO-style scorer)
//! - Scene dataset construction and verification

pub mod config;
pub mod dataset;
pub mod errors;
pub mod jobs;
pub mod launch;
pub mod reward;

// Re-export core types at crate root for convenience
pub use config::{LaunchConfig, RewardFunctionRef, RewardKwargs};
pub use errors::{CoreError, CoreResult, LaunchErrorInfo};
pub use jobs::{JobStatus, LaunchEvent, LaunchEventType, LaunchLifecycle};
pub use launch::{LaunchOutcome, TrainerCommand};
pub use reward::{RewardInput, RewardScore, SceneEdge, SceneGraph};

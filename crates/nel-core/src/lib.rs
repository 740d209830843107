//! Shared types for the NeMo evaluator launcher.
//!
//! Everything that more than one crate needs lives here: invocation and job
//! identifiers, the execution state machine, the typed run configuration with
//! its `${VAR}` resolution walk, and the telemetry propagation helpers.

pub mod config;
pub mod envsub;
pub mod error;
pub mod id;
pub mod state;
pub mod telemetry;

pub use config::{
    ApiEndpoint, DeploymentConfig, DeploymentKind, EvaluationConfig, ExecutionConfig,
    ExecutorConfig, ExecutorKind, ExporterConfig, RunConfig, TargetConfig, TaskSpec,
};
pub use envsub::{resolve_env_vars, validate_no_missing};
pub use error::{Error, Result};
pub use id::{Identifier, InvocationId, JobId};
pub use state::ExecutionState;
pub use telemetry::{telemetry_env, TELEMETRY_ENV_VARS};

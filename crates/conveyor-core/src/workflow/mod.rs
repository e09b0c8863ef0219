//! Workflow execution: definition validation, DAG checks, the step-runner
//! contract, artifact staging, completion checks, convergence control,
//! management hooks, branch locking, and the executor itself.

pub mod artifacts;
pub mod branch;
pub mod check;
pub mod convergence;
pub mod dag;
pub mod definition;
pub mod executor;
pub mod management;
pub mod runner;

pub use definition::{validate_definition, WorkflowError};
pub use executor::{ExecutorError, ExecutorOptions, WorkflowExecutor};
pub use runner::{CheckRequest, RunnerError, StepRunner, StepRunRequest};

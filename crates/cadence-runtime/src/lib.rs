//! # Cadence Runtime
//!
//! Multi-step workflow execution.
//!
//! A [`WorkflowDefinition`] is an ordered list of steps. Each step names a
//! registered [`StepHandler`] and a JSON config that may reference earlier
//! outputs through `{{steps.<id>.<path>}}` templates. The
//! [`WorkflowExecutor`] runs steps strictly in order, wrapping every handler
//! call in retry, circuit breaker and deadline, and records a
//! [`WorkflowRun`] after each step.
//!
//! [`WorkflowJobHandler`] plugs the executor into a `cadence-queue` worker
//! pool.

pub mod bridge;
pub mod builtins;
pub mod error;
pub mod executor;
pub mod handler;
pub mod model;
pub mod store;
pub mod template;

pub use bridge::WorkflowJobHandler;
pub use builtins::{EchoHandler, HttpConfig, HttpHandler, SleepConfig, SleepHandler};
pub use error::{classify_status, RuntimeError, StepError};
pub use executor::{ExecutorConfig, RunControl, Uncontrolled, WorkflowExecutor};
pub use handler::{HandlerRegistry, StepContext, StepHandler};
pub use model::{
    RunId, StepDefinition, StepRun, StepStatus, WorkflowDefinition, WorkflowRun, WorkflowStatus,
};
pub use store::{MemoryWorkflowStore, WorkflowStore};
pub use template::{Reference, TemplateError, TemplateScope};

pub mod orchestrator;

pub use orchestrator::{
    WorkflowError, WorkflowOrchestrator, WorkflowParams, WorkflowResult, WorkflowStep,
};

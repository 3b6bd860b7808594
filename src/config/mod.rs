pub mod settings;

pub use settings::{
    Config, ConfigError, ExecutorConfig, RateLimitConfig, SandboxConfig, WorkflowConfig,
};

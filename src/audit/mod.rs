pub mod logger;

pub use logger::{AuditError, AuditLogger, AuditRecord};

pub mod backup;
pub mod editor;

pub use backup::{BackupEntry, BackupError, BackupManager, BackupRef, RestoreOutcome};
pub use editor::{ChangeOp, EditError, EditResult, FileEditor, MAX_FILE_SIZE};

pub mod error;
pub mod paths;
pub mod store;
pub mod types;

pub use error::ConfigError;
pub use store::ConfigStore;
pub use types::{
    ActiveDataPointer, BackupEvent, BackupRecord, MigrationRecord, PersistedConfig,
    RetrySettings, UpdateSettings,
};

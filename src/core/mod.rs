pub mod backup;
pub mod runtime;

pub use backup::{BackupConfig, VolumeBackup};
pub use runtime::DockerRuntime;

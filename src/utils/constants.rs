/// Fixed parameters of the backup sequence

/// Directory under the working directory receiving one subdirectory per
/// mount, mirroring each mount's path inside the container.
pub const BACKUP_DIR: &str = "volcop_backup";

/// Image for the throwaway container that exposes the target's volumes.
pub const HELPER_IMAGE: &str = "alpine";

/// The helper only has to stay alive long enough for the copy step.
pub const HELPER_CMD: &[&str] = &["sleep", "5"];

/// Upper bound on waiting for the helper to exit before cleanup proceeds.
/// Well above the helper's own lifetime.
pub const WAIT_TIMEOUT_SECS: u64 = 30;

/// Volume backup orchestration
///
/// Stops the target container, mounts its volumes into a short-lived helper
/// container, archives each volume to a local tar file, then brings the
/// target back up. The restart is mandatory on every path where the target
/// was stopped, even when an earlier step failed.

use anyhow::Context;
use futures::StreamExt;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::core::runtime::{ContainerRuntime, MountBinding};
use crate::utils::constants::{BACKUP_DIR, HELPER_CMD, HELPER_IMAGE, WAIT_TIMEOUT_SECS};

/// Directory permissions used when the runtime reports no mode for a copied
/// path.
const DEFAULT_DIR_MODE: u32 = 0o755;

/// Fixed parameters of one backup run. Constructor arguments rather than
/// process-wide globals so tests can point the backup root at a tempdir.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Local directory receiving one subdirectory per mount.
    pub backup_root: PathBuf,
    /// Image for the throwaway container exposing the target's volumes.
    pub helper_image: String,
    /// Command keeping the helper alive just long enough for the copy step.
    pub helper_cmd: Vec<String>,
    /// Upper bound on waiting for the helper to exit.
    pub wait_timeout: Duration,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            backup_root: PathBuf::from(BACKUP_DIR),
            helper_image: HELPER_IMAGE.to_string(),
            helper_cmd: HELPER_CMD.iter().map(|s| s.to_string()).collect(),
            wait_timeout: Duration::from_secs(WAIT_TIMEOUT_SECS),
        }
    }
}

/// Abort-level and recovery-triggering failures of a backup run. Per-volume
/// failures are not part of this taxonomy; they are reported as warnings in
/// the [`BackupReport`].
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("inspecting container {id}: {err:#}")]
    Inspect { id: String, err: anyhow::Error },

    #[error("stopping container {id}: {err:#}")]
    StopTarget { id: String, err: anyhow::Error },

    #[error("creating helper container: {err:#}")]
    HelperCreate { err: anyhow::Error },

    #[error("starting helper container {id}: {err:#}")]
    HelperStart { id: String, err: anyhow::Error },

    #[error("waiting for helper container {id}: {err:#}")]
    HelperWait { id: String, err: anyhow::Error },

    /// The most severe outcome: the user's container is left down.
    #[error("restarting container {id} after backup: {err:#}")]
    RestartTarget { id: String, err: anyhow::Error },
}

/// Outcome of a successful run: which archives were written and which
/// per-volume failures were skipped over.
#[derive(Debug, Default)]
pub struct BackupReport {
    pub archived: Vec<PathBuf>,
    pub warnings: Vec<String>,
}

/// Drives the backup of all volumes attached to one target container.
pub struct VolumeBackup<R: ContainerRuntime> {
    runtime: R,
    config: BackupConfig,
}

impl<R: ContainerRuntime> VolumeBackup<R> {
    pub fn new(runtime: R, config: BackupConfig) -> Self {
        Self { runtime, config }
    }

    /// Back up every volume attached to `target` to
    /// `<backup_root>/<mount-destination>/content.tar`.
    ///
    /// The target ends the run in the running state it had at inspection
    /// time. Once the stop call has succeeded, every exit path attempts the
    /// restart before surfacing an error; a restart failure outranks
    /// whatever failed before it.
    pub async fn backup_volumes(&self, target: &str) -> Result<BackupReport, BackupError> {
        let details = self
            .runtime
            .inspect(target)
            .await
            .map_err(|err| BackupError::Inspect {
                id: target.to_string(),
                err,
            })?;

        if details.mounts.is_empty() {
            println!("Container {} has no mounts to back up", target);
        }

        println!("Shutting down container {}", target);
        self.runtime
            .stop(target)
            .await
            .map_err(|err| BackupError::StopTarget {
                id: target.to_string(),
                err,
            })?;

        // Target is stopped from here on: the restart below must run no
        // matter how the copy phase ends.
        let outcome = self.copy_with_target_stopped(&details.mounts).await;
        let restart = self.restore_target(target, details.running).await;

        match restart {
            Ok(()) => outcome,
            Err(restart_err) => {
                if let Err(origin) = &outcome {
                    eprintln!("Backup failed before the restart did: {}", origin);
                }
                Err(restart_err)
            }
        }
    }

    /// Provision the helper, archive the mounts, then stop and remove the
    /// helper. Once the helper exists its stop is attempted on every path,
    /// so the caller never restarts the target before helper teardown.
    async fn copy_with_target_stopped(
        &self,
        mounts: &[MountBinding],
    ) -> Result<BackupReport, BackupError> {
        println!("Starting container for copying volumes");
        let helper = self
            .runtime
            .create(&self.config.helper_image, &self.config.helper_cmd, mounts)
            .await
            .map_err(|err| BackupError::HelperCreate { err })?;

        println!("Created container {}", helper);

        let mut outcome = self.run_helper(&helper, mounts).await;

        println!("Shutting down container {}", helper);
        if let Err(err) = self.runtime.stop(&helper).await {
            let warning = format!("failed to stop helper container {}: {:#}", helper, err);
            eprintln!("{}", warning);
            if let Ok(report) = &mut outcome {
                report.warnings.push(warning);
            }
        }

        if let Err(err) = self.runtime.remove(&helper).await {
            eprintln!("failed to remove helper container {}: {:#}", helper, err);
        }

        outcome
    }

    /// Start the helper, wait for it to exit, forward its output, and
    /// archive each mount. Per-mount failures are isolated to warnings.
    async fn run_helper(
        &self,
        helper: &str,
        mounts: &[MountBinding],
    ) -> Result<BackupReport, BackupError> {
        self.runtime
            .start(helper)
            .await
            .map_err(|err| BackupError::HelperStart {
                id: helper.to_string(),
                err,
            })?;

        let waited = tokio::time::timeout(
            self.config.wait_timeout,
            self.runtime.wait_not_running(helper),
        )
        .await;
        match waited {
            Ok(Ok(_status)) => {}
            Ok(Err(err)) => {
                return Err(BackupError::HelperWait {
                    id: helper.to_string(),
                    err,
                });
            }
            Err(_elapsed) => {
                return Err(BackupError::HelperWait {
                    id: helper.to_string(),
                    err: anyhow::anyhow!(
                        "helper did not exit within {:?}",
                        self.config.wait_timeout
                    ),
                });
            }
        }

        // Diagnostic only; a log read failure must not abort the copy.
        match self.runtime.drain_logs(helper).await {
            Ok(output) if !output.is_empty() => print!("{}", output),
            Ok(_) => {}
            Err(err) => eprintln!("could not read helper logs: {:#}", err),
        }

        println!("Copying mount content to TAR files");
        let mut report = BackupReport::default();
        for mount in mounts {
            match self.archive_mount(helper, mount).await {
                Ok(path) => {
                    println!("Archived {} to {}", mount.destination, path.display());
                    report.archived.push(path);
                }
                Err(err) => {
                    let warning =
                        format!("skipping volume at {}: {:#}", mount.destination, err);
                    eprintln!("{}", warning);
                    report.warnings.push(warning);
                }
            }
        }

        Ok(report)
    }

    /// Copy one mount's tree out of the helper into
    /// `<backup_root>/<destination>/content.tar`, overwriting any previous
    /// archive at that path.
    async fn archive_mount(
        &self,
        helper: &str,
        mount: &MountBinding,
    ) -> anyhow::Result<PathBuf> {
        let (mut tar_stream, mode) = self.runtime.copy_out(helper, &mount.destination).await?;

        let directory = self
            .config
            .backup_root
            .join(mount.destination.trim_start_matches('/'));
        tokio::fs::create_dir_all(&directory)
            .await
            .with_context(|| format!("creating {}", directory.display()))?;
        let permissions = std::fs::Permissions::from_mode(mode.unwrap_or(DEFAULT_DIR_MODE));
        tokio::fs::set_permissions(&directory, permissions)
            .await
            .with_context(|| format!("setting permissions on {}", directory.display()))?;

        let archive_path = directory.join("content.tar");
        let mut archive = tokio::fs::File::create(&archive_path)
            .await
            .with_context(|| format!("creating {}", archive_path.display()))?;

        while let Some(chunk) = tar_stream.next().await {
            let chunk = chunk.context("reading tar stream")?;
            archive
                .write_all(&chunk)
                .await
                .with_context(|| format!("writing {}", archive_path.display()))?;
        }
        archive.flush().await?;

        Ok(archive_path)
    }

    /// Bring the target back to the running state it had before the run.
    /// A target that was already stopped at inspection time is left stopped.
    async fn restore_target(&self, target: &str, was_running: bool) -> Result<(), BackupError> {
        if !was_running {
            println!(
                "Container {} was not running before the backup, leaving it stopped",
                target
            );
            return Ok(());
        }

        println!("Starting container {} back up", target);
        self.runtime
            .start(target)
            .await
            .map_err(|err| BackupError::RestartTarget {
                id: target.to_string(),
                err,
            })
    }
}

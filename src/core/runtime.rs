/// Container runtime integration
///
/// Narrow capability interface over the container runtime, plus the
/// bollard-backed implementation talking to the local Docker daemon.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, DownloadFromContainerOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::models::{HostConfig, Mount, MountPoint, MountPointTypeEnum, MountTypeEnum};
use bollard::Docker;
use bytes::Bytes;
use futures::stream::Stream;
use futures::{StreamExt, TryStreamExt};
use std::pin::Pin;

/// Tar byte stream produced by a copy-out request.
pub type TarStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Kind of a mount binding, as the runtime reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    Volume,
    Bind,
    Tmpfs,
    Npipe,
}

/// A named volume (or other mount) and the path it is mounted at inside a
/// container. Carried verbatim from the target's inspection result into the
/// helper container's mount set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountBinding {
    pub kind: MountKind,
    pub source: String,
    pub destination: String,
}

impl MountBinding {
    fn from_mount_point(point: MountPoint) -> Self {
        let kind = match point.typ {
            Some(MountPointTypeEnum::BIND) => MountKind::Bind,
            Some(MountPointTypeEnum::TMPFS) => MountKind::Tmpfs,
            Some(MountPointTypeEnum::NPIPE) => MountKind::Npipe,
            _ => MountKind::Volume,
        };

        // Named volumes carry the volume name in `name`; bind mounts only have
        // a host path in `source`.
        let source = point
            .name
            .or(point.source)
            .unwrap_or_default();

        Self {
            kind,
            source,
            destination: point.destination.unwrap_or_default(),
        }
    }
}

impl From<MountKind> for MountTypeEnum {
    fn from(kind: MountKind) -> Self {
        match kind {
            MountKind::Volume => MountTypeEnum::VOLUME,
            MountKind::Bind => MountTypeEnum::BIND,
            MountKind::Tmpfs => MountTypeEnum::TMPFS,
            MountKind::Npipe => MountTypeEnum::NPIPE,
        }
    }
}

/// Inspection result for a container: whether it is currently running and
/// which mounts are attached to it.
#[derive(Debug, Clone)]
pub struct ContainerDetails {
    pub running: bool,
    pub mounts: Vec<MountBinding>,
}

/// The runtime operations the backup sequence needs. Kept narrow so the
/// orchestrator can be exercised against a mock without a Docker daemon.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Resolve a container's running state and mount bindings.
    async fn inspect(&self, id: &str) -> Result<ContainerDetails>;

    /// Stop a container. Idempotent if it is already stopped.
    async fn stop(&self, id: &str) -> Result<()>;

    /// Create a container from `image` running `cmd` with the given mount
    /// set, returning its id.
    async fn create(&self, image: &str, cmd: &[String], mounts: &[MountBinding]) -> Result<String>;

    /// Start a created or stopped container.
    async fn start(&self, id: &str) -> Result<()>;

    /// Block until the container leaves the running state; returns its exit
    /// status code.
    async fn wait_not_running(&self, id: &str) -> Result<i64>;

    /// Read the container's combined stdout/stderr output.
    async fn drain_logs(&self, id: &str) -> Result<String>;

    /// Stream the directory tree at `path` inside the container as a tar
    /// archive, with the path's file mode when the runtime reports one.
    async fn copy_out(&self, id: &str, path: &str) -> Result<(TarStream, Option<u32>)>;

    /// Remove a stopped container.
    async fn remove(&self, id: &str) -> Result<()>;
}

/// Production implementation backed by the local Docker daemon.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker daemon. Is Docker running?")?;

        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn inspect(&self, id: &str) -> Result<ContainerDetails> {
        let inspection = self
            .docker
            .inspect_container(id, None)
            .await
            .with_context(|| format!("inspect of container {} failed", id))?;

        let running = inspection
            .state
            .as_ref()
            .and_then(|state| state.running)
            .unwrap_or(false);

        let mounts = inspection
            .mounts
            .unwrap_or_default()
            .into_iter()
            .map(MountBinding::from_mount_point)
            .collect();

        Ok(ContainerDetails { running, mounts })
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.docker.stop_container(id, None).await?;
        Ok(())
    }

    async fn create(&self, image: &str, cmd: &[String], mounts: &[MountBinding]) -> Result<String> {
        let mounts: Vec<Mount> = mounts
            .iter()
            .map(|binding| Mount {
                typ: Some(binding.kind.into()),
                source: Some(binding.source.clone()),
                target: Some(binding.destination.clone()),
                ..Default::default()
            })
            .collect();

        let config = Config {
            image: Some(image.to_string()),
            cmd: Some(cmd.to_vec()),
            host_config: Some(HostConfig {
                mounts: Some(mounts),
                ..Default::default()
            }),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container::<String, String>(None, config)
            .await?;

        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn wait_not_running(&self, id: &str) -> Result<i64> {
        let options = Some(WaitContainerOptions {
            condition: "not-running",
        });

        let mut wait_stream = self.docker.wait_container(id, options);
        match wait_stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            Some(Err(err)) => Err(err.into()),
            // Stream ended without a response: the container is already gone.
            None => Ok(0),
        }
    }

    async fn drain_logs(&self, id: &str) -> Result<String> {
        let options = Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        });

        let mut log_stream = self.docker.logs(id, options);
        let mut combined = String::new();
        while let Some(chunk) = log_stream.next().await {
            combined.push_str(&String::from_utf8_lossy(&chunk?.into_bytes()));
        }

        Ok(combined)
    }

    async fn copy_out(&self, id: &str, path: &str) -> Result<(TarStream, Option<u32>)> {
        let options = Some(DownloadFromContainerOptions {
            path: path.to_string(),
        });

        let tar_stream = self
            .docker
            .download_from_container(id, options)
            .map_err(anyhow::Error::from);

        // bollard does not surface the path-stat header of the download
        // endpoint, so no mode is reported; callers fall back to a default.
        Ok((Box::pin(tar_stream), None))
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.docker
            .remove_container(id, None::<RemoveContainerOptions>)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_volume_binding_uses_volume_name() {
        let point = MountPoint {
            typ: Some(MountPointTypeEnum::VOLUME),
            name: Some("v1".to_string()),
            source: Some("/var/lib/docker/volumes/v1/_data".to_string()),
            destination: Some("/data".to_string()),
            ..Default::default()
        };

        let binding = MountBinding::from_mount_point(point);
        assert_eq!(binding.kind, MountKind::Volume);
        assert_eq!(binding.source, "v1");
        assert_eq!(binding.destination, "/data");
    }

    #[test]
    fn test_bind_mount_binding_uses_host_path() {
        let point = MountPoint {
            typ: Some(MountPointTypeEnum::BIND),
            name: None,
            source: Some("/srv/config".to_string()),
            destination: Some("/etc/app".to_string()),
            ..Default::default()
        };

        let binding = MountBinding::from_mount_point(point);
        assert_eq!(binding.kind, MountKind::Bind);
        assert_eq!(binding.source, "/srv/config");
        assert_eq!(binding.destination, "/etc/app");
    }
}

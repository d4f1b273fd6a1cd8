//! Docker implementation of [`ContainerRuntime`] on top of bollard

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StatsOptions, WaitContainerOptions,
};
use bollard::image::{BuildImageOptions, ListImagesOptions, RemoveImageOptions};
use bollard::models::HostConfig;
use bollard::Docker;
use exec_common::{Error, Result};
use futures_util::stream::{BoxStream, StreamExt};
use tracing::{debug, info};

use crate::monitor::cpu_percent;
use crate::runtime::{ContainerRuntime, ContainerSpec, ImageDetails, ResourceSample};

/// Docker daemon client
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

fn runtime_error(context: &str, e: bollard::errors::Error) -> Error {
    Error::runtime(format!("{}: {}", context, e))
}

fn is_status(e: &bollard::errors::Error, codes: &[u16]) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError { status_code, .. }
            if codes.contains(status_code)
    )
}

impl DockerRuntime {
    /// Connect to the local Docker daemon and verify it answers
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| runtime_error("Failed to connect to Docker", e))?;

        docker
            .ping()
            .await
            .map_err(|e| runtime_error("Docker daemon is not responding", e))?;
        info!("Connected to Docker daemon");

        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn build_image<'a>(&'a self, tag: &str, context: Vec<u8>) -> BoxStream<'a, Result<String>> {
        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: tag.to_string(),
            rm: true,
            forcerm: true,
            ..Default::default()
        };

        self.docker
            .build_image(options, None, Some(context.into()))
            .map(|item| match item {
                Ok(info) => {
                    if let Some(detail) = info.error_detail.and_then(|d| d.message) {
                        return Err(Error::build(detail));
                    }
                    if let Some(error) = info.error {
                        return Err(Error::build(error));
                    }
                    Ok(info.stream.or(info.status).unwrap_or_default())
                }
                Err(e) => Err(Error::build(format!("Build stream failed: {}", e))),
            })
            .boxed()
    }

    async fn inspect_image(&self, image: &str) -> Result<Option<ImageDetails>> {
        match self.docker.inspect_image(image).await {
            Ok(details) => Ok(Some(ImageDetails {
                size_bytes: details.size.unwrap_or(0).max(0) as u64,
            })),
            Err(e) if is_status(&e, &[404]) => Ok(None),
            Err(e) => Err(runtime_error("Failed to inspect image", e)),
        }
    }

    async fn list_images(&self) -> Result<Vec<String>> {
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
            .map_err(|e| runtime_error("Failed to list images", e))?;

        Ok(images
            .into_iter()
            .flat_map(|image| image.repo_tags)
            .collect())
    }

    async fn remove_image(&self, image: &str, force: bool) -> Result<()> {
        let options = RemoveImageOptions {
            force,
            ..Default::default()
        };

        match self.docker.remove_image(image, Some(options), None).await {
            Ok(_) => {
                debug!(image = %image, "Image removed");
                Ok(())
            }
            Err(e) if is_status(&e, &[404]) => Ok(()),
            Err(e) => Err(runtime_error("Failed to remove image", e)),
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let config = Config {
            image: Some(spec.image.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(spec.network_disabled),
            host_config: Some(HostConfig {
                memory: Some(spec.memory_bytes),
                cpu_shares: Some(spec.cpu_shares),
                network_mode: spec.network_disabled.then(|| "none".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| runtime_error("Failed to create container", e))?;

        Ok(container.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| runtime_error("Failed to start container", e))
    }

    fn logs<'a>(&'a self, id: &'a str) -> BoxStream<'a, Result<String>> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        self.docker
            .logs(id, Some(options))
            .map(|item| {
                item.map(|log| log.to_string())
                    .map_err(|e| runtime_error("Log stream failed", e))
            })
            .boxed()
    }

    async fn wait_container(&self, id: &str) -> Result<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut stream = self.docker.wait_container(id, Some(options));
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error carrying the code
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(runtime_error("Failed to wait for container", e)),
            None => Err(Error::runtime("Container wait returned no status")),
        }
    }

    async fn kill_container(&self, id: &str) -> Result<()> {
        match self
            .docker
            .kill_container(id, None::<KillContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            // already stopped or gone
            Err(e) if is_status(&e, &[404, 409]) => Ok(()),
            Err(e) => Err(runtime_error("Failed to kill container", e)),
        }
    }

    async fn stats(&self, id: &str) -> Result<ResourceSample> {
        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };

        let mut stream = self.docker.stats(id, Some(options)).boxed();
        let stats = stream
            .next()
            .await
            .ok_or_else(|| Error::runtime("Stats stream ended"))?
            .map_err(|e| runtime_error("Failed to read container stats", e))?;

        let cpu_delta = stats
            .cpu_stats
            .cpu_usage
            .total_usage
            .saturating_sub(stats.precpu_stats.cpu_usage.total_usage);
        let system_delta = stats
            .cpu_stats
            .system_cpu_usage
            .unwrap_or(0)
            .saturating_sub(stats.precpu_stats.system_cpu_usage.unwrap_or(0));
        let online_cpus = stats.cpu_stats.online_cpus.unwrap_or(1);

        Ok(ResourceSample {
            cpu_percent: cpu_percent(cpu_delta, system_delta, online_cpus),
            memory_bytes: stats.memory_stats.usage.unwrap_or(0),
        })
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => {
                debug!(container_id = %id, "Container removed");
                Ok(())
            }
            Err(e) if is_status(&e, &[404]) => Ok(()),
            Err(e) => Err(runtime_error("Failed to remove container", e)),
        }
    }
}

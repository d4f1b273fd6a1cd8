//! Container runtime abstraction
//!
//! The orchestrator and the base image manager only talk to this trait, so a
//! Docker daemon can be swapped for a scripted runtime in tests.

use async_trait::async_trait;
use exec_common::Result;
use futures_util::stream::BoxStream;
use serde::Serialize;

/// Limits and identity of a one-shot execution container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub memory_bytes: i64,
    pub cpu_shares: i64,
    pub network_disabled: bool,
}

/// What the runtime knows about a built image
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImageDetails {
    pub size_bytes: u64,
}

/// One stats reading for a running container
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Build `tag` from a gzipped tar context. Items are progress lines; an
    /// `Err` item means the build failed.
    fn build_image<'a>(&'a self, tag: &str, context: Vec<u8>) -> BoxStream<'a, Result<String>>;

    /// `None` when the image does not exist
    async fn inspect_image(&self, image: &str) -> Result<Option<ImageDetails>>;

    /// Tags of all local images
    async fn list_images(&self) -> Result<Vec<String>>;

    /// Remove an image; a missing image is not an error
    async fn remove_image(&self, image: &str, force: bool) -> Result<()>;

    /// Create a container and return its id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    /// Follow combined stdout/stderr until the container stops
    fn logs<'a>(&'a self, id: &'a str) -> BoxStream<'a, Result<String>>;

    /// Wait for the container to stop and return its exit code
    async fn wait_container(&self, id: &str) -> Result<i64>;

    async fn kill_container(&self, id: &str) -> Result<()>;

    /// One stats reading. Fails once the container is gone.
    async fn stats(&self, id: &str) -> Result<ResourceSample>;

    /// Force-remove a container; a missing container is not an error
    async fn remove_container(&self, id: &str) -> Result<()>;
}

/// Drive a build stream to the end, logging progress. Returns the build log;
/// the first error item fails the build with the log gathered so far attached.
pub async fn build_to_completion(
    runtime: &dyn ContainerRuntime,
    tag: &str,
    context: Vec<u8>,
) -> Result<String> {
    use futures_util::StreamExt;

    let mut progress = runtime.build_image(tag, context);
    let mut log = String::new();

    while let Some(item) = progress.next().await {
        match item {
            Ok(line) => {
                let trimmed = line.trim_end();
                if !trimmed.is_empty() {
                    tracing::debug!(image = %tag, "{}", trimmed);
                }
                log.push_str(&line);
            }
            Err(e) => {
                tracing::error!(image = %tag, "Image build failed: {}", e);
                return Err(e.with_output(log));
            }
        }
    }

    Ok(log)
}
